use super::*;
use tempfile::TempDir;

#[test]
fn content_hash_is_stable_sha256() {
    assert_eq!(
        content_hash("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(content_hash("same"), content_hash("same"));
    assert_ne!(content_hash("same"), content_hash("different"));
}

#[test]
fn document_from_source() {
    let source = DocumentSource::from_text("notes.txt", "Some notes");
    let first = Document::from_source(&source);
    let second = Document::from_source(&source);

    assert_eq!(first.source_id, "notes.txt");
    assert_eq!(first.content_hash, content_hash("Some notes"));
    assert_eq!(first.content_hash, second.content_hash);
    assert_ne!(first.id, second.id);
}

#[test]
fn source_id_prefers_path() {
    let source = DocumentSource {
        text: String::new(),
        metadata: DocumentMetadata {
            filename: Some("a.txt".to_string()),
            source_path: Some(PathBuf::from("/docs/a.txt")),
            ..DocumentMetadata::default()
        },
    };
    assert_eq!(source.source_id(), "/docs/a.txt");

    let anonymous = DocumentSource {
        text: String::new(),
        metadata: DocumentMetadata::default(),
    };
    assert_eq!(anonymous.source_id(), "untitled");
}

#[test]
fn plain_text_loader_support() {
    let loader = PlainTextLoader;
    assert!(loader.supports(Path::new("readme.md")));
    assert!(loader.supports(Path::new("NOTES.TXT")));
    assert!(!loader.supports(Path::new("report.pdf")));
    assert!(!loader.supports(Path::new("no_extension")));
}

#[test]
fn registry_loads_supported_file() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let path = temp_dir.path().join("guide.md");
    std::fs::write(&path, "# Guide\n\nHello").expect("should write file");

    let registry = LoaderRegistry::default();
    let source = registry.load(&path).expect("markdown should load");

    assert_eq!(source.text, "# Guide\n\nHello");
    assert_eq!(source.metadata.filename.as_deref(), Some("guide.md"));
    assert_eq!(source.metadata.source_path.as_deref(), Some(path.as_path()));
    assert!(source.metadata.modified_at.is_some());
}

#[test]
fn registry_rejects_unsupported_file() {
    let registry = LoaderRegistry::default();
    let result = registry.load(Path::new("slides.pptx"));
    assert!(matches!(result, Err(RagError::InvalidRequest(_))));

    let empty = LoaderRegistry::empty();
    assert!(empty.find(Path::new("a.txt")).is_none());
}
