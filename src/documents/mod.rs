// Document model and loaders
// Binary format parsing lives outside this crate; loaders here only hand over plain text

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::{RagError, Result};

/// Metadata supplied alongside extracted document text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub filename: Option<String>,
    pub source_path: Option<PathBuf>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Already-extracted plain text plus metadata, as handed to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSource {
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl DocumentSource {
    #[inline]
    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: DocumentMetadata {
                filename: Some(name.into()),
                ..DocumentMetadata::default()
            },
        }
    }

    /// Human-readable identifier of where the text came from
    #[inline]
    pub fn source_id(&self) -> String {
        self.metadata
            .source_path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| self.metadata.filename.clone())
            .unwrap_or_else(|| "untitled".to_string())
    }
}

/// An ingested document; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub content_hash: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Assign an id and hash the content of `source`
    #[inline]
    pub fn from_source(source: &DocumentSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source.source_id(),
            content_hash: content_hash(&source.text),
            metadata: source.metadata.clone(),
        }
    }
}

/// SHA-256 of the text, hex encoded
#[inline]
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Capability-based loader: the registry picks the first loader that supports a path
pub trait DocumentLoader: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, path: &Path) -> bool;
    fn load(&self, path: &Path) -> Result<DocumentSource>;
}

/// UTF-8 text formats that need no extraction
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextLoader;

const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "csv", "json", "log"];

impl DocumentLoader for PlainTextLoader {
    fn name(&self) -> &'static str {
        "plain-text"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                PLAIN_TEXT_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    fn load(&self, path: &Path) -> Result<DocumentSource> {
        let text = fs::read_to_string(path)?;
        let file_meta = fs::metadata(path)?;

        let metadata = DocumentMetadata {
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            source_path: Some(path.to_path_buf()),
            created_at: file_meta.created().ok().map(DateTime::<Utc>::from),
            modified_at: file_meta.modified().ok().map(DateTime::<Utc>::from),
        };

        debug!("Loaded {} ({} bytes)", path.display(), text.len());
        Ok(DocumentSource { text, metadata })
    }
}

/// Ordered set of loaders
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn DocumentLoader>>,
}

impl Default for LoaderRegistry {
    #[inline]
    fn default() -> Self {
        Self {
            loaders: vec![Box::new(PlainTextLoader)],
        }
    }
}

impl LoaderRegistry {
    #[inline]
    pub fn empty() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    #[inline]
    pub fn register(&mut self, loader: Box<dyn DocumentLoader>) {
        self.loaders.push(loader);
    }

    /// First loader that supports `path`
    #[inline]
    pub fn find(&self, path: &Path) -> Option<&dyn DocumentLoader> {
        self.loaders
            .iter()
            .find(|loader| loader.supports(path))
            .map(|loader| loader.as_ref())
    }

    #[inline]
    pub fn load(&self, path: &Path) -> Result<DocumentSource> {
        let loader = self.find(path).ok_or_else(|| {
            RagError::InvalidRequest(format!("No loader supports {}", path.display()))
        })?;
        debug!("Loading {} with {} loader", path.display(), loader.name());
        loader.load(path)
    }
}
