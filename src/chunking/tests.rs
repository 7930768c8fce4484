use super::estimate_token_count as estimate_token_count_impl;
use super::*;

const ARTICLE: &str = "Retrieval systems split documents into chunks. Each chunk is embedded separately.\n\n\
The embeddings are stored in an index. Queries are embedded with the same model! \
Then the nearest chunks are returned.\n\n\
Chunk boundaries matter. A chunk cut mid-sentence loses meaning? Boundary-aware \
splitting prefers paragraphs, then sentences, then words.";

fn assert_covers(chunks: &[Chunk], text: &str) {
    let len = text.chars().count();
    assert!(!chunks.is_empty(), "non-blank text must produce chunks");
    assert_eq!(chunks[0].char_start, 0, "first chunk must start at 0");
    assert_eq!(
        chunks.last().map(|c| c.char_end),
        Some(len),
        "last chunk must reach the end of the text"
    );
    for pair in chunks.windows(2) {
        assert!(
            pair[1].char_start <= pair[0].char_end,
            "gap between chunk {} and {}",
            pair[0].chunk_index,
            pair[1].chunk_index
        );
        assert!(pair[1].char_start >= pair[0].char_start, "starts must not decrease");
    }
}

fn assert_dense_indices(chunks: &[Chunk]) {
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert!(!chunk.content.trim().is_empty());
    }
}

#[test]
fn estimate_token_count() {
    assert_eq!(estimate_token_count_impl("hello world"), 2);
    assert_eq!(estimate_token_count_impl("This is a test."), 5);
    assert_eq!(estimate_token_count_impl(""), 0);
}

#[test]
fn small_text_is_single_chunk() {
    let chunks = split_characters("doc", "  A short note.  ", 100, 20);

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].content, "A short note.");
    assert_eq!(chunks[0].char_start, 0);
    assert_eq!(chunks[0].char_end, 17);
    assert_eq!(chunks[0].document_id, "doc");
}

#[test]
fn blank_text_produces_no_chunks() {
    assert!(split_characters("doc", "", 100, 10).is_empty());
    assert!(split_characters("doc", "   \n\n \t", 100, 10).is_empty());
    assert!(
        split_tokens("doc", "   ", &WordTokenizer, 10, 2)
            .expect("split should succeed")
            .is_empty()
    );
}

#[test]
fn character_chunks_cover_text() {
    for (size, overlap) in [(40, 0), (40, 10), (64, 20), (100, 30), (17, 16)] {
        let chunks = split_characters("doc", ARTICLE, size, overlap);
        assert!(chunks.len() > 1, "size {size} should split the article");
        assert_covers(&chunks, ARTICLE);
        assert_dense_indices(&chunks);
        for chunk in &chunks {
            assert!(chunk.content.chars().count() <= size);
        }
    }
}

#[test]
fn character_chunks_overlap() {
    let chunks = split_characters("doc", ARTICLE, 80, 20);

    let overlapping = chunks
        .windows(2)
        .filter(|pair| pair[1].char_start < pair[0].char_end)
        .count();
    assert!(overlapping > 0, "adjacent chunks should share text");

    for pair in chunks.windows(2) {
        let shared = pair[0].char_end.saturating_sub(pair[1].char_start);
        assert!(shared <= 20, "overlap {shared} exceeds the configured 20");
    }
}

#[test]
fn large_overlap_survives_early_paragraph_breaks() {
    let text = format!("{}\n\n", "word ".repeat(11)).repeat(6);
    let chunks = split_characters("doc", &text, 100, 60);

    assert_covers(&chunks, &text);
    assert!(chunks.len() > 1);
    for pair in chunks.windows(2) {
        let shared = pair[0].char_end.saturating_sub(pair[1].char_start);
        assert!(
            (30..=60).contains(&shared),
            "chunks {} and {} share {shared} chars, expected close to 60",
            pair[0].chunk_index,
            pair[1].chunk_index
        );
    }
}

#[test]
fn prefers_sentence_boundaries() {
    let text = "First sentence is here. Second sentence follows it and keeps going for a while";
    let chunks = split_characters("doc", text, 40, 0);

    assert_eq!(chunks[0].content, "First sentence is here.");
}

#[test]
fn prefers_paragraph_boundaries() {
    let text = "Para one has words. More words.\n\nPara two starts here and continues on";
    let chunks = split_characters("doc", text, 45, 0);

    assert_eq!(chunks[0].content, "Para one has words. More words.");
    assert!(chunks[1].content.starts_with("Para two"));
}

#[test]
fn unbroken_text_hard_splits() {
    let text = "x".repeat(250);
    let chunks = split_characters("doc", &text, 100, 0);

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].char_end, 100);
    assert_eq!(chunks[2].content.len(), 50);
    assert_covers(&chunks, &text);
}

#[test]
fn multibyte_text_uses_character_offsets() {
    let text = "Ünïcödé wörds äré fïné. ".repeat(20);
    let chunks = split_characters("doc", &text, 50, 10);

    assert_covers(&chunks, &text);
    assert_dense_indices(&chunks);
}

#[test]
fn splitting_is_deterministic() {
    let first = split_characters("doc", ARTICLE, 60, 15);
    let second = split_characters("doc", ARTICLE, 60, 15);
    assert_eq!(first, second);

    let first = split_tokens("doc", ARTICLE, &WordTokenizer, 12, 3).expect("split");
    let second = split_tokens("doc", ARTICLE, &WordTokenizer, 12, 3).expect("split");
    assert_eq!(first, second);
}

#[test]
fn leading_blank_window_folds_into_first_chunk() {
    let text = format!("{}Content after a long run of blanks.", " ".repeat(60));
    let chunks = split_characters("doc", &text, 30, 0);

    assert_covers(&chunks, &text);
    assert_eq!(chunks[0].chunk_index, 0);
    assert!(chunks[0].content.starts_with("Content"));
}

#[test]
fn token_chunks_count_tokens() {
    let chunks = split_tokens("doc", ARTICLE, &WordTokenizer, 10, 2).expect("split");
    let total = WordTokenizer.count_tokens(ARTICLE).expect("count");

    assert!(chunks.len() > 1);
    assert_covers(&chunks, ARTICLE);
    assert_dense_indices(&chunks);

    for chunk in &chunks {
        let count = chunk.token_count.expect("token strategy records counts");
        assert!(count <= 10);
        assert_eq!(
            WordTokenizer.count_tokens(&chunk.content).expect("count"),
            count
        );
    }

    // Windows advance by chunk_size - overlap tokens
    let expected = (total - 10).div_ceil(8) + 1;
    assert_eq!(chunks.len(), expected);
}

#[test]
fn token_chunks_share_overlap_tokens() {
    let text = "one two three four five six seven eight nine ten";
    let chunks = split_tokens("doc", text, &WordTokenizer, 4, 1).expect("split");

    let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "one two three four",
            "four five six seven",
            "seven eight nine ten"
        ]
    );
}

#[test]
fn chunker_dispatches_on_strategy() {
    let config = ChunkingConfig {
        strategy: ChunkingStrategy::Tokens,
        chunk_size: 4,
        overlap: 0,
        tokenizer_path: None,
    };
    let chunker = Chunker::new(config).expect("word tokenizer needs no file");
    let chunks = chunker
        .split("doc-1", "alpha beta gamma delta epsilon")
        .expect("split should succeed");

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].content, "epsilon");
    assert!(chunks.iter().all(|c| c.document_id == "doc-1"));

    let chunker = Chunker::new(ChunkingConfig::default()).expect("default chunker");
    let chunks = chunker.split("doc-2", ARTICLE).expect("split should succeed");
    assert_eq!(chunks.len(), 1);
}

#[test]
fn chunker_reports_missing_tokenizer_file() {
    let config = ChunkingConfig {
        strategy: ChunkingStrategy::Tokens,
        tokenizer_path: Some("/nonexistent/tokenizer.json".into()),
        ..ChunkingConfig::default()
    };

    assert!(Chunker::new(config).is_err());
}

#[test]
fn strategy_serializes_lowercase() {
    let config = ChunkingConfig {
        strategy: ChunkingStrategy::Tokens,
        ..ChunkingConfig::default()
    };
    let toml_str = toml::to_string(&config).expect("should serialize");
    assert!(toml_str.contains("strategy = \"tokens\""));

    let parsed: ChunkingConfig = toml::from_str(&toml_str).expect("should parse");
    assert_eq!(parsed, config);
}
