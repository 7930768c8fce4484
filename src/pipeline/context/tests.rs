use super::*;
use crate::index::{RecordMetadata, VectorRecord};
use chrono::Utc;

fn hit(source: &str, content: &str, score: f32) -> SearchHit {
    SearchHit {
        record: VectorRecord {
            chunk_id: format!("{source}:0"),
            content: content.to_string(),
            conversation_id: "c1".to_string(),
            document_id: source.to_string(),
            slot_index: 0,
            metadata: RecordMetadata {
                source_id: source.to_string(),
                filename: None,
                content_hash: String::new(),
                chunk_index: 0,
                char_start: 0,
                char_end: content.len(),
                token_count: None,
                indexed_at: Utc::now(),
            },
        },
        score,
    }
}

/// Three equally sized hits and the length of one formatted entry
fn three_hits() -> (Vec<SearchHit>, usize) {
    let hits = vec![
        hit("doc-a", &"a".repeat(100), 0.9),
        hit("doc-b", &"b".repeat(100), 0.8),
        hit("doc-c", &"c".repeat(100), 0.7),
    ];
    let entry_len = format_entry(1, &hits[0]).chars().count();
    (hits, entry_len)
}

fn config(max_context_length: usize, overlap_policy: OverlapPolicy) -> ContextConfig {
    ContextConfig {
        max_context_length,
        overlap_policy,
        ..ContextConfig::default()
    }
}

fn source_ids(context: &AssembledContext) -> Vec<&str> {
    context
        .sources
        .iter()
        .map(|hit| hit.record.metadata.source_id.as_str())
        .collect()
}

#[test]
fn everything_fits_within_budget() {
    let (hits, _) = three_hits();
    let context = assemble_context(&hits, &config(4000, OverlapPolicy::Merge));

    assert_eq!(source_ids(&context), vec!["doc-a", "doc-b", "doc-c"]);
    assert!(context.text.starts_with("[1] (Source: doc-a, relevance: 0.90)\n"));
    assert_eq!(context.text.matches(ENTRY_SEPARATOR).count(), 2);
}

#[test]
fn empty_input_gives_empty_context() {
    let context = assemble_context(&[], &ContextConfig::default());
    assert!(context.is_empty());
    assert!(context.text.is_empty());
}

#[test]
fn stop_policy_stops_at_first_overflow() {
    let (mut hits, entry_len) = three_hits();
    hits.push(hit("doc-d", "tiny", 0.6));
    let small_len = format_entry(4, &hits[3]).chars().count();
    // Room for two entries plus the small one, but not the third
    let max = 2 * entry_len + 2 + small_len + 2;

    let context = assemble_context(&hits, &config(max, OverlapPolicy::Stop));

    assert_eq!(source_ids(&context), vec!["doc-a", "doc-b"]);
}

#[test]
fn truncate_policy_cuts_last_entry_then_stops() {
    let (mut hits, entry_len) = three_hits();
    hits.push(hit("doc-d", "tiny", 0.6));
    let max = 2 * entry_len + 2 + 60;

    let context = assemble_context(&hits, &config(max, OverlapPolicy::Truncate));

    assert_eq!(source_ids(&context), vec!["doc-a", "doc-b", "doc-c"]);
    assert_eq!(context.text.chars().count(), max);
    assert!(context.text.ends_with(ELLIPSIS));
}

#[test]
fn truncate_policy_drops_useless_remainders() {
    let (hits, entry_len) = three_hits();
    let max = 2 * entry_len + 2 + 40;

    let context = assemble_context(&hits, &config(max, OverlapPolicy::Truncate));

    assert_eq!(source_ids(&context), vec!["doc-a", "doc-b"]);
    assert!(!context.text.ends_with(ELLIPSIS));
}

#[test]
fn merge_policy_evicts_from_the_front() {
    let (hits, entry_len) = three_hits();
    let max = 2 * entry_len + 2;

    let context = assemble_context(&hits, &config(max, OverlapPolicy::Merge));

    assert_eq!(source_ids(&context), vec!["doc-b", "doc-c"]);
    assert_eq!(context.text.chars().count(), max);
    assert!(context.text.starts_with("[2]"));
}

#[test]
fn merge_policy_keeps_accepting_after_eviction() {
    let (mut hits, entry_len) = three_hits();
    hits.push(hit("doc-d", "tiny", 0.6));
    let max = entry_len + 10;

    let context = assemble_context(&hits, &config(max, OverlapPolicy::Merge));

    // Each full entry evicts its predecessor; the tiny one cannot join doc-c
    assert_eq!(source_ids(&context), vec!["doc-d"]);
    assert!(context.text.chars().count() <= max);
}

#[test]
fn oversized_entries_are_skipped_when_preserving_boundaries() {
    let hits = vec![
        hit("huge", &"x".repeat(500), 0.95),
        hit("small", "short and relevant", 0.5),
    ];

    let context = assemble_context(&hits, &config(200, OverlapPolicy::Merge));

    assert_eq!(source_ids(&context), vec!["small"]);
}

#[test]
fn oversized_entries_are_cut_when_boundaries_are_not_preserved() {
    let hits = vec![hit("huge", &"x".repeat(500), 0.95)];
    let config = ContextConfig {
        preserve_chunk_boundaries: false,
        ..config(200, OverlapPolicy::Stop)
    };

    let context = assemble_context(&hits, &config);

    assert_eq!(source_ids(&context), vec!["huge"]);
    assert_eq!(context.text.chars().count(), 200);
    assert!(context.text.ends_with(ELLIPSIS));
}

#[test]
fn output_never_exceeds_budget() {
    let contents: Vec<String> = [5, 40, 130, 260, 75, 600, 12, 90, 310, 48]
        .iter()
        .enumerate()
        .map(|(i, &len)| "é".repeat(len) + &i.to_string())
        .collect();
    let hits: Vec<SearchHit> = contents
        .iter()
        .enumerate()
        .map(|(i, content)| hit(&format!("source-{i}"), content, 1.0 - i as f32 * 0.05))
        .collect();

    for policy in [OverlapPolicy::Truncate, OverlapPolicy::Merge, OverlapPolicy::Stop] {
        for preserve in [true, false] {
            for max in [1, 10, 60, 100, 180, 333, 700, 2000] {
                let config = ContextConfig {
                    preserve_chunk_boundaries: preserve,
                    ..config(max, policy)
                };
                let context = assemble_context(&hits, &config);
                assert!(
                    context.text.chars().count() <= max,
                    "{policy:?} preserve={preserve} max={max}: {} chars",
                    context.text.chars().count()
                );
            }
        }
    }
}

#[test]
fn truncate_chars_respects_char_boundaries() {
    assert_eq!(truncate_chars("héllo wörld", 8), "héllo...");
    assert_eq!(truncate_chars("short", 10), "short");
    assert_eq!(truncate_chars("abcdef", 2), "ab");
}

#[test]
fn unknown_policy_names_mean_stop() {
    let parse = |policy: &str| {
        toml::from_str::<ContextConfig>(&format!("overlap_policy = \"{policy}\""))
            .expect("config should parse")
            .overlap_policy
    };

    assert_eq!(parse("truncate"), OverlapPolicy::Truncate);
    assert_eq!(parse("merge"), OverlapPolicy::Merge);
    assert_eq!(parse("stop"), OverlapPolicy::Stop);
    assert_eq!(parse("something-else"), OverlapPolicy::Stop);
    assert_eq!(ContextConfig::default().overlap_policy, OverlapPolicy::Merge);
}
