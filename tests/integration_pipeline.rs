#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end tests against mock embedding and chat-completion services
// Run with: cargo test --test integration_pipeline

use convo_rag::RagError;
use convo_rag::config::Config;
use convo_rag::documents::DocumentSource;
use convo_rag::pipeline::{
    AnswerStatus, IngestOutcome, IngestWorker, RetrievalPipeline, SERVICE_UNAVAILABLE_ANSWER,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const TOPICS: [&str; 3] = ["rust", "python", "cooking"];
const ANSWER: &str = "Rust manages memory through ownership [1].";

/// Embeds each input as keyword counts over [`TOPICS`] plus a constant component
struct TopicEmbeddings;

impl Respond for TopicEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<serde_json::Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let data: Vec<serde_json::Value> = body["input"]
            .as_array()
            .map(|inputs| inputs.iter().filter_map(|input| input.as_str()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let lower = text.to_lowercase();
                let mut vector: Vec<f32> = TOPICS
                    .iter()
                    .map(|topic| lower.matches(topic).count() as f32)
                    .collect();
                vector.push(0.05);
                json!({ "embedding": vector, "index": index })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}

async fn healthy_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(TopicEmbeddings)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": ANSWER } }]
        })))
        .mount(&server)
        .await;
    server
}

async fn unavailable_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    server
}

fn test_config(server: &MockServer, dir: &Path) -> Config {
    let base_url = Url::parse(&format!("{}/v1/", server.uri())).expect("mock url should parse");
    let mut config = Config {
        base_dir: dir.to_path_buf(),
        ..Config::default()
    };
    config.embedding.base_url = base_url.clone();
    config.embedding.api_key = Some("test-key".to_string());
    config.embedding.dimension = TOPICS.len() + 1;
    config.embedding.retry_attempts = 1;
    config.embedding.retry_base_delay_ms = 1;
    config.embedding.min_request_interval_ms = 0;
    config.completion.base_url = base_url;
    config.completion.api_key = Some("test-key".to_string());
    config.retrieval.rewrite_queries = false;
    config
}

fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("convo_rag=debug")
        .with_test_writer()
        .try_init()
        .ok(); // Ignore error if already initialized
}

fn open_pipeline(config: &Config) -> Arc<RetrievalPipeline> {
    init_test_tracing();
    Arc::new(RetrievalPipeline::from_config(config).expect("pipeline should open"))
}

async fn blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking task should not panic")
}

async fn ingest(pipeline: &Arc<RetrievalPipeline>, conversation: &str, name: &str, text: &str) -> String {
    let pipeline = Arc::clone(pipeline);
    let conversation = conversation.to_string();
    let source = DocumentSource::from_text(name, text);
    blocking(move || pipeline.ingest(&conversation, &source))
        .await
        .expect("ingest should succeed")
}

#[tokio::test]
async fn answers_cite_only_the_asking_conversation() {
    let server = healthy_server().await;
    let dir = TempDir::new().expect("tempdir");
    let pipeline = open_pipeline(&test_config(&server, dir.path()));

    let rust_doc = ingest(&pipeline, "c1", "rust.md", "Rust ownership and rust lifetimes.").await;
    ingest(&pipeline, "c1", "python.md", "Python reference counting.").await;
    ingest(&pipeline, "c2", "rust-too.md", "Another rust document entirely.").await;

    let asking = Arc::clone(&pipeline);
    let answer = blocking(move || asking.query("c1", "How does rust manage memory?"))
        .await
        .expect("query");

    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.text, ANSWER);
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].document_id, rust_doc);
    assert_eq!(answer.sources[0].source_id, "rust.md");
}

#[tokio::test]
async fn index_survives_restart() {
    let server = healthy_server().await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&server, dir.path());

    let pipeline = open_pipeline(&config);
    let first = ingest(&pipeline, "c1", "a.md", "rust notes").await;
    let second = ingest(&pipeline, "c1", "b.md", "cooking notes").await;
    let asking = Arc::clone(&pipeline);
    let before = blocking(move || asking.query("c1", "rust?")).await.expect("query");
    drop(pipeline);

    let reopened = open_pipeline(&config);
    let documents: Vec<String> = reopened
        .conversation_documents("c1")
        .into_iter()
        .map(|summary| summary.document_id)
        .collect();
    assert_eq!(documents, vec![first, second]);

    let asking = Arc::clone(&reopened);
    let after = blocking(move || asking.query("c1", "rust?")).await.expect("query");
    assert_eq!(after.sources, before.sources);
    assert!(dir.path().join("index").join("conversations.vectors").exists());
    assert!(dir.path().join("index").join("conversations.meta.json").exists());
}

#[tokio::test]
async fn unavailable_embedding_service_skips_documents_and_degrades_answers() {
    let healthy = healthy_server().await;
    let broken = unavailable_server().await;
    let dir = TempDir::new().expect("tempdir");

    let pipeline = open_pipeline(&test_config(&healthy, dir.path()));
    ingest(&pipeline, "c1", "rust.md", "rust").await;
    drop(pipeline);

    let degraded = open_pipeline(&test_config(&broken, dir.path()));
    let ingesting = Arc::clone(&degraded);
    let err = blocking(move || {
        ingesting.ingest("c1", &DocumentSource::from_text("new.md", "more rust"))
    })
    .await
    .expect_err("fallback embeddings must skip the document");

    assert!(matches!(&err, RagError::EmbeddingDegraded(message) if message.contains("document skipped")));
    assert_eq!(degraded.index().conversation_chunk_count("c1"), 1);
    assert_eq!(degraded.conversation_documents("c1").len(), 1);

    let asking = Arc::clone(&degraded);
    let answer = blocking(move || asking.query("c1", "rust?")).await.expect("query");
    assert!(answer.is_degraded());
    assert_eq!(answer.text, SERVICE_UNAVAILABLE_ANSWER);
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn removing_a_conversation_keeps_other_results_identical() {
    let server = healthy_server().await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&server, dir.path());
    let pipeline = open_pipeline(&config);

    for i in 0..5 {
        ingest(&pipeline, "c1", &format!("c1-{i}.md"), &"rust ".repeat(i + 1)).await;
    }
    ingest(&pipeline, "c2", "keep.md", "rust and python").await;

    let asking = Arc::clone(&pipeline);
    let before = blocking(move || asking.query("c2", "rust python")).await.expect("query");

    let removing = Arc::clone(&pipeline);
    let removed = blocking(move || removing.remove_conversation("c1"))
        .await
        .expect("remove");
    assert_eq!(removed, 5);

    let asking = Arc::clone(&pipeline);
    let after = blocking(move || asking.query("c2", "rust python")).await.expect("query");
    assert_eq!(after.sources, before.sources);
    assert_eq!(pipeline.index().stats().rebuild_count, 1);

    drop(pipeline);
    let reopened = open_pipeline(&config);
    assert_eq!(reopened.index().conversation_chunk_count("c1"), 0);
    assert_eq!(reopened.index().conversation_chunk_count("c2"), 1);
}

#[tokio::test]
async fn worker_ingests_in_background() {
    let server = healthy_server().await;
    let dir = TempDir::new().expect("tempdir");
    let pipeline = open_pipeline(&test_config(&server, dir.path()));

    let worker = IngestWorker::spawn(Arc::clone(&pipeline), |_| {}).expect("spawn worker");
    let handles: Vec<_> = ["rust", "python", "cooking"]
        .iter()
        .map(|topic| {
            worker
                .submit(
                    "c1",
                    DocumentSource::from_text(format!("{topic}.md"), format!("all about {topic}")),
                )
                .expect("submit")
        })
        .collect();

    for handle in handles {
        assert!(matches!(handle.outcome().await, IngestOutcome::Indexed { chunks: 1, .. }));
    }
    blocking(move || worker.shutdown()).await;

    assert_eq!(pipeline.index().conversation_chunk_count("c1"), 3);
}
