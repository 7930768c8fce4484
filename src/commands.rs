use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::documents::LoaderRegistry;
use crate::embeddings::EmbeddingClient;
use crate::index::ConversationVectorIndex;
use crate::pipeline::{AnswerStatus, IngestEvent, IngestOutcome, IngestWorker, RetrievalPipeline};

/// Print the effective configuration
#[inline]
pub fn show_config(config: &Config) -> Result<()> {
    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Embedding Service:").bold().yellow());
    eprintln!("  Endpoint: {}", style(config.embedding.embeddings_url()?).cyan());
    eprintln!("  Model: {}", style(&config.embedding.model).cyan());
    eprintln!("  Batch Size: {}", style(config.embedding.batch_size).cyan());
    eprintln!("  API Key: {}", key_status(config.embedding.api_key.as_deref()));

    eprintln!();
    eprintln!("{}", style("Completion Service:").bold().yellow());
    eprintln!(
        "  Endpoint: {}",
        style(config.completion.chat_completions_url()?).cyan()
    );
    eprintln!("  Model: {}", style(&config.completion.model).cyan());
    eprintln!("  API Key: {}", key_status(config.completion.api_key.as_deref()));

    eprintln!();
    eprintln!("{}", style("Retrieval:").bold().yellow());
    eprintln!(
        "  Chunking: {:?}, {} / {} overlap",
        config.chunking.strategy, config.chunking.chunk_size, config.chunking.overlap
    );
    eprintln!("  Top K: {}", style(config.retrieval.top_k).cyan());
    eprintln!(
        "  Context: {} chars, {:?} policy",
        config.retrieval.context.max_context_length, config.retrieval.context.overlap_policy
    );

    eprintln!();
    eprintln!("Config file: {}", style(config.config_file_path().display()).dim());
    eprintln!("Index directory: {}", style(config.index_dir().display()).dim());

    Ok(())
}

fn key_status(key: Option<&str>) -> console::StyledObject<&'static str> {
    match key {
        Some(_) => style("set").green(),
        None => style("not set").yellow(),
    }
}

/// Write the current configuration (defaults when none exists) to disk
#[inline]
pub fn write_config(config: &Config) -> Result<()> {
    config.save().context("Failed to save configuration")?;
    eprintln!("{}", style("✓ Configuration saved").green());
    eprintln!(
        "Edit {} to point at your embedding and completion services.",
        style(config.config_file_path().display()).cyan()
    );
    Ok(())
}

/// Ingest files into a conversation through the background worker
#[inline]
pub fn ingest_files(config: &Config, conversation_id: &str, paths: &[PathBuf]) -> Result<()> {
    let registry = LoaderRegistry::default();
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        let source = registry
            .load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        sources.push(source);
    }

    let pipeline = Arc::new(RetrievalPipeline::from_config(config)?);

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(sources.len() as u64).with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
                .context("Invalid progress template")?,
        )
    } else {
        ProgressBar::hidden()
    };

    let events_bar = bar.clone();
    let worker = IngestWorker::spawn(Arc::clone(&pipeline), move |event| match event {
        IngestEvent::Queued { source_id, .. } => {
            events_bar.set_message(format!("Processing {source_id}"));
        }
        IngestEvent::Chunked { chunks, .. } => {
            events_bar.set_message(format!("Embedding {chunks} chunks"));
        }
        IngestEvent::Embedded { vectors, .. } => {
            events_bar.set_message(format!("Indexing {vectors} vectors"));
        }
        IngestEvent::Indexed { .. } | IngestEvent::Skipped { .. } | IngestEvent::Failed { .. } => {
            events_bar.inc(1);
        }
    })?;

    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        let source_id = source.source_id();
        handles.push((source_id, worker.submit(conversation_id, source)?));
    }

    let mut failures = 0;
    for (source_id, handle) in handles {
        match handle.wait() {
            IngestOutcome::Indexed {
                document_id,
                chunks,
            } => {
                bar.println(format!(
                    "{} {} ({} chunks, id {})",
                    style("✓").green(),
                    source_id,
                    chunks,
                    style(document_id).dim()
                ));
            }
            IngestOutcome::Skipped { reason } => {
                failures += 1;
                bar.println(format!("{} {}: {}", style("⚠").yellow(), source_id, reason));
            }
            IngestOutcome::Failed { error } => {
                failures += 1;
                bar.println(format!("{} {}: {}", style("✗").red(), source_id, error));
            }
        }
    }
    worker.shutdown();
    bar.finish_and_clear();

    info!(
        "Ingested {} of {} files into {}",
        paths.len() - failures,
        paths.len(),
        conversation_id
    );
    if failures > 0 {
        bail!("{} of {} files were not indexed", failures, paths.len());
    }
    Ok(())
}

/// Ask a question against one conversation's documents
#[inline]
pub fn ask(config: &Config, conversation_id: &str, question: &str) -> Result<()> {
    let pipeline = RetrievalPipeline::from_config(config)?;
    let answer = pipeline.query(conversation_id, question)?;

    match &answer.status {
        AnswerStatus::Answered => {}
        AnswerStatus::NoRelevantContext => {
            eprintln!("{}", style("No relevant context found").yellow());
        }
        AnswerStatus::Degraded(reason) => {
            warn!("Degraded answer: {}", reason);
            eprintln!("{} {}", style("⚠ Degraded:").yellow(), reason);
        }
    }
    if let Some(search_query) = &answer.search_query {
        eprintln!("Searched for: {}", style(search_query).dim());
    }

    println!("{}", answer);

    if !answer.sources.is_empty() {
        println!();
        println!("{}", style("Sources:").bold());
        for (rank, citation) in answer.sources.iter().enumerate() {
            println!(
                "  [{}] {} (chunk {}, relevance {:.2})",
                rank + 1,
                citation.source_id,
                citation.chunk_index,
                citation.score
            );
        }
    }

    Ok(())
}

/// Delete a conversation's documents and vectors
#[inline]
pub fn remove_conversation(config: &Config, conversation_id: &str) -> Result<()> {
    let pipeline = RetrievalPipeline::from_config(config)?;
    let removed = pipeline.remove_conversation(conversation_id)?;

    if removed == 0 {
        println!("Conversation {} has no indexed documents.", conversation_id);
    } else {
        println!(
            "{} Removed {} chunks from conversation {}",
            style("✓").green(),
            removed,
            conversation_id
        );
    }
    Ok(())
}

/// List documents attached to a conversation
#[inline]
pub fn list_documents(config: &Config, conversation_id: &str) -> Result<()> {
    let index = open_index(config);
    let summaries = index.document_summaries(conversation_id);

    if summaries.is_empty() {
        println!("No documents in conversation {}.", conversation_id);
        println!("Use 'convo-rag ingest {} <path>' to add one.", conversation_id);
        return Ok(());
    }

    println!(
        "Documents in {} ({} total):",
        style(conversation_id).bold(),
        summaries.len()
    );
    println!();
    for summary in &summaries {
        println!("📄 {} (ID: {})", summary.source_id, summary.document_id);
        println!("   Chunks: {}", summary.chunk_count);
        println!("   SHA-256: {}", style(&summary.content_hash).dim());
        println!(
            "   Indexed: {}",
            summary.indexed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Show index statistics and service health
#[inline]
pub fn show_status(config: &Config) -> Result<()> {
    println!("📊 convo-rag Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🤖 Embedding Service:");
    match EmbeddingClient::new(&config.embedding) {
        Ok(client) => match client.health_check() {
            Ok(dimension) => {
                println!("   ✅ Reachable ({})", config.embedding.base_url);
                println!("   📋 Model: {}", client.model());
                println!("   🔢 Dimension: {}", dimension);
            }
            Err(e) => println!("   ⚠️  Unhealthy: {}", e),
        },
        Err(e) => println!("   ❌ Failed to create client: {}", e),
    }

    println!();
    println!("🔍 Vector Index:");
    let index = open_index(config);
    let stats = index.stats();
    println!("   📊 Vectors: {}", stats.total_vectors);
    println!("   📚 Documents: {}", stats.total_documents);
    println!("   💬 Conversations: {}", stats.conversation_count);
    match stats.dimension {
        Some(dimension) => println!("   🔢 Dimension: {}", dimension),
        None => println!("   🔢 Dimension: not yet fixed"),
    }
    println!("   🔄 Rebuilds: {}", stats.rebuild_count);
    if let Some(updated) = stats.last_updated {
        println!("   ⏱️  Last Updated: {}", updated.format("%Y-%m-%d %H:%M:%S"));
    }

    let conversations = index.conversations();
    if !conversations.is_empty() {
        println!();
        println!("💬 Conversations:");
        for (conversation_id, chunks) in conversations {
            println!("   {} ({} chunks)", conversation_id, chunks);
        }
    }

    Ok(())
}

fn open_index(config: &Config) -> ConversationVectorIndex {
    ConversationVectorIndex::open(&config.index_dir(), &config.index.file_stem)
}

/// Expand directories one level into the files a loader supports
#[inline]
pub fn collect_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let registry = LoaderRegistry::default();
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("Failed to read directory {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.is_file() && registry.find(path).is_some())
                .collect();
            entries.sort();
            paths.extend(entries);
        } else if is_existing_file(input) {
            paths.push(input.clone());
        } else {
            bail!("No such file: {}", input.display());
        }
    }
    Ok(paths)
}

fn is_existing_file(path: &Path) -> bool {
    path.metadata().is_ok_and(|meta| meta.is_file())
}
