use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pageindex_core::{
    ingest_folder_best_effort, read_raw_file, CancellationToken, HashedNgramEmbedder,
    HierarchicalIndex, HttpCrossEncoder, IntegrityStatus, LexicalOverlapScorer, PipelineConfig,
    PipelineCoordinator, QueryOptions, QueryResult, RelevanceScorer, StageEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pageindex", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot holding the page index.
    #[arg(long, env = "PAGEINDEX_INDEX_PATH", default_value = "pageindex.json")]
    index_path: PathBuf,

    /// Cross-encoder scoring endpoint. Without it a local term-overlap
    /// scorer reranks candidates.
    #[arg(long, env = "PAGEINDEX_RERANKER_URL")]
    reranker_url: Option<String>,

    /// The reranker endpoint returns raw logits instead of probabilities.
    #[arg(long, default_value_t = false)]
    reranker_logits: bool,

    /// Pipeline configuration file (JSON). Missing keys keep their defaults.
    #[arg(long, env = "PAGEINDEX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest PDF, text or markdown files. Folders are walked recursively.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Ask a question and print the answer with page citations.
    Ask {
        #[arg(long)]
        query: String,
        /// Candidates per retrieval source.
        #[arg(long)]
        k: Option<usize>,
        /// Context size cap in estimated tokens.
        #[arg(long)]
        token_budget: Option<usize>,
        /// Fail instead of answering when citation integrity is low.
        #[arg(long, default_value_t = false)]
        strict: bool,
        /// Minimum relevance kept after reranking.
        #[arg(long)]
        rerank_threshold: Option<f64>,
        /// Weight of dense scores when breaking fusion ties.
        #[arg(long)]
        dense_weight: Option<f64>,
        /// Print stage events and retrieval diagnostics.
        #[arg(long, default_value_t = false)]
        explain: bool,
        /// Print the full result as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List indexed documents.
    Documents,
    /// Remove a document and all of its nodes.
    Remove { document_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let index = Arc::new(open_index(&cli.index_path, &config)?);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index = %cli.index_path.display(),
        documents = index.documents().len(),
        "pageindex boot"
    );

    match cli.command {
        Command::Ingest { paths } => {
            let mut ingested = 0usize;
            let mut skipped = 0usize;
            for path in paths {
                if path.is_dir() {
                    let report = ingest_folder_best_effort(&index, &path).await?;
                    ingested += report.ingested.len();
                    skipped += report.skipped_files.len();
                    for file in report.skipped_files {
                        println!("skipped {}: {}", file.path.display(), file.reason);
                    }
                    continue;
                }

                let outcome = match read_raw_file(&path).await {
                    Ok(file) => index.ingest(file).await,
                    Err(error) => Err(error),
                };
                match outcome {
                    Ok(document_id) => {
                        ingested += 1;
                        println!("indexed {} as {document_id}", path.display());
                    }
                    Err(error) => {
                        skipped += 1;
                        warn!(path = %path.display(), %error, "skipped document");
                        println!("skipped {}: {error}", path.display());
                    }
                }
            }

            index
                .save(&cli.index_path)
                .with_context(|| format!("saving index to {}", cli.index_path.display()))?;
            println!(
                "{ingested} document(s) ingested, {skipped} skipped at {}",
                Utc::now().to_rfc3339()
            );
        }
        Command::Ask {
            query,
            k,
            token_budget,
            strict,
            rerank_threshold,
            dense_weight,
            explain,
            json,
        } => {
            let defaults = config.query_defaults();
            let options = QueryOptions {
                k: k.unwrap_or(defaults.k),
                token_budget: token_budget.unwrap_or(defaults.token_budget),
                strict_integrity: strict || defaults.strict_integrity,
                rerank_threshold: rerank_threshold.unwrap_or(defaults.rerank_threshold),
                dense_weight: dense_weight.unwrap_or(defaults.dense_weight),
            };

            let scorer: Arc<dyn RelevanceScorer> = match &cli.reranker_url {
                Some(url) => Arc::new(HttpCrossEncoder::new(url, cli.reranker_logits)?),
                None => Arc::new(LexicalOverlapScorer),
            };
            let (sender, mut events) = mpsc::unbounded_channel::<StageEvent>();
            let coordinator = PipelineCoordinator::over_index(Arc::clone(&index), scorer, config)
                .with_telemetry(sender);

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let result = coordinator
                .query_with_cancel(&query, &options, &cancel)
                .await?;

            if explain {
                while let Ok(event) = events.try_recv() {
                    println!(
                        "stage: {} {:?} at {}",
                        event.stage, event.status, event.timestamp_ms
                    );
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result, explain);
            }
        }
        Command::Documents => {
            let documents = index.documents();
            if documents.is_empty() {
                println!("no documents indexed");
            }
            for document in documents {
                println!(
                    "{} {} status={:?} pages={} nodes={} ingested_at={}",
                    document.id,
                    document.filename,
                    document.status,
                    document.pages.len(),
                    document.node_count(),
                    document.ingested_at.to_rfc3339()
                );
            }
        }
        Command::Remove { document_id } => {
            if index.remove(&document_id).await {
                index
                    .save(&cli.index_path)
                    .with_context(|| format!("saving index to {}", cli.index_path.display()))?;
                println!("removed {document_id}");
            } else {
                anyhow::bail!("no document with id {document_id}");
            }
        }
    }

    Ok(())
}

fn open_index(path: &Path, config: &PipelineConfig) -> anyhow::Result<HierarchicalIndex> {
    let embedder = Arc::new(HashedNgramEmbedder::default());
    let index = if path.exists() {
        HierarchicalIndex::load(path, embedder, config.sectioning.clone())
            .with_context(|| format!("loading index from {}", path.display()))?
    } else {
        HierarchicalIndex::new(embedder, config.sectioning.clone())?
    };
    Ok(index)
}

fn print_result(result: &QueryResult, explain: bool) {
    println!("query: {}", result.query);
    println!("answer:\n{}", result.answer);

    for (position, citation) in result.citations.iter().enumerate() {
        let label = if citation.high_integrity { " VERIFIED" } else { "" };
        println!(
            "[{}] {} page {} nodes={} score={:.4}{label}",
            position + 1,
            citation.filename,
            citation.page_number,
            citation.node_count,
            citation.score
        );
        if !citation.section_title.is_empty() {
            println!("  section: {}", citation.section_title);
        }
        println!("  {}", citation.snippet);
        if !citation.anchor_resolved {
            println!("  anchor unresolved");
        }
    }

    println!("CITATION_INTEGRITY: {:.4}", result.integrity_score);
    if result.integrity_status == IntegrityStatus::Warning {
        println!("WARNING: citation integrity below threshold");
    }

    if explain {
        let telemetry = &result.telemetry;
        println!(
            "explain: dense={} sparse={} fused={} reranked={} packed={} context_tokens={}",
            telemetry.dense_candidates,
            telemetry.sparse_candidates,
            telemetry.fused_candidates,
            telemetry.reranked_candidates,
            telemetry.packed_citations,
            result.context_tokens
        );
        if telemetry.partial_retrieval {
            println!(
                "explain: partial retrieval, {} branch failed",
                telemetry
                    .degraded_branch
                    .map_or("unknown", |branch| branch.as_str())
            );
        }
        if !telemetry.reranked {
            println!("explain: reranker unavailable, fusion order kept");
        }
        for timing in &telemetry.stage_timings {
            println!("explain: stage={} elapsed_ms={}", timing.stage, timing.elapsed_ms);
        }
        println!(
            "explain: inline citations verified={} unverified={} ratio={:.2}",
            result.citation_audit.verified.len(),
            result.citation_audit.unverified.len(),
            result.citation_audit.ratio
        );
    }
}
