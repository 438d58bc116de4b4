//! # `cidx`
//!
//! Command-line front end for the context index.
//!
//! ```bash
//! cidx --config ./config/cidx.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cidx ingest [PATHS]...` | Index changed documents; no paths syncs the whole root |
//! | `cidx rebuild <SOURCE_ID>` | Reprocess one document unconditionally |
//! | `cidx remove <SOURCE_ID>` | Drop a document's chunks and record |
//! | `cidx search "<query>"` | Ranked semantic or hybrid search |
//! | `cidx stats` | Chunk, source and record counts |
//! | `cidx status` | Processed vs pending documents under the root |
//! | `cidx verify` | Compare records with stored chunks; exits 1 on findings |
//!
//! Logs go to stderr (`RUST_LOG`, default `warn`); results go to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use context_index::config;
use context_index::index::ContextIndex;
use context_index::ingest::IngestSummary;
use context_index::models::keys;
use context_index::search::{Query, SearchMode};
use context_index::store::MetadataFilter;

#[derive(Parser)]
#[command(
    name = "cidx",
    about = "Incremental semantic index over a directory of documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cidx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index documents whose content changed since they were last processed.
    ///
    /// Paths are relative to `[ingest].root` or absolute under it. A path
    /// that no longer exists removes the document. Without paths the whole
    /// root is scanned and vanished documents are pruned.
    Ingest { paths: Vec<PathBuf> },

    /// Reprocess a document regardless of its fingerprint.
    Rebuild { source_id: String },

    /// Remove a document's chunks and processing record.
    Remove { source_id: String },

    /// Search indexed documents.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        k: Option<usize>,

        /// `semantic` or `hybrid`. Defaults to `[retrieval].default_mode`.
        #[arg(long)]
        mode: Option<SearchMode>,

        /// Minimum semantic similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f32>,

        /// Return several chunks per document.
        #[arg(long)]
        chunks: bool,

        /// Metadata equality filter, repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,

        /// Only documents carrying this tag, repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only documents whose frontmatter `category` matches.
        #[arg(long)]
        category: Option<String>,

        /// Only chunks of this source.
        #[arg(long)]
        source: Option<String>,

        /// Include the score breakdown.
        #[arg(long)]
        explain: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats,

    /// Show how many documents under the root are processed or pending.
    Status,

    /// Check processing records against stored chunks.
    Verify,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;
    let index = ContextIndex::open(cfg)
        .await
        .context("Failed to open index")?;

    match cli.command {
        Commands::Ingest { paths } => {
            let token = index.cancel_token();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Cancelling after in-flight documents finish...");
                    token.cancel();
                }
            });

            let summary = if paths.is_empty() {
                index.sync().await?
            } else {
                index.ingest(&paths).await?
            };
            ctrl_c.abort();

            print_summary(&summary);
            if !summary.failed.is_empty() || !summary.inconsistencies.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Rebuild { source_id } => {
            let record = index.rebuild(std::path::Path::new(&source_id)).await?;
            println!(
                "Rebuilt {}: {} chunks (hash {})",
                record.source_id,
                record.chunk_count,
                &record.content_hash[..record.content_hash.len().min(12)]
            );
        }
        Commands::Remove { source_id } => {
            let removed = index.remove_document(&source_id).await?;
            println!("Removed {}: {} chunks deleted", source_id, removed);
        }
        Commands::Search {
            query,
            k,
            mode,
            threshold,
            chunks,
            filters,
            tags,
            category,
            source,
            explain,
            json,
        } => {
            let mut filter = match source {
                Some(id) => MetadataFilter::source(id),
                None => MetadataFilter::new(),
            };
            for (key, value) in filters {
                filter = filter.equals(key, value);
            }
            for tag in tags {
                filter = filter.contains(keys::TAGS, tag);
            }
            if let Some(category) = category {
                filter = filter.equals(keys::CATEGORY, category);
            }

            let mut q = Query::new(query).chunk_level(chunks).explain(explain);
            q.k = k;
            q.mode = mode;
            q.similarity_threshold = threshold;
            if !filter.is_empty() {
                q = q.filter(filter);
            }

            let results = index.search(&q).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for r in &results {
                    println!(
                        "{}. [{:.3}] {} ({})",
                        r.rank,
                        r.score,
                        r.title().unwrap_or(&r.source_id),
                        r.chunk_id
                    );
                    println!("    source: {}", r.source_id);
                    if let Some(author) = r.metadata.get(keys::AUTHOR).and_then(|v| v.as_str()) {
                        println!("    author: {}", author);
                    }
                    if let Some(url) = r.metadata.get(keys::SOURCE_URL).and_then(|v| v.as_str()) {
                        println!("    url: {}", url);
                    }
                    println!("    {}", r.snippet);
                    if let Some(ex) = &r.explain {
                        let adjustments: Vec<String> = ex
                            .adjustments
                            .iter()
                            .map(|a| format!("{}={:.3}", a.name, a.multiplier))
                            .collect();
                        println!(
                            "    similarity={:.3} keyword={} base={:.3} {}",
                            ex.similarity,
                            ex.keyword
                                .map(|k| format!("{:.3}", k))
                                .unwrap_or_else(|| "-".into()),
                            ex.base,
                            adjustments.join(" ")
                        );
                    }
                    println!();
                }
            }
        }
        Commands::Stats => {
            let stats = index.stats().await?;
            println!("Chunks:              {}", stats.total_chunks);
            println!("Sources:             {}", stats.unique_sources);
            println!("Processed documents: {}", stats.processed_documents);
            println!(
                "Dimensions:          {}",
                stats
                    .dims
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into())
            );
            println!("Model:               {}", stats.model);
        }
        Commands::Status => {
            let summary = index.status().await?;
            println!("Processed: {}", summary.processed_count);
            println!("Pending:   {}", summary.pending_count);
        }
        Commands::Verify => {
            let findings = index.verify().await?;
            if findings.is_empty() {
                println!("OK: index is consistent.");
            } else {
                for finding in &findings {
                    println!("{}", finding);
                }
                println!("{} inconsistencies found; run `cidx rebuild <SOURCE_ID>` to repair.", findings.len());
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &IngestSummary) {
    println!(
        "Processed: {}  Skipped: {}  Removed: {}  Chunks written: {}",
        summary.processed, summary.skipped, summary.removed, summary.chunks_written
    );
    if summary.cancelled > 0 {
        println!("Cancelled: {}", summary.cancelled);
    }
    for failed in &summary.failed {
        println!("FAILED {}: {}", failed.source_id, failed.error);
    }
    for finding in &summary.inconsistencies {
        println!("INCONSISTENT {}", finding);
    }
}
