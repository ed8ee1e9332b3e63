//! # Scorecard CLI (`scorecard`)
//!
//! Ingests call transcripts, scores them against versioned rubrics with an
//! LLM, and caches every result so a call is analyzed at most once per
//! rubric version.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scorecard init` | Create the SQLite database and run schema migrations |
//! | `scorecard ingest <file>` | Store a call transcript from a JSON file |
//! | `scorecard calls` | List stored calls |
//! | `scorecard chunks <call>` | Show how a call would be chunked |
//! | `scorecard analyze <call>` | Score a call on one or more dimensions |
//! | `scorecard stats` | Cache hit-rate and stored-result summary |
//!
//! ## Examples
//!
//! ```bash
//! scorecard init --config ./config/scorecard.toml
//! scorecard ingest ./calls/acme-intro.json
//! scorecard analyze call-42 --dimension discovery
//! scorecard analyze call-42 --json
//! scorecard stats --dimension discovery
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use scorecard::config::{self, Config};
use scorecard::error::AnalysisError;
use scorecard::hf_tokenizer::load_tokenizer;
use scorecard::orchestrator::{AnalysisOutcome, Analyzer};
use scorecard::transcripts::{CallFile, SqliteTranscripts, TranscriptSource};
use scorecard::{db, migrate, stats};
use scorecard_core::chunk::chunk_transcript;
use scorecard_core::models::AnalyzeOptions;

/// Scorecard: cached LLM scoring of sales-call transcripts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/scorecard.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "scorecard", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/scorecard.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Store a call transcript from a JSON file.
    ///
    /// Re-ingesting a call replaces its utterances. Cached analyses of the
    /// old content stay in the store but no longer match.
    Ingest {
        /// Path to the call JSON file.
        file: PathBuf,
    },

    /// List stored calls with their utterance counts.
    Calls,

    /// Show the chunk boundaries for a call without calling the LLM.
    Chunks {
        /// Call id.
        call_id: String,
    },

    /// Score a call against configured rubrics.
    ///
    /// With no `--dimension`, every configured dimension is analyzed.
    Analyze {
        /// Call id.
        call_id: String,

        /// Dimension to score. Repeatable.
        #[arg(long = "dimension", short = 'd')]
        dimensions: Vec<String>,

        /// Rubric version (single dimension only). Defaults to the
        /// configured version.
        #[arg(long)]
        rubric_version: Option<String>,

        /// Skip the cache lookup and recompute.
        #[arg(long)]
        force: bool,

        /// Omit utterance snippets from findings.
        #[arg(long)]
        no_snippets: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show cache hit rates and stored results.
    Stats {
        /// Restrict lookups to one dimension.
        #[arg(long)]
        dimension: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file } => {
            let call = CallFile::read(&file)?;
            let pool = db::connect(&cfg).await?;
            SqliteTranscripts::new(pool.clone()).ingest(&call).await?;
            println!(
                "Ingested {} ({} utterances)",
                call.id,
                call.utterances.len()
            );
            pool.close().await;
        }
        Commands::Calls => {
            let pool = db::connect(&cfg).await?;
            let calls = SqliteTranscripts::new(pool.clone()).list().await?;
            if calls.is_empty() {
                println!("No calls ingested.");
            } else {
                println!("{:<32} {:>10}", "CALL", "UTTERANCES");
                for (id, n) in calls {
                    println!("{:<32} {:>10}", id, n);
                }
            }
            pool.close().await;
        }
        Commands::Chunks { call_id } => {
            run_chunks(&cfg, &call_id).await?;
        }
        Commands::Analyze {
            call_id,
            dimensions,
            rubric_version,
            force,
            no_snippets,
            json,
        } => {
            let options = AnalyzeOptions {
                force_reanalysis: force,
                include_snippets: !no_snippets,
            };
            run_analyze(&cfg, &call_id, dimensions, rubric_version, options, json).await?;
        }
        Commands::Stats { dimension } => {
            stats::run_stats(&cfg, dimension.as_deref()).await?;
        }
    }

    Ok(())
}

async fn run_chunks(cfg: &Config, call_id: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let transcript = SqliteTranscripts::new(pool.clone())
        .load(call_id)
        .await?
        .with_context(|| format!("Call not found: {}", call_id))?;
    pool.close().await;

    let tokenizer = load_tokenizer(&cfg.chunking.tokenizer)?;
    let plan = cfg.chunking.plan();
    let chunks = chunk_transcript(&transcript, tokenizer.as_ref(), &plan);

    println!(
        "{}: {} utterances, {} chunk(s) (max {} tokens, overlap {}, tokenizer {})",
        call_id,
        transcript.utterances.len(),
        chunks.len(),
        plan.max_tokens,
        plan.overlap_tokens(),
        tokenizer.name()
    );
    if chunks.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "  {:>5} {:>19} {:>8} {:>8} {:>13}",
        "CHUNK", "TOKENS", "COUNT", "OVERLAP", "UTTERANCES"
    );
    for c in &chunks {
        println!(
            "  {:>5} {:>19} {:>8} {:>8} {:>13}",
            c.index,
            format!("{}..{}", c.start_token, c.end_token),
            c.token_count(),
            c.overlap_tokens,
            format!("#{}..#{}", c.first_utterance, c.last_utterance)
        );
    }
    Ok(())
}

async fn run_analyze(
    cfg: &Config,
    call_id: &str,
    dimensions: Vec<String>,
    rubric_version: Option<String>,
    options: AnalyzeOptions,
    json: bool,
) -> anyhow::Result<()> {
    let dimensions = if dimensions.is_empty() {
        cfg.rubrics.keys().cloned().collect::<Vec<_>>()
    } else {
        dimensions
    };
    if dimensions.is_empty() {
        bail!("No rubrics configured; add a [rubrics.<dimension>] table");
    }
    if rubric_version.is_some() && dimensions.len() > 1 {
        bail!("--rubric-version applies to a single --dimension");
    }

    let pool = db::connect(cfg).await?;
    let analyzer = Analyzer::from_config(cfg, pool.clone())?;

    let outcomes = if dimensions.len() == 1 {
        let dimension = &dimensions[0];
        let version = match rubric_version {
            Some(v) => v,
            None => analyzer.current_version(dimension).await?,
        };

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });

        let outcome = analyzer
            .analyze_cancellable(call_id, dimension, &version, options, &cancel)
            .await;
        vec![(dimension.clone(), outcome)]
    } else {
        let mut pairs = Vec::with_capacity(dimensions.len());
        for d in &dimensions {
            pairs.push((d.clone(), analyzer.current_version(d).await?));
        }
        analyzer.analyze_dimensions(call_id, &pairs, options).await?
    };

    pool.close().await;

    let mut failed = 0;
    if json {
        let mut out = serde_json::Map::new();
        for (dimension, outcome) in &outcomes {
            let value = match outcome {
                Ok(o) => serde_json::to_value(o)?,
                Err(e) => {
                    failed += 1;
                    serde_json::json!({ "outcome": "error", "error": e.to_string() })
                }
            };
            out.insert(dimension.clone(), value);
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (dimension, outcome) in &outcomes {
            match outcome {
                Ok(o) => print_outcome(dimension, o),
                Err(e) => {
                    failed += 1;
                    print_error(dimension, e);
                }
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} analyses failed", failed, outcomes.len());
    }
    Ok(())
}

fn print_outcome(dimension: &str, outcome: &AnalysisOutcome) {
    let report = match outcome {
        AnalysisOutcome::Analyzed(r) => r,
        AnalysisOutcome::NothingToAnalyze { call_id } => {
            println!("{}: {} has no content, nothing to analyze", dimension, call_id);
            return;
        }
    };
    let r = &report.result;

    println!("── {} ({}) ──", dimension, r.rubric_version);
    println!(
        "  status: {}  source: {:?}  score: {:.2}  chunks: {}",
        r.status.as_str(),
        report.source,
        r.score,
        r.chunk_count
    );
    if report.is_partial() {
        println!(
            "  partial: {} chunk(s) failed; this result was not served from cache",
            r.failed_chunks.len()
        );
        for f in &r.failed_chunks {
            println!(
                "    chunk {} after {} attempt(s): {}",
                f.chunk_index, f.attempts, f.reason
            );
        }
    }
    if !report.persisted {
        println!("  warning: result was not persisted; the next request will recompute");
    }
    if report.llm_calls > 0 {
        println!(
            "  llm calls: {}  tokens in/out: {}/{}  cache read/write: {}/{}",
            report.llm_calls,
            report.usage.input_tokens,
            report.usage.output_tokens,
            report.usage.cache_read_tokens,
            report.usage.cache_write_tokens
        );
    }

    for (criterion, score) in &r.criteria {
        println!("  {:<28} {:>6.2}", criterion, score);
    }
    if !r.summary.is_empty() {
        println!();
        println!("  {}", r.summary);
    }
    if !r.findings.is_empty() {
        println!();
        for f in &r.findings {
            println!(
                "  [#{} @ {}] {}: {}",
                f.utterance_index,
                scorecard_core::models::format_offset(f.timestamp_ms),
                f.criterion,
                f.observation
            );
            if let Some(snippet) = &f.snippet {
                println!("      \"{}\"", snippet);
            }
        }
    }
    println!();
}

fn print_error(dimension: &str, error: &AnalysisError) {
    eprintln!("── {} ──", dimension);
    eprintln!("  error: {}", error);
    if let AnalysisError::AllChunksFailed { failures } = error {
        for f in failures {
            eprintln!(
                "    chunk {} after {} attempt(s): {}",
                f.chunk_index, f.attempts, f.reason
            );
        }
    }
    eprintln!();
}
