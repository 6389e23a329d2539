//! CLI surface for the batch pipeline.
//!
//! Thin layer over the service API: parses arguments, wires configuration,
//! renders progress events, and turns the run summary into an exit status.

use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::llm::{LlmClient, RateLimiter};
use crate::queries::BatchQueries;
use crate::repository::KeywordRepository;
use crate::services::{BatchEvent, BatchService, MissingReport, RunSummary};
use crate::utils::format_duration;

#[derive(Parser)]
#[command(name = "keyword-batch")]
#[command(about = "Batch classification of chat utterances into keyword categories")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Classify all distinct utterances in a date range
    Batch {
        /// First date of the range (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last date of the range, inclusive (defaults to start)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Dates processed concurrently (overrides configuration)
        #[arg(long)]
        dates: Option<usize>,
        /// Chunk workers per date (overrides configuration)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Detect and repair utterances missing from the derived table
    Missing {
        #[command(subcommand)]
        op: MissingOp,
    },
}

#[derive(Subcommand)]
enum MissingOp {
    /// Report missing utterances per date, without writing anything
    Check {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Re-classify missing utterances
    Process {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Stop after this many utterances
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check, process, and report both sides
    Auto {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("configuration error")?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let (service, limiter) = build_service(&config, cancel).await?;

    match cli.command {
        Commands::Batch {
            start,
            end,
            dates,
            workers,
        } => cmd_batch(&service, &limiter, start, end.unwrap_or(start), dates, workers).await,
        Commands::Missing { op } => match op {
            MissingOp::Check { start, end } => {
                cmd_missing_check(&service, start, end.unwrap_or(start)).await
            }
            MissingOp::Process { start, end, limit } => {
                cmd_missing_process(&service, &limiter, start, end.unwrap_or(start), limit).await
            }
            MissingOp::Auto { start, end, limit } => {
                cmd_missing_auto(&service, &limiter, start, end.unwrap_or(start), limit).await
            }
        },
    }
}

async fn build_service(
    config: &Config,
    cancel: CancellationToken,
) -> anyhow::Result<(BatchService, RateLimiter)> {
    let repo = KeywordRepository::connect(&config.store, &config.pipeline)
        .await
        .context("failed to connect to the store")?;
    let queries = BatchQueries::new(&config.store);

    let catalog = Arc::new(
        repo.load_categories(&queries, config.catalog.fallback_id)
            .await
            .context("failed to load the category catalog")?,
    );
    println!(
        "{} Loaded {} categories (fallback id {})",
        style("✓").green(),
        catalog.len(),
        catalog.fallback_id()
    );

    let classifier = Arc::new(
        LlmClient::new(config.llm.clone(), catalog.clone()).with_cancellation(cancel.clone()),
    );
    // Shared bucket; kept around so the commands can report request totals.
    let limiter = classifier.rate_limiter().clone();

    let service = BatchService::new(
        repo,
        classifier,
        catalog,
        queries,
        config.pipeline.clone(),
    )
    .with_cancellation(cancel);

    Ok((service, limiter))
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });
}

/// Spawn a task that renders run events to the terminal.
fn spawn_event_renderer(
    mut events: mpsc::Receiver<BatchEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut bar: Option<ProgressBar> = None;
        while let Some(event) = events.recv().await {
            match event {
                BatchEvent::Started { total_dates } => {
                    let pb = ProgressBar::new(total_dates as u64);
                    pb.set_style(
                        ProgressStyle::with_template(
                            "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} dates {msg}",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    bar = Some(pb);
                }
                BatchEvent::DateStarted { date } => {
                    if let Some(pb) = &bar {
                        pb.set_message(date.to_string());
                    }
                }
                BatchEvent::ChunkFlushed {
                    inserted, skipped, ..
                } => {
                    if let Some(pb) = &bar {
                        pb.set_message(format!("+{inserted} rows ({skipped} dup)"));
                    }
                }
                BatchEvent::DateCompleted { summary } => {
                    if let Some(pb) = &bar {
                        pb.inc(1);
                        let mark = match summary.status {
                            crate::services::DateStatus::Succeeded => style("✓").green(),
                            crate::services::DateStatus::Failed => style("✗").red(),
                        };
                        pb.println(format!(
                            "  {} {}: {} extracted, {} inserted, {} skipped{}",
                            mark,
                            summary.date,
                            summary.counters.extracted,
                            summary.counters.inserted,
                            summary.counters.skipped,
                            summary
                                .error
                                .map(|e| format!(" ({e})"))
                                .unwrap_or_default(),
                        ));
                    }
                }
                BatchEvent::Complete { .. } => {
                    if let Some(pb) = bar.take() {
                        pb.finish_and_clear();
                    }
                }
            }
        }
    })
}

fn print_summary(summary: &RunSummary) {
    println!(
        "\n{} {} .. {} in {}",
        style("Batch finished:").bold(),
        summary.start,
        summary.end,
        format_duration(summary.duration)
    );
    println!(
        "  extracted {}, classified {}, inserted {}, skipped {}, failed {}, fallbacks {}",
        summary.counters.extracted,
        summary.counters.classified,
        summary.counters.inserted,
        summary.counters.skipped,
        summary.counters.failed_insert,
        summary.counters.llm_fallbacks,
    );
    if !summary.counters.category_distribution.is_empty() {
        let distribution: Vec<String> = summary
            .counters
            .category_distribution
            .iter()
            .map(|(id, count)| format!("{id}: {count}"))
            .collect();
        println!("  categories: {}", distribution.join(", "));
    }
}

fn print_missing_report(report: &MissingReport) {
    println!(
        "{} missing, {} already classified",
        style(report.total_missing).bold(),
        report.total_processed
    );
    for (date, count) in &report.per_date {
        println!("  {date}: {count} missing");
    }
}

async fn cmd_batch(
    service: &BatchService,
    limiter: &RateLimiter,
    start: NaiveDate,
    end: NaiveDate,
    dates: Option<usize>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    println!(
        "{} Classifying utterances {} .. {}",
        style("→").cyan(),
        start,
        end
    );

    let (event_tx, event_rx) = mpsc::channel::<BatchEvent>(64);
    let renderer = spawn_event_renderer(event_rx);

    let summary = service
        .run_range(start, end, dates, workers, event_tx)
        .await?;
    let _ = renderer.await;

    print_summary(&summary);
    println!(
        "  llm requests issued: {}",
        limiter.stats().await.total_requests
    );

    if summary.is_success() {
        Ok(())
    } else {
        let failed = summary.failed_dates();
        anyhow::bail!(
            "run completed with losses: {} failed inserts, {} failed dates{}",
            summary.counters.failed_insert,
            failed.len(),
            if failed.is_empty() {
                String::new()
            } else {
                format!(
                    " ({})",
                    failed
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        );
    }
}

async fn cmd_missing_check(
    service: &BatchService,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<()> {
    println!(
        "{} Checking for missing data {} .. {}",
        style("→").cyan(),
        start,
        end
    );
    let report = service.check_missing(start, end).await?;
    print_missing_report(&report);
    Ok(())
}

async fn cmd_missing_process(
    service: &BatchService,
    limiter: &RateLimiter,
    start: NaiveDate,
    end: NaiveDate,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    println!(
        "{} Processing missing data {} .. {}{}",
        style("→").cyan(),
        start,
        end,
        limit.map(|n| format!(" (limit {n})")).unwrap_or_default()
    );

    let (event_tx, event_rx) = mpsc::channel::<BatchEvent>(64);
    let renderer = spawn_event_renderer(event_rx);

    let summary = service.process_missing(start, end, limit, event_tx).await?;
    let _ = renderer.await;

    println!(
        "{} processed {}, inserted {}, skipped {}, failed {} in {}",
        style("✓").green(),
        summary.counters.classified,
        summary.counters.inserted,
        summary.counters.skipped,
        summary.counters.failed_insert,
        format_duration(summary.duration)
    );
    println!(
        "  llm requests issued: {}",
        limiter.stats().await.total_requests
    );
    if summary.missing_after > 0 {
        println!(
            "{} {} utterances still missing",
            style("!").yellow(),
            summary.missing_after
        );
    }
    Ok(())
}

async fn cmd_missing_auto(
    service: &BatchService,
    limiter: &RateLimiter,
    start: NaiveDate,
    end: NaiveDate,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    println!(
        "{} Reconciling {} .. {}",
        style("→").cyan(),
        start,
        end
    );

    let (event_tx, event_rx) = mpsc::channel::<BatchEvent>(64);
    let renderer = spawn_event_renderer(event_rx);

    let outcome = service.auto_missing(start, end, limit, event_tx).await?;
    let _ = renderer.await;

    println!("{}", style("Before:").bold());
    print_missing_report(&outcome.before);
    println!(
        "{} inserted {}, skipped {}, {} still missing",
        style("After:").bold(),
        outcome.summary.counters.inserted,
        outcome.summary.counters.skipped,
        outcome.summary.missing_after
    );
    println!(
        "  llm requests issued: {}",
        limiter.stats().await.total_requests
    );
    Ok(())
}
