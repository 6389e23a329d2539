//! keyword-batch - scheduled classification of chat utterances.
//!
//! Extracts distinct utterances from the chat store, classifies each one
//! through the external LLM and writes keyword rows into the derived table.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyword_batch::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "keyword_batch=debug"
    } else {
        "keyword_batch=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
