use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use sar_watchbot::config;
use sar_watchbot::scorer::{LexicalScorer, TermLists};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Score messages offline with the lexical scorer, one message per line"
)]
struct Args {
    /// Read messages from this file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,

    /// Take term lists from this YAML config instead of the built-in ones
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only print messages scoring above this value
    #[arg(long)]
    threshold: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let terms = match &args.config {
        Some(path) => config::load(Some(path))?.term_lists(),
        None => TermLists::default(),
    };
    let scorer = LexicalScorer::new(terms);

    match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            score_lines(&scorer, file, args.threshold).await
        }
        None => score_lines(&scorer, tokio::io::stdin(), args.threshold).await,
    }
}

async fn score_lines<R>(scorer: &LexicalScorer, input: R, threshold: Option<f64>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let score = scorer.score(&line);
        if threshold.map_or(true, |t| score.value > t) {
            println!("{:.3}\t{}", score.value, score.highlighted);
        }
    }
    Ok(())
}
