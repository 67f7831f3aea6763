use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use sar_watchbot::alert::SlackWebhook;
use sar_watchbot::archive::SqliteArchive;
use sar_watchbot::classifier::{DisabledClassifier, HttpClassifier, RemoteClassifier};
use sar_watchbot::config::{self, Config};
use sar_watchbot::db;
use sar_watchbot::feed::HttpFeed;
use sar_watchbot::model::Cursor;
use sar_watchbot::pipeline::Pipeline;
use sar_watchbot::scheduler::{self, StartOutcome};
use sar_watchbot::scorer::LexicalScorer;
use sar_watchbot::settings::{Settings, SECRET_CLASSIFIER_URL};
use sar_watchbot::workflow::Controller;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker that executes due generations (default)
    Run,
    /// Start a polling loop unless it is already running
    Start {
        #[arg(long)]
        instance: String,
        /// Only items with a higher id are processed
        #[arg(long, default_value_t = 0)]
        cursor: u64,
    },
    /// Show the persisted state of a polling loop
    Status {
        #[arg(long)]
        instance: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/sar-watchbot.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_worker(&cfg, pool).await,
        Command::Start { instance, cursor } => {
            match scheduler::ensure_running(&pool, &instance, Cursor(cursor)).await? {
                StartOutcome::Started => println!("started {instance} at cursor {cursor}"),
                StartOutcome::AlreadyRunning => println!("{instance} is already running"),
            }
            Ok(())
        }
        Command::Status { instance } => {
            let inst = db::find_instance(&pool, &instance)
                .await?
                .ok_or_else(|| anyhow!("no such instance: {instance}"))?;
            println!("instance:   {}", inst.instance_id);
            println!("state:      {}", inst.state.as_str());
            println!("cursor:     {}", inst.cursor);
            println!("generation: {}", inst.generation);
            println!("due_at:     {}", inst.due_at.to_rfc3339());
            println!("attempt:    {}", inst.attempt);
            if let Some(err) = inst.last_error {
                println!("last_error: {err}");
            }
            Ok(())
        }
    }
}

fn build_controller(cfg: &Config, pool: db::Pool) -> Result<Controller> {
    let settings = Arc::new(Settings::from_config(cfg));

    let feed = HttpFeed::new(
        &cfg.feed.base_url,
        &cfg.feed.account,
        cfg.feed.max_results,
        Duration::from_secs(cfg.feed.timeout_seconds),
        settings.clone(),
    )?;
    let remote: Arc<dyn RemoteClassifier> = if settings.secret(SECRET_CLASSIFIER_URL).is_some() {
        Arc::new(HttpClassifier::new(
            settings.clone(),
            Duration::from_secs(cfg.classifier.timeout_seconds),
        )?)
    } else {
        info!("no remote classifier configured; lexical scores decide alone");
        Arc::new(DisabledClassifier)
    };
    let alerts = SlackWebhook::new(
        settings.clone(),
        Duration::from_secs(cfg.alert.timeout_seconds),
    )?;

    let scorer = Arc::new(LexicalScorer::new(cfg.term_lists()));
    let pipeline = Pipeline::new(scorer, remote, settings.clone());
    Ok(Controller::new(
        Arc::new(feed),
        Arc::new(SqliteArchive::new(pool)),
        Arc::new(alerts),
        pipeline,
        settings,
        cfg.delay_policy(),
    ))
}

async fn run_worker(cfg: &Config, pool: db::Pool) -> Result<()> {
    let controller = build_controller(cfg, pool.clone())?;
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    info!(account = %cfg.feed.account, "starting worker");
    loop {
        match scheduler::process_next_due(&pool, &controller, max_backoff).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
