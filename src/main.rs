//! stagecrew CLI - Resumable plan/write/edit content pipeline.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use stagecrew::{
    CancelToken, ChatStageExecutor, CheckpointStore, Config, Credentials, LLMClient,
    PipelineRun, PipelineRunner, ProgressObserver, RateLimiter, RetryPolicy, RunOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

const PROGRESS_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "stagecrew")]
#[command(version)]
#[command(about = "Resumable multi-stage LLM content pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "stagecrew.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one topic
    Run {
        /// Topic to run; also the checkpoint key
        #[arg(short, long)]
        topic: String,

        /// Extra prompt input as key=value (repeatable)
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,

        /// Discard this topic's checkpoints before running
        #[arg(long)]
        force_restart: bool,

        /// Write the final output here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Read topics from stdin, one per line, sharing one checkpoint store
    Session,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn parse_input(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# stagecrew configuration file

[provider]
name = "cerebras"
base_url = "https://api.cerebras.ai/v1"
# API key (or set LLM_API_KEY)
# api_key = "${CEREBRAS_API_KEY}"
api_key_env = "LLM_API_KEY"
timeout_secs = 180
network_retries = 3

[retry]
max_attempts = 5
min_wait_secs = 4.0
max_wait_secs = 120.0
multiplier = 2.0
pacing_delay_secs = 1.0

[rate_limit]
max_rpm = 30

[[stages]]
name = "plan"
model = "llama3.3-70b"
label = "planner"
system_prompt = "prompts/plan.md"
prompt = "Research {topic} and produce a detailed outline."

[[stages]]
name = "write"
model = "llama3.3-70b"
label = "writer"
system_prompt = "prompts/write.md"
prompt = "Write a blog post about {topic} following the outline."

[[stages]]
name = "edit"
model = "llama3.3-70b"
label = "editor"
system_prompt = "prompts/edit.md"
prompt = "Proofread the post about {topic} and return the final markdown."
temperature = 0.3
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

/// Everything a run needs, built once from config.
struct App {
    runner: Arc<PipelineRunner<ChatStageExecutor>>,
    client: Arc<LLMClient>,
}

impl App {
    fn build(config: &Config) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .context("Failed to resolve API key")?;

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.max_rpm));
        let client = Arc::new(LLMClient::from_config(
            &config.provider,
            rate_limiter,
        )?);
        let executor = ChatStageExecutor::from_config(config, Arc::clone(&client))?
            .with_fallback_api_key(Some(api_key));

        let runner = PipelineRunner::new(
            Arc::new(CheckpointStore::new()),
            config.stage_sequence()?,
            executor,
        )
        .with_retry_policy(RetryPolicy::from(&config.retry));

        Ok(Self {
            runner: Arc::new(runner),
            client,
        })
    }

    /// Run on a background task while rendering progress from the store.
    async fn run_with_progress(&self, run: PipelineRun, cancel: CancelToken) -> Result<RunOutcome> {
        let progress = self.runner.progress();
        let pb = ProgressBar::new(self.runner.stages().len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("##-"),
        );

        let runner = Arc::clone(&self.runner);
        let mut task = tokio::spawn(async move { runner.execute(&run, &cancel).await });
        let mut ticker = tokio::time::interval(PROGRESS_POLL);

        let result = loop {
            tokio::select! {
                joined = &mut task => break joined.context("Pipeline task panicked")?,
                _ = ticker.tick() => {
                    let snapshot = progress.snapshot();
                    pb.set_position(snapshot.completed() as u64);
                    match &snapshot.next_pending {
                        Some(stage) => pb.set_message(format!("running: {stage}")),
                        None => pb.set_message("finishing"),
                    }
                }
            }
        };

        let snapshot = progress.snapshot();
        pb.set_position(snapshot.completed() as u64);
        match &result {
            Ok(outcome) => pb.finish_with_message(format!(
                "Done! {} executed, {} from checkpoints",
                outcome.executed.len(),
                outcome.skipped.len()
            )),
            Err(e) => pb.abandon_with_message(format!("Failed: {e}")),
        }

        Ok(result?)
    }

    fn print_summary(&self, outcome: &RunOutcome) {
        let stats = self.client.rate_limiter().stats();
        let (input_tokens, output_tokens) = self.client.total_tokens();
        eprintln!("\n=== Pipeline Complete ===");
        eprintln!("Attempts:    {}", outcome.attempts);
        eprintln!("Executed:    {}", outcome.executed.len());
        eprintln!("Resumed:     {}", outcome.skipped.len());
        eprintln!("Cache hit:   {}", outcome.cache_hit);
        eprintln!("Requests:    {}", stats.total_requests);
        eprintln!("429s:        {}", stats.total_429s);
        eprintln!("Throttled:   {:.1}s", stats.total_wait_secs);
        eprintln!("Tokens:      {input_tokens} in / {output_tokens} out");
    }
}

async fn run_session(app: &App) -> Result<()> {
    let store = Arc::clone(app.runner.store());
    let progress = app.runner.progress();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut previous: Option<String> = None;

    eprintln!("Enter a topic per line (prefix ! to force restart, :status, :clear, :quit)");
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => break,
            ":status" => {
                let snapshot = progress.snapshot();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                if let Some(topic) = &snapshot.topic {
                    let latest = store.latest_completed_stage(topic, app.runner.stages());
                    info!(topic = %topic, latest = ?latest.as_ref().map(|s| s.as_str()), "Latest completed stage");
                }
                continue;
            }
            ":clear" => {
                store.clear_all();
                previous = None;
                info!("Cleared all checkpoints");
                continue;
            }
            _ => {}
        }

        let (topic, force_restart) = match line.strip_prefix('!') {
            Some(rest) => (rest.trim(), true),
            None => (line, false),
        };
        if topic.is_empty() {
            continue;
        }

        if let Some(prev) = previous.as_deref().filter(|prev| *prev != topic) {
            let removed = store.clear(prev);
            info!(previous = %prev, removed, "Topic changed, cleared previous topic");
        }
        previous = Some(topic.to_string());

        let run = PipelineRun::new(topic).force_restart(force_restart);
        match app.run_with_progress(run, CancelToken::new()).await {
            Ok(outcome) => println!("{}\n", outcome.output),
            Err(e) => warn!(topic = %topic, error = %e, "Run failed; rerun the topic to resume"),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            for stage in &config.stages {
                if let Some(path) = &stage.system_prompt {
                    if !path.is_file() {
                        bail!("System prompt for stage {:?} not found: {path:?}", stage.name);
                    }
                }
            }

            info!("Configuration is valid");
            info!("  Provider: {} ({})", config.provider.name, config.provider.base_url);
            info!(
                "  Stages: {}",
                config
                    .stages
                    .iter()
                    .map(|s| format!("{} [{}]", s.name, s.model))
                    .collect::<Vec<_>>()
                    .join(" → ")
            );
            info!(
                "  Retry: {} attempts, {:.0}s..{:.0}s backoff",
                config.retry.max_attempts, config.retry.min_wait_secs, config.retry.max_wait_secs
            );
            return Ok(());
        }

        Commands::Run {
            topic,
            inputs,
            force_restart,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let app = App::build(&config)?;

            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, stopping at the next stage boundary");
                        cancel.cancel();
                    }
                });
            }

            let run = PipelineRun::new(topic)
                .with_inputs(inputs.into_iter().collect())
                .force_restart(force_restart)
                .with_credentials(Credentials::new());
            let outcome = app.run_with_progress(run, cancel).await?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &outcome.output)
                        .with_context(|| format!("Failed to write output to {path:?}"))?;
                    info!("Output written to {path:?}");
                }
                None => println!("{}", outcome.output),
            }
            app.print_summary(&outcome);
        }

        Commands::Session => {
            let config = load_config(&cli.config)?;
            let app = App::build(&config)?;
            run_session(&app).await?;
        }
    }

    Ok(())
}
