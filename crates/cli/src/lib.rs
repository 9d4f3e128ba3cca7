use anyhow::{Context as AnyhowContext, Result};
use broker_evaluator::{Evaluator, PythonExecutor, TaskSet};
use broker_harness::{
    standard_tasks, BenchmarkHarness, HarnessError, JsonStateStore, ModelRun, PromptRefiner,
    StateStore,
};
use broker_model_cache::ModelContextCache;
use broker_provider::{build_provider, ModelDescriptor, ModelProvider, ProviderKind};
use broker_proxy::ContextProxy;
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::BrokerConfig;
use server_security::ProxyBind;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod config;
mod operator;
mod report;
mod server_security;

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "roo-broker")]
#[command(about = "Benchmark local models and fit requests to their context windows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Config file (env: ROO_BROKER_CONFIG, default: ./roo-broker.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Inference backend
    #[arg(long, global = true, value_enum)]
    provider: Option<ProviderArg>,

    /// Base URL of the inference server
    #[arg(long, global = true)]
    base_url: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Lmstudio,
    Ollama,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Lmstudio => ProviderKind::LmStudio,
            ProviderArg::Ollama => ProviderKind::Ollama,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the models the inference server exposes
    Models(ModelsArgs),

    /// Validate and list benchmark tasks
    Tasks(TasksArgs),

    /// Run the benchmark suite against discovered models
    Benchmark(BenchmarkArgs),

    /// Serve the context-optimization proxy
    Proxy(ProxyArgs),

    /// Inspect persisted model state
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Args)]
struct ModelsArgs {
    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct TasksArgs {
    /// Directory of task definitions (default: built-in suite)
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct BenchmarkArgs {
    /// Directory of task definitions (default: built-in suite)
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Only benchmark these model ids (repeatable)
    #[arg(long = "model")]
    models: Vec<String>,

    /// Model that rewrites prompts after a failed grade
    #[arg(long)]
    critic: Option<String>,

    /// Models benchmarked at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// Where per-model state is persisted
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Never ask whether to continue between models
    #[arg(long)]
    no_prompt: bool,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ProxyArgs {
    /// Bind address, e.g. 127.0.0.1:1235
    #[arg(long)]
    bind: Option<String>,

    /// Allow binding to non-loopback addresses
    #[arg(long)]
    public: bool,

    /// Share of the context window kept for the prompt
    #[arg(long)]
    reserve_fraction: Option<f64>,
}

#[derive(Subcommand)]
enum StateCommand {
    /// Show results and learned prompts for one model
    Show(StateShowArgs),
}

#[derive(Args)]
struct StateShowArgs {
    /// Model id
    model: String,

    /// Where per-model state is persisted
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();

    // Keep stdout clean for JSON consumers.
    let json_output = match &cli.command {
        Commands::Models(args) => args.json,
        Commands::Tasks(args) => args.json,
        Commands::Benchmark(args) => args.json,
        Commands::State(StateCommand::Show(args)) => args.json,
        Commands::Proxy(_) => false,
    };
    if json_output {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if std::env::var_os("RUST_LOG").is_none() {
        if cli.quiet {
            builder.filter_level(log::LevelFilter::Warn);
        } else if cli.verbose {
            builder.filter_level(log::LevelFilter::Debug);
        }
        builder.filter_module("hyper", log::LevelFilter::Warn);
        builder.filter_module("reqwest", log::LevelFilter::Warn);
    }
    builder.target(env_logger::Target::Stderr).init();

    let mut config = BrokerConfig::load(cli.config.as_deref())?;
    if let Some(provider) = cli.provider {
        config.provider.kind = provider.into();
    }
    if let Some(base_url) = cli.base_url {
        config.provider.base_url = Some(base_url);
    }

    match cli.command {
        Commands::Models(args) => run_models(&config, args).await?,
        Commands::Tasks(args) => run_tasks(args)?,
        Commands::Benchmark(args) => run_benchmark(config, args).await?,
        Commands::Proxy(args) => run_proxy(config, args).await?,
        Commands::State(StateCommand::Show(args)) => run_state_show(&config, args).await?,
    }
    Ok(())
}

fn provider_for(config: &BrokerConfig) -> Arc<dyn ModelProvider> {
    build_provider(config.provider.kind, Some(config.provider.resolved_base_url()))
}

fn cache_for(config: &BrokerConfig, provider: Arc<dyn ModelProvider>) -> ModelContextCache {
    ModelContextCache::with_ttl(provider, Duration::from_secs(config.proxy.cache_ttl_secs))
}

async fn discover(config: &BrokerConfig, cache: &ModelContextCache) -> Result<()> {
    cache.refresh_all().await.with_context(|| {
        format!(
            "Cannot list models from {} at {}",
            config.provider.kind,
            config.provider.resolved_base_url()
        )
    })?;
    Ok(())
}

fn load_tasks(dir: Option<&Path>) -> Result<TaskSet> {
    let tasks = match dir {
        Some(dir) => TaskSet::load_dir(dir),
        None => standard_tasks(),
    }
    .map_err(HarnessError::from)?;
    Ok(tasks)
}

async fn run_models(config: &BrokerConfig, args: ModelsArgs) -> Result<()> {
    let cache = cache_for(config, provider_for(config));
    discover(config, &cache).await?;
    let models = cache.snapshot();

    if args.json {
        let models: Vec<&ModelDescriptor> = models.iter().map(|m| m.as_ref()).collect();
        print_stdout(&serde_json::to_string_pretty(&models)?)?;
    } else if models.is_empty() {
        print_stdout("No models loaded.")?;
    } else {
        print_stdout(&report::render_models(&models))?;
    }
    Ok(())
}

fn run_tasks(args: TasksArgs) -> Result<()> {
    let tasks = load_tasks(args.tasks.as_deref())?;
    if args.json {
        let listed: Vec<serde_json::Value> = tasks
            .iter()
            .map(|task| {
                serde_json::json!({
                    "id": task.id,
                    "name": task.name,
                    "type": task.kind,
                    "difficulty": task.difficulty,
                    "evaluation_method": task.evaluation_method(),
                    "test_cases": task.cases.len(),
                    "tags": task.tags,
                })
            })
            .collect();
        print_stdout(&serde_json::to_string_pretty(&listed)?)?;
        return Ok(());
    }

    let mut md = String::new();
    md.push_str("| id | method | difficulty | cases |\n");
    md.push_str("|---|---|---|---:|\n");
    for task in &tasks {
        md.push_str(&format!(
            "| `{}` | `{}` | `{}` | `{}` |\n",
            task.id,
            task.evaluation_method(),
            format!("{:?}", task.difficulty).to_lowercase(),
            task.cases.len()
        ));
    }
    print_stdout(&md)?;
    Ok(())
}

/// Pick the models to benchmark, in discovery order unless ids are given.
fn select_models(available: &[Arc<ModelDescriptor>], wanted: &[String]) -> Result<Vec<ModelDescriptor>> {
    let selected: Vec<ModelDescriptor> = if wanted.is_empty() {
        available.iter().map(|m| m.as_ref().clone()).collect()
    } else {
        wanted
            .iter()
            .filter_map(|id| {
                let found = available.iter().find(|m| &m.id == id);
                if found.is_none() {
                    log::warn!("Model {id} is not loaded; skipping");
                }
                found.map(|m| m.as_ref().clone())
            })
            .collect()
    };
    if selected.is_empty() {
        anyhow::bail!("No models to benchmark");
    }
    Ok(selected)
}

async fn run_benchmark(mut config: BrokerConfig, args: BenchmarkArgs) -> Result<()> {
    if let Some(critic) = args.critic {
        config.harness.critic_model = Some(critic);
    }
    if let Some(concurrency) = args.concurrency {
        config.harness.concurrency = concurrency;
    }
    if let Some(state_dir) = args.state_dir {
        config.harness.state_dir = state_dir;
    }
    config.validate()?;

    // A broken task set aborts before any model is contacted.
    let tasks = Arc::new(load_tasks(args.tasks.as_deref())?);
    log::info!("Loaded {} benchmark tasks", tasks.len());

    let provider = provider_for(&config);
    let cache = cache_for(&config, provider.clone());
    discover(&config, &cache).await?;
    let models = select_models(&cache.snapshot(), &args.models)?;

    let executor = PythonExecutor::new(config.evaluator.python.clone());
    match executor.probe().await {
        Ok(version) => log::debug!("Grading with {} {version}", executor.interpreter()),
        Err(err) => log::warn!("{err}; code-executing tasks will fail"),
    }
    let evaluator = Evaluator::new(Arc::new(executor))
        .with_case_timeout(Duration::from_secs(config.evaluator.case_timeout_secs));
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(config.harness.state_dir.clone()));
    let refiner = PromptRefiner::new(provider.clone(), config.harness.critic_model.clone());
    let harness = Arc::new(
        BenchmarkHarness::new(provider, evaluator, store)
            .with_refiner(refiner)
            .with_timeouts(config.harness.timeouts)
            .with_concurrency(config.harness.concurrency),
    );

    let stop = operator::stop_on_ctrl_c();
    let interactive = !args.no_prompt
        && !args.json
        && config.harness.continue_prompt_secs > 0
        && config.harness.concurrency == 1
        && models.len() > 1
        && io::stdin().is_terminal();

    let runs = if interactive {
        let wait = Duration::from_secs(config.harness.continue_prompt_secs);
        run_with_operator(&harness, &models, &tasks, &stop, wait).await
    } else {
        let mut runs = Vec::with_capacity(models.len());
        for (model_id, run) in harness.run_models(models, tasks.clone(), stop).await {
            match run {
                Ok(run) => runs.push(run),
                Err(err) => log::error!("Benchmark of {model_id} failed: {err}"),
            }
        }
        runs
    };

    if args.json {
        print_stdout(&serde_json::to_string_pretty(&report::runs_json(&runs))?)?;
    } else {
        print_stdout(&report::render_runs(&runs))?;
        print_stdout(&format!(
            "State saved under {}",
            config.harness.state_dir.display()
        ))?;
    }
    Ok(())
}

/// Sequential run that asks the operator between models.
async fn run_with_operator(
    harness: &BenchmarkHarness,
    models: &[ModelDescriptor],
    tasks: &TaskSet,
    stop: &watch::Receiver<bool>,
    wait: Duration,
) -> Vec<ModelRun> {
    let mut input = operator::OperatorInput::spawn();
    let mut runs = Vec::with_capacity(models.len());
    for (idx, descriptor) in models.iter().enumerate() {
        if *stop.borrow() {
            break;
        }
        let skipped = match harness.run_model_until(descriptor, tasks, stop).await {
            Ok(run) => {
                let skipped = run.skipped;
                runs.push(run);
                skipped
            }
            Err(err) => {
                log::error!("Benchmark of {} failed: {err}", descriptor.id);
                false
            }
        };
        let Some(next) = models.get(idx + 1) else {
            break;
        };
        if !skipped && !*stop.borrow() && !input.ask_continue(&next.id, wait).await {
            log::info!("Stopping at operator request");
            break;
        }
    }
    runs
}

async fn run_proxy(mut config: BrokerConfig, args: ProxyArgs) -> Result<()> {
    if let Some(bind) = args.bind {
        config.proxy.bind = bind;
    }
    if let Some(reserve_fraction) = args.reserve_fraction {
        config.proxy.reserve_fraction = reserve_fraction;
    }
    config.validate()?;

    let bind = ProxyBind::resolve(&config.proxy.bind, args.public).await?;
    let addr = bind.listen_addr();

    let upstream = config.provider.resolved_base_url().to_string();
    let cache = Arc::new(cache_for(&config, provider_for(&config)));
    if let Err(err) = cache.refresh_all().await {
        log::warn!("Initial model discovery failed ({err}); requests pass through unmodified until {upstream} answers");
    }
    let proxy = Arc::new(
        ContextProxy::new(cache, upstream.clone()).with_reserve_fraction(config.proxy.reserve_fraction),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    print_stdout(&format!("Context optimizer proxy running on http://{local_addr}"))?;
    print_stdout(&format!(
        "Point your client at http://{local_addr} instead of {upstream}"
    ))?;
    if bind.is_exposed() {
        print_stdout(&format!(
            "Public bind enabled (--public): {}",
            bind.describe()
        ))?;
    }
    print_stdout(&format!("Try: curl http://{local_addr}/proxy/health"))?;

    axum::serve(listener, proxy.router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down proxy");
        })
        .await?;
    Ok(())
}

async fn run_state_show(config: &BrokerConfig, args: StateShowArgs) -> Result<()> {
    let dir = args
        .state_dir
        .unwrap_or_else(|| config.harness.state_dir.clone());
    let store = JsonStateStore::new(dir);
    let state = store
        .load(&args.model)
        .await
        .with_context(|| format!("Failed to load state for {}", args.model))?;

    match (state, args.json) {
        (Some(state), true) => print_stdout(&serde_json::to_string_pretty(&state)?)?,
        (Some(state), false) => print_stdout(&report::render_state(&state))?,
        (None, true) => print_stdout("null")?,
        (None, false) => print_stdout(&format!(
            "No benchmark state for {} in {}",
            args.model,
            store.dir().display()
        ))?,
    }
    Ok(())
}
