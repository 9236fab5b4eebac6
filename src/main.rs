mod agent;
mod bus;
mod channels;
mod cli;
mod commands;
mod config;
mod error;
mod llm;
mod master;
mod session;
mod store;
mod tools;
mod ui;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent::definition::AgentDefinition;
use agent::runtime::AgentRuntime;
use cli::{Cli, Command};
use config::Config;
use llm::worker::ApiWorkerOptions;
use master::{parse_agent_target, Master, RouteOutcome};
use store::ConversationStore;

/// Initialize tracing with a non-blocking file appender.
///
/// Logs go to a daily-rotated file under the data dir, or to `--log-file`
/// when given. The guard must stay alive for the program's lifetime.
fn init_logging(level: &str, log_file: Option<&PathBuf>) -> Result<WorkerGuard> {
    let (writer, guard) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => {
            let log_dir = Config::data_dir().join("logs");
            std::fs::create_dir_all(&log_dir)?;
            let appender = tracing_appender::rolling::daily(&log_dir, "niffler.log");
            tracing_appender::non_blocking(appender)
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .init();

    Ok(guard)
}

/// Database path: `NIFFLER_DB` override, else per-deployment files in the
/// data dir (agents get their own database)
fn store_path(agent: Option<&str>) -> PathBuf {
    if let Ok(path) = std::env::var("NIFFLER_DB") {
        return PathBuf::from(path);
    }
    let name = match agent {
        Some(agent) => format!("niffler-{}.db", agent),
        None => "niffler.db".to_string(),
    };
    Config::data_dir().join(name)
}

fn agent_definition_path(config: &Config, name: &str) -> PathBuf {
    let dir = config
        .defaults
        .agent_dir
        .clone()
        .unwrap_or_else(|| Config::default_path().parent().map(|p| p.join("agents")).unwrap_or_else(|| PathBuf::from("agents")));
    dir.join(format!("{}.md", name))
}

fn handle_init() -> Result<()> {
    let config_path = Config::default_path();
    Config::write_starter(&config_path)?;
    println!("Wrote {}", config_path.display());

    let agent_dir = config_path
        .parent()
        .map(|p| p.join("agents"))
        .unwrap_or_else(|| PathBuf::from("agents"));
    std::fs::create_dir_all(&agent_dir)?;
    let agent_path = agent_dir.join("assistant.md");
    if !agent_path.exists() {
        std::fs::write(&agent_path, AgentDefinition::starter("assistant"))?;
        println!("Wrote {}", agent_path.display());
    }
    println!("Set an API key (e.g. OPENAI_API_KEY) and run `niffler` to start.");
    Ok(())
}

/// Headless agent process; blocks until ctrl-c
fn run_agent(cli: &Cli, config: Config, name: &str) -> Result<()> {
    let definition_path = agent_definition_path(&config, name);
    let definition = AgentDefinition::load(&definition_path)
        .with_context(|| format!("loading agent definition {}", definition_path.display()))?;

    let store = ConversationStore::open(&store_path(Some(name)))
        .map_err(|e| anyhow!("failed to open database: {}", e))?;

    let nats_url = cli
        .nats_url
        .clone()
        .unwrap_or_else(|| config.defaults.nats_url.clone());
    let options = ApiWorkerOptions {
        dump: cli.dump,
        dump_sse: cli.dumpsse,
    };

    // Bus unavailability is fatal for an agent
    let mut runtime = AgentRuntime::start(definition, config, store, &nats_url, options)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c_handler(shutdown.clone());
    runtime.run(shutdown);
    Ok(())
}

fn spawn_ctrl_c_handler(shutdown: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("signal handler unavailable: {}", e);
                    return;
                }
            };
            if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::info!("ctrl-c received, shutting down");
                shutdown.store(true, Ordering::SeqCst);
            }
        })
        .expect("failed to spawn signal handler thread");
}

/// `--prompt`: one request, optionally waiting for the final response
fn run_single_shot(cli: &Cli, config: Config) -> Result<()> {
    let nats_url = cli
        .nats_url
        .clone()
        .unwrap_or_else(|| config.defaults.nats_url.clone());
    let presence_ttl = Duration::from_secs(config.defaults.presence_ttl_secs);
    let prompt = cli.prompt.clone().unwrap_or_default();

    let (target, rest) = parse_agent_target(&prompt);
    let agent = target
        .or_else(|| config.defaults.default_agent.clone())
        .ok_or_else(|| anyhow!("no target agent: use @agent in the prompt or set a default"))?;

    let mut master = Master::connect(&nats_url, None, presence_ttl)?;
    if cli.wait {
        let content = master.run_single_shot(&agent, &rest)?;
        println!("{}", content);
    } else {
        match master.handle_agent_request(&format!("@{} {}", agent, rest)) {
            RouteOutcome::Sent { request_id, .. } => {
                tracing::info!(%request_id, "request published, not waiting");
            }
            RouteOutcome::Error(message) => return Err(anyhow!(message)),
            _ => return Err(anyhow!("no agent to route to")),
        }
    }
    master.shutdown();
    Ok(())
}

/// Interactive foreground: master when the bus is reachable, local-only
/// single-process shape otherwise
fn run_interactive(cli: &Cli, config: Config) -> Result<()> {
    let nats_url = cli
        .nats_url
        .clone()
        .unwrap_or_else(|| config.defaults.nats_url.clone());
    let presence_ttl = Duration::from_secs(config.defaults.presence_ttl_secs);
    let options = ApiWorkerOptions {
        dump: cli.dump,
        dump_sse: cli.dumpsse,
    };

    match Master::connect(&nats_url, config.defaults.default_agent.clone(), presence_ttl) {
        Ok(mut master) => {
            master.start_listener()?;
            ui::run_master_ui(&mut master)?;
            master.shutdown();
            Ok(())
        }
        Err(e) => {
            // Bus unavailability is non-fatal for the master
            tracing::warn!("bus unavailable ({}), running local-only", e);
            println!("Bus unavailable at {}; running in local-only mode.", nats_url);
            let store = ConversationStore::open(&store_path(None))
                .map_err(|e| anyhow!("failed to open database: {}", e))?;
            ui::run_local(config, store, options)?;
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    if let Some(Command::Init) = &cli.command {
        return handle_init();
    }

    let _log_guard = init_logging(&cli.loglevel, cli.log_file.as_ref())?;
    tracing::info!("starting niffler v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_default().map_err(|e| anyhow!("{}", e))?;

    if let Some(nickname) = &cli.model {
        config.model(nickname).map_err(|e| anyhow!("{}", e))?;
        config.defaults.model = nickname.clone();
    }

    if let Some(agent) = cli.agent.clone() {
        return run_agent(&cli, config, &agent);
    }
    if cli.prompt.is_some() {
        return run_single_shot(&cli, config);
    }
    run_interactive(&cli, config)
}
