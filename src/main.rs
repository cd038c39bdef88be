use clap::{Parser, Subcommand, ValueEnum};
use local_sandbox::{
    next_event, prebuild_agent_images, setup_registry, AgentType, ContainerEngine,
    CreateOptions, DockerEngine, EventKind, ImageStrategy, LocalConfig, LocalSandboxProvider,
    ProcessEngine, RunOptions, SandboxProvider, CONFIG_FILE_NAME,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Local Sandbox - containerized command execution for coding agents
#[derive(Parser)]
#[command(name = "local-sandbox")]
#[command(version = "0.1.0")]
#[command(about = "Run agent commands in local sandboxes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ./.vibekit-config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Container engine to run on
    #[arg(long, value_enum, default_value_t = EngineKind::Docker, global = true)]
    engine: EngineKind,

    /// Agent type the sandbox is provisioned for
    #[arg(short, long, global = true)]
    agent: Option<String>,

    /// Working directory inside the sandbox
    #[arg(short, long, global = true)]
    workdir: Option<String>,

    /// Environment variable for the sandbox (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env, global = true)]
    envs: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineKind {
    /// The docker CLI
    Docker,
    /// Plain host processes in a scratch directory
    Process,
}

#[derive(Subcommand)]
enum Commands {
    /// Run commands in order on one sandbox
    Run {
        /// The commands to execute
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Show the image resolution plan
    Resolve,
    /// Pre-cache images for every known agent
    Prebuild,
    /// Push the agent images to your registry account and use them
    SetupRegistry {
        /// Account to push under (default: the logged-in docker user)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = LocalConfig::load(&config_path);
    if config.auto_install {
        warn!("autoInstall is set but engine installation is not supported; ignoring");
    }

    let engine: Arc<dyn ContainerEngine> = match cli.engine {
        EngineKind::Docker => {
            let docker = DockerEngine::new();
            if let Err(e) = docker.probe().await {
                error!("{}", e);
                std::process::exit(1);
            }
            Arc::new(docker)
        }
        EngineKind::Process => Arc::new(ProcessEngine::new()),
    };

    let provider = LocalSandboxProvider::new(config, engine);
    let result = match &cli.command {
        Commands::Run { commands } => run_commands(&cli, &provider, commands).await,
        Commands::Resolve => show_plan(&cli, &provider),
        Commands::Prebuild => prebuild(&provider).await,
        Commands::SetupRegistry { user } => {
            setup_user_registry(&provider, user.as_deref(), &config_path).await
        }
        Commands::Config => show_config(&provider.config()),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_commands(
    cli: &Cli,
    provider: &LocalSandboxProvider,
    commands: &[String],
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut options = CreateOptions::new();
    for (key, value) in &cli.envs {
        options = options.env(key, value);
    }
    if let Some(agent) = &cli.agent {
        options = options.agent(agent.as_str());
    }
    if let Some(workdir) = &cli.workdir {
        options = options.working_dir(workdir);
    }

    let sandbox = provider.create(options).await?;
    info!("Sandbox {} ready", sandbox.id());

    let mut events = sandbox.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = next_event(&mut events).await {
            match event.kind {
                EventKind::Update => println!("{}", event.payload),
                EventKind::Error => eprintln!("{}", event.payload),
                EventKind::Start | EventKind::End => {
                    info!("[{}] {}", event.name(), event.payload)
                }
            }
        }
    });

    let mut last_code = 0;
    for command in commands {
        let result = sandbox.commands().run(command, RunOptions::new()).await?;
        if !result.success() {
            warn!("{:?} exited with {}", command, result.exit_code);
        }
        last_code = result.exit_code;
    }

    let status = sandbox.status().await;
    info!(
        "Base image: {} ({})",
        status.base_image.as_deref().unwrap_or("-"),
        status
            .image_source
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    );

    sandbox.kill().await;
    drop(sandbox);
    let _ = printer.await;
    Ok(last_code)
}

fn show_plan(
    cli: &Cli,
    provider: &LocalSandboxProvider,
) -> Result<i32, Box<dyn std::error::Error>> {
    let agent = cli.agent.as_deref().map(AgentType::from);
    let plan = provider.resolver().plan(agent.as_ref());

    println!("\n{}", "=".repeat(60));
    println!(
        "Image Resolution Plan: {}",
        agent.as_ref().map(AgentType::as_str).unwrap_or("default")
    );
    println!("{}", "=".repeat(60));
    for (i, step) in plan.iter().enumerate() {
        match step {
            ImageStrategy::Registry { candidates } => {
                println!("[{}] registry: {}", i + 1, candidates.join(", "))
            }
            ImageStrategy::Build {
                definition,
                tag,
                push_target,
            } => {
                println!(
                    "[{}] build: {} from {}",
                    i + 1,
                    tag,
                    definition.dockerfile.display()
                );
                if let Some(target) = push_target {
                    println!("    push: {}", target);
                }
            }
            ImageStrategy::Fallback { image } => println!("[{}] fallback: {}", i + 1, image),
        }
    }
    println!("{}", "=".repeat(60));
    Ok(0)
}

async fn prebuild(provider: &LocalSandboxProvider) -> Result<i32, Box<dyn std::error::Error>> {
    let engine = provider.engine();
    let report = prebuild_agent_images(engine.as_ref(), &provider.config()).await;

    println!("\n{}", "=".repeat(60));
    println!("Prebuild Summary");
    println!("{}", "=".repeat(60));
    for outcome in &report.results {
        match (&outcome.source, &outcome.error) {
            (Some(source), _) => println!(
                "{:<10} ok     {:?} {}",
                outcome.agent_type,
                source,
                outcome.image.as_deref().unwrap_or("")
            ),
            (None, error) => println!(
                "{:<10} failed {}",
                outcome.agent_type,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!("{}", "=".repeat(60));

    Ok(if report.success { 0 } else { 1 })
}

async fn setup_user_registry(
    provider: &LocalSandboxProvider,
    user: Option<&str>,
    config_path: &Path,
) -> Result<i32, Box<dyn std::error::Error>> {
    let engine = provider.engine();
    let (config, report) = setup_registry(engine.as_ref(), &provider.config(), user).await?;

    println!("\n{}", "=".repeat(60));
    println!("Registry Setup Summary");
    println!("{}", "=".repeat(60));
    for outcome in &report.results {
        match (&outcome.image, &outcome.error) {
            (Some(image), _) => println!("{:<10} pushed {}", outcome.agent_type, image),
            (None, error) => println!(
                "{:<10} failed {}",
                outcome.agent_type,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!("{}", "=".repeat(60));

    config.save(config_path)?;
    info!("Saved registry images to {}", config_path.display());
    Ok(0)
}

fn show_config(config: &LocalConfig) -> Result<i32, Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(0)
}
