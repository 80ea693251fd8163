use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "companion")]
#[command(about = "Companion chat bot CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway: Telegram webhook (or getUpdates loop), dispatch workers and health endpoint.
    Gateway {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 8000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Delete the current Telegram webhook (dropping pending updates) and register {URL}/telegram.
    SetWebhook {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Public base URL (default: WEBHOOK_URL or channels.telegram.webhookUrl)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Remove sessions with no interaction in the last N days.
    Sweep {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Idle days before a session is removed (default from config or 30)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("companion {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::SetWebhook { config, url }) => {
            if let Err(e) = run_set_webhook(config, url).await {
                log::error!("set-webhook failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Sweep { config, days }) => {
            if let Err(e) = run_sweep(config, days).await {
                log::error!("sweep failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    lib::gateway::run_gateway(config).await
}

async fn run_set_webhook(
    config_path: Option<std::path::PathBuf>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let endpoint = lib::gateway::set_webhook(&config, url).await?;
    println!("webhook set to {}", endpoint);
    Ok(())
}

async fn run_sweep(config_path: Option<std::path::PathBuf>, days: Option<u32>) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let days = days.unwrap_or(config.session.retention_days);
    let removed = lib::gateway::sweep_sessions(&config, days).await?;
    println!("removed {} session(s) idle for more than {} day(s)", removed, days);
    Ok(())
}
