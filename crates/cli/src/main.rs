use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "demo-runner")]
#[command(about = "Run allow-listed commands for WebSocket clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Load the config and compile the allowlist without starting the server.
    Check {
        /// Config file path (default: CONFIG_FILE or ./config.yaml)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the server (HTTP + WebSocket on one port).
    Serve {
        /// Config file path (default: CONFIG_FILE or ./config.yaml)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Listen port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,

        /// Listen address (default from config or 0.0.0.0)
        #[arg(long, short)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("demo-runner {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port, bind }) => {
            if let Err(e) = run_serve(config, port, bind).await {
                log::error!("server failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_check(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let allowlist = lib::exec::Allowlist::new(&config.allowed_commands)?;
    println!(
        "{}: {} allowed command pattern(s), listening on {}",
        path.display(),
        allowlist.len(),
        config.bind_addr()
    );
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.http_listen_port = p;
    }
    if let Some(b) = bind {
        config.http_listen_address = b;
    }
    log::info!("loaded config from {}", path.display());
    log::info!("starting server on {}", config.bind_addr());
    lib::gateway::run_gateway(config).await
}
