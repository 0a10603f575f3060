use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use lib::audit::AuditLog;
use lib::gateway::{shutdown_signal, Gateway};
use lib::message::{Message, SessionEvent};
use lib::transport::TransportHandle;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier messaging gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Validate the config: routes (no ambiguity, no unrouted units) and middleware.
    Check {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the dispatcher and in-process applications until Ctrl+C.
    Run {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway with stdin/stdout standing in for one transport.
    Console {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Configured transport to impersonate (default: the first one)
        #[arg(long, short)]
        transport: Option<String>,

        /// Endpoint the messages arrive on
        #[arg(long, default_value = "default")]
        endpoint: String,

        /// Sender address
        #[arg(long, default_value = "console-user")]
        from: String,

        /// Recipient address
        #[arg(long, default_value = "console")]
        to: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("config check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run_gateway(config).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Console {
            config,
            transport,
            endpoint,
            from,
            to,
        }) => {
            if let Err(e) = run_console(config, transport, endpoint, from, to).await {
                log::error!("console failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let gateway = Gateway::new(config, AuditLog::new())?;
    println!("config ok: {}", path.display());
    for (transport, endpoint, app) in gateway.routes().inbound_routes() {
        println!("  {}/{} -> {}", transport, endpoint, app);
    }
    if !gateway.stages().is_empty() {
        println!("  middleware: {}", gateway.stages().join(" -> "));
    }
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::info!("starting gateway with {}", path.display());
    lib::gateway::run_gateway(config).await
}

async fn run_console(
    config_path: Option<PathBuf>,
    transport: Option<String>,
    endpoint: String,
    from: String,
    to: String,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let transport = match transport {
        Some(t) => t,
        None => config
            .transports
            .first()
            .map(|t| t.name.clone())
            .ok_or_else(|| anyhow::anyhow!("config has no transports"))?,
    };
    let gateway = Gateway::new(config, AuditLog::new())?;
    if !gateway.routes().transports().contains(&transport) {
        anyhow::bail!("unknown transport {}", transport);
    }
    let runtime = gateway.start().await;
    let handle = TransportHandle::connect(transport.clone(), gateway.bus()).await;
    println!("console on {}/{} (Ctrl+D to close the session, Ctrl+C to quit)", transport, endpoint);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut started = false;
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if stdin_open => {
                let (content, event) = match line? {
                    Some(text) if !started => (text, Some(SessionEvent::New)),
                    Some(text) => (text, Some(SessionEvent::Resume)),
                    None => {
                        stdin_open = false;
                        (String::new(), Some(SessionEvent::Close))
                    }
                };
                started = true;
                let mut msg = Message::inbound(from.as_str(), to.as_str(), transport.as_str(), content)?
                    .with_endpoint(endpoint.as_str());
                if let Some(event) = event {
                    msg = msg.with_session_event(event);
                }
                handle.submit(msg).await?;
                if !stdin_open {
                    // Leave a moment for the last replies before exiting.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    break;
                }
            }
            out = handle.next_outbound() => match out {
                None => break,
                Some(Ok(msg)) => {
                    println!("< {}", msg.content().unwrap_or_default());
                    if !msg.metadata().is_empty() {
                        log::debug!("metadata: {}", serde_json::to_string(msg.metadata())?);
                    }
                    handle.ack(&msg).await?;
                }
                Some(Err(e)) => eprintln!("undecodable outbound record: {}", e),
            },
        }
    }

    // Drain anything that arrived during the grace period.
    while let Ok(Some(Ok(msg))) =
        tokio::time::timeout(Duration::from_millis(50), handle.next_outbound()).await
    {
        println!("< {}", msg.content().unwrap_or_default());
    }
    runtime.shutdown().await;
    Ok(())
}
