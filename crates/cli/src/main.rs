use std::{path::PathBuf, time::Duration};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    pairgate_channels::{ChannelPlugin, DeliveryStatus},
    pairgate_config::PairgateConfig,
    pairgate_whatsapp::{WhatsAppChannel, WhatsAppSession},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "pairgate", about = "Pairgate, a single-session WhatsApp gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of the discovered one.
    #[arg(long, global = true, env = "PAIRGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect, send one message, and exit.
    Send {
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        message: String,
        /// Seconds to wait for the session to become ready.
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration as JSON.
    Show,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PairgateConfig> {
    match &cli.config {
        Some(path) => pairgate_config::load_config(path),
        None => Ok(pairgate_config::discover_and_load()),
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

async fn send_once(
    session: WhatsAppSession,
    account_id: &str,
    to: &str,
    message: &str,
    wait: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let channel = WhatsAppChannel::new(session.clone(), account_id.to_string());
    let outbound = channel
        .outbound()
        .context("whatsapp channel has no outbound adapter")?;

    let deliver = async {
        session.initialize().await?;
        if !session.wait_until_ready(wait).await {
            warn!(waited = ?wait, "whatsapp session not ready");
            if session.snapshot().pairing_artifact.is_some() {
                eprintln!("account is not linked: run `pairgate gateway` and scan the QR code first");
            }
        }
        let status = outbound.send_text(account_id, to, message).await?;
        anyhow::Ok(status)
    };

    let result = tokio::select! {
        result = deliver => Some(result),
        () = shutdown => None,
    };
    session.shutdown().await;

    match result {
        None => eprintln!("interrupted, the message was not sent"),
        Some(result) => match result? {
            DeliveryStatus::Sent => println!("sent"),
            DeliveryStatus::Queued => {
                println!("queued");
                eprintln!("session never became ready, the message was not delivered");
            },
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "pairgate starting");

    let mut config = load_config(&cli)?;
    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            pairgate_gateway::server::start_gateway(config, shutdown_signal()).await
        },
        Commands::Send {
            to,
            message,
            wait_secs,
        } => {
            let session = pairgate_gateway::server::spawn_session(&config.whatsapp)?;
            send_once(
                session,
                &config.whatsapp.client_id,
                &to,
                &message,
                Duration::from_secs(wait_secs),
                shutdown_signal(),
            )
            .await
        },
        Commands::Config { action } => {
            match action {
                ConfigAction::Path => {
                    let path = cli
                        .config
                        .unwrap_or_else(pairgate_config::find_or_default_config_path);
                    println!("{}", path.display());
                },
                ConfigAction::Show => println!("{}", serde_json::to_string_pretty(&config)?),
            }
            Ok(())
        },
    }
}
