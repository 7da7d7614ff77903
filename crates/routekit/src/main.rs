use anyhow::Context;
use clap::{Parser, Subcommand};
use routekit::config::Config;
use routekit::logging::{self, LogFormat};
use routekit::proxy::{create_http_client, ProxySession};
use routekit::SessionScope;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "routekit",
    version,
    about = "Intercept and rewrite a browsing session's requests"
)]
struct Args {
    #[arg(
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "ROUTEKIT_LOG_FORMAT",
        global = true
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the intercepting proxy
    Run {
        #[arg(short, long, env = "ROUTEKIT_CONFIG")]
        config: PathBuf,

        /// Shared defaults merged under the config file
        #[arg(short, long, env = "ROUTEKIT_GLOBAL_CONFIG")]
        global: Option<PathBuf>,

        /// Overrides `listen.address` from the config
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Validate a config file and exit
    Check {
        #[arg(short, long, env = "ROUTEKIT_CONFIG")]
        config: PathBuf,

        #[arg(short, long, env = "ROUTEKIT_GLOBAL_CONFIG")]
        global: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_format);

    match args.command {
        Command::Run {
            config,
            global,
            listen,
        } => run(Config::from_files(&config, global)?, listen).await,
        Command::Check { config, global } => {
            let loaded = Config::from_files(&config, global)?;
            println!(
                "{}: {} overrides, {} modify rules",
                config.display(),
                loaded.overrides.len(),
                loaded.modifies.len()
            );
            Ok(())
        }
    }
}

async fn run(config: Config, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let client = create_http_client(&config.upstream)?;
    let dispatcher = config.pipeline()?.build()?;
    let addr = listen.unwrap_or(config.listen.address);

    let session = ProxySession::bind(addr, client, dispatcher)
        .await
        .with_context(|| format!("Failed to bind proxy on {addr}"))?;
    info!("Session '{}' listening on {}", config.name, session.local_addr());

    let scope = SessionScope::new(Arc::new(session), config.session_options());
    let cancel = scope.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            cancel.cancel();
        }
    });

    scope
        .run(|_session| async { Ok::<(), routekit::Error>(()) })
        .await?;
    Ok(())
}
