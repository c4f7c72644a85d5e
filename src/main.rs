use anyhow::{Context, Result};
use berdl_chat::{app, repl, server, Config};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "berdl-chat")]
#[command(about = "Ask questions about NMDC microbiome data in the BERDL lakehouse")]
struct Args {
    /// Env file with KB_AUTH_TOKEN and ANTHROPIC_API_KEY (default: ./.env if present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the JSON chat API
    Serve {
        /// Port to listen on (overrides BERDL_CHAT_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Answer a single question and exit
    Ask {
        /// The question in plain English
        question: String,
    },
    /// Interactive chat in the terminal
    Repl,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("berdl_chat=info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.env_file {
        Some(path) => Config::from_env_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    let orchestrator = app::build_orchestrator(&config).context("Failed to build HTTP clients")?;
    let credentials = Arc::new(config.credentials.clone());

    match args.command {
        Command::Serve { port } => {
            let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.port)));
            info!("BERDL Chat starting on {}", addr);
            let state = Arc::new(
                server::AppState::new(orchestrator, credentials)
                    .with_idle_timeout(config.session_idle_timeout),
            );
            server::serve(state, addr).await?;
        }
        Command::Ask { question } => {
            let session = orchestrator.open_session(credentials);
            orchestrator.connect(&session).await;
            let turn = orchestrator.handle_question(&session, &question).await;
            println!("{}", repl::render_turn(&turn));
            if turn.error().is_some() {
                std::process::exit(1);
            }
        }
        Command::Repl => {
            let session = orchestrator.open_session(credentials);
            repl::run(orchestrator, session).await?;
        }
    }

    Ok(())
}
