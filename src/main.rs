mod batcher;
mod control;
mod gateway;
mod menu;
mod session;

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use comanda_agent::AgentBridge;
use comanda_core::config;
use comanda_history::HistoryStore;
use comanda_whatsapp::WhatsAppTransport;

use crate::menu::MenuPolicy;
use crate::session::Session;

#[derive(Parser)]
#[command(
    name = "comanda",
    version,
    about = "Comanda — food-truck order gateway over WhatsApp"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway.
    Start,
    /// Show the resolved configuration and session state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    // RUST_LOG wins; the config's log_level is the default.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.comanda.log_level)),
        )
        .init();

    match cli.command {
        Commands::Start => {
            let history = HistoryStore::new(&config::shellexpand(&cfg.history.db_path)).await?;
            let agent = AgentBridge::new(cfg.agent.clone())?;
            let menu = Arc::new(MenuPolicy::new(cfg.menu.clone(), history.clone()));

            let transport = Arc::new(WhatsAppTransport::new(&cfg.comanda.data_dir));
            let session = Arc::new(Session::new(
                transport,
                Duration::from_secs(cfg.gateway.send_timeout_secs),
            ));

            println!("Comanda — starting gateway...");
            let gw = gateway::Gateway::new(cfg, session, agent, menu, history);
            gw.run().await?;
        }
        Commands::Status => {
            println!("Comanda — Status\n");
            println!("Config: {}", cli.config);
            println!("Agent endpoint: {}", cfg.agent.base_url);
            println!("Restaurant: {}", cfg.agent.restaurant_name);
            println!("History DB: {}", cfg.history.db_path);
            println!("Menu file: {}", cfg.menu.path);
            println!(
                "Debounce: {} ms, send timeout: {} s",
                cfg.gateway.debounce_ms, cfg.gateway.send_timeout_secs
            );
            println!("Control server: {}:{}", cfg.control.host, cfg.control.port);

            let session_db = format!(
                "{}/whatsapp_session/session.db",
                config::shellexpand(&cfg.comanda.data_dir)
            );
            let paired = std::path::Path::new(&session_db).exists();
            println!(
                "WhatsApp session: {}",
                if paired { "paired" } else { "not paired (scan QR on start)" }
            );
        }
    }

    Ok(())
}
