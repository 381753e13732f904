//! Menu server demo.
//!
//! Serves a shared menu: clients fetch it with GET_DISHES, and any ADD_DISH
//! or UPDATE_DISH tells every connected client to refresh.
//!
//! Run the server, then one or more clients:
//!   cargo run -p hatch-demo-menu --bin menu-server -- --port 8001
//!   cargo run -p hatch-demo-menu --bin menu-client -- --port 8001 --add "Stew" --price 900

mod menu;
mod protocol;

use clap::Parser;
use hatch_server::{Dispatcher, ServerConfig, serve};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Serve a shared menu over hatch")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "HATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides the configured port.
    #[arg(long, env = "HATCH_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hatch=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let dispatcher = Dispatcher::bind(config).await?;
    let accept = dispatcher.spawn();

    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                dispatcher.shutdown();
            }
        });
    }

    let mut menu = menu::Menu::new();
    serve(&dispatcher, &mut menu).await;
    accept.await?;
    Ok(())
}
