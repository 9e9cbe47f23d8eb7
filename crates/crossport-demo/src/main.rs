//! Crossport demo - a background context owning a user, and an options
//! context that binds it and logs in.
//!
//! Run `background` in one process and `options --connect` in another, or
//! `local` to run both over an in-process hub.

mod contexts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use contexts::{BACKGROUND, OPTIONS};
use crossport_core::{MemoryHub, Messenger, MessagingConfig, TcpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "crossport-demo")]
#[command(about = "Cross-context messaging demo")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Own the user and publish it
    Background {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },
    /// Bind the background user and log in
    Options {
        /// Address printed by the background process
        #[arg(long)]
        connect: SocketAddr,

        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,
    },
    /// Run both contexts in this process
    Local {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.mode {
        Mode::Background { host, port } => run_background(&host, port).await,
        Mode::Options {
            connect,
            email,
            name,
        } => {
            let transport = TcpTransport::new().with_route(BACKGROUND, connect);
            let options = Messenger::start(MessagingConfig::new(OPTIONS)?, Arc::new(transport))?;
            let user = contexts::run_options(&options, &email, &name).await?;
            println!("{}", user);
            Ok(())
        }
        Mode::Local { email, name } => {
            let hub = MemoryHub::new();
            let background = Messenger::start(
                MessagingConfig::new(BACKGROUND)?,
                Arc::new(hub.endpoint(BACKGROUND)),
            )?;
            let options =
                Messenger::start(MessagingConfig::new(OPTIONS)?, Arc::new(hub.endpoint(OPTIONS)))?;

            contexts::start_background(&background)?;
            let user = contexts::run_options(&options, &email, &name).await?;
            println!("{}", user);
            Ok(())
        }
    }
}

async fn run_background(host: &str, port: u16) -> Result<()> {
    info!("Starting {} context", BACKGROUND);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let transport = TcpTransport::bind(addr).await?;
    let addr = transport
        .local_addr()
        .context("Transport has no bound address")?;

    let background = Messenger::start(MessagingConfig::new(BACKGROUND)?, Arc::new(transport))?;
    let user = contexts::start_background(&background)?;

    // Print port for the options process (intentional stdout)
    println!("CROSSPORT_PORT={}", addr.port());

    info!("{} context running on {}", BACKGROUND, addr);

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutdown signal received, last user: {}",
        user.get("user").unwrap_or_default()
    );

    Ok(())
}
