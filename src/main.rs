//! Ptycast CLI - publish or subscribe command output, or run the
//! WebSocket bridge.
//!
//! ```text
//! Publisher:  ptycast --addr tcp://127.0.0.1:1234 --pub 'tail -f /var/log/syslog'
//! Subscriber: ptycast --addr tcp://127.0.0.1:1234 --sub
//! Bridge:     ptycast --bridge --config ptycast.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use ptycast::relay::publisher::DEFAULT_MAX_QUEUED_FRAMES;
use ptycast::{relay, BridgeServer, Capture, Config, Publisher};

/// Publish or subscribe command output to/from a TCP stream address.
#[derive(Parser, Debug)]
#[command(name = "ptycast", version, about)]
struct Args {
    /// Stream address to bind (--pub) or connect to (--sub).
    /// Example: tcp://127.0.0.1:1234
    #[arg(long)]
    addr: Option<String>,

    /// Publish: command to run
    #[arg(long = "pub", value_name = "COMMAND")]
    publish: Option<String>,

    /// Subscribe: print stream output to stdout
    #[arg(long)]
    sub: bool,

    /// Run the WebSocket bridge
    #[arg(long)]
    bridge: bool,

    /// Bridge configuration file (JSON)
    #[arg(long, default_value = "ptycast.json")]
    config: PathBuf,

    /// Frames queued per subscriber before it is disconnected as too slow
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUED_FRAMES)]
    max_queued_frames: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let modes = usize::from(args.publish.is_some()) + usize::from(args.sub) + usize::from(args.bridge);
    let needs_addr = (args.publish.is_some() || args.sub) && args.addr.is_none();
    if modes != 1 || needs_addr {
        Args::command().print_help()?;
        std::process::exit(1);
    }

    if let Some(command) = args.publish {
        // addr checked above
        let addr = args.addr.unwrap_or_default();
        return run_publish(&addr, &command, args.max_queued_frames).await;
    }
    if args.sub {
        let addr = args.addr.unwrap_or_default();
        return relay::subscriber::run_to_stdout(&addr).await;
    }
    run_bridge(&args.config).await
}

/// Bind the address, spawn the command, relay until it exits.
async fn run_publish(addr: &str, command: &str, max_queued_frames: usize) -> Result<()> {
    // Bind before the first chunk so early subscribers have an address.
    let publisher = Publisher::bind(addr, max_queued_frames).await?;
    let capture = Capture::spawn(command)?;
    publisher.publish(capture).await
}

/// Run the bridge until interrupted.
async fn run_bridge(config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        log::warn!(
            "Config {} not found, using defaults",
            config_path.display()
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };

    let server = BridgeServer::start(Arc::new(config)).await?;
    tokio::signal::ctrl_c().await?;
    log::info!("Interrupted, shutting down");
    server.shutdown();
    Ok(())
}
