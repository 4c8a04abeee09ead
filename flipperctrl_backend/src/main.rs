use std::io;
use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam::channel;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flipper_backend::FlipperConfig;
use flipperctrl_backend::{
    build_port, run_console, watch_shutdown_signals, FlipperService, RemoteServer,
};

/// Neutron spin-flipper controller with OpenGENIE remote control
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the simulated Device I/O port
    #[arg(long)]
    simulate: bool,

    /// Remote control bind address
    #[arg(long)]
    host: Option<String>,

    /// Remote control port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter, e.g. "debug" or "flipper_backend=trace"
    #[arg(long)]
    log: Option<String>,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_console: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FlipperConfig::load(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => FlipperConfig::default(),
    };
    if let Some(host) = &args.host {
        config.remote.host = host.clone();
    }
    if let Some(port) = args.port {
        config.remote.port = port;
    }

    let filter = args.log.clone().unwrap_or_else(|| config.logging.filter.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting flipper controller");
    // Installed first so a signal during start-up still reaches the shutdown path
    let signals = watch_shutdown_signals()?;
    let setup = build_port(&config, args.simulate)?;
    let service = FlipperService::start(&config, setup)?;

    let remote = RemoteServer::bind(
        (config.remote.host.as_str(), config.remote.port),
        service.controller().clone(),
        &config.remote,
    )
    .with_context(|| format!("binding {}:{}", config.remote.host, config.remote.port))?
    .spawn()?;

    let (console_tx, console_rx) = channel::bounded::<()>(1);
    if args.no_console {
        info!("Console disabled, serving remote clients until SIGINT or SIGTERM");
    } else {
        let ctrl = service.controller().clone();
        thread::Builder::new()
            .name("console".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                if let Err(err) = run_console(&ctrl, stdin.lock(), io::stdout()) {
                    warn!("Console closed: {}", err);
                }
                let _ = console_tx.send(());
            })?;
    }

    // Either path ends in the same shutdown, which zeroes every output
    crossbeam::select! {
        recv(signals) -> _ => {}
        recv(console_rx) -> _ => info!("Console session ended"),
    }

    remote.stop();
    service.stop()?;
    info!("Flipper controller stopped");
    Ok(())
}
