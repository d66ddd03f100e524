mod config;
mod controller;
mod dns;
mod error;
mod lifecycle;
mod proxy;
mod rule;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use config::{ConfigSource, FileConfigSource};
use error::Result;
use lifecycle::{Exit, LifecycleController, LifecycleHandle, LoggingSystemProxy, Signal};
use proxy::cipher::CipherRegistry;
use proxy::dispatcher::Dispatcher;
use proxy::listener::ListenerManager;
use proxy::runtime::ProxyRuntime;
use proxy::snapshot::EngineSnapshot;

#[derive(Parser, Debug)]
#[command(name = "shuttle", version, about = "Rule-based traffic dispatch proxy")]
struct Args {
    /// Configuration file, re-read on every reload
    #[arg(short, long, default_value = "shuttle.yaml")]
    config: PathBuf,

    /// off | error | warn | info | debug | trace (overrides RUST_LOG)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Program launched with `-f=<file>` after an upgrade request
    #[arg(long, default_value = "./upgrade")]
    upgrade_helper: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let exit = match run(&args).await {
        Ok(exit) => exit,
        Err(e) => {
            error!("[Main] {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Exit::Upgrade(file) = exit {
        info!(
            "[Main] handing over to {} -f={}",
            args.upgrade_helper.display(),
            file.display()
        );
        let spawned = std::process::Command::new(&args.upgrade_helper)
            .arg(format!("-f={}", file.display()))
            .spawn();
        if let Err(e) = spawned {
            error!("[Main] failed to launch upgrade helper: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn init_logging(cli_level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli_level {
        builder.parse_filters(level);
    }
    builder.format_timestamp_millis().init();
}

async fn run(args: &Args) -> Result<Exit> {
    let source: Arc<dyn ConfigSource> = Arc::new(FileConfigSource::new(args.config.clone()));
    let config = source.load()?;
    let ciphers = Arc::new(CipherRegistry::default());
    let snapshot = EngineSnapshot::build(&config, &ciphers)?;

    let runtime = Arc::new(ProxyRuntime::new(snapshot));
    let dispatcher = Arc::new(Dispatcher::new(runtime.clone()));
    let listeners = Arc::new(ListenerManager::new(dispatcher));
    let (mut lifecycle, handle) = LifecycleController::new(
        source,
        ciphers,
        listeners,
        Arc::new(LoggingSystemProxy),
    );
    lifecycle.start().await?;

    let admin_shutdown = CancellationToken::new();
    if let Some(addr) = &config.general.controller {
        match addr.parse() {
            Ok(addr) => {
                controller::spawn(addr, runtime, handle.clone(), admin_shutdown.clone())?;
            }
            Err(e) => warn!("[Main] controller address {:?} ignored: {}", addr, e),
        }
    }
    forward_os_signals(handle);

    let exit = lifecycle.run().await;
    admin_shutdown.cancel();
    info!("[Main] stopped ({:?})", exit);
    Ok(exit)
}

#[cfg(unix)]
fn forward_os_signals(handle: LifecycleHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let streams = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        );
        let (mut sigint, mut sigterm, mut sighup) = match streams {
            (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
            _ => {
                error!("[Main] failed to install signal handlers");
                return;
            }
        };
        loop {
            let next = tokio::select! {
                _ = sigint.recv() => Signal::Shutdown,
                _ = sigterm.recv() => Signal::Shutdown,
                _ = sighup.recv() => Signal::Reload,
            };
            let last = next == Signal::Shutdown;
            if handle.send(next).await.is_err() || last {
                return;
            }
        }
    });
}

#[cfg(not(unix))]
fn forward_os_signals(handle: LifecycleHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = handle.send(Signal::Shutdown).await;
        }
    });
}
