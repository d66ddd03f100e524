//! Shutdown, reload and upgrade, serialized through one controller task.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::{LevelFilter, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::config::{ConfigSource, General, SystemProxyMode};
use crate::error::{DispatchError, Result};
use crate::proxy::cipher::CipherRegistry;
use crate::proxy::dispatcher::InboundKind;
use crate::proxy::listener::{ListenerManager, ListenerSpec};
use crate::proxy::runtime::ProxyRuntime;
use crate::proxy::snapshot::EngineSnapshot;

const SIGNAL_QUEUE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
    /// Stop and hand over to the upgrade helper with this file.
    Upgrade(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Draining,
    Reloading,
    Upgrading,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the controller finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    Upgrade(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Socks,
}

/// OS-level proxy settings, toggled per kind.
pub trait SystemProxy: Send + Sync {
    fn set_system_proxy(&self, kind: ProxyKind, enabled: bool, host: &str, port: u16)
    -> io::Result<()>;
}

/// Records toggles in the log and leaves the OS untouched.
#[derive(Debug, Default)]
pub struct LoggingSystemProxy;

impl SystemProxy for LoggingSystemProxy {
    fn set_system_proxy(
        &self,
        kind: ProxyKind,
        enabled: bool,
        host: &str,
        port: u16,
    ) -> io::Result<()> {
        info!(
            "[SystemProxy] {:?} {} {}:{}",
            kind,
            if enabled { "enabled" } else { "disabled" },
            host,
            port
        );
        Ok(())
    }
}

/// Cloneable sender side used by signal handlers and the admin API.
#[derive(Clone)]
pub struct LifecycleHandle {
    signals: mpsc::Sender<Signal>,
    state: watch::Receiver<State>,
}

impl LifecycleHandle {
    pub async fn send(&self, signal: Signal) -> Result<()> {
        self.signals.send(signal).await.map_err(|_| {
            DispatchError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "lifecycle controller has stopped",
            ))
        })
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.clone()
    }
}

pub fn listener_specs(general: &General) -> Vec<ListenerSpec> {
    vec![
        ListenerSpec::new(InboundKind::Socks5, general.socks_addr()),
        ListenerSpec::new(InboundKind::Http, general.http_addr()),
    ]
}

/// Sets the global log ceiling from `general.log-level`.
pub fn apply_log_level(general: &General) {
    let Some(level) = &general.log_level else {
        return;
    };
    match level.parse::<LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("[Lifecycle] ignoring unknown log-level {:?}", level),
    }
}

pub struct LifecycleController {
    source: Arc<dyn ConfigSource>,
    ciphers: Arc<CipherRegistry>,
    listeners: Arc<ListenerManager>,
    system_proxy: Arc<dyn SystemProxy>,
    /// Settings the running listeners were started with.
    general: General,
    signals: mpsc::Receiver<Signal>,
    state: watch::Sender<State>,
}

impl LifecycleController {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        ciphers: Arc<CipherRegistry>,
        listeners: Arc<ListenerManager>,
        system_proxy: Arc<dyn SystemProxy>,
    ) -> (Self, LifecycleHandle) {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
        let (state_tx, state_rx) = watch::channel(State::Stopped);
        let general = listeners.dispatcher().runtime().snapshot().general().clone();
        let controller = Self {
            source,
            ciphers,
            listeners,
            system_proxy,
            general,
            signals: signal_rx,
            state: state_tx,
        };
        let handle = LifecycleHandle {
            signals: signal_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    fn runtime(&self) -> &Arc<ProxyRuntime> {
        self.listeners.dispatcher().runtime()
    }

    fn set_state(&self, state: State) {
        info!("[Lifecycle] {}", state);
        self.state.send_replace(state);
    }

    /// Binds the listeners and enters `Running`.
    pub async fn start(&mut self) -> Result<()> {
        apply_log_level(&self.general);
        self.listeners.start(&listener_specs(&self.general)).await?;
        self.toggle_system_proxy(&self.general, true);
        self.set_state(State::Running);
        Ok(())
    }

    /// Handles signals one at a time until a shutdown or upgrade completes.
    /// A closed signal channel counts as a shutdown.
    pub async fn run(mut self) -> Exit {
        loop {
            match self.signals.recv().await {
                Some(Signal::Reload) => self.reload().await,
                Some(Signal::Upgrade(file)) => {
                    self.stop(true).await;
                    return Exit::Upgrade(file);
                }
                Some(Signal::Shutdown) | None => {
                    self.stop(false).await;
                    return Exit::Shutdown;
                }
            }
        }
    }

    /// The new snapshot is built while still `Running`; a config that fails
    /// to load or validate leaves listeners and snapshot untouched.
    async fn reload(&mut self) {
        let built = self
            .source
            .load()
            .and_then(|config| EngineSnapshot::build(&config, &self.ciphers));
        let snapshot = match built {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("[Lifecycle] reload rejected, keeping current config: {}", e);
                return;
            }
        };
        let general = snapshot.general().clone();

        self.set_state(State::Draining);
        self.listeners.stop().await;

        self.set_state(State::Reloading);
        self.runtime().install(snapshot);
        apply_log_level(&general);

        match self.listeners.start(&listener_specs(&general)).await {
            Ok(_) => {
                let previous = std::mem::replace(&mut self.general, general);
                self.toggle_system_proxy(&previous, false);
                self.toggle_system_proxy(&self.general, true);
            }
            Err(e) => {
                warn!(
                    "[Lifecycle] new listen addresses unusable ({}), restoring {} / {}",
                    e,
                    self.general.socks_addr(),
                    self.general.http_addr()
                );
                if let Err(e) = self.listeners.start(&listener_specs(&self.general)).await {
                    // Nothing is listening; stay out of Running until a later
                    // reload binds again.
                    error!("[Lifecycle] could not restore listeners: {}", e);
                    self.set_state(State::Draining);
                    return;
                }
            }
        }
        self.set_state(State::Running);
    }

    async fn stop(&mut self, upgrade: bool) {
        self.set_state(State::Draining);
        self.listeners.stop().await;
        if upgrade {
            self.set_state(State::Upgrading);
        }
        self.toggle_system_proxy(&self.general, false);
        self.runtime().retire();

        let timeout = self.general.drain_timeout();
        if !self.listeners.wait_idle(timeout).await {
            warn!(
                "[Lifecycle] {} session(s) still active after {:?}",
                self.listeners.active_sessions(),
                timeout
            );
        }
        log::logger().flush();
        self.set_state(State::Stopped);
    }

    /// Applies `enabled` to the addresses `general` advertises, when it
    /// manages the system proxy at all.
    fn toggle_system_proxy(&self, general: &General, enabled: bool) {
        if general.set_as_system_proxy != SystemProxyMode::Auto {
            return;
        }
        let entries = [
            (ProxyKind::Http, &general.http_interface, general.http_port),
            (ProxyKind::Https, &general.http_interface, general.http_port),
            (ProxyKind::Socks, &general.socks_interface, general.socks_port),
        ];
        for (kind, host, port) in entries {
            if let Err(e) = self.system_proxy.set_system_proxy(kind, enabled, host, port) {
                warn!("[Lifecycle] system proxy {:?} toggle failed: {}", kind, e);
            }
        }
    }
}
