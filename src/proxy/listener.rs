//! Owns the inbound listen sockets and the tasks serving accepted connections.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{DispatchError, Result};
use crate::proxy::dispatcher::{Dispatcher, InboundKind};
use crate::proxy::{http, socks5};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub kind: InboundKind,
    pub addr: String,
}

impl ListenerSpec {
    pub fn new(kind: InboundKind, addr: impl Into<String>) -> Self {
        Self {
            kind,
            addr: addr.into(),
        }
    }
}

struct ActiveListeners {
    token: CancellationToken,
    accept_loops: Vec<JoinHandle<()>>,
    bound: Vec<(InboundKind, SocketAddr)>,
}

/// Starting binds every listener before any accept loop runs, so a failed
/// bind leaves nothing half-started. Stopping closes the listen sockets and
/// leaves in-flight sessions alone.
pub struct ListenerManager {
    dispatcher: Arc<Dispatcher>,
    sessions: TaskTracker,
    active: Mutex<Option<ActiveListeners>>,
}

impl ListenerManager {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            sessions: TaskTracker::new(),
            active: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn start(&self, specs: &[ListenerSpec]) -> Result<Vec<(InboundKind, SocketAddr)>> {
        if self.is_running() {
            return Err(DispatchError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "listeners already running",
            )));
        }

        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = TcpListener::bind(&spec.addr).await.map_err(|e| {
                error!("[Listener] bind {} ({}) failed: {}", spec.addr, spec.kind, e);
                DispatchError::Io(e)
            })?;
            let local = listener.local_addr()?;
            listeners.push((spec.kind, local, listener));
        }

        let token = CancellationToken::new();
        let mut accept_loops = Vec::with_capacity(listeners.len());
        let mut bound = Vec::with_capacity(listeners.len());
        for (kind, local, listener) in listeners {
            info!("[Listener] {} listening on {}", kind, local);
            accept_loops.push(tokio::spawn(accept_loop(
                listener,
                kind,
                self.dispatcher.clone(),
                self.sessions.clone(),
                token.child_token(),
            )));
            bound.push((kind, local));
        }

        *self.active.lock() = Some(ActiveListeners {
            token,
            accept_loops,
            bound: bound.clone(),
        });
        Ok(bound)
    }

    /// Closes the listen sockets and waits for the accept loops to exit.
    pub async fn stop(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };
        active.token.cancel();
        for handle in active.accept_loops {
            if let Err(e) = handle.await {
                warn!("[Listener] accept loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn bound_addrs(&self) -> Vec<(InboundKind, SocketAddr)> {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.bound.clone())
            .unwrap_or_default()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Waits up to `timeout` for in-flight sessions. Returns whether they all
    /// finished.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.sessions.close();
        let drained = tokio::time::timeout(timeout, self.sessions.wait())
            .await
            .is_ok();
        self.sessions.reopen();
        drained
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: InboundKind,
    dispatcher: Arc<Dispatcher>,
    sessions: TaskTracker,
    token: CancellationToken,
) {
    let local = listener.local_addr().ok();
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[Listener] {} accept error: {}", kind, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        stream.set_nodelay(true).ok();
        let dispatcher = dispatcher.clone();
        spawn_guarded(&sessions, format!("{kind} {peer}"), async move {
            let result = match kind {
                InboundKind::Socks5 => socks5::handle_client(stream, peer, dispatcher).await,
                InboundKind::Http => http::handle_client(stream, peer, dispatcher).await,
            };
            match result {
                Ok(()) | Err(DispatchError::PolicyRejected) => {}
                Err(e) => debug!("[{}] {}: {}", kind, peer, e),
            }
        });
    }
    drop(listener);
    info!(
        "[Listener] {} on {} closed",
        kind,
        local.map_or_else(|| "?".to_string(), |a| a.to_string())
    );
}

/// Runs one session in its own task. A panic is logged and only takes down
/// that session: its sockets are dropped while unwinding.
pub fn spawn_guarded<F>(tracker: &TaskTracker, label: String, session: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracker.spawn(async move {
        if let Err(panic) = AssertUnwindSafe(session).catch_unwind().await {
            error!("[Listener] session {} panicked: {}", label, panic_message(&*panic));
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dispatcher::tests::dispatcher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn manager() -> ListenerManager {
        ListenerManager::new(Arc::new(dispatcher("rules: [\"FINAL,DIRECT\"]\n")))
    }

    fn specs() -> Vec<ListenerSpec> {
        vec![
            ListenerSpec::new(InboundKind::Socks5, "127.0.0.1:0"),
            ListenerSpec::new(InboundKind::Http, "127.0.0.1:0"),
        ]
    }

    #[tokio::test]
    async fn test_stop_closes_listen_sockets() {
        let manager = manager();
        let bound = manager.start(&specs()).await.unwrap();
        assert_eq!(bound.len(), 2);
        assert!(manager.is_running());

        let socks = bound[0].1;
        let mut client = TcpStream::connect(socks).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        manager.stop().await;
        assert!(!manager.is_running());
        assert!(TcpStream::connect(socks).await.is_err());

        // Restart on fresh ports.
        let again = manager.start(&specs()).await.unwrap();
        assert_eq!(again.len(), 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failed_bind_starts_nothing() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_addr = taken.local_addr().unwrap().to_string();
        let manager = manager();
        let specs = vec![
            ListenerSpec::new(InboundKind::Socks5, "127.0.0.1:0"),
            ListenerSpec::new(InboundKind::Http, taken_addr),
        ];
        assert!(manager.start(&specs).await.is_err());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_panicking_session_is_contained() {
        let tracker = TaskTracker::new();
        let handle = spawn_guarded(&tracker, "boom".into(), async {
            panic!("session blew up");
        });
        handle.await.unwrap();

        let ok = spawn_guarded(&tracker, "fine".into(), async {});
        ok.await.unwrap();
        assert_eq!(panic_message(&"x"), "x");
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_on_stuck_session() {
        let manager = manager();
        let release = CancellationToken::new();
        let guard = release.clone();
        spawn_guarded(&manager.sessions, "stuck".into(), async move {
            guard.cancelled().await;
        });
        assert_eq!(manager.active_sessions(), 1);
        assert!(!manager.wait_idle(Duration::from_millis(50)).await);
        release.cancel();
        assert!(manager.wait_idle(Duration::from_secs(5)).await);
    }
}
