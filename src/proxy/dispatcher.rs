//! Turns one accepted connection into one routed upstream session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::config::{DIRECT, REJECT};
use crate::error::{DispatchError, Result};
use crate::proxy::mitm::{FlowAction, TlsInterceptor};
use crate::proxy::outbound::{self, AnyStream, NodeRef};
use crate::proxy::relay;
use crate::proxy::runtime::ProxyRuntime;
use crate::proxy::snapshot::{EngineSnapshot, Policy};
use crate::proxy::target::TargetDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Socks5,
    Http,
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Socks5 => "socks5",
            Self::Http => "http",
        })
    }
}

/// One proxied connection, owned by the task serving it.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub inbound: InboundKind,
    pub peer: SocketAddr,
    pub target: TargetDescriptor,
    pub policy: String,
    pub node: Option<Arc<NodeRef>>,
    pub started_at: Instant,
    /// Client to upstream.
    pub bytes_out: u64,
    /// Upstream to client.
    pub bytes_in: u64,
}

impl Session {
    /// Logs the end of the session with its byte counts.
    pub fn log_finished(&self, result: &Result<()>) {
        let elapsed = self.started_at.elapsed();
        match result {
            Ok(()) | Err(DispatchError::IdleTimeout) => info!(
                "[Session] #{} {} {} -> {} via {}: up {} B, down {} B, {:.1}s{}",
                self.id,
                self.inbound,
                self.peer,
                self.target,
                self.route_label(),
                self.bytes_out,
                self.bytes_in,
                elapsed.as_secs_f64(),
                if result.is_err() { " (idle)" } else { "" }
            ),
            Err(e) => warn!(
                "[Session] #{} {} -> {} via {} ended with error after up {} B, down {} B: {}",
                self.id,
                self.peer,
                self.target,
                self.route_label(),
                self.bytes_out,
                self.bytes_in,
                e
            ),
        }
    }

    fn route_label(&self) -> String {
        match &self.node {
            Some(node) if node.id() != self.policy => format!("{}/{}", self.policy, node.id()),
            _ => self.policy.clone(),
        }
    }
}

/// A session whose upstream is connected and ready to relay.
pub struct Route {
    pub session: Session,
    pub snapshot: Arc<EngineSnapshot>,
    pub upstream: AnyStream,
}

pub struct Dispatcher {
    runtime: Arc<ProxyRuntime>,
    interceptor: Option<Arc<dyn TlsInterceptor>>,
    next_session: AtomicU64,
}

impl Dispatcher {
    pub fn new(runtime: Arc<ProxyRuntime>) -> Self {
        Self {
            runtime,
            interceptor: None,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn TlsInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn runtime(&self) -> &Arc<ProxyRuntime> {
        &self.runtime
    }

    /// Rule match, node pick and dial, against the snapshot current right now.
    ///
    /// Dial outcomes are reported to the group that supplied the node; only
    /// failures attributable to the node count against it.
    pub async fn connect(
        &self,
        inbound: InboundKind,
        peer: SocketAddr,
        target: TargetDescriptor,
    ) -> Result<Route> {
        let snapshot = self.runtime.snapshot();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);

        let matched = snapshot
            .rules()
            .match_target(&target, snapshot.dns(), snapshot.geoip())
            .await?;
        let policy_name = matched.policy.to_string();
        let target = match matched.resolved_ip {
            Some(ip) => target.with_resolved_ip(ip),
            None => target,
        };

        let (group, node) = match snapshot.policy(&policy_name)? {
            Policy::Reject => {
                info!("[Dispatch] #{} {} {} -> {}", id, inbound, target, REJECT);
                return Err(DispatchError::PolicyRejected);
            }
            Policy::Direct => (None, None),
            Policy::Group(group) => {
                let node = group.pick()?;
                (Some(group), Some(node))
            }
        };

        debug!(
            "[Dispatch] #{} {} {} -> {} via {}",
            id,
            inbound,
            target,
            policy_name,
            node.as_ref().map_or(DIRECT, |n| n.id())
        );
        let dialed = outbound::dial(node.as_deref(), &target, snapshot.connect_timeout()).await;
        if let (Some(group), Some(node)) = (&group, &node) {
            match &dialed {
                Ok(_) => group.report_result(node.id(), true, None),
                Err(e) if e.is_node_failure() => group.report_result(node.id(), false, None),
                Err(_) => {}
            }
        }
        let upstream = dialed.inspect_err(|e| {
            warn!("[Dispatch] #{} {} via {} failed: {}", id, target, policy_name, e);
        })?;

        Ok(Route {
            session: Session {
                id,
                inbound,
                peer,
                target,
                policy: policy_name,
                node,
                started_at: Instant::now(),
                bytes_out: 0,
                bytes_in: 0,
            },
            snapshot,
            upstream,
        })
    }

    /// Hands a CONNECT client to the TLS interceptor when its host is flagged
    /// for interception; otherwise returns it unchanged.
    pub async fn prepare_client(
        &self,
        snapshot: &EngineSnapshot,
        target: &TargetDescriptor,
        client: AnyStream,
    ) -> Result<AnyStream> {
        let Some(interceptor) = &self.interceptor else {
            return Ok(client);
        };
        match snapshot.mitm().decide(target.host()) {
            FlowAction::Tunnel => Ok(client),
            FlowAction::Intercept => {
                debug!("[Dispatch] intercepting {}", target);
                interceptor.intercept(target, client).await
            }
        }
    }

    /// Relays until close, error or idle timeout and logs the finished session.
    pub async fn relay<C>(&self, route: Route, client: C) -> Session
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Route {
            mut session,
            snapshot,
            upstream,
        } = route;
        let outcome = relay::run(client, upstream, snapshot.idle_timeout()).await;
        session.bytes_out = outcome.a_to_b;
        session.bytes_in = outcome.b_to_a;
        session.log_finished(&outcome.result);
        session
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::cipher::CipherRegistry;
    use crate::proxy::snapshot::tests::ROUTING;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub(crate) fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    pub(crate) fn dispatcher(yaml: &str) -> Dispatcher {
        let config = Config::from_yaml(yaml).unwrap();
        let snapshot = EngineSnapshot::build(&config, &CipherRegistry::default()).unwrap();
        Dispatcher::new(Arc::new(ProxyRuntime::new(snapshot)))
    }

    /// Minimal HTTP CONNECT proxy that answers 200 and echoes.
    pub(crate) async fn connect_proxy() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    while !head.ends_with(b"\r\n\r\n") {
                        head.push(s.read_u8().await.unwrap());
                    }
                    s.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_reject_never_dials() {
        let d = dispatcher(ROUTING);
        let target = TargetDescriptor::new("ads.example.com", 443);
        let err = d.connect(InboundKind::Socks5, peer(), target).await.err().unwrap();
        assert!(matches!(err, DispatchError::PolicyRejected));
        assert_eq!(err.socks_reply(), 0x02);

        let sub = TargetDescriptor::new("tracker.ads.example.com", 80);
        let err = d.connect(InboundKind::Http, peer(), sub).await.err().unwrap();
        assert_eq!(err.http_status(), hyper::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_failover_switches_after_threshold() {
        let proxy = connect_proxy().await;
        let yaml = format!(
            r#"
proxies:
  - {{ name: NodeX, type: socks5, server: 127.0.0.1, port: 1 }}
  - {{ name: NodeY, type: http, server: 127.0.0.1, port: {} }}
proxy-groups:
  - {{ name: GroupA, type: fallback, proxies: [NodeX, NodeY], max-failed-times: 3, cooldown: 3600 }}
rules:
  - FINAL,GroupA
"#,
            proxy.port()
        );
        let d = dispatcher(&yaml);
        let target = || TargetDescriptor::new("example.com", 80);

        for _ in 0..3 {
            let err = d.connect(InboundKind::Socks5, peer(), target()).await.err().unwrap();
            assert!(err.is_node_failure());
        }
        for _ in 0..3 {
            let route = d.connect(InboundKind::Socks5, peer(), target()).await.unwrap();
            assert_eq!(route.session.node.as_ref().unwrap().id(), "NodeY");
            assert_eq!(route.session.policy, "GroupA");
        }
    }

    #[tokio::test]
    async fn test_node_closing_during_handshake_goes_dead() {
        let hangup = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hangup_port = hangup.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((s, _)) = hangup.accept().await {
                drop(s);
            }
        });
        let proxy = connect_proxy().await;
        let yaml = format!(
            r#"
proxies:
  - {{ name: NodeX, type: socks5, server: 127.0.0.1, port: {} }}
  - {{ name: NodeY, type: http, server: 127.0.0.1, port: {} }}
proxy-groups:
  - {{ name: GroupA, type: fallback, proxies: [NodeX, NodeY], max-failed-times: 3, cooldown: 3600 }}
rules:
  - FINAL,GroupA
"#,
            hangup_port,
            proxy.port()
        );
        let d = dispatcher(&yaml);
        let target = || TargetDescriptor::new("example.com", 80);

        for _ in 0..3 {
            let err = d.connect(InboundKind::Socks5, peer(), target()).await.err().unwrap();
            assert!(err.is_node_failure(), "{err:?}");
        }
        let status = d.runtime().snapshot().group("GroupA").unwrap().status();
        let node_x = status.members.iter().find(|m| m.name == "NodeX").unwrap();
        assert!(!node_x.alive);
        assert_eq!(node_x.consecutive_failures, 3);

        let route = d.connect(InboundKind::Socks5, peer(), target()).await.unwrap();
        assert_eq!(route.session.node.as_ref().unwrap().id(), "NodeY");
    }

    #[tokio::test]
    async fn test_direct_relay_counts_bytes() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
            w.shutdown().await.unwrap();
        });

        let d = dispatcher("rules: [\"FINAL,DIRECT\"]\n");
        let route = d
            .connect(InboundKind::Socks5, peer(), TargetDescriptor::from_socket_addr(echo_addr))
            .await
            .unwrap();
        assert!(route.session.node.is_none());

        let (mut client, relay_side) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move { d.relay(route, relay_side).await });
        client.write_all(b"hello relay").await.unwrap();
        client.shutdown().await.unwrap();
        let mut back = Vec::new();
        client.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"hello relay");

        let session = relay.await.unwrap();
        assert_eq!(session.bytes_out, 11);
        assert_eq!(session.bytes_in, 11);
    }

    #[tokio::test]
    async fn test_captured_snapshot_survives_install() {
        let d = dispatcher("rules: [\"FINAL,DIRECT\"]\n");
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = TargetDescriptor::from_socket_addr(echo.local_addr().unwrap());
        let route = d.connect(InboundKind::Http, peer(), target.clone()).await.unwrap();

        let config = Config::from_yaml("rules: [\"FINAL,REJECT\"]\n").unwrap();
        d.runtime()
            .install(EngineSnapshot::build(&config, &CipherRegistry::default()).unwrap());

        // The in-flight route still uses the snapshot it was dispatched on.
        assert_eq!(route.snapshot.rules().rules()[0].policy(), "DIRECT");
        let err = d.connect(InboundKind::Http, peer(), target).await.err().unwrap();
        assert!(matches!(err, DispatchError::PolicyRejected));
    }

    struct CountingInterceptor(AtomicUsize);

    #[async_trait]
    impl TlsInterceptor for CountingInterceptor {
        async fn intercept(
            &self,
            _target: &TargetDescriptor,
            client: AnyStream,
        ) -> Result<AnyStream> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(client)
        }
    }

    #[tokio::test]
    async fn test_interceptor_only_for_flagged_hosts() {
        let proxy = connect_proxy().await;
        let yaml = format!(
            r#"
proxies:
  - {{ name: up, type: http, server: 127.0.0.1, port: {} }}
proxy-groups:
  - {{ name: P, type: select, proxies: [up] }}
rules: ["FINAL,P"]
mitm:
  hosts: ["*.example.com"]
  exclude: ["bank.example.com"]
"#,
            proxy.port()
        );
        let interceptor = Arc::new(CountingInterceptor(AtomicUsize::new(0)));
        let d = dispatcher(&yaml).with_interceptor(interceptor.clone());

        for (host, expected) in [
            ("www.example.com", 1),
            ("bank.example.com", 1),
            ("other.org", 1),
            ("api.example.com", 2),
        ] {
            let route = d
                .connect(InboundKind::Http, peer(), TargetDescriptor::new(host, 443))
                .await
                .unwrap();
            let (client, _keep) = tokio::io::duplex(64);
            d.prepare_client(&route.snapshot, &route.session.target, Box::new(client))
                .await
                .unwrap();
            assert_eq!(interceptor.0.load(Ordering::SeqCst), expected, "{host}");
        }
    }
}
