//! HTTP proxy inbound: CONNECT tunnels and absolute-form forwarding.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::header::{CONNECTION, HOST, HeaderValue};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::proxy::dispatcher::{Dispatcher, InboundKind, Route};
use crate::proxy::mitm::HttpModifier;
use crate::proxy::relay::Meter;
use crate::proxy::target::TargetDescriptor;

const HOP_BY_HOP: [&str; 3] = ["proxy-connection", "proxy-authorization", "keep-alive"];

/// Work a request hands back to the task serving the client connection.
enum Handoff {
    /// A CONNECT answered 200, relayed once hyper releases the connection.
    Tunnel { upgrade: OnUpgrade, route: Route },
    /// The driver of a forwarded request's upstream connection.
    Upstream(BoxFuture<'static, ()>),
}

/// Serves one HTTP proxy client connection.
///
/// Upstream drivers of forwarded requests and CONNECT tunnels all run on
/// this task, so every session stays accounted to the caller.
pub async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    let (handoffs, mut pending) = mpsc::unbounded_channel();
    let mut tunnels = Vec::new();
    let mut upstreams = FuturesUnordered::new();

    let served = {
        let service = {
            let dispatcher = dispatcher.clone();
            service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                let handoffs = handoffs.clone();
                async move { Ok::<_, Infallible>(serve(req, peer, &dispatcher, &handoffs).await) }
            })
        };
        let connection = Http::new()
            .http1_only(true)
            .serve_connection(stream, service)
            .with_upgrades();
        tokio::pin!(connection);

        loop {
            tokio::select! {
                served = &mut connection => break served,
                Some(handoff) = pending.recv() => match handoff {
                    Handoff::Tunnel { upgrade, route } => tunnels.push((upgrade, route)),
                    Handoff::Upstream(driver) => upstreams.push(driver),
                },
                Some(()) = upstreams.next(), if !upstreams.is_empty() => {}
            }
        }
    };

    // No more requests: upstream drivers end on their own or go idle.
    while let Some(handoff) = pending.recv().await {
        match handoff {
            Handoff::Tunnel { upgrade, route } => tunnels.push((upgrade, route)),
            Handoff::Upstream(driver) => upstreams.push(driver),
        }
    }
    while upstreams.next().await.is_some() {}
    for (upgrade, route) in tunnels {
        let upgraded = upgrade
            .await
            .map_err(|e| DispatchError::Protocol(format!("CONNECT upgrade failed: {e}")))?;
        let client = dispatcher
            .prepare_client(&route.snapshot, &route.session.target, Box::new(upgraded))
            .await?;
        dispatcher.relay(route, client).await;
    }

    served.map_err(|e| DispatchError::Protocol(e.to_string()))
}

async fn serve(
    req: Request<Body>,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    handoffs: &mpsc::UnboundedSender<Handoff>,
) -> Response<Body> {
    if req.method() == Method::CONNECT {
        tunnel(req, peer, dispatcher, handoffs).await
    } else {
        forward(req, peer, dispatcher, handoffs).await
    }
}

async fn tunnel(
    mut req: Request<Body>,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    handoffs: &mpsc::UnboundedSender<Handoff>,
) -> Response<Body> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return status(StatusCode::BAD_REQUEST, "CONNECT needs host:port");
    };
    let target = match TargetDescriptor::parse_authority(&authority, Some(443)) {
        Ok(target) => target,
        Err(e) => return status(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let route = match dispatcher.connect(InboundKind::Http, peer, target).await {
        Ok(route) => route,
        Err(e) => return failure(&e),
    };

    let upgrade = hyper::upgrade::on(&mut req);
    if handoffs.send(Handoff::Tunnel { upgrade, route }).is_err() {
        return status(StatusCode::SERVICE_UNAVAILABLE, "connection closing");
    }
    Response::new(Body::empty())
}

async fn forward(
    mut req: Request<Body>,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    handoffs: &mpsc::UnboundedSender<Handoff>,
) -> Response<Body> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return status(StatusCode::BAD_REQUEST, "absolute-form request URI required");
    };
    let target = match TargetDescriptor::parse_authority(&authority, Some(80)) {
        Ok(target) => target,
        Err(e) => return status(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let origin_form: Uri = match req
        .uri()
        .path_and_query()
        .map_or("/", |p| p.as_str())
        .parse()
    {
        Ok(uri) => uri,
        Err(_) => return status(StatusCode::BAD_REQUEST, "bad request path"),
    };

    let Route {
        mut session,
        snapshot,
        upstream,
    } = match dispatcher.connect(InboundKind::Http, peer, target).await {
        Ok(route) => route,
        Err(e) => return failure(&e),
    };
    let id = session.id;
    let host = session.target.host().to_string();
    let label = format!("{} -> {} via {}", session.peer, session.target, session.policy);

    let headers = req.headers_mut();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, value);
        }
    }
    snapshot.rewrites().modify_request(&host, headers);
    *req.uri_mut() = origin_form;
    let method = req.method().clone();

    let idle = snapshot.idle_timeout();
    let meter = Meter::new();
    let (mut sender, conn) = match hyper::client::conn::handshake(meter.wrap(upstream)).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("[HTTP] #{} handshake with {} failed: {}", id, session.target, e);
            return closing(StatusCode::BAD_GATEWAY, "upstream handshake failed");
        }
    };
    let driver = {
        let meter = meter.clone();
        async move {
            let result = tokio::select! {
                r = conn => r.map_err(|e| DispatchError::Protocol(e.to_string())),
                _ = meter.idle(idle) => Err(DispatchError::IdleTimeout),
            };
            session.bytes_out = meter.bytes_written();
            session.bytes_in = meter.bytes_read();
            session.log_finished(&result);
        }
    };
    if handoffs.send(Handoff::Upstream(Box::pin(driver))).is_err() {
        return status(StatusCode::SERVICE_UNAVAILABLE, "connection closing");
    }

    let sent = tokio::select! {
        r = sender.send_request(req) => r.map_err(|e| DispatchError::Protocol(e.to_string())),
        _ = meter.idle(idle) => Err(DispatchError::IdleTimeout),
    };
    match sent {
        Ok(mut resp) => {
            snapshot.rewrites().modify_response(&host, resp.headers_mut());
            debug!("[HTTP] #{} {}: {} {}", id, label, method, resp.status());
            resp
        }
        Err(e) => {
            // The driver's own watchdog may have closed the upstream first.
            let e = if meter.quiet_for() >= idle {
                DispatchError::IdleTimeout
            } else {
                e
            };
            warn!("[HTTP] #{} {} {} failed: {}", id, label, method, e);
            closing(e.http_status(), &e.to_string())
        }
    }
}

fn failure(err: &DispatchError) -> Response<Body> {
    status(err.http_status(), &err.to_string())
}

fn status(code: StatusCode, message: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(format!("{message}\n")));
    *resp.status_mut() = code;
    resp
}

/// Like [`status`], and hyper closes the client connection after writing it.
fn closing(code: StatusCode, message: &str) -> Response<Body> {
    let mut resp = status(code, message);
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}
