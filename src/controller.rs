//! Admin HTTP API: group status, manual selection and lifecycle signals.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::lifecycle::{LifecycleHandle, Signal};
use crate::proxy::proxy_group::GroupStatus;
use crate::proxy::runtime::ProxyRuntime;

/// Binds the admin API on `addr` and serves it until `shutdown` fires.
pub fn spawn(
    addr: SocketAddr,
    runtime: Arc<ProxyRuntime>,
    lifecycle: LifecycleHandle,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let builder = Server::try_bind(&addr).map_err(|e| DispatchError::Io(io::Error::other(e)))?;

    let make_svc = make_service_fn(move |_| {
        let runtime = runtime.clone();
        let lifecycle = lifecycle.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(req, runtime.clone(), lifecycle.clone())
            }))
        }
    });

    let server = builder.serve(make_svc);
    let local = server.local_addr();
    info!("[Controller] listening on http://{}", local);
    let task = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = graceful.await {
            error!("[Controller] server error: {}", e);
        }
    });
    Ok((local, task))
}

async fn handle(
    req: Request<Body>,
    runtime: Arc<ProxyRuntime>,
    lifecycle: LifecycleHandle,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match (&method, path.as_str()) {
        (&Method::GET, "/proxies") => {
            let snapshot = runtime.snapshot();
            let mut body = String::new();
            for group in snapshot.groups() {
                render_group(&mut body, &group.status());
            }
            utf8_response(StatusCode::OK, body)
        }

        (&Method::PUT, p) if p.starts_with("/proxies/") => {
            select_member(&req, &p["/proxies/".len()..], &runtime)
        }

        (&Method::POST, "/reload") => enqueue(&lifecycle, Signal::Reload).await,
        (&Method::POST, "/shutdown") => enqueue(&lifecycle, Signal::Shutdown).await,
        (&Method::POST, "/upgrade") => match query_param(&req, "file") {
            Some(file) if !file.is_empty() => {
                enqueue(&lifecycle, Signal::Upgrade(PathBuf::from(file))).await
            }
            _ => utf8_response(StatusCode::BAD_REQUEST, "Missing ?file=<path>\n"),
        },

        _ => utf8_response(StatusCode::NOT_FOUND, "Not Found\n"),
    };
    Ok(response)
}

fn render_group(out: &mut String, status: &GroupStatus) {
    let _ = writeln!(
        out,
        "{} ({}) -> {}",
        status.name,
        status.strategy,
        status.active.as_deref().unwrap_or("-")
    );
    for member in &status.members {
        let marker = if status.active.as_deref() == Some(member.name.as_str()) {
            '*'
        } else {
            ' '
        };
        let health = match (member.alive, member.latency) {
            (false, _) => format!("dead ({} failures)", member.consecutive_failures),
            (true, Some(latency)) => format!("alive {}ms", latency.as_millis()),
            (true, None) => "alive".to_string(),
        };
        let _ = writeln!(out, "  {} {} {}", marker, member.name, health);
    }
}

fn select_member(req: &Request<Body>, raw_group: &str, runtime: &ProxyRuntime) -> Response<Body> {
    let group_name = match urlencoding::decode(raw_group) {
        Ok(name) => name.into_owned(),
        Err(_) => return utf8_response(StatusCode::BAD_REQUEST, "Bad group name\n"),
    };
    let Some(member) = query_param(req, "name") else {
        return utf8_response(StatusCode::BAD_REQUEST, "Missing ?name=<member>\n");
    };
    let snapshot = runtime.snapshot();
    let Some(group) = snapshot.group(&group_name) else {
        return utf8_response(StatusCode::NOT_FOUND, "No such group\n");
    };
    match group.select(&member) {
        Ok(()) => {
            info!("[Controller] {} switched to {}", group_name, member);
            utf8_response(StatusCode::OK, format!("Switched {group_name} to {member}\n"))
        }
        Err(e) => utf8_response(StatusCode::BAD_REQUEST, format!("{e}\n")),
    }
}

async fn enqueue(lifecycle: &LifecycleHandle, signal: Signal) -> Response<Body> {
    let label = format!("{signal:?}");
    match lifecycle.send(signal).await {
        Ok(()) => {
            info!("[Controller] queued {}", label);
            utf8_response(StatusCode::ACCEPTED, format!("{label} queued\n"))
        }
        Err(e) => utf8_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")),
    }
}

fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn utf8_response(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    let mut resp = Response::new(Body::from(text.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
