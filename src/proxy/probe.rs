//! Background health checks for `url-test` and `fallback` groups.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::{Position, Url};

use crate::error::{DispatchError, Result};
use crate::proxy::outbound::{self, NodeRef};
use crate::proxy::proxy_group::{Selector, Strategy};
use crate::proxy::target::TargetDescriptor;

const MIN_PROBE_TICK: Duration = Duration::from_secs(1);

/// Measures how long `node` takes to answer a `HEAD` for `url`.
///
/// For `https` URLs only the tunnel is established; no TLS is spoken.
pub async fn probe(node: &NodeRef, url: &str, timeout: Duration) -> Result<Duration> {
    let parsed =
        Url::parse(url).map_err(|e| DispatchError::config(format!("bad probe url {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| DispatchError::config(format!("probe url {url} has no host")))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| DispatchError::config(format!("probe url {url} has no port")))?;
    let target = TargetDescriptor::new(host, port);

    let started = Instant::now();
    let check = async {
        let mut stream = outbound::dial(Some(node), &target, timeout).await?;
        if parsed.scheme() == "http" {
            let request = format!(
                "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                &parsed[Position::BeforePath..Position::AfterQuery],
                target.host()
            );
            stream.write_all(request.as_bytes()).await?;
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await?;
            if &head != b"HTTP/" {
                return Err(DispatchError::Protocol("probe answer is not HTTP".into()));
            }
        }
        Ok::<(), DispatchError>(())
    };
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DispatchError::HandshakeTimeout {
            addr: target.to_string(),
        }),
    }
}

/// Probes every member that is due and feeds the outcome back to the selector.
pub async fn probe_round(selector: &Selector) {
    let due = selector.due_for_probe(Instant::now());
    if due.is_empty() {
        return;
    }
    let options = selector.options();
    let results = join_all(
        due.iter()
            .map(|node| probe(node, &options.probe_url, options.probe_timeout)),
    )
    .await;
    for (node, result) in due.iter().zip(results) {
        match result {
            Ok(latency) => {
                debug!(
                    "[Probe] {}/{}: {}ms",
                    selector.name(),
                    node.id(),
                    latency.as_millis()
                );
                selector.report_result(node.id(), true, Some(latency));
            }
            Err(e) => {
                debug!("[Probe] {}/{} failed: {}", selector.name(), node.id(), e);
                selector.report_result(node.id(), false, None);
            }
        }
    }
}

/// Runs probe rounds for `selector` until `token` is cancelled.
pub fn spawn_prober(selector: Arc<Selector>, token: CancellationToken) -> JoinHandle<()> {
    let options = selector.options();
    let period = match selector.strategy() {
        Strategy::Failover => options.cooldown.min(options.interval),
        _ => options.interval,
    }
    .max(MIN_PROBE_TICK);

    tokio::spawn(async move {
        info!(
            "[Probe] {} every {}s via {}",
            selector.name(),
            period.as_secs(),
            selector.options().probe_url
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => probe_round(&selector).await,
            }
        }
        debug!("[Probe] {} stopped", selector.name());
    })
}
