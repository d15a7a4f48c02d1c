//! Happy-eyeballs address selection with a short-lived cache

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::NntpError;

/// Delay before the next candidate address gets its own connection attempt
const ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// How long a selected address is reused before resolving again
pub(crate) const ADDR_TTL: Duration = Duration::from_secs(300);

/// The endpoint last selected for a server
#[derive(Debug, Clone, Default)]
pub(crate) struct AddrCache {
    entry: Option<(SocketAddr, Instant)>,
}

impl AddrCache {
    /// Cached address, if still fresh
    pub fn get(&self, now: Instant) -> Option<SocketAddr> {
        self.entry
            .filter(|(_, at)| now.saturating_duration_since(*at) < ADDR_TTL)
            .map(|(addr, _)| addr)
    }

    pub fn set(&mut self, addr: SocketAddr, now: Instant) {
        self.entry = Some((addr, now));
    }

    /// Forget the address after a connect failure
    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// Alternate address families, IPv6 first, as in RFC 8305
fn interleave(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (mut v6, mut v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(SocketAddr::is_ipv6);
    v6.reverse();
    v4.reverse();
    let mut out = Vec::with_capacity(v6.len() + v4.len());
    loop {
        match (v6.pop(), v4.pop()) {
            (None, None) => break,
            (a, b) => out.extend(a.into_iter().chain(b)),
        }
    }
    out
}

/// Resolve `host` and return the address that accepts a TCP connection first
///
/// Attempts start [`ATTEMPT_DELAY`] apart and race each other; the whole
/// selection is bounded by `timeout`.
pub(crate) async fn happy_eyeballs(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<SocketAddr, NntpError> {
    let connect_error = |reason: String| NntpError::Connect {
        host: host.to_string(),
        port,
        reason,
    };

    let resolved: Vec<SocketAddr> = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| connect_error("address resolution timed out".into()))?
        .map_err(|e| connect_error(e.to_string()))?
        .collect();
    let candidates = interleave(resolved);
    if candidates.is_empty() {
        return Err(connect_error("no addresses found".into()));
    }
    if candidates.len() == 1 {
        return Ok(candidates[0]);
    }

    let race = async {
        let mut attempts = FuturesUnordered::new();
        for (i, addr) in candidates.iter().copied().enumerate() {
            attempts.push(async move {
                tokio::time::sleep(ATTEMPT_DELAY * i as u32).await;
                TcpStream::connect(addr).await.map(|_| addr)
            });
        }
        let mut last_error = None;
        while let Some(result) = attempts.next().await {
            match result {
                Ok(addr) => return Ok(addr),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        Err(connect_error(
            last_error.unwrap_or_else(|| "all connection attempts failed".into()),
        ))
    };

    let addr = tokio::time::timeout(timeout, race)
        .await
        .map_err(|_| connect_error("connection attempts timed out".into()))??;
    debug!(host, %addr, "selected address");
    Ok(addr)
}
