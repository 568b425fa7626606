//! Identity probes: ask "what is my IP" services through a proxy

use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// httpbin echo endpoint
pub const HTTPBIN_URL: &str = "https://httpbin.org/ip";

/// ipify JSON endpoint
pub const IPIFY_URL: &str = "https://api.ipify.org/?format=json";

/// Timeout for the direct own-IP lookup
const OWN_IP_TIMEOUT_SECS: u64 = 10;

/// A service reporting the caller's apparent public IP.
#[async_trait]
pub trait IdentityOracle: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Returns the public IP seen by the oracle. `proxy` routes the request
    /// through that proxy URL; `None` asks directly.
    async fn detect_ip(&self, proxy: Option<&str>, timeout: Duration) -> Result<String>;
}

/// Build a reqwest client, optionally routed through `proxy`
fn create_client(proxy: Option<&str>, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy_url) = proxy {
        // covers both http and socks5 proxies for https targets
        builder = builder.proxy(ReqwestProxy::all(proxy_url)?);
    }
    Ok(builder.build()?)
}

#[derive(Debug, Deserialize)]
struct HttpbinResponse {
    origin: String,
}

#[derive(Debug, Deserialize)]
struct IpifyResponse {
    ip: String,
}

/// httpbin.org `/ip`
#[derive(Debug, Clone)]
pub struct HttpbinOracle {
    url: String,
}

impl HttpbinOracle {
    pub fn new() -> Self {
        Self::with_url(HTTPBIN_URL)
    }

    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl Default for HttpbinOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityOracle for HttpbinOracle {
    fn name(&self) -> &str {
        "httpbin"
    }

    async fn detect_ip(&self, proxy: Option<&str>, timeout: Duration) -> Result<String> {
        let client = create_client(proxy, timeout)?;
        let body: HttpbinResponse = client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(first_origin(&body.origin))
    }
}

/// api.ipify.org
#[derive(Debug, Clone)]
pub struct IpifyOracle {
    url: String,
}

impl IpifyOracle {
    pub fn new() -> Self {
        Self::with_url(IPIFY_URL)
    }

    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl Default for IpifyOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityOracle for IpifyOracle {
    fn name(&self) -> &str {
        "ipify"
    }

    async fn detect_ip(&self, proxy: Option<&str>, timeout: Duration) -> Result<String> {
        let client = create_client(proxy, timeout)?;
        let body: IpifyResponse = client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.ip.trim().to_string())
    }
}

/// httpbin reports `client, proxy1, ...` when forwarding headers are added.
fn first_origin(origin: &str) -> String {
    origin.split(',').next().unwrap_or_default().trim().to_string()
}

/// The oracles used in production
pub fn default_oracles() -> Vec<Arc<dyn IdentityOracle>> {
    vec![
        Arc::new(HttpbinOracle::new()),
        Arc::new(IpifyOracle::new()),
    ]
}

/// Probe all `oracles` through `proxy_url` concurrently. The first non-empty
/// IP wins and the remaining probes are aborted. Every probe carries its own
/// `timeout`; `None` means every probe failed.
pub async fn race_probes(
    oracles: &[Arc<dyn IdentityOracle>],
    proxy_url: &str,
    timeout: Duration,
) -> Option<String> {
    let mut probes = JoinSet::new();
    for oracle in oracles {
        let oracle = Arc::clone(oracle);
        let proxy_url = proxy_url.to_string();
        probes.spawn(async move {
            let name = oracle.name().to_string();
            let result =
                tokio::time::timeout(timeout, oracle.detect_ip(Some(&proxy_url), timeout)).await;
            (name, result)
        });
    }

    let mut detected = None;
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((_, Ok(Ok(ip)))) if !ip.is_empty() => {
                detected = Some(ip);
                break;
            }
            Ok((name, Ok(Ok(_)))) => {
                tracing::debug!(oracle = %name, proxy = %proxy_url, "probe returned an empty ip");
            }
            Ok((name, Ok(Err(e)))) => {
                tracing::debug!(oracle = %name, proxy = %proxy_url, error = %e, "probe failed");
            }
            Ok((name, Err(_))) => {
                tracing::debug!(oracle = %name, proxy = %proxy_url, "probe timed out");
            }
            Err(e) => {
                tracing::debug!(proxy = %proxy_url, error = %e, "probe task failed");
            }
        }
    }

    // cancel the losers; their join errors are expected
    probes.shutdown().await;
    detected
}

/// Ask the oracles directly for this host's public IP. Oracles are tried in
/// order until one answers.
pub async fn lookup_own_ip(oracles: &[Arc<dyn IdentityOracle>]) -> Option<String> {
    let timeout = Duration::from_secs(OWN_IP_TIMEOUT_SECS);
    for oracle in oracles {
        match oracle.detect_ip(None, timeout).await {
            Ok(ip) if !ip.is_empty() => {
                tracing::info!(oracle = oracle.name(), ip = %ip, "detected own public ip");
                return Some(ip);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(oracle = oracle.name(), error = %e, "own ip lookup failed");
            }
        }
    }
    None
}
