//! Live pool query: proxies that worked recently

use crate::database::{Database, ProxyFilter, ProxySort};
use crate::proxy::models::{Protocol, Proxy, ProxyStatus};
use crate::settings::Settings;
use crate::Result;
use chrono::Utc;
use std::collections::HashSet;

/// Optional narrowing of the live pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveQuery {
    /// Only these sources; `None` or an empty list means all of them
    pub sources: Option<Vec<String>>,
    pub protocol: Option<Protocol>,
    /// Keep one proxy per detected egress IP
    pub unique_ip: bool,
}

impl LiveQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_unique_ip(mut self, unique_ip: bool) -> Self {
        self.unique_ip = unique_ip;
        self
    }
}

/// OK proxies whose last success lies within the live window, ordered by URL.
pub async fn live_proxies(db: &Database, settings: &Settings, query: &LiveQuery) -> Result<Vec<Proxy>> {
    let mut filter = ProxyFilter::new()
        .status(ProxyStatus::Ok)
        .last_ok_after(settings.live_since(Utc::now()));
    if let Some(sources) = query.sources.as_ref().filter(|s| !s.is_empty()) {
        filter = filter.sources(sources.clone());
    }
    if let Some(protocol) = query.protocol {
        filter = filter.protocol(protocol);
    }

    let proxies = db.find_proxies(&filter, ProxySort::Url, None).await?;
    tracing::debug!(count = proxies.len(), unique_ip = query.unique_ip, "live proxies");

    if query.unique_ip {
        Ok(unique_by_ip(proxies))
    } else {
        Ok(proxies)
    }
}

/// First proxy per known egress IP. Proxies without a detected IP are kept.
pub fn unique_by_ip(proxies: Vec<Proxy>) -> Vec<Proxy> {
    let mut seen = HashSet::new();
    proxies
        .into_iter()
        .filter(|proxy| match &proxy.proxy_ip {
            Some(ip) => seen.insert(ip.clone()),
            None => true,
        })
        .collect()
}
