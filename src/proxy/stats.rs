//! Pool statistics

use crate::database::{Database, ProxyFilter};
use crate::proxy::models::ProxyStatus;
use crate::settings::Settings;
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

/// Totals for one scope of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Count {
    pub all: u64,
    pub ok: u64,
    pub live: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Distinct detected egress IPs across the whole pool
    pub all: Count,
    /// Proxy records per source id
    pub sources: BTreeMap<String, Count>,
}

/// Count the pool overall and per source. "live" uses the live window of
/// `settings`.
pub async fn calc_stats(db: &Database, settings: &Settings) -> Result<Stats> {
    let live_after = settings.live_since(Utc::now());
    let all_filter = ProxyFilter::new();
    let ok_filter = ProxyFilter::new().status(ProxyStatus::Ok);
    let live_filter = ok_filter.clone().last_ok_after(live_after);

    let all = Count {
        all: distinct_ips(db, &all_filter).await?,
        ok: distinct_ips(db, &ok_filter).await?,
        live: distinct_ips(db, &live_filter).await?,
    };

    let mut sources = BTreeMap::new();
    for source in db.find_sources().await? {
        let count = Count {
            all: db.count_proxies(&all_filter.clone().source(&source.id)).await?,
            ok: db.count_proxies(&ok_filter.clone().source(&source.id)).await?,
            live: db.count_proxies(&live_filter.clone().source(&source.id)).await?,
        };
        sources.insert(source.id, count);
    }

    Ok(Stats { all, sources })
}

async fn distinct_ips(db: &Database, filter: &ProxyFilter) -> Result<u64> {
    Ok(db.distinct_proxy_ips(filter).await?.len() as u64)
}
