//! Source ingestion: turn source items and linked lists into proxy records
//!
//! This module provides functionality for:
//! - Collecting candidate URLs from a source's items and remote link
//! - Materializing them as proxy records, skipping already known URLs
//! - Picking the next due source for the scheduler
//! - Source management and TOML export/import

use crate::database::{Database, ProxyFilter};
use crate::error::Error;
use crate::proxy::models::{is_proxy_url, Proxy, ProxyKind, Source, SourceDefault};
use crate::proxy::parser::ProxyParser;
use crate::proxy::single_flight::{SingleFlight, TickOutcome};
use crate::Result;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for fetching a source link, in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = concat!("proxy-pool/", env!("CARGO_PKG_VERSION"));

/// Sources are re-ingested once their last check is this old
pub const SOURCE_RECHECK_AFTER_HOURS: i64 = 1;

/// Configuration for the source ingestor
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Timeout for fetching a source link
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl IngestorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SourcesFile<T> {
    #[serde(default = "Vec::new")]
    sources: Vec<T>,
}

/// Exported shape of a source, timestamps left out
#[derive(Debug, Serialize)]
struct SourceExport<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    items: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<&'a SourceDefault>,
}

/// Ingests candidate proxies from sources
pub struct SourceIngestor {
    db: Database,
    client: Client,
    flight: SingleFlight,
}

impl SourceIngestor {
    /// Create an ingestor with default configuration
    pub fn new(db: Database) -> Result<Self> {
        Self::with_config(db, IngestorConfig::default())
    }

    /// Create an ingestor with custom configuration
    pub fn with_config(db: Database, config: IngestorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            db,
            client,
            flight: SingleFlight::new(),
        })
    }

    /// Collect candidates of one source and store the new ones. Returns the
    /// number of candidates offered to the store, duplicates included.
    pub async fn check(&self, id: &str) -> Result<usize> {
        tracing::debug!(id, "check source");
        let source = self.db.get_source(id).await?;
        let mut urls = collect_item_urls(&source);

        if let (Some(link), Some(template)) = (&source.link, &source.default) {
            match self.fetch_link(link).await {
                Ok(body) => {
                    urls.extend(
                        ProxyParser::parse_string(&body)
                            .iter()
                            .map(|endpoint| endpoint.to_url(template)),
                    );
                }
                Err(e) => {
                    tracing::warn!(id, link = %link, error = %e, "failed to fetch source link");
                    self.db.set_source_checked_at(id, Utc::now()).await?;
                    return Ok(0);
                }
            }
        }

        let kind = source
            .default
            .as_ref()
            .map(|template| template.kind)
            .unwrap_or_default();
        let proxies = build_proxies(id, &urls, kind);

        if !proxies.is_empty() {
            let inserted = self.db.insert_proxies(&proxies).await?;
            tracing::info!(id, candidates = proxies.len(), inserted, "ingested source");
        }
        self.db.set_source_checked_at(id, Utc::now()).await?;

        Ok(proxies.len())
    }

    async fn fetch_link(&self, link: &str) -> Result<String> {
        let response = self.client.get(link).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Ingest the source that has waited longest, if any is due.
    pub async fn check_next(&self) -> Result<TickOutcome> {
        let Some(_guard) = self.flight.try_begin() else {
            return Ok(TickOutcome::Busy);
        };

        let cutoff = Utc::now() - ChronoDuration::hours(SOURCE_RECHECK_AFTER_HOURS);
        match self.db.find_due_source(cutoff).await? {
            Some(source) => Ok(TickOutcome::Ran(self.check(&source.id).await?)),
            None => Ok(TickOutcome::Idle),
        }
    }

    pub async fn create(&self, id: &str, link: Option<String>) -> Result<Source> {
        let source = Source::new(id, link);
        self.db.insert_source(&source).await?;
        tracing::info!(id, "created source");
        Ok(source)
    }

    pub async fn get(&self, id: &str) -> Result<Source> {
        self.db.get_source(id).await
    }

    pub async fn list(&self) -> Result<Vec<Source>> {
        self.db.find_sources().await
    }

    /// Delete a source together with all of its proxies.
    pub async fn delete(&self, id: &str) -> Result<u64> {
        let proxies = self.db.delete_proxies(&ProxyFilter::new().source(id)).await?;
        let deleted = self.db.delete_source(id).await?;
        tracing::info!(id, proxies, "deleted source");
        Ok(deleted)
    }

    /// Replace the items of a source with the entries of `text`, one per line.
    pub async fn set_items(&self, id: &str, text: &str) -> Result<Vec<String>> {
        let items = ProxyParser::parse_items(text);
        self.db.set_source_items(id, &items).await?;
        Ok(items)
    }

    pub async fn set_default(&self, id: &str, default: SourceDefault) -> Result<()> {
        self.db.set_source_default(id, Some(&default)).await
    }

    pub async fn clear_default(&self, id: &str) -> Result<()> {
        self.db.set_source_default(id, None).await
    }

    pub async fn clear_proxies(&self, id: &str) -> Result<u64> {
        self.db.delete_proxies(&ProxyFilter::new().source(id)).await
    }

    /// All sources as `[[sources]]` TOML tables
    pub async fn export_toml(&self) -> Result<String> {
        let sources = self.db.find_sources().await?;
        let file = SourcesFile {
            sources: sources
                .iter()
                .map(|s| SourceExport {
                    id: &s.id,
                    link: s.link.as_deref(),
                    items: &s.items,
                    default: s.default.as_ref(),
                })
                .collect(),
        };
        Ok(toml::to_string(&file)?)
    }

    /// Upsert every source of a TOML document produced by
    /// [`export_toml`](Self::export_toml). Nothing is written unless the
    /// whole document parses.
    pub async fn import_toml(&self, text: &str) -> Result<usize> {
        let file: SourcesFile<Source> =
            toml::from_str(text).map_err(|e| Error::InvalidImport(e.to_string()))?;
        for source in &file.sources {
            if source.id.trim().is_empty() {
                return Err(Error::InvalidImport("source id must not be empty".to_string()));
            }
        }

        for source in &file.sources {
            self.db.upsert_source(source).await?;
        }
        tracing::info!(count = file.sources.len(), "imported sources");
        Ok(file.sources.len())
    }
}

/// Full URLs are taken as is, anything else needs the source template.
fn collect_item_urls(source: &Source) -> Vec<String> {
    source
        .items
        .iter()
        .filter_map(|item| {
            if is_proxy_url(item) {
                Some(item.clone())
            } else {
                source.default.as_ref().map(|template| template.url(item, None))
            }
        })
        .collect()
}

/// Build proxy records, dropping candidates whose URL is unusable.
fn build_proxies(source_id: &str, urls: &[String], kind: ProxyKind) -> Vec<Proxy> {
    urls.iter()
        .filter_map(|url| match Proxy::new(source_id, url, kind) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                tracing::warn!(source = source_id, error = %e, "skipping proxy candidate");
                None
            }
        })
        .collect()
}
