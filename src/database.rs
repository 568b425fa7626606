//! SQLite-backed store for sources and proxies
//!
//! Each collection is a single table; nested values (`items`, the source
//! template, `check_history`) are JSON text and timestamps are unix
//! milliseconds. Every operation touches one record or runs one statement,
//! there are no cross-record transactions apart from bulk insert.

use crate::error::Error;
use crate::proxy::models::{
    CheckHistory, Protocol, Proxy, ProxyKind, ProxyStatus, Source, SourceDefault,
};
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::str::FromStr;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const SCHEMA: [&str; 8] = [
    r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY NOT NULL,
            link TEXT,
            default_template TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            checked_at INTEGER
        )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sources_checked_at ON sources (checked_at)",
    r#"
        CREATE TABLE IF NOT EXISTS proxies (
            id TEXT PRIMARY KEY NOT NULL,
            source TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            proxy_ip TEXT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            protocol TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            checked_at INTEGER,
            last_ok_at INTEGER,
            check_history TEXT NOT NULL DEFAULT '[]'
        )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_proxies_source ON proxies (source)",
    "CREATE INDEX IF NOT EXISTS idx_proxies_status ON proxies (status)",
    "CREATE INDEX IF NOT EXISTS idx_proxies_checked_at ON proxies (checked_at)",
    "CREATE INDEX IF NOT EXISTS idx_proxies_last_ok_at ON proxies (last_ok_at)",
    "CREATE INDEX IF NOT EXISTS idx_proxies_proxy_ip ON proxies (proxy_ip)",
];

const SOURCE_COLUMNS: &str = "id, link, default_template, items, created_at, checked_at";

const PROXY_COLUMNS: &str = "id, source, url, proxy_ip, kind, status, protocol, created_at, \
                             checked_at, last_ok_at, check_history";

/// Conditions over the proxies table. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyFilter {
    pub sources: Option<Vec<String>>,
    pub status: Option<ProxyStatus>,
    pub protocol: Option<Protocol>,
    pub never_checked: bool,
    pub checked_before: Option<DateTime<Utc>>,
    pub last_ok_after: Option<DateTime<Utc>>,
}

impl ProxyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: &str) -> Self {
        self.sources = Some(vec![source.to_string()]);
        self
    }

    pub fn sources(mut self, sources: Vec<String>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn status(mut self, status: ProxyStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn never_checked(mut self) -> Self {
        self.never_checked = true;
        self
    }

    pub fn checked_before(mut self, at: DateTime<Utc>) -> Self {
        self.checked_before = Some(at);
        self
    }

    pub fn last_ok_after(mut self, at: DateTime<Utc>) -> Self {
        self.last_ok_after = Some(at);
        self
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(sources) = &self.sources {
            if sources.is_empty() {
                qb.push(" AND 0 = 1");
            } else {
                qb.push(" AND source IN (");
                let mut separated = qb.separated(", ");
                for source in sources {
                    separated.push_bind(source.clone());
                }
                separated.push_unseparated(")");
            }
        }
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(protocol) = self.protocol {
            qb.push(" AND protocol = ").push_bind(protocol.to_string());
        }
        if self.never_checked {
            qb.push(" AND checked_at IS NULL");
        }
        if let Some(at) = self.checked_before {
            qb.push(" AND checked_at < ").push_bind(at.timestamp_millis());
        }
        if let Some(at) = self.last_ok_after {
            qb.push(" AND last_ok_at > ").push_bind(at.timestamp_millis());
        }
    }
}

/// Result ordering for proxy lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxySort {
    #[default]
    Unordered,
    /// Oldest check first, never checked before everything else
    CheckedAt,
    Url,
}

impl ProxySort {
    fn clause(&self) -> &'static str {
        match self {
            ProxySort::Unordered => "",
            ProxySort::CheckedAt => " ORDER BY checked_at ASC",
            ProxySort::Url => " ORDER BY url ASC",
        }
    }
}

/// Fields written by a proxy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCheckUpdate {
    pub status: ProxyStatus,
    pub checked_at: DateTime<Utc>,
    /// Left unchanged when `None`
    pub last_ok_at: Option<DateTime<Utc>>,
    /// Left unchanged when `None`
    pub proxy_ip: Option<String>,
    pub check_history: CheckHistory,
}

#[derive(Debug, FromRow)]
struct SourceRow {
    id: String,
    link: Option<String>,
    default_template: Option<String>,
    items: String,
    created_at: i64,
    checked_at: Option<i64>,
}

impl TryFrom<SourceRow> for Source {
    type Error = Error;

    fn try_from(row: SourceRow) -> Result<Self> {
        let default = match row.default_template {
            Some(json) => Some(serde_json::from_str::<SourceDefault>(&json)?),
            None => None,
        };
        Ok(Source {
            id: row.id,
            link: row.link,
            default,
            items: serde_json::from_str(&row.items)?,
            created_at: from_millis(row.created_at)?,
            checked_at: row.checked_at.map(from_millis).transpose()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProxyRow {
    id: String,
    source: String,
    url: String,
    proxy_ip: Option<String>,
    kind: String,
    status: String,
    protocol: String,
    created_at: i64,
    checked_at: Option<i64>,
    last_ok_at: Option<i64>,
    check_history: String,
}

impl TryFrom<ProxyRow> for Proxy {
    type Error = Error;

    fn try_from(row: ProxyRow) -> Result<Self> {
        Ok(Proxy {
            id: row.id,
            source: row.source,
            url: row.url,
            proxy_ip: row.proxy_ip,
            kind: ProxyKind::from_str(&row.kind).map_err(decode_error)?,
            status: ProxyStatus::from_str(&row.status).map_err(decode_error)?,
            protocol: Protocol::from_str(&row.protocol).map_err(decode_error)?,
            created_at: from_millis(row.created_at)?,
            checked_at: row.checked_at.map(from_millis).transpose()?,
            last_ok_at: row.last_ok_at.map(from_millis).transpose()?,
            check_history: serde_json::from_str(&row.check_history)?,
        })
    }
}

fn decode_error(message: String) -> Error {
    Error::Database(sqlx::Error::Decode(message.into()))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| decode_error(format!("timestamp out of range: {ms}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Document store over a SQLite pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `database_url`, creating the file and schema if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // every connection to :memory: is a separate database
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(DEFAULT_MAX_CONNECTIONS)
                .connect_with(options)
                .await?
        };

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Fresh private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Close every pooled connection; later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // Sources

    pub async fn insert_source(&self, source: &Source) -> Result<()> {
        let result = sqlx::query(
            r#"
                INSERT INTO sources (id, link, default_template, items, created_at, checked_at)
                VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.link)
        .bind(source.default.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&source.items)?)
        .bind(source.created_at.timestamp_millis())
        .bind(source.checked_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists {
                kind: "source",
                id: source.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or replace `link`, `default` and `items` of a source, keeping
    /// the timestamps of an existing record.
    pub async fn upsert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
                INSERT INTO sources (id, link, default_template, items, created_at, checked_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    link = excluded.link,
                    default_template = excluded.default_template,
                    items = excluded.items
            "#,
        )
        .bind(&source.id)
        .bind(&source.link)
        .bind(source.default.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&source.items)?)
        .bind(source.created_at.timestamp_millis())
        .bind(source.checked_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> Result<Source> {
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::source_not_found(id))?;
        row.try_into()
    }

    /// All sources ordered by id
    pub async fn find_sources(&self) -> Result<Vec<Source>> {
        sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Source::try_from)
        .collect()
    }

    /// The source with the oldest `checked_at` among those never checked or
    /// checked before `checked_before`.
    pub async fn find_due_source(&self, checked_before: DateTime<Utc>) -> Result<Option<Source>> {
        sqlx::query_as::<_, SourceRow>(&format!(
            r#"
                SELECT {SOURCE_COLUMNS} FROM sources
                WHERE checked_at IS NULL OR checked_at < ?
                ORDER BY checked_at ASC
                LIMIT 1
            "#
        ))
        .bind(checked_before.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?
        .map(Source::try_from)
        .transpose()
    }

    pub async fn set_source_items(&self, id: &str, items: &[String]) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET items = ? WHERE id = ?")
            .bind(serde_json::to_string(items)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_source_row(result.rows_affected(), id)
    }

    pub async fn set_source_default(&self, id: &str, default: Option<&SourceDefault>) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET default_template = ? WHERE id = ?")
            .bind(default.map(serde_json::to_string).transpose()?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_source_row(result.rows_affected(), id)
    }

    pub async fn set_source_checked_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET checked_at = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_source_row(result.rows_affected(), id)
    }

    pub async fn delete_source(&self, id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // Proxies

    /// Insert every proxy whose `url` is not stored yet. Rows hitting the
    /// unique url index are skipped. Returns the number of rows inserted.
    pub async fn insert_proxies(&self, proxies: &[Proxy]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for proxy in proxies {
            let result = sqlx::query(&format!(
                "INSERT OR IGNORE INTO proxies ({PROXY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&proxy.id)
            .bind(&proxy.source)
            .bind(&proxy.url)
            .bind(&proxy.proxy_ip)
            .bind(proxy.kind.to_string())
            .bind(proxy.status.to_string())
            .bind(proxy.protocol.to_string())
            .bind(proxy.created_at.timestamp_millis())
            .bind(proxy.checked_at.map(|t| t.timestamp_millis()))
            .bind(proxy.last_ok_at.map(|t| t.timestamp_millis()))
            .bind(serde_json::to_string(&proxy.check_history)?)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_proxy(&self, id: &str) -> Result<Proxy> {
        let row = sqlx::query_as::<_, ProxyRow>(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::proxy_not_found(id))?;
        row.try_into()
    }

    /// Apply a check result and return the updated record.
    pub async fn update_proxy_check(&self, id: &str, update: &ProxyCheckUpdate) -> Result<Proxy> {
        let result = sqlx::query(
            r#"
                UPDATE proxies SET
                    status = ?,
                    checked_at = ?,
                    last_ok_at = COALESCE(?, last_ok_at),
                    proxy_ip = COALESCE(?, proxy_ip),
                    check_history = ?
                WHERE id = ?
            "#,
        )
        .bind(update.status.to_string())
        .bind(update.checked_at.timestamp_millis())
        .bind(update.last_ok_at.map(|t| t.timestamp_millis()))
        .bind(&update.proxy_ip)
        .bind(serde_json::to_string(&update.check_history)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::proxy_not_found(id));
        }
        self.get_proxy(id).await
    }

    pub async fn delete_proxy(&self, id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_proxies(&self, filter: &ProxyFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM proxies");
        filter.push_where(&mut qb);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn find_proxies(
        &self,
        filter: &ProxyFilter,
        sort: ProxySort,
        limit: Option<usize>,
    ) -> Result<Vec<Proxy>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {PROXY_COLUMNS} FROM proxies"));
        filter.push_where(&mut qb);
        qb.push(sort.clause());
        if let Some(limit) = limit {
            qb.push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        qb.build_query_as::<ProxyRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Proxy::try_from)
            .collect()
    }

    pub async fn count_proxies(&self, filter: &ProxyFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM proxies");
        filter.push_where(&mut qb);
        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Distinct non-null `proxy_ip` values of the matching proxies
    pub async fn distinct_proxy_ips(&self, filter: &ProxyFilter) -> Result<Vec<String>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT proxy_ip FROM proxies");
        filter.push_where(&mut qb);
        qb.push(" AND proxy_ip IS NOT NULL ORDER BY proxy_ip ASC");
        Ok(qb
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?)
    }

    /// Put every proxy back into the never-checked state.
    pub async fn reset_proxy_statuses(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE proxies SET status = ?, checked_at = NULL, last_ok_at = NULL",
        )
        .bind(ProxyStatus::Unknown.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn expect_source_row(rows_affected: u64, id: &str) -> Result<()> {
    if rows_affected == 0 {
        Err(Error::source_not_found(id))
    } else {
        Ok(())
    }
}
