//! Proxy module for ingesting and validating proxies
//!
//! This module provides functionality for:
//! - Parsing proxy candidates from source items and fetched lists
//! - Probing proxies against identity oracles, racing them concurrently
//! - Recording check outcomes and evicting dead proxies
//! - Querying the live pool and computing pool statistics

pub mod checker;
pub mod ingestor;
pub mod live;
pub mod models;
pub mod parser;
pub mod rate_counter;
pub mod single_flight;
pub mod stats;
pub mod validator;

pub use checker::{default_oracles, HttpbinOracle, IdentityOracle, IpifyOracle};
pub use ingestor::{IngestorConfig, SourceIngestor};
pub use live::{live_proxies, LiveQuery};
pub use models::{
    CheckHistory, Protocol, Proxy, ProxyCheckOutcome, ProxyKind, ProxyStatus, Source,
    SourceDefault,
};
pub use parser::{ParsedEndpoint, ProxyParser};
pub use rate_counter::RateCounter;
pub use single_flight::{SingleFlight, TickOutcome};
pub use stats::{calc_stats, Count, Stats};
pub use validator::ProxyValidator;
