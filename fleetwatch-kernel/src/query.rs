//! Read side exposed to the query layer
//!
//! Every read goes through the TTL cache. Keys are namespaced so that one
//! host's entries can be dropped with a single prefix invalidation:
//! - `latest`, `liveness`
//! - `host:{name}:history:{from_ms}:{to_ms}`, `host:{name}:users`

use crate::cache::TtlCache;
use crate::storage::{ServerSnapshot, Store, StoreError};
use chrono::{DateTime, Utc};
use fleetwatch_probe::UserActivity;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub mod keys {
    pub const LATEST: &str = "latest";
    pub const LIVENESS: &str = "liveness";

    pub fn host_prefix(host: &str) -> String {
        format!("host:{host}:")
    }

    pub fn history(host: &str, from_ms: i64, to_ms: i64) -> String {
        format!("host:{host}:history:{from_ms}:{to_ms}")
    }

    pub fn users(host: &str) -> String {
        format!("host:{host}:users")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostLiveness {
    pub host: String,
    pub last_collected: Option<DateTime<Utc>>,
    pub online: bool,
}

/// Cached value of one query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum QueryResult {
    Latest(Vec<ServerSnapshot>),
    History(Vec<ServerSnapshot>),
    Users(Vec<UserActivity>),
    Liveness(Vec<HostLiveness>),
}

pub type QueryCache = TtlCache<QueryResult>;

pub struct QueryService {
    store: Arc<dyn Store>,
    cache: Arc<QueryCache>,
    /// Hôtes configurés : listés même sans aucun enregistrement
    hosts: Vec<String>,
    liveness_threshold: Duration,
}

fn mismatch(key: &str) -> StoreError {
    StoreError::Fatal(format!("unexpected cached value under '{key}'"))
}

impl QueryService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<QueryCache>,
        hosts: Vec<String>,
        liveness_threshold: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            hosts,
            liveness_threshold,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Dernier échantillon de chaque hôte
    pub fn latest(&self) -> Result<Vec<ServerSnapshot>, StoreError> {
        let value = self.cache.get_or_fetch(keys::LATEST, || {
            self.store.latest_per_host().map(QueryResult::Latest)
        })?;
        match &*value {
            QueryResult::Latest(rows) => Ok(rows.clone()),
            _ => Err(mismatch(keys::LATEST)),
        }
    }

    pub fn history(
        &self,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ServerSnapshot>, StoreError> {
        let key = keys::history(host, from.timestamp_millis(), to.timestamp_millis());
        let value = self.cache.get_or_fetch(&key, || {
            self.store.history(host, from, to).map(QueryResult::History)
        })?;
        match &*value {
            QueryResult::History(rows) => Ok(rows.clone()),
            _ => Err(mismatch(&key)),
        }
    }

    pub fn users(&self, host: &str) -> Result<Vec<UserActivity>, StoreError> {
        let key = keys::users(host);
        let value = self
            .cache
            .get_or_fetch(&key, || self.store.latest_users(host).map(QueryResult::Users))?;
        match &*value {
            QueryResult::Users(rows) => Ok(rows.clone()),
            _ => Err(mismatch(&key)),
        }
    }

    pub fn liveness(&self) -> Result<Vec<HostLiveness>, StoreError> {
        let value = self.cache.get_or_fetch(keys::LIVENESS, || {
            self.liveness_at(Utc::now()).map(QueryResult::Liveness)
        })?;
        match &*value {
            QueryResult::Liveness(rows) => Ok(rows.clone()),
            _ => Err(mismatch(keys::LIVENESS)),
        }
    }

    /// Online = dernier enregistrement committé plus récent que le seuil
    pub fn liveness_at(&self, now: DateTime<Utc>) -> Result<Vec<HostLiveness>, StoreError> {
        let last = self.store.last_collected()?;
        let threshold = chrono::Duration::from_std(self.liveness_threshold)
            .unwrap_or(chrono::Duration::MAX);

        let names: BTreeSet<&str> = self
            .hosts
            .iter()
            .map(String::as_str)
            .chain(last.keys().map(String::as_str))
            .collect();

        Ok(names
            .into_iter()
            .map(|host| {
                let last_collected = last.get(host).copied();
                HostLiveness {
                    host: host.to_string(),
                    last_collected,
                    online: last_collected.is_some_and(|ts| now - ts < threshold),
                }
            })
            .collect())
    }
}
