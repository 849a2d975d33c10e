//! Name resolution for workers.
//!
//! Workers are known by logical name only. A [`Directory`] turns that name
//! into a socket address right before each connect, so a worker that
//! restarted on a new host or port is found again on the next reconnect.

use async_trait::async_trait;
use core::time::Duration;
use pawnstorm_core::{
    Error, Result,
    catalog::{CatalogRecord, select_freshest},
};
use std::{collections::HashMap, net::SocketAddr};

#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolves a logical worker name to an address to connect to.
    async fn resolve(&self, name: &str) -> Result<SocketAddr>;
}

/// Looks workers up in the catalog's JSON record dump.
#[derive(Debug, Clone)]
pub struct CatalogDirectory {
    http: reqwest::Client,
    url: String,
    role: String,
}

impl CatalogDirectory {
    pub fn new(url: impl Into<String>, role: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DiscoveryUnavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            url: url.into(),
            role: role.into(),
        })
    }

    /// Fetches every record the catalog currently holds. Entries that do not
    /// look like catalog records are dropped.
    async fn fetch(&self) -> Result<Vec<CatalogRecord>> {
        let unavailable = |e: reqwest::Error| Error::DiscoveryUnavailable {
            reason: e.to_string(),
        };

        let raw: Vec<serde_json::Value> = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        let total = raw.len();
        let records: Vec<CatalogRecord> = raw
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        if records.len() < total {
            tracing::trace!(skipped = total - records.len(), "Ignored malformed catalog records");
        }
        Ok(records)
    }
}

#[async_trait]
impl Directory for CatalogDirectory {
    async fn resolve(&self, name: &str) -> Result<SocketAddr> {
        let records = self.fetch().await?;
        let not_found = || Error::WorkerNotFound {
            name: name.to_owned(),
        };

        let endpoint = select_freshest(&records, &self.role, name)
            .and_then(CatalogRecord::endpoint)
            .ok_or_else(not_found)?;
        tracing::debug!(worker = name, %endpoint, "Catalog lookup");

        lookup(name, &endpoint).await
    }
}

/// A fixed name to `host:port` table.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    endpoints: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new<I, N, E>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, E)>,
        N: Into<String>,
        E: Into<String>,
    {
        Self {
            endpoints: entries
                .into_iter()
                .map(|(name, endpoint)| (name.into(), endpoint.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve(&self, name: &str) -> Result<SocketAddr> {
        let endpoint = self
            .endpoints
            .get(name)
            .ok_or_else(|| Error::WorkerNotFound {
                name: name.to_owned(),
            })?;
        lookup(name, endpoint).await
    }
}

async fn lookup(name: &str, endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| Error::DiscoveryUnavailable {
            reason: format!("cannot resolve {endpoint} for {name}: {e}"),
        })?
        .next()
        .ok_or_else(|| Error::WorkerNotFound {
            name: name.to_owned(),
        })
}
