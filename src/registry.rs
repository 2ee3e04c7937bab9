use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;

use crate::client::Client;
use crate::config::{DbConfig, RegistryConfig};
use crate::error::SqlRegistryError;
use crate::factory;
use crate::scope::Scope;

#[derive(Debug, Default)]
struct Entries {
    configs: HashMap<String, Arc<DbConfig>>,
    clients: HashMap<String, Arc<Client>>,
}

/// Named database clients, each built at most once and on first use.
///
/// The registry is an ordinary value: create one at startup, share it by reference or
/// `Arc`, and call [`Registry::close_all`] at shutdown.
///
/// ```rust,no_run
/// # use sql_registry::prelude::*;
/// # async fn demo() -> Result<(), SqlRegistryError> {
/// let registry = Registry::new();
/// registry.register("main", DbConfig::sqlite("/var/lib/app/main.db")).await?;
/// let client = registry.get("main").await?;
/// client.exec(&Scope::new(), "DELETE FROM sessions", &[]).await?;
/// registry.close_all().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<Entries>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `config` under `name` and build its client immediately.
    ///
    /// The configuration is validated before anything is built. If construction fails
    /// the configuration stays stored, so a later [`Registry::get`] retries. A client
    /// already registered under `name` is replaced but not closed. When its replacement
    /// fails to build it is removed as well: lookups then build from the new
    /// configuration, while callers already holding the old handle keep using it.
    ///
    /// # Errors
    /// [`SqlRegistryError::ConfigError`] for an invalid configuration (fatal),
    /// [`SqlRegistryError::ConnectError`] if the client cannot be built.
    pub async fn register(&self, name: &str, config: DbConfig) -> Result<(), SqlRegistryError> {
        let config = match config.with_defaults() {
            Ok(config) => Arc::new(config),
            Err(e) => {
                tracing::error!(db = name, error = %e, "rejected database configuration");
                return Err(e);
            }
        };

        let mut entries = self.entries.write().await;
        entries
            .configs
            .insert(name.to_owned(), Arc::clone(&config));
        let client = match construct(name, config).await {
            Ok(client) => client,
            Err(e) => {
                if entries.clients.remove(name).is_some() {
                    tracing::warn!(
                        db = name,
                        "replacement failed to build; dropped the previous handle from the registry"
                    );
                }
                return Err(e);
            }
        };
        if let Some(old) = entries.clients.insert(name.to_owned(), client) {
            tracing::warn!(
                db = name,
                "registered over a live handle; the previous handle stays open until its last user drops it"
            );
            drop(old);
        }
        tracing::info!(db = name, "database registered");
        Ok(())
    }

    /// Register every entry of a loaded configuration file, in name order.
    ///
    /// # Errors
    /// Stops at the first entry that fails, as [`Registry::register`].
    pub async fn register_all(&self, config: &RegistryConfig) -> Result<(), SqlRegistryError> {
        for (name, db) in &config.databases {
            self.register(name, db.clone()).await?;
        }
        Ok(())
    }

    /// The client for `name`, built now if it does not exist yet.
    ///
    /// Concurrent first calls build one client; all callers receive the same `Arc`.
    /// Failed builds are not cached.
    ///
    /// # Errors
    /// [`SqlRegistryError::NotRegistered`] if no configuration was stored,
    /// [`SqlRegistryError::ConnectError`] if the client cannot be built.
    pub async fn get(&self, name: &str) -> Result<Arc<Client>, SqlRegistryError> {
        if let Some(client) = self.entries.read().await.clients.get(name) {
            tracing::trace!(db = name, "registry fast path");
            return Ok(Arc::clone(client));
        }

        let mut entries = self.entries.write().await;
        if let Some(client) = entries.clients.get(name) {
            return Ok(Arc::clone(client));
        }
        let config = entries
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| SqlRegistryError::NotRegistered(name.to_owned()))?;
        let client = construct(name, config).await?;
        entries
            .clients
            .insert(name.to_owned(), Arc::clone(&client));
        Ok(client)
    }

    /// Close and forget every live client. Configurations are kept, so a later
    /// [`Registry::get`] builds a fresh client.
    ///
    /// # Errors
    /// Currently always succeeds.
    pub async fn close_all(&self) -> Result<(), SqlRegistryError> {
        let mut entries = self.entries.write().await;
        let count = entries.clients.len();
        for (_, client) in entries.clients.drain() {
            client.close();
        }
        tracing::info!(closed = count, "closed all database handles");
        Ok(())
    }

    /// Ping every live client within its exec budget.
    ///
    /// Failures are logged and reported; nothing is evicted.
    pub async fn health_check(&self) -> HealthReport {
        let (clients, mut unconstructed) = {
            let entries = self.entries.read().await;
            let clients: Vec<Arc<Client>> = entries.clients.values().cloned().collect();
            let unconstructed: Vec<String> = entries
                .configs
                .keys()
                .filter(|name| !entries.clients.contains_key(*name))
                .cloned()
                .collect();
            (clients, unconstructed)
        };

        let mut checked = join_all(clients.iter().map(|client| async move {
            let res = client.ping(&Scope::new()).await;
            if let Err(e) = &res {
                tracing::warn!(db = client.name(), error = %e, "health check ping failed");
            }
            HealthStatus {
                name: client.name().to_owned(),
                error: res.err(),
            }
        }))
        .await;
        checked.sort_by(|a, b| a.name.cmp(&b.name));
        unconstructed.sort();
        for name in &unconstructed {
            tracing::warn!(db = %name, "registered database has no live handle");
        }

        HealthReport {
            checked,
            unconstructed,
        }
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` currently has a live client.
    pub async fn is_constructed(&self, name: &str) -> bool {
        self.entries.read().await.clients.contains_key(name)
    }

    /// The stored configuration for `name`, defaults applied.
    pub async fn config(&self, name: &str) -> Option<Arc<DbConfig>> {
        self.entries.read().await.configs.get(name).cloned()
    }
}

async fn construct(name: &str, config: Arc<DbConfig>) -> Result<Arc<Client>, SqlRegistryError> {
    match factory::connect(name, &config).await {
        Ok(pool) => Ok(Arc::new(Client::new(name, config, pool))),
        Err(e) => {
            tracing::warn!(db = name, error = %e, "could not construct database handle");
            Err(e)
        }
    }
}

/// Outcome of pinging one client.
#[derive(Debug)]
pub struct HealthStatus {
    pub name: String,
    /// `None` when the ping succeeded.
    pub error: Option<SqlRegistryError>,
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct HealthReport {
    /// One entry per live client, sorted by name.
    pub checked: Vec<HealthStatus>,
    /// Registered names without a live client (never built, or closed).
    pub unconstructed: Vec<String>,
}

impl HealthReport {
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.checked.iter().filter(|s| s.is_healthy()).count()
    }

    /// Every registered name has a live client and answered its ping.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.unconstructed.is_empty() && self.checked.iter().all(HealthStatus::is_healthy)
    }
}
