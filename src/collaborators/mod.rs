//! External collaborators the engine talks to at its boundary.
//!
//! Transfers and loads are looked up by connection id; notifiers are
//! attached to tasks as failure callbacks.

mod load;
mod notify;
mod transfer;

pub use load::{BulkLoader, TableDirLoader};
pub use notify::{CommandNotifier, FailureNotice, LogNotifier, Notifier, NotifyError};
pub use transfer::{LocalTransfer, TransferClient};

use crate::config::{ConnectionConfig, Config};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Registry of collaborators available to a run.
#[derive(Clone, Default)]
pub struct Collaborators {
    transfers: HashMap<String, Arc<dyn TransferClient>>,
    loaders: HashMap<String, Arc<dyn BulkLoader>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer client under a connection id.
    pub fn with_transfer(mut self, connection: &str, client: Arc<dyn TransferClient>) -> Self {
        self.transfers.insert(connection.to_string(), client);
        self
    }

    /// Register a bulk loader under a connection id.
    pub fn with_loader(mut self, connection: &str, loader: Arc<dyn BulkLoader>) -> Self {
        self.loaders.insert(connection.to_string(), loader);
        self
    }

    pub fn transfer(&self, connection: &str) -> Option<Arc<dyn TransferClient>> {
        self.transfers.get(connection).cloned()
    }

    pub fn loader(&self, connection: &str) -> Option<Arc<dyn BulkLoader>> {
        self.loaders.get(connection).cloned()
    }

    /// Build collaborators for every connection declared in the config.
    pub fn from_config(config: &Config) -> Self {
        let mut collaborators = Self::new();
        for (id, connection) in &config.connections {
            collaborators = match connection {
                ConnectionConfig::Local { root } => {
                    collaborators.with_transfer(id, Arc::new(LocalTransfer::new(root)))
                }
                ConnectionConfig::TableDir { dir, delimiter } => {
                    collaborators.with_loader(id, Arc::new(TableDirLoader::new(dir, *delimiter)))
                }
            };
        }
        collaborators
    }

    /// Check that every connection id in `ids` is registered.
    pub fn ensure_connections<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for id in ids {
            if !self.transfers.contains_key(id) && !self.loaders.contains_key(id) {
                return Err(Error::UnknownConnection(id.to_string()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut transfers: Vec<_> = self.transfers.keys().collect();
        transfers.sort();
        let mut loaders: Vec<_> = self.loaders.keys().collect();
        loaders.sort();
        f.debug_struct("Collaborators")
            .field("transfers", &transfers)
            .field("loaders", &loaders)
            .finish()
    }
}

/// The failure notifier described by the config: a command hook when one is
/// configured, otherwise the log.
pub fn notifier_from_config(config: &Config) -> Arc<dyn Notifier> {
    match &config.notify.command {
        Some(command) => Arc::new(CommandNotifier::new(
            command,
            Duration::from_secs(config.engine.notify_timeout_secs),
        )),
        None => Arc::new(LogNotifier),
    }
}
