//! Named client connections.

use std::collections::BTreeSet;

use parking_lot::RwLock;
use tracing::info;

use silt_core::{CoreError, CoreResult};

/// Alias every client starts with.
pub const DEFAULT_ALIAS: &str = "default";

/// Registry of connected aliases. Every collection operation checks its
/// alias here before touching any state.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    aliases: RwLock<BTreeSet<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `alias`. Connecting twice is a no-op.
    pub fn connect(&self, alias: &str) -> CoreResult<()> {
        if alias.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "connection alias cannot be empty".to_string(),
            ));
        }
        if self.aliases.write().insert(alias.to_string()) {
            info!(alias, "Connection created");
        }
        Ok(())
    }

    /// Removes `alias`; unknown aliases are ignored.
    pub fn remove_connection(&self, alias: &str) {
        if self.aliases.write().remove(alias) {
            info!(alias, "Connection removed");
        }
    }

    /// Connected aliases in name order.
    pub fn list_connections(&self) -> Vec<String> {
        self.aliases.read().iter().cloned().collect()
    }

    pub fn is_connected(&self, alias: &str) -> bool {
        self.aliases.read().contains(alias)
    }

    /// # Errors
    ///
    /// `NotConnected` when `alias` has no connection.
    pub fn ensure_connected(&self, alias: &str) -> CoreResult<()> {
        if self.is_connected(alias) {
            Ok(())
        } else {
            Err(CoreError::not_connected(alias))
        }
    }
}
