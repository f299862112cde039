/// Remote query source guarded by the liveness probe

use std::sync::Arc;
use tracing::{debug, info};

use super::probe::HostProbe;
use super::row::{RowSet, RowSource};
use crate::error::SourceError;

/// Wraps the connector for the relational store.
///
/// `host` is the address probed before each query. When it is `None` the
/// connector is trusted to fail fast on its own (in-process sources, tests).
pub struct RemoteSource {
    connector: Arc<dyn RowSource>,
    host: Option<String>,
    probe: Arc<HostProbe>,
}

impl RemoteSource {
    pub fn new(connector: Arc<dyn RowSource>, host: Option<String>, probe: Arc<HostProbe>) -> Self {
        Self {
            connector,
            host,
            probe,
        }
    }

    /// Probe the host without running a query
    pub fn is_reachable(&self) -> bool {
        match &self.host {
            Some(host) => self.probe.is_reachable(host),
            None => true,
        }
    }
}

impl RowSource for RemoteSource {
    fn name(&self) -> &str {
        self.connector.name()
    }

    fn execute(&self, query: &str) -> Result<RowSet, SourceError> {
        if let Some(host) = &self.host {
            if !self.probe.is_reachable(host) {
                return Err(SourceError::Unreachable(host.clone()));
            }
        }

        debug!(source = self.connector.name(), query, "Executing remote query");
        let rows = self.connector.execute(query)?;
        info!(source = self.connector.name(), rows = rows.len(), "Remote query complete");
        Ok(rows)
    }
}

impl std::fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSource")
            .field("source", &self.connector.name())
            .field("host", &self.host)
            .finish()
    }
}
