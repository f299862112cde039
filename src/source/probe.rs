/// TCP liveness probe with a session-scoped memory of unreachable hosts
///
/// Opening a full database connection to a dead host can block for a long
/// time, so every remote attempt first tries a short connect. Hosts that fail
/// are remembered until `forget` is called.

use dashmap::DashSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

pub struct HostProbe {
    timeout: Duration,
    unreachable: DashSet<String>,
}

impl HostProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            unreachable: DashSet::new(),
        }
    }

    /// Check whether `host` ("name:port") accepts a TCP connection.
    ///
    /// A host that failed once is reported unreachable without another
    /// attempt.
    pub fn is_reachable(&self, host: &str) -> bool {
        if self.unreachable.contains(host) {
            debug!(host, "Skipping probe of host known to be unreachable");
            return false;
        }

        let reachable = self.connect(host);
        if !reachable {
            warn!(host, timeout_ms = self.timeout.as_millis() as u64, "Host unreachable");
            self.unreachable.insert(host.to_string());
        }
        reachable
    }

    fn connect(&self, host: &str) -> bool {
        let addrs = match host.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host, error = %e, "Could not resolve host");
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }

    /// Mark a host unreachable without probing it
    pub fn mark_unreachable(&self, host: &str) {
        self.unreachable.insert(host.to_string());
    }

    /// Allow a host to be probed again
    pub fn forget(&self, host: &str) -> bool {
        self.unreachable.remove(host).is_some()
    }

    pub fn is_known_unreachable(&self, host: &str) -> bool {
        self.unreachable.contains(host)
    }
}

impl std::fmt::Debug for HostProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProbe")
            .field("timeout", &self.timeout)
            .field("unreachable", &self.unreachable.len())
            .finish()
    }
}
