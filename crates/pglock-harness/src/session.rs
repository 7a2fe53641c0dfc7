//! Lock-engine adapters over a [`SimServer`].

use pglock_core::{Backend, BlockingSnapshot, Connection, SessionControl};
use pglock_error::Result;
use pglock_types::{BlockedLock, Pid, Rows, Statement};

use crate::server::SimServer;

/// One simulated session. Closing it (dropping) releases its locks.
#[derive(Debug)]
pub struct SimBackend {
    server: SimServer,
    pid: Pid,
}

impl SimBackend {
    pub fn new(server: &SimServer) -> Self {
        Self {
            server: server.clone(),
            pid: server.open_session(),
        }
    }

    pub const fn pid(&self) -> Pid {
        self.pid
    }

    pub const fn server(&self) -> &SimServer {
        &self.server
    }
}

impl Backend for SimBackend {
    fn execute(&mut self, statement: &Statement) -> Result<Rows> {
        self.server.execute(self.pid, statement)
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        self.server.close_session(self.pid);
    }
}

/// Catalog view and session control, as a watcher connection would have.
#[derive(Debug, Clone)]
pub struct SimCatalog {
    server: SimServer,
}

impl SimCatalog {
    pub fn new(server: &SimServer) -> Self {
        Self {
            server: server.clone(),
        }
    }
}

impl BlockingSnapshot for SimCatalog {
    fn blocked_locks(&mut self, pid: Pid) -> Result<Vec<BlockedLock>> {
        Ok(self.server.blocked_locks(pid))
    }
}

impl SessionControl for SimCatalog {
    fn terminate(&mut self, pids: &[Pid]) -> Result<Vec<Pid>> {
        Ok(pids
            .iter()
            .copied()
            .filter(|pid| self.server.terminate(*pid))
            .collect())
    }

    fn cancel(&mut self, pids: &[Pid]) -> Result<Vec<Pid>> {
        Ok(pids
            .iter()
            .copied()
            .filter(|pid| self.server.cancel(*pid))
            .collect())
    }
}

impl SimServer {
    /// Open a session wrapped in a lock-engine [`Connection`].
    pub fn connect(&self) -> Connection<SimBackend> {
        Connection::new(SimBackend::new(self))
    }

    pub fn catalog(&self) -> SimCatalog {
        SimCatalog::new(self)
    }
}
