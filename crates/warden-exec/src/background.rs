//! Tracking of detached server processes

use parking_lot::Mutex;
use serde::Serialize;

use crate::health::HealthStatus;
use crate::runner::ServerProcess;

/// A tracked background server
pub struct TrackedServer {
    /// Command literal
    pub command: String,
    /// Probed port
    pub port: Option<u16>,
    /// Result of the startup probe
    pub health: HealthStatus,
    process: Box<dyn ServerProcess>,
}

impl std::fmt::Debug for TrackedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedServer")
            .field("command", &self.command)
            .field("port", &self.port)
            .field("health", &self.health)
            .field("pid", &self.process.id())
            .finish()
    }
}

/// Summary returned to callers; the process handle stays in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Command literal
    pub command: String,
    /// Probed port
    pub port: Option<u16>,
    /// Result of the startup probe
    pub health: HealthStatus,
}

/// Every server launched for a task, healthy or not
#[derive(Debug, Default)]
pub struct BackgroundProcesses {
    inner: Mutex<Vec<TrackedServer>>,
}

impl BackgroundProcesses {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a launched server
    pub fn track(
        &self,
        command: impl Into<String>,
        port: Option<u16>,
        health: HealthStatus,
        process: Box<dyn ServerProcess>,
    ) -> ServerInfo {
        let server = TrackedServer {
            command: command.into(),
            port,
            health,
            process,
        };
        let info = ServerInfo {
            command: server.command.clone(),
            port,
            health,
        };
        self.inner.lock().push(server);
        info
    }

    /// Number of tracked servers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Summaries of tracked servers
    #[must_use]
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.inner
            .lock()
            .iter()
            .map(|s| ServerInfo {
                command: s.command.clone(),
                port: s.port,
                health: s.health,
            })
            .collect()
    }

    /// Stop and forget every tracked server, returning how many were stopped
    pub async fn terminate_all(&self) -> usize {
        let servers = std::mem::take(&mut *self.inner.lock());
        let count = servers.len();
        for mut server in servers {
            tracing::info!(command = %server.command, port = ?server.port, "terminating background server");
            server.process.terminate().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ServerProcess for Counting {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn terminate(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn terminates_regardless_of_health() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let registry = BackgroundProcesses::new();
        registry.track("flask run", Some(5000), HealthStatus::Healthy { attempt: 1 }, Box::new(Counting(stopped.clone())));
        registry.track("vite", Some(5173), HealthStatus::Unhealthy { attempts: 3 }, Box::new(Counting(stopped.clone())));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.terminate_all().await, 2);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.terminate_all().await, 0);
    }
}
