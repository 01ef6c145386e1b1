//! TCP reachability probing for background servers

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

/// Probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Connected on the given attempt (1-based)
    Healthy { attempt: u32 },
    /// Never connected; the server is still tracked
    Unhealthy { attempts: u32 },
    /// No port could be inferred, nothing probed
    NoPort,
}

impl HealthStatus {
    /// Connected at least once
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Polls `host:port` a bounded number of times
#[derive(Debug, Clone)]
pub struct HealthChecker {
    host: String,
    attempts: u32,
    delay: Duration,
    connect_timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            attempts: 3,
            delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl HealthChecker {
    /// Three probes, two seconds apart, on localhost
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override probe count and spacing
    #[must_use]
    pub fn with_schedule(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.delay = delay;
        self
    }

    /// Override the probed host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Wait `delay`, try to connect, repeat up to `attempts` times
    pub async fn probe(&self, port: Option<u16>) -> HealthStatus {
        let Some(port) = port else {
            return HealthStatus::NoPort;
        };
        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.delay).await;
            let connect = TcpStream::connect((self.host.as_str(), port));
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_)) => {
                    tracing::info!(port, attempt, "server healthy");
                    return HealthStatus::Healthy { attempt };
                }
                Ok(Err(e)) => tracing::debug!(port, attempt, error = %e, "health probe failed"),
                Err(_) => tracing::debug!(port, attempt, "health probe timed out"),
            }
        }
        tracing::warn!(port, attempts = self.attempts, "server never became reachable");
        HealthStatus::Unhealthy {
            attempts: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_on_first_attempt() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = HealthChecker::new().with_schedule(3, Duration::from_millis(5));
        assert_eq!(checker.probe(Some(port)).await, HealthStatus::Healthy { attempt: 1 });
    }

    #[tokio::test]
    async fn unhealthy_after_all_attempts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let checker = HealthChecker::new().with_schedule(3, Duration::from_millis(5));
        assert_eq!(checker.probe(Some(port)).await, HealthStatus::Unhealthy { attempts: 3 });
    }

    #[tokio::test]
    async fn no_port_skips_probing() {
        assert_eq!(HealthChecker::new().probe(None).await, HealthStatus::NoPort);
    }
}
