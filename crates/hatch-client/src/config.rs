//! Session configuration.

use hatch_core::Identity;
use hatch_core::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use serde::Deserialize;
use std::time::Duration;

/// How to reach the server and how long to wait on it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Identity to present; generated when absent.
    pub identity: Option<Identity>,
    /// Bound on connecting plus the hello/welcome exchange.
    pub handshake_timeout_ms: u64,
    /// Default bound for [`Session::receive_kind`](crate::Session::receive_kind)
    /// and [`Session::request`](crate::Session::request). `None` waits until
    /// the connection closes.
    pub receive_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            identity: None,
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            receive_timeout_ms: Some(10_000),
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout_ms = timeout.map(millis);
        self
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
