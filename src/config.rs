use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::DEFAULT_PORT;
use crate::session::RetryPolicy;

/// Error produced when client configuration fails validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("resend interval must be greater than zero")]
    ZeroResendInterval,
    #[error("request timeout must not be shorter than the resend interval")]
    TimeoutShorterThanInterval,
    #[error("max datagram size must be greater than zero")]
    ZeroDatagramSize,
    #[error("notification capacity must be greater than zero")]
    ZeroNotificationCapacity,
}

/// Runtime settings for an [`crate::OrviboClient`].
///
/// The defaults match what the devices expect: everything on UDP port 10000,
/// discovery on the limited broadcast address, a resend every 500 ms and a
/// 10 s deadline per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local address the client socket binds to.
    pub local_addr: SocketAddr,
    /// Port command frames are sent to.
    pub device_port: u16,
    /// Destination of discover broadcasts.
    pub broadcast_addr: Ipv4Addr,
    pub resend_interval: Duration,
    pub request_timeout: Duration,
    /// Receive buffer size; longer datagrams are truncated by the socket.
    pub max_datagram_size: usize,
    /// Backlog kept per external notification listener.
    pub notification_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            device_port: DEFAULT_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            resend_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
            max_datagram_size: 1024,
            notification_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Rejects settings that would make a request resend in a busy loop or
    /// time out before its first resend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resend_interval.is_zero() {
            return Err(ConfigError::ZeroResendInterval);
        }
        if self.request_timeout < self.resend_interval {
            return Err(ConfigError::TimeoutShorterThanInterval);
        }
        if self.max_datagram_size == 0 {
            return Err(ConfigError::ZeroDatagramSize);
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::ZeroNotificationCapacity);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            resend_interval: self.resend_interval,
            timeout: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.local_addr.port(), 10000);
        assert_eq!(config.retry_policy().max_resends(), 20);
    }

    #[test]
    fn rejects_timeout_below_interval() {
        let config = ClientConfig::default()
            .with_resend_interval(Duration::from_secs(2))
            .with_request_timeout(Duration::from_secs(1));
        assert_eq!(
            config.validate(),
            Err(ConfigError::TimeoutShorterThanInterval)
        );
    }

    #[test]
    fn rejects_zero_interval() {
        let config = ClientConfig::default().with_resend_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroResendInterval));
    }

    #[test]
    fn serializes_with_serde() {
        let config = ClientConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
