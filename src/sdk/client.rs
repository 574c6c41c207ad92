use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::codec::Command;
use crate::config::{ClientConfig, ConfigError};
use crate::events::{CorrelationKey, EventDispatcher, Notification};
use crate::messages::{DeviceAddress, DiscoveredDevice, PowerState};
use crate::sdk::discovery::DiscoveryCollector;
use crate::session::{RetrySession, SessionError};
use crate::transport::{spawn_receiver, DatagramTransport, TransportError, UdpTransport};

/// Errors emitted by the high-level client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("request failed: {0}")]
    Session(#[from] SessionError),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::Session(SessionError::RequestTimeout { .. })
        )
    }
}

/// Client for Orvibo sockets on the local broadcast domain.
///
/// # Guarantees
/// * One receive task feeds every inbound datagram into the dispatcher; it is
///   aborted on `close()` or drop.
/// * Every request either resolves with the acknowledged state or fails with
///   a timeout after `request_timeout`.
/// * Any number of requests may be in flight concurrently; each only reacts
///   to acknowledgments that match its own device (and target state).
pub struct OrviboClient<T: DatagramTransport + 'static = UdpTransport> {
    transport: Arc<T>,
    dispatcher: Arc<EventDispatcher>,
    config: ClientConfig,
    receiver_handle: Option<JoinHandle<()>>,
}

impl OrviboClient<UdpTransport> {
    /// Binds a UDP socket per `config` (broadcast enabled) and starts receiving.
    pub async fn bind(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = UdpTransport::bind(&config).await?;
        Self::with_transport(transport, config)
    }
}

impl<T: DatagramTransport + 'static> OrviboClient<T> {
    /// Builds a client over any datagram transport. Must be called inside a
    /// tokio runtime.
    pub fn with_transport(transport: T, config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = Arc::new(transport);
        let dispatcher = Arc::new(EventDispatcher::new(config.notification_capacity));
        let receiver_handle = spawn_receiver(
            transport.clone(),
            dispatcher.clone(),
            config.max_datagram_size,
        );
        Ok(Self {
            transport,
            dispatcher,
            config,
            receiver_handle: Some(receiver_handle),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Receiver for `DeviceDiscovered`, `SubscribeAck` and `PowerStateAck`.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.dispatcher.subscribe()
    }

    /// Broadcasts one discover frame. Replies arrive as notifications; there
    /// is no retry and no timeout.
    pub async fn discover(&self) -> Result<(), ClientError> {
        let target = SocketAddr::new(
            IpAddr::V4(self.config.broadcast_addr),
            self.config.device_port,
        );
        info!(peer = %target, "broadcasting discover");
        self.transport
            .send_to(&Command::Discover.encode(), target)
            .await?;
        Ok(())
    }

    /// Broadcasts a discover frame and collects the replies seen within `window`.
    pub async fn discover_devices(
        &self,
        window: Duration,
    ) -> Result<Vec<DiscoveredDevice>, ClientError> {
        let collector = DiscoveryCollector::new(self.notifications(), window);
        self.discover().await?;
        Ok(collector.collect().await)
    }

    /// Subscribes to `device` and returns its current power state.
    pub async fn subscribe(&self, device: &DeviceAddress) -> Result<PowerState, ClientError> {
        info!(%device, "subscribing");
        let state = RetrySession::new(
            self.transport.as_ref(),
            &self.dispatcher,
            self.config.retry_policy(),
            self.device_target(device),
            Command::Subscribe { mac: device.mac },
            CorrelationKey::subscribe(*device),
        )
        .run()
        .await?;
        Ok(state)
    }

    /// Reads the power state by subscribing.
    pub async fn get_power_state(&self, device: &DeviceAddress) -> Result<PowerState, ClientError> {
        self.subscribe(device).await
    }

    /// Subscribes, then switches `device` to `desired` and waits until the
    /// device acknowledges exactly that state.
    pub async fn change_power_state(
        &self,
        device: &DeviceAddress,
        desired: PowerState,
    ) -> Result<PowerState, ClientError> {
        self.subscribe(device).await?;
        info!(%device, %desired, "changing power state");
        let state = RetrySession::new(
            self.transport.as_ref(),
            &self.dispatcher,
            self.config.retry_policy(),
            self.device_target(device),
            Command::ChangePowerState {
                mac: device.mac,
                state: desired,
            },
            CorrelationKey::power_state(*device, desired),
        )
        .run()
        .await?;
        Ok(state)
    }

    /// Stops the receive task.
    pub async fn close(mut self) {
        if let Some(handle) = self.receiver_handle.take() {
            handle.abort();
        }
    }

    fn device_target(&self, device: &DeviceAddress) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(device.ip), self.config.device_port)
    }
}

impl<T: DatagramTransport + 'static> Drop for OrviboClient<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver_handle.take() {
            handle.abort();
        }
    }
}
