use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::events::Notification;
use crate::messages::DiscoveredDevice;

/// Gathers discover replies from the notification stream for a fixed window.
///
/// Devices are reported once each, in first-seen order; a later reply from
/// the same device replaces the earlier one.
#[derive(Debug)]
pub struct DiscoveryCollector {
    receiver: broadcast::Receiver<Notification>,
    window: Duration,
}

impl DiscoveryCollector {
    /// `receiver` must be subscribed before the discover broadcast is sent.
    pub fn new(receiver: broadcast::Receiver<Notification>, window: Duration) -> Self {
        Self { receiver, window }
    }

    /// Listens until the window closes. An empty result is not an error.
    pub async fn collect(mut self) -> Vec<DiscoveredDevice> {
        let deadline = Instant::now() + self.window;
        let mut devices: Vec<DiscoveredDevice> = Vec::new();

        loop {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Ok(Notification::DeviceDiscovered(device))) => {
                    debug!(address = %device.address, identifier = %device.identifier, "device discovered");
                    match devices.iter_mut().find(|d| d.address == device.address) {
                        Some(existing) => *existing = device,
                        None => devices.push(device),
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "discovery listener lagged behind notifications");
                }
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => break,
            }
        }

        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DeviceAddress, PowerState};

    fn discovered(ip: &str, state: PowerState) -> Notification {
        Notification::DeviceDiscovered(DiscoveredDevice {
            address: DeviceAddress::parse(ip, "ACCF23000001").unwrap(),
            identifier: "SOC002".into(),
            power_state: Some(state),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicates_by_address() {
        let (tx, rx) = broadcast::channel(16);
        let collector = DiscoveryCollector::new(rx, Duration::from_secs(1));
        tx.send(discovered("10.0.0.5", PowerState::Off)).unwrap();
        tx.send(discovered("10.0.0.6", PowerState::On)).unwrap();
        tx.send(discovered("10.0.0.5", PowerState::On)).unwrap();

        let devices = collector.collect().await;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address.ip.to_string(), "10.0.0.5");
        assert_eq!(devices[0].power_state, Some(PowerState::On));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_returns_nothing() {
        let (_tx, rx) = broadcast::channel::<Notification>(4);
        let devices = DiscoveryCollector::new(rx, Duration::from_millis(200))
            .collect()
            .await;
        assert!(devices.is_empty());
    }
}
