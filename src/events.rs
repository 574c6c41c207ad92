//! Event dispatcher.
//!
//! Classifies decoded frames into [`Notification`]s, resolves every pending
//! request whose [`CorrelationKey`] matches exactly, and fans the notification
//! out to external listeners. Pending requests live in a table owned by the
//! dispatcher; a [`Registration`] removes its entry when dropped, so both the
//! resolved and the timed-out path release it.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::codec::{self, DecodedFrame};
use crate::messages::{DeviceAddress, DiscoveredDevice, PowerState};

/// Typed notification published for every classified device reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    DeviceDiscovered(DiscoveredDevice),
    SubscribeAck {
        address: DeviceAddress,
        state: PowerState,
    },
    PowerStateAck {
        address: DeviceAddress,
        state: PowerState,
    },
}

/// Acknowledgment kinds a pending request can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Subscribe,
    PowerState,
}

/// What a pending request waits for: an ack kind from one device, optionally
/// reporting one specific state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub kind: AckKind,
    pub address: DeviceAddress,
    pub expected: Option<PowerState>,
}

impl CorrelationKey {
    pub fn subscribe(address: DeviceAddress) -> Self {
        Self {
            kind: AckKind::Subscribe,
            address,
            expected: None,
        }
    }

    pub fn power_state(address: DeviceAddress, expected: PowerState) -> Self {
        Self {
            kind: AckKind::PowerState,
            address,
            expected: Some(expected),
        }
    }

    /// Returns the carried state when `notification` answers this key.
    pub fn matches(&self, notification: &Notification) -> Option<PowerState> {
        let (kind, address, state) = match notification {
            Notification::DeviceDiscovered(_) => return None,
            Notification::SubscribeAck { address, state } => (AckKind::Subscribe, address, state),
            Notification::PowerStateAck { address, state } => {
                (AckKind::PowerState, address, state)
            }
        };
        if kind != self.kind || *address != self.address {
            return None;
        }
        match self.expected {
            Some(expected) if expected != *state => None,
            _ => Some(*state),
        }
    }
}

struct PendingEntry {
    key: CorrelationKey,
    resolver: oneshot::Sender<PowerState>,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, PendingEntry>,
}

/// Routes decoded frames to pending requests and external listeners.
pub struct EventDispatcher {
    pending: Mutex<PendingTable>,
    notifications: broadcast::Sender<Notification>,
}

impl EventDispatcher {
    /// `capacity` bounds the backlog kept for slow external listeners.
    pub fn new(capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(capacity.max(1));
        Self {
            pending: Mutex::new(PendingTable::default()),
            notifications,
        }
    }

    /// Adds a pending request for `key`. The entry stays until it is resolved
    /// by a matching notification or the returned guard is dropped.
    pub fn register(&self, key: CorrelationKey) -> Registration<'_> {
        let (resolver, receiver) = oneshot::channel();
        let mut table = self.pending.lock();
        let id = table.next_id;
        table.next_id = table.next_id.wrapping_add(1);
        table.entries.insert(id, PendingEntry { key, resolver });
        trace!(id, ?key, "pending request registered");
        Registration {
            dispatcher: self,
            id,
            receiver,
        }
    }

    /// Number of requests still waiting for an acknowledgment.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// New receiver for every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Decodes one datagram and publishes it. Malformed datagrams are logged
    /// and dropped.
    pub fn dispatch_datagram(&self, bytes: &[u8], from: SocketAddr) -> Option<Notification> {
        let sender = match from.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => ip,
                None => {
                    debug!(%from, "ignoring datagram from ipv6 sender");
                    return None;
                }
            },
        };
        match codec::decode(bytes, sender) {
            Ok(frame) => self.publish(frame),
            Err(err) => {
                warn!(%from, error = %err, "dropping malformed datagram");
                None
            }
        }
    }

    /// Classifies `frame`, resolves every matching pending request and
    /// broadcasts the notification. Frames that are not device replies
    /// produce no notification.
    pub fn publish(&self, frame: DecodedFrame) -> Option<Notification> {
        let notification = match frame {
            DecodedFrame::DiscoverReply(device) => Notification::DeviceDiscovered(device),
            DecodedFrame::SubscribeReply { address, state } => {
                Notification::SubscribeAck { address, state }
            }
            DecodedFrame::PowerStateReply { address, state } => {
                Notification::PowerStateAck { address, state }
            }
            other => {
                trace!(opcode = ?other.opcode(), "frame not classified");
                return None;
            }
        };

        self.resolve_matching(&notification);
        // No external listener is not an error.
        let _ = self.notifications.send(notification.clone());
        Some(notification)
    }

    fn resolve_matching(&self, notification: &Notification) {
        let mut table = self.pending.lock();
        let matched: Vec<(u64, PowerState)> = table
            .entries
            .iter()
            .filter_map(|(id, entry)| entry.key.matches(notification).map(|state| (*id, state)))
            .collect();

        if matched.is_empty() && !matches!(notification, Notification::DeviceDiscovered(_)) {
            debug!(?notification, "acknowledgment matched no pending request");
        }

        for (id, state) in matched {
            if let Some(entry) = table.entries.remove(&id) {
                trace!(id, key = ?entry.key, "pending request resolved");
                // The waiting side may already be gone; its guard found nothing to remove.
                let _ = entry.resolver.send(state);
            }
        }
    }

    fn release(&self, id: u64) {
        if self.pending.lock().entries.remove(&id).is_some() {
            trace!(id, "pending request released");
        }
    }
}

/// Guard for one pending request.
pub struct Registration<'a> {
    dispatcher: &'a EventDispatcher,
    id: u64,
    receiver: oneshot::Receiver<PowerState>,
}

impl Registration<'_> {
    /// Waits for the matching acknowledgment. Returns `None` if the entry was
    /// discarded without resolution. Cancel-safe.
    pub async fn acknowledged(&mut self) -> Option<PowerState> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.dispatcher.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MacAddress;
    use std::net::Ipv4Addr;

    fn device(last: u8) -> DeviceAddress {
        DeviceAddress::new(
            Ipv4Addr::new(10, 0, 0, last),
            MacAddress::new([0xAC, 0xCF, 0x23, 0x00, 0x00, last]),
        )
    }

    #[test]
    fn power_key_requires_expected_state() {
        let key = CorrelationKey::power_state(device(1), PowerState::On);
        assert_eq!(
            key.matches(&Notification::PowerStateAck {
                address: device(1),
                state: PowerState::On,
            }),
            Some(PowerState::On)
        );
        assert_eq!(
            key.matches(&Notification::PowerStateAck {
                address: device(1),
                state: PowerState::Off,
            }),
            None
        );
        assert_eq!(
            key.matches(&Notification::SubscribeAck {
                address: device(1),
                state: PowerState::On,
            }),
            None
        );
    }

    #[tokio::test]
    async fn publish_resolves_only_matching_entries() {
        let dispatcher = EventDispatcher::new(8);
        let mut first = dispatcher.register(CorrelationKey::subscribe(device(1)));
        let _second = dispatcher.register(CorrelationKey::subscribe(device(2)));
        assert_eq!(dispatcher.pending_len(), 2);

        dispatcher.publish(DecodedFrame::SubscribeReply {
            address: device(1),
            state: PowerState::Off,
        });
        assert_eq!(first.acknowledged().await, Some(PowerState::Off));
        assert_eq!(dispatcher.pending_len(), 1);
    }

    #[test]
    fn dropping_registration_releases_entry() {
        let dispatcher = EventDispatcher::new(8);
        {
            let _registration = dispatcher.register(CorrelationKey::subscribe(device(3)));
            assert_eq!(dispatcher.pending_len(), 1);
        }
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn request_frames_are_not_published() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        assert!(dispatcher.publish(DecodedFrame::DiscoverRequest).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_datagram_is_dropped() {
        let dispatcher = EventDispatcher::new(8);
        let from: SocketAddr = "10.0.0.9:10000".parse().unwrap();
        assert!(dispatcher.dispatch_datagram(&[0x00, 0x01, 0x02], from).is_none());
    }
}
