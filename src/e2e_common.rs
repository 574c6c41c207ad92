//! In-memory transport and simulated devices for tests and demos.
//!
//! `MemoryTransport` records every datagram the client sends and feeds back
//! replies from attached `SimulatedSocket`s, so whole request flows run
//! without a network and under tokio's paused clock.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::{self, DecodedFrame, MAC_FIELD_LEN};
use crate::messages::{
    DeviceAddress, MacAddress, Opcode, PowerState, DEFAULT_PORT, MAC_PADDING, MAGIC_CODE,
};
use crate::transport::{DatagramTransport, TransportError};

/// One datagram handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub bytes: Vec<u8>,
    pub target: SocketAddr,
}

impl SentDatagram {
    pub fn opcode(&self) -> Option<Opcode> {
        (self.bytes.len() >= 6)
            .then(|| Opcode::from_code(u16::from_be_bytes([self.bytes[4], self.bytes[5]])))
    }
}

/// Test-side handle onto a [`MemoryTransport`] that has been moved into a client.
#[derive(Clone)]
pub struct MemoryHandle {
    sent: Arc<Mutex<Vec<SentDatagram>>>,
    inbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl MemoryHandle {
    /// Delivers `bytes` to the client as if received from `from`.
    pub fn inject(&self, bytes: Vec<u8>, from: SocketAddr) {
        let _ = self.inbound.send((bytes, from));
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent_with_opcode(&self, opcode: Opcode) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|d| d.opcode() == Some(opcode))
            .count()
    }
}

/// Loopback datagram transport with optional simulated devices attached.
pub struct MemoryTransport {
    handle: MemoryHandle,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    devices: Vec<Arc<SimulatedSocket>>,
}

impl MemoryTransport {
    pub fn new(devices: Vec<Arc<SimulatedSocket>>) -> (Self, MemoryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = MemoryHandle {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: tx,
        };
        (
            Self {
                handle: handle.clone(),
                inbound: tokio::sync::Mutex::new(rx),
                devices,
            },
            handle,
        )
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<(), TransportError> {
        self.handle.sent.lock().push(SentDatagram {
            bytes: bytes.to_vec(),
            target,
        });
        for device in &self.devices {
            if !device.reachable_at(target.ip()) {
                continue;
            }
            if let Some(reply) = device.respond(bytes) {
                self.handle.inject(reply, device_socket(&device.address));
            }
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        let (bytes, from) = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok((len, from))
    }
}

/// Behaves like a switchable socket: answers discover, subscribe and
/// change-power-state frames, and only honors state changes once subscribed.
pub struct SimulatedSocket {
    pub address: DeviceAddress,
    identifier: String,
    state: Mutex<PowerState>,
    subscribed: Mutex<bool>,
    ignore_remaining: Mutex<u32>,
}

impl SimulatedSocket {
    pub fn new(address: DeviceAddress, state: PowerState) -> Self {
        Self {
            address,
            identifier: "SOC002".into(),
            state: Mutex::new(state),
            subscribed: Mutex::new(false),
            ignore_remaining: Mutex::new(0),
        }
    }

    /// Drops the next `count` frames addressed to this device unanswered.
    pub fn ignoring_first(self, count: u32) -> Self {
        *self.ignore_remaining.lock() = count;
        self
    }

    pub fn with_identifier(mut self, identifier: &str) -> Self {
        self.identifier = identifier.to_string();
        self
    }

    pub fn state(&self) -> PowerState {
        *self.state.lock()
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.lock()
    }

    fn reachable_at(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => ip == self.address.ip || ip.is_broadcast(),
            IpAddr::V6(_) => false,
        }
    }

    /// Reply frame for `frame`, if the device would answer it.
    pub fn respond(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let decoded = codec::decode(frame, self.address.ip).ok()?;
        {
            let mut ignore = self.ignore_remaining.lock();
            if *ignore > 0 {
                *ignore -= 1;
                return None;
            }
        }

        let mac = self.address.mac;
        match decoded {
            DecodedFrame::DiscoverRequest => {
                let state = self.state();
                Some(discover_reply(mac, &self.identifier, state))
            }
            DecodedFrame::SubscribeRequest { address } if address.mac == mac => {
                *self.subscribed.lock() = true;
                Some(subscribe_reply(mac, self.state()))
            }
            DecodedFrame::ChangePowerStateRequest { address, state }
                if address.mac == mac && self.is_subscribed() =>
            {
                *self.state.lock() = state;
                Some(power_state_reply(mac, state))
            }
            _ => None,
        }
    }
}

fn reply_frame(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + body.len());
    buf.extend_from_slice(&MAGIC_CODE);
    buf.extend_from_slice(&((6 + body.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&opcode.code().to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn mac_field(mac: MacAddress) -> Vec<u8> {
    let mut field = mac.octets().to_vec();
    field.resize(MAC_FIELD_LEN, MAC_PADDING);
    field
}

/// 42-byte discover reply as sent by a socket.
pub fn discover_reply(mac: MacAddress, identifier: &str, state: PowerState) -> Vec<u8> {
    let mut body = mac_field(mac);
    body.extend(mac_field(mac.reversed()));
    body.push(0x00);
    let mut id = identifier.as_bytes().to_vec();
    id.resize(6, b' ');
    body.extend_from_slice(&id[..6]);
    body.extend_from_slice(&[0u8; 4]);
    body.push(state.to_byte());
    reply_frame(Opcode::Discover, &body)
}

/// 24-byte subscribe acknowledgment.
pub fn subscribe_reply(mac: MacAddress, state: PowerState) -> Vec<u8> {
    let mut body = mac_field(mac);
    body.extend_from_slice(&[0u8; 5]);
    body.push(state.to_byte());
    reply_frame(Opcode::Subscribe, &body)
}

/// 23-byte change-power-state acknowledgment.
pub fn power_state_reply(mac: MacAddress, state: PowerState) -> Vec<u8> {
    let mut body = mac_field(mac);
    body.extend_from_slice(&[0u8; 4]);
    body.push(state.to_byte());
    reply_frame(Opcode::ChangePowerStateReply, &body)
}

/// Device-side address a reply from `device` arrives from.
pub fn device_socket(device: &DeviceAddress) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(device.ip), DEFAULT_PORT)
}
