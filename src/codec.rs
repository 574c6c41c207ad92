//! Binary frame codec.
//!
//! Every frame starts with the same six-byte header:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 2 | magic code `68 64` |
//! | 2 | 2 | total frame length, big-endian, self-inclusive |
//! | 4 | 2 | opcode |
//!
//! Command payloads carry the device MAC as a 12-byte field (six MAC bytes,
//! six `0x20` padding bytes). Reply offsets below are derived from the same
//! layout so encode and decode cannot drift apart. Encoding is pure and total;
//! decoding validates each gate in order and never returns a partially
//! interpreted frame.
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::trace;

use crate::messages::{
    is_socket_identifier, DeviceAddress, DiscoveredDevice, MacAddress, Opcode, PowerState,
    MAC_PADDING, MAGIC_CODE,
};

pub const HEADER_LEN: usize = 6;
const LENGTH_OFFSET: usize = 2;
const OPCODE_OFFSET: usize = 4;

pub const MAC_OFFSET: usize = HEADER_LEN;
pub const MAC_FIELD_LEN: usize = 12;

/// Zero bytes between the MAC field and the power byte. Their meaning is not
/// known; they are written as zero and ignored on decode.
const POWER_PADDING_LEN: usize = 4;

pub const DISCOVER_REQUEST_LEN: usize = HEADER_LEN;
pub const SUBSCRIBE_REQUEST_LEN: usize = HEADER_LEN + 2 * MAC_FIELD_LEN;
pub const CHANGE_POWER_STATE_REQUEST_LEN: usize =
    HEADER_LEN + MAC_FIELD_LEN + POWER_PADDING_LEN + 1;

const CHANGE_POWER_STATE_OFFSET: usize = CHANGE_POWER_STATE_REQUEST_LEN - 1;
/// The device echoes the change-power-state layout, so its power byte sits at
/// the same offset as in the request.
const POWER_REPLY_STATE_OFFSET: usize = CHANGE_POWER_STATE_OFFSET;
/// Subscribe replies carry one extra byte before the power byte.
const SUBSCRIBE_REPLY_STATE_OFFSET: usize = CHANGE_POWER_STATE_OFFSET + 1;
const DISCOVER_IDENTIFIER_OFFSET: usize = 31;
const DISCOVER_IDENTIFIER_LEN: usize = 6;
const DISCOVER_STATE_OFFSET: usize = 41;

/// Errors produced by [`decode`]. Callers drop the datagram and keep receiving.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic code: {found:02x?}")]
    BadMagic { found: Vec<u8> },
    #[error("length mismatch: declared {declared}, received {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("frame truncated: need {needed} bytes, received {actual}")]
    Truncated { needed: usize, actual: usize },
}

/// Outgoing command frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Discover,
    Subscribe { mac: MacAddress },
    ChangePowerState { mac: MacAddress, state: PowerState },
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Discover => Opcode::Discover,
            Command::Subscribe { .. } => Opcode::Subscribe,
            Command::ChangePowerState { .. } => Opcode::ChangePowerState,
        }
    }

    /// Builds the complete frame; the length field is patched in last.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUBSCRIBE_REQUEST_LEN);
        buf.extend_from_slice(&MAGIC_CODE);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.opcode().code().to_be_bytes());

        match self {
            Command::Discover => {}
            Command::Subscribe { mac } => {
                put_mac_field(&mut buf, *mac);
                put_mac_field(&mut buf, mac.reversed());
            }
            Command::ChangePowerState { mac, state } => {
                put_mac_field(&mut buf, *mac);
                buf.extend_from_slice(&[0u8; POWER_PADDING_LEN]);
                buf.push(state.to_byte());
            }
        }

        patch_length(&mut buf);
        trace!(opcode = ?self.opcode(), len = buf.len(), "encoded frame");
        buf
    }
}

fn put_mac_field(buf: &mut Vec<u8>, mac: MacAddress) {
    buf.extend_from_slice(&mac.octets());
    buf.extend_from_slice(&[MAC_PADDING; MAC_FIELD_LEN - 6]);
}

fn patch_length(buf: &mut [u8]) {
    // Frames are a few dozen bytes; u16 always holds the length.
    let len = buf.len() as u16;
    buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
}

/// A validated frame received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// Header-only discover frame, normally our own broadcast echoed back.
    DiscoverRequest,
    DiscoverReply(DiscoveredDevice),
    SubscribeRequest {
        address: DeviceAddress,
    },
    SubscribeReply {
        address: DeviceAddress,
        state: PowerState,
    },
    ChangePowerStateRequest {
        address: DeviceAddress,
        state: PowerState,
    },
    PowerStateReply {
        address: DeviceAddress,
        state: PowerState,
    },
    /// Reply with an opcode this client does not interpret.
    Unclassified {
        opcode: u16,
        address: DeviceAddress,
    },
}

impl DecodedFrame {
    pub fn opcode(&self) -> Opcode {
        match self {
            DecodedFrame::DiscoverRequest | DecodedFrame::DiscoverReply(_) => Opcode::Discover,
            DecodedFrame::SubscribeRequest { .. } | DecodedFrame::SubscribeReply { .. } => {
                Opcode::Subscribe
            }
            DecodedFrame::ChangePowerStateRequest { .. } => Opcode::ChangePowerState,
            DecodedFrame::PowerStateReply { .. } => Opcode::ChangePowerStateReply,
            DecodedFrame::Unclassified { opcode, .. } => Opcode::Unknown(*opcode),
        }
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        match self {
            DecodedFrame::DiscoverRequest => None,
            DecodedFrame::DiscoverReply(device) => Some(device.address),
            DecodedFrame::SubscribeRequest { address }
            | DecodedFrame::SubscribeReply { address, .. }
            | DecodedFrame::ChangePowerStateRequest { address, .. }
            | DecodedFrame::PowerStateReply { address, .. }
            | DecodedFrame::Unclassified { address, .. } => Some(*address),
        }
    }
}

/// Validates and decodes one datagram received from `sender`.
pub fn decode(bytes: &[u8], sender: Ipv4Addr) -> Result<DecodedFrame, DecodeError> {
    if bytes.len() < MAGIC_CODE.len() || bytes[..MAGIC_CODE.len()] != MAGIC_CODE {
        return Err(DecodeError::BadMagic {
            found: bytes.iter().take(MAGIC_CODE.len()).copied().collect(),
        });
    }

    ensure_len(bytes, LENGTH_OFFSET + 2)?;
    let declared = read_u16(bytes, LENGTH_OFFSET);
    if declared as usize != bytes.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    ensure_len(bytes, HEADER_LEN)?;
    let opcode = Opcode::from_code(read_u16(bytes, OPCODE_OFFSET));
    trace!(%sender, ?opcode, len = bytes.len(), "decoding frame");

    if opcode == Opcode::Discover && bytes.len() == DISCOVER_REQUEST_LEN {
        return Ok(DecodedFrame::DiscoverRequest);
    }

    ensure_len(bytes, MAC_OFFSET + 6)?;
    let address = DeviceAddress::new(sender, read_mac(bytes, MAC_OFFSET));

    let frame = match opcode {
        Opcode::Discover => {
            ensure_len(bytes, DISCOVER_IDENTIFIER_OFFSET + DISCOVER_IDENTIFIER_LEN)?;
            let identifier = read_ascii(
                &bytes[DISCOVER_IDENTIFIER_OFFSET
                    ..DISCOVER_IDENTIFIER_OFFSET + DISCOVER_IDENTIFIER_LEN],
            );
            let power_state = if is_socket_identifier(&identifier) {
                ensure_len(bytes, DISCOVER_STATE_OFFSET + 1)?;
                Some(PowerState::from_byte(bytes[DISCOVER_STATE_OFFSET]))
            } else {
                None
            };
            DecodedFrame::DiscoverReply(DiscoveredDevice {
                address,
                identifier,
                power_state,
            })
        }
        Opcode::Subscribe if bytes.len() == SUBSCRIBE_REQUEST_LEN => {
            DecodedFrame::SubscribeRequest { address }
        }
        Opcode::Subscribe => {
            ensure_len(bytes, SUBSCRIBE_REPLY_STATE_OFFSET + 1)?;
            DecodedFrame::SubscribeReply {
                address,
                state: PowerState::from_byte(bytes[SUBSCRIBE_REPLY_STATE_OFFSET]),
            }
        }
        Opcode::ChangePowerState => {
            ensure_len(bytes, CHANGE_POWER_STATE_OFFSET + 1)?;
            DecodedFrame::ChangePowerStateRequest {
                address,
                state: PowerState::from_byte(bytes[CHANGE_POWER_STATE_OFFSET]),
            }
        }
        Opcode::ChangePowerStateReply => {
            ensure_len(bytes, POWER_REPLY_STATE_OFFSET + 1)?;
            DecodedFrame::PowerStateReply {
                address,
                state: PowerState::from_byte(bytes[POWER_REPLY_STATE_OFFSET]),
            }
        }
        Opcode::Unknown(code) => DecodedFrame::Unclassified {
            opcode: code,
            address,
        },
    };
    Ok(frame)
}

fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), DecodeError> {
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_mac(bytes: &[u8], offset: usize) -> MacAddress {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[offset..offset + 6]);
    MacAddress::new(mac)
}

fn read_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect::<String>()
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}
