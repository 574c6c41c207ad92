//! Typed data model for the Orvibo socket protocol.
//!
//! Every field that travels on the wire has a typed representation here; the
//! byte layout itself lives in [`crate::codec`].
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two-byte constant that prefixes every frame of the protocol.
pub const MAGIC_CODE: [u8; 2] = [0x68, 0x64];

/// UDP port devices listen on and reply from.
pub const DEFAULT_PORT: u16 = 10000;

/// Padding byte used to fill MAC fields.
pub const MAC_PADDING: u8 = 0x20;

/// Frame command/reply selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Broadcast discovery request and the replies to it.
    Discover,
    /// Subscribe request and its acknowledgment.
    Subscribe,
    /// Power-state change request sent by the client.
    ChangePowerState,
    /// Power-state change acknowledgment sent by the device.
    ChangePowerStateReply,
    /// Any opcode this client does not interpret.
    Unknown(u16),
}

impl Opcode {
    pub fn code(self) -> u16 {
        match self {
            Opcode::Discover => 0x7161,
            Opcode::Subscribe => 0x636c,
            Opcode::ChangePowerState => 0x6463,
            Opcode::ChangePowerStateReply => 0x7366,
            Opcode::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x7161 => Opcode::Discover,
            0x636c => Opcode::Subscribe,
            0x6463 => Opcode::ChangePowerState,
            0x7366 => Opcode::ChangePowerStateReply,
            other => Opcode::Unknown(other),
        }
    }
}

/// On/off state of a switchable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
}

impl PowerState {
    /// Wire byte for this state.
    pub fn to_byte(self) -> u8 {
        match self {
            PowerState::On => 0x01,
            PowerState::Off => 0x00,
        }
    }

    /// Only `0x01` means on; every other byte reads as off.
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0x01 {
            PowerState::On
        } else {
            PowerState::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == PowerState::On
    }
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

impl From<PowerState> for bool {
    fn from(state: PowerState) -> Self {
        state.is_on()
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
        }
    }
}

/// Errors raised while parsing user-supplied device addresses.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("mac address must be 12 hex digits, got {0} characters")]
    MacLength(usize),
    #[error("mac address contains a non-hex digit: {0:?}")]
    MacDigit(String),
    #[error("invalid ipv4 address: {0}")]
    Ip(String),
}

/// Six-byte hardware address of a device.
///
/// Parses from 12 hex digits in either case; always displays as uppercase.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Same address with the byte order reversed, as the subscribe frame
    /// carries it in its second MAC field.
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Self(bytes)
    }
}

impl FromStr for MacAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 12 {
            return Err(AddressParseError::MacLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AddressParseError::MacDigit(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[idx * 2..idx * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| AddressParseError::MacDigit(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

/// Network identity of one device; the correlation key for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

impl DeviceAddress {
    pub fn new(ip: Ipv4Addr, mac: MacAddress) -> Self {
        Self { ip, mac }
    }

    /// Parses a dotted-quad IP and a 12-hex-digit MAC.
    pub fn parse(ip: &str, mac: &str) -> Result<Self, AddressParseError> {
        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| AddressParseError::Ip(ip.to_string()))?;
        Ok(Self {
            ip,
            mac: mac.parse()?,
        })
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.mac)
    }
}

/// A device that answered a discover broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    /// ASCII device-type tag, e.g. `SOC002` for a switchable socket.
    pub identifier: String,
    /// Present only when the identifier marks a socket.
    pub power_state: Option<PowerState>,
}

impl DiscoveredDevice {
    pub fn is_socket(&self) -> bool {
        is_socket_identifier(&self.identifier)
    }
}

pub(crate) fn is_socket_identifier(identifier: &str) -> bool {
    identifier.contains("SOC")
}
