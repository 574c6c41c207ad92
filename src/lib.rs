//! Client for the Orvibo socket discovery-and-control protocol.
//!
//! Discovers switchable sockets on the local broadcast domain, subscribes to
//! them to learn their power state and switches them on or off. Commands are
//! plain binary UDP frames; every request is resent on a fixed interval until
//! the device acknowledges it or the deadline passes.

pub mod codec;
pub mod config;
pub mod e2e_common;
pub mod events;
pub mod messages;
pub mod sdk;
pub mod session;
pub mod transport;

pub use codec::{decode, Command, DecodeError, DecodedFrame};
pub use config::{ClientConfig, ConfigError};
pub use events::{CorrelationKey, EventDispatcher, Notification, Registration};
pub use messages::{AddressParseError, DeviceAddress, DiscoveredDevice, MacAddress, PowerState};
pub use sdk::{ClientError, DiscoveryCollector, OrviboClient};
pub use session::{RetryPolicy, RetrySession, SessionError};
pub use transport::{DatagramTransport, TransportError, UdpTransport};
