//! High-level client built on the codec, dispatcher and retry sessions.
//!
//! `OrviboClient` owns one transport and one dispatcher; every operation is a
//! thin composition of retry sessions over them.
pub mod client;
pub mod discovery;

pub use client::{ClientError, OrviboClient};
pub use discovery::DiscoveryCollector;
