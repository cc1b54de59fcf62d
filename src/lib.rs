//! A real-time audio bridge between a device speaking a small UDP framing
//! protocol and a cloud voice-agent service reached over WebSocket.
//!
//! ```text
//!   device (UDP)  <---->  Bridge  <---->  FramedSocket (WebSocket)
//!                           |
//!                        Session
//!                    (mic uplink, service downlink, idle watchdog, anchor)
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod vapi;

pub use bridge::Bridge;
pub use config::Config;
pub use error::{BridgeError, Result};
