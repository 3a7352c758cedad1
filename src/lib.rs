#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # LionChief 🚂
//!
//! A Rust library for controlling Lionel LionChief locomotives via Bluetooth Low Energy.
//!
//! LionChief locomotives expose a single GATT service with one write characteristic
//! for commands and one notify characteristic for status. This crate keeps one
//! resilient connection per locomotive, serializes commands onto the write
//! characteristic, decodes notifications and reconnects on its own after an
//! unexpected link loss.
//!
//! ## Protocol Overview
//!
//! - **Command frames**: `00 <code> <params..> <checksum>`, fixed length per code
//! - **Speed**: 0-100 percent scaled onto the locomotive's 32 throttle steps
//! - **Notifications**: status, battery, temperature and voltage reports
//! - **Device identity**: standard Device Information Service characteristics
//!
//! The checksum byte is written as a fixed placeholder. The locomotives accept it
//! and the real checksum algorithm has not been confirmed; see [`protocol`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use lionchief::{BleTransport, Command, Direction, LocomotiveSession, SessionConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new("FC:1F:C3:9F:A5:4A");
//!     let transport = Arc::new(BleTransport::new(config.scan_timeout_ms).await?);
//!     let session = LocomotiveSession::spawn(config, transport)?;
//!
//!     session.connect().await?;
//!     session.issue_command(Command::SetDirection(Direction::Forward)).await?;
//!     session.issue_command(Command::SetSpeed(25)).await?;
//!
//!     // Stop ahead of anything still queued
//!     session.issue_command(Command::EmergencyStop).await?;
//!     session.disconnect().await?;
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport backed by btleplug
pub mod ble;
/// Logical locomotive commands
pub mod command;
/// Error types and handling
pub mod error;
/// Device Information Service reader
pub mod identity;
/// Frame codec for commands and notifications
pub mod protocol;
/// Connection session state machine
pub mod session;
/// Status snapshots and observers
pub mod status;
/// Transport adapter interface
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BleTransport, DiscoveredLocomotive};
pub use command::Command;
pub use error::{LionChiefError, Result};
pub use protocol::{CommandCode, CommandFrame, NotificationEvent};
pub use session::{LocomotiveSession, PendingCommand};
pub use status::{StatusEvent, StatusObserver, StatusPublisher};
pub use transport::{
    ConnectionHandle, DisconnectCallback, NotificationSink, ServiceMap, Transport,
};
pub use types::{
    Announcement, ConnectionState, DeviceAddress, DeviceIdentity, Direction, LocomotiveState,
    ReconnectPolicy, SessionConfig, SessionFault, SessionPhase, SoundLevels, SoundSetting,
    SoundSource, StatusSnapshot, Telemetry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Primary LionChief service advertised by the locomotives
///
/// Some models advertise a different primary service; the session accepts an
/// override through [`SessionConfig::service_uuid`].
pub const LIONCHIEF_SERVICE_UUID: Uuid = Uuid::from_u128(0xe20a_39f4_73f5_4bc4_a12f_17d1_ad07_a961);

/// Characteristic receiving command frames
pub const LIONCHIEF_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0859_0f7e_db05_467e_8757_72f6_faeb_13d4);

/// Characteristic emitting status notifications
pub const LIONCHIEF_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0859_0f7e_db05_467e_8757_72f6_faeb_14d3);

/// Standard Device Information Service (0x180A)
pub const DEVICE_INFO_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180a_0000_1000_8000_0080_5f9b_34fb);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            LIONCHIEF_SERVICE_UUID.to_string(),
            "e20a39f4-73f5-4bc4-a12f-17d1ad07a961"
        );
        assert_eq!(
            LIONCHIEF_WRITE_CHAR_UUID.to_string(),
            "08590f7e-db05-467e-8757-72f6faeb13d4"
        );
        assert_eq!(
            LIONCHIEF_NOTIFY_CHAR_UUID.to_string(),
            "08590f7e-db05-467e-8757-72f6faeb14d3"
        );
        assert_eq!(
            DEVICE_INFO_SERVICE_UUID.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
    }
}
