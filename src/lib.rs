#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Kinetra 🏋️
//!
//! A Rust library for controlling Kinetra dual-cable resistance trainers via
//! Bluetooth Low Energy.
//!
//! This crate is the device-communication core of a Kinetra companion
//! application: it owns the BLE link to the machine, decodes its proprietary
//! binary protocol, and exposes a safe, ordered stream of workout telemetry
//! and control commands. Everything above it (UI, rep scoring, history) only
//! ever sees the typed streams published here.
//!
//! ## What the core handles
//!
//! - **Connection lifecycle**: scan, connect with retry, disconnect, and
//!   advisory reconnect signaling on unexpected drops
//! - **Operation queue**: a single serialization gate for every BLE read and
//!   write — the link corrupts interleaved operations, so nothing bypasses it
//! - **Protocol codec**: byte-exact encode/decode of metric samples, both
//!   rep-notification wire formats, diagnostic frames and all command frames
//! - **Polling engine**: periodic reads of the monitor (~10 ms), diagnostic
//!   (500 ms) and heuristic (250 ms) characteristics, with overload shedding
//! - **Handle-activity detection**: the 4-state machine behind auto-start,
//!   auto-stop, deload and range-of-motion safety events
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library controls physical exercise equipment under
//! load. Always ensure:
//! - Stop and soft-stop commands are wired to an obvious user affordance
//! - Deload and range-of-motion events are surfaced, not swallowed
//! - Users understand how to safely operate the equipment
//! - Proper error handling is implemented in your application
//!
//! ## Quick Start
//!
//! ```no_run
//! use kinetra::{KinetraDevice, WorkoutMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = KinetraDevice::new().await?;
//!
//!     // Discover and connect to the nearest trainer
//!     let found = device.scan().await?;
//!     let target = found.first().ok_or("no trainer in range")?;
//!     device.connect(target).await?;
//!
//!     // Start a 25 kg standard workout
//!     device.initialize().await?;
//!     device.start_workout(WorkoutMode::Standard, 25.0).await?;
//!
//!     // Consume telemetry
//!     let mut metrics = device.metrics();
//!     let metric = metrics.recv().await?;
//!     println!("load: {:.1} kg", metric.load_a + metric.load_b);
//!
//!     device.soft_stop().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport layer and platform hooks
pub mod ble;
/// Byte-level protocol codec
pub mod codec;
/// Connection manager and main device interface
pub mod device;
/// Error types and handling
pub mod error;
/// Handle-activity state machine and safety derivation
pub mod handle_state;
/// Adaptive polling engine
pub(crate) mod polling;
/// Operation queue serializing all BLE traffic
pub mod queue;
/// Command and session helpers
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{CharacteristicTarget, DefaultPlatformHooks, PlatformHooks, Transport};
pub use codec::{CommandAck, EchoConfig, ProgramConfig, ProgramSegment, RegularConfig};
pub use device::KinetraDevice;
pub use error::{KinetraError, Result};
pub use queue::OperationQueue;
pub use types::{
    ColorScheme, ConnectionConfig, ConnectionState, DetectorConfig, DiagnosticPacket,
    HandleActivityState, HeuristicSample, MonitorPacket, MonitorSource, PollingConfig,
    ReconnectionRequest, RepNotification, RomSide, SafetyEvent, ScannedDevice, WorkoutMetric,
    WorkoutMode,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Advertised name prefix of Kinetra trainers
///
/// Devices advertise as `Kinetra-XXXX` where the suffix is derived from the
/// serial number. Advertisements without this prefix are only accepted when
/// they carry the Kinetra service UUID.
pub const DEVICE_NAME_PREFIX: &str = "Kinetra";

/// Primary Kinetra service UUID
///
/// One custom service carries every characteristic this crate talks to,
/// except the standard Device Information Service firmware string.
pub const KINETRA_SERVICE_UUID: Uuid = Uuid::from_u128(0x6B4E_0001_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Write characteristic receiving all command frames
pub const KINETRA_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0002_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Monitor/sample characteristic polled for position, load and status
pub const KINETRA_MONITOR_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0003_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Rep-notification characteristic (payloads carry no opcode prefix)
pub const KINETRA_REPS_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0004_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Diagnostic/property characteristic, also the low-rate keep-alive
pub const KINETRA_DIAGNOSTIC_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0005_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Heuristic characteristic carrying force/phase telemetry
pub const KINETRA_HEURISTIC_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0006_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Version characteristic, read best-effort for diagnostic logging
pub const KINETRA_VERSION_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0007_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Mode characteristic, read best-effort for diagnostic logging
pub const KINETRA_MODE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0008_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Secondary RX notification channel
///
/// Carries opcode-prefixed metric (`0x01`) and rep (`0x02`) frames; any
/// other opcode is recorded for command-acknowledgment tracking and ignored.
pub const KINETRA_RX_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6B4E_0009_2D7A_4F83_9C1E_54A8_D0C3_B9F2);

/// Standard Device Information Service firmware revision characteristic
///
/// Read once, best-effort, for a human-readable firmware string.
pub const STANDARD_FIRMWARE_REVISION_UUID: Uuid =
    Uuid::from_u128(0x0000_2A26_0000_1000_8000_0080_5F9B_34FB);
