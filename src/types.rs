use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Connection lifecycle state of the device link
///
/// Owned exclusively by the connection manager and published read-only on a
/// watch channel. Transitions follow Disconnected -> Scanning -> Connecting ->
/// Connected -> Disconnected and the machine can be re-entered indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link; the only state from which scan/connect may be started
    Disconnected,
    /// Discovery in progress
    Scanning,
    /// A connect attempt (possibly one of several retries) is in flight
    Connecting,
    /// Link established and polling is running
    Connected {
        /// Advertised device name
        name: String,
        /// Device address
        address: String,
        /// Hardware model, when the device reports one
        model: Option<String>,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { name, .. } => write!(f, "Connected to {name}"),
        }
    }
}

/// A device observed during discovery
///
/// Ephemeral; the scanned-device list is rebuilt on each scan and keyed by
/// address. Entries carrying a real advertised name supersede placeholder
/// entries with the same address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    /// Advertised local name, if the advertisement carried one
    pub name: Option<String>,
    /// Device address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl ScannedDevice {
    /// Whether this entry carries a real advertised name
    #[must_use]
    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    /// Name for display, falling back to the address
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// One decoded telemetry sample from the machine
///
/// Produced once per poll or notification and consumed immediately to update
/// derived state; never persisted by this crate. Positions are millimeters of
/// cable extension, loads are kilograms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorPacket {
    /// Device tick counter
    pub ticks: u32,
    /// Cable A position in millimeters
    pub pos_a_mm: f32,
    /// Cable B position in millimeters
    pub pos_b_mm: f32,
    /// Cable A load in kilograms
    pub load_a_kg: f32,
    /// Cable B load in kilograms
    pub load_b_kg: f32,
    /// Raw device status word
    pub status: u16,
}

/// Which wire path a monitor packet arrived on
///
/// The hardware exposes duplicate telemetry through two characteristics with
/// different byte orders and scale factors; downstream behavior differs by
/// source, so provenance is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorSource {
    /// Polled from the dedicated monitor/sample characteristic
    MonitorCharacteristic,
    /// Carried inside an opcode-prefixed RX notification frame
    RxNotification,
}

/// Output unit of the telemetry stream; immutable once emitted
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkoutMetric {
    /// Emission timestamp
    pub timestamp: SystemTime,
    /// Cable A load in kilograms
    pub load_a: f32,
    /// Cable B load in kilograms
    pub load_b: f32,
    /// Cable A position in millimeters
    pub position_a: f32,
    /// Cable B position in millimeters
    pub position_b: f32,
    /// Cable A smoothed velocity in mm/s
    pub velocity_a: f32,
    /// Cable B smoothed velocity in mm/s
    pub velocity_b: f32,
}

/// A rep-completion notification from the machine
///
/// Two wire encodings (6-byte legacy, 24-byte modern) map to this one logical
/// type. `is_legacy_format` records provenance because downstream rep-counting
/// logic branches on it: the legacy format carries no ROM boundaries or
/// per-set counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RepNotification {
    /// Count of reps that reached the top of the range
    pub top_counter: u32,
    /// Count of fully completed reps
    pub complete_counter: u32,
    /// Warmup (ROM calibration) reps completed
    pub reps_rom_count: u16,
    /// Warmup reps targeted
    pub reps_rom_total: u16,
    /// Working-set reps completed
    pub reps_set_count: u16,
    /// Working-set reps targeted
    pub reps_set_total: u16,
    /// Top of the calibrated range of motion, millimeters
    pub range_top: f32,
    /// Bottom of the calibrated range of motion, millimeters
    pub range_bottom: f32,
    /// True when decoded from the 6-byte legacy encoding
    pub is_legacy_format: bool,
    /// Decode timestamp
    pub timestamp: SystemTime,
}

/// Diagnostic/fault frame read opportunistically from the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiagnosticPacket {
    /// Device uptime in seconds
    pub seconds: u32,
    /// Active fault codes; zero means no fault in that slot
    pub faults: [u16; 4],
    /// Temperature readings in degrees Celsius
    pub temps: [f32; 8],
    /// True when any fault code is non-zero
    pub has_faults: bool,
}

/// Force/phase telemetry polled from the heuristic characteristic
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeuristicSample {
    /// Cable A force in kilograms
    pub force_a_kg: f32,
    /// Cable B force in kilograms
    pub force_b_kg: f32,
    /// Raw movement-phase code reported by the firmware
    pub phase: u8,
}

/// Handle-activity state driving auto-start/auto-stop
///
/// Mutated only by metric samples flowing through the polling engine; reset
/// explicitly by callers at set boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleActivityState {
    /// Waiting for the handle to settle near the rest baseline before arming
    WaitingForRest,
    /// Handle extended beyond the grab threshold but not yet moving fast
    Moving,
    /// Handle extended and moving: a workout is in progress
    Active,
    /// Handle returned to rest; the set is considered finished
    SetComplete,
}

impl fmt::Display for HandleActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingForRest => write!(f, "Waiting for rest"),
            Self::Moving => write!(f, "Moving"),
            Self::Active => write!(f, "Active"),
            Self::SetComplete => write!(f, "Set complete"),
        }
    }
}

/// Advisory request emitted once per unexpected disconnect
///
/// The crate never reconnects on its own; this only signals that a
/// caller-driven reconnect attempt is appropriate. Explicit disconnects never
/// produce one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectionRequest {
    /// Name of the device that dropped
    pub device_name: String,
    /// Address of the device that dropped
    pub device_address: String,
    /// What the transport reported
    pub reason: String,
    /// When the drop was observed
    pub timestamp: SystemTime,
}

/// Which side of the safe range of motion was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RomSide {
    /// Position above the configured upper bound
    High,
    /// Position below the configured lower bound
    Low,
}

/// One-shot safety event derived from the metric stream
///
/// Emitted per occurrence rather than held as state, because consumers (UI,
/// logging) react per event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SafetyEvent {
    /// Load dropped suddenly and implausibly during an active lift
    Deload {
        /// Load before the drop, kilograms
        from_kg: f32,
        /// Load after the drop, kilograms
        to_kg: f32,
    },
    /// Position left the configured safe bounds
    RomViolation {
        /// Which bound was exceeded
        side: RomSide,
        /// Position at the time of the violation, millimeters
        position_mm: f32,
    },
}

/// LED color scheme selectable on the machine's light strip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColorScheme {
    /// Factory default white
    Classic = 0,
    /// Warm orange
    Ember = 1,
    /// Blue
    Ocean = 2,
    /// Green
    Forest = 3,
    /// Purple
    Violet = 4,
}

impl ColorScheme {
    /// All selectable schemes, in device order
    pub const ALL: [Self; 5] = [
        Self::Classic,
        Self::Ember,
        Self::Ocean,
        Self::Forest,
        Self::Violet,
    ];
}

impl fmt::Display for ColorScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "Classic"),
            Self::Ember => write!(f, "Ember"),
            Self::Ocean => write!(f, "Ocean"),
            Self::Forest => write!(f, "Forest"),
            Self::Violet => write!(f, "Violet"),
        }
    }
}

/// Resistance mode selected when starting a workout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkoutMode {
    /// Constant load through the whole range
    Standard = 0,
    /// Extra load on the lowering phase
    Eccentric = 1,
    /// Load increases with extension
    Chains = 2,
    /// Load follows the user's own force profile
    Echo = 3,
}

impl fmt::Display for WorkoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "Standard"),
            Self::Eccentric => write!(f, "Eccentric"),
            Self::Chains => write!(f, "Chains"),
            Self::Echo => write!(f, "Echo"),
        }
    }
}

/// Connection manager tunables
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Number of connect attempts before giving up
    pub connect_attempts: u32,
    /// Delay between connect attempts in milliseconds
    pub connect_retry_delay_ms: u64,
    /// Hard timeout applied to each individual connect attempt
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_attempts: 3,
            connect_retry_delay_ms: 1_000,
            connect_timeout_ms: 8_000,
        }
    }
}

/// Polling engine intervals
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Monitor/sample characteristic poll interval in milliseconds
    pub monitor_interval_ms: u64,
    /// Diagnostic/keep-alive poll interval in milliseconds
    pub diagnostic_interval_ms: u64,
    /// Heuristic/force-telemetry poll interval in milliseconds
    pub heuristic_interval_ms: u64,
    /// How long a poll tick may wait for the operation queue before skipping
    pub queue_acquire_window_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 10,
            diagnostic_interval_ms: 500,
            heuristic_interval_ms: 250,
            queue_acquire_window_ms: 8,
        }
    }
}

/// Handle-activity detector thresholds
///
/// Positions are millimeters, velocities mm/s. Grab and release use separate
/// thresholds so the state machine does not chatter at the boundary, and the
/// rest baseline is tracked dynamically to tolerate mounting and pulley
/// geometry variance.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Extension above baseline that counts as a grabbed handle
    pub grab_delta_mm: f32,
    /// Extension above baseline under which the handle counts as released
    pub release_delta_mm: f32,
    /// Smoothed velocity above which motion is significant
    pub movement_velocity_mm_s: f32,
    /// How long the grab delta must be sustained before leaving rest
    pub grab_dwell_ms: u64,
    /// Band around the baseline within which the handle counts as settled
    pub rest_settle_tolerance_mm: f32,
    /// Forced re-baseline after waiting this long without settling
    pub waiting_dwell_timeout_ms: u64,
    /// Exponential moving average factor for velocity and load smoothing
    pub ema_alpha: f32,
    /// Fractional load drop that counts as a deload during an active lift
    pub deload_drop_fraction: f32,
    /// Loads below this never trigger deload detection
    pub deload_min_load_kg: f32,
    /// Minimum spacing between deload events
    pub deload_cooldown_ms: u64,
    /// Upper safe position bound
    pub rom_high_mm: f32,
    /// Lower safe position bound
    pub rom_low_mm: f32,
    /// Absolute sane position range: minimum
    pub sample_min_mm: f32,
    /// Absolute sane position range: maximum
    pub sample_max_mm: f32,
    /// Largest plausible position change between consecutive samples
    pub max_sample_delta_mm: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            grab_delta_mm: 120.0,
            release_delta_mm: 40.0,
            movement_velocity_mm_s: 80.0,
            grab_dwell_ms: 150,
            rest_settle_tolerance_mm: 15.0,
            waiting_dwell_timeout_ms: 10_000,
            ema_alpha: 0.3,
            deload_drop_fraction: 0.5,
            deload_min_load_kg: 5.0,
            deload_cooldown_ms: 2_000,
            rom_high_mm: 1_150.0,
            rom_low_mm: -10.0,
            sample_min_mm: -50.0,
            sample_max_mm: 2_000.0,
            max_sample_delta_mm: 200.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
        let connected = ConnectionState::Connected {
            name: "Kinetra-A1B2".to_string(),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            model: None,
        };
        assert_eq!(format!("{connected}"), "Connected to Kinetra-A1B2");
    }

    #[test]
    fn test_scanned_device_display_name() {
        let named = ScannedDevice {
            name: Some("Kinetra-A1B2".to_string()),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: -60,
        };
        assert!(named.is_named());
        assert_eq!(named.display_name(), "Kinetra-A1B2");

        let placeholder = ScannedDevice {
            name: None,
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: -60,
        };
        assert!(!placeholder.is_named());
        assert_eq!(placeholder.display_name(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.connect_retry_delay_ms, 1_000);
        assert_eq!(config.connect_timeout_ms, 8_000);
    }

    #[test]
    fn test_polling_config_defaults() {
        let config = PollingConfig::default();
        assert_eq!(config.monitor_interval_ms, 10);
        assert_eq!(config.diagnostic_interval_ms, 500);
        assert_eq!(config.heuristic_interval_ms, 250);
        // The acquire window must stay below the monitor interval or a stuck
        // queue would stack ticks instead of skipping them.
        assert!(config.queue_acquire_window_ms < config.monitor_interval_ms);
    }

    #[test]
    fn test_detector_config_hysteresis() {
        let config = DetectorConfig::default();
        assert!(config.grab_delta_mm > config.release_delta_mm);
        assert!(config.sample_max_mm > config.rom_high_mm);
        assert!(config.sample_min_mm < config.rom_low_mm);
    }

    #[test]
    fn test_color_scheme_order() {
        assert_eq!(ColorScheme::ALL.len(), 5);
        assert_eq!(ColorScheme::Classic as u8, 0);
        assert_eq!(ColorScheme::Violet as u8, 4);
    }

    #[test]
    fn test_workout_mode_bytes() {
        assert_eq!(WorkoutMode::Standard as u8, 0);
        assert_eq!(WorkoutMode::Eccentric as u8, 1);
        assert_eq!(WorkoutMode::Chains as u8, 2);
        assert_eq!(WorkoutMode::Echo as u8, 3);
    }
}
