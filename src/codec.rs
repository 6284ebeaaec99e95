//! Byte-level protocol codec.
//!
//! Pure, side-effect-free conversions between wire bytes and typed packets;
//! no I/O happens here. The machine exposes duplicate telemetry through two
//! characteristics with different byte orders and scale factors, so there are
//! two independent monitor decoders; they are deliberately not unified.

use crate::{
    error::{KinetraError, Result},
    types::{
        ColorScheme, DiagnosticPacket, HeuristicSample, MonitorPacket, RepNotification,
        WorkoutMode,
    },
};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::SystemTime;

/// Opcode of the init command frame
pub const OPCODE_INIT: u8 = 0x01;
/// Opcode of the start-workout command frame
pub const OPCODE_START: u8 = 0x02;
/// Opcode of the reset/stop command frame
pub const OPCODE_STOP: u8 = 0x0A;
/// Opcode of the soft-stop command frame
///
/// Distinct from [`OPCODE_STOP`]: soft stop releases tension but leaves
/// polling and session state intact so auto-start can re-arm.
pub const OPCODE_SOFT_STOP: u8 = 0x50;
/// Opcode of the color-scheme command frame
pub const OPCODE_COLOR_SCHEME: u8 = 0x4C;
/// Opcode of the compact echo configuration frame
pub const OPCODE_ECHO_CONFIG: u8 = 0x4E;
/// Opcode of the full program configuration frame
pub const OPCODE_PROGRAM_CONFIG: u8 = 0x04;
/// Opcode of the regular (per-set) configuration frame
pub const OPCODE_REGULAR_CONFIG: u8 = 0x4F;

/// Opcode prefix of metric frames on the RX notification channel
pub const RX_OPCODE_METRIC: u8 = 0x01;
/// Opcode prefix of rep frames on the RX notification channel
pub const RX_OPCODE_REP: u8 = 0x02;

/// Size of the echo configuration frame in bytes
pub const ECHO_CONFIG_SIZE: usize = 32;
/// Size of the program configuration frame in bytes
pub const PROGRAM_CONFIG_SIZE: usize = 96;
/// Size of the regular configuration frame in bytes
pub const REGULAR_CONFIG_SIZE: usize = 25;
/// Maximum number of segments a program frame can carry
pub const MAX_PROGRAM_SEGMENTS: usize = 23;

/// Minimum length of an RX metric frame, opcode included
pub const RX_METRIC_MIN_LEN: usize = 16;
/// Minimum length of an RX rep frame, opcode included
pub const RX_REP_MIN_LEN: usize = 5;
/// Minimum length of a dedicated monitor characteristic packet
pub const MONITOR_PACKET_MIN_LEN: usize = 14;
/// Minimum length of a diagnostic packet
pub const DIAGNOSTIC_PACKET_MIN_LEN: usize = 28;
/// Length of the legacy rep payload
pub const REP_LEGACY_LEN: usize = 6;
/// Length of the modern rep payload
pub const REP_MODERN_LEN: usize = 24;

/// Weight range the hardware accepts, kilograms
pub const WEIGHT_RANGE_KG: std::ops::RangeInclusive<f32> = 0.5..=110.0;

// ---------------------------------------------------------------------------
// Byte readers
// ---------------------------------------------------------------------------

/// Read an unsigned little-endian 16-bit value at `offset`
///
/// Returns the full unsigned range: `[0xFF, 0xFF]` reads as 65535, never a
/// negative value. `None` when the buffer is too short.
#[must_use]
pub fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read an unsigned big-endian 16-bit value at `offset`
#[must_use]
pub fn read_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a signed little-endian 16-bit value at `offset`
#[must_use]
pub fn read_i16_le(buf: &[u8], offset: usize) -> Option<i16> {
    read_u16_le(buf, offset).map(|v| v as i16)
}

/// Read a signed big-endian 16-bit value at `offset`
#[must_use]
pub fn read_i16_be(buf: &[u8], offset: usize) -> Option<i16> {
    read_u16_be(buf, offset).map(|v| v as i16)
}

/// Read an unsigned little-endian 32-bit value at `offset`
#[must_use]
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read an unsigned big-endian 32-bit value at `offset`
#[must_use]
pub fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a signed little-endian 32-bit value at `offset`
#[must_use]
pub fn read_i32_le(buf: &[u8], offset: usize) -> Option<i32> {
    read_u32_le(buf, offset).map(|v| v as i32)
}

/// Read a little-endian IEEE-754 32-bit float at `offset`
#[must_use]
pub fn read_f32_le(buf: &[u8], offset: usize) -> Option<f32> {
    read_u32_le(buf, offset).map(f32::from_bits)
}

// ---------------------------------------------------------------------------
// Inbound packet decoders
// ---------------------------------------------------------------------------

/// Decode a packet from the dedicated monitor/sample characteristic
///
/// Little-endian layout: ticks u32 at 0, positions as signed tenths of a
/// millimeter at 4 and 6, loads as hundredths of a kilogram at 8 and 10,
/// status u16 at 12. Too-short input yields no packet rather than garbage.
#[must_use]
pub fn decode_monitor_packet(data: &[u8]) -> Option<MonitorPacket> {
    if data.len() < MONITOR_PACKET_MIN_LEN {
        return None;
    }

    Some(MonitorPacket {
        ticks: read_u32_le(data, 0)?,
        pos_a_mm: f32::from(read_i16_le(data, 4)?) / 10.0,
        pos_b_mm: f32::from(read_i16_le(data, 6)?) / 10.0,
        load_a_kg: f32::from(read_u16_le(data, 8)?) / 100.0,
        load_b_kg: f32::from(read_u16_le(data, 10)?) / 100.0,
        status: read_u16_le(data, 12)?,
    })
}

/// Decode a metric frame from the RX notification channel
///
/// Big-endian layout behind the `0x01` opcode: ticks u32 at 1, positions as
/// signed tenths of a millimeter at 5 and 7, loads as tenths of a kilogram at
/// 9 and 11, status byte at 13. This is the same physical telemetry as
/// [`decode_monitor_packet`] on a different wire format; the scale factors
/// genuinely differ between the two sources.
#[must_use]
pub fn decode_rx_metric(data: &[u8]) -> Option<MonitorPacket> {
    if data.len() < RX_METRIC_MIN_LEN || data[0] != RX_OPCODE_METRIC {
        return None;
    }

    Some(MonitorPacket {
        ticks: read_u32_be(data, 1)?,
        pos_a_mm: f32::from(read_i16_be(data, 5)?) / 10.0,
        pos_b_mm: f32::from(read_i16_be(data, 7)?) / 10.0,
        load_a_kg: f32::from(read_u16_be(data, 9)?) / 10.0,
        load_b_kg: f32::from(read_u16_be(data, 11)?) / 10.0,
        status: u16::from(*data.get(13)?),
    })
}

/// Decode a rep-completion notification
///
/// Two wire encodings are distinguished purely by payload length:
///
/// * 6-byte legacy: top counter u16 at 0, two unused bytes, complete counter
///   u16 at 4. Used by some device/firmware combinations; carries no ROM
///   boundaries or per-set counts.
/// * 24-byte modern: top/complete counters u32 at 0 and 4, ROM boundary
///   floats at 8 and 12, then four u16 rep-count fields (warmup done/target,
///   working-set done/target).
///
/// `has_opcode_prefix` is true for payloads arriving on the RX channel, where
/// one opcode byte precedes the rep payload. A payload shorter than the
/// applicable minimum (6 bytes without prefix, 7 with) yields no
/// notification.
#[must_use]
pub fn decode_rep_notification(data: &[u8], has_opcode_prefix: bool) -> Option<RepNotification> {
    let payload = if has_opcode_prefix {
        data.get(1..)?
    } else {
        data
    };

    if payload.len() >= REP_MODERN_LEN {
        return Some(RepNotification {
            top_counter: read_u32_le(payload, 0)?,
            complete_counter: read_u32_le(payload, 4)?,
            range_top: read_f32_le(payload, 8)?,
            range_bottom: read_f32_le(payload, 12)?,
            reps_rom_count: read_u16_le(payload, 16)?,
            reps_rom_total: read_u16_le(payload, 18)?,
            reps_set_count: read_u16_le(payload, 20)?,
            reps_set_total: read_u16_le(payload, 22)?,
            is_legacy_format: false,
            timestamp: SystemTime::now(),
        });
    }

    if payload.len() >= REP_LEGACY_LEN {
        return Some(RepNotification {
            top_counter: u32::from(read_u16_le(payload, 0)?),
            complete_counter: u32::from(read_u16_le(payload, 4)?),
            reps_rom_count: 0,
            reps_rom_total: 0,
            reps_set_count: 0,
            reps_set_total: 0,
            range_top: 0.0,
            range_bottom: 0.0,
            is_legacy_format: true,
            timestamp: SystemTime::now(),
        });
    }

    None
}

/// Decode a diagnostic/fault frame
///
/// Layout: uptime seconds u32 at 0, four u16 fault codes at 4, eight signed
/// temperature readings in tenths of a degree Celsius at 12.
#[must_use]
pub fn decode_diagnostic_packet(data: &[u8]) -> Option<DiagnosticPacket> {
    if data.len() < DIAGNOSTIC_PACKET_MIN_LEN {
        return None;
    }

    let mut faults = [0u16; 4];
    for (i, slot) in faults.iter_mut().enumerate() {
        *slot = read_u16_le(data, 4 + i * 2)?;
    }

    let mut temps = [0.0f32; 8];
    for (i, slot) in temps.iter_mut().enumerate() {
        *slot = f32::from(read_i16_le(data, 12 + i * 2)?) / 10.0;
    }

    let has_faults = faults.iter().any(|&f| f != 0);

    Some(DiagnosticPacket {
        seconds: read_u32_le(data, 0)?,
        faults,
        temps,
        has_faults,
    })
}

/// Decode a force/phase sample from the heuristic characteristic
#[must_use]
pub fn decode_heuristic_sample(data: &[u8]) -> Option<HeuristicSample> {
    if data.len() < 5 {
        return None;
    }

    Some(HeuristicSample {
        force_a_kg: f32::from(read_u16_le(data, 0)?) / 10.0,
        force_b_kg: f32::from(read_u16_le(data, 2)?) / 10.0,
        phase: data[4],
    })
}

/// A frame the device wrote back on the RX channel that is neither a metric
/// nor a decodable rep notification
///
/// These are recorded for command-acknowledgment tracking and otherwise
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    /// Opcode the device echoed
    pub opcode: u8,
    /// First payload byte, when present
    pub status: Option<u8>,
}

/// A classified frame from the RX notification channel
#[derive(Debug, Clone, PartialEq)]
pub enum RxFrame {
    /// Opcode `0x01` metric frame of at least 16 bytes
    Metric(MonitorPacket),
    /// Opcode `0x02` rep frame of at least 5 bytes that decoded cleanly
    Rep(RepNotification),
    /// Anything else, kept only for acknowledgment tracking
    Ack(CommandAck),
}

/// Classify one RX notification payload
///
/// Metric frames need opcode `0x01` and at least 16 bytes; rep frames need
/// opcode `0x02` and at least 5 bytes (7 to actually decode). Any other
/// opcode, or a recognized opcode with insufficient length, becomes an
/// [`RxFrame::Ack`]. Empty input yields nothing.
#[must_use]
pub fn parse_rx_frame(data: &[u8]) -> Option<RxFrame> {
    let opcode = *data.first()?;

    if opcode == RX_OPCODE_METRIC {
        if let Some(packet) = decode_rx_metric(data) {
            return Some(RxFrame::Metric(packet));
        }
    }

    if opcode == RX_OPCODE_REP && data.len() >= RX_REP_MIN_LEN {
        if let Some(rep) = decode_rep_notification(data, true) {
            return Some(RxFrame::Rep(rep));
        }
    }

    Some(RxFrame::Ack(CommandAck {
        opcode,
        status: data.get(1).copied(),
    }))
}

// ---------------------------------------------------------------------------
// Outbound command frames
// ---------------------------------------------------------------------------

/// Parameters for the compact 32-byte echo configuration frame
#[derive(Debug, Clone, PartialEq)]
pub struct EchoConfig {
    /// Base resistance in kilograms
    pub base_weight_kg: f32,
    /// Eccentric-phase load as a percentage of the base
    pub eccentric_pct: u8,
    /// Concentric-phase load as a percentage of the base
    pub concentric_pct: u8,
    /// Firmware smoothing factor
    pub smoothing: u8,
    /// Resistance ramp-in time in milliseconds
    pub ramp_ms: u16,
}

/// One segment of a full resistance program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSegment {
    /// Segment duration in seconds
    pub duration_s: u16,
    /// Segment load in hectograms
    pub load_hg: u16,
}

/// Parameters for the full 96-byte program configuration frame
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramConfig {
    /// Resistance mode the program runs in
    pub mode: WorkoutMode,
    /// Program segments, at most [`MAX_PROGRAM_SEGMENTS`]
    pub segments: Vec<ProgramSegment>,
}

/// Parameters for the 25-byte regular configuration frame
#[derive(Debug, Clone, PartialEq)]
pub struct RegularConfig {
    /// Resistance mode
    pub mode: WorkoutMode,
    /// Working weight in kilograms
    pub weight_kg: f32,
    /// Top of the allowed range of motion, millimeters
    pub rom_top_mm: u16,
    /// Bottom of the allowed range of motion, millimeters
    pub rom_bottom_mm: u16,
    /// Warmup reps before the working set
    pub warmup_reps: u8,
    /// Working-set rep target
    pub set_reps: u8,
}

fn weight_to_hectograms(weight_kg: f32) -> Result<u16> {
    if !WEIGHT_RANGE_KG.contains(&weight_kg) {
        return Err(KinetraError::InvalidParameters(format!(
            "Weight {weight_kg:.1} kg is out of range ({:.1} - {:.1})",
            WEIGHT_RANGE_KG.start(),
            WEIGHT_RANGE_KG.end()
        )));
    }
    Ok((weight_kg * 10.0).round() as u16)
}

/// Encode the 4-byte init frame
#[must_use]
pub fn encode_init() -> Bytes {
    Bytes::from_static(&[OPCODE_INIT, 0x00, 0x00, 0x00])
}

/// Encode the 4-byte start-workout frame
///
/// Layout: opcode, mode byte, weight in hectograms as little-endian u16.
///
/// # Errors
///
/// Returns [`KinetraError::InvalidParameters`] when the weight is outside the
/// range the hardware accepts.
pub fn encode_start_workout(mode: WorkoutMode, weight_kg: f32) -> Result<Bytes> {
    let weight_hg = weight_to_hectograms(weight_kg)?;
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(OPCODE_START);
    buf.put_u8(mode as u8);
    buf.put_u16_le(weight_hg);
    Ok(buf.freeze())
}

/// Encode the single-byte reset/stop frame
#[must_use]
pub fn encode_stop() -> Bytes {
    Bytes::from_static(&[OPCODE_STOP])
}

/// Encode the single-byte soft-stop frame
///
/// Soft stop releases tension but leaves the session armed so that grabbing
/// the handles starts the next set without an explicit start command.
#[must_use]
pub fn encode_soft_stop() -> Bytes {
    Bytes::from_static(&[OPCODE_SOFT_STOP])
}

/// Encode the 2-byte color-scheme frame
#[must_use]
pub fn encode_color_scheme(scheme: ColorScheme) -> Bytes {
    Bytes::from(vec![OPCODE_COLOR_SCHEME, scheme as u8])
}

/// Encode the 32-byte echo configuration frame
///
/// # Errors
///
/// Returns [`KinetraError::InvalidParameters`] when the base weight is
/// outside the range the hardware accepts.
pub fn encode_echo_config(config: &EchoConfig) -> Result<Bytes> {
    let weight_hg = weight_to_hectograms(config.base_weight_kg)?;
    let mut buf = BytesMut::with_capacity(ECHO_CONFIG_SIZE);
    buf.put_u8(OPCODE_ECHO_CONFIG);
    buf.put_u16_le(weight_hg);
    buf.put_u8(config.eccentric_pct);
    buf.put_u8(config.concentric_pct);
    buf.put_u8(config.smoothing);
    buf.put_u16_le(config.ramp_ms);
    buf.resize(ECHO_CONFIG_SIZE, 0);
    Ok(buf.freeze())
}

/// Encode the 96-byte program configuration frame
///
/// Layout: opcode, mode byte, segment count, reserved byte, then up to
/// [`MAX_PROGRAM_SEGMENTS`] segments of four bytes each (duration seconds and
/// load hectograms, both little-endian u16); unused slots are zero.
///
/// # Errors
///
/// Returns [`KinetraError::InvalidParameters`] when the program carries more
/// segments than the frame can hold.
pub fn encode_program_config(config: &ProgramConfig) -> Result<Bytes> {
    if config.segments.len() > MAX_PROGRAM_SEGMENTS {
        return Err(KinetraError::InvalidParameters(format!(
            "Program has {} segments, frame holds at most {MAX_PROGRAM_SEGMENTS}",
            config.segments.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(PROGRAM_CONFIG_SIZE);
    buf.put_u8(OPCODE_PROGRAM_CONFIG);
    buf.put_u8(config.mode as u8);
    buf.put_u8(config.segments.len() as u8);
    buf.put_u8(0x00);
    for segment in &config.segments {
        buf.put_u16_le(segment.duration_s);
        buf.put_u16_le(segment.load_hg);
    }
    buf.resize(PROGRAM_CONFIG_SIZE, 0);
    Ok(buf.freeze())
}

/// Encode the 25-byte regular configuration frame
///
/// # Errors
///
/// Returns [`KinetraError::InvalidParameters`] when the weight is outside the
/// range the hardware accepts, or the ROM bounds are inverted.
pub fn encode_regular_config(config: &RegularConfig) -> Result<Bytes> {
    let weight_hg = weight_to_hectograms(config.weight_kg)?;
    if config.rom_bottom_mm >= config.rom_top_mm {
        return Err(KinetraError::InvalidParameters(format!(
            "ROM bottom {} must be below top {}",
            config.rom_bottom_mm, config.rom_top_mm
        )));
    }

    let mut buf = BytesMut::with_capacity(REGULAR_CONFIG_SIZE);
    buf.put_u8(OPCODE_REGULAR_CONFIG);
    buf.put_u8(config.mode as u8);
    buf.put_u16_le(weight_hg);
    buf.put_u16_le(config.rom_top_mm);
    buf.put_u16_le(config.rom_bottom_mm);
    buf.put_u8(config.warmup_reps);
    buf.put_u8(config.set_reps);
    buf.resize(REGULAR_CONFIG_SIZE, 0);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColorScheme;

    #[test]
    fn test_u16_readers_never_negative() {
        assert_eq!(read_u16_le(&[0xFF, 0xFF], 0), Some(65535));
        assert_eq!(read_u16_be(&[0xFF, 0xFF], 0), Some(65535));
        assert_eq!(read_u16_le(&[0x01, 0x02], 0), Some(513));
        assert_eq!(read_u16_be(&[0x01, 0x02], 0), Some(258));
    }

    #[test]
    fn test_i16_readers() {
        assert_eq!(read_i16_le(&[0xFF, 0xFF], 0), Some(-1));
        assert_eq!(read_i16_le(&[0x00, 0x80], 0), Some(-32768));
        assert_eq!(read_i16_le(&[0xFF, 0x7F], 0), Some(32767));
        assert_eq!(read_i16_be(&[0x80, 0x00], 0), Some(-32768));
    }

    #[test]
    fn test_32bit_readers() {
        assert_eq!(read_u32_le(&[0x01, 0x00, 0x00, 0x00], 0), Some(1));
        assert_eq!(read_u32_be(&[0x00, 0x00, 0x00, 0x01], 0), Some(1));
        assert_eq!(
            read_u32_le(&[0xFF, 0xFF, 0xFF, 0xFF], 0),
            Some(4_294_967_295)
        );
        assert_eq!(read_i32_le(&[0xFF, 0xFF, 0xFF, 0xFF], 0), Some(-1));

        let bytes = 1.5f32.to_le_bytes();
        assert_eq!(read_f32_le(&bytes, 0), Some(1.5));
    }

    #[test]
    fn test_readers_reject_short_buffers() {
        assert_eq!(read_u16_le(&[0xFF], 0), None);
        assert_eq!(read_u16_le(&[0xFF, 0xFF], 1), None);
        assert_eq!(read_u32_be(&[0x00, 0x00, 0x00], 0), None);
        assert_eq!(read_f32_le(&[0x00; 3], 0), None);
    }

    #[test]
    fn test_monitor_packet_decode() {
        let mut data = Vec::new();
        data.extend_from_slice(&1000u32.to_le_bytes());
        data.extend_from_slice(&2500i16.to_le_bytes()); // 250.0 mm
        data.extend_from_slice(&(-15i16).to_le_bytes()); // -1.5 mm
        data.extend_from_slice(&1250u16.to_le_bytes()); // 12.50 kg
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0x0003u16.to_le_bytes());

        let packet = decode_monitor_packet(&data).unwrap();
        assert_eq!(packet.ticks, 1000);
        assert!((packet.pos_a_mm - 250.0).abs() < f32::EPSILON);
        assert!((packet.pos_b_mm + 1.5).abs() < f32::EPSILON);
        assert!((packet.load_a_kg - 12.5).abs() < f32::EPSILON);
        assert_eq!(packet.status, 3);

        assert_eq!(decode_monitor_packet(&data[..13]), None);
    }

    #[test]
    fn test_rx_metric_decode() {
        let mut data = vec![RX_OPCODE_METRIC];
        data.extend_from_slice(&42u32.to_be_bytes());
        data.extend_from_slice(&1200i16.to_be_bytes()); // 120.0 mm
        data.extend_from_slice(&800i16.to_be_bytes()); // 80.0 mm
        data.extend_from_slice(&250u16.to_be_bytes()); // 25.0 kg
        data.extend_from_slice(&125u16.to_be_bytes()); // 12.5 kg
        data.push(0x01); // status
        data.extend_from_slice(&[0x00, 0x00]); // reserved

        let packet = decode_rx_metric(&data).unwrap();
        assert_eq!(packet.ticks, 42);
        assert!((packet.pos_a_mm - 120.0).abs() < f32::EPSILON);
        assert!((packet.pos_b_mm - 80.0).abs() < f32::EPSILON);
        assert!((packet.load_a_kg - 25.0).abs() < f32::EPSILON);
        assert!((packet.load_b_kg - 12.5).abs() < f32::EPSILON);
        assert_eq!(packet.status, 1);
    }

    #[test]
    fn test_rx_metric_rejects_short_buffer() {
        let data = vec![RX_OPCODE_METRIC; 15];
        assert_eq!(decode_rx_metric(&data), None);
    }

    #[test]
    fn test_rep_decode_legacy() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u16.to_le_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&5u16.to_le_bytes());

        let rep = decode_rep_notification(&data, false).unwrap();
        assert!(rep.is_legacy_format);
        assert_eq!(rep.top_counter, 7);
        assert_eq!(rep.complete_counter, 5);
        assert_eq!(rep.reps_set_count, 0);
    }

    #[test]
    fn test_rep_decode_modern() {
        let mut data = Vec::new();
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(&850.0f32.to_le_bytes());
        data.extend_from_slice(&120.0f32.to_le_bytes());
        data.extend_from_slice(&3u16.to_le_bytes()); // rom count
        data.extend_from_slice(&3u16.to_le_bytes()); // rom total
        data.extend_from_slice(&8u16.to_le_bytes()); // set count
        data.extend_from_slice(&10u16.to_le_bytes()); // set total
        assert_eq!(data.len(), REP_MODERN_LEN);

        let rep = decode_rep_notification(&data, false).unwrap();
        assert!(!rep.is_legacy_format);
        assert_eq!(rep.top_counter, 12);
        assert_eq!(rep.complete_counter, 10);
        assert_eq!(rep.reps_rom_count, 3);
        assert_eq!(rep.reps_set_count, 8);
        assert_eq!(rep.reps_set_total, 10);
        assert!((rep.range_top - 850.0).abs() < f32::EPSILON);
        assert!((rep.range_bottom - 120.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rep_decode_too_short() {
        assert_eq!(decode_rep_notification(&[0x00; 4], false), None);
        // With a prefix the minimum rises to 7: 6 bytes leave a 5-byte payload.
        assert_eq!(decode_rep_notification(&[0x00; 6], true), None);
        assert!(decode_rep_notification(&[0x00; 7], true).is_some());
    }

    #[test]
    fn test_rep_prefix_offsets() {
        let mut data = vec![RX_OPCODE_REP];
        data.extend_from_slice(&9u16.to_le_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        data.extend_from_slice(&4u16.to_le_bytes());

        let rep = decode_rep_notification(&data, true).unwrap();
        assert!(rep.is_legacy_format);
        assert_eq!(rep.top_counter, 9);
        assert_eq!(rep.complete_counter, 4);
    }

    #[test]
    fn test_diagnostic_decode() {
        let mut data = Vec::new();
        data.extend_from_slice(&3600u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0x0102u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        for i in 0..8 {
            data.extend_from_slice(&(200i16 + i as i16 * 10).to_le_bytes());
        }

        let packet = decode_diagnostic_packet(&data).unwrap();
        assert_eq!(packet.seconds, 3600);
        assert!(packet.has_faults);
        assert_eq!(packet.faults[1], 0x0102);
        assert!((packet.temps[0] - 20.0).abs() < f32::EPSILON);
        assert!((packet.temps[7] - 27.0).abs() < f32::EPSILON);

        assert_eq!(decode_diagnostic_packet(&data[..27]), None);
    }

    #[test]
    fn test_diagnostic_no_faults() {
        let mut data = vec![0u8; DIAGNOSTIC_PACKET_MIN_LEN];
        data[0] = 10;
        let packet = decode_diagnostic_packet(&data).unwrap();
        assert!(!packet.has_faults);
    }

    #[test]
    fn test_rx_frame_classification() {
        // Unknown opcode is recorded as an ack.
        let frame = parse_rx_frame(&[0x4F, 0x00]).unwrap();
        assert_eq!(
            frame,
            RxFrame::Ack(CommandAck {
                opcode: 0x4F,
                status: Some(0x00)
            })
        );

        // A metric opcode without the bytes to back it becomes an ack too.
        let frame = parse_rx_frame(&[RX_OPCODE_METRIC, 0x01, 0x02]).unwrap();
        assert!(matches!(frame, RxFrame::Ack(_)));

        assert_eq!(parse_rx_frame(&[]), None);
    }

    #[test]
    fn test_init_frame() {
        let frame = encode_init();
        assert_eq!(frame.as_ref(), &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_start_workout_frame() {
        let frame = encode_start_workout(WorkoutMode::Eccentric, 25.0).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(frame[0], OPCODE_START);
        assert_eq!(frame[1], WorkoutMode::Eccentric as u8);
        // 25.0 kg = 250 hectograms, little-endian
        assert_eq!(&frame[2..4], &250u16.to_le_bytes());

        assert!(encode_start_workout(WorkoutMode::Standard, 0.0).is_err());
        assert!(encode_start_workout(WorkoutMode::Standard, 150.0).is_err());
    }

    #[test]
    fn test_stop_frames_distinct() {
        assert_eq!(encode_stop().as_ref(), &[0x0A]);
        assert_eq!(encode_soft_stop().as_ref(), &[0x50]);
        assert_ne!(encode_stop(), encode_soft_stop());
    }

    #[test]
    fn test_color_scheme_frame() {
        let frame = encode_color_scheme(ColorScheme::Ocean);
        assert_eq!(frame.as_ref(), &[OPCODE_COLOR_SCHEME, 2]);
    }

    #[test]
    fn test_echo_config_frame() {
        let config = EchoConfig {
            base_weight_kg: 30.0,
            eccentric_pct: 120,
            concentric_pct: 100,
            smoothing: 4,
            ramp_ms: 500,
        };
        let frame = encode_echo_config(&config).unwrap();
        assert_eq!(frame.len(), ECHO_CONFIG_SIZE);
        assert_eq!(frame[0], OPCODE_ECHO_CONFIG);
        assert_eq!(&frame[1..3], &300u16.to_le_bytes());
        assert_eq!(frame[3], 120);
        assert_eq!(&frame[6..8], &500u16.to_le_bytes());
        assert!(frame[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_program_config_frame() {
        let config = ProgramConfig {
            mode: WorkoutMode::Chains,
            segments: vec![
                ProgramSegment {
                    duration_s: 30,
                    load_hg: 200,
                },
                ProgramSegment {
                    duration_s: 60,
                    load_hg: 350,
                },
            ],
        };
        let frame = encode_program_config(&config).unwrap();
        assert_eq!(frame.len(), PROGRAM_CONFIG_SIZE);
        assert_eq!(frame[0], OPCODE_PROGRAM_CONFIG);
        assert_eq!(frame[1], WorkoutMode::Chains as u8);
        assert_eq!(frame[2], 2);
        assert_eq!(&frame[4..6], &30u16.to_le_bytes());
        assert_eq!(&frame[6..8], &200u16.to_le_bytes());
        assert_eq!(&frame[8..10], &60u16.to_le_bytes());
        assert_eq!(&frame[10..12], &350u16.to_le_bytes());
    }

    #[test]
    fn test_program_config_segment_limit() {
        let config = ProgramConfig {
            mode: WorkoutMode::Standard,
            segments: vec![
                ProgramSegment {
                    duration_s: 1,
                    load_hg: 1,
                };
                MAX_PROGRAM_SEGMENTS + 1
            ],
        };
        assert!(encode_program_config(&config).is_err());
    }

    #[test]
    fn test_regular_config_frame() {
        let config = RegularConfig {
            mode: WorkoutMode::Standard,
            weight_kg: 42.5,
            rom_top_mm: 900,
            rom_bottom_mm: 100,
            warmup_reps: 3,
            set_reps: 10,
        };
        let frame = encode_regular_config(&config).unwrap();
        assert_eq!(frame.len(), REGULAR_CONFIG_SIZE);
        assert_eq!(frame[0], OPCODE_REGULAR_CONFIG);
        assert_eq!(&frame[2..4], &425u16.to_le_bytes());
        assert_eq!(&frame[4..6], &900u16.to_le_bytes());
        assert_eq!(&frame[6..8], &100u16.to_le_bytes());
        assert_eq!(frame[8], 3);
        assert_eq!(frame[9], 10);

        let inverted = RegularConfig {
            rom_top_mm: 100,
            rom_bottom_mm: 900,
            ..config
        };
        assert!(encode_regular_config(&inverted).is_err());
    }

    #[test]
    fn test_heuristic_decode() {
        let mut data = Vec::new();
        data.extend_from_slice(&150u16.to_le_bytes());
        data.extend_from_slice(&148u16.to_le_bytes());
        data.push(2);

        let sample = decode_heuristic_sample(&data).unwrap();
        assert!((sample.force_a_kg - 15.0).abs() < f32::EPSILON);
        assert!((sample.force_b_kg - 14.8).abs() < f32::EPSILON);
        assert_eq!(sample.phase, 2);

        assert_eq!(decode_heuristic_sample(&data[..4]), None);
    }
}
