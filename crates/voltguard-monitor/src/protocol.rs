//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Power-chip telemetry frame codec.
//!
//! Wire layout, 9600 8N1: `[0xFF][voltage][current][checksum]` where the checksum is the
//! byte sum of the first three bytes modulo 256. Voltage is 1 V per unit and current
//! 0.1 A per unit.

use serde::Serialize;
use thiserror::Error;

pub const FRAME_HEADER: u8 = 0xFF;
pub const FRAME_LEN: usize = 4;
/// Bytes inspected for a header before the window is declared noise.
pub const LOOKAHEAD: usize = 8;
pub const VOLTS_PER_UNIT: f64 = 1.0;
pub const AMPS_PER_UNIT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no frame header in {scanned} byte window")]
    NoHeader { scanned: usize },
    #[error("header at offset {offset} but only {available} bytes follow it")]
    NoFrame { offset: usize, available: usize },
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },
}

/// One decoded telemetry frame. Frames with a bad checksum are still produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryFrame {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub raw: [u8; FRAME_LEN],
    pub timestamp_ms: u64,
    pub checksum_valid: bool,
}

impl TelemetryFrame {
    /// Promote a checksum flag into an error for callers that only want trusted frames.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        if self.checksum_valid {
            Ok(())
        } else {
            Err(ProtocolError::ChecksumMismatch {
                computed: checksum(&self.raw[..3]),
                received: self.raw[3],
            })
        }
    }
}

/// A frame together with its position in the scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedFrame {
    pub frame: TelemetryFrame,
    /// Offset of the header byte; bytes before it were noise.
    pub offset: usize,
}

impl DecodedFrame {
    /// Number of bytes the caller should discard from the front of its buffer.
    pub fn consumed(&self) -> usize {
        self.offset + FRAME_LEN
    }
}

/// Byte-sum checksum used by the power chip.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Decode the first frame in `window`.
///
/// Only the first [`LOOKAHEAD`] bytes are searched for a header. The result depends
/// only on the arguments.
pub fn decode_frame(window: &[u8], timestamp_ms: u64) -> Result<DecodedFrame, ProtocolError> {
    let scanned = window.len().min(LOOKAHEAD);
    let offset = window[..scanned]
        .iter()
        .position(|b| *b == FRAME_HEADER)
        .ok_or(ProtocolError::NoHeader { scanned })?;

    let available = window.len() - offset;
    if available < FRAME_LEN {
        return Err(ProtocolError::NoFrame { offset, available });
    }

    let mut raw = [0u8; FRAME_LEN];
    raw.copy_from_slice(&window[offset..offset + FRAME_LEN]);
    let voltage = f64::from(raw[1]) * VOLTS_PER_UNIT;
    let current = f64::from(raw[2]) * AMPS_PER_UNIT;

    Ok(DecodedFrame {
        frame: TelemetryFrame {
            voltage,
            current,
            power: voltage * current,
            raw,
            timestamp_ms,
            checksum_valid: checksum(&raw[..3]) == raw[3],
        },
        offset,
    })
}

/// Build a well-formed frame. Used by simulators and tests.
pub fn encode_frame(voltage_units: u8, current_units: u8) -> [u8; FRAME_LEN] {
    let body = [FRAME_HEADER, voltage_units, current_units];
    [body[0], body[1], body[2], checksum(&body)]
}
