//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Sampling and telemetry protocol engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Hardware seams consumed by the sampling engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Single-shot analog-to-digital channel wired to the supply divider.
pub trait AnalogChannel: Send {
    /// Perform one conversion and return the raw count.
    fn read_raw(&mut self) -> Result<u16, HalError>;
}

/// Non-blocking byte source fed by the power-delivery chip's UART.
pub trait SerialSource: Send {
    /// Copy whatever bytes are already buffered into `buf` and return how many were
    /// written. Must return `Ok(0)` instead of waiting when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, HalError>;
}

impl<T: AnalogChannel + ?Sized> AnalogChannel for Box<T> {
    fn read_raw(&mut self) -> Result<u16, HalError> {
        (**self).read_raw()
    }
}

impl<T: SerialSource + ?Sized> SerialSource for Box<T> {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, HalError> {
        (**self).read_available(buf)
    }
}
