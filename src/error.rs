//! Error types for the demux engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DemuxError>;

/// Errors surfaced by the demux engine.
///
/// Control-path operations (feed start/stop, device configuration)
/// return these synchronously. A ring overflow is recovered locally and
/// reported to feeds as discontinuity metadata, so `BufferOverflow`
/// surfaces only from the explicit ring diagnostic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxError {
    /// PID does not fit in 13 bits.
    #[error("invalid PID 0x{0:04x} (must be <= 0x1fff)")]
    InvalidPid(u16),

    /// Every hardware filter slot is occupied.
    #[error("no free hardware PID filter slot")]
    OutOfFilters,

    /// The device has not been initialized yet.
    #[error("device not initialized")]
    DeviceNotReady,

    /// The operation needs an idle device (no active feeds, DMA stopped).
    #[error("device busy")]
    DeviceBusy,

    /// The hardware write cursor lapped the software read cursor.
    #[error("DMA ring buffer overflow")]
    BufferOverflow,

    /// A register access failed. The device is unusable until it is
    /// reinitialized through the platform layer.
    #[error("hardware fault during register access")]
    HardwareFault,
}
