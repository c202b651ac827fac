//! Hardware register map and register access port.
//!
//! Offsets and bit layouts follow the GXL-family TS front-end block.
//! All access goes through the [`RegisterPort`] trait so the engine can
//! run against real MMIO (supplied by the platform layer) or against
//! the in-memory [`ShadowRegisters`] used for host-side testing.

use parking_lot::Mutex;

use crate::error::{DemuxError, Result};

/// Top-level configuration: enable, serial/parallel, polarities, endianness.
pub const TS_TOP_CONFIG: u32 = 0x00;
/// Top-level status flags.
pub const TS_TOP_STATUS: u32 = 0x04;
/// PID filter slot index to address.
pub const TS_PL_PID_INDEX: u32 = 0x10;
/// PID value for the addressed slot (13 bits, 0x1fff = inactive).
pub const TS_PL_PID_DATA: u32 = 0x14;
/// DMA control: enable, reset, irq-enable, scatter-gather.
pub const TS_DMA_CONTROL: u32 = 0x20;
/// Hardware write cursor (offset into the ring).
pub const TS_DMA_WR_PTR: u32 = 0x24;
/// Software read cursor (offset into the ring).
pub const TS_DMA_RD_PTR: u32 = 0x28;
/// Ring size in bytes.
pub const TS_DMA_BUFF_SIZE: u32 = 0x2c;
/// DMA region start address.
pub const TS_DMA_START_ADDR: u32 = 0x30;
/// DMA region end address.
pub const TS_DMA_END_ADDR: u32 = 0x34;
/// Interrupt control.
pub const TS_INT_CONTROL: u32 = 0x40;
/// Interrupt status (write-one-to-clear).
pub const TS_INT_STATUS: u32 = 0x44;
/// Interrupt mask.
pub const TS_INT_MASK: u32 = 0x48;

/* TS_TOP_CONFIG bits */
pub const TS_TOP_CONFIG_ENABLE: u32 = 1 << 0;
pub const TS_TOP_CONFIG_SERIAL: u32 = 1 << 1;
pub const TS_TOP_CONFIG_PARALLEL: u32 = 1 << 2;
pub const TS_TOP_CONFIG_CLK_POL: u32 = 1 << 3;
pub const TS_TOP_CONFIG_SYNC_POL: u32 = 1 << 4;
pub const TS_TOP_CONFIG_VALID_POL: u32 = 1 << 5;
pub const TS_TOP_CONFIG_BIT_ENDIAN: u32 = 1 << 6;
pub const TS_TOP_CONFIG_BYTE_ENDIAN: u32 = 1 << 7;

/* TS_DMA_CONTROL bits */
pub const TS_DMA_CONTROL_ENABLE: u32 = 1 << 0;
pub const TS_DMA_CONTROL_RESET: u32 = 1 << 1;
pub const TS_DMA_CONTROL_IRQ_ENABLE: u32 = 1 << 2;
pub const TS_DMA_CONTROL_SG_MODE: u32 = 1 << 3;

/* TS_INT_STATUS bits */
pub const TS_INT_STATUS_DMA_DONE: u32 = 1 << 0;
pub const TS_INT_STATUS_OVERFLOW: u32 = 1 << 1;
pub const TS_INT_STATUS_TIMEOUT: u32 = 1 << 2;
pub const TS_INT_STATUS_ERROR: u32 = 1 << 3;

/// Memory-mapped register access with device memory ordering.
///
/// Implementations must issue `read`/`write` in program order as seen
/// by the device (volatile access plus the appropriate barriers on real
/// hardware). A failed access maps to [`DemuxError::HardwareFault`];
/// callers treat that as fatal and stop touching the device.
pub trait RegisterPort: Send + Sync {
    /// Read a 32-bit register at `reg` bytes from the device base.
    fn read(&self, reg: u32) -> Result<u32>;

    /// Write a 32-bit register at `reg` bytes from the device base.
    fn write(&self, reg: u32, val: u32) -> Result<()>;

    /// Read-modify-write: set `bits` in `reg`.
    ///
    /// Not atomic on its own; the caller serializes mutation (the
    /// device lock in this crate).
    fn set_bits(&self, reg: u32, bits: u32) -> Result<()> {
        let val = self.read(reg)?;
        self.write(reg, val | bits)
    }

    /// Read-modify-write: clear `bits` in `reg`.
    fn clear_bits(&self, reg: u32, bits: u32) -> Result<()> {
        let val = self.read(reg)?;
        self.write(reg, val & !bits)
    }
}

/// Number of 32-bit words covered by the shadow register file.
const SHADOW_WORDS: usize = 0x80 / 4;

struct ShadowState {
    words: [u32; SHADOW_WORDS],
    log: Vec<(u32, u32)>,
    faulty: bool,
}

/// In-memory register file for host-side simulation and tests.
///
/// Keeps a trace of every write so bring-up code and tests can inspect
/// the exact register programming sequence. `set_faulty` makes every
/// subsequent access fail, modeling a dead bus.
pub struct ShadowRegisters {
    state: Mutex<ShadowState>,
}

impl ShadowRegisters {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShadowState {
                words: [0; SHADOW_WORDS],
                log: Vec::new(),
                faulty: false,
            }),
        }
    }

    /// Make every subsequent register access fail (or recover).
    pub fn set_faulty(&self, faulty: bool) {
        self.state.lock().faulty = faulty;
    }

    /// Assert interrupt status bits, as the hardware does on an event.
    ///
    /// Bus writes to `TS_INT_STATUS` can only clear bits; this is the
    /// hardware-side path that sets them.
    pub fn raise_interrupt(&self, bits: u32) {
        self.state.lock().words[(TS_INT_STATUS / 4) as usize] |= bits;
    }

    /// The `(offset, value)` trace of all writes, oldest first.
    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.state.lock().log.clone()
    }

    /// Number of writes issued to `reg` so far.
    pub fn write_count(&self, reg: u32) -> usize {
        self.state.lock().log.iter().filter(|(r, _)| *r == reg).count()
    }

    fn word_index(reg: u32) -> Result<usize> {
        if reg % 4 != 0 {
            return Err(DemuxError::HardwareFault);
        }
        let idx = (reg / 4) as usize;
        if idx >= SHADOW_WORDS {
            return Err(DemuxError::HardwareFault);
        }
        Ok(idx)
    }
}

impl Default for ShadowRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterPort for ShadowRegisters {
    fn read(&self, reg: u32) -> Result<u32> {
        let state = self.state.lock();
        if state.faulty {
            return Err(DemuxError::HardwareFault);
        }
        Ok(state.words[Self::word_index(reg)?])
    }

    fn write(&self, reg: u32, val: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.faulty {
            return Err(DemuxError::HardwareFault);
        }
        let idx = Self::word_index(reg)?;
        if reg == TS_INT_STATUS {
            // Write-one-to-clear, like the hardware block.
            state.words[idx] &= !val;
        } else {
            state.words[idx] = val;
        }
        state.log.push((reg, val));
        Ok(())
    }
}
