//! Hardware PID filter table mirror.
//!
//! The front-end filters packets through a fixed table of PID slots
//! addressed via the TS_PL_PID_INDEX/TS_PL_PID_DATA register pair. This
//! module owns slot allocation and keeps the software mirror and the
//! hardware registers in step. All mutation is serialized by the device
//! lock; there is no read-modify-write on the register pair itself.

use log::debug;

use crate::error::{DemuxError, Result};
use crate::packet::NULL_PID;
use crate::regs::{RegisterPort, TS_PL_PID_DATA, TS_PL_PID_INDEX};

/// Number of hardware PID filter slots.
pub const FILTER_CAPACITY: usize = 256;

/// Fixed-capacity mapping from filter slot index to PID.
pub struct PidFilterTable {
    /// `Some(pid)` for an active slot, `None` for a free one. A free
    /// slot's data register holds the `0x1fff` sentinel.
    slots: [Option<u16>; FILTER_CAPACITY],
}

impl PidFilterTable {
    pub fn new() -> Self {
        Self { slots: [None; FILTER_CAPACITY] }
    }

    /// Program `pid` into the lowest free slot and return its index.
    ///
    /// If the PID already occupies a slot, that index is returned and
    /// no register write is issued; one physical slot serves every feed
    /// sharing the PID. The index register is written before the data
    /// register so the data write lands on the addressed slot.
    pub fn add(&mut self, pid: u16, port: &dyn RegisterPort) -> Result<usize> {
        if pid > NULL_PID {
            return Err(DemuxError::InvalidPid(pid));
        }
        if let Some(index) = self.index_of(pid) {
            return Ok(index);
        }
        let index = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(DemuxError::OutOfFilters)?;
        port.write(TS_PL_PID_INDEX, index as u32)?;
        port.write(TS_PL_PID_DATA, (pid & NULL_PID) as u32)?;
        self.slots[index] = Some(pid);
        debug!("pid filter: added pid 0x{:04x} at index {}", pid, index);
        Ok(index)
    }

    /// Deactivate a slot, writing the sentinel PID to hardware.
    ///
    /// Idempotent: removing a free or out-of-range slot does nothing.
    pub fn remove(&mut self, index: usize, port: &dyn RegisterPort) -> Result<()> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        if slot.is_none() {
            return Ok(());
        }
        port.write(TS_PL_PID_INDEX, index as u32)?;
        port.write(TS_PL_PID_DATA, NULL_PID as u32)?;
        *slot = None;
        debug!("pid filter: removed index {}", index);
        Ok(())
    }

    /// The slot index currently filtering `pid`, if any.
    pub fn index_of(&self, pid: u16) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(pid))
    }

    /// Number of active slots.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Deactivate every slot (device teardown).
    pub fn clear(&mut self, port: &dyn RegisterPort) -> Result<()> {
        for index in 0..FILTER_CAPACITY {
            self.remove(index, port)?;
        }
        Ok(())
    }
}

impl Default for PidFilterTable {
    fn default() -> Self {
        Self::new()
    }
}
