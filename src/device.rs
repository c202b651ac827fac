//! Device aggregate root and feed lifecycle management.
//!
//! `DemuxDevice` owns the PID filter table, the DMA ring, and the feed
//! set, and is the single mutator of all three. Two execution contexts
//! touch it: the control path (feed start/stop, configuration) takes
//! the device lock and may block; the event path (`handle_interrupt`)
//! drains the ring and dispatches against an immutable snapshot, never
//! waiting on the control path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::demux::{demux_chunk, DispatchTable};
use crate::dma::{DmaRingBuffer, DEFAULT_RING_SIZE};
use crate::error::{DemuxError, Result};
use crate::feed::{Feed, FeedHandle, FeedKind, FeedSink, FeedState, Quiesce};
use crate::filter::PidFilterTable;
use crate::packet::NULL_PID;
use crate::regs::*;
use crate::section::SectionFilter;

/// TS input mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TsMode {
    /// Pick a default for the SoC family (serial on GXL).
    #[default]
    Auto,
    Serial,
    Parallel,
}

/// TS pin interface configuration, programmed into TS_TOP_CONFIG.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsConfig {
    pub mode: TsMode,
    pub clk_pol: bool,
    pub sync_pol: bool,
    pub valid_pol: bool,
    pub bit_endian: bool,
    pub byte_endian: bool,
    /// Scatter-gather DMA descriptor mode.
    pub dma_scatter_gather: bool,
}

impl TsConfig {
    fn top_config_bits(&self) -> u32 {
        let mut bits = TS_TOP_CONFIG_ENABLE;
        bits |= match self.mode {
            TsMode::Auto | TsMode::Serial => TS_TOP_CONFIG_SERIAL,
            TsMode::Parallel => TS_TOP_CONFIG_PARALLEL,
        };
        if self.clk_pol {
            bits |= TS_TOP_CONFIG_CLK_POL;
        }
        if self.sync_pol {
            bits |= TS_TOP_CONFIG_SYNC_POL;
        }
        if self.valid_pol {
            bits |= TS_TOP_CONFIG_VALID_POL;
        }
        if self.bit_endian {
            bits |= TS_TOP_CONFIG_BIT_ENDIAN;
        }
        if self.byte_endian {
            bits |= TS_TOP_CONFIG_BYTE_ENDIAN;
        }
        bits
    }
}

/// Control-path state, all mutation serialized by one lock.
struct ControlState {
    ready: bool,
    filters: PidFilterTable,
    feeds: HashMap<FeedHandle, Arc<Feed>>,
    /// PID to hardware slot index; one physical slot per distinct PID
    /// no matter how many feeds share it.
    pid_slots: HashMap<u16, usize>,
    next_handle: u32,
}

/// The TS front-end demux device.
pub struct DemuxDevice {
    port: Arc<dyn RegisterPort>,
    config: Mutex<TsConfig>,
    ctrl: Mutex<ControlState>,
    dma: Mutex<DmaRingBuffer>,
    /// Copy-then-swap dispatch snapshot; the event path clones the Arc
    /// and reads it without any further locking.
    snapshot: Mutex<Arc<DispatchTable>>,
    quiesce: Quiesce,
    /// Latched on any failed register access or error interrupt; only
    /// `init` clears it.
    faulted: AtomicBool,
}

impl DemuxDevice {
    pub fn new(port: Arc<dyn RegisterPort>, config: TsConfig) -> Self {
        Self {
            port,
            config: Mutex::new(config),
            ctrl: Mutex::new(ControlState {
                ready: false,
                filters: PidFilterTable::new(),
                feeds: HashMap::new(),
                pid_slots: HashMap::new(),
                next_handle: 1,
            }),
            dma: Mutex::new(DmaRingBuffer::new(DEFAULT_RING_SIZE)),
            snapshot: Mutex::new(Arc::new(DispatchTable::new())),
            quiesce: Quiesce::default(),
            faulted: AtomicBool::new(false),
        }
    }

    /// Latch the fault state on a failed register access.
    fn hw<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(DemuxError::HardwareFault)) {
            self.faulted.store(true, Ordering::SeqCst);
        }
        result
    }

    fn check_faulted(&self) -> Result<()> {
        if self.faulted.load(Ordering::SeqCst) {
            return Err(DemuxError::HardwareFault);
        }
        Ok(())
    }

    /// Bring up the hardware: reset the DMA engine, program the TS
    /// input mode and interrupt masks, and mark the device ready.
    ///
    /// Also the explicit recovery path after a hardware fault.
    pub fn init(&self) -> Result<()> {
        let mut ctrl = self.ctrl.lock();
        self.faulted.store(false, Ordering::SeqCst);

        self.hw(self.port.write(TS_TOP_CONFIG, 0))?;
        // Reset pulse on the DMA engine.
        self.hw(self.port.write(TS_DMA_CONTROL, TS_DMA_CONTROL_RESET))?;
        self.hw(self.port.write(TS_DMA_CONTROL, 0))?;

        let config = *self.config.lock();
        if config.mode == TsMode::Auto {
            info!("tsdmx: auto TS mode, defaulting to serial");
        }
        self.hw(self.port.write(TS_TOP_CONFIG, config.top_config_bits()))?;

        self.hw(self.port.write(TS_INT_STATUS, 0xffff_ffff))?;
        self.hw(self.port.write(
            TS_INT_MASK,
            TS_INT_STATUS_DMA_DONE | TS_INT_STATUS_OVERFLOW | TS_INT_STATUS_ERROR,
        ))?;

        let dma = self.dma.lock();
        self.program_dma_region(&dma)?;
        drop(dma);

        ctrl.ready = true;
        info!("tsdmx: initialized ({:?} mode)", config.mode);
        Ok(())
    }

    fn program_dma_region(&self, dma: &DmaRingBuffer) -> Result<()> {
        // The model keeps the region at bus address zero.
        self.hw(self.port.write(TS_DMA_START_ADDR, 0))?;
        self.hw(self.port.write(TS_DMA_END_ADDR, dma.size() as u32))?;
        self.hw(self.port.write(TS_DMA_BUFF_SIZE, dma.size() as u32))?;
        self.hw(self.port.write(TS_DMA_WR_PTR, 0))?;
        self.hw(self.port.write(TS_DMA_RD_PTR, 0))?;
        Ok(())
    }

    /// Replace the ring geometry. Legal only with no feeds and DMA
    /// stopped.
    pub fn configure_dma(&self, size: usize) -> Result<()> {
        self.check_faulted()?;
        let ctrl = self.ctrl.lock();
        if !ctrl.feeds.is_empty() {
            return Err(DemuxError::DeviceBusy);
        }
        let mut dma = self.dma.lock();
        dma.configure(size)?;
        info!("tsdmx: DMA ring configured, {} bytes", dma.size());
        self.program_dma_region(&dma)
    }

    /// Change the TS pin configuration. Legal only with no feeds and
    /// DMA stopped.
    pub fn set_ts_config(&self, config: TsConfig) -> Result<()> {
        self.check_faulted()?;
        let ctrl = self.ctrl.lock();
        if !ctrl.feeds.is_empty() || self.dma.lock().is_running() {
            return Err(DemuxError::DeviceBusy);
        }
        *self.config.lock() = config;
        if ctrl.ready {
            self.hw(self.port.write(TS_TOP_CONFIG, config.top_config_bits()))?;
        }
        Ok(())
    }

    /// Enable hardware DMA. Cursors reset to the region base.
    pub fn start(&self) -> Result<()> {
        self.check_faulted()?;
        let ctrl = self.ctrl.lock();
        if !ctrl.ready {
            return Err(DemuxError::DeviceNotReady);
        }
        let mut dma = self.dma.lock();
        dma.start();
        self.hw(self.port.write(TS_DMA_WR_PTR, 0))?;
        self.hw(self.port.write(TS_DMA_RD_PTR, 0))?;
        let mut control = TS_DMA_CONTROL_ENABLE | TS_DMA_CONTROL_IRQ_ENABLE;
        if self.config.lock().dma_scatter_gather {
            control |= TS_DMA_CONTROL_SG_MODE;
        }
        self.hw(self.port.write(TS_DMA_CONTROL, control))?;
        info!("tsdmx: DMA started");
        Ok(())
    }

    /// Disable hardware DMA.
    pub fn stop(&self) -> Result<()> {
        let mut dma = self.dma.lock();
        dma.stop();
        self.hw(self.port.write(TS_DMA_CONTROL, 0))?;
        info!("tsdmx: DMA stopped");
        Ok(())
    }

    /// Register a consumer for `pid` and start delivering to `sink`.
    ///
    /// Allocates a hardware filter slot unless another feed already
    /// claims the PID, in which case the slot is shared. `filter` is
    /// honored for `FeedKind::Section` (match-all when `None`) and
    /// ignored for the other kinds.
    pub fn start_feed(
        &self,
        pid: u16,
        kind: FeedKind,
        sink: Box<dyn FeedSink>,
        filter: Option<SectionFilter>,
    ) -> Result<FeedHandle> {
        self.check_faulted()?;
        let mut ctrl = self.ctrl.lock();
        if !ctrl.ready {
            return Err(DemuxError::DeviceNotReady);
        }
        if pid > NULL_PID {
            return Err(DemuxError::InvalidPid(pid));
        }

        let handle = FeedHandle(ctrl.next_handle);
        ctrl.next_handle += 1;
        let feed = Arc::new(Feed::new(handle, pid, kind, sink, filter));
        feed.set_state(FeedState::Starting);

        if !ctrl.pid_slots.contains_key(&pid) {
            let result = ctrl.filters.add(pid, self.port.as_ref());
            let index = self.hw(result)?;
            ctrl.pid_slots.insert(pid, index);
        }
        ctrl.feeds.insert(handle, feed.clone());
        self.publish_snapshot(&ctrl);
        feed.set_state(FeedState::Running);

        info!("tsdmx: feed {} started, pid 0x{:04x} ({:?})", handle.0, pid, kind);
        Ok(handle)
    }

    /// Stop a feed and release its resources. Idempotent.
    ///
    /// Ordering is load-bearing: the feed is unlinked from the dispatch
    /// snapshot first, then the call waits until no in-flight dispatch
    /// is executing into the sink, and only then is the hardware slot
    /// released (if this was the PID's last feed). Once this returns,
    /// the sink will never be invoked again.
    pub fn stop_feed(&self, handle: FeedHandle) -> Result<()> {
        let feed = {
            let mut ctrl = self.ctrl.lock();
            let Some(feed) = ctrl.feeds.remove(&handle) else {
                return Ok(());
            };
            feed.set_state(FeedState::Stopping);
            feed.stopping.store(true, Ordering::SeqCst);
            self.publish_snapshot(&ctrl);
            feed
        };

        self.quiesce.wait_idle(&feed);

        {
            let mut ctrl = self.ctrl.lock();
            let last_for_pid = !ctrl.feeds.values().any(|f| f.pid == feed.pid);
            if last_for_pid {
                if let Some(index) = ctrl.pid_slots.remove(&feed.pid) {
                    let result = ctrl.filters.remove(index, self.port.as_ref());
                    self.hw(result)?;
                }
            }
        }

        feed.set_state(FeedState::Idle);
        info!("tsdmx: feed {} stopped, pid 0x{:04x}", handle.0, feed.pid);
        Ok(())
    }

    /// Rebuild and swap the dispatch snapshot from the feed set.
    fn publish_snapshot(&self, ctrl: &ControlState) {
        let mut table = DispatchTable::new();
        for feed in ctrl.feeds.values() {
            table.entry(feed.pid).or_default().push(feed.clone());
        }
        *self.snapshot.lock() = Arc::new(table);
    }

    /// Deposit bytes into the ring as the DMA bus master would.
    ///
    /// On real hardware this happens behind the engine's back; the
    /// model routes it here so the write pointer register stays in
    /// step. Dropped while DMA is stopped, exactly like the hardware.
    pub fn dma_write(&self, data: &[u8]) -> Result<()> {
        self.check_faulted()?;
        let mut dma = self.dma.lock();
        dma.write(data);
        let wr = dma.write_pos();
        drop(dma);
        self.hw(self.port.write(TS_DMA_WR_PTR, wr))
    }

    /// Event-path entry point: the DMA-completion notification.
    ///
    /// Reads and clears the interrupt status, drains newly arrived
    /// whole packets, and demultiplexes them against the current
    /// snapshot. An error interrupt latches the fault state and
    /// disables further dispatch until `init` runs again.
    pub fn handle_interrupt(&self) -> Result<()> {
        self.check_faulted()?;
        let status = self.hw(self.port.read(TS_INT_STATUS))?;
        if status != 0 {
            self.hw(self.port.write(TS_INT_STATUS, status))?;
        }
        if status & TS_INT_STATUS_ERROR != 0 {
            self.faulted.store(true, Ordering::SeqCst);
            error!("tsdmx: hardware error interrupt, device disabled until reinit");
            return Err(DemuxError::HardwareFault);
        }

        let (drained, rd) = {
            let mut dma = self.dma.lock();
            if !dma.is_running() {
                return Ok(());
            }
            let drained = dma.drain();
            (drained, dma.read_pos())
        };
        self.hw(self.port.write(TS_DMA_RD_PTR, rd))?;

        let overflow_irq = status & TS_INT_STATUS_OVERFLOW != 0;
        let table = self.snapshot.lock().clone();
        let stats = demux_chunk(
            &drained.data,
            &table,
            drained.discontinuity || overflow_irq,
            &self.quiesce,
        );
        debug!(
            "tsdmx: irq status 0x{:02x}, {} packet(s), {} resync(s)",
            status, stats.packets, stats.resyncs
        );
        Ok(())
    }

    /// Stop every feed, stop DMA, and disable the front-end.
    pub fn shutdown(&self) -> Result<()> {
        let handles: Vec<FeedHandle> = self.ctrl.lock().feeds.keys().copied().collect();
        for handle in handles {
            self.stop_feed(handle)?;
        }
        self.stop()?;
        let mut ctrl = self.ctrl.lock();
        let result = ctrl.filters.clear(self.port.as_ref());
        self.hw(result)?;
        ctrl.ready = false;
        self.hw(self.port.clear_bits(TS_TOP_CONFIG, TS_TOP_CONFIG_ENABLE))?;
        info!("tsdmx: shut down");
        Ok(())
    }

    /// Check the ring cursors for an overflow that has not been
    /// serviced yet.
    ///
    /// Overflow is normally recovered inside the interrupt drain and
    /// reported to feeds as discontinuity metadata; this diagnostic is
    /// the one place the raw condition surfaces as an error, for
    /// platform code polling between interrupts.
    pub fn check_ring(&self) -> Result<()> {
        if self.dma.lock().is_overflowed() {
            return Err(DemuxError::BufferOverflow);
        }
        Ok(())
    }

    /// Log the interesting registers, for bring-up diagnostics.
    pub fn dump_registers(&self) -> Result<()> {
        info!("=== tsdmx register dump ===");
        for (name, reg) in [
            ("TS_TOP_CONFIG", TS_TOP_CONFIG),
            ("TS_TOP_STATUS", TS_TOP_STATUS),
            ("TS_DMA_CONTROL", TS_DMA_CONTROL),
            ("TS_DMA_WR_PTR", TS_DMA_WR_PTR),
            ("TS_DMA_RD_PTR", TS_DMA_RD_PTR),
            ("TS_INT_STATUS", TS_INT_STATUS),
        ] {
            info!("{:16} 0x{:08x}", name, self.hw(self.port.read(reg))?);
        }
        Ok(())
    }

    /// Handles of every feed currently registered for `pid`.
    pub fn feeds_on_pid(&self, pid: u16) -> Vec<FeedHandle> {
        self.ctrl
            .lock()
            .feeds
            .values()
            .filter(|f| f.pid == pid)
            .map(|f| f.handle)
            .collect()
    }

    /// Lifecycle state of a feed, `None` once it has been released.
    pub fn feed_state(&self, handle: FeedHandle) -> Option<FeedState> {
        self.ctrl.lock().feeds.get(&handle).map(|f| f.state())
    }

    pub fn active_feed_count(&self) -> usize {
        self.ctrl.lock().feeds.len()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::DeliveryMeta;
    use crate::packet::TS_PACKET_SIZE;
    use crate::regs::ShadowRegisters;

    fn device() -> (Arc<ShadowRegisters>, DemuxDevice) {
        let regs = Arc::new(ShadowRegisters::new());
        let dev = DemuxDevice::new(regs.clone(), TsConfig::default());
        (regs, dev)
    }

    fn null_sink() -> Box<dyn FeedSink> {
        Box::new(|_: &[u8], _: &DeliveryMeta| {})
    }

    #[test]
    fn test_start_feed_before_init() {
        let (_regs, dev) = device();
        let err = dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None);
        assert_eq!(err.err(), Some(DemuxError::DeviceNotReady));
    }

    #[test]
    fn test_init_programs_mode_and_masks() {
        let (regs, dev) = device();
        dev.init().unwrap();
        let top = regs.read(TS_TOP_CONFIG).unwrap();
        assert_ne!(top & TS_TOP_CONFIG_ENABLE, 0);
        assert_ne!(top & TS_TOP_CONFIG_SERIAL, 0);
        let mask = regs.read(TS_INT_MASK).unwrap();
        assert_ne!(mask & TS_INT_STATUS_OVERFLOW, 0);
    }

    #[test]
    fn test_parallel_mode_bit() {
        let regs = Arc::new(ShadowRegisters::new());
        let dev = DemuxDevice::new(
            regs.clone(),
            TsConfig { mode: TsMode::Parallel, ..Default::default() },
        );
        dev.init().unwrap();
        let top = regs.read(TS_TOP_CONFIG).unwrap();
        assert_ne!(top & TS_TOP_CONFIG_PARALLEL, 0);
        assert_eq!(top & TS_TOP_CONFIG_SERIAL, 0);
    }

    #[test]
    fn test_invalid_pid_rejected() {
        let (_regs, dev) = device();
        dev.init().unwrap();
        let err = dev.start_feed(0x2000, FeedKind::RawTs, null_sink(), None);
        assert_eq!(err.err(), Some(DemuxError::InvalidPid(0x2000)));
    }

    #[test]
    fn test_shared_pid_uses_one_hardware_slot() {
        let (regs, dev) = device();
        dev.init().unwrap();
        let a = dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None).unwrap();
        let writes_after_first = regs.write_count(TS_PL_PID_DATA);
        let b = dev.start_feed(0x100, FeedKind::Section, null_sink(), None).unwrap();
        assert_eq!(regs.write_count(TS_PL_PID_DATA), writes_after_first);

        let on_pid = dev.feeds_on_pid(0x100);
        assert!(on_pid.contains(&a) && on_pid.contains(&b));

        // First stop keeps the slot, second releases it.
        dev.stop_feed(a).unwrap();
        assert_ne!(regs.write_log().last(), Some(&(TS_PL_PID_DATA, NULL_PID as u32)));
        dev.stop_feed(b).unwrap();
        assert_eq!(regs.write_log().last(), Some(&(TS_PL_PID_DATA, NULL_PID as u32)));
    }

    #[test]
    fn test_stop_feed_idempotent() {
        let (regs, dev) = device();
        dev.init().unwrap();
        let handle = dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None).unwrap();
        dev.stop_feed(handle).unwrap();
        let writes = regs.write_log().len();
        dev.stop_feed(handle).unwrap();
        assert_eq!(regs.write_log().len(), writes);
        assert_eq!(dev.feed_state(handle), None);
    }

    #[test]
    fn test_configure_dma_busy_with_feeds() {
        let (_regs, dev) = device();
        dev.init().unwrap();
        let handle = dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None).unwrap();
        assert_eq!(dev.configure_dma(188 * 64), Err(DemuxError::DeviceBusy));
        dev.stop_feed(handle).unwrap();
        dev.configure_dma(188 * 64).unwrap();
    }

    #[test]
    fn test_configure_dma_busy_while_running() {
        let (_regs, dev) = device();
        dev.init().unwrap();
        dev.start().unwrap();
        assert_eq!(dev.configure_dma(188 * 64), Err(DemuxError::DeviceBusy));
        dev.stop().unwrap();
        dev.configure_dma(188 * 64).unwrap();
    }

    #[test]
    fn test_fault_latches_until_reinit() {
        let (regs, dev) = device();
        dev.init().unwrap();
        dev.start().unwrap();

        regs.set_faulty(true);
        assert_eq!(dev.handle_interrupt(), Err(DemuxError::HardwareFault));
        regs.set_faulty(false);

        // Still latched; every entry point refuses.
        assert!(dev.is_faulted());
        assert_eq!(dev.handle_interrupt(), Err(DemuxError::HardwareFault));
        assert_eq!(
            dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None).err(),
            Some(DemuxError::HardwareFault)
        );

        dev.init().unwrap();
        assert!(!dev.is_faulted());
    }

    #[test]
    fn test_error_interrupt_faults_device() {
        let (regs, dev) = device();
        dev.init().unwrap();
        dev.start().unwrap();
        regs.raise_interrupt(TS_INT_STATUS_ERROR);
        assert_eq!(dev.handle_interrupt(), Err(DemuxError::HardwareFault));
        assert!(dev.is_faulted());
    }

    #[test]
    fn test_first_interrupt_after_init_does_not_fault() {
        let (regs, dev) = device();
        dev.init().unwrap();
        dev.start().unwrap();
        regs.raise_interrupt(TS_INT_STATUS_DMA_DONE);
        dev.handle_interrupt().unwrap();
        assert!(!dev.is_faulted());
        // The status was acknowledged, not left latched.
        assert_eq!(regs.read(TS_INT_STATUS).unwrap(), 0);
    }

    #[test]
    fn test_check_ring_reports_unserviced_overflow() {
        let (_regs, dev) = device();
        dev.init().unwrap();
        dev.configure_dma(TS_PACKET_SIZE * 4).unwrap();
        dev.start().unwrap();
        dev.dma_write(&vec![0u8; TS_PACKET_SIZE * 5]).unwrap();
        assert_eq!(dev.check_ring(), Err(DemuxError::BufferOverflow));
        // The interrupt drain resynchronizes the cursors.
        dev.handle_interrupt().unwrap();
        dev.check_ring().unwrap();
    }

    #[test]
    fn test_shutdown_disables_frontend() {
        let (regs, dev) = device();
        dev.init().unwrap();
        dev.start().unwrap();
        dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None).unwrap();
        dev.shutdown().unwrap();
        assert_eq!(dev.active_feed_count(), 0);
        let top = regs.read(TS_TOP_CONFIG).unwrap();
        assert_eq!(top & TS_TOP_CONFIG_ENABLE, 0);
        let err = dev.start_feed(0x100, FeedKind::RawTs, null_sink(), None);
        assert_eq!(err.err(), Some(DemuxError::DeviceNotReady));
    }
}
