//! DMA ring buffer for incoming TS bytes.
//!
//! The hardware bus master deposits raw TS bytes into a ring in host
//! memory and advances a write cursor; the drain path consumes whole
//! packets between the read cursor and the hardware write cursor. Both
//! cursors are kept as monotonically increasing byte counts so that a
//! full ring and an empty ring are never ambiguous: the gap must stay
//! at or below `size - 188`, and a larger gap means the hardware lapped
//! the software and data was lost.

use bytes::{Bytes, BytesMut};
use log::warn;

use crate::error::{DemuxError, Result};
use crate::packet::TS_PACKET_SIZE;

/// Default ring size: 1024 packets, matching the hardware default.
pub const DEFAULT_RING_SIZE: usize = TS_PACKET_SIZE * 1024;

/// Smallest usable ring: room for one packet plus the full/empty slack.
const MIN_RING_SIZE: usize = TS_PACKET_SIZE * 2;

/// Bytes drained from the ring in one pass.
#[derive(Debug)]
pub struct Drained {
    /// A whole number of packets, contiguous even when the ring wrapped.
    pub data: Bytes,
    /// The ring overflowed since the last drain; the oldest unread data
    /// was dropped and feeds must be told on their next delivery.
    pub discontinuity: bool,
}

/// Ring buffer owning the DMA-visible memory region and cursor pair.
pub struct DmaRingBuffer {
    buf: Box<[u8]>,
    /// Monotonic hardware write cursor (bytes ever written).
    wr: u64,
    /// Monotonic software read cursor (bytes ever consumed).
    rd: u64,
    running: bool,
}

impl DmaRingBuffer {
    pub fn new(size: usize) -> Self {
        let size = Self::normalize(size);
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            wr: 0,
            rd: 0,
            running: false,
        }
    }

    /// Round a requested geometry to a legal one: whole packets, at
    /// least two of them.
    fn normalize(size: usize) -> usize {
        let rounded = (size / TS_PACKET_SIZE) * TS_PACKET_SIZE;
        let legal = rounded.max(MIN_RING_SIZE);
        if legal != size {
            warn!("dma: ring size {} normalized to {}", size, legal);
        }
        legal
    }

    /// Replace the ring geometry. Legal only while DMA is stopped.
    pub fn configure(&mut self, size: usize) -> Result<()> {
        if self.running {
            return Err(DemuxError::DeviceBusy);
        }
        let size = Self::normalize(size);
        self.buf = vec![0u8; size].into_boxed_slice();
        self.wr = 0;
        self.rd = 0;
        Ok(())
    }

    /// Enable ingestion, resetting both cursors to the region base.
    pub fn start(&mut self) {
        self.wr = 0;
        self.rd = 0;
        self.running = true;
    }

    /// Disable ingestion. Cursors keep their values for inspection.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Unread bytes between the cursors.
    pub fn available(&self) -> usize {
        (self.wr - self.rd) as usize
    }

    /// Write cursor as an offset into the ring (register mirror value).
    pub fn write_pos(&self) -> u32 {
        (self.wr % self.buf.len() as u64) as u32
    }

    /// Read cursor as an offset into the ring (register mirror value).
    pub fn read_pos(&self) -> u32 {
        (self.rd % self.buf.len() as u64) as u32
    }

    /// Deposit bytes as the bus master would. Ignored while stopped.
    ///
    /// The hardware does not respect the software read cursor: writing
    /// past it silently overwrites the oldest data, which the next
    /// `drain` detects as an overflow.
    pub fn write(&mut self, data: &[u8]) {
        if !self.running {
            warn!("dma: write of {} bytes while stopped, dropped", data.len());
            return;
        }
        let size = self.buf.len();
        let mut remaining = data;
        while !remaining.is_empty() {
            let pos = (self.wr % size as u64) as usize;
            let n = remaining.len().min(size - pos);
            self.buf[pos..pos + n].copy_from_slice(&remaining[..n]);
            self.wr += n as u64;
            remaining = &remaining[n..];
        }
    }

    /// True when the write cursor has run further ahead of the read
    /// cursor than the ring can hold without ambiguity.
    pub fn is_overflowed(&self) -> bool {
        self.available() > self.buf.len() - TS_PACKET_SIZE
    }

    /// Consume all newly available whole packets.
    ///
    /// Partial trailing bytes stay in the ring for the next drain. On
    /// overflow the read cursor resynchronizes a fixed whole-packet
    /// offset (half the ring) behind the write cursor, dropping the
    /// oldest unread data, and the result carries the discontinuity
    /// flag; the drain itself still succeeds.
    pub fn drain(&mut self) -> Drained {
        let size = self.buf.len();
        let mut discontinuity = false;

        if self.is_overflowed() {
            let lag = (size / 2 / TS_PACKET_SIZE * TS_PACKET_SIZE) as u64;
            let resynced =
                self.wr.saturating_sub(lag) / TS_PACKET_SIZE as u64 * TS_PACKET_SIZE as u64;
            warn!(
                "dma: overflow, read cursor resynced from {} to {} (write cursor {})",
                self.rd, resynced, self.wr
            );
            self.rd = resynced.max(self.rd);
            discontinuity = true;
        }

        let avail = self.available();
        let whole = avail - avail % TS_PACKET_SIZE;
        let mut data = BytesMut::with_capacity(whole);
        if whole > 0 {
            let start = (self.rd % size as u64) as usize;
            let first = whole.min(size - start);
            data.extend_from_slice(&self.buf[start..start + first]);
            if first < whole {
                data.extend_from_slice(&self.buf[..whole - first]);
            }
            self.rd += whole as u64;
        }

        Drained { data: data.freeze(), discontinuity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_drain_whole_packets_only() {
        let mut ring = DmaRingBuffer::new(TS_PACKET_SIZE * 8);
        ring.start();
        ring.write(&pattern(100));
        assert!(ring.drain().data.is_empty());

        ring.write(&pattern(188)[..88]);
        let drained = ring.drain();
        assert_eq!(drained.data.len(), TS_PACKET_SIZE);
        assert!(!drained.discontinuity);
        // Nothing left over.
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_wrap_produces_contiguous_stream() {
        let size = TS_PACKET_SIZE * 21;
        let mut ring = DmaRingBuffer::new(size);
        ring.start();

        // March both cursors to 100 bytes short of the physical end,
        // draining between writes so the gap never nears the overflow
        // threshold. The final 88 partial bytes stay in the ring.
        ring.write(&vec![0u8; TS_PACKET_SIZE * 10]);
        assert!(!ring.drain().discontinuity);
        ring.write(&vec![0u8; TS_PACKET_SIZE * 10]);
        assert!(!ring.drain().discontinuity);
        ring.write(&[0u8; 88]);
        assert!(ring.drain().data.is_empty());
        assert_eq!(ring.available(), 88);

        // 300 more bytes cross the wrap point; the drain delivers two
        // whole packets as one contiguous logical stream.
        let data = pattern(300);
        ring.write(&data);
        let drained = ring.drain();
        assert!(!drained.discontinuity);
        assert_eq!(drained.data.len(), TS_PACKET_SIZE * 2);
        assert_eq!(&drained.data[88..], &data[..TS_PACKET_SIZE * 2 - 88]);
        assert_eq!(ring.available(), 388 - TS_PACKET_SIZE * 2);
    }

    #[test]
    fn test_overflow_resync_and_invariant() {
        let size = TS_PACKET_SIZE * 4;
        let mut ring = DmaRingBuffer::new(size);
        ring.start();

        let data = pattern(TS_PACKET_SIZE * 5);
        ring.write(&data);
        assert!(ring.is_overflowed());

        let drained = ring.drain();
        assert!(drained.discontinuity);
        // Freshest half ring survives, oldest data is gone.
        assert_eq!(drained.data.len(), TS_PACKET_SIZE * 2);
        assert_eq!(&drained.data[..], &data[TS_PACKET_SIZE * 3..]);
        // Cursor-gap invariant holds after the drain.
        assert!(ring.available() <= size - TS_PACKET_SIZE);
    }

    #[test]
    fn test_write_while_stopped_is_dropped() {
        let mut ring = DmaRingBuffer::new(TS_PACKET_SIZE * 4);
        ring.write(&pattern(188));
        ring.start();
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_configure_rejected_while_running() {
        let mut ring = DmaRingBuffer::new(TS_PACKET_SIZE * 4);
        ring.start();
        assert_eq!(ring.configure(TS_PACKET_SIZE * 8), Err(DemuxError::DeviceBusy));
        ring.stop();
        ring.configure(TS_PACKET_SIZE * 8).unwrap();
        assert_eq!(ring.size(), TS_PACKET_SIZE * 8);
    }

    #[test]
    fn test_geometry_normalized_to_whole_packets() {
        let ring = DmaRingBuffer::new(4096);
        assert_eq!(ring.size() % TS_PACKET_SIZE, 0);
        let ring = DmaRingBuffer::new(10);
        assert_eq!(ring.size(), TS_PACKET_SIZE * 2);
    }

    #[test]
    fn test_start_resets_cursors() {
        let mut ring = DmaRingBuffer::new(TS_PACKET_SIZE * 4);
        ring.start();
        ring.write(&pattern(188));
        ring.stop();
        ring.start();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.write_pos(), 0);
        assert_eq!(ring.read_pos(), 0);
    }
}
