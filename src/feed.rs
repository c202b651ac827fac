//! Feed data model: consumer registrations and their sinks.
//!
//! A feed is one consumer's claim on a PID: raw packets, filtered
//! sections, or PCR timestamps. Feeds are owned by the device's feed
//! manager and referenced (never owned) by the dispatch path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::section::{SectionFilter, SectionRecombiner};

/// Opaque feed identity handed out by `start_feed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedHandle(pub(crate) u32);

/// What a feed consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Full 188-byte packets, verbatim.
    RawTs,
    /// Reassembled PSI/SI sections passing the feed's filter.
    Section,
    /// Packets carrying a PCR value.
    Pcr,
}

/// Feed lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Metadata accompanying every sink delivery.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryMeta {
    pub pid: u16,
    pub kind: FeedKind,
    /// Extracted PCR value (27 MHz units), PCR feeds only.
    pub pcr: Option<u64>,
    /// Data was lost upstream (ring overflow or continuity break) since
    /// the previous delivery to this feed.
    pub discontinuity: bool,
}

/// Where a feed's data goes.
///
/// Invoked only from the event path, never after `stop_feed` on the
/// feed has returned. Implementations must not block; they run inside
/// the per-interrupt packet budget.
pub trait FeedSink: Send + Sync {
    fn deliver(&self, data: &[u8], meta: &DeliveryMeta);
}

impl<F> FeedSink for F
where
    F: Fn(&[u8], &DeliveryMeta) + Send + Sync,
{
    fn deliver(&self, data: &[u8], meta: &DeliveryMeta) {
        self(data, meta)
    }
}

/// Working state for a section feed.
pub(crate) struct SectionState {
    pub filter: SectionFilter,
    pub recombiner: SectionRecombiner,
}

/// One registered consumer.
pub(crate) struct Feed {
    pub handle: FeedHandle,
    pub pid: u16,
    pub kind: FeedKind,
    pub sink: Box<dyn FeedSink>,
    state: Mutex<FeedState>,
    /// Dispatches currently executing into the sink.
    pub in_flight: AtomicU32,
    /// Set once `stop_feed` has unlinked the feed; the dispatch path
    /// wakes the quiescence waiter when the last in-flight call ends.
    pub stopping: AtomicBool,
    pending_discontinuity: AtomicBool,
    /// Present for `FeedKind::Section` only. Locked only by the event
    /// path, which is single-threaded, so never contended.
    pub section: Option<Mutex<SectionState>>,
}

impl Feed {
    pub fn new(
        handle: FeedHandle,
        pid: u16,
        kind: FeedKind,
        sink: Box<dyn FeedSink>,
        filter: Option<SectionFilter>,
    ) -> Self {
        let section = match kind {
            FeedKind::Section => Some(Mutex::new(SectionState {
                filter: filter.unwrap_or_else(SectionFilter::match_all),
                recombiner: SectionRecombiner::new(),
            })),
            _ => None,
        };
        Self {
            handle,
            pid,
            kind,
            sink,
            state: Mutex::new(FeedState::Idle),
            in_flight: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            pending_discontinuity: AtomicBool::new(false),
            section,
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: FeedState) {
        *self.state.lock() = state;
    }

    /// Mark that data was lost before this feed's next delivery.
    pub fn flag_discontinuity(&self) {
        self.pending_discontinuity.store(true, Ordering::SeqCst);
    }

    /// Consume the pending discontinuity flag for a delivery.
    pub fn take_discontinuity(&self) -> bool {
        self.pending_discontinuity.swap(false, Ordering::SeqCst)
    }
}

/// Condvar pair for the `stop_feed` quiescence wait.
///
/// The event path takes `lock` only when a stopping feed's in-flight
/// count reaches zero, so the hot path stays lock-free.
#[derive(Default)]
pub(crate) struct Quiesce {
    pub lock: Mutex<()>,
    pub cv: Condvar,
}

impl Quiesce {
    /// Block until no dispatch is executing into `feed`.
    pub fn wait_idle(&self, feed: &Feed) {
        let mut guard = self.lock.lock();
        while feed.in_flight.load(Ordering::SeqCst) > 0 {
            self.cv.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discontinuity_flag_is_consumed_once() {
        let feed = Feed::new(FeedHandle(1), 0x100, FeedKind::RawTs, Box::new(|_: &[u8], _: &DeliveryMeta| {}), None);
        assert!(!feed.take_discontinuity());
        feed.flag_discontinuity();
        assert!(feed.take_discontinuity());
        assert!(!feed.take_discontinuity());
    }

    #[test]
    fn test_section_feed_gets_match_all_filter_by_default() {
        let feed = Feed::new(
            FeedHandle(2),
            0x100,
            FeedKind::Section,
            Box::new(|_: &[u8], _: &DeliveryMeta| {}),
            None,
        );
        let section = feed.section.as_ref().unwrap().lock();
        assert!(section.filter.matches(&[0x42]));
    }

    #[test]
    fn test_quiesce_returns_when_idle() {
        let feed = Feed::new(FeedHandle(3), 0x100, FeedKind::Pcr, Box::new(|_: &[u8], _: &DeliveryMeta| {}), None);
        let quiesce = Quiesce::default();
        // No dispatch in flight; must not block.
        quiesce.wait_idle(&feed);
    }
}
