//! Software demultiplexing pass over drained DMA chunks.
//!
//! Walks a chunk packet by packet, resynchronizing on corrupt packet
//! boundaries, and routes each packet to the feeds registered for its
//! PID. Runs on the event path against an immutable dispatch snapshot;
//! it never takes the device lock.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::warn;

use crate::feed::{DeliveryMeta, Feed, FeedKind, Quiesce};
use crate::packet::{self, TsHeader, SYNC_BYTE, TS_PACKET_SIZE};
use crate::pcr::extract_pcr;

/// Immutable PID-to-feeds snapshot published by the control path.
///
/// Rebuilt copy-then-swap on every feed change; entries are never
/// mutated in place while the event path may be reading them.
pub(crate) type DispatchTable = HashMap<u16, Vec<Arc<Feed>>>;

/// Counters from one demultiplexing pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DemuxStats {
    /// Packets dispatched to at least the PID lookup.
    pub packets: usize,
    /// Sync losses that forced a forward scan.
    pub resyncs: usize,
    /// Bytes skipped while hunting for a sync byte.
    pub skipped: usize,
}

/// Demultiplex one drained chunk.
///
/// `upstream_discontinuity` marks ring-overflow data loss: every feed
/// in the snapshot is flagged so its next delivery carries the
/// discontinuity bit. Per-feed dispatch is in packet-arrival order;
/// order across feeds sharing a PID is unspecified.
pub(crate) fn demux_chunk(
    chunk: &[u8],
    table: &DispatchTable,
    upstream_discontinuity: bool,
    quiesce: &Quiesce,
) -> DemuxStats {
    let mut stats = DemuxStats::default();

    if upstream_discontinuity {
        for feeds in table.values() {
            for feed in feeds {
                feed.flag_discontinuity();
            }
        }
    }

    let mut i = 0;
    while i + TS_PACKET_SIZE <= chunk.len() {
        if chunk[i] != SYNC_BYTE {
            // Misaligned data is a corruption signal; scan forward for
            // the next candidate packet start instead of trusting the
            // 188-byte grid.
            stats.resyncs += 1;
            match packet::find_sync(chunk, i + 1) {
                Some(next) => {
                    stats.skipped += next - i;
                    i = next;
                    continue;
                }
                None => {
                    stats.skipped += chunk.len() - i;
                    break;
                }
            }
        }
        let pk = &chunk[i..i + TS_PACKET_SIZE];
        let Some(header) = TsHeader::parse(pk) else {
            i += TS_PACKET_SIZE;
            continue;
        };
        stats.packets += 1;
        if let Some(feeds) = table.get(&header.pid) {
            for feed in feeds {
                dispatch(feed, pk, &header, quiesce);
            }
        }
        i += TS_PACKET_SIZE;
    }

    if stats.resyncs > 0 {
        warn!("demux: lost sync {} time(s), skipped {} bytes", stats.resyncs, stats.skipped);
    }
    stats
}

/// Deliver one packet to one feed, maintaining the in-flight count the
/// quiescence protocol relies on.
fn dispatch(feed: &Feed, pk: &[u8], header: &TsHeader, quiesce: &Quiesce) {
    feed.in_flight.fetch_add(1, Ordering::SeqCst);
    // The feed may come from a snapshot cloned before stop_feed
    // unlinked it. The counter is raised before the flag is checked:
    // either the stop_feed caller observes the counter and waits, or
    // this path observes the flag and suppresses the delivery. Both
    // ways the sink is never invoked after stop_feed returns.
    if !feed.stopping.load(Ordering::SeqCst) {
        deliver(feed, pk, header);
    }
    let was = feed.in_flight.fetch_sub(1, Ordering::SeqCst);
    if was == 1 && feed.stopping.load(Ordering::SeqCst) {
        // A stop_feed caller may be parked on the quiescence condvar;
        // the lock pairs the wake-up with its counter check.
        let _guard = quiesce.lock.lock();
        quiesce.cv.notify_all();
    }
}

fn deliver(feed: &Feed, pk: &[u8], header: &TsHeader) {
    match feed.kind {
        FeedKind::RawTs => {
            let meta = DeliveryMeta {
                pid: feed.pid,
                kind: feed.kind,
                pcr: None,
                discontinuity: feed.take_discontinuity(),
            };
            feed.sink.deliver(pk, &meta);
        }
        FeedKind::Pcr => {
            if let Some(pcr) = extract_pcr(pk) {
                let meta = DeliveryMeta {
                    pid: feed.pid,
                    kind: feed.kind,
                    pcr: Some(pcr),
                    discontinuity: feed.take_discontinuity(),
                };
                feed.sink.deliver(pk, &meta);
            }
        }
        FeedKind::Section => {
            let Some(section) = &feed.section else {
                return;
            };
            let Some(offset) = packet::payload_offset(pk, header) else {
                return;
            };
            let mut state = section.lock();
            let outcome = state.recombiner.push(
                &pk[offset..],
                header.continuity_counter,
                header.payload_unit_start,
            );
            if outcome.discontinuity {
                feed.flag_discontinuity();
            }
            for sec in outcome.sections {
                if state.filter.matches(&sec) {
                    let meta = DeliveryMeta {
                        pid: feed.pid,
                        kind: feed.kind,
                        pcr: None,
                        discontinuity: feed.take_discontinuity(),
                    };
                    feed.sink.deliver(&sec, &meta);
                }
            }
        }
    }
}
