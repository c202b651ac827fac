//! PSI/SI section filtering and reassembly.
//!
//! A section feed carries structured metadata payloads that may span
//! several TS packets. This module matches completed sections against a
//! byte pattern/mask filter and reassembles them across packets,
//! validating the continuity counter along the way.

use bytes::{Bytes, BytesMut};

/// Byte-pattern/mask matcher for section feeds.
///
/// A section matches when `(data[i] & mask[i]) == (pattern[i] & mask[i])`
/// for every `i` below `length`. A section shorter than `length` never
/// matches. Bytes missing from `pattern`/`mask` are treated as zero.
#[derive(Debug, Clone, Default)]
pub struct SectionFilter {
    pattern: Vec<u8>,
    mask: Vec<u8>,
    length: usize,
}

impl SectionFilter {
    pub fn new(pattern: Vec<u8>, mask: Vec<u8>, length: usize) -> Self {
        Self { pattern, mask, length }
    }

    /// A filter that matches every section.
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        if data.len() < self.length {
            return false;
        }
        (0..self.length).all(|i| {
            let pattern = self.pattern.get(i).copied().unwrap_or(0);
            let mask = self.mask.get(i).copied().unwrap_or(0);
            data[i] & mask == pattern & mask
        })
    }
}

/// Result of pushing one packet's payload into the recombiner.
#[derive(Debug, Default)]
pub struct PushOutcome {
    /// Sections completed by this packet, unfiltered.
    pub sections: Vec<Bytes>,
    /// A continuity break discarded a partially assembled section.
    pub discontinuity: bool,
}

/// Per-feed section reassembly state.
///
/// Keyed on the payload unit start indicator and the pointer field: a
/// packet with PUSI set carries the tail of the previous section (the
/// bytes before the pointer target) followed by the start of a new one.
/// The continuity counter must step by exactly one (mod 16) between
/// consecutive packets of the feed's PID; a break discards whatever is
/// buffered and reports a discontinuity.
#[derive(Debug, Default)]
pub struct SectionRecombiner {
    buf: BytesMut,
    last_cc: Option<u8>,
}

impl SectionRecombiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial section and forget the continuity state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.last_cc = None;
    }

    /// Feed one packet's payload (pointer field included when `pusi`).
    pub fn push(&mut self, payload: &[u8], cc: u8, pusi: bool) -> PushOutcome {
        let mut out = PushOutcome::default();

        if let Some(last) = self.last_cc {
            if cc != (last + 1) & 0x0f {
                if !self.buf.is_empty() {
                    out.discontinuity = true;
                }
                self.buf.clear();
                if !pusi {
                    // Cannot join a section mid-stream after a break.
                    self.last_cc = Some(cc);
                    return out;
                }
            }
        }
        self.last_cc = Some(cc);

        if pusi {
            if payload.is_empty() {
                self.buf.clear();
                return out;
            }
            let pointer = payload[0] as usize;
            let section_start = pointer + 1;
            if section_start > payload.len() {
                self.buf.clear();
                return out;
            }
            if !self.buf.is_empty() {
                // Bytes before the pointer target finish the pending
                // section; anything still incomplete after that is a
                // length mismatch and gets dropped.
                self.buf.extend_from_slice(&payload[1..section_start]);
                self.drain_complete(&mut out.sections);
                self.buf.clear();
            }
            self.buf.extend_from_slice(&payload[section_start..]);
            self.drain_complete(&mut out.sections);
        } else {
            if self.buf.is_empty() {
                // Not mid-section; nothing to continue.
                return out;
            }
            self.buf.extend_from_slice(payload);
            self.drain_complete(&mut out.sections);
        }

        out
    }

    /// True while a partial section is buffered.
    pub fn is_assembling(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Split complete sections off the front of the buffer. Section
    /// length comes from the 12-bit section_length header field.
    fn drain_complete(&mut self, sections: &mut Vec<Bytes>) {
        loop {
            if self.buf.len() < 3 {
                return;
            }
            if self.buf[0] == 0xff {
                // Stuffing; the rest of the payload is padding.
                self.buf.clear();
                return;
            }
            let section_length = ((self.buf[1] as usize & 0x0f) << 8) | self.buf[2] as usize;
            let total = 3 + section_length;
            if self.buf.len() < total {
                return;
            }
            sections.push(self.buf.split_to(total).freeze());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A payload starting a section of `body_len` data bytes.
    fn section_payload(body_len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; 3 + body_len + 1];
        payload[0] = 0; // pointer field
        payload[1] = 0x00; // table_id
        payload[2] = (body_len >> 8) as u8 & 0x0f;
        payload[3] = body_len as u8;
        payload
    }

    #[test]
    fn test_filter_match_and_reject() {
        let filter = SectionFilter::new(vec![0x00], vec![0xff], 1);
        assert!(filter.matches(&[0x00, 0x55, 0xaa]));
        assert!(!filter.matches(&[0x01, 0x55, 0xaa]));
    }

    #[test]
    fn test_filter_short_data_never_matches() {
        let filter = SectionFilter::new(vec![0x00, 0x00], vec![0x00, 0x00], 2);
        assert!(!filter.matches(&[0x00]));
    }

    #[test]
    fn test_filter_masked_bits_ignored() {
        let filter = SectionFilter::new(vec![0xa0], vec![0xf0], 1);
        assert!(filter.matches(&[0xaf]));
        assert!(!filter.matches(&[0x5f]));
    }

    #[test]
    fn test_single_packet_section() {
        let mut rec = SectionRecombiner::new();
        let payload = section_payload(10);
        let out = rec.push(&payload, 0, true);
        assert_eq!(out.sections.len(), 1);
        assert_eq!(out.sections[0].len(), 13);
        assert!(!out.discontinuity);
    }

    #[test]
    fn test_multi_packet_section() {
        let mut rec = SectionRecombiner::new();
        // 300 data bytes span two packets.
        let mut first = section_payload(300);
        first.truncate(184);
        let out = rec.push(&first, 0, true);
        assert!(out.sections.is_empty());
        assert!(rec.is_assembling());

        let rest = vec![0u8; 303 - 183];
        let out = rec.push(&rest, 1, false);
        assert_eq!(out.sections.len(), 1);
        assert_eq!(out.sections[0].len(), 303);
    }

    #[test]
    fn test_continuity_break_discards_section() {
        let mut rec = SectionRecombiner::new();
        let mut first = section_payload(300);
        first.truncate(184);
        rec.push(&first, 0, true);
        rec.push(&[0u8; 50], 1, false);

        // cc jumps 1 -> 3; the partial section must go, flagged.
        let out = rec.push(&[0u8; 50], 3, false);
        assert!(out.sections.is_empty());
        assert!(out.discontinuity);
        assert!(!rec.is_assembling());
    }

    #[test]
    fn test_pointer_field_completes_previous_section() {
        let mut rec = SectionRecombiner::new();
        // Section of 190 data bytes: 183 land in the first packet.
        let mut first = section_payload(190);
        first.truncate(184);
        rec.push(&first, 0, true);

        // Next packet: pointer = 10 tail bytes, a new section, stuffing.
        let mut second = vec![0xffu8; 30];
        second[0] = 10;
        second[11] = 0x00; // table_id
        second[12] = 0x00;
        second[13] = 5; // new section, 5 data bytes
        let out = rec.push(&second, 1, true);
        assert_eq!(out.sections.len(), 2);
        assert_eq!(out.sections[0].len(), 193);
        assert_eq!(out.sections[1].len(), 8);
    }

    #[test]
    fn test_stuffing_terminates_payload() {
        let mut rec = SectionRecombiner::new();
        let mut payload = section_payload(2);
        payload.extend_from_slice(&[0xff, 0xff, 0xff]);
        let out = rec.push(&payload, 0, true);
        assert_eq!(out.sections.len(), 1);
        assert!(!rec.is_assembling());
    }

    #[test]
    fn test_continuation_without_start_ignored() {
        let mut rec = SectionRecombiner::new();
        let out = rec.push(&[0u8; 100], 5, false);
        assert!(out.sections.is_empty());
        assert!(!out.discontinuity);
        assert!(!rec.is_assembling());
    }
}
