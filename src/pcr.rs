//! Program Clock Reference extraction.
//!
//! The PCR is a 42-bit timestamp on a 27 MHz clock: a 33-bit base in
//! 90 kHz units plus a 9-bit extension, carried at a fixed offset in
//! the adaptation field (ISO 13818-1 2.4.3.4).

use crate::packet::{SYNC_BYTE, TS_PACKET_SIZE};

/// PCR clock frequency in Hz.
pub const PCR_HZ: u64 = 27_000_000;

/// Extract the PCR from a raw 188-byte TS packet.
///
/// Returns `None` when the packet has no adaptation field, the PCR flag
/// is clear, or the field is too short to hold the six PCR bytes. Pure
/// function, callable concurrently without coordination.
pub fn extract_pcr(packet: &[u8]) -> Option<u64> {
    if packet.len() < TS_PACKET_SIZE || packet[0] != SYNC_BYTE {
        return None;
    }
    let adaptation_field_control = (packet[3] >> 4) & 0x03;
    if adaptation_field_control & 0x02 == 0 {
        return None;
    }
    // adaptation_field_length counts bytes after itself; PCR needs the
    // flags byte plus six PCR bytes.
    let af_length = packet[4] as usize;
    if af_length < 7 {
        return None;
    }
    if packet[5] & 0x10 == 0 {
        return None;
    }
    let base = ((packet[6] as u64) << 25)
        | ((packet[7] as u64) << 17)
        | ((packet[8] as u64) << 9)
        | ((packet[9] as u64) << 1)
        | ((packet[10] as u64) >> 7);
    let ext = ((packet[10] as u64 & 0x01) << 8) | packet[11] as u64;
    Some(base * 300 + ext)
}
