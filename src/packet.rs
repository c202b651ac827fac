//! 188-byte MPEG-TS packet header parsing.

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// The null PID, also the hardware filter slot sentinel for "inactive".
pub const NULL_PID: u16 = 0x1fff;

/// Parsed TS packet header (first four bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator.
    pub payload_unit_start: bool,
    /// Transport priority.
    pub transport_priority: bool,
    /// Packet identifier (13 bits).
    pub pid: u16,
    /// Transport scrambling control (2 bits).
    pub scrambling_control: u8,
    /// Adaptation field control (2 bits).
    pub adaptation_field_control: u8,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the header from the start of a packet.
    ///
    /// Returns `None` if the slice is shorter than a packet or does not
    /// begin with the sync byte.
    pub fn parse(data: &[u8]) -> Option<TsHeader> {
        if data.len() < TS_PACKET_SIZE || data[0] != SYNC_BYTE {
            return None;
        }
        Some(TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            transport_priority: data[1] & 0x20 != 0,
            pid: ((data[1] as u16 & 0x1f) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0f,
        })
    }

    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }
}

/// Extract just the 13-bit PID without parsing the full header.
pub fn pid_of(data: &[u8]) -> Option<u16> {
    if data.len() < 3 {
        return None;
    }
    Some(((data[1] as u16 & 0x1f) << 8) | data[2] as u16)
}

/// Byte offset of the packet payload, skipping the adaptation field.
///
/// Returns `None` when the packet carries no payload or the adaptation
/// field length is corrupt (runs past the end of the packet).
pub fn payload_offset(data: &[u8], header: &TsHeader) -> Option<usize> {
    if !header.has_payload() {
        return None;
    }
    let offset = if header.has_adaptation_field() {
        if data.len() < 5 {
            return None;
        }
        5 + data[4] as usize
    } else {
        4
    };
    if offset >= TS_PACKET_SIZE.min(data.len()) {
        return None;
    }
    Some(offset)
}

/// Find the next sync byte at or after `from`.
///
/// Used to resynchronize after a corrupt packet boundary; a hit is only
/// a candidate packet start, the caller still validates the header.
pub fn find_sync(data: &[u8], from: usize) -> Option<usize> {
    data.iter()
        .enumerate()
        .skip(from)
        .find(|(_, &b)| b == SYNC_BYTE)
        .map(|(i, _)| i)
}
