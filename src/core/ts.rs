//! MPEG transport-stream boundary scanning.
//!
//! Only packet framing is inspected: sync bytes, PIDs, the payload unit start
//! flag and the adaptation field random access indicator. Payloads are never
//! decoded.

/// Size of one transport-stream packet.
pub const PACKET_LEN: usize = 188;

/// First byte of every packet.
pub const SYNC_BYTE: u8 = 0x47;

const PAT_PID: u16 = 0;

/// Offset of the first sync byte that is confirmed by the next two packets.
///
/// A confirmation offset that lies beyond the end of `data` is not checked, so
/// a short tail still yields its first sync byte.
pub fn find_sync_boundary(data: &[u8]) -> Option<usize> {
    (0..data.len()).find(|&index| {
        data[index] == SYNC_BYTE
            && [PACKET_LEN, PACKET_LEN * 2]
                .iter()
                .all(|step| data.get(index + step).is_none_or(|&b| b == SYNC_BYTE))
    })
}

/// Offset of a packet boundary that is safe to cut a recording at.
///
/// Either a sync byte with another one exactly a packet later, or offset 0 of
/// a chunk that holds only whole packets. A lone sync byte in an unaligned
/// tail is payload as far as this function is concerned.
pub fn find_split_boundary(data: &[u8]) -> Option<usize> {
    let aligned = !data.is_empty()
        && data.len() % PACKET_LEN == 0
        && data.iter().step_by(PACKET_LEN).all(|&b| b == SYNC_BYTE);
    if aligned {
        return Some(0);
    }
    (0..data.len().saturating_sub(PACKET_LEN))
        .find(|&index| data[index] == SYNC_BYTE && data[index + PACKET_LEN] == SYNC_BYTE)
}

/// Iterates over the offsets of whole packets starting at the first sync boundary.
fn packet_offsets(data: &[u8]) -> impl Iterator<Item = usize> + '_ {
    let start = find_sync_boundary(data).unwrap_or(data.len());
    (start..data.len())
        .step_by(PACKET_LEN)
        .take_while(move |&offset| offset + PACKET_LEN <= data.len())
        .filter(move |&offset| data[offset] == SYNC_BYTE)
}

pub fn pid(packet: &[u8]) -> u16 {
    (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2])
}

pub fn payload_unit_start(packet: &[u8]) -> bool {
    packet[1] & 0x40 != 0
}

fn transport_error(packet: &[u8]) -> bool {
    packet[1] & 0x80 != 0
}

fn has_adaptation(packet: &[u8]) -> bool {
    packet[3] & 0x20 != 0
}

fn has_payload(packet: &[u8]) -> bool {
    packet[3] & 0x10 != 0
}

/// Byte offset of the payload inside `packet`, if it carries one.
fn payload_offset(packet: &[u8]) -> Option<usize> {
    if !has_payload(packet) {
        return None;
    }
    let offset = if has_adaptation(packet) {
        5 + usize::from(packet[4])
    } else {
        4
    };
    (offset < PACKET_LEN).then_some(offset)
}

fn usable(packet: &[u8]) -> bool {
    !transport_error(packet) && has_payload(packet)
}

pub fn is_pat_start(packet: &[u8]) -> bool {
    usable(packet) && pid(packet) == PAT_PID && payload_unit_start(packet)
}

pub fn is_pes_start(packet: &[u8]) -> bool {
    if !usable(packet) || pid(packet) == PAT_PID || !payload_unit_start(packet) {
        return false;
    }
    payload_offset(packet).is_some_and(|offset| {
        packet
            .get(offset..offset + 3)
            .is_some_and(|prefix| prefix == [0x00, 0x00, 0x01])
    })
}

pub fn is_random_access(packet: &[u8]) -> bool {
    !transport_error(packet) && has_adaptation(packet) && packet[4] > 0 && packet[5] & 0x40 != 0
}

/// Offset of the first packet that starts a PES payload.
pub fn find_pes_start(data: &[u8]) -> Option<usize> {
    packet_offsets(data).find(|&offset| is_pes_start(&data[offset..offset + PACKET_LEN]))
}

/// Offset of the first packet that starts a program association table.
pub fn find_pat_start(data: &[u8]) -> Option<usize> {
    packet_offsets(data).find(|&offset| is_pat_start(&data[offset..offset + PACKET_LEN]))
}

/// Offset of the first packet flagged as a random access point.
pub fn find_random_access(data: &[u8]) -> Option<usize> {
    packet_offsets(data).find(|&offset| is_random_access(&data[offset..offset + PACKET_LEN]))
}

/// Offset of the earliest packet a new recording can cleanly begin with.
///
/// That is a PAT start or a random access point, whichever comes first.
pub fn find_access_unit_start(data: &[u8]) -> Option<usize> {
    packet_offsets(data).find(|&offset| {
        let packet = &data[offset..offset + PACKET_LEN];
        is_pat_start(packet) || is_random_access(packet)
    })
}
