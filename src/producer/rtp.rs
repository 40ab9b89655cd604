//! RTP header validation and sequence gap tracking.

use crate::core::ts::SYNC_BYTE;

const RTP_VERSION: u8 = 2;
const FIXED_HEADER_LEN: usize = 12;

/// The parts of an RTP header the UDP producer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence: u16,
    pub ssrc: u32,
    /// Start of the transport-stream payload in the datagram
    pub payload_start: usize,
    /// End of the payload, before any padding
    pub payload_end: usize,
}

/// Parses `datagram` as RTP carrying MPEG-TS.
///
/// Returns `None` for anything that is not version 2, is too short for its
/// CSRC list and extension, or whose payload does not start with a TS sync
/// byte. Such datagrams are dropped without comment.
pub fn parse(datagram: &[u8]) -> Option<RtpPacket> {
    if datagram.len() <= FIXED_HEADER_LEN || datagram[0] >> 6 != RTP_VERSION {
        return None;
    }

    let csrc_count = usize::from(datagram[0] & 0x0f);
    let mut payload_start = FIXED_HEADER_LEN + csrc_count * 4;

    if datagram[0] & 0x10 != 0 {
        let words = datagram.get(payload_start + 2..payload_start + 4)?;
        let extension_len = usize::from(u16::from_be_bytes([words[0], words[1]])) * 4;
        payload_start += 4 + extension_len;
    }

    let mut payload_end = datagram.len();
    if datagram[0] & 0x20 != 0 {
        let padding = usize::from(datagram[datagram.len() - 1]);
        payload_end = payload_end.checked_sub(padding)?;
    }

    if payload_start >= payload_end || datagram[payload_start] != SYNC_BYTE {
        return None;
    }

    Some(RtpPacket {
        sequence: u16::from_be_bytes([datagram[2], datagram[3]]),
        ssrc: u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
        payload_start,
        payload_end,
    })
}

/// Counts packets missing from a sequence-number stream.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
}

impl SequenceTracker {
    /// Records `sequence` and returns how many packets were skipped before it.
    ///
    /// Late or duplicate packets (more than half the sequence space behind)
    /// count as zero and do not move the tracker.
    pub fn observe(&mut self, sequence: u16) -> u64 {
        let Some(last) = self.last else {
            self.last = Some(sequence);
            return 0;
        };

        let gap = sequence.wrapping_sub(last.wrapping_add(1));
        if gap >= 0x8000 {
            return 0;
        }
        self.last = Some(sequence);
        u64::from(gap)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
