use bytes::{Bytes, BytesMut};

/// MPEG-TS packet size, fixed by ISO 13818-1.
pub const TS_PACKET_SIZE: usize = 188;
/// Every TS packet starts with this sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Re-aligns an arbitrary byte stream to MPEG-TS packet boundaries.
///
/// Upstream HTTP chunks are not packet-aligned, and the fan-out path must
/// only ever hand out whole packets so downstream demuxers can lock on.
/// Bytes in front of the next sync byte are dropped and counted.
pub struct TsRealigner {
    buf: BytesMut,
    discarded: u64,
}

impl TsRealigner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(TS_PACKET_SIZE * 32),
            discarded: 0,
        }
    }

    /// Appends a chunk of raw upstream bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Yields the next complete 188-byte packet, or `None` when more input
    /// is needed. Truncated tails are not an error; they stay buffered.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        let sync = match self.buf.iter().position(|&b| b == TS_SYNC_BYTE) {
            Some(pos) => pos,
            None => {
                // No sync byte anywhere in the buffer: everything so far
                // is garbage between packets.
                self.discarded += self.buf.len() as u64;
                self.buf.clear();
                return None;
            }
        };

        if sync > 0 {
            self.discarded += sync as u64;
            let _ = self.buf.split_to(sync);
        }

        if self.buf.len() < TS_PACKET_SIZE {
            return None;
        }

        Some(self.buf.split_to(TS_PACKET_SIZE).freeze())
    }

    /// Total bytes dropped while hunting for sync boundaries.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Bytes currently buffered but not yet emitted.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for TsRealigner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: u8) -> Vec<u8> {
        let mut p = vec![tag; TS_PACKET_SIZE];
        p[0] = TS_SYNC_BYTE;
        p
    }

    #[test]
    fn test_aligned_stream() {
        let mut r = TsRealigner::new();
        r.push(&packet(1));
        r.push(&packet(2));

        let p1 = r.next_packet().expect("first packet");
        assert_eq!(p1.len(), TS_PACKET_SIZE);
        assert_eq!(p1[0], TS_SYNC_BYTE);
        assert_eq!(p1[1], 1);

        let p2 = r.next_packet().expect("second packet");
        assert_eq!(p2[1], 2);

        assert!(r.next_packet().is_none());
        assert_eq!(r.discarded(), 0);
    }

    #[test]
    fn test_garbage_prefix_is_discarded() {
        let mut r = TsRealigner::new();
        r.push(&[0x00, 0x01, 0xff]);
        r.push(&packet(9));

        let p = r.next_packet().expect("packet after garbage");
        assert_eq!(p[0], TS_SYNC_BYTE);
        assert_eq!(p[1], 9);
        assert_eq!(r.discarded(), 3);
    }

    #[test]
    fn test_packet_split_across_pushes() {
        let full = packet(5);
        let mut r = TsRealigner::new();
        r.push(&full[..100]);
        assert!(r.next_packet().is_none(), "needs more data");

        r.push(&full[100..]);
        let p = r.next_packet().expect("reassembled packet");
        assert_eq!(&p[..], &full[..]);
    }

    #[test]
    fn test_truncated_tail_is_not_an_error() {
        let mut r = TsRealigner::new();
        let full = packet(7);
        r.push(&full);
        r.push(&full[..50]);

        assert!(r.next_packet().is_some());
        assert!(r.next_packet().is_none());
        assert_eq!(r.pending(), 50);
    }

    #[test]
    fn test_no_sync_byte_clears_buffer() {
        let mut r = TsRealigner::new();
        r.push(&[0x00; 512]);
        assert!(r.next_packet().is_none());
        assert_eq!(r.discarded(), 512);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_every_packet_starts_with_sync() {
        // Interleave junk between valid packets and verify each emitted
        // packet is exactly 188 bytes starting with 0x47.
        let mut r = TsRealigner::new();
        for i in 0..10u8 {
            r.push(&[0xde, 0xad]);
            r.push(&packet(i));
        }

        let mut count = 0;
        while let Some(p) = r.next_packet() {
            assert_eq!(p.len(), TS_PACKET_SIZE);
            assert_eq!(p[0], TS_SYNC_BYTE);
            count += 1;
        }
        assert_eq!(count, 10);
        assert_eq!(r.discarded(), 20);
    }
}
