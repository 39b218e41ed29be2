use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::metrics::RING_LAG_DROPS;
use crate::mpegts::TS_PACKET_SIZE;

/// Rings smaller than this are useless for smoothing out network jitter.
pub const MIN_SLOTS: usize = 64;

/// Converts the configured buffer size into a slot count.
pub fn slots_for_kb(buffer_size_kb: usize) -> usize {
    ((buffer_size_kb * 1024).div_ceil(TS_PACKET_SIZE)).max(MIN_SLOTS)
}

/// Outcome of a cursor read.
pub enum RingRead {
    Packet(Bytes),
    /// The ring was closed and the cursor has consumed everything published
    /// before the close.
    Closed,
}

/// A consumer's position in the ring.
///
/// Cursors start at the current head: a newly attached client gets live
/// packets, never stale history. `lag` accumulates the number of packets
/// lost to forced advances; it is reporting, not an error.
pub struct Cursor {
    next: u64,
    pub lag: u64,
}

impl Cursor {
    pub fn position(&self) -> u64 {
        self.next
    }
}

struct RingState {
    slots: Vec<Bytes>,
    /// Sequence number of the next packet to publish. Monotonic, never
    /// reused within a process.
    head: u64,
    closed: bool,
}

/// Bounded single-producer multi-consumer packet ring.
///
/// The producer never waits for consumers: a consumer that falls a full
/// ring behind has its cursor forcibly advanced instead. Stalling the
/// producer would drop upstream bytes for everyone, which is strictly
/// worse than one slow client skipping ahead.
pub struct RingBuffer {
    state: Mutex<RingState>,
    notify: Notify,
    capacity: usize,
    channel_id: String,
}

impl RingBuffer {
    pub fn new(channel_id: &str, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_SLOTS);
        Self {
            state: Mutex::new(RingState {
                slots: vec![Bytes::new(); capacity],
                head: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            channel_id: channel_id.to_string(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies one packet into the next slot and wakes waiting readers.
    pub fn publish(&self, packet: Bytes) {
        {
            let mut state = self.state.lock().expect("ring lock poisoned");
            if state.closed {
                return;
            }
            let idx = (state.head % self.capacity as u64) as usize;
            state.slots[idx] = packet;
            state.head += 1;
        }
        self.notify.notify_waiters();
    }

    /// Starts a new consumer at the current head.
    pub fn register(&self) -> Cursor {
        let state = self.state.lock().expect("ring lock poisoned");
        Cursor {
            next: state.head,
            lag: 0,
        }
    }

    /// Returns the packet at the cursor, waiting for the producer when the
    /// cursor has caught up. A lagging cursor is forcibly advanced to
    /// `head - capacity + 1` first; the skipped packets are added to the
    /// cursor's lag counter.
    pub async fn read(&self, cursor: &mut Cursor) -> RingRead {
        loop {
            // Register interest before checking state, so a publish or
            // close landing in between cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().expect("ring lock poisoned");
                if cursor.next < state.head {
                    if state.head - cursor.next >= self.capacity as u64 {
                        let target = state.head - self.capacity as u64 + 1;
                        let skipped = target - cursor.next;
                        cursor.lag += skipped;
                        RING_LAG_DROPS
                            .with_label_values(&[&self.channel_id])
                            .inc_by(skipped);
                        cursor.next = target;
                    }
                    let idx = (cursor.next % self.capacity as u64) as usize;
                    let packet = state.slots[idx].clone();
                    cursor.next += 1;
                    return RingRead::Packet(packet);
                }
                if state.closed {
                    return RingRead::Closed;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant: `None` when the cursor is at head and the ring
    /// is still open.
    pub fn try_read(&self, cursor: &mut Cursor) -> Option<RingRead> {
        let state = self.state.lock().expect("ring lock poisoned");
        if cursor.next < state.head {
            if state.head - cursor.next >= self.capacity as u64 {
                let target = state.head - self.capacity as u64 + 1;
                let skipped = target - cursor.next;
                cursor.lag += skipped;
                RING_LAG_DROPS
                    .with_label_values(&[&self.channel_id])
                    .inc_by(skipped);
                cursor.next = target;
            }
            let idx = (cursor.next % self.capacity as u64) as usize;
            let packet = state.slots[idx].clone();
            cursor.next += 1;
            return Some(RingRead::Packet(packet));
        }
        if state.closed {
            return Some(RingRead::Closed);
        }
        None
    }

    /// Closes the ring and wakes every waiting reader with a terminal
    /// result. Publishing after close is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("ring lock poisoned");
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn head(&self) -> u64 {
        self.state.lock().expect("ring lock poisoned").head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pkt(tag: u8) -> Bytes {
        let mut p = vec![tag; TS_PACKET_SIZE];
        p[0] = 0x47;
        Bytes::from(p)
    }

    #[test]
    fn test_slots_for_kb() {
        // 1024 KiB / 188 rounds up to 5578 slots.
        assert_eq!(slots_for_kb(1024), 5578);
        // Tiny configurations are clamped to the minimum.
        assert_eq!(slots_for_kb(1), MIN_SLOTS);
        assert_eq!(slots_for_kb(0), MIN_SLOTS);
    }

    #[tokio::test]
    async fn test_reader_sees_packets_in_order() {
        let ring = RingBuffer::new("test", MIN_SLOTS);
        let mut cursor = ring.register();

        for i in 0..5u8 {
            ring.publish(pkt(i));
        }
        for i in 0..5u8 {
            match ring.read(&mut cursor).await {
                RingRead::Packet(p) => assert_eq!(p[1], i),
                RingRead::Closed => panic!("unexpected close"),
            }
        }
        assert_eq!(cursor.lag, 0);
    }

    #[tokio::test]
    async fn test_register_starts_at_head() {
        let ring = RingBuffer::new("test", MIN_SLOTS);
        ring.publish(pkt(1));
        ring.publish(pkt(2));

        // A consumer registered now must not see the history.
        let mut cursor = ring.register();
        assert!(ring.try_read(&mut cursor).is_none());

        ring.publish(pkt(3));
        match ring.try_read(&mut cursor).expect("packet available") {
            RingRead::Packet(p) => assert_eq!(p[1], 3),
            RingRead::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_forced_advance_on_lag() {
        let ring = RingBuffer::new("test", MIN_SLOTS);
        let mut cursor = ring.register();

        // Publish 10 more packets than the ring holds.
        let total = MIN_SLOTS as u64 + 10;
        for i in 0..total {
            ring.publish(pkt((i % 250) as u8));
        }

        match ring.read(&mut cursor).await {
            RingRead::Packet(p) => {
                // Cursor was pushed to head - capacity + 1.
                let expected_seq = total - MIN_SLOTS as u64 + 1;
                assert_eq!(p[1], ((expected_seq) % 250) as u8);
            }
            RingRead::Closed => panic!("unexpected close"),
        }
        assert_eq!(cursor.lag, total - MIN_SLOTS as u64 + 1);
        assert_eq!(cursor.position(), total - MIN_SLOTS as u64 + 2);
    }

    #[tokio::test]
    async fn test_no_forced_advance_within_capacity() {
        let ring = RingBuffer::new("test", MIN_SLOTS);
        let mut cursor = ring.register();

        for i in 0..(MIN_SLOTS as u64 - 1) {
            ring.publish(pkt((i % 250) as u8));
        }
        match ring.read(&mut cursor).await {
            RingRead::Packet(p) => assert_eq!(p[1], 0),
            RingRead::Closed => panic!("unexpected close"),
        }
        assert_eq!(cursor.lag, 0);
    }

    #[tokio::test]
    async fn test_two_consumers_identical_prefix() {
        let ring = Arc::new(RingBuffer::new("test", MIN_SLOTS));
        let mut a = ring.register();
        let mut b = ring.register();

        for i in 0..20u8 {
            ring.publish(pkt(i));
        }

        for _ in 0..20 {
            let pa = match ring.read(&mut a).await {
                RingRead::Packet(p) => p,
                RingRead::Closed => panic!("closed"),
            };
            let pb = match ring.read(&mut b).await {
                RingRead::Packet(p) => p,
                RingRead::Closed => panic!("closed"),
            };
            assert_eq!(pa, pb);
        }
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let ring = Arc::new(RingBuffer::new("test", MIN_SLOTS));
        let reader = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move {
                let mut cursor = ring.register();
                matches!(ring.read(&mut cursor).await, RingRead::Closed)
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        ring.close();

        let saw_close = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader did not wake")
            .expect("reader panicked");
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_publish() {
        let ring = Arc::new(RingBuffer::new("test", MIN_SLOTS));
        let reader = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move {
                let mut cursor = ring.register();
                match ring.read(&mut cursor).await {
                    RingRead::Packet(p) => p[1],
                    RingRead::Closed => panic!("closed"),
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        ring.publish(pkt(42));

        let tag = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader did not wake")
            .expect("reader panicked");
        assert_eq!(tag, 42);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_ignored() {
        let ring = RingBuffer::new("test", MIN_SLOTS);
        ring.close();
        ring.publish(pkt(1));
        assert_eq!(ring.head(), 0);
    }
}
