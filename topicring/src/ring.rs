use crate::error::{RegistryError, Result};
use crate::layout::{
    slot_stride, AccessMode, RingDescriptor, SlotHeader, DESCRIPTOR_SIZE, SLOT_HEADER_SIZE,
};
use crate::memory::SharedMemory;
use crate::registry::TopicInfo;
use crate::sync::{fence, Ordering};
use core::ptr::NonNull;
use crossbeam::utils::Backoff;
use std::sync::Arc;
use tracing::{debug, trace};

/// Access to one topic ring inside a mapped segment.
///
/// Holds a reference on the mapping, so the segment stays mapped for as
/// long as any handle or subscriber is alive.
#[derive(Clone)]
pub struct TopicHandle {
    memory: Arc<SharedMemory>,
    info: TopicInfo,
    desc: NonNull<RingDescriptor>,
    slots: NonNull<u8>,
    stride: usize,
    mask: u64,
}

unsafe impl Send for TopicHandle {}
unsafe impl Sync for TopicHandle {}

impl TopicHandle {
    pub(crate) fn new(memory: Arc<SharedMemory>, info: TopicInfo) -> Self {
        // Offsets in `info` were bounds checked against the mapping at open.
        let desc_ptr = unsafe { memory.as_ptr().as_ptr().add(info.ring_desc_offset()) };
        let desc = unsafe { NonNull::new_unchecked(desc_ptr as *mut RingDescriptor) };
        let slots = unsafe { NonNull::new_unchecked(desc_ptr.add(DESCRIPTOR_SIZE)) };
        TopicHandle {
            stride: slot_stride(info.slot_size()),
            mask: info.capacity() as u64 - 1,
            memory,
            info,
            desc,
            slots,
        }
    }

    pub fn info(&self) -> &TopicInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn mode(&self) -> AccessMode {
        self.info.mode()
    }

    pub fn slot_size(&self) -> usize {
        self.info.slot_size() as usize
    }

    pub fn capacity(&self) -> u64 {
        self.info.capacity() as u64
    }

    #[inline(always)]
    fn descriptor(&self) -> &RingDescriptor {
        unsafe { self.desc.as_ref() }
    }

    #[inline(always)]
    fn slot(&self, seq: u64) -> (&SlotHeader, *mut u8) {
        let offset = (seq & self.mask) as usize * self.stride;
        unsafe {
            let ptr = self.slots.as_ptr().add(offset);
            (&*(ptr as *const SlotHeader), ptr.add(SLOT_HEADER_SIZE))
        }
    }

    /// Number of slots ever published to this topic.
    #[inline]
    pub fn read_head(&self) -> u64 {
        self.descriptor().w_head.load(Ordering::Acquire)
    }

    /// Publishes one payload and returns the sequence number it was given.
    ///
    /// In [`AccessMode::SingleWriter`] mode the payload is committed before
    /// the head moves, so any reader that observes the new head also sees
    /// the payload. In [`AccessMode::MultiWriter`] mode the head is advanced
    /// first to reserve the slot, and readers can briefly see a head that
    /// points past a slot still being written. A multi-writer publisher that
    /// is overtaken by a full ring of newer messages before it reaches its
    /// slot drops the payload, as a reader would have skipped it anyway.
    pub fn publish(&self, payload: &[u8]) -> Result<u64> {
        if !self.memory.writable() {
            return Err(RegistryError::ReadOnly);
        }
        if payload.len() > self.slot_size() {
            return Err(RegistryError::PayloadTooLarge {
                len: payload.len(),
                slot_size: self.slot_size(),
            });
        }

        let head = &self.descriptor().w_head;
        let seq = match self.info.mode() {
            AccessMode::SingleWriter => {
                let seq = head.load(Ordering::Relaxed);
                self.write_slot(seq, payload);
                head.store(seq.wrapping_add(1), Ordering::Release);
                seq
            }
            AccessMode::MultiWriter => {
                let seq = head.fetch_add(1, Ordering::AcqRel);
                self.write_slot(seq, payload);
                seq
            }
        };

        trace!(topic = self.name(), seq, len = payload.len(), "published");
        Ok(seq)
    }

    #[inline(always)]
    fn write_slot(&self, seq: u64, payload: &[u8]) {
        let (header, data) = self.slot(seq);
        match self.info.mode() {
            AccessMode::SingleWriter => header.begin_write(),
            AccessMode::MultiWriter => {
                if !header.claim(seq) {
                    trace!(topic = self.name(), seq, "slot already holds a newer sequence");
                    return;
                }
            }
        }
        fence(Ordering::Release);
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), data, payload.len());
        }
        header.commit(seq, payload.len() as u32);
    }

    /// Subscribes starting at the current head; only messages published
    /// after this call are delivered.
    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_from(self.read_head())
    }

    pub fn subscribe_from(&self, seq: u64) -> Subscriber {
        Subscriber {
            topic: self.clone(),
            cursor: seq,
            missed: 0,
        }
    }
}

impl std::fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHandle")
            .field("info", &self.info)
            .field("head", &self.read_head())
            .finish()
    }
}

/// Independent reader cursor over a topic.
///
/// Subscribers keep no state in shared memory. A subscriber that falls more
/// than `capacity` messages behind skips ahead to the oldest slot still
/// held in the ring and adds the skipped count to [`Subscriber::missed`].
pub struct Subscriber {
    topic: TopicHandle,
    cursor: u64,
    missed: u64,
}

impl Subscriber {
    pub fn topic(&self) -> &TopicHandle {
        &self.topic
    }

    /// Sequence number of the next message this subscriber will read.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn lag(&self) -> u64 {
        self.topic.read_head().saturating_sub(self.cursor)
    }

    /// Copies the next message into `buf` and returns its length, or `None`
    /// when nothing new has been committed yet.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let capacity = self.topic.capacity();
        loop {
            let head = self.topic.read_head();
            if head <= self.cursor {
                return Ok(None);
            }
            if head - self.cursor > capacity {
                self.skip_to(head - capacity);
                continue;
            }

            let expected = self.cursor.wrapping_add(1);
            let (header, data) = self.topic.slot(self.cursor);
            if header.stamp() != expected {
                if self.topic.read_head() - self.cursor > capacity {
                    continue;
                }
                return Ok(None);
            }

            let len = (header.len() as usize).min(self.topic.slot_size());
            if buf.len() < len {
                return Err(RegistryError::BufferTooSmall {
                    len: buf.len(),
                    needed: len,
                });
            }
            // SAFETY: the slot lies inside the validated ring. A writer that
            // laps this reader during the copy changes the stamp first, and
            // a writer of the next generation has reserved the slot once the
            // head is more than a ring ahead. Both are checked below.
            unsafe {
                std::ptr::copy_nonoverlapping(data, buf.as_mut_ptr(), len);
            }
            fence(Ordering::Acquire);
            if header.seq.load(Ordering::Relaxed) == expected
                && self.topic.read_head().wrapping_sub(self.cursor) <= capacity
            {
                self.cursor = expected;
                return Ok(Some(len));
            }
        }
    }

    /// Spins with backoff until a message is available.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let backoff = Backoff::new();
        loop {
            if let Some(len) = self.try_recv(buf)? {
                return Ok(len);
            }
            backoff.snooze();
        }
    }

    fn skip_to(&mut self, seq: u64) {
        let skipped = seq - self.cursor;
        self.missed += skipped;
        debug!(
            topic = self.topic.name(),
            from = self.cursor,
            to = seq,
            skipped,
            "subscriber lagged behind writer"
        );
        self.cursor = seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{SegmentBuilder, TopicSpec};
    use crate::Registry;
    use rstest::*;
    use std::collections::HashSet;
    use std::thread;

    #[fixture]
    fn registry() -> Registry {
        SegmentBuilder::new("ring-tests")
            .topic(TopicSpec::new("sw", 64, 8, AccessMode::SingleWriter))
            .topic(TopicSpec::new("mw", 16, 4096, AccessMode::MultiWriter))
            .create_anonymous()
            .unwrap()
    }

    #[rstest]
    fn test_publish_then_read(registry: Registry) -> Result<()> {
        let topic = registry.lookup("sw")?;
        let mut subscriber = topic.subscribe();
        let mut buf = [0u8; 64];

        assert_eq!(subscriber.try_recv(&mut buf)?, None);

        assert_eq!(topic.publish(b"hello")?, 0);
        assert_eq!(topic.publish(b"world!")?, 1);
        assert_eq!(topic.read_head(), 2);

        assert_eq!(subscriber.try_recv(&mut buf)?, Some(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(subscriber.try_recv(&mut buf)?, Some(6));
        assert_eq!(&buf[..6], b"world!");
        assert_eq!(subscriber.try_recv(&mut buf)?, None);
        assert_eq!(subscriber.missed(), 0);
        Ok(())
    }

    #[rstest]
    fn test_subscribe_skips_history(registry: Registry) -> Result<()> {
        let topic = registry.lookup("sw")?;
        topic.publish(b"old")?;
        let mut subscriber = topic.subscribe();
        let mut buf = [0u8; 64];
        assert_eq!(subscriber.try_recv(&mut buf)?, None);

        let mut replay = topic.subscribe_from(0);
        assert_eq!(replay.try_recv(&mut buf)?, Some(3));
        Ok(())
    }

    #[rstest]
    fn test_payload_too_large(registry: Registry) -> Result<()> {
        let topic = registry.lookup("sw")?;
        assert!(matches!(
            topic.publish(&[0u8; 65]),
            Err(RegistryError::PayloadTooLarge { len: 65, slot_size: 64 })
        ));
        assert_eq!(topic.read_head(), 0);
        Ok(())
    }

    #[rstest]
    fn test_buffer_too_small(registry: Registry) -> Result<()> {
        let topic = registry.lookup("sw")?;
        let mut subscriber = topic.subscribe();
        topic.publish(&[7u8; 32])?;

        let mut small = [0u8; 8];
        assert!(matches!(
            subscriber.try_recv(&mut small),
            Err(RegistryError::BufferTooSmall { len: 8, needed: 32 })
        ));
        let mut buf = [0u8; 64];
        assert_eq!(subscriber.try_recv(&mut buf)?, Some(32));
        Ok(())
    }

    #[rstest]
    fn test_lagging_reader_loses_oldest(registry: Registry) -> Result<()> {
        let topic = registry.lookup("sw")?;
        let mut subscriber = topic.subscribe();

        for i in 0..20u64 {
            topic.publish(&i.to_le_bytes())?;
        }
        assert_eq!(subscriber.lag(), 20);

        let mut buf = [0u8; 64];
        let mut seen = Vec::new();
        while let Some(len) = subscriber.try_recv(&mut buf)? {
            assert_eq!(len, 8);
            seen.push(u64::from_le_bytes(buf[..8].try_into().unwrap()));
        }

        assert_eq!(seen, (12..20).collect::<Vec<_>>());
        assert_eq!(subscriber.missed(), 12);
        assert_eq!(subscriber.cursor(), 20);
        Ok(())
    }

    #[rstest]
    fn test_head_monotonic_under_concurrent_writers(registry: Registry) -> Result<()> {
        let topic = registry.lookup("mw")?;
        let writers = 4;
        let per_writer = 500u64;

        thread::scope(|s| {
            for w in 0..writers {
                let topic = topic.clone();
                s.spawn(move || {
                    for i in 0..per_writer {
                        let value = ((w as u64) << 32) | i;
                        topic.publish(&value.to_le_bytes()).unwrap();
                    }
                });
            }

            let observer = topic.clone();
            s.spawn(move || {
                let mut last = 0;
                while last < writers as u64 * per_writer {
                    let head = observer.read_head();
                    assert!(head >= last, "head went backwards: {head} < {last}");
                    last = head;
                }
            });
        });

        assert_eq!(topic.read_head(), writers as u64 * per_writer);

        let mut subscriber = topic.subscribe_from(0);
        let mut buf = [0u8; 16];
        let mut values = HashSet::new();
        while let Some(len) = subscriber.try_recv(&mut buf)? {
            assert_eq!(len, 8);
            values.insert(u64::from_le_bytes(buf[..8].try_into().unwrap()));
        }
        assert_eq!(values.len(), writers * per_writer as usize);
        Ok(())
    }

    #[rstest]
    fn test_single_writer_payload_visible_with_head(registry: Registry) -> Result<()> {
        let topic = registry.lookup("sw")?;
        let total = 10_000u64;

        thread::scope(|s| {
            let writer = topic.clone();
            s.spawn(move || {
                for i in 0..total {
                    let mut payload = [0u8; 64];
                    payload[..8].copy_from_slice(&i.to_le_bytes());
                    payload[56..].copy_from_slice(&i.to_le_bytes());
                    writer.publish(&payload).unwrap();
                }
            });

            let mut subscriber = topic.subscribe_from(0);
            let mut buf = [0u8; 64];
            let mut last = None;
            while subscriber.cursor() < total {
                if let Some(len) = subscriber.try_recv(&mut buf).unwrap() {
                    assert_eq!(len, 64);
                    let front = u64::from_le_bytes(buf[..8].try_into().unwrap());
                    let back = u64::from_le_bytes(buf[56..].try_into().unwrap());
                    assert_eq!(front, back, "torn payload");
                    assert_eq!(front, subscriber.cursor() - 1);
                    if let Some(prev) = last {
                        assert!(front > prev);
                    }
                    last = Some(front);
                }
            }
        });
        Ok(())
    }

    #[test]
    fn test_late_multi_writer_does_not_overwrite_newer_slot() -> Result<()> {
        let registry = SegmentBuilder::new("late-writer")
            .topic(TopicSpec::new("mw", 8, 2, AccessMode::MultiWriter))
            .create_anonymous()?;
        let topic = registry.lookup("mw")?;

        // Sequences 0..3 reserved; 2 commits into slot 0 before 0 gets there.
        topic.descriptor().w_head.store(3, Ordering::Release);
        topic.write_slot(2, b"newest");
        topic.write_slot(0, b"stale");
        topic.write_slot(1, b"middle");

        let mut buf = [0u8; 8];
        let mut subscriber = topic.subscribe_from(1);
        assert_eq!(subscriber.try_recv(&mut buf)?, Some(6));
        assert_eq!(&buf[..6], b"middle");
        assert_eq!(subscriber.try_recv(&mut buf)?, Some(6));
        assert_eq!(&buf[..6], b"newest");
        assert_eq!(subscriber.try_recv(&mut buf)?, None);

        let mut lagging = topic.subscribe_from(0);
        assert_eq!(lagging.try_recv(&mut buf)?, Some(6));
        assert_eq!(lagging.missed(), 1);
        Ok(())
    }

    #[test]
    fn test_multi_writers_lapping_small_ring_never_tear() -> Result<()> {
        let registry = SegmentBuilder::new("lapping")
            .topic(TopicSpec::new("mw", 4096, 2, AccessMode::MultiWriter))
            .create_anonymous()?;
        let topic = registry.lookup("mw")?;
        let writers = 3u8;
        let per_writer = 2_000;

        thread::scope(|s| {
            for w in 0..writers {
                let writer = topic.clone();
                s.spawn(move || {
                    let payload = vec![w + 1; 4096];
                    for _ in 0..per_writer {
                        writer.publish(&payload).unwrap();
                    }
                });
            }

            let mut subscriber = topic.subscribe_from(0);
            let mut buf = vec![0u8; 4096];
            let total = writers as u64 * per_writer;
            while subscriber.cursor() < total {
                if let Some(len) = subscriber.try_recv(&mut buf).unwrap() {
                    assert_eq!(len, 4096);
                    let first = buf[0];
                    assert!((1..=writers).contains(&first));
                    assert!(buf.iter().all(|&b| b == first), "torn payload");
                }
            }
        });
        Ok(())
    }

    #[rstest]
    fn test_blocking_recv(registry: Registry) -> Result<()> {
        let topic = registry.lookup("mw")?;
        let mut subscriber = topic.subscribe();

        let writer = topic.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            writer.publish(b"late").unwrap();
        });

        let mut buf = [0u8; 16];
        assert_eq!(subscriber.recv(&mut buf)?, 4);
        assert_eq!(&buf[..4], b"late");
        handle.join().unwrap();
        Ok(())
    }
}
