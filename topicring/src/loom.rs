#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::{AccessMode, SegmentBuilder, TopicSpec};
    use loom::{model::Builder, thread};

    fn model() -> Builder {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }
        builder
    }

    #[test]
    fn test_single_writer_commit_before_head() {
        model().check(|| {
            let registry = SegmentBuilder::new("loom-sw")
                .topic(TopicSpec::new("t", 8, 2, AccessMode::SingleWriter))
                .create_anonymous()
                .unwrap();
            let topic = registry.lookup("t").unwrap();
            let mut subscriber = topic.subscribe_from(0);

            let writer = topic.clone();
            let handle = thread::spawn(move || {
                for i in 0..3u64 {
                    writer.publish(&i.to_le_bytes()).unwrap();
                }
            });

            let mut buf = [0u8; 8];
            let mut last = None;
            for _ in 0..4 {
                if let Some(len) = subscriber.try_recv(&mut buf).unwrap() {
                    assert_eq!(len, 8);
                    let value = u64::from_le_bytes(buf);
                    assert_eq!(value, subscriber.cursor() - 1);
                    if let Some(prev) = last {
                        assert!(value > prev);
                    }
                    last = Some(value);
                } else {
                    thread::yield_now();
                }
            }

            handle.join().unwrap();
            assert_eq!(topic.read_head(), 3);
        });
    }

    #[test]
    fn test_multi_writer_reserves_distinct_slots() {
        model().check(|| {
            let registry = SegmentBuilder::new("loom-mw")
                .topic(TopicSpec::new("t", 8, 4, AccessMode::MultiWriter))
                .create_anonymous()
                .unwrap();
            let topic = registry.lookup("t").unwrap();

            let handles: Vec<_> = (0..2u64)
                .map(|w| {
                    let writer = topic.clone();
                    thread::spawn(move || writer.publish(&w.to_le_bytes()).unwrap())
                })
                .collect();

            let mut seqs: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            seqs.sort_unstable();
            assert_eq!(seqs, vec![0, 1]);
            assert_eq!(topic.read_head(), 2);

            let mut subscriber = topic.subscribe_from(0);
            let mut buf = [0u8; 8];
            let mut values = Vec::new();
            while let Some(len) = subscriber.try_recv(&mut buf).unwrap() {
                assert_eq!(len, 8);
                values.push(u64::from_le_bytes(buf));
            }
            values.sort_unstable();
            assert_eq!(values, vec![0, 1]);
        });
    }

    #[test]
    fn test_multi_writer_contended_slot_keeps_newest() {
        model().check(|| {
            let registry = SegmentBuilder::new("loom-claim")
                .topic(TopicSpec::new("t", 8, 1, AccessMode::MultiWriter))
                .create_anonymous()
                .unwrap();
            let topic = registry.lookup("t").unwrap();

            let handles: Vec<_> = (1..=2u64)
                .map(|w| {
                    let writer = topic.clone();
                    thread::spawn(move || (writer.publish(&w.to_le_bytes()).unwrap(), w))
                })
                .collect();
            let results: Vec<(u64, u64)> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            let newest = results.iter().find(|(seq, _)| *seq == 1).unwrap().1;

            let mut subscriber = topic.subscribe_from(0);
            let mut buf = [0u8; 8];
            assert_eq!(subscriber.try_recv(&mut buf).unwrap(), Some(8));
            assert_eq!(u64::from_le_bytes(buf), newest);
            assert_eq!(subscriber.missed(), 1);
            assert_eq!(subscriber.try_recv(&mut buf).unwrap(), None);
        });
    }
}
