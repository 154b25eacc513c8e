//! # topicring - Shared-Memory Topic Registry
//!
//! A named POSIX shared-memory segment holding a fixed table of topics. Each
//! topic is a lock-free broadcast ring: writers advance a 64-bit head,
//! readers keep their own cursor and never write to the segment.
//!
//! ## Creating a Segment
//!
//! The process that owns the segment lays out every topic up front with
//! [`SegmentBuilder`]:
//!
//! ```rust
//! use topicring::{AccessMode, SegmentBuilder, TopicSpec};
//!
//! let registry = SegmentBuilder::new("demo")
//!     .topic(TopicSpec::new("imu", 64, 1024, AccessMode::SingleWriter))
//!     .topic(TopicSpec::new("logs", 512, 256, AccessMode::MultiWriter))
//!     .create_anonymous()?;
//! assert_eq!(registry.topic_count(), 2);
//! # Ok::<(), topicring::RegistryError>(())
//! ```
//!
//! [`SegmentBuilder::create`] does the same for a named segment that other
//! processes attach to with [`Registry::open`] or [`Registry::open_read_only`].
//!
//! ## Publishing and Subscribing
//!
//! ```rust
//! # use topicring::{AccessMode, SegmentBuilder, TopicSpec};
//! # let registry = SegmentBuilder::new("demo")
//! #     .topic(TopicSpec::new("imu", 64, 1024, AccessMode::SingleWriter))
//! #     .create_anonymous()?;
//! let imu = registry.lookup("imu")?;
//! let mut subscriber = imu.subscribe();
//!
//! imu.publish(b"sample")?;
//!
//! let mut buf = [0u8; 64];
//! let len = subscriber.try_recv(&mut buf)?.expect("message published");
//! assert_eq!(&buf[..len], b"sample");
//! # Ok::<(), topicring::RegistryError>(())
//! ```
//!
//! ## Access Modes
//!
//! - **`AccessMode::SingleWriter`**: one publisher per topic. The payload is
//!   committed before the head is advanced.
//! - **`AccessMode::MultiWriter`**: any number of publishers. The head is
//!   advanced with `fetch_add` to reserve a slot, and the slot's commit stamp
//!   tells readers when its payload is complete.
//!
//! A subscriber that falls more than `capacity` messages behind loses the
//! oldest ones and counts them in [`Subscriber::missed`].

pub use builder::{SegmentBuilder, TopicSpec};
pub use error::{RegistryError, Result};
pub use layout::{AccessMode, DEFAULT_SEGMENT_NAME};
pub use rate::{HeadSample, Throughput};
pub use registry::{Registry, TopicInfo};
pub use ring::{Subscriber, TopicHandle};

pub(crate) mod builder;
pub mod error;
pub mod layout;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod memory;
pub mod rate;
pub(crate) mod registry;
pub(crate) mod ring;
pub(crate) mod sync;
