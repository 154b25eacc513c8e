use crate::error::{RegistryError, Result};
use crate::layout::{
    decode_name, ring_region_size, AccessMode, RingDescriptor, SegmentHeader, TopicEntry,
    DESCRIPTOR_SIZE, ENTRY_SIZE, HEADER_SIZE, LAYOUT_VERSION, MAGIC,
};
use crate::memory::SharedMemory;
use crate::ring::TopicHandle;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Validated metadata of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    name: String,
    mode: AccessMode,
    slot_size: u32,
    capacity: u32,
    ring_desc_offset: usize,
}

impl TopicInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn ring_desc_offset(&self) -> usize {
        self.ring_desc_offset
    }
}

/// Read view over a shared topic segment.
///
/// All header, table and descriptor offsets are checked once in
/// [`Registry::open`]; handles returned by [`Registry::lookup`] only ever
/// use the validated offsets.
pub struct Registry {
    name: String,
    memory: Arc<SharedMemory>,
    mmap_size: usize,
    topics: Vec<TopicInfo>,
}

impl Registry {
    /// Maps the named segment for reading and publishing.
    pub fn open(segment_name: &str) -> Result<Self> {
        let memory = SharedMemory::open(segment_name, true)?;
        Self::from_memory(segment_name, memory)
    }

    /// Maps the named segment with `PROT_READ` only. Publishing through
    /// handles of this registry fails with [`RegistryError::ReadOnly`].
    pub fn open_read_only(segment_name: &str) -> Result<Self> {
        let memory = SharedMemory::open(segment_name, false)?;
        Self::from_memory(segment_name, memory)
    }

    pub(crate) fn from_memory(name: &str, memory: SharedMemory) -> Result<Self> {
        let (mmap_size, topics) = validate(&memory)?;
        debug!(
            segment = name,
            mmap_size,
            topic_count = topics.len(),
            "opened topic registry"
        );
        Ok(Registry {
            name: name.to_string(),
            memory: Arc::new(memory),
            mmap_size,
            topics,
        })
    }

    pub fn lookup(&self, topic_name: &str) -> Result<TopicHandle> {
        self.topics
            .iter()
            .find(|topic| topic.name == topic_name)
            .map(|info| TopicHandle::new(self.memory.clone(), info.clone()))
            .ok_or_else(|| RegistryError::UnknownTopic(topic_name.to_string()))
    }

    pub fn topics(&self) -> &[TopicInfo] {
        &self.topics
    }

    pub fn handles(&self) -> impl Iterator<Item = TopicHandle> + '_ {
        self.topics
            .iter()
            .map(|info| TopicHandle::new(self.memory.clone(), info.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapped_size(&self) -> usize {
        self.mmap_size
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_read_only(&self) -> bool {
        !self.memory.writable()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("mmap_size", &self.mmap_size)
            .field("topics", &self.topics)
            .finish()
    }
}

fn corrupt(reason: String) -> RegistryError {
    RegistryError::CorruptHeader(reason)
}

fn validate(memory: &SharedMemory) -> Result<(usize, Vec<TopicInfo>)> {
    let mapped = memory.size();
    let base = memory.as_ptr().as_ptr();

    if mapped < HEADER_SIZE {
        return Err(corrupt(format!(
            "segment of {mapped} bytes is smaller than the {HEADER_SIZE} byte header"
        )));
    }

    let header = unsafe { &*(base as *const SegmentHeader) };
    if header.magic != MAGIC {
        return Err(corrupt(format!("bad magic {:02x?}", header.magic)));
    }
    if header.version != LAYOUT_VERSION {
        return Err(corrupt(format!(
            "layout version {} does not match {}",
            header.version, LAYOUT_VERSION
        )));
    }

    let mmap_size = usize::try_from(header.mmap_size).unwrap_or(usize::MAX);
    if mmap_size > mapped || mmap_size < HEADER_SIZE {
        return Err(corrupt(format!(
            "declared size {} does not fit the {mapped} byte object",
            header.mmap_size
        )));
    }

    let table_offset = usize::try_from(header.topic_table_offset).unwrap_or(usize::MAX);
    let topic_count = header.topic_count as usize;
    let table_end = topic_count
        .checked_mul(ENTRY_SIZE)
        .and_then(|len| len.checked_add(table_offset));
    let table_end = match table_end {
        Some(end) if end <= mmap_size => end,
        _ => {
            return Err(corrupt(format!(
                "topic table at {} with {} entries exceeds mapped size {}",
                header.topic_table_offset, topic_count, mmap_size
            )))
        }
    };
    if table_offset < HEADER_SIZE || table_offset % std::mem::align_of::<TopicEntry>() != 0 {
        return Err(corrupt(format!("misplaced topic table at {table_offset}")));
    }

    let mut seen = HashSet::with_capacity(topic_count);
    let mut topics = Vec::with_capacity(topic_count);

    for index in 0..topic_count {
        let entry =
            unsafe { &*(base.add(table_offset + index * ENTRY_SIZE) as *const TopicEntry) };

        let name = decode_name(&entry.name)
            .ok_or_else(|| corrupt(format!("topic {index} has an invalid name")))?;
        if !seen.insert(name) {
            return Err(corrupt(format!("duplicate topic {name}")));
        }
        let mode = AccessMode::try_from(entry.mode)
            .map_err(|raw| corrupt(format!("topic {name} has unknown mode {raw}")))?;
        if entry.slot_size == 0 {
            return Err(corrupt(format!("topic {name} has zero slot size")));
        }

        let desc_offset = usize::try_from(entry.ring_desc_offset).unwrap_or(usize::MAX);
        let desc_fits = desc_offset
            .checked_add(DESCRIPTOR_SIZE)
            .is_some_and(|end| end <= mmap_size);
        if !desc_fits
            || desc_offset < table_end
            || desc_offset % std::mem::align_of::<RingDescriptor>() != 0
        {
            return Err(corrupt(format!(
                "topic {name} ring descriptor at {desc_offset} is out of bounds"
            )));
        }

        let desc = unsafe { &*(base.add(desc_offset) as *const RingDescriptor) };
        if desc.capacity == 0 || !desc.capacity.is_power_of_two() {
            return Err(corrupt(format!(
                "topic {name} capacity {} is not a power of two",
                desc.capacity
            )));
        }
        if desc.slot_size != entry.slot_size {
            return Err(corrupt(format!(
                "topic {name} slot size {} disagrees with descriptor {}",
                entry.slot_size, desc.slot_size
            )));
        }
        let region_fits = ring_region_size(desc.capacity, desc.slot_size)
            .and_then(|len| len.checked_add(desc_offset))
            .is_some_and(|end| end <= mmap_size);
        if !region_fits {
            return Err(corrupt(format!(
                "topic {name} ring of {} slots exceeds mapped size {mmap_size}",
                desc.capacity
            )));
        }

        topics.push(TopicInfo {
            name: name.to_string(),
            mode,
            slot_size: entry.slot_size,
            capacity: desc.capacity,
            ring_desc_offset: desc_offset,
        });
    }

    Ok((mmap_size, topics))
}
