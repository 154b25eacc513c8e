use crate::error::{RegistryError, Result};
use crate::layout::{
    align_up, encode_name, page_size, ring_region_size, slot_stride, AccessMode, RingDescriptor,
    SegmentHeader, SlotHeader, TopicEntry, DESCRIPTOR_SIZE, ENTRY_SIZE, HEADER_SIZE,
    LAYOUT_VERSION, MAGIC, TOPIC_NAME_LEN,
};
use crate::memory::SharedMemory;
use crate::registry::Registry;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub slot_size: u32,
    pub capacity: u32,
    pub mode: AccessMode,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, slot_size: u32, capacity: u32, mode: AccessMode) -> Self {
        TopicSpec {
            name: name.into(),
            slot_size,
            capacity,
            mode,
        }
    }
}

/// Lays out a topic segment. This is the broker side of the registry: the
/// topic table is fixed once the segment exists.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    name: String,
    topics: Vec<TopicSpec>,
    unlink_on_drop: bool,
}

struct Plan {
    total_size: usize,
    table_offset: usize,
    ring_offsets: Vec<usize>,
}

impl SegmentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        SegmentBuilder {
            name: name.into(),
            topics: Vec::new(),
            unlink_on_drop: true,
        }
    }

    pub fn topic(mut self, spec: TopicSpec) -> Self {
        self.topics.push(spec);
        self
    }

    /// Whether the named object is removed once the returned registry and
    /// all of its handles are dropped. Defaults to `true`.
    pub fn unlink_on_drop(mut self, unlink: bool) -> Self {
        self.unlink_on_drop = unlink;
        self
    }

    /// Creates the named segment. Fails with
    /// [`RegistryError::AlreadyExists`] if the name is taken.
    pub fn create(self) -> Result<Registry> {
        let plan = self.plan()?;
        let mut memory = SharedMemory::create(&self.name, plan.total_size)?;
        unsafe { self.write(&memory, &plan) };
        if !self.unlink_on_drop {
            memory.persist();
        }
        info!(
            segment = %self.name,
            size = plan.total_size,
            topics = self.topics.len(),
            "created topic segment"
        );
        Registry::from_memory(&self.name, memory)
    }

    /// Builds the same layout in an anonymous shared mapping.
    pub fn create_anonymous(self) -> Result<Registry> {
        let plan = self.plan()?;
        let memory = SharedMemory::anonymous(plan.total_size)?;
        unsafe { self.write(&memory, &plan) };
        Registry::from_memory(&self.name, memory)
    }

    fn plan(&self) -> Result<Plan> {
        let mut names = HashSet::new();
        for spec in &self.topics {
            let invalid = |reason| RegistryError::InvalidTopic {
                name: spec.name.clone(),
                reason,
            };
            if spec.name.is_empty() {
                return Err(invalid("name is empty"));
            }
            if spec.name.len() >= TOPIC_NAME_LEN {
                return Err(invalid("name is too long"));
            }
            if spec.name.as_bytes().contains(&0) {
                return Err(invalid("name contains a NUL byte"));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(invalid("duplicate topic name"));
            }
            if spec.slot_size == 0 {
                return Err(invalid("slot size must be non-zero"));
            }
            if spec.capacity == 0 || !spec.capacity.is_power_of_two() {
                return Err(invalid("capacity must be a non-zero power of two"));
            }
        }

        let table_offset = align_up(HEADER_SIZE, std::mem::align_of::<TopicEntry>());
        let mut cursor = table_offset + self.topics.len() * ENTRY_SIZE;
        let mut ring_offsets = Vec::with_capacity(self.topics.len());

        for spec in &self.topics {
            cursor = align_up(cursor, std::mem::align_of::<RingDescriptor>());
            ring_offsets.push(cursor);
            cursor = ring_region_size(spec.capacity, spec.slot_size)
                .and_then(|len| cursor.checked_add(len))
                .ok_or_else(|| RegistryError::InvalidTopic {
                    name: spec.name.clone(),
                    reason: "ring does not fit in the address space",
                })?;
        }

        Ok(Plan {
            total_size: align_up(cursor, page_size()),
            table_offset,
            ring_offsets,
        })
    }

    /// # Safety
    ///
    /// `memory` must be a fresh writable mapping of at least
    /// `plan.total_size` bytes that no other thread is reading yet.
    unsafe fn write(&self, memory: &SharedMemory, plan: &Plan) {
        let base = memory.as_ptr().as_ptr();

        let rings = self.topics.iter().zip(&plan.ring_offsets);
        for (index, (spec, &ring_offset)) in rings.enumerate() {
            let entry = base.add(plan.table_offset + index * ENTRY_SIZE) as *mut TopicEntry;
            entry.write(TopicEntry {
                name: encode_name(&spec.name),
                slot_size: spec.slot_size,
                mode: spec.mode as u32,
                ring_desc_offset: ring_offset as u64,
            });

            let desc = base.add(ring_offset);
            (desc as *mut RingDescriptor).write(RingDescriptor::new(spec.capacity, spec.slot_size));

            let stride = slot_stride(spec.slot_size);
            let slots = desc.add(DESCRIPTOR_SIZE);
            for slot in 0..spec.capacity as usize {
                (slots.add(slot * stride) as *mut SlotHeader).write(SlotHeader::new());
            }
        }

        // Header last: openers reject the segment until the magic is in place.
        (base as *mut SegmentHeader).write(SegmentHeader {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            topic_count: self.topics.len() as u32,
            mmap_size: plan.total_size as u64,
            topic_table_offset: plan.table_offset as u64,
        });
    }
}
