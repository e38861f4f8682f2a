//! Buffer headers, data buffer rings and status/event queues
//!
//! A buffer header binds a transfer (or an RT subaddress) to a ring of data
//! buffers and to a status queue and an event queue. Headers are four words
//! in device memory:
//!
//! | word | contents                                     |
//! |------|----------------------------------------------|
//! | 0    | control: modes, queue size, indices, overflow |
//! | 1    | status queue address                         |
//! | 2    | event queue address                          |
//! | 3    | first data buffer address                    |

use bitfield::bitfield;
use log::{debug, warn};
use std::collections::BTreeMap;

use crate::config::{MemoryLayout, QUEUE_ENTRY_BYTES};
use crate::core::Bus;
use crate::error::{BiuError, Result};
use crate::memory::DeviceMemory;

/// Number of buffers in a ring, as a power of two
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueSize {
    /// 1 buffer
    One = 0,
    /// 2 buffers
    Two = 1,
    /// 4 buffers
    Four = 2,
    /// 8 buffers
    Eight = 3,
    /// 16 buffers
    Sixteen = 4,
    /// 32 buffers
    ThirtyTwo = 5,
    /// 64 buffers
    SixtyFour = 6,
    /// 128 buffers
    OneTwentyEight = 7,
    /// 256 buffers
    TwoFiftySix = 8,
}

impl QueueSize {
    /// Decode the size enumeration
    pub fn from_raw(value: u8) -> Result<Self> {
        Ok(match value {
            0 => QueueSize::One,
            1 => QueueSize::Two,
            2 => QueueSize::Four,
            3 => QueueSize::Eight,
            4 => QueueSize::Sixteen,
            5 => QueueSize::ThirtyTwo,
            6 => QueueSize::SixtyFour,
            7 => QueueSize::OneTwentyEight,
            8 => QueueSize::TwoFiftySix,
            _ => return Err(BiuError::param(3, "qsize", value)),
        })
    }

    /// Raw enumeration value
    pub fn raw(&self) -> u8 {
        *self as u8
    }

    /// Number of buffers
    pub fn count(&self) -> u32 {
        1 << self.raw()
    }
}

/// How the engine moves through the buffer ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferQueueMode {
    /// Wrap to the first buffer after the last
    #[default]
    Cyclic = 0,
    /// Stop on the last buffer
    StayLast = 1,
    /// Only the host moves the index
    HostControlled = 2,
}

impl BufferQueueMode {
    /// Decode the mode
    pub fn from_raw(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BufferQueueMode::Cyclic),
            1 => Ok(BufferQueueMode::StayLast),
            2 => Ok(BufferQueueMode::HostControlled),
            _ => Err(BiuError::param(5, "bqm", value)),
        }
    }
}

/// What happens to the buffer index when a received message is in error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferStoreMode {
    /// Erroneous data stays in place and the index does not advance
    #[default]
    Discard = 0,
    /// The index advances even on error
    KeepCurrent = 1,
}

impl BufferStoreMode {
    /// Decode the mode
    pub fn from_raw(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BufferStoreMode::Discard),
            1 => Ok(BufferStoreMode::KeepCurrent),
            _ => Err(BiuError::param(4, "bsm", value)),
        }
    }
}

/// Depth of the status queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatusQueueMode {
    /// A single entry, overwritten on every transfer
    #[default]
    OneEntry = 1,
    /// One entry per data buffer
    AsQueueSize = 2,
}

impl StatusQueueMode {
    /// Decode the mode; 0 is accepted as the single-entry default
    pub fn from_raw(value: u8) -> Result<Self> {
        match value {
            0 | 1 => Ok(StatusQueueMode::OneEntry),
            2 => Ok(StatusQueueMode::AsQueueSize),
            _ => Err(BiuError::param(6, "sqm", value)),
        }
    }
}

bitfield! {
    /// Buffer header word 0
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct HeaderControl(u32);
    impl Debug;
    pub u8, queue_size, set_queue_size: 31, 28;
    pub u8, queue_mode, set_queue_mode: 26, 25;
    pub store_keep, set_store_keep: 24;
    pub u8, status_mode, set_status_mode: 23, 22;
    pub status_overflow, set_status_overflow: 17;
    pub event_overflow, set_event_overflow: 16;
    pub u8, queue_index, set_queue_index: 15, 8;
    pub u8, buffer_index, set_buffer_index: 7, 0;
}

bitfield! {
    /// Status queue entry word 0
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct QueueControl(u32);
    impl Debug;
    pub valid, set_valid: 31;
    pub error, set_error: 30;
    pub exception, set_exception: 29;
    pub secondary_bus, set_secondary_bus: 28;
    pub u8, buffer_index, set_buffer_index: 23, 16;
    pub u16, error_flags, set_error_flags: 15, 0;
}

/// Parameters of a buffer header definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeaderSpec {
    /// Header id
    pub hid: u16,
    /// First data buffer id
    pub bid: u16,
    /// Ring size
    pub queue_size: QueueSize,
    /// Error store behaviour
    pub store_mode: BufferStoreMode,
    /// Ring traversal
    pub queue_mode: BufferQueueMode,
    /// Status queue depth
    pub status_mode: StatusQueueMode,
}

impl HeaderSpec {
    /// A header with default store and status modes
    pub fn new(hid: u16, bid: u16, queue_size: QueueSize, queue_mode: BufferQueueMode) -> Self {
        HeaderSpec {
            hid,
            bid,
            queue_size,
            store_mode: BufferStoreMode::Discard,
            queue_mode,
            status_mode: StatusQueueMode::OneEntry,
        }
    }

    /// Use a status queue as deep as the buffer ring
    pub fn with_status_queue(mut self) -> Self {
        self.status_mode = StatusQueueMode::AsQueueSize;
        self
    }
}

/// Addresses and state of a defined header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeaderInfo {
    /// Header id
    pub hid: u16,
    /// First data buffer id
    pub bid: u16,
    /// Header address
    pub header_addr: u32,
    /// Status queue address
    pub sq_addr: u32,
    /// Event queue address
    pub eq_addr: u32,
    /// First data buffer address
    pub buffer_addr: u32,
    /// Buffers in the ring
    pub buffer_count: u32,
    /// Index of the next buffer the engine uses
    pub current_index: u32,
}

/// One status queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusEntry {
    /// Transfer ended in error
    pub error: bool,
    /// Status word exception
    pub exception: bool,
    /// Bus used
    pub bus: Bus,
    /// Buffer index used
    pub buffer_index: u8,
    /// Monitor-style error flags
    pub error_flags: u16,
    /// First status word
    pub status1: u16,
    /// Second status word (RT-to-RT)
    pub status2: u16,
    /// Address of the data buffer used
    pub buffer_addr: u32,
    /// Compact time tag
    pub time_tag: u32,
}

impl StatusEntry {
    /// Encode into the four queue words
    pub fn to_words(&self) -> [u32; 4] {
        let mut ctrl = QueueControl(0);
        ctrl.set_valid(true);
        ctrl.set_error(self.error);
        ctrl.set_exception(self.exception);
        ctrl.set_secondary_bus(self.bus == Bus::BusB);
        ctrl.set_buffer_index(self.buffer_index);
        ctrl.set_error_flags(self.error_flags);
        [
            ctrl.0,
            ((self.status2 as u32) << 16) | self.status1 as u32,
            self.buffer_addr,
            self.time_tag,
        ]
    }

    /// Decode from the four queue words
    pub fn from_words(words: [u32; 4]) -> Self {
        let ctrl = QueueControl(words[0]);
        StatusEntry {
            error: ctrl.error(),
            exception: ctrl.exception(),
            bus: Bus::from_bit(ctrl.secondary_bus() as u32),
            buffer_index: ctrl.buffer_index(),
            error_flags: ctrl.error_flags(),
            status1: words[1] as u16,
            status2: (words[1] >> 16) as u16,
            buffer_addr: words[2],
            time_tag: words[3],
        }
    }
}

/// Status/event queue block of one header
///
/// `capacity` is the size of the block in the pool, `entries` the depth in use.
#[derive(Debug, Clone, Copy)]
struct Allocation {
    sq_addr: u32,
    eq_addr: u32,
    capacity: u32,
    entries: u32,
}

/// Owner of all buffer headers
#[derive(Debug, Clone)]
pub struct BufferManager {
    layout: MemoryLayout,
    next_queue_addr: u32,
    free_blocks: Vec<Allocation>,
    headers: BTreeMap<u16, (HeaderSpec, Allocation)>,
}

impl BufferManager {
    /// Create a manager over the header, queue and buffer areas
    pub fn new(layout: MemoryLayout) -> Self {
        BufferManager {
            layout,
            next_queue_addr: layout.queue_base,
            free_blocks: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    fn max_hid(&self) -> u16 {
        ((self.layout.queue_base - self.layout.bh_base) / 16 - 1) as u16
    }

    fn max_bid(&self) -> u32 {
        (self.layout.instr_base - self.layout.buf_base) / 64 - 1
    }

    fn queue_entries(spec: &HeaderSpec) -> u32 {
        match spec.status_mode {
            StatusQueueMode::OneEntry => 1,
            StatusQueueMode::AsQueueSize => spec.queue_size.count(),
        }
    }

    fn allocate(&mut self, entries: u32) -> Result<Allocation> {
        // smallest released block that fits
        let reused = self
            .free_blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity >= entries)
            .min_by_key(|(_, b)| b.capacity)
            .map(|(i, _)| i);
        if let Some(i) = reused {
            let block = self.free_blocks.swap_remove(i);
            return Ok(Allocation { entries, ..block });
        }
        let bytes = entries * QUEUE_ENTRY_BYTES;
        let end = self.layout.queue_base + self.layout.queue_size;
        if self.next_queue_addr + 2 * bytes > end {
            return Err(BiuError::exhausted("status queue pool"));
        }
        let sq_addr = self.next_queue_addr;
        let eq_addr = sq_addr + bytes;
        self.next_queue_addr = eq_addr + bytes;
        Ok(Allocation {
            sq_addr,
            eq_addr,
            capacity: entries,
            entries,
        })
    }

    /// Fit a header's queue block to a new depth, reusing it in place when large enough
    fn reallocate(&mut self, current: Option<Allocation>, entries: u32) -> Result<Allocation> {
        match current {
            Some(block) if block.capacity >= entries => Ok(Allocation { entries, ..block }),
            Some(block) => {
                let fresh = self.allocate(entries)?;
                self.free_blocks.push(block);
                Ok(fresh)
            }
            None => self.allocate(entries),
        }
    }

    /// Zero the status and event slots of a block from `first` up to its capacity
    fn clear_queues<M: DeviceMemory + ?Sized>(mem: &mut M, alloc: &Allocation, first: u32) -> Result<()> {
        let skip = first * QUEUE_ENTRY_BYTES;
        let words = (alloc.capacity - first) * QUEUE_ENTRY_BYTES / 4;
        mem.fill(alloc.sq_addr + skip, words, 0)?;
        mem.fill(alloc.eq_addr + skip, words, 0)
    }

    /// Define (or redefine) a buffer header
    pub fn define_header<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        spec: HeaderSpec,
    ) -> Result<HeaderInfo> {
        if spec.hid == 0 || spec.hid > self.max_hid() {
            return Err(BiuError::param(1, "hid", spec.hid));
        }
        if spec.bid as u32 + spec.queue_size.count() - 1 > self.max_bid() {
            return Err(BiuError::param(2, "bid", spec.bid));
        }
        let entries = Self::queue_entries(&spec);
        let current = self.headers.get(&spec.hid).map(|(_, a)| *a);
        let alloc = self.reallocate(current, entries)?;
        let mut ctrl = HeaderControl(0);
        Self::apply_modes(&mut ctrl, &spec);
        let addr = self.layout.header_addr(spec.hid);
        mem.write_block(
            addr,
            &[ctrl.0, alloc.sq_addr, alloc.eq_addr, self.layout.buffer_addr(spec.bid)],
        )?;
        Self::clear_queues(mem, &alloc, 0)?;
        self.headers.insert(spec.hid, (spec, alloc));
        debug!(
            "buffer header {} defined: bid {} x{} {:?}",
            spec.hid,
            spec.bid,
            spec.queue_size.count(),
            spec.queue_mode
        );
        self.read_header(mem, spec.hid)
    }

    fn apply_modes(ctrl: &mut HeaderControl, spec: &HeaderSpec) {
        ctrl.set_queue_size(spec.queue_size.raw());
        ctrl.set_queue_mode(spec.queue_mode as u8);
        ctrl.set_store_keep(spec.store_mode == BufferStoreMode::KeepCurrent);
        ctrl.set_status_mode(spec.status_mode as u8);
    }

    fn entry(&self, hid: u16) -> Result<&(HeaderSpec, Allocation)> {
        self.headers.get(&hid).ok_or(BiuError::UndefinedHeader(hid))
    }

    /// Address of a defined header
    pub fn header_addr(&self, hid: u16) -> Result<u32> {
        self.entry(hid)?;
        Ok(self.layout.header_addr(hid))
    }

    /// Whether a header id is defined
    pub fn contains(&self, hid: u16) -> bool {
        self.headers.contains_key(&hid)
    }

    /// Definition parameters of a header
    pub fn spec(&self, hid: u16) -> Result<HeaderSpec> {
        Ok(self.entry(hid)?.0)
    }

    fn control<M: DeviceMemory + ?Sized>(&self, mem: &M, hid: u16) -> Result<HeaderControl> {
        Ok(HeaderControl(mem.read_u32(self.header_addr(hid)?)?))
    }

    fn set_control<M: DeviceMemory + ?Sized>(
        &self,
        mem: &mut M,
        hid: u16,
        ctrl: HeaderControl,
    ) -> Result<()> {
        mem.write_u32(self.layout.header_addr(hid), ctrl.0)
    }

    /// Current addresses and buffer count of a header
    pub fn read_header<M: DeviceMemory + ?Sized>(&self, mem: &M, hid: u16) -> Result<HeaderInfo> {
        let (spec, alloc) = *self.entry(hid)?;
        let ctrl = self.control(mem, hid)?;
        Ok(HeaderInfo {
            hid,
            bid: spec.bid,
            header_addr: self.layout.header_addr(hid),
            sq_addr: alloc.sq_addr,
            eq_addr: alloc.eq_addr,
            buffer_addr: self.layout.buffer_addr(spec.bid),
            buffer_count: spec.queue_size.count(),
            current_index: ctrl.buffer_index() as u32,
        })
    }

    /// Resize or change the traversal mode of a live header
    ///
    /// The current index is kept modulo the new size.
    pub fn modify<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        hid: u16,
        queue_size: QueueSize,
        queue_mode: BufferQueueMode,
    ) -> Result<HeaderInfo> {
        let (mut spec, alloc) = *self.entry(hid)?;
        if spec.bid as u32 + queue_size.count() - 1 > self.max_bid() {
            return Err(BiuError::param(3, "qsize", queue_size.raw()));
        }
        spec.queue_size = queue_size;
        spec.queue_mode = queue_mode;
        let entries = Self::queue_entries(&spec);
        let moved = alloc.capacity < entries;
        let old_entries = alloc.entries;
        let alloc = self.reallocate(Some(alloc), entries)?;
        if moved {
            Self::clear_queues(mem, &alloc, 0)?;
            mem.write_u32(self.layout.header_addr(hid) + 4, alloc.sq_addr)?;
            mem.write_u32(self.layout.header_addr(hid) + 8, alloc.eq_addr)?;
        } else if entries < old_entries {
            // slots past the new depth are no longer part of the ring
            Self::clear_queues(mem, &alloc, entries)?;
        }
        let mut ctrl = self.control(mem, hid)?;
        let index = ctrl.buffer_index() as u32 % queue_size.count();
        let queue_index = ctrl.queue_index() as u32 % entries;
        Self::apply_modes(&mut ctrl, &spec);
        ctrl.set_buffer_index(index as u8);
        ctrl.set_queue_index(queue_index as u8);
        self.set_control(mem, hid, ctrl)?;
        self.headers.insert(hid, (spec, alloc));
        debug!("buffer header {} resized to {}", hid, queue_size.count());
        self.read_header(mem, hid)
    }

    /// Index and address of the buffer the engine uses next
    pub fn active_buffer<M: DeviceMemory + ?Sized>(&self, mem: &M, hid: u16) -> Result<(u8, u32)> {
        let (spec, _) = *self.entry(hid)?;
        let index = self.control(mem, hid)?.buffer_index();
        let bid = spec.bid + index as u16;
        Ok((index, self.layout.buffer_addr(bid)))
    }

    /// Move the buffer index after a transfer, honouring queue and store modes
    pub fn advance<M: DeviceMemory + ?Sized>(&self, mem: &mut M, hid: u16, error: bool) -> Result<u8> {
        let (spec, _) = *self.entry(hid)?;
        let mut ctrl = self.control(mem, hid)?;
        let index = ctrl.buffer_index() as u32;
        let count = spec.queue_size.count();
        let next = if error && spec.store_mode == BufferStoreMode::Discard {
            index
        } else {
            match spec.queue_mode {
                BufferQueueMode::Cyclic => (index + 1) % count,
                BufferQueueMode::StayLast => (index + 1).min(count - 1),
                BufferQueueMode::HostControlled => index,
            }
        };
        ctrl.set_buffer_index(next as u8);
        self.set_control(mem, hid, ctrl)?;
        Ok(next as u8)
    }

    /// Point the ring at a specific buffer (host-controlled mode)
    pub fn set_index<M: DeviceMemory + ?Sized>(&self, mem: &mut M, hid: u16, index: u8) -> Result<()> {
        let (spec, _) = *self.entry(hid)?;
        if index as u32 >= spec.queue_size.count() {
            return Err(BiuError::param(2, "index", index));
        }
        let mut ctrl = self.control(mem, hid)?;
        ctrl.set_buffer_index(index);
        self.set_control(mem, hid, ctrl)
    }

    /// Write 16-bit data words into a buffer
    pub fn write_buffer<M: DeviceMemory + ?Sized>(&self, mem: &mut M, bid: u16, words: &[u16]) -> Result<()> {
        if bid as u32 > self.max_bid() {
            return Err(BiuError::param(1, "bid", bid));
        }
        if words.len() > 32 {
            return Err(BiuError::param(2, "count", words.len() as u32));
        }
        let addr = self.layout.buffer_addr(bid);
        for (i, word) in words.iter().enumerate() {
            mem.write_u16(addr + 2 * i as u32, *word)?;
        }
        Ok(())
    }

    /// Read `count` 16-bit data words from a buffer
    pub fn read_buffer<M: DeviceMemory + ?Sized>(&self, mem: &M, bid: u16, count: usize) -> Result<Vec<u16>> {
        if bid as u32 > self.max_bid() {
            return Err(BiuError::param(1, "bid", bid));
        }
        let addr = self.layout.buffer_addr(bid);
        (0..count.min(32))
            .map(|i| mem.read_u16(addr + 2 * i as u32))
            .collect()
    }

    /// Append a status entry; an unread slot being overwritten sets the sticky overflow flag
    pub fn push_status<M: DeviceMemory + ?Sized>(
        &self,
        mem: &mut M,
        hid: u16,
        entry: &StatusEntry,
    ) -> Result<()> {
        let (_, alloc) = *self.entry(hid)?;
        let mut ctrl = self.control(mem, hid)?;
        let slot = ctrl.queue_index() as u32 % alloc.entries;
        let addr = alloc.sq_addr + slot * QUEUE_ENTRY_BYTES;
        if QueueControl(mem.read_u32(addr)?).valid() && alloc.entries > 1 {
            if !ctrl.status_overflow() {
                warn!("status queue of header {} overflowed", hid);
            }
            ctrl.set_status_overflow(true);
        }
        mem.write_block(addr, &entry.to_words())?;
        ctrl.set_queue_index(((slot + 1) % alloc.entries) as u8);
        self.set_control(mem, hid, ctrl)
    }

    /// Read status entries oldest-first, optionally clearing them
    pub fn read_status_queue<M: DeviceMemory + ?Sized>(
        &self,
        mem: &mut M,
        hid: u16,
        clear: bool,
    ) -> Result<Vec<StatusEntry>> {
        let (_, alloc) = *self.entry(hid)?;
        let start = self.control(mem, hid)?.queue_index() as u32;
        let mut out = Vec::new();
        for i in 0..alloc.entries {
            let addr = alloc.sq_addr + ((start + i) % alloc.entries) * QUEUE_ENTRY_BYTES;
            let mut words = [0u32; 4];
            mem.read_block(addr, &mut words)?;
            if QueueControl(words[0]).valid() {
                out.push(StatusEntry::from_words(words));
                if clear {
                    mem.write_u32(addr, 0)?;
                }
            }
        }
        Ok(out)
    }

    /// Whether the status queue of a header has overflowed since last cleared
    pub fn status_overflow<M: DeviceMemory + ?Sized>(&self, mem: &M, hid: u16) -> Result<bool> {
        Ok(self.control(mem, hid)?.status_overflow())
    }

    /// Clear the sticky overflow flags
    pub fn clear_overflow<M: DeviceMemory + ?Sized>(&self, mem: &mut M, hid: u16) -> Result<()> {
        let mut ctrl = self.control(mem, hid)?;
        ctrl.set_status_overflow(false);
        ctrl.set_event_overflow(false);
        self.set_control(mem, hid, ctrl)
    }

    /// Append an interrupt event (kind, source id, time tag) to the event queue
    pub fn push_event<M: DeviceMemory + ?Sized>(
        &self,
        mem: &mut M,
        hid: u16,
        kind: u8,
        source: u16,
        time_tag: u32,
    ) -> Result<()> {
        let (_, alloc) = *self.entry(hid)?;
        let mut ctrl = self.control(mem, hid)?;
        // events share the status queue slot index
        let slot = ctrl.queue_index() as u32 % alloc.entries;
        let addr = alloc.eq_addr + slot * QUEUE_ENTRY_BYTES;
        if mem.read_u32(addr)? & 0x8000_0000 != 0 && alloc.entries > 1 {
            ctrl.set_event_overflow(true);
            self.set_control(mem, hid, ctrl)?;
        }
        mem.write_block(
            addr,
            &[0x8000_0000 | ((kind as u32) << 16) | source as u32, hid as u32, time_tag, 0],
        )
    }

    /// Read and clear pending events as (kind, source, time tag)
    pub fn read_events<M: DeviceMemory + ?Sized>(&self, mem: &mut M, hid: u16) -> Result<Vec<(u8, u16, u32)>> {
        let (_, alloc) = *self.entry(hid)?;
        let mut out = Vec::new();
        for i in 0..alloc.entries {
            let addr = alloc.eq_addr + i * QUEUE_ENTRY_BYTES;
            let head = mem.read_u32(addr)?;
            if head & 0x8000_0000 != 0 {
                out.push(((head >> 16) as u8 & 0x7F, head as u16, mem.read_u32(addr + 8)?));
                mem.write_u32(addr, 0)?;
            }
        }
        Ok(out)
    }
}
