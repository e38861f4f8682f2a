//! Bus monitor capture model
//!
//! The monitor records every message on the bus into a ring of 32-bit
//! entries in device memory. Each entry carries a type tag in bits 31..28:
//!
//! | tag    | entry                                   |
//! |--------|-----------------------------------------|
//! | 0      | not updated                             |
//! | 1      | error word (flags in 15..0)             |
//! | 2      | time tag low (seconds, microseconds)    |
//! | 3      | time tag high (days, hours, minutes)    |
//! | 8..11  | command, command 2, data, status; bus A |
//! | 12..15 | command, command 2, data, status; bus B |
//!
//! Bus word entries hold the gap before the word in 24..16, an error
//! condition bit in 27 and the raw word in 15..0.

use bitfield::bitfield;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::MemoryLayout;
use crate::core::{Bus, Direction};
use crate::error::{BiuError, Result};
use crate::memory::DeviceMemory;
use crate::timetag::TimeTag;
use crate::word::CommandWord;

/// Error flags recorded in error entries and status queues
pub mod flags {
    /// Any error
    pub const ERR: u16 = 0x8000;
    /// Response on the alternate bus
    pub const ALTER: u16 = 0x4000;
    /// Word count low
    pub const LCNT: u16 = 0x2000;
    /// Word count high
    pub const HCNT: u16 = 0x1000;
    /// Status word exception
    pub const STAT: u16 = 0x0800;
    /// Terminal address error
    pub const TADDR: u16 = 0x0400;
    /// Early response or gap error
    pub const GAP: u16 = 0x0200;
    /// Illegal command word
    pub const ILLEGAL: u16 = 0x0100;
    /// Transmission error
    pub const TX: u16 = 0x0080;
    /// Inter-word gap
    pub const IWGAP: u16 = 0x0040;
    /// Inverted sync
    pub const ISYNC: u16 = 0x0020;
    /// Parity
    pub const PARITY: u16 = 0x0010;
    /// Low bit count
    pub const LBIT: u16 = 0x0008;
    /// High bit count
    pub const HBIT: u16 = 0x0004;
    /// Manchester coding
    pub const MANCH: u16 = 0x0002;
    /// No response
    pub const NRESP: u16 = 0x0001;
}

/// Entry type tags
pub mod tag {
    /// Entry never written
    pub const NOT_UPDATED: u8 = 0;
    /// Error word
    pub const ERROR: u8 = 1;
    /// Time tag low
    pub const TIME_LOW: u8 = 2;
    /// Time tag high
    pub const TIME_HIGH: u8 = 3;
    /// First bus word tag (command, bus A)
    pub const WORD_BASE: u8 = 8;
}

bitfield! {
    /// A bus word entry
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct MonitorWord(u32);
    impl Debug;
    pub u8, entry_type, set_entry_type: 31, 28;
    pub error_condition, set_error_condition: 27;
    pub u16, gap, set_gap: 24, 16;
    pub u16, value, set_value: 15, 0;
}

/// Kind of a bus word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WordKind {
    /// Command word
    Command = 0,
    /// Second (transmit) command word of an RT-to-RT transfer
    Command2 = 1,
    /// Data word
    Data = 2,
    /// Status word
    Status = 3,
}

impl WordKind {
    fn from_index(index: u8) -> Self {
        match index & 3 {
            0 => WordKind::Command,
            1 => WordKind::Command2,
            2 => WordKind::Data,
            _ => WordKind::Status,
        }
    }
}

/// One word as it crossed the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusWord {
    /// Kind
    pub kind: WordKind,
    /// Raw 16-bit value
    pub value: u16,
    /// Gap before the word, 0.25 µs units
    pub gap: u16,
    /// Error flags detected on this word (0 = clean)
    pub error: u16,
}

impl BusWord {
    /// A clean word with no gap
    pub fn new(kind: WordKind, value: u16) -> Self {
        BusWord {
            kind,
            value,
            gap: 0,
            error: 0,
        }
    }
}

/// Something the monitor sees during a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// A word
    Word(BusWord),
    /// An error condition not tied to a received word (e.g. no response)
    Error(u16),
}

/// A complete message as observed on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Bus carrying the message
    pub bus: Bus,
    /// Start time in engine ticks
    pub start_ticks: u64,
    /// Observed words and errors in bus order
    pub events: Vec<BusEvent>,
    /// Terminal endpoints (RT, subaddress, direction)
    pub endpoints: Vec<(u8, u8, Direction)>,
}

impl BusMessage {
    /// Union of all error flags in the message
    pub fn error_flags(&self) -> u16 {
        self.events.iter().fold(0, |acc, e| match e {
            BusEvent::Word(w) => acc | w.error,
            BusEvent::Error(f) => acc | f,
        })
    }

    fn first_command(&self) -> Option<CommandWord> {
        self.events.iter().find_map(|e| match e {
            BusEvent::Word(w) if w.kind == WordKind::Command => Some(CommandWord(w.value)),
            _ => None,
        })
    }

    fn data_words(&self) -> impl Iterator<Item = u16> + '_ {
        self.events.iter().filter_map(|e| match e {
            BusEvent::Word(w) if w.kind == WordKind::Data => Some(w.value),
            _ => None,
        })
    }
}

/// Decoded monitor entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MonitorRecord {
    /// Entry never written
    NotUpdated,
    /// Error word
    Error {
        /// Error flags
        flags: u16,
    },
    /// Time tag low word
    TimeTagLow {
        /// Seconds
        seconds: u8,
        /// Microseconds
        micros: u32,
    },
    /// Time tag high word
    TimeTagHigh {
        /// Day of year
        days: u16,
        /// Hours
        hours: u8,
        /// Minutes
        minutes: u8,
    },
    /// A bus word
    Word {
        /// Word kind
        kind: WordKind,
        /// Bus
        bus: Bus,
        /// Gap before the word
        gap: u16,
        /// Error condition flag
        error: bool,
        /// Raw word
        value: u16,
    },
    /// A tag this model never writes
    Unknown(u32),
}

impl MonitorRecord {
    /// Decode a raw ring entry
    pub fn decode(raw: u32) -> Self {
        let word = MonitorWord(raw);
        match word.entry_type() {
            tag::NOT_UPDATED => MonitorRecord::NotUpdated,
            tag::ERROR => MonitorRecord::Error {
                flags: word.value(),
            },
            tag::TIME_LOW => {
                let t = TimeTag::from_words(0, raw);
                MonitorRecord::TimeTagLow {
                    seconds: t.seconds,
                    micros: t.micros,
                }
            }
            tag::TIME_HIGH => {
                let t = TimeTag::from_words(raw, 0);
                MonitorRecord::TimeTagHigh {
                    days: t.days,
                    hours: t.hours,
                    minutes: t.minutes,
                }
            }
            t @ 8..=15 => MonitorRecord::Word {
                kind: WordKind::from_index(t - tag::WORD_BASE),
                bus: if t >= 12 { Bus::BusB } else { Bus::BusA },
                gap: word.gap(),
                error: word.error_condition(),
                value: word.value(),
            },
            _ => MonitorRecord::Unknown(raw),
        }
    }

    /// Encode a bus word entry
    pub fn word_entry(bus: Bus, word: &BusWord) -> u32 {
        let mut entry = MonitorWord(0);
        entry.set_entry_type(tag::WORD_BASE + 4 * bus.as_bit() + word.kind as u8);
        entry.set_error_condition(word.error != 0);
        entry.set_gap(word.gap.min(0x1FF));
        entry.set_value(word.value);
        entry.0
    }

    /// Encode an error entry
    pub fn error_entry(flags: u16) -> u32 {
        ((tag::ERROR as u32) << 28) | flags as u32
    }
}

/// What the monitor records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CaptureMode {
    /// Record everything between start and stop triggers
    #[default]
    All = 0,
    /// Record a fixed number of entries after the start trigger
    Only = 1,
    /// Record continuously; the stop trigger is ignored
    Recording = 2,
    /// Record only messages enabled in the filter table
    Filtered = 3,
}

impl CaptureMode {
    /// Decode the capture mode
    pub fn from_raw(value: u8) -> Result<Self> {
        Ok(match value {
            0 => CaptureMode::All,
            1 => CaptureMode::Only,
            2 => CaptureMode::Recording,
            3 => CaptureMode::Filtered,
            _ => return Err(BiuError::param(1, "cap_mode", value)),
        })
    }
}

/// Condition that starts or stops capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Trigger {
    /// Fires as soon as the monitor starts
    #[default]
    Immediate,
    /// A message carries any of the masked error flags
    ErrorCondition {
        /// Error flag mask
        mask: u16,
    },
    /// The external trigger input
    External,
    /// A command word matching value under mask
    ReceivedWord {
        /// Expected bits
        value: u16,
        /// Bits compared
        mask: u16,
    },
    /// A data word at a position of a given command inside a range
    DataValue {
        /// Command word bits (RT, T/R, SA) to match; word count ignored
        command: u16,
        /// Data word position (1-based)
        word_pos: u8,
        /// Lower bound
        min: u16,
        /// Upper bound
        max: u16,
    },
    /// A hardware event line
    HardwareEvent,
}

/// External signals that can fire a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    /// External trigger input
    External,
    /// Hardware event line
    HardwareEvent,
}

/// Monitor initialisation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorConfig {
    /// Capture mode
    pub capture_mode: CaptureMode,
    /// Start trigger
    pub start_trigger: Trigger,
    /// Stop trigger (ignored in recording mode)
    pub stop_trigger: Option<Trigger>,
    /// Entries kept from before the start trigger
    pub pre_trigger_entries: u32,
    /// Entries captured after the start trigger in `Only` mode
    pub capture_entries: u32,
}

/// Monitor run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MonitorState {
    /// Not running
    #[default]
    Halted,
    /// Running, waiting for the start trigger
    Armed,
    /// Recording
    Capturing,
    /// Stop condition reached
    Stopped,
}

/// Ring positions, as entry offsets from the ring base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackPointers {
    /// Run state
    pub state: MonitorState,
    /// The write pointer lapped the start pointer while capturing
    pub overflow: bool,
    /// First retained entry
    pub start: u32,
    /// Next entry to be written
    pub current: u32,
    /// Entry where the start trigger fired
    pub trigger: u32,
}

/// Where `read_record` starts counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordSelector {
    /// Forward from the start pointer
    Start(u32),
    /// Either direction from the trigger pointer
    Trigger(i32),
    /// Backwards from the write pointer (1 = newest)
    End(u32),
    /// Absolute ring offset
    Absolute(u32),
}

impl RecordSelector {
    /// Decode (selector code, signed offset)
    pub fn from_raw(code: u8, offset: i32) -> Result<Self> {
        match code {
            0 if offset >= 0 => Ok(RecordSelector::Start(offset as u32)),
            1 => Ok(RecordSelector::Trigger(offset)),
            2 if offset <= 0 => Ok(RecordSelector::End(offset.unsigned_abs())),
            3 if offset >= 0 => Ok(RecordSelector::Absolute(offset as u32)),
            0 | 2 | 3 => Err(BiuError::param(2, "offset", offset as u32)),
            _ => Err(BiuError::param(1, "entry_type", code)),
        }
    }
}

/// Per-endpoint activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Activity {
    /// Messages seen
    pub msg_count: u32,
    /// Messages with errors
    pub err_count: u32,
    /// Error flags of the last erroneous message
    pub last_error: u16,
}

/// Totals over all traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorTotals {
    /// Messages seen
    pub msg_count: u32,
    /// Messages with errors
    pub err_count: u32,
}

/// The bus monitor
#[derive(Debug, Clone)]
pub struct BusMonitor {
    base: u32,
    capacity: u32,
    config: MonitorConfig,
    state: MonitorState,
    overflow: bool,
    start: u32,
    current: u32,
    trigger: u32,
    written: u64,
    since_trigger: u64,
    activity: BTreeMap<(u8, u8, Direction), Activity>,
    filter: BTreeSet<(u8, u8, Direction)>,
    totals: MonitorTotals,
    pending_signal: Option<MonitorSignal>,
}

impl BusMonitor {
    /// Create a halted monitor over the ring region
    pub fn new(layout: &MemoryLayout) -> Self {
        BusMonitor::new_raw(layout.bm_base, layout.bm_size / 4)
    }

    /// Reset the ring, pointers and activity counters with a new configuration
    pub fn initialize<M: DeviceMemory + ?Sized>(&mut self, mem: &mut M, config: MonitorConfig) -> Result<()> {
        if config.pre_trigger_entries >= self.capacity {
            return Err(BiuError::param(4, "pre_trigger", config.pre_trigger_entries));
        }
        if config.capture_mode == CaptureMode::Only && config.capture_entries == 0 {
            return Err(BiuError::param(5, "capture_entries", 0u32));
        }
        mem.fill(self.base, self.capacity, 0)?;
        *self = BusMonitor {
            config,
            filter: std::mem::take(&mut self.filter),
            ..BusMonitor::new_raw(self.base, self.capacity)
        };
        debug!("bus monitor initialised: {:?}", config.capture_mode);
        Ok(())
    }

    fn new_raw(base: u32, capacity: u32) -> Self {
        BusMonitor {
            base,
            capacity,
            config: MonitorConfig::default(),
            state: MonitorState::Halted,
            overflow: false,
            start: 0,
            current: 0,
            trigger: 0,
            written: 0,
            since_trigger: 0,
            activity: BTreeMap::new(),
            filter: BTreeSet::new(),
            totals: MonitorTotals::default(),
            pending_signal: None,
        }
    }

    /// Start monitoring
    pub fn start(&mut self) {
        self.state = if self.config.start_trigger == Trigger::Immediate {
            self.trigger = self.current;
            self.start = self.current;
            MonitorState::Capturing
        } else {
            MonitorState::Armed
        };
        info!("bus monitor started ({:?})", self.state);
    }

    /// Stop monitoring; the ring and counters are kept
    pub fn halt(&mut self) {
        self.state = MonitorState::Halted;
        info!("bus monitor halted");
    }

    /// Current run state
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Whether the monitor is observing traffic
    pub fn is_running(&self) -> bool {
        !matches!(self.state, MonitorState::Halted)
    }

    /// Enable or disable one endpoint in the filter table
    pub fn set_filter(&mut self, rt: u8, sa: u8, direction: Direction, enabled: bool) -> Result<()> {
        if rt > 31 {
            return Err(BiuError::param(1, "rt", rt));
        }
        if sa > 31 {
            return Err(BiuError::param(2, "sa", sa));
        }
        if enabled {
            self.filter.insert((rt, sa, direction));
        } else {
            self.filter.remove(&(rt, sa, direction));
        }
        Ok(())
    }

    /// Raise an external signal; it is evaluated against the triggers immediately
    pub fn signal(&mut self, signal: MonitorSignal) {
        self.pending_signal = Some(signal);
        self.evaluate_signal();
    }

    fn evaluate_signal(&mut self) {
        let Some(signal) = self.pending_signal.take() else {
            return;
        };
        let fires = |t: &Trigger| {
            matches!(
                (t, signal),
                (Trigger::External, MonitorSignal::External)
                    | (Trigger::HardwareEvent, MonitorSignal::HardwareEvent)
            )
        };
        match self.state {
            MonitorState::Armed if fires(&self.config.start_trigger) => self.fire_start(),
            MonitorState::Capturing
                if self.config.capture_mode != CaptureMode::Recording
                    && self.config.stop_trigger.as_ref().is_some_and(|t| fires(t)) =>
            {
                self.state = MonitorState::Stopped;
                info!("bus monitor stopped by {:?}", signal);
            }
            _ => {}
        }
    }

    fn fire_start(&mut self) {
        self.trigger = self.current;
        let back = (self.config.pre_trigger_entries as u64).min(self.written) as u32;
        self.start = (self.current + self.capacity - back) % self.capacity;
        self.since_trigger = 0;
        self.state = MonitorState::Capturing;
        info!("bus monitor triggered at entry {}", self.trigger);
    }

    fn trigger_matches(trigger: &Trigger, msg: &BusMessage) -> bool {
        match *trigger {
            Trigger::Immediate => true,
            Trigger::ErrorCondition { mask } => msg.error_flags() & mask != 0,
            Trigger::External | Trigger::HardwareEvent => false,
            Trigger::ReceivedWord { value, mask } => msg.events.iter().any(|e| {
                matches!(e, BusEvent::Word(w) if matches!(w.kind, WordKind::Command | WordKind::Command2)
                    && w.value & mask == value & mask)
            }),
            Trigger::DataValue {
                command,
                word_pos,
                min,
                max,
            } => {
                let Some(cw) = msg.first_command() else {
                    return false;
                };
                if cw.raw() & 0xFFE0 != command & 0xFFE0 || word_pos == 0 {
                    return false;
                }
                msg.data_words()
                    .nth(word_pos as usize - 1)
                    .is_some_and(|v| (min..=max).contains(&v))
            }
        }
    }

    fn passes_filter(&self, msg: &BusMessage) -> bool {
        self.config.capture_mode != CaptureMode::Filtered
            || msg.endpoints.iter().any(|ep| self.filter.contains(ep))
    }

    fn write_entry<M: DeviceMemory + ?Sized>(&mut self, mem: &mut M, entry: u32) -> Result<()> {
        mem.write_u32(self.base + 4 * self.current, entry)?;
        self.current = (self.current + 1) % self.capacity;
        self.written += 1;
        if self.state == MonitorState::Capturing {
            self.since_trigger += 1;
            if self.current == self.start {
                // the ring now holds only the newest `capacity` entries
                if !self.overflow {
                    warn!("bus monitor ring overflow");
                }
                self.overflow = true;
                self.start = (self.start + 1) % self.capacity;
            }
        } else if self.written > self.config.pre_trigger_entries as u64 {
            self.start = (self.current + self.capacity - self.config.pre_trigger_entries) % self.capacity;
        }
        Ok(())
    }

    /// Record one message and update activity counters
    pub fn observe<M: DeviceMemory + ?Sized>(&mut self, mem: &mut M, msg: &BusMessage) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let errors = msg.error_flags();
        self.totals.msg_count += 1;
        if errors != 0 {
            self.totals.err_count += 1;
        }
        for endpoint in &msg.endpoints {
            let act = self.activity.entry(*endpoint).or_default();
            act.msg_count += 1;
            if errors != 0 {
                act.err_count += 1;
                act.last_error = errors;
            }
        }

        if self.state == MonitorState::Armed && Self::trigger_matches(&self.config.start_trigger, msg) {
            self.fire_start();
        }
        let record = match self.state {
            MonitorState::Armed => self.config.pre_trigger_entries > 0,
            MonitorState::Capturing => true,
            _ => false,
        };
        if record && self.passes_filter(msg) {
            let tt = TimeTag::from_ticks(msg.start_ticks);
            self.write_entry(mem, tt.high_word(tag::TIME_HIGH))?;
            self.write_entry(mem, tt.low_word(tag::TIME_LOW))?;
            for event in &msg.events {
                match event {
                    BusEvent::Word(w) => {
                        self.write_entry(mem, MonitorRecord::word_entry(msg.bus, w))?;
                        if w.error != 0 {
                            self.write_entry(mem, MonitorRecord::error_entry(w.error | flags::ERR))?;
                        }
                    }
                    BusEvent::Error(f) => {
                        self.write_entry(mem, MonitorRecord::error_entry(*f | flags::ERR))?;
                    }
                }
            }
        }

        if self.state == MonitorState::Capturing {
            let stop = match self.config.capture_mode {
                CaptureMode::Recording => false,
                CaptureMode::Only => self.since_trigger >= self.config.capture_entries as u64,
                _ => self
                    .config
                    .stop_trigger
                    .as_ref()
                    .is_some_and(|t| *t != Trigger::Immediate && Self::trigger_matches(t, msg)),
            };
            if stop {
                self.state = MonitorState::Stopped;
                info!("bus monitor stopped after {} entries", self.since_trigger);
            }
        }
        Ok(())
    }

    /// Activity of one endpoint
    pub fn read_activity(&self, rt: u8, sa: u8, direction: Direction) -> Result<Activity> {
        if rt > 31 {
            return Err(BiuError::param(1, "rt", rt));
        }
        if sa > 31 {
            return Err(BiuError::param(2, "sa", sa));
        }
        Ok(self.activity.get(&(rt, sa, direction)).copied().unwrap_or_default())
    }

    /// Totals over all observed messages
    pub fn totals(&self) -> MonitorTotals {
        self.totals
    }

    /// Ring pointers and status
    pub fn read_stack_pointer(&self) -> StackPointers {
        StackPointers {
            state: self.state,
            overflow: self.overflow,
            start: self.start,
            current: self.current,
            trigger: self.trigger,
        }
    }

    fn resolve(&self, selector: RecordSelector) -> u32 {
        let cap = self.capacity as i64;
        let index = match selector {
            RecordSelector::Start(n) => self.start as i64 + n as i64,
            RecordSelector::Trigger(n) => self.trigger as i64 + n as i64,
            RecordSelector::End(n) => self.current as i64 - n as i64,
            RecordSelector::Absolute(n) => n as i64,
        };
        index.rem_euclid(cap) as u32
    }

    /// Raw entry at a selected ring position
    pub fn read_raw<M: DeviceMemory + ?Sized>(&self, mem: &M, selector: RecordSelector) -> Result<u32> {
        mem.read_u32(self.base + 4 * self.resolve(selector))
    }

    /// Decoded entry at a selected ring position
    pub fn read_record<M: DeviceMemory + ?Sized>(&self, mem: &M, selector: RecordSelector) -> Result<MonitorRecord> {
        Ok(MonitorRecord::decode(self.read_raw(mem, selector)?))
    }

    /// Number of retained entries between start and write pointer
    pub fn retained(&self) -> u32 {
        if self.overflow {
            self.capacity - 1
        } else {
            (self.current + self.capacity - self.start) % self.capacity
        }
    }

    /// All retained raw entries, oldest first
    pub fn entries<M: DeviceMemory + ?Sized>(&self, mem: &M) -> Result<Vec<u32>> {
        (0..self.retained())
            .map(|i| self.read_raw(mem, RecordSelector::Start(i)))
            .collect()
    }

    /// Offset (from start) of the first retained entry with `entry & mask == value`
    pub fn find_entry<M: DeviceMemory + ?Sized>(&self, mem: &M, mask: u32, value: u32) -> Result<Option<u32>> {
        for i in 0..self.retained() {
            if self.read_raw(mem, RecordSelector::Start(i))? & mask == value & mask {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiuConfig;
    use crate::memory::SimMemory;

    fn setup(bytes: u32) -> (SimMemory, BusMonitor) {
        let config = BiuConfig {
            monitor_buffer_bytes: bytes,
            ..BiuConfig::default()
        };
        let layout = config.layout();
        (SimMemory::new(layout.total), BusMonitor::new(&layout))
    }

    fn message(cw: u16, data: &[u16], errors: u16) -> BusMessage {
        let mut events = vec![BusEvent::Word(BusWord::new(WordKind::Command, cw))];
        events.extend(data.iter().map(|d| BusEvent::Word(BusWord::new(WordKind::Data, *d))));
        if errors != 0 {
            events.push(BusEvent::Error(errors));
        } else {
            events.push(BusEvent::Word(BusWord::new(WordKind::Status, cw & 0xF800)));
        }
        BusMessage {
            bus: Bus::BusA,
            start_ticks: 400,
            events,
            endpoints: vec![(((cw >> 11) & 0x1F) as u8, ((cw >> 5) & 0x1F) as u8, Direction::Receive)],
        }
    }

    #[test]
    fn test_record_layout() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(&mut mem, MonitorConfig::default())?;
        bm.start();
        bm.observe(&mut mem, &message(0x0822, &[0xAAAA, 0x5555], 0))?;
        let raw = bm.entries(&mem)?;
        assert_eq!(raw.len(), 6);
        assert_eq!(raw[0] >> 28, 3);
        assert_eq!(raw[1], 0x2000_0000 | 100);
        assert_eq!(raw[2], 0x8000_0822);
        assert_eq!(raw[3], 0xA000_AAAA);
        assert_eq!(raw[5], 0xB000_0800);
        Ok(())
    }

    #[test]
    fn test_timeout_entries() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(&mut mem, MonitorConfig::default())?;
        bm.start();
        bm.observe(&mut mem, &message(0x0C21, &[], flags::NRESP))?;
        assert_eq!(bm.read_raw(&mem, RecordSelector::Start(2))?, 0x8000_0C21);
        assert_eq!(
            bm.read_record(&mem, RecordSelector::Start(3))?,
            MonitorRecord::Error { flags: 0x8001 }
        );
        assert_eq!(bm.totals().err_count, 1);
        assert_eq!(bm.read_activity(1, 1, Direction::Receive)?.last_error, flags::NRESP);
        Ok(())
    }

    #[test]
    fn test_word_error_sets_condition_bit() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(&mut mem, MonitorConfig::default())?;
        bm.start();
        let mut msg = message(0x0821, &[0x1234], 0);
        msg.events[1] = BusEvent::Word(BusWord {
            error: flags::PARITY,
            ..BusWord::new(WordKind::Data, 0x1234)
        });
        bm.observe(&mut mem, &msg)?;
        assert_eq!(bm.read_raw(&mem, RecordSelector::Start(3))?, 0xA800_1234);
        assert_eq!(bm.read_raw(&mem, RecordSelector::Start(4))?, 0x1000_8010);
        Ok(())
    }

    #[test]
    fn test_pre_trigger_and_trigger_pointer() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(
            &mut mem,
            MonitorConfig {
                start_trigger: Trigger::ErrorCondition { mask: flags::NRESP },
                pre_trigger_entries: 4,
                ..MonitorConfig::default()
            },
        )?;
        bm.start();
        assert_eq!(bm.state(), MonitorState::Armed);
        for _ in 0..3 {
            bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        }
        bm.observe(&mut mem, &message(0x0821, &[], flags::NRESP))?;
        let sp = bm.read_stack_pointer();
        assert_eq!(sp.state, MonitorState::Capturing);
        assert_eq!(sp.trigger, 15);
        assert_eq!(sp.start, 11);
        assert_eq!(sp.current, 19);
        assert_eq!(bm.read_record(&mem, RecordSelector::Trigger(2))?, MonitorRecord::Word {
            kind: WordKind::Command,
            bus: Bus::BusA,
            gap: 0,
            error: false,
            value: 0x0821,
        });
        assert_eq!(bm.read_raw(&mem, RecordSelector::End(1))?, 0x1000_8001);
        Ok(())
    }

    #[test]
    fn test_ring_overflow_is_flagged() -> Result<()> {
        let (mut mem, mut bm) = setup(64);
        bm.initialize(&mut mem, MonitorConfig::default())?;
        bm.start();
        for _ in 0..4 {
            bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        }
        let sp = bm.read_stack_pointer();
        assert!(sp.overflow);
        assert_eq!(bm.retained(), 15);
        assert_eq!(bm.read_raw(&mem, RecordSelector::End(1))?, 0xB000_0800);
        Ok(())
    }

    #[test]
    fn test_only_mode_stops_after_count() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(
            &mut mem,
            MonitorConfig {
                capture_mode: CaptureMode::Only,
                capture_entries: 5,
                ..MonitorConfig::default()
            },
        )?;
        bm.start();
        bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        assert_eq!(bm.state(), MonitorState::Stopped);
        assert_eq!(bm.read_stack_pointer().current, 5);
        assert_eq!(bm.totals().msg_count, 2);
        Ok(())
    }

    #[test]
    fn test_filtered_mode() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(
            &mut mem,
            MonitorConfig {
                capture_mode: CaptureMode::Filtered,
                ..MonitorConfig::default()
            },
        )?;
        bm.set_filter(2, 1, Direction::Receive, true)?;
        bm.start();
        bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        assert_eq!(bm.retained(), 0);
        bm.observe(&mut mem, &message(0x1021, &[1], 0))?;
        assert_eq!(bm.retained(), 5);
        assert_eq!(bm.find_entry(&mem, 0xF000_FFFF, 0x8000_1021)?, Some(2));
        Ok(())
    }

    #[test]
    fn test_external_trigger_signal() -> Result<()> {
        let (mut mem, mut bm) = setup(256);
        bm.initialize(
            &mut mem,
            MonitorConfig {
                start_trigger: Trigger::External,
                stop_trigger: Some(Trigger::HardwareEvent),
                ..MonitorConfig::default()
            },
        )?;
        bm.start();
        bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        assert_eq!(bm.retained(), 0);
        bm.signal(MonitorSignal::External);
        bm.observe(&mut mem, &message(0x0821, &[1], 0))?;
        assert_eq!(bm.retained(), 5);
        bm.signal(MonitorSignal::HardwareEvent);
        assert_eq!(bm.state(), MonitorState::Stopped);
        Ok(())
    }

    #[test]
    fn test_selector_codes() {
        assert_eq!(RecordSelector::from_raw(1, -3), Ok(RecordSelector::Trigger(-3)));
        assert_eq!(RecordSelector::from_raw(2, -3), Ok(RecordSelector::End(3)));
        assert!(RecordSelector::from_raw(0, -1).is_err());
        assert!(RecordSelector::from_raw(9, 0).is_err());
    }
}
