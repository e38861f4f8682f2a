//! Transfer descriptor store
//!
//! A transfer is one BC-initiated message: a command (or command pair for
//! RT-to-RT), its data words and the expected status responses. Each defined
//! transfer occupies an eight-word descriptor in device memory at
//! `xfer_base + xid * 32`:
//!
//! | word | contents                                   |
//! |------|--------------------------------------------|
//! | 0    | control flags                              |
//! | 1    | buffer header address                      |
//! | 2    | CW2 (high half), CW1 (low half)            |
//! | 3    | gap (high half), status exception mask     |
//! | 4    | message count                              |
//! | 5    | error count                                |
//! | 6    | error injection spec                       |
//! | 7    | dynamic tag enable (bit 31), transfer id   |

use bitfield::bitfield;
use log::debug;
use std::collections::BTreeMap;

use crate::buffer::BufferManager;
use crate::config::{MemoryLayout, DESCRIPTOR_BYTES};
use crate::core::{Address, Bus, Direction, SubAddress};
use crate::error::{BiuError, Result};
use crate::memory::DeviceMemory;
use crate::word::CommandWord;

/// Descriptor word offsets
pub(crate) mod slot {
    pub const CONTROL: u32 = 0;
    pub const HEADER: u32 = 4;
    pub const COMMANDS: u32 = 8;
    pub const GAP_MASK: u32 = 12;
    pub const MSG_COUNT: u32 = 16;
    pub const ERR_COUNT: u32 = 20;
    pub const ERROR_SPEC: u32 = 24;
    pub const TAG_ID: u32 = 28;
}

macro_rules! raw_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal, $pos:literal { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum $name {
            #[default]
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Parameter position reported when a raw value is rejected
            pub const POSITION: u8 = $pos;

            /// Decode from the raw parameter value
            pub fn from_raw(value: u8) -> Result<Self> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(BiuError::param($pos, $field, value)),
                }
            }

            /// Raw parameter value
            pub fn raw(&self) -> u8 {
                *self as u8
            }
        }
    };
}

raw_enum! {
    /// Direction of data flow of a transfer
    TransferType, "type", 3 {
        /// Bus controller to remote terminal
        BcToRt = 0,
        /// Remote terminal to bus controller
        RtToBc = 1,
        /// Remote terminal to remote terminal
        RtToRt = 2,
    }
}

raw_enum! {
    /// Interrupt generated when the transfer completes
    InterruptControl, "tic", 10 {
        /// No interrupt
        None = 0,
        /// On every completion
        OnEnd = 1,
        /// On transfer error
        OnError = 2,
        /// On status word exception
        OnStatusException = 3,
    }
}

raw_enum! {
    /// Condition that halts the bus controller after this transfer
    HaltControl, "hlt", 11 {
        /// Never halt
        NoHalt = 0,
        /// Halt on transfer error
        OnTransferError = 1,
        /// Halt on status word exception
        OnStatusException = 2,
        /// Halt on either error or exception
        OnErrorOrException = 3,
        /// Halt on any interrupt
        OnAnyInterrupt = 4,
    }
}

raw_enum! {
    /// Service request bit handling
    ServiceRequest, "sxh", 12 {
        /// Ignore the service request bit
        Disabled = 0,
        /// Log service requests
        Enabled = 1,
        /// Acquire a single vector word
        Single = 2,
        /// Acquire vector words repeatedly
        Multiple = 3,
    }
}

raw_enum! {
    /// Expected status word responses
    ResponseControl, "rsp", 13 {
        /// Derived from the transfer type
        Automatic = 0,
        /// First status word is not expected
        NoStatus1 = 1,
        /// Second status word is not expected
        NoStatus2 = 2,
    }
}

raw_enum! {
    /// Meaning of the gap value
    GapMode, "gap_mode", 14 {
        /// Gap is a delay in 0.25 µs units from the previous transfer
        Delay = 0,
        /// Gap is the standard inter-message gap in 0.25 µs units
        Standard = 1,
        /// Gap is a fast-mode count of 0.5 µs steps
        Fast = 2,
    }
}

raw_enum! {
    /// Kind of error injected into the transmitted words
    ErrorKind, "err_type", 15 {
        /// No error
        None = 0,
        /// Command word sync inverted
        CommandSync = 1,
        /// Data word sync inverted
        DataSync = 2,
        /// Parity bit inverted
        Parity = 3,
        /// Manchester stuck high at the bit position
        ManchesterHigh = 4,
        /// Manchester stuck low at the bit position
        ManchesterLow = 5,
        /// Gap inserted before the word
        Gap = 6,
        /// One data word too many
        WordCountHigh = 7,
        /// One data word too few
        WordCountLow = 8,
        /// Word extended by extra bits
        BitCountHigh = 9,
        /// Word truncated by missing bits
        BitCountLow = 10,
        /// Message moved to the alternate bus
        AlternateBus = 11,
        /// Zero crossing shifted negative
        ZeroCrossNegative = 12,
        /// Zero crossing shifted positive
        ZeroCrossPositive = 13,
        /// High-speed subaddress error
        HighSpeedSubaddress = 14,
        /// Bus switch error
        BusSwitch = 15,
    }
}

impl ErrorKind {
    /// Kinds that are located by a bit position
    pub fn needs_bit_position(&self) -> bool {
        matches!(
            self,
            ErrorKind::ManchesterHigh
                | ErrorKind::ManchesterLow
                | ErrorKind::ZeroCrossNegative
                | ErrorKind::ZeroCrossPositive
        )
    }

    /// Kinds that are sized by a bit count
    pub fn needs_bit_count(&self) -> bool {
        matches!(self, ErrorKind::BitCountHigh | ErrorKind::BitCountLow)
    }

    /// Whether the receiving terminal treats the corrupted word as invalid
    pub fn invalidates_word(&self) -> bool {
        !matches!(
            self,
            ErrorKind::None
                | ErrorKind::AlternateBus
                | ErrorKind::HighSpeedSubaddress
                | ErrorKind::BusSwitch
        )
    }
}

/// Error injection applied to the BC's transmission of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorInjection {
    /// Error kind
    pub kind: ErrorKind,
    /// Word position (0 = command word, n = n-th data word)
    pub word_pos: u8,
    /// Bit position within the word (4-20)
    pub bit_pos: u8,
    /// Number of bits added or removed (1-3)
    pub bit_count: u8,
}

impl ErrorInjection {
    /// No injected error
    pub fn none() -> Self {
        ErrorInjection::default()
    }

    /// Check the position fields against the error kind
    ///
    /// Kinds that ignore the bit position or bit count still only accept 0
    /// or an in-range value there.
    pub fn validate(&self) -> Result<()> {
        if self.word_pos > 32 {
            return Err(BiuError::param(16, "err_wpos", self.word_pos));
        }
        let bit_pos_unset = self.bit_pos == 0 && !self.kind.needs_bit_position();
        if !bit_pos_unset && !(4..=20).contains(&self.bit_pos) {
            return Err(BiuError::param(17, "err_bpos", self.bit_pos));
        }
        let bit_count_unset = self.bit_count == 0 && !self.kind.needs_bit_count();
        if !bit_count_unset && !(1..=3).contains(&self.bit_count) {
            return Err(BiuError::param(18, "err_bc_bits", self.bit_count));
        }
        Ok(())
    }

    fn encode(&self) -> u32 {
        let mut word = ErrorSpecWord(0);
        word.set_kind(self.kind.raw());
        word.set_word_pos(self.word_pos);
        word.set_bit_pos(self.bit_pos);
        word.set_bit_count(self.bit_count);
        word.0
    }
}

bitfield! {
    /// Descriptor word 0
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TransferControlWord(u32);
    impl Debug;
    pub u8, kind, set_kind: 31, 30;
    pub secondary_bus, set_secondary_bus: 29;
    pub u8, interrupt, set_interrupt: 28, 27;
    pub u8, halt, set_halt: 26, 24;
    pub u8, service_request, set_service_request: 23, 22;
    pub u8, response, set_response: 21, 20;
    pub u8, gap_mode, set_gap_mode: 19, 18;
    pub u8, word_count, set_word_count: 5, 0;
}

bitfield! {
    /// Descriptor word 6
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ErrorSpecWord(u32);
    impl Debug;
    pub u8, kind, set_kind: 31, 28;
    pub u8, word_pos, set_word_pos: 21, 16;
    pub u8, bit_pos, set_bit_pos: 12, 8;
    pub u8, bit_count, set_bit_count: 2, 0;
}

/// A bus controller transfer definition
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transfer {
    /// Transfer id (1..=max)
    pub xid: u16,
    /// Buffer header bound to the transfer
    pub hid: u16,
    /// Data flow direction
    pub kind: TransferType,
    /// Bus the transfer is sent on
    pub bus: Bus,
    /// Transmitting RT (RT-to-BC and RT-to-RT)
    pub xmt_rt: u8,
    /// Receiving RT (BC-to-RT and RT-to-RT; 31 is broadcast)
    pub rcv_rt: u8,
    /// Transmit subaddress or mode selector
    pub xmt_sa: u8,
    /// Receive subaddress or mode selector
    pub rcv_sa: u8,
    /// Data word count (0 and 32 both mean 32) or mode code
    pub word_count: u8,
    /// Completion interrupt
    pub interrupt: InterruptControl,
    /// Halt condition
    pub halt: HaltControl,
    /// Service request handling
    pub service_request: ServiceRequest,
    /// Expected responses
    pub response: ResponseControl,
    /// Gap interpretation
    pub gap_mode: GapMode,
    /// Gap value
    pub gap: u16,
    /// Status word bits that raise an exception when set
    pub status_mask: u16,
    /// Injected error
    pub error: ErrorInjection,
}

impl Transfer {
    /// A BC-to-RT transfer with default control settings
    pub fn bc_to_rt(xid: u16, hid: u16, rt: u8, sa: u8, word_count: u8) -> Self {
        Transfer {
            rcv_rt: rt,
            rcv_sa: sa,
            ..Transfer::base(xid, hid, TransferType::BcToRt, word_count)
        }
    }

    /// An RT-to-BC transfer with default control settings
    pub fn rt_to_bc(xid: u16, hid: u16, rt: u8, sa: u8, word_count: u8) -> Self {
        Transfer {
            xmt_rt: rt,
            xmt_sa: sa,
            ..Transfer::base(xid, hid, TransferType::RtToBc, word_count)
        }
    }

    /// An RT-to-RT transfer with default control settings
    pub fn rt_to_rt(xid: u16, hid: u16, xmt: (u8, u8), rcv: (u8, u8), word_count: u8) -> Self {
        Transfer {
            xmt_rt: xmt.0,
            xmt_sa: xmt.1,
            rcv_rt: rcv.0,
            rcv_sa: rcv.1,
            ..Transfer::base(xid, hid, TransferType::RtToRt, word_count)
        }
    }

    fn base(xid: u16, hid: u16, kind: TransferType, word_count: u8) -> Self {
        Transfer {
            xid,
            hid,
            kind,
            bus: Bus::BusA,
            xmt_rt: 0,
            rcv_rt: 0,
            xmt_sa: 0,
            rcv_sa: 0,
            word_count,
            interrupt: InterruptControl::None,
            halt: HaltControl::NoHalt,
            service_request: ServiceRequest::Disabled,
            response: ResponseControl::Automatic,
            gap_mode: GapMode::Standard,
            gap: 0,
            status_mask: 0,
            error: ErrorInjection::none(),
        }
    }

    /// Send on the given bus
    pub fn on_bus(mut self, bus: Bus) -> Self {
        self.bus = bus;
        self
    }

    /// Validate field ranges; the first invalid field wins
    pub fn validate(&self, max_xid: u16) -> Result<()> {
        if self.xid == 0 || self.xid > max_xid {
            return Err(BiuError::param(1, "xid", self.xid));
        }
        if self.hid == 0 {
            return Err(BiuError::param(2, "hid", self.hid));
        }
        let checks: [(u8, &'static str, u8, u8); 5] = [
            (5, "xmt_rt", self.xmt_rt, Address::MAX),
            (6, "rcv_rt", self.rcv_rt, Address::MAX),
            (7, "xmt_sa", self.xmt_sa, SubAddress::MAX),
            (8, "rcv_sa", self.rcv_sa, SubAddress::MAX),
            (9, "wcnt", self.word_count, 32),
        ];
        for (position, field, value, max) in checks {
            if value > max {
                return Err(BiuError::param(position, field, value));
            }
        }
        self.error.validate()?;
        let gap_max = match self.gap_mode {
            GapMode::Delay | GapMode::Standard => 0x7FFF,
            GapMode::Fast => 63,
        };
        if self.gap > gap_max {
            return Err(BiuError::param(19, "gap", self.gap));
        }
        Ok(())
    }

    /// Whether the receiving side is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.kind != TransferType::RtToBc && self.rcv_rt == Address::BROADCAST
    }

    /// Whether the transfer is a mode code
    pub fn is_mode_code(&self) -> bool {
        let sa = match self.kind {
            TransferType::RtToBc => self.xmt_sa,
            _ => self.rcv_sa,
        };
        sa == 0 || sa == 31
    }

    /// First and (for RT-to-RT) second command word
    pub fn command_words(&self) -> (CommandWord, Option<CommandWord>) {
        let make = |rt: u8, dir: Direction, sa: u8| {
            let mut cw = CommandWord(0);
            cw.set_rt(rt);
            cw.set_tr(dir == Direction::Transmit);
            cw.set_sa(sa);
            cw.set_word_count_field(self.word_count & 0x1F);
            cw
        };
        match self.kind {
            TransferType::BcToRt => (make(self.rcv_rt, Direction::Receive, self.rcv_sa), None),
            TransferType::RtToBc => (make(self.xmt_rt, Direction::Transmit, self.xmt_sa), None),
            TransferType::RtToRt => (
                make(self.rcv_rt, Direction::Receive, self.rcv_sa),
                Some(make(self.xmt_rt, Direction::Transmit, self.xmt_sa)),
            ),
        }
    }

    fn control_word(&self) -> u32 {
        let mut word = TransferControlWord(0);
        word.set_kind(self.kind.raw());
        word.set_secondary_bus(self.bus == Bus::BusB);
        word.set_interrupt(self.interrupt.raw());
        word.set_halt(self.halt.raw());
        word.set_service_request(self.service_request.raw());
        word.set_response(self.response.raw());
        word.set_gap_mode(self.gap_mode.raw());
        word.set_word_count(self.word_count);
        word.0
    }
}

/// Counters maintained by the engine in the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferStatus {
    /// Completed messages
    pub msg_count: u32,
    /// Messages that ended in error
    pub err_count: u32,
}

/// Canonical record of all defined transfers
#[derive(Debug, Clone)]
pub struct TransferStore {
    layout: MemoryLayout,
    max_xid: u16,
    transfers: BTreeMap<u16, Transfer>,
    dytag_enabled: BTreeMap<u16, bool>,
}

impl TransferStore {
    /// Create an empty store over the descriptor area
    pub fn new(layout: MemoryLayout, max_xid: u16) -> Self {
        TransferStore {
            layout,
            max_xid,
            transfers: BTreeMap::new(),
            dytag_enabled: BTreeMap::new(),
        }
    }

    /// Validate and write a transfer descriptor, returning its address
    ///
    /// Redefining an id replaces the descriptor and resets its counters.
    pub fn define<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        headers: &BufferManager,
        transfer: Transfer,
    ) -> Result<u32> {
        transfer.validate(self.max_xid)?;
        let header_addr = headers.header_addr(transfer.hid)?;
        let addr = self.layout.descriptor_addr(transfer.xid);
        let (cw1, cw2) = transfer.command_words();
        let tagged = self.dytag_enabled.get(&transfer.xid).copied().unwrap_or(false);
        let words = [
            transfer.control_word(),
            header_addr,
            ((cw2.map(|w| w.raw()).unwrap_or(0) as u32) << 16) | cw1.raw() as u32,
            ((transfer.gap as u32) << 16) | transfer.status_mask as u32,
            0,
            0,
            transfer.error.encode(),
            ((tagged as u32) << 31) | transfer.xid as u32,
        ];
        mem.write_block(addr, &words)?;
        debug!(
            "transfer {} defined at 0x{:08X}: {:?} cw1=0x{:04X}",
            transfer.xid,
            addr,
            transfer.kind,
            cw1.raw()
        );
        self.transfers.insert(transfer.xid, transfer);
        Ok(addr)
    }

    /// Return the transfer as last defined
    pub fn read(&self, xid: u16) -> Result<&Transfer> {
        self.transfers
            .get(&xid)
            .ok_or(BiuError::UndefinedTransfer(xid))
    }

    /// Whether an id is defined
    pub fn contains(&self, xid: u16) -> bool {
        self.transfers.contains_key(&xid)
    }

    /// Highest legal transfer id
    pub fn max_xid(&self) -> u16 {
        self.max_xid
    }

    /// Patch only the error injection of a defined transfer
    pub fn set_error_injection<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        xid: u16,
        error: ErrorInjection,
    ) -> Result<()> {
        error.validate()?;
        let transfer = self
            .transfers
            .get_mut(&xid)
            .ok_or(BiuError::UndefinedTransfer(xid))?;
        transfer.error = error;
        mem.write_u32(self.layout.descriptor_addr(xid) + slot::ERROR_SPEC, error.encode())?;
        debug!("transfer {} error injection set to {:?}", xid, error.kind);
        Ok(())
    }

    /// Mark whether dynamic tags apply to a transfer
    pub(crate) fn set_dytag_enabled<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        xid: u16,
        enabled: bool,
    ) -> Result<()> {
        self.dytag_enabled.insert(xid, enabled);
        if self.transfers.contains_key(&xid) {
            let addr = self.layout.descriptor_addr(xid) + slot::TAG_ID;
            mem.write_u32(addr, ((enabled as u32) << 31) | xid as u32)?;
        }
        Ok(())
    }

    /// Raw descriptor words as held in device memory
    pub fn descriptor_words<M: DeviceMemory + ?Sized>(&self, mem: &M, xid: u16) -> Result<[u32; 8]> {
        self.read(xid)?;
        let mut words = [0u32; 8];
        mem.read_block(self.layout.descriptor_addr(xid), &mut words)?;
        Ok(words)
    }

    /// Message and error counters of a transfer
    pub fn status<M: DeviceMemory + ?Sized>(&self, mem: &M, xid: u16) -> Result<TransferStatus> {
        self.read(xid)?;
        let addr = self.layout.descriptor_addr(xid);
        Ok(TransferStatus {
            msg_count: mem.read_u32(addr + slot::MSG_COUNT)?,
            err_count: mem.read_u32(addr + slot::ERR_COUNT)?,
        })
    }

    /// Bump the counters after a transfer completes
    pub(crate) fn record_result<M: DeviceMemory + ?Sized>(
        &self,
        mem: &mut M,
        xid: u16,
        error: bool,
    ) -> Result<()> {
        let addr = self.layout.descriptor_addr(xid);
        let count = mem.read_u32(addr + slot::MSG_COUNT)?;
        mem.write_u32(addr + slot::MSG_COUNT, count.wrapping_add(1))?;
        if error {
            let errs = mem.read_u32(addr + slot::ERR_COUNT)?;
            mem.write_u32(addr + slot::ERR_COUNT, errs.wrapping_add(1))?;
        }
        Ok(())
    }

    /// Map a descriptor address (either half) back to its transfer id
    pub fn xid_at(&self, addr: u32) -> Option<u16> {
        let start = self.layout.xfer_base;
        let end = start + 2 * self.layout.xfer_slots * DESCRIPTOR_BYTES;
        if addr < start || addr >= end || (addr - start) % DESCRIPTOR_BYTES != 0 {
            return None;
        }
        let index = (addr - start) / DESCRIPTOR_BYTES;
        let xid = if index >= self.layout.xfer_slots {
            index - self.layout.xfer_slots
        } else {
            index
        };
        u16::try_from(xid).ok().filter(|x| self.transfers.contains_key(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferQueueMode, HeaderSpec, QueueSize};
    use crate::config::BiuConfig;
    use crate::memory::SimMemory;
    use proptest::prelude::*;

    fn setup() -> (SimMemory, BufferManager, TransferStore) {
        let config = BiuConfig::default();
        let layout = config.layout();
        let mut mem = SimMemory::new(layout.total);
        let mut buffers = BufferManager::new(layout);
        buffers
            .define_header(&mut mem, HeaderSpec::new(1, 1, QueueSize::One, BufferQueueMode::Cyclic))
            .unwrap();
        (mem, buffers, TransferStore::new(layout, config.max_xfer_id))
    }

    #[test]
    fn test_define_writes_descriptor() -> Result<()> {
        let (mut mem, buffers, mut store) = setup();
        let addr = store.define(&mut mem, &buffers, Transfer::bc_to_rt(5, 1, 3, 2, 4))?;
        assert_eq!(addr, BiuConfig::default().layout().descriptor_addr(5));
        let words = store.descriptor_words(&mem, 5)?;
        assert_eq!(words[1], buffers.header_addr(1)?);
        assert_eq!(words[2] & 0xFFFF, (3 << 11) | (2 << 5) | 4);
        assert_eq!(words[7], 5);
        Ok(())
    }

    #[test]
    fn test_rt_to_rt_command_pair() {
        let t = Transfer::rt_to_rt(1, 1, (2, 3), (4, 5), 6);
        let (cw1, cw2) = t.command_words();
        assert_eq!(cw1.raw(), (4 << 11) | (5 << 5) | 6);
        assert_eq!(cw2.map(|c| c.raw()), Some((2 << 11) | (1 << 10) | (3 << 5) | 6));
    }

    #[test]
    fn test_validation_order() {
        let (mut mem, buffers, mut store) = setup();
        let mut t = Transfer::bc_to_rt(1, 1, 40, 40, 40);
        assert_eq!(
            store.define(&mut mem, &buffers, t.clone()),
            Err(BiuError::param(6, "rcv_rt", 40u8))
        );
        t.rcv_rt = 1;
        assert_eq!(
            store.define(&mut mem, &buffers, t.clone()),
            Err(BiuError::param(8, "rcv_sa", 40u8))
        );
        t.rcv_sa = 1;
        assert_eq!(
            store.define(&mut mem, &buffers, t),
            Err(BiuError::param(9, "wcnt", 40u8))
        );
    }

    #[test]
    fn test_error_positions() {
        let mut t = Transfer::bc_to_rt(1, 1, 1, 1, 1);
        t.error = ErrorInjection {
            kind: ErrorKind::ManchesterHigh,
            word_pos: 1,
            bit_pos: 2,
            bit_count: 0,
        };
        assert_eq!(t.validate(10), Err(BiuError::param(17, "err_bpos", 2u8)));
        t.error.kind = ErrorKind::BitCountLow;
        t.error.bit_pos = 0;
        assert_eq!(t.validate(10), Err(BiuError::param(18, "err_bc_bits", 0u8)));
        t.error.bit_count = 2;
        assert!(t.validate(10).is_ok());
    }

    #[test]
    fn test_unused_error_fields_are_range_checked() {
        let mut t = Transfer::bc_to_rt(1, 1, 1, 1, 1);
        t.error = ErrorInjection {
            kind: ErrorKind::Parity,
            word_pos: 1,
            bit_pos: 31,
            bit_count: 0,
        };
        assert_eq!(t.validate(10), Err(BiuError::param(17, "err_bpos", 31u8)));
        t.error.bit_pos = 2;
        assert_eq!(t.validate(10), Err(BiuError::param(17, "err_bpos", 2u8)));
        t.error.bit_pos = 12;
        assert!(t.validate(10).is_ok());
        t.error.bit_count = 7;
        assert_eq!(t.validate(10), Err(BiuError::param(18, "err_bc_bits", 7u8)));
        t.error.kind = ErrorKind::ManchesterLow;
        t.error.bit_count = 4;
        assert_eq!(t.validate(10), Err(BiuError::param(18, "err_bc_bits", 4u8)));
        t.error.bit_count = 0;
        assert!(t.validate(10).is_ok());
    }

    #[test]
    fn test_fast_gap_limit() {
        let mut t = Transfer::bc_to_rt(1, 1, 1, 1, 1);
        t.gap_mode = GapMode::Fast;
        t.gap = 64;
        assert_eq!(t.validate(10), Err(BiuError::param(19, "gap", 64u16)));
        t.gap_mode = GapMode::Standard;
        assert!(t.validate(10).is_ok());
    }

    #[test]
    fn test_undefined_header_rejected() {
        let (mut mem, buffers, mut store) = setup();
        assert_eq!(
            store.define(&mut mem, &buffers, Transfer::bc_to_rt(1, 9, 1, 1, 1)),
            Err(BiuError::UndefinedHeader(9))
        );
    }

    #[test]
    fn test_error_injection_patch() -> Result<()> {
        let (mut mem, buffers, mut store) = setup();
        store.define(&mut mem, &buffers, Transfer::bc_to_rt(2, 1, 1, 1, 1))?;
        let error = ErrorInjection {
            kind: ErrorKind::Parity,
            word_pos: 1,
            ..ErrorInjection::none()
        };
        store.set_error_injection(&mut mem, 2, error)?;
        assert_eq!(store.read(2)?.error, error);
        assert_eq!(store.descriptor_words(&mem, 2)?[6] >> 28, 3);
        assert!(store.set_error_injection(&mut mem, 3, error).is_err());
        Ok(())
    }

    #[test]
    fn test_xid_at_covers_both_halves() -> Result<()> {
        let (mut mem, buffers, mut store) = setup();
        store.define(&mut mem, &buffers, Transfer::bc_to_rt(7, 1, 1, 1, 1))?;
        let layout = BiuConfig::default().layout();
        assert_eq!(store.xid_at(layout.descriptor_addr(7)), Some(7));
        assert_eq!(
            store.xid_at(layout.xfer_base + (7 + layout.xfer_slots) * DESCRIPTOR_BYTES),
            Some(7)
        );
        assert_eq!(store.xid_at(layout.descriptor_addr(8)), None);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_define_then_read_returns_definition(
            xid in 1u16..=4095,
            rt in 0u8..=31,
            sa in 0u8..=31,
            wc in 0u8..=32,
        ) {
            let (mut mem, buffers, mut store) = setup();
            let t = Transfer::rt_to_bc(xid, 1, rt, sa, wc);
            store.define(&mut mem, &buffers, t.clone()).unwrap();
            prop_assert_eq!(store.read(xid).unwrap(), &t);
        }
    }
}
