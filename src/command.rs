//! Command interface
//!
//! Every engine operation is one [`Command`] with a stable numeric
//! [`CommandId`]. Inputs are encoded in a fixed little-endian field layout.
//! The acknowledge frame starts with a 32-bit status (0 on success, otherwise
//! [`BiuError::status_code`]) followed by the reply fields, or by a
//! length-prefixed UTF-8 message when the command failed.
//!
//! Frames travel over a [`Transport`]. Transport failures never carry a status
//! code and surface as [`BiuError::Transport`]; errors reported by the device
//! come back as [`BiuError::Device`].
//!
//! ```
//! use milstd1553b_biu::command::{Client, Command, Loopback, Reply};
//! use milstd1553b_biu::{BiuConfig, BusInterfaceUnit};
//!
//! let biu = BusInterfaceUnit::new(BiuConfig::default())?;
//! let mut client = Client::new(Loopback::new(biu));
//! assert_eq!(client.call(&Command::BoardEnable)?, Reply::Done);
//! # Ok::<(), milstd1553b_biu::BiuError>(())
//! ```

use log::{debug, warn};

use crate::bite::{run_bite, BiteReport, BiteSelection};
use crate::buffer::{
    BufferQueueMode, BufferStoreMode, HeaderInfo, HeaderSpec, QueueSize, StatusEntry,
    StatusQueueMode,
};
use crate::core::{Bus, Direction};
use crate::dytag::{DytagFunction, DytagSpec};
use crate::engine::{BcStatus, BusInterfaceUnit, TriggerSource};
use crate::error::{BiuError, Result, TransportError};
use crate::frame::{BcState, FrameInstruction, ProgramStart, StartMode};
use crate::instr::{CompileMode, CompiledTable, Opcode, TableEntry};
use crate::memory::DeviceMemory;
use crate::monitor::{
    Activity, CaptureMode, MonitorConfig, MonitorState, MonitorTotals, RecordSelector,
    StackPointers, Trigger,
};
use crate::rt::{RtConfig, RtCounters, RtState, RtStatus};
use crate::transfer::{
    ErrorInjection, ErrorKind, GapMode, HaltControl, InterruptControl, ResponseControl,
    ServiceRequest, Transfer, TransferStatus, TransferType,
};

/// Carries one command frame to the device and returns its acknowledge frame
pub trait Transport {
    /// Send `input` under `command_id`; at most one delivery per call
    fn send(&mut self, command_id: u32, input: &[u8]) -> std::result::Result<Vec<u8>, TransportError>;
}

const SYS: u32 = 0x0100_0000;
const SYS_EXEC: u32 = 0x0106_0000;
const SYS_BITE: u32 = 0x0107_0000;
const SYS_INI: u32 = 0x0108_0000;
const BC: u32 = 0x0200_0000;
const RT: u32 = 0x0300_0000;
const BM: u32 = 0x0400_0000;
const BUF: u32 = 0x0700_0000;

/// Status word of a successful acknowledge
pub const STATUS_OK: u32 = 0;

macro_rules! command_ids {
    ($($(#[$meta:meta])* $name:ident = $value:expr),+ $(,)?) => {
        /// Stable command identifiers
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum CommandId {
            $($(#[$meta])* $name = $value),+
        }

        impl CommandId {
            /// Every command id
            pub const ALL: &'static [CommandId] = &[$(CommandId::$name),+];
        }
    };
}

command_ids! {
    /// Clear memory and definitions
    Reset = SYS + 23,
    /// Set the no-response timeout
    ResponseTimeoutDef = SYS + 12,
    /// Advance the engine clock
    Run = SYS_EXEC,
    /// Run until the bus controller halts
    RunUntilHalt = SYS_EXEC + 1,
    /// Raise a trigger input
    TriggerRaise = SYS_EXEC + 2,
    /// Built-in test
    Bite = SYS_BITE,
    /// Board enable handshake
    BoardEnable = SYS_INI,
    /// Patch the error injection of a transfer
    BcXferError = BC,
    /// Read encoded descriptor words
    BcXferDescGet = BC + 1,
    /// Define a buffer header
    BcBhDef = BC + 4,
    /// Define a transfer
    BcXferDef = BC + 5,
    /// Start the bus controller
    BcStart = BC + 7,
    /// Halt the bus controller
    BcHalt = BC + 8,
    /// Read a transfer definition
    BcXferDefGet = BC + 9,
    /// Read a buffer header
    BcBhRead = BC + 10,
    /// Define dynamic tags
    BcDytagDef = BC + 14,
    /// Define a minor frame
    BcMinorFrameDef = BC + 16,
    /// Define the major frame
    BcMajorFrameDef = BC + 17,
    /// Read bus controller status
    BcStatusRead = BC + 18,
    /// Read transfer counters
    BcXferRead = BC + 19,
    /// Compile an instruction table
    BcInstrTblGen = BC + 0x40,
    /// Initialise a terminal
    RtIni = RT,
    /// Bind a terminal subaddress to a header
    RtSaBind = RT + 1,
    /// Read terminal status
    RtStatusRead = RT + 2,
    /// Read subaddress counters
    RtSaStatusRead = RT + 3,
    /// Read counters over all terminals
    RtTotalsRead = RT + 4,
    /// Initialise the monitor
    BmIni = BM,
    /// Start the monitor
    BmStart = BM + 1,
    /// Halt the monitor
    BmHalt = BM + 2,
    /// Set a monitor filter entry
    BmFilterDef = BM + 3,
    /// Read endpoint activity
    BmActivityRead = BM + 4,
    /// Read monitor totals
    BmTotalsRead = BM + 5,
    /// Read ring pointers
    BmStackPtrRead = BM + 6,
    /// Read one ring entry
    BmStackEntryRead = BM + 7,
    /// Search the ring
    BmStackEntryFind = BM + 8,
    /// Write data buffer words
    BufWrite = BUF,
    /// Read data buffer words
    BufRead = BUF + 1,
    /// Resize a buffer header
    BufBhModify = BUF + 2,
    /// Read a status queue
    BufStatusQueueRead = BUF + 3,
    /// Read and clear the event queue
    BufEventsRead = BUF + 4,
    /// Clear sticky overflow flags
    BufOverflowClear = BUF + 5,
}

impl TryFrom<u32> for CommandId {
    type Error = BiuError;

    fn try_from(value: u32) -> Result<Self> {
        CommandId::ALL
            .iter()
            .copied()
            .find(|id| *id as u32 == value)
            .ok_or_else(|| BiuError::invalid_command(format!("unknown command id 0x{:08X}", value)))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| BiuError::invalid_command(format!("frame truncated at byte {}", self.pos)))?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(BiuError::invalid_command(format!(
                "{} trailing byte(s) in frame",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

trait Decode: Sized {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self>;
}

macro_rules! wire_int {
    ($($ty:ty),+) => {
        $(
            impl Encode for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }

            impl Decode for $ty {
                fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
                    Ok(<$ty>::from_le_bytes(cur.array()?))
                }
            }
        )+
    };
}

wire_int!(u8, u16, u32, u64, i32);

impl Encode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        (*self as u8).encode(out);
    }
}

impl Decode for bool {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        match u8::decode(cur)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(BiuError::invalid_command(format!("invalid flag byte {}", v))),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let len = u32::decode(cur)? as usize;
        if len > cur.buf.len() - cur.pos {
            return Err(BiuError::invalid_command(format!("list length {} exceeds frame", len)));
        }
        (0..len).map(|_| T::decode(cur)).collect()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.is_some().encode(out);
        if let Some(value) = self {
            value.encode(out);
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(if bool::decode(cur)? {
            Some(T::decode(cur)?)
        } else {
            None
        })
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok((A::decode(cur)?, B::decode(cur)?))
    }
}

impl<A: Encode, B: Encode, C: Encode> Encode for (A, B, C) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
        self.2.encode(out);
    }
}

impl<A: Decode, B: Decode, C: Decode> Decode for (A, B, C) {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok((A::decode(cur)?, B::decode(cur)?, C::decode(cur)?))
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_bytes().to_vec().encode(out);
    }
}

impl Decode for String {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        String::from_utf8(Vec::<u8>::decode(cur)?)
            .map_err(|e| BiuError::invalid_command(format!("invalid UTF-8: {}", e)))
    }
}

/// Field-by-field layout in declaration order
macro_rules! wire_struct {
    ($($ty:ident { $($field:ident),+ $(,)? })+) => {
        $(
            impl Encode for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    $(self.$field.encode(out);)+
                }
            }

            impl Decode for $ty {
                fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
                    Ok($ty {
                        $($field: Decode::decode(cur)?),+
                    })
                }
            }
        )+
    };
}

/// One byte holding the raw parameter value
macro_rules! wire_raw_enum {
    ($($ty:ident),+) => {
        $(
            impl Encode for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    (*self as u8).encode(out);
                }
            }

            impl Decode for $ty {
                fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
                    $ty::from_raw(u8::decode(cur)?)
                }
            }
        )+
    };
}

wire_raw_enum!(
    TransferType,
    InterruptControl,
    HaltControl,
    ServiceRequest,
    ResponseControl,
    GapMode,
    ErrorKind,
    QueueSize,
    BufferQueueMode,
    BufferStoreMode,
    StatusQueueMode,
    CaptureMode,
    CompileMode,
    DytagFunction,
    TriggerSource
);

wire_struct! {
    ErrorInjection { kind, word_pos, bit_pos, bit_count }
    Transfer {
        xid, hid, kind, bus, xmt_rt, rcv_rt, xmt_sa, rcv_sa, word_count, interrupt, halt,
        service_request, response, gap_mode, gap, status_mask, error,
    }
    TransferStatus { msg_count, err_count }
    HeaderSpec { hid, bid, queue_size, store_mode, queue_mode, status_mode }
    HeaderInfo { hid, bid, header_addr, sq_addr, eq_addr, buffer_addr, buffer_count, current_index }
    StatusEntry {
        error, exception, bus, buffer_index, error_flags, status1, status2, buffer_addr, time_tag,
    }
    TableEntry { label, op, par1, par2 }
    DytagSpec { function, min, max, step, word_pos }
    MonitorConfig { capture_mode, start_trigger, stop_trigger, pre_trigger_entries, capture_entries }
    Activity { msg_count, err_count, last_error }
    MonitorTotals { msg_count, err_count }
    StackPointers { state, overflow, start, current, trigger }
    RtConfig { enabled, response_time_qus, status_flags, vector_word, bit_word }
    RtCounters { msg_count, err_count }
    RtStatus { address, state, counters, last_command, last_status }
    ProgramStart { entry, cycles, frame_time_us }
    BcStatus { state, msg_count, err_count, strobes, minor_frames, interrupts, pc }
    BiteReport { phases }
}

impl Encode for Bus {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_bit().encode(out);
    }
}

impl Decode for Bus {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        match u8::decode(cur)? {
            b @ (0 | 1) => Ok(Bus::from_bit(b as u32)),
            b => Err(BiuError::param(4, "bus", b)),
        }
    }
}

impl Encode for Direction {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.as_bit() as u8).encode(out);
    }
}

impl Decode for Direction {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        match u8::decode(cur)? {
            b @ (0 | 1) => Ok(Direction::from_bit(b as u16)),
            b => Err(BiuError::param(3, "direction", b)),
        }
    }
}

impl Encode for Opcode {
    fn encode(&self, out: &mut Vec<u8>) {
        (*self as u8).encode(out);
    }
}

impl Decode for Opcode {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let code = u8::decode(cur)?;
        Opcode::from_code(code).ok_or_else(|| BiuError::param(1, "opcode", code))
    }
}

impl Encode for StartMode {
    fn encode(&self, out: &mut Vec<u8>) {
        self.to_raw().encode(out);
    }
}

impl Decode for StartMode {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let (mode, addr) = Decode::decode(cur)?;
        StartMode::from_raw(mode, addr)
    }
}

impl Encode for FrameInstruction {
    fn encode(&self, out: &mut Vec<u8>) {
        self.to_raw().encode(out);
    }
}

impl Decode for FrameInstruction {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let (code, arg) = Decode::decode(cur)?;
        FrameInstruction::from_raw(code, arg)
    }
}

impl Encode for RecordSelector {
    fn encode(&self, out: &mut Vec<u8>) {
        let (code, offset): (u8, i32) = match *self {
            RecordSelector::Start(n) => (0, n as i32),
            RecordSelector::Trigger(o) => (1, o),
            RecordSelector::End(n) => (2, -(n as i32)),
            RecordSelector::Absolute(n) => (3, n as i32),
        };
        (code, offset).encode(out);
    }
}

impl Decode for RecordSelector {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let (code, offset) = Decode::decode(cur)?;
        RecordSelector::from_raw(code, offset)
    }
}

impl Encode for Trigger {
    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Trigger::Immediate => 0u8.encode(out),
            Trigger::ErrorCondition { mask } => (1u8, mask).encode(out),
            Trigger::External => 2u8.encode(out),
            Trigger::ReceivedWord { value, mask } => (3u8, value, mask).encode(out),
            Trigger::DataValue {
                command,
                word_pos,
                min,
                max,
            } => {
                (4u8, command, word_pos).encode(out);
                (min, max).encode(out);
            }
            Trigger::HardwareEvent => 5u8.encode(out),
        }
    }
}

impl Decode for Trigger {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(match u8::decode(cur)? {
            0 => Trigger::Immediate,
            1 => Trigger::ErrorCondition {
                mask: Decode::decode(cur)?,
            },
            2 => Trigger::External,
            3 => Trigger::ReceivedWord {
                value: Decode::decode(cur)?,
                mask: Decode::decode(cur)?,
            },
            4 => Trigger::DataValue {
                command: Decode::decode(cur)?,
                word_pos: Decode::decode(cur)?,
                min: Decode::decode(cur)?,
                max: Decode::decode(cur)?,
            },
            5 => Trigger::HardwareEvent,
            t => return Err(BiuError::param(2, "trigger", t)),
        })
    }
}

/// Enums that only travel in replies
macro_rules! wire_state {
    ($($ty:ident { $($variant:ident = $value:literal),+ $(,)? })+) => {
        $(
            impl Encode for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    let raw: u8 = match self {
                        $($ty::$variant => $value),+
                    };
                    raw.encode(out);
                }
            }

            impl Decode for $ty {
                fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
                    match u8::decode(cur)? {
                        $($value => Ok($ty::$variant),)+
                        v => Err(BiuError::invalid_command(format!(
                            "invalid {} {}",
                            stringify!($ty),
                            v
                        ))),
                    }
                }
            }
        )+
    };
}

wire_state! {
    BcState { Idle = 0, Running = 1, Halted = 2 }
    MonitorState { Halted = 0, Armed = 1, Capturing = 2, Stopped = 3 }
    RtState { Idle = 0, Error = 1, NoResponse = 2 }
}

impl Encode for BiteSelection {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            BiteSelection::All => 0u8.encode(out),
            BiteSelection::Phase(p) => p.encode(out),
        }
    }
}

impl Decode for BiteSelection {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        BiteSelection::from_raw(u8::decode(cur)?)
    }
}

impl Encode for CompiledTable {
    fn encode(&self, out: &mut Vec<u8>) {
        self.words.encode(out);
        let labels: Vec<(u16, u32)> = self.labels.iter().map(|(l, a)| (*l, *a)).collect();
        labels.encode(out);
        self.start_addr.encode(out);
    }
}

impl Decode for CompiledTable {
    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let words = Decode::decode(cur)?;
        let labels: Vec<(u16, u32)> = Decode::decode(cur)?;
        Ok(CompiledTable {
            words,
            labels: labels.into_iter().collect(),
            start_addr: Decode::decode(cur)?,
        })
    }
}

/// One engine operation with its input fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Clear memory and definitions
    Reset,
    /// Board enable handshake
    BoardEnable,
    /// Built-in test
    Bite(BiteSelection),
    /// No-response timeout in 0.25 µs units
    SetResponseTimeout(u16),
    /// Raise a trigger input
    RaiseTrigger(TriggerSource),
    /// Advance the clock by microseconds
    Run(u64),
    /// Run until halt, with a limit in microseconds
    RunUntilHalt(u64),
    /// Define a transfer
    DefineTransfer(Transfer),
    /// Read a transfer definition
    ReadTransfer(u16),
    /// Replace the error injection of a transfer
    SetErrorInjection(u16, ErrorInjection),
    /// Read transfer counters
    TransferStatus(u16),
    /// Read the encoded descriptor
    DescriptorWords(u16),
    /// Define a buffer header
    DefineHeader(HeaderSpec),
    /// Read a buffer header
    ReadHeader(u16),
    /// Resize a buffer header
    ModifyHeader {
        /// Header id
        hid: u16,
        /// New ring size
        queue_size: QueueSize,
        /// New traversal mode
        queue_mode: BufferQueueMode,
    },
    /// Write words into a data buffer
    WriteBuffer {
        /// Buffer id
        bid: u16,
        /// Words to write
        words: Vec<u16>,
    },
    /// Read words from a data buffer
    ReadBuffer {
        /// Buffer id
        bid: u16,
        /// Words to read
        count: u16,
    },
    /// Read a status queue
    ReadStatusQueue {
        /// Header id
        hid: u16,
        /// Invalidate entries after reading
        clear: bool,
    },
    /// Read and clear the event queue
    ReadEvents(u16),
    /// Clear sticky overflow flags
    ClearOverflow(u16),
    /// Define a minor frame
    DefineMinorFrame {
        /// Frame id
        id: u8,
        /// Frame body
        instructions: Vec<FrameInstruction>,
    },
    /// Define the major frame
    DefineMajorFrame(Vec<u8>),
    /// Start the bus controller
    BcStart {
        /// Start mode
        mode: StartMode,
        /// Major frame repetitions (0 = forever)
        cycles: u32,
        /// Minor frame period in microseconds
        frame_time_us: Option<u32>,
    },
    /// Halt the bus controller
    BcHalt,
    /// Read bus controller status
    BcStatus,
    /// Compile an instruction table
    CompileTable {
        /// Compile mode
        mode: CompileMode,
        /// Destination offset in bytes
        dest_offset: u32,
        /// Symbolic lines
        entries: Vec<TableEntry>,
        /// Pre-encoded words for write-only mode
        words: Vec<u32>,
    },
    /// Attach dynamic tags to a transfer
    DefineDytag {
        /// Transfer id
        xid: u16,
        /// Slots
        specs: Vec<DytagSpec>,
    },
    /// Initialise the monitor
    BmInit(MonitorConfig),
    /// Start the monitor
    BmStart,
    /// Halt the monitor
    BmHalt,
    /// Set a monitor filter entry
    BmFilter {
        /// Terminal
        rt: u8,
        /// Subaddress
        sa: u8,
        /// Direction
        direction: Direction,
        /// Record this endpoint
        enabled: bool,
    },
    /// Read endpoint activity
    BmActivity {
        /// Terminal
        rt: u8,
        /// Subaddress
        sa: u8,
        /// Direction
        direction: Direction,
    },
    /// Read monitor totals
    BmTotals,
    /// Read ring pointers
    BmStackPointer,
    /// Read one raw ring entry
    BmReadRecord(RecordSelector),
    /// Find the first entry matching under a mask
    BmFindEntry {
        /// Bits compared
        mask: u32,
        /// Expected bits
        value: u32,
    },
    /// Initialise a terminal
    RtInit {
        /// Terminal address
        rt: u8,
        /// Parameters
        config: RtConfig,
    },
    /// Bind a terminal subaddress to a header
    RtBind {
        /// Terminal address
        rt: u8,
        /// Subaddress
        sa: u8,
        /// Direction
        direction: Direction,
        /// Header id, `None` to unbind
        hid: Option<u16>,
    },
    /// Read terminal status
    RtStatus(u8),
    /// Read subaddress counters
    RtSaStatus {
        /// Terminal address
        rt: u8,
        /// Subaddress
        sa: u8,
        /// Direction
        direction: Direction,
    },
    /// Read counters over all terminals
    RtTotals,
}

impl Command {
    /// Command id of this operation
    pub fn id(&self) -> CommandId {
        use CommandId as C;
        match self {
            Command::Reset => C::Reset,
            Command::BoardEnable => C::BoardEnable,
            Command::Bite(_) => C::Bite,
            Command::SetResponseTimeout(_) => C::ResponseTimeoutDef,
            Command::RaiseTrigger(_) => C::TriggerRaise,
            Command::Run(_) => C::Run,
            Command::RunUntilHalt(_) => C::RunUntilHalt,
            Command::DefineTransfer(_) => C::BcXferDef,
            Command::ReadTransfer(_) => C::BcXferDefGet,
            Command::SetErrorInjection(..) => C::BcXferError,
            Command::TransferStatus(_) => C::BcXferRead,
            Command::DescriptorWords(_) => C::BcXferDescGet,
            Command::DefineHeader(_) => C::BcBhDef,
            Command::ReadHeader(_) => C::BcBhRead,
            Command::ModifyHeader { .. } => C::BufBhModify,
            Command::WriteBuffer { .. } => C::BufWrite,
            Command::ReadBuffer { .. } => C::BufRead,
            Command::ReadStatusQueue { .. } => C::BufStatusQueueRead,
            Command::ReadEvents(_) => C::BufEventsRead,
            Command::ClearOverflow(_) => C::BufOverflowClear,
            Command::DefineMinorFrame { .. } => C::BcMinorFrameDef,
            Command::DefineMajorFrame(_) => C::BcMajorFrameDef,
            Command::BcStart { .. } => C::BcStart,
            Command::BcHalt => C::BcHalt,
            Command::BcStatus => C::BcStatusRead,
            Command::CompileTable { .. } => C::BcInstrTblGen,
            Command::DefineDytag { .. } => C::BcDytagDef,
            Command::BmInit(_) => C::BmIni,
            Command::BmStart => C::BmStart,
            Command::BmHalt => C::BmHalt,
            Command::BmFilter { .. } => C::BmFilterDef,
            Command::BmActivity { .. } => C::BmActivityRead,
            Command::BmTotals => C::BmTotalsRead,
            Command::BmStackPointer => C::BmStackPtrRead,
            Command::BmReadRecord(_) => C::BmStackEntryRead,
            Command::BmFindEntry { .. } => C::BmStackEntryFind,
            Command::RtInit { .. } => C::RtIni,
            Command::RtBind { .. } => C::RtSaBind,
            Command::RtStatus(_) => C::RtStatusRead,
            Command::RtSaStatus { .. } => C::RtSaStatusRead,
            Command::RtTotals => C::RtTotalsRead,
        }
    }

    /// Encode the input fields
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let o = &mut out;
        match self {
            Command::Reset
            | Command::BoardEnable
            | Command::BcHalt
            | Command::BcStatus
            | Command::BmStart
            | Command::BmHalt
            | Command::BmTotals
            | Command::BmStackPointer
            | Command::RtTotals => {}
            Command::Bite(sel) => sel.encode(o),
            Command::SetResponseTimeout(qus) => qus.encode(o),
            Command::RaiseTrigger(source) => source.encode(o),
            Command::Run(us) | Command::RunUntilHalt(us) => us.encode(o),
            Command::DefineTransfer(t) => t.encode(o),
            Command::ReadTransfer(xid)
            | Command::TransferStatus(xid)
            | Command::DescriptorWords(xid)
            | Command::ReadHeader(xid)
            | Command::ReadEvents(xid)
            | Command::ClearOverflow(xid) => xid.encode(o),
            Command::SetErrorInjection(xid, error) => (*xid, *error).encode(o),
            Command::DefineHeader(spec) => spec.encode(o),
            Command::ModifyHeader {
                hid,
                queue_size,
                queue_mode,
            } => (*hid, *queue_size, *queue_mode).encode(o),
            Command::WriteBuffer { bid, words } => {
                bid.encode(o);
                words.encode(o);
            }
            Command::ReadBuffer { bid, count } => (*bid, *count).encode(o),
            Command::ReadStatusQueue { hid, clear } => (*hid, *clear).encode(o),
            Command::DefineMinorFrame { id, instructions } => {
                id.encode(o);
                instructions.encode(o);
            }
            Command::DefineMajorFrame(ids) => ids.encode(o),
            Command::BcStart {
                mode,
                cycles,
                frame_time_us,
            } => (*mode, *cycles, *frame_time_us).encode(o),
            Command::CompileTable {
                mode,
                dest_offset,
                entries,
                words,
            } => {
                (*mode, *dest_offset).encode(o);
                entries.encode(o);
                words.encode(o);
            }
            Command::DefineDytag { xid, specs } => {
                xid.encode(o);
                specs.encode(o);
            }
            Command::BmInit(config) => config.encode(o),
            Command::BmFilter {
                rt,
                sa,
                direction,
                enabled,
            } => {
                (*rt, *sa, *direction).encode(o);
                enabled.encode(o);
            }
            Command::BmActivity { rt, sa, direction } | Command::RtSaStatus { rt, sa, direction } => {
                (*rt, *sa, *direction).encode(o)
            }
            Command::BmReadRecord(selector) => selector.encode(o),
            Command::BmFindEntry { mask, value } => (*mask, *value).encode(o),
            Command::RtInit { rt, config } => (*rt, *config).encode(o),
            Command::RtBind {
                rt,
                sa,
                direction,
                hid,
            } => {
                (*rt, *sa, *direction).encode(o);
                hid.encode(o);
            }
            Command::RtStatus(rt) => rt.encode(o),
        }
        out
    }

    /// Decode the input fields of a command
    pub fn decode(id: CommandId, input: &[u8]) -> Result<Self> {
        use CommandId as C;
        let cur = &mut Cursor::new(input);
        let command = match id {
            C::Reset => Command::Reset,
            C::BoardEnable => Command::BoardEnable,
            C::Bite => Command::Bite(Decode::decode(cur)?),
            C::ResponseTimeoutDef => Command::SetResponseTimeout(Decode::decode(cur)?),
            C::TriggerRaise => Command::RaiseTrigger(Decode::decode(cur)?),
            C::Run => Command::Run(Decode::decode(cur)?),
            C::RunUntilHalt => Command::RunUntilHalt(Decode::decode(cur)?),
            C::BcXferDef => Command::DefineTransfer(Decode::decode(cur)?),
            C::BcXferDefGet => Command::ReadTransfer(Decode::decode(cur)?),
            C::BcXferError => {
                let (xid, error) = Decode::decode(cur)?;
                Command::SetErrorInjection(xid, error)
            }
            C::BcXferRead => Command::TransferStatus(Decode::decode(cur)?),
            C::BcXferDescGet => Command::DescriptorWords(Decode::decode(cur)?),
            C::BcBhDef => Command::DefineHeader(Decode::decode(cur)?),
            C::BcBhRead => Command::ReadHeader(Decode::decode(cur)?),
            C::BufBhModify => {
                let (hid, queue_size, queue_mode) = Decode::decode(cur)?;
                Command::ModifyHeader {
                    hid,
                    queue_size,
                    queue_mode,
                }
            }
            C::BufWrite => Command::WriteBuffer {
                bid: Decode::decode(cur)?,
                words: Decode::decode(cur)?,
            },
            C::BufRead => {
                let (bid, count) = Decode::decode(cur)?;
                Command::ReadBuffer { bid, count }
            }
            C::BufStatusQueueRead => {
                let (hid, clear) = Decode::decode(cur)?;
                Command::ReadStatusQueue { hid, clear }
            }
            C::BufEventsRead => Command::ReadEvents(Decode::decode(cur)?),
            C::BufOverflowClear => Command::ClearOverflow(Decode::decode(cur)?),
            C::BcMinorFrameDef => Command::DefineMinorFrame {
                id: Decode::decode(cur)?,
                instructions: Decode::decode(cur)?,
            },
            C::BcMajorFrameDef => Command::DefineMajorFrame(Decode::decode(cur)?),
            C::BcStart => {
                let (mode, cycles, frame_time_us) = Decode::decode(cur)?;
                Command::BcStart {
                    mode,
                    cycles,
                    frame_time_us,
                }
            }
            C::BcHalt => Command::BcHalt,
            C::BcStatusRead => Command::BcStatus,
            C::BcInstrTblGen => {
                let (mode, dest_offset) = Decode::decode(cur)?;
                Command::CompileTable {
                    mode,
                    dest_offset,
                    entries: Decode::decode(cur)?,
                    words: Decode::decode(cur)?,
                }
            }
            C::BcDytagDef => Command::DefineDytag {
                xid: Decode::decode(cur)?,
                specs: Decode::decode(cur)?,
            },
            C::BmIni => Command::BmInit(Decode::decode(cur)?),
            C::BmStart => Command::BmStart,
            C::BmHalt => Command::BmHalt,
            C::BmFilterDef => {
                let (rt, sa, direction) = Decode::decode(cur)?;
                Command::BmFilter {
                    rt,
                    sa,
                    direction,
                    enabled: Decode::decode(cur)?,
                }
            }
            C::BmActivityRead => {
                let (rt, sa, direction) = Decode::decode(cur)?;
                Command::BmActivity { rt, sa, direction }
            }
            C::BmTotalsRead => Command::BmTotals,
            C::BmStackPtrRead => Command::BmStackPointer,
            C::BmStackEntryRead => Command::BmReadRecord(Decode::decode(cur)?),
            C::BmStackEntryFind => {
                let (mask, value) = Decode::decode(cur)?;
                Command::BmFindEntry { mask, value }
            }
            C::RtIni => {
                let (rt, config) = Decode::decode(cur)?;
                Command::RtInit { rt, config }
            }
            C::RtSaBind => {
                let (rt, sa, direction) = Decode::decode(cur)?;
                Command::RtBind {
                    rt,
                    sa,
                    direction,
                    hid: Decode::decode(cur)?,
                }
            }
            C::RtStatusRead => Command::RtStatus(Decode::decode(cur)?),
            C::RtSaStatusRead => {
                let (rt, sa, direction) = Decode::decode(cur)?;
                Command::RtSaStatus { rt, sa, direction }
            }
            C::RtTotalsRead => Command::RtTotals,
        };
        cur.finish()?;
        Ok(command)
    }
}

/// Output fields of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// No output
    Done,
    /// Descriptor address of a defined transfer
    Address(u32),
    /// Transfer definition
    Transfer(Transfer),
    /// Transfer counters
    TransferStatus(TransferStatus),
    /// Raw 32-bit words
    Words(Vec<u32>),
    /// Buffer header
    Header(HeaderInfo),
    /// Data buffer words
    Data(Vec<u16>),
    /// Status queue entries
    StatusQueue(Vec<StatusEntry>),
    /// Events as (kind, transfer id, time tag)
    Events(Vec<(u8, u16, u32)>),
    /// Bus controller program entry
    Program(ProgramStart),
    /// Bus controller status
    BcStatus(BcStatus),
    /// Bus controller state after a run
    State(BcState),
    /// Compiled table
    Compiled(CompiledTable),
    /// BITE result
    Bite(BiteReport),
    /// Endpoint activity
    Activity(Activity),
    /// Monitor totals
    MonitorTotals(MonitorTotals),
    /// Ring pointers
    StackPointers(StackPointers),
    /// One raw ring entry
    Entry(u32),
    /// Search result
    Found(Option<u32>),
    /// Terminal status
    RtStatus(RtStatus),
    /// Terminal counters
    RtCounters(RtCounters),
}

impl Reply {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Done => {}
            Reply::Address(a) | Reply::Entry(a) => a.encode(out),
            Reply::Transfer(t) => t.encode(out),
            Reply::TransferStatus(s) => s.encode(out),
            Reply::Words(w) => w.encode(out),
            Reply::Header(h) => h.encode(out),
            Reply::Data(d) => d.encode(out),
            Reply::StatusQueue(q) => q.encode(out),
            Reply::Events(e) => e.encode(out),
            Reply::Program(p) => p.encode(out),
            Reply::BcStatus(s) => s.encode(out),
            Reply::State(s) => s.encode(out),
            Reply::Compiled(c) => c.encode(out),
            Reply::Bite(b) => b.encode(out),
            Reply::Activity(a) => a.encode(out),
            Reply::MonitorTotals(t) => t.encode(out),
            Reply::StackPointers(p) => p.encode(out),
            Reply::Found(f) => f.encode(out),
            Reply::RtStatus(s) => s.encode(out),
            Reply::RtCounters(c) => c.encode(out),
        }
    }

    fn decode(id: CommandId, cur: &mut Cursor<'_>) -> Result<Self> {
        use CommandId as C;
        let d = cur;
        Ok(match id {
            C::Bite => Reply::Bite(Decode::decode(d)?),
            C::RunUntilHalt => Reply::State(Decode::decode(d)?),
            C::BcXferDef => Reply::Address(Decode::decode(d)?),
            C::BcXferDefGet => Reply::Transfer(Decode::decode(d)?),
            C::BcXferRead => Reply::TransferStatus(Decode::decode(d)?),
            C::BcXferDescGet => Reply::Words(Decode::decode(d)?),
            C::BcBhDef | C::BcBhRead | C::BufBhModify => Reply::Header(Decode::decode(d)?),
            C::BufRead => Reply::Data(Decode::decode(d)?),
            C::BufStatusQueueRead => Reply::StatusQueue(Decode::decode(d)?),
            C::BufEventsRead => Reply::Events(Decode::decode(d)?),
            C::BcStart => Reply::Program(Decode::decode(d)?),
            C::BcStatusRead => Reply::BcStatus(Decode::decode(d)?),
            C::BcInstrTblGen => Reply::Compiled(Decode::decode(d)?),
            C::BmActivityRead => Reply::Activity(Decode::decode(d)?),
            C::BmTotalsRead => Reply::MonitorTotals(Decode::decode(d)?),
            C::BmStackPtrRead => Reply::StackPointers(Decode::decode(d)?),
            C::BmStackEntryRead => Reply::Entry(Decode::decode(d)?),
            C::BmStackEntryFind => Reply::Found(Decode::decode(d)?),
            C::RtStatusRead => Reply::RtStatus(Decode::decode(d)?),
            C::RtSaStatusRead | C::RtTotalsRead => Reply::RtCounters(Decode::decode(d)?),
            _ => Reply::Done,
        })
    }
}

/// Run one decoded command against a bus interface
pub fn execute<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, command: Command) -> Result<Reply> {
    Ok(match command {
        Command::Reset => {
            biu.reset()?;
            Reply::Done
        }
        Command::BoardEnable => {
            biu.board_enable()?;
            Reply::Done
        }
        Command::Bite(selection) => Reply::Bite(run_bite(biu, selection)?),
        Command::SetResponseTimeout(qus) => {
            biu.set_response_timeout(qus)?;
            Reply::Done
        }
        Command::RaiseTrigger(source) => {
            biu.raise_trigger(source);
            Reply::Done
        }
        Command::Run(us) => {
            biu.run_for(us)?;
            Reply::Done
        }
        Command::RunUntilHalt(us) => Reply::State(biu.run_until_halt(us)?),
        Command::DefineTransfer(t) => Reply::Address(biu.define_transfer(t)?),
        Command::ReadTransfer(xid) => Reply::Transfer(biu.read_transfer(xid)?),
        Command::SetErrorInjection(xid, error) => {
            biu.set_error_injection(xid, error)?;
            Reply::Done
        }
        Command::TransferStatus(xid) => Reply::TransferStatus(biu.transfer_status(xid)?),
        Command::DescriptorWords(xid) => Reply::Words(biu.descriptor_words(xid)?.to_vec()),
        Command::DefineHeader(spec) => Reply::Header(biu.define_header(spec)?),
        Command::ReadHeader(hid) => Reply::Header(biu.read_header(hid)?),
        Command::ModifyHeader {
            hid,
            queue_size,
            queue_mode,
        } => Reply::Header(biu.modify_header(hid, queue_size, queue_mode)?),
        Command::WriteBuffer { bid, words } => {
            biu.write_buffer(bid, &words)?;
            Reply::Done
        }
        Command::ReadBuffer { bid, count } => Reply::Data(biu.read_buffer(bid, count as usize)?),
        Command::ReadStatusQueue { hid, clear } => {
            Reply::StatusQueue(biu.read_status_queue(hid, clear)?)
        }
        Command::ReadEvents(hid) => Reply::Events(biu.read_events(hid)?),
        Command::ClearOverflow(hid) => {
            biu.clear_overflow(hid)?;
            Reply::Done
        }
        Command::DefineMinorFrame { id, instructions } => {
            biu.define_minor_frame(id, &instructions)?;
            Reply::Done
        }
        Command::DefineMajorFrame(ids) => {
            biu.define_major_frame(&ids)?;
            Reply::Done
        }
        Command::BcStart {
            mode,
            cycles,
            frame_time_us,
        } => Reply::Program(biu.bc_start(mode, cycles, frame_time_us)?),
        Command::BcHalt => {
            biu.bc_halt();
            Reply::Done
        }
        Command::BcStatus => Reply::BcStatus(biu.bc_status()?),
        Command::CompileTable {
            mode,
            dest_offset,
            entries,
            words,
        } => Reply::Compiled(biu.compile_table(mode, dest_offset, &entries, &words)?),
        Command::DefineDytag { xid, specs } => {
            biu.define_dytag(xid, &specs)?;
            Reply::Done
        }
        Command::BmInit(config) => {
            biu.bm_init(config)?;
            Reply::Done
        }
        Command::BmStart => {
            biu.bm_start();
            Reply::Done
        }
        Command::BmHalt => {
            biu.bm_halt();
            Reply::Done
        }
        Command::BmFilter {
            rt,
            sa,
            direction,
            enabled,
        } => {
            biu.bm_set_filter(rt, sa, direction, enabled)?;
            Reply::Done
        }
        Command::BmActivity { rt, sa, direction } => {
            Reply::Activity(biu.bm_activity(rt, sa, direction)?)
        }
        Command::BmTotals => Reply::MonitorTotals(biu.bm_totals()),
        Command::BmStackPointer => Reply::StackPointers(biu.bm_stack_pointer()),
        Command::BmReadRecord(selector) => Reply::Entry(biu.bm_read_raw(selector)?),
        Command::BmFindEntry { mask, value } => Reply::Found(biu.bm_find_entry(mask, value)?),
        Command::RtInit { rt, config } => {
            biu.rt_init(rt, config)?;
            Reply::Done
        }
        Command::RtBind {
            rt,
            sa,
            direction,
            hid,
        } => {
            biu.rt_bind(rt, sa, direction, hid)?;
            Reply::Done
        }
        Command::RtStatus(rt) => Reply::RtStatus(biu.rt_status(rt)?),
        Command::RtSaStatus { rt, sa, direction } => {
            Reply::RtCounters(biu.rt_sa_status(rt, sa, direction)?)
        }
        Command::RtTotals => Reply::RtCounters(biu.rt_totals()),
    })
}

/// Decode, execute and acknowledge one command frame
pub fn handle<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, command_id: u32, input: &[u8]) -> Vec<u8> {
    let result = CommandId::try_from(command_id)
        .and_then(|id| Command::decode(id, input))
        .and_then(|command| {
            debug!("command 0x{:08X}: {:?}", command_id, command.id());
            execute(biu, command)
        });
    let mut ack = Vec::new();
    match result {
        Ok(reply) => {
            STATUS_OK.encode(&mut ack);
            reply.encode(&mut ack);
        }
        Err(e) => {
            warn!("command 0x{:08X} failed: {}", command_id, e);
            e.status_code().encode(&mut ack);
            e.to_string().encode(&mut ack);
        }
    }
    ack
}

/// Parse an acknowledge frame for a command
pub fn decode_ack(id: CommandId, ack: &[u8]) -> Result<Reply> {
    let malformed = |e: BiuError| BiuError::Transport(TransportError::Malformed(e.to_string()));
    let cur = &mut Cursor::new(ack);
    let status = u32::decode(cur).map_err(malformed)?;
    if status != STATUS_OK {
        let message = String::decode(cur).map_err(malformed)?;
        return Err(BiuError::Device {
            code: status,
            message,
        });
    }
    let reply = Reply::decode(id, cur).map_err(malformed)?;
    cur.finish().map_err(malformed)?;
    Ok(reply)
}

/// Issues commands over a transport
#[derive(Debug)]
pub struct Client<T: Transport> {
    transport: T,
}

impl<T: Transport> Client<T> {
    /// Wrap a transport
    pub fn new(transport: T) -> Self {
        Client { transport }
    }

    /// Send a command and decode its acknowledge
    pub fn call(&mut self, command: &Command) -> Result<Reply> {
        let id = command.id();
        let ack = self.transport.send(id as u32, &command.encode())?;
        decode_ack(id, &ack)
    }

    /// The transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give back the transport
    pub fn into_inner(self) -> T {
        self.transport
    }
}

/// In-process transport that hands frames straight to a bus interface
#[derive(Debug)]
pub struct Loopback<M: DeviceMemory = crate::memory::SimMemory> {
    biu: BusInterfaceUnit<M>,
}

impl<M: DeviceMemory> Loopback<M> {
    /// Serve commands from `biu`
    pub fn new(biu: BusInterfaceUnit<M>) -> Self {
        Loopback { biu }
    }

    /// The served interface
    pub fn biu(&self) -> &BusInterfaceUnit<M> {
        &self.biu
    }

    /// The served interface, mutably
    pub fn biu_mut(&mut self) -> &mut BusInterfaceUnit<M> {
        &mut self.biu
    }
}

impl<M: DeviceMemory> Transport for Loopback<M> {
    fn send(&mut self, command_id: u32, input: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        Ok(handle(&mut self.biu, command_id, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiuConfig;

    fn client() -> Client<Loopback> {
        Client::new(Loopback::new(BusInterfaceUnit::new(BiuConfig::default()).unwrap()))
    }

    struct Unplugged;

    impl Transport for Unplugged {
        fn send(&mut self, _: u32, _: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
            Err(TransportError::Disconnected("cable removed".to_string()))
        }
    }

    #[test]
    fn test_command_ids_are_unique() {
        for (i, a) in CommandId::ALL.iter().enumerate() {
            assert!(CommandId::ALL[i + 1..].iter().all(|b| *a as u32 != *b as u32));
            assert_eq!(CommandId::try_from(*a as u32).unwrap(), *a);
        }
    }

    #[test]
    fn test_transfer_input_layout() -> Result<()> {
        let mut t = Transfer::rt_to_rt(7, 3, (1, 2), (4, 5), 6);
        t.error = ErrorInjection {
            kind: ErrorKind::ManchesterHigh,
            word_pos: 2,
            bit_pos: 9,
            bit_count: 0,
        };
        let command = Command::DefineTransfer(t.clone());
        let bytes = command.encode();
        assert_eq!(&bytes[..4], &[7, 0, 3, 0]);
        assert_eq!(Command::decode(CommandId::BcXferDef, &bytes)?, command);
        Ok(())
    }

    #[test]
    fn test_scenario_over_loopback() -> Result<()> {
        let mut c = client();
        c.call(&Command::DefineHeader(HeaderSpec::new(1, 1, QueueSize::Two, BufferQueueMode::Cyclic)))?;
        let addr = c.call(&Command::DefineTransfer(Transfer::bc_to_rt(1, 1, 31, 1, 2)))?;
        assert!(matches!(addr, Reply::Address(a) if a == c.transport().biu().layout().descriptor_addr(1)));
        c.call(&Command::WriteBuffer {
            bid: 1,
            words: vec![0x1111, 0x2222],
        })?;
        c.call(&Command::DefineMinorFrame {
            id: 1,
            instructions: vec![FrameInstruction::Transfer(1)],
        })?;
        c.call(&Command::DefineMajorFrame(vec![1]))?;
        c.call(&Command::BcStart {
            mode: StartMode::Immediately,
            cycles: 2,
            frame_time_us: Some(1_000),
        })?;
        assert_eq!(c.call(&Command::RunUntilHalt(10_000))?, Reply::State(BcState::Halted));
        assert_eq!(
            c.call(&Command::TransferStatus(1))?,
            Reply::TransferStatus(TransferStatus {
                msg_count: 2,
                err_count: 0
            })
        );
        let Reply::StatusQueue(queue) = c.call(&Command::ReadStatusQueue { hid: 1, clear: false })? else {
            panic!("wrong reply kind");
        };
        assert_eq!(queue.len(), 1);
        Ok(())
    }

    #[test]
    fn test_parameter_error_is_acknowledged() {
        let mut c = client();
        let err = c
            .call(&Command::RtBind {
                rt: 3,
                sa: 31,
                direction: Direction::Receive,
                hid: None,
            })
            .unwrap_err();
        assert!(matches!(err, BiuError::Device { .. }));
        let err = c
            .call(&Command::DefineHeader(HeaderSpec::new(0, 1, QueueSize::One, BufferQueueMode::Cyclic)))
            .unwrap_err();
        assert_eq!(err.status_code(), 0x101);
    }

    #[test]
    fn test_compile_reply_carries_labels() -> Result<()> {
        let mut c = client();
        let entries = vec![
            TableEntry::new(Opcode::Jump, 5, 0),
            TableEntry::new(Opcode::Halt, 0, 0).labelled(5),
        ];
        let Reply::Compiled(table) = c.call(&Command::CompileTable {
            mode: CompileMode::Convert,
            dest_offset: 0,
            entries,
            words: vec![],
        })?
        else {
            panic!("wrong reply kind");
        };
        let base = c.transport().biu().layout().instr_base;
        assert_eq!(table.label_address(5), Some(base + 4));
        Ok(())
    }

    #[test]
    fn test_bad_frames_are_rejected() -> Result<()> {
        let mut loopback = Loopback::new(BusInterfaceUnit::new(BiuConfig::default())?);
        let ack = loopback.send(0x0900_0000, &[]).unwrap();
        assert_eq!(&ack[..4], &0x701u32.to_le_bytes());
        let ack = loopback.send(CommandId::BcXferRead as u32, &[1]).unwrap();
        assert_eq!(&ack[..4], &0x701u32.to_le_bytes());
        let ack = loopback.send(CommandId::BcHalt as u32, &[0]).unwrap();
        assert_eq!(&ack[..4], &0x701u32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn test_transport_failure_is_not_a_status() {
        let mut c = Client::new(Unplugged);
        let err = c.call(&Command::BcStatus).unwrap_err();
        assert!(matches!(err, BiuError::Transport(TransportError::Disconnected(_))));
    }

    #[test]
    fn test_truncated_ack_is_malformed() {
        let err = decode_ack(CommandId::BcXferRead, &[0, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, BiuError::Transport(TransportError::Malformed(_))));
    }

    #[test]
    fn test_monitor_commands() -> Result<()> {
        let mut c = client();
        c.call(&Command::BmInit(MonitorConfig {
            capture_mode: CaptureMode::All,
            start_trigger: Trigger::ErrorCondition { mask: 0x0001 },
            stop_trigger: None,
            pre_trigger_entries: 4,
            capture_entries: 0,
        }))?;
        c.call(&Command::BmStart)?;
        let Reply::StackPointers(sp) = c.call(&Command::BmStackPointer)? else {
            panic!("wrong reply kind");
        };
        assert_eq!(sp.state, MonitorState::Armed);
        assert_eq!(c.call(&Command::BmFindEntry { mask: 0xF000_0000, value: 0x1000_0000 })?, Reply::Found(None));
        Ok(())
    }
}
