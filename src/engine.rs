//! Bus interface engine
//!
//! [`BusInterfaceUnit`] owns the device memory image and every definition
//! store, and runs a deterministic model of the firmware: the bus controller
//! executes compiled instruction words from memory, simulated remote
//! terminals answer, and the bus monitor records the resulting traffic.
//!
//! Time is kept in engine ticks of 0.25 µs. A data word takes 20 µs on the
//! bus; every executed instruction costs one tick so that a program can never
//! stall the clock.

use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::buffer::{
    BufferManager, BufferQueueMode, HeaderInfo, HeaderSpec, QueueSize, StatusEntry,
};
use crate::config::{BiuConfig, MemoryLayout};
use crate::core::{Bus, Direction};
use crate::dytag::{DytagGenerator, DytagSpec};
use crate::error::{BiuError, Result};
use crate::frame::{BcState, FrameInstruction, ProgramStart, Scheduler, StartMode};
use crate::instr::{CompileMode, CompiledTable, Compiler, InstructionWord, Opcode, TableEntry};
use crate::memory::{DeviceMemory, SimMemory};
use crate::monitor::{
    flags, Activity, BusEvent, BusMessage, BusMonitor, BusWord, MonitorConfig, MonitorRecord,
    MonitorSignal, MonitorTotals, RecordSelector, StackPointers, WordKind,
};
use crate::rt::{RtConfig, RtCounters, RtSet, RtStatus};
use crate::timetag::{TimeTag, TICKS_PER_MICRO};
use crate::transfer::{
    ErrorInjection, ErrorKind, GapMode, HaltControl, InterruptControl, ResponseControl,
    ServiceRequest, Transfer, TransferStatus, TransferStore, TransferType,
};
use crate::word::{CommandWord, ModeCode, StatusWord};

/// Control block word offsets
pub mod cb {
    /// Enable requests written by the host
    pub const SYSTEM_CONTROL: u32 = 0x00;
    /// Enable acknowledgements written by the firmware
    pub const SYSTEM_STATUS: u32 = 0x04;
    /// BC messages sent
    pub const BC_MSG_COUNT: u32 = 0x10;
    /// BC messages that ended in error
    pub const BC_ERR_COUNT: u32 = 0x14;
    /// Strobe pulses
    pub const BC_STROBES: u32 = 0x18;
    /// Minor frames completed
    pub const BC_MINOR_FRAMES: u32 = 0x1C;
    /// Interrupt events raised by transfers
    pub const BC_INTERRUPTS: u32 = 0x20;
    /// Program counter
    pub const BC_PC: u32 = 0x24;
    /// No-response timeout in 0.25 µs units
    pub const RESPONSE_TIMEOUT: u32 = 0x28;
}

/// Event queue entry kinds
pub mod event {
    /// Transfer completed
    pub const END: u8 = 1;
    /// Transfer ended in error
    pub const ERROR: u8 = 2;
    /// Status word exception
    pub const EXCEPTION: u8 = 3;
    /// Service request bit seen
    pub const SERVICE_REQUEST: u8 = 4;
}

const WORD_TICKS: u64 = 20 * TICKS_PER_MICRO;
const MIN_GAP_TICKS: u64 = 2 * TICKS_PER_MICRO;
const INJECTED_GAP_TICKS: u64 = 4 * TICKS_PER_MICRO;
const INSTRUCTION_TICKS: u64 = 1;
const MAX_CALL_DEPTH: usize = 16;

/// Board functions brought up by the enable handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BoardFunction {
    /// Interface core
    Biu,
    /// Bus monitor
    Monitor,
    /// Bus controller
    Controller,
    /// Remote terminals
    Terminals,
}

impl BoardFunction {
    /// Order in which the handshake enables functions
    pub const SEQUENCE: [BoardFunction; 4] = [
        BoardFunction::Biu,
        BoardFunction::Monitor,
        BoardFunction::Controller,
        BoardFunction::Terminals,
    ];

    /// Bit in the system control and status words
    pub fn bit(&self) -> u32 {
        match self {
            BoardFunction::Biu => 0x1,
            BoardFunction::Monitor => 0x2,
            BoardFunction::Controller => 0x4,
            BoardFunction::Terminals => 0x8,
        }
    }
}

/// Sources a `WTRG` instruction can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerSource {
    /// External trigger input
    External = 0,
    /// Mode code received by a terminal
    RtModeCode = 1,
    /// Hardware event line
    HardwareEvent = 2,
    /// Host software trigger
    Software = 3,
}

impl TriggerSource {
    /// Decode the 2-bit wait source
    pub fn from_raw(value: u8) -> Result<Self> {
        Ok(match value {
            0 => TriggerSource::External,
            1 => TriggerSource::RtModeCode,
            2 => TriggerSource::HardwareEvent,
            3 => TriggerSource::Software,
            _ => return Err(BiuError::param(1, "trigger", value)),
        })
    }
}

/// Bus controller status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BcStatus {
    /// Run state
    pub state: BcState,
    /// Messages sent
    pub msg_count: u32,
    /// Messages that ended in error
    pub err_count: u32,
    /// Strobe pulses
    pub strobes: u32,
    /// Minor frames completed
    pub minor_frames: u32,
    /// Interrupt events raised
    pub interrupts: u32,
    /// Program counter
    pub pc: u32,
}

#[derive(Debug, Clone, Default)]
struct BcRegisters {
    pc: u32,
    stack: Vec<u32>,
    counter: u32,
    frame_ticks: u64,
    frame_start: u64,
    last_error: bool,
}

fn word_flags(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::CommandSync | ErrorKind::DataSync => flags::ISYNC,
        ErrorKind::Parity => flags::PARITY,
        ErrorKind::ManchesterHigh
        | ErrorKind::ManchesterLow
        | ErrorKind::ZeroCrossNegative
        | ErrorKind::ZeroCrossPositive => flags::MANCH,
        ErrorKind::Gap => flags::IWGAP,
        ErrorKind::BitCountHigh => flags::HBIT,
        ErrorKind::BitCountLow => flags::LBIT,
        _ => 0,
    }
}

/// Words of one message as they are put on the bus
struct Wire {
    injection: ErrorInjection,
    events: Vec<BusEvent>,
    ticks: u64,
    flags: u16,
    next_gap: u64,
}

impl Wire {
    fn new(injection: ErrorInjection, gap: u64) -> Self {
        Wire {
            injection,
            events: Vec::new(),
            ticks: 0,
            flags: 0,
            next_gap: gap,
        }
    }

    fn send(&mut self, kind: WordKind, value: u16, error: u16) {
        let gap = std::mem::take(&mut self.next_gap);
        self.ticks += gap + WORD_TICKS;
        self.flags |= error;
        self.events.push(BusEvent::Word(BusWord {
            kind,
            value,
            gap: gap.min(0x1FF) as u16,
            error,
        }));
    }

    /// A word sent by the bus controller; false if the receiver rejects it
    fn send_bc(&mut self, kind: WordKind, value: u16, word_pos: u8) -> bool {
        let inj = self.injection;
        let hit = match inj.kind {
            ErrorKind::CommandSync => kind == WordKind::Command,
            k if word_flags(k) != 0 => kind != WordKind::Command2 && inj.word_pos == word_pos,
            _ => false,
        };
        if !hit {
            self.send(kind, value, 0);
            return true;
        }
        if inj.kind == ErrorKind::Gap {
            self.next_gap += INJECTED_GAP_TICKS;
        }
        let value = if inj.kind.needs_bit_position() && (4..=19).contains(&inj.bit_pos) {
            value ^ (1 << (19 - inj.bit_pos))
        } else {
            value
        };
        self.send(kind, value, word_flags(inj.kind));
        false
    }

    fn respond(&mut self, value: u16, response_qus: u16) {
        self.next_gap = response_qus as u64;
        self.send(WordKind::Status, value, 0);
    }

    fn data(&mut self, words: &[u16]) {
        for w in words {
            self.send(WordKind::Data, *w, 0);
        }
    }

    fn error(&mut self, flag: u16) {
        self.flags |= flag;
        self.events.push(BusEvent::Error(flag));
    }

    fn no_response(&mut self, timeout_qus: u16, expected: bool) {
        self.ticks += timeout_qus as u64;
        if expected {
            self.error(flags::NRESP);
        }
    }
}

#[derive(Debug, Default)]
struct Responses {
    status1: u16,
    status2: u16,
    received: Option<Vec<u16>>,
}

/// One bus interface: device memory, definitions and the engine model
#[derive(Debug)]
pub struct BusInterfaceUnit<M: DeviceMemory = SimMemory> {
    config: BiuConfig,
    layout: MemoryLayout,
    mem: M,
    transfers: TransferStore,
    buffers: BufferManager,
    scheduler: Scheduler,
    compiler: Compiler,
    dytags: DytagGenerator,
    monitor: BusMonitor,
    rts: RtSet,
    clock: u64,
    regs: BcRegisters,
    triggers: [u32; 4],
    polls: u32,
    response_timeout_qus: u16,
}

impl BusInterfaceUnit<SimMemory> {
    /// Create an interface backed by an in-process memory image
    pub fn new(config: BiuConfig) -> Result<Self> {
        config.validate()?;
        let mem = SimMemory::new(config.layout().total);
        BusInterfaceUnit::with_memory(config, mem)
    }
}

impl<M: DeviceMemory> BusInterfaceUnit<M> {
    /// Create an interface over caller-provided device memory
    pub fn with_memory(config: BiuConfig, mem: M) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        if mem.size() < layout.total {
            return Err(BiuError::config(format!(
                "device memory of {} bytes cannot hold layout of {} bytes",
                mem.size(),
                layout.total
            )));
        }
        let mut biu = BusInterfaceUnit {
            transfers: TransferStore::new(layout, config.max_xfer_id),
            buffers: BufferManager::new(layout),
            scheduler: Scheduler::new(layout),
            compiler: Compiler::new(&layout, config.label_base),
            dytags: DytagGenerator::new(),
            monitor: BusMonitor::new(&layout),
            rts: RtSet::new(),
            clock: 0,
            regs: BcRegisters::default(),
            triggers: [0; 4],
            polls: 0,
            response_timeout_qus: config.response_timeout_qus,
            config,
            layout,
            mem,
        };
        biu.mem
            .write_u32(layout.cb_base + cb::RESPONSE_TIMEOUT, biu.response_timeout_qus as u32)?;
        Ok(biu)
    }

    /// Clear device memory and every definition; the clock keeps running
    pub fn reset(&mut self) -> Result<()> {
        let layout = self.layout;
        self.mem.fill(0, layout.total / 4, 0)?;
        self.transfers = TransferStore::new(layout, self.config.max_xfer_id);
        self.buffers = BufferManager::new(layout);
        self.scheduler = Scheduler::new(layout);
        self.dytags = DytagGenerator::new();
        self.monitor = BusMonitor::new(&layout);
        self.rts = RtSet::new();
        self.regs = BcRegisters::default();
        self.triggers = [0; 4];
        self.polls = 0;
        self.response_timeout_qus = self.config.response_timeout_qus;
        self.mem
            .write_u32(layout.cb_base + cb::RESPONSE_TIMEOUT, self.response_timeout_qus as u32)?;
        info!("bus interface reset");
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &BiuConfig {
        &self.config
    }

    /// Device memory map
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Device memory
    pub fn memory(&self) -> &M {
        &self.mem
    }

    /// Mutable device memory
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Engine clock in 0.25 µs ticks
    pub fn now_ticks(&self) -> u64 {
        self.clock
    }

    /// Engine clock as a time tag
    pub fn time_tag(&self) -> TimeTag {
        TimeTag::from_ticks(self.clock)
    }

    fn cb_read(&self, offset: u32) -> Result<u32> {
        self.mem.read_u32(self.layout.cb_base + offset)
    }

    fn cb_write(&mut self, offset: u32, value: u32) -> Result<()> {
        self.mem.write_u32(self.layout.cb_base + offset, value)
    }

    fn bump(&mut self, offset: u32) -> Result<()> {
        let value = self.cb_read(offset)?;
        self.cb_write(offset, value.wrapping_add(1))
    }

    /// Ask the firmware to enable a function
    pub fn request_enable(&mut self, function: BoardFunction) -> Result<()> {
        let ctrl = self.cb_read(cb::SYSTEM_CONTROL)?;
        self.cb_write(cb::SYSTEM_CONTROL, ctrl | function.bit())?;
        self.polls = 0;
        debug!("enable requested for {:?}", function);
        Ok(())
    }

    /// Read the system status word
    ///
    /// Requested functions report ready after the configured number of polls.
    pub fn poll_status(&mut self) -> Result<u32> {
        let requested = self.cb_read(cb::SYSTEM_CONTROL)?;
        let mut status = self.cb_read(cb::SYSTEM_STATUS)?;
        if requested & !status != 0 {
            self.polls = self.polls.saturating_add(1);
            if self.polls >= self.config.board_enable_latency_polls {
                status |= requested;
                self.cb_write(cb::SYSTEM_STATUS, status)?;
            }
        }
        Ok(status)
    }

    /// Poll until every bit of `mask` is set or the deadline passes
    pub fn wait_for_status(&mut self, mask: u32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_status()? & mask == mask {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BiuError::timeout(format!("system status 0x{:X}", mask)));
            }
            std::thread::yield_now();
        }
    }

    /// Enable the interface, monitor, controller and terminals in sequence
    pub fn board_enable(&mut self) -> Result<()> {
        let timeout = self.config.board_enable_timeout();
        for function in BoardFunction::SEQUENCE {
            self.request_enable(function)?;
            self.wait_for_status(function.bit(), timeout)?;
            info!("{:?} enabled", function);
        }
        Ok(())
    }

    /// Define a transfer; returns its descriptor address
    pub fn define_transfer(&mut self, transfer: Transfer) -> Result<u32> {
        self.transfers.define(&mut self.mem, &self.buffers, transfer)
    }

    /// Transfer as last defined
    pub fn read_transfer(&self, xid: u16) -> Result<Transfer> {
        self.transfers.read(xid).cloned()
    }

    /// Replace only the error injection of a transfer
    pub fn set_error_injection(&mut self, xid: u16, error: ErrorInjection) -> Result<()> {
        self.transfers.set_error_injection(&mut self.mem, xid, error)
    }

    /// Message and error counters of a transfer
    pub fn transfer_status(&self, xid: u16) -> Result<TransferStatus> {
        self.transfers.status(&self.mem, xid)
    }

    /// Encoded descriptor words of a transfer
    pub fn descriptor_words(&self, xid: u16) -> Result<[u32; 8]> {
        self.transfers.descriptor_words(&self.mem, xid)
    }

    /// Define a buffer header
    pub fn define_header(&mut self, spec: HeaderSpec) -> Result<HeaderInfo> {
        self.buffers.define_header(&mut self.mem, spec)
    }

    /// Addresses and buffer count of a header
    pub fn read_header(&self, hid: u16) -> Result<HeaderInfo> {
        self.buffers.read_header(&self.mem, hid)
    }

    /// Resize a header in place
    pub fn modify_header(
        &mut self,
        hid: u16,
        queue_size: QueueSize,
        queue_mode: BufferQueueMode,
    ) -> Result<HeaderInfo> {
        self.buffers.modify(&mut self.mem, hid, queue_size, queue_mode)
    }

    /// Point a header at a specific buffer
    pub fn set_buffer_index(&mut self, hid: u16, index: u8) -> Result<()> {
        self.buffers.set_index(&mut self.mem, hid, index)
    }

    /// Write data words into a buffer
    pub fn write_buffer(&mut self, bid: u16, words: &[u16]) -> Result<()> {
        self.buffers.write_buffer(&mut self.mem, bid, words)
    }

    /// Read data words from a buffer
    pub fn read_buffer(&self, bid: u16, count: usize) -> Result<Vec<u16>> {
        self.buffers.read_buffer(&self.mem, bid, count)
    }

    /// Status queue entries of a header, oldest first
    pub fn read_status_queue(&mut self, hid: u16, clear: bool) -> Result<Vec<StatusEntry>> {
        self.buffers.read_status_queue(&mut self.mem, hid, clear)
    }

    /// Sticky status queue overflow flag
    pub fn status_overflow(&self, hid: u16) -> Result<bool> {
        self.buffers.status_overflow(&self.mem, hid)
    }

    /// Clear the sticky overflow flags of a header
    pub fn clear_overflow(&mut self, hid: u16) -> Result<()> {
        self.buffers.clear_overflow(&mut self.mem, hid)
    }

    /// Pending interrupt events of a header as (kind, transfer id, time tag)
    pub fn read_events(&mut self, hid: u16) -> Result<Vec<(u8, u16, u32)>> {
        self.buffers.read_events(&mut self.mem, hid)
    }

    /// Define a minor frame
    pub fn define_minor_frame(&mut self, id: u8, instructions: &[FrameInstruction]) -> Result<()> {
        self.scheduler.define_minor_frame(&self.transfers, id, instructions)
    }

    /// Define the major frame
    pub fn define_major_frame(&mut self, ids: &[u8]) -> Result<()> {
        self.scheduler.define_major_frame(ids)
    }

    /// Start the bus controller
    pub fn bc_start(
        &mut self,
        mode: StartMode,
        cycles: u32,
        frame_time_us: Option<u32>,
    ) -> Result<ProgramStart> {
        let start = self.scheduler.start(&mut self.mem, mode, cycles, frame_time_us)?;
        self.regs = BcRegisters {
            pc: start.entry,
            stack: Vec::new(),
            counter: cycles,
            frame_ticks: start.frame_time_us as u64 * TICKS_PER_MICRO,
            frame_start: self.clock,
            last_error: false,
        };
        self.cb_write(cb::BC_PC, start.entry)?;
        Ok(start)
    }

    /// Stop the bus controller at the next minor frame boundary
    pub fn bc_halt(&mut self) {
        self.scheduler.request_halt();
    }

    /// Bus controller counters and state
    pub fn bc_status(&self) -> Result<BcStatus> {
        Ok(BcStatus {
            state: self.scheduler.state(),
            msg_count: self.cb_read(cb::BC_MSG_COUNT)?,
            err_count: self.cb_read(cb::BC_ERR_COUNT)?,
            strobes: self.cb_read(cb::BC_STROBES)?,
            minor_frames: self.cb_read(cb::BC_MINOR_FRAMES)?,
            interrupts: self.cb_read(cb::BC_INTERRUPTS)?,
            pc: self.cb_read(cb::BC_PC)?,
        })
    }

    /// Set the bus controller no-response timeout (0.25 µs units)
    pub fn set_response_timeout(&mut self, timeout_qus: u16) -> Result<()> {
        if timeout_qus == 0 {
            return Err(BiuError::param(1, "timeout", timeout_qus));
        }
        self.response_timeout_qus = timeout_qus;
        self.cb_write(cb::RESPONSE_TIMEOUT, timeout_qus as u32)
    }

    /// Run one instruction-table compile request against the user area
    pub fn compile_table(
        &mut self,
        mode: CompileMode,
        dest_offset: u32,
        entries: &[TableEntry],
        words: &[u32],
    ) -> Result<CompiledTable> {
        self.compiler.generate(&mut self.mem, mode, dest_offset, entries, words)
    }

    /// Attach dynamic tag slots to a transfer
    pub fn define_dytag(&mut self, xid: u16, specs: &[DytagSpec]) -> Result<()> {
        self.dytags.define(&mut self.mem, &mut self.transfers, xid, specs)
    }

    /// Initialise the monitor; resets the ring and activity counters
    pub fn bm_init(&mut self, config: MonitorConfig) -> Result<()> {
        self.monitor.initialize(&mut self.mem, config)
    }

    /// Start the monitor
    pub fn bm_start(&mut self) {
        self.monitor.start();
    }

    /// Halt the monitor
    pub fn bm_halt(&mut self) {
        self.monitor.halt();
    }

    /// Enable or disable an endpoint in the monitor filter table
    pub fn bm_set_filter(&mut self, rt: u8, sa: u8, direction: Direction, enabled: bool) -> Result<()> {
        self.monitor.set_filter(rt, sa, direction, enabled)
    }

    /// Activity of one endpoint
    pub fn bm_activity(&self, rt: u8, sa: u8, direction: Direction) -> Result<Activity> {
        self.monitor.read_activity(rt, sa, direction)
    }

    /// Monitor totals
    pub fn bm_totals(&self) -> MonitorTotals {
        self.monitor.totals()
    }

    /// Monitor ring pointers
    pub fn bm_stack_pointer(&self) -> StackPointers {
        self.monitor.read_stack_pointer()
    }

    /// Decoded monitor entry
    pub fn bm_read_record(&self, selector: RecordSelector) -> Result<MonitorRecord> {
        self.monitor.read_record(&self.mem, selector)
    }

    /// Raw monitor entry
    pub fn bm_read_raw(&self, selector: RecordSelector) -> Result<u32> {
        self.monitor.read_raw(&self.mem, selector)
    }

    /// Retained monitor entries, oldest first
    pub fn bm_entries(&self) -> Result<Vec<u32>> {
        self.monitor.entries(&self.mem)
    }

    /// First retained entry matching `value` under `mask`
    pub fn bm_find_entry(&self, mask: u32, value: u32) -> Result<Option<u32>> {
        self.monitor.find_entry(&self.mem, mask, value)
    }

    /// Initialise a simulated terminal
    pub fn rt_init(&mut self, rt: u8, config: RtConfig) -> Result<()> {
        self.rts.init(rt, config)
    }

    /// Bind a terminal subaddress to a buffer header (`None` unbinds)
    pub fn rt_bind(&mut self, rt: u8, sa: u8, direction: Direction, hid: Option<u16>) -> Result<()> {
        if let Some(hid) = hid {
            if !self.buffers.contains(hid) {
                return Err(BiuError::UndefinedHeader(hid));
            }
        }
        self.rts.bind(rt, sa, direction, hid)
    }

    /// Terminal snapshot
    pub fn rt_status(&self, rt: u8) -> Result<RtStatus> {
        Ok(self.rts.get(rt)?.status())
    }

    /// Counters of one terminal subaddress
    pub fn rt_sa_status(&self, rt: u8, sa: u8, direction: Direction) -> Result<RtCounters> {
        self.rts.sa_status(rt, sa, direction)
    }

    /// Counters summed over all terminals
    pub fn rt_totals(&self) -> RtCounters {
        self.rts.totals()
    }

    /// Raise a trigger input
    pub fn raise_trigger(&mut self, source: TriggerSource) {
        self.triggers[source as usize] = self.triggers[source as usize].saturating_add(1);
        match source {
            TriggerSource::External => self.monitor.signal(MonitorSignal::External),
            TriggerSource::HardwareEvent => self.monitor.signal(MonitorSignal::HardwareEvent),
            _ => {}
        }
        debug!("trigger {:?} raised", source);
    }

    /// Advance the engine by `micros` microseconds of bus time
    pub fn run_for(&mut self, micros: u64) -> Result<()> {
        let deadline = self.clock + micros * TICKS_PER_MICRO;
        self.execute(deadline)?;
        self.clock = self.clock.max(deadline);
        Ok(())
    }

    /// Run until the bus controller halts or `limit_micros` have passed
    ///
    /// The clock stops at the halt instant; the returned state tells whether
    /// the limit was reached first.
    pub fn run_until_halt(&mut self, limit_micros: u64) -> Result<BcState> {
        let deadline = self.clock + limit_micros * TICKS_PER_MICRO;
        self.execute(deadline)?;
        if self.scheduler.state() == BcState::Running {
            self.clock = self.clock.max(deadline);
        }
        Ok(self.scheduler.state())
    }

    fn execute(&mut self, deadline: u64) -> Result<()> {
        while self.scheduler.state() == BcState::Running && self.clock < deadline {
            if !self.step(deadline)? {
                break;
            }
        }
        self.cb_write(cb::BC_PC, self.regs.pc)
    }

    fn stop(&mut self, reason: &str) {
        self.scheduler.mark_halted();
        info!("bus controller halted: {}", reason);
    }

    fn fault(&mut self, reason: String) {
        warn!("bus controller fault at 0x{:08X}: {}", self.regs.pc, reason);
        self.stop("fault");
    }

    /// Execute one instruction; false when the controller stopped or blocks
    fn step(&mut self, deadline: u64) -> Result<bool> {
        let pc = self.regs.pc;
        if self.regs.frame_ticks == 0 && self.scheduler.halt_pending() {
            self.stop("halt requested");
            return Ok(false);
        }
        if pc % 4 != 0 || pc as u64 + 4 > self.mem.size() as u64 {
            self.fault(format!("program counter 0x{:08X} outside memory", pc));
            return Ok(false);
        }
        let instr = InstructionWord(self.mem.read_u32(pc)?);
        let Some(op) = instr.op() else {
            self.fault(format!("unknown opcode 0x{:02X}", instr.opcode()));
            return Ok(false);
        };
        let operand = instr.operand();
        self.clock += INSTRUCTION_TICKS;
        let mut next = pc.wrapping_add(4);

        match op {
            Opcode::Xfer => {
                let Some(xid) = self.transfers.xid_at(operand) else {
                    self.fault(format!("no transfer at 0x{:08X}", operand));
                    return Ok(false);
                };
                if self.execute_transfer(xid)? {
                    self.regs.pc = next;
                    self.stop("halt condition of transfer");
                    return Ok(false);
                }
            }
            Opcode::EfexXfer => {
                warn!("enhanced transfer {} is not supported on this bus, skipped", operand);
            }
            Opcode::Call => {
                if self.regs.stack.len() >= MAX_CALL_DEPTH {
                    self.fault("call stack overflow".to_string());
                    return Ok(false);
                }
                self.regs.stack.push(next);
                next = operand;
            }
            Opcode::Ret => match self.regs.stack.pop() {
                Some(ret) => next = ret,
                None => {
                    self.stop("return from top level");
                    return Ok(false);
                }
            },
            Opcode::ReturnOnXferError => {
                if self.regs.last_error {
                    match self.regs.stack.pop() {
                        Some(ret) => next = ret,
                        None => {
                            self.stop("return from top level");
                            return Ok(false);
                        }
                    }
                }
            }
            Opcode::Jump => {
                if operand == 0 {
                    self.stop("end of program");
                    return Ok(false);
                }
                next = operand;
            }
            Opcode::Skip => {
                let count = operand as u16 as i16;
                let taken = match (operand >> 24) & 3 {
                    1 => self.regs.last_error,
                    2 => !self.regs.last_error,
                    _ => true,
                };
                if taken {
                    next = (pc as i64 + 4 + 4 * count as i64) as u32;
                }
            }
            Opcode::WaitTrigger => {
                if self.scheduler.halt_pending() {
                    self.stop("halt requested while waiting for trigger");
                    return Ok(false);
                }
                let source = (operand & 3) as usize;
                if self.triggers[source] == 0 {
                    self.clock = self.clock.max(deadline);
                    return Ok(false);
                }
                self.triggers[source] -= 1;
                self.regs.frame_start = self.clock;
                debug!("trigger source {} consumed", source);
            }
            Opcode::Strobe => self.bump(cb::BC_STROBES)?,
            Opcode::DecJumpZero => {
                self.regs.counter = self.regs.counter.saturating_sub(1);
                if self.regs.counter == 0 {
                    next = operand;
                }
            }
            Opcode::WaitMinorFrame => {
                if self.scheduler.halt_pending() {
                    self.regs.pc = next;
                    self.stop("halt at minor frame boundary");
                    return Ok(false);
                }
                if self.regs.frame_ticks > 0 {
                    let boundary = self.regs.frame_start + self.regs.frame_ticks;
                    if boundary > deadline {
                        self.clock = deadline;
                        return Ok(false);
                    }
                    if self.clock > boundary {
                        warn!(
                            "minor frame overrun by {} µs",
                            (self.clock - boundary) / TICKS_PER_MICRO
                        );
                        self.regs.frame_start = self.clock;
                    } else {
                        self.clock = boundary;
                        self.regs.frame_start = boundary;
                    }
                }
                self.bump(cb::BC_MINOR_FRAMES)?;
            }
            Opcode::Halt => {
                self.stop("HALT instruction");
                return Ok(false);
            }
            Opcode::Delay => self.clock += operand as u64 * TICKS_PER_MICRO,
            Opcode::Modify => {
                if let Err(e) = self.apply_modify(operand) {
                    self.fault(format!("modify descriptor at 0x{:08X}: {}", operand, e));
                    return Ok(false);
                }
            }
            Opcode::ChangeMinorFrameTime => {
                self.regs.frame_ticks = operand as u64 * TICKS_PER_MICRO;
                debug!("minor frame time changed to {} µs", operand);
            }
            Opcode::ResetMajorFrame => {
                self.regs.frame_start = self.clock;
                if operand & (1 << 24) != 0 {
                    self.cb_write(cb::BC_MINOR_FRAMES, 0)?;
                }
            }
        }
        self.regs.pc = next;
        Ok(true)
    }

    /// Modify descriptor: target address, AND mask, OR value
    fn apply_modify(&mut self, addr: u32) -> Result<()> {
        let mut desc = [0u32; 3];
        self.mem.read_block(addr, &mut desc)?;
        let [target, and_mask, or_value] = desc;
        let value = self.mem.read_u32(target)?;
        self.mem.write_u32(target, (value & and_mask) | or_value)
    }

    fn gap_ticks(transfer: &Transfer) -> u64 {
        let gap = match transfer.gap_mode {
            GapMode::Delay | GapMode::Standard => transfer.gap as u64,
            GapMode::Fast => 2 * transfer.gap as u64,
        };
        gap.max(MIN_GAP_TICKS)
    }

    /// Execute one transfer; returns whether its halt condition fired
    fn execute_transfer(&mut self, xid: u16) -> Result<bool> {
        let t = self.transfers.read(xid)?.clone();
        let bus = if t.error.kind == ErrorKind::AlternateBus {
            t.bus.alternate()
        } else {
            t.bus
        };
        let mut wire = Wire::new(t.error, Self::gap_ticks(&t));
        let start = self.clock + wire.next_gap;
        let tt = TimeTag::from_ticks(start).queue_word();
        let (buf_index, buf_addr) = self.buffers.active_buffer(&self.mem, t.hid)?;
        let (cw1, cw2) = t.command_words();

        let resp = match (t.kind, cw2) {
            (TransferType::RtToRt, Some(cw2)) => self.rt_to_rt(&t, cw1, cw2, bus, tt, &mut wire)?,
            (TransferType::RtToBc, _) => self.rt_to_bc(&t, cw1, bus, tt, &mut wire)?,
            _ => self.bc_to_rt(&t, cw1, buf_addr, bus, tt, &mut wire)?,
        };

        let error = wire.flags != 0;
        let status_bits = (resp.status1 | resp.status2) & 0x07FF;
        let exception = status_bits & t.status_mask != 0;
        if !error {
            if let Some(data) = &resp.received {
                for (i, w) in data.iter().enumerate() {
                    self.mem.write_u16(buf_addr + 2 * i as u32, *w)?;
                }
            }
        }
        self.buffers.push_status(
            &mut self.mem,
            t.hid,
            &StatusEntry {
                error,
                exception,
                bus,
                buffer_index: buf_index,
                error_flags: wire.flags,
                status1: resp.status1,
                status2: resp.status2,
                buffer_addr: buf_addr,
                time_tag: tt,
            },
        )?;
        self.buffers.advance(&mut self.mem, t.hid, error)?;
        self.transfers.record_result(&mut self.mem, xid, error)?;
        self.bump(cb::BC_MSG_COUNT)?;
        if error {
            self.bump(cb::BC_ERR_COUNT)?;
            warn!("transfer {} on {} failed: flags 0x{:04X}", xid, bus, wire.flags);
        }

        let interrupt = match t.interrupt {
            InterruptControl::None => None,
            InterruptControl::OnEnd => Some(event::END),
            InterruptControl::OnError => error.then_some(event::ERROR),
            InterruptControl::OnStatusException => exception.then_some(event::EXCEPTION),
        };
        if let Some(kind) = interrupt {
            self.buffers.push_event(&mut self.mem, t.hid, kind, xid, tt)?;
            self.bump(cb::BC_INTERRUPTS)?;
        }
        let service_request = StatusWord(resp.status1).service_request();
        if service_request && t.service_request != ServiceRequest::Disabled {
            self.buffers
                .push_event(&mut self.mem, t.hid, event::SERVICE_REQUEST, xid, tt)?;
        }

        let mut endpoints = Vec::with_capacity(2);
        match t.kind {
            TransferType::BcToRt => endpoints.push((t.rcv_rt, t.rcv_sa, Direction::Receive)),
            TransferType::RtToBc => endpoints.push((t.xmt_rt, t.xmt_sa, Direction::Transmit)),
            TransferType::RtToRt => {
                endpoints.push((t.rcv_rt, t.rcv_sa, Direction::Receive));
                endpoints.push((t.xmt_rt, t.xmt_sa, Direction::Transmit));
            }
        }
        let message = BusMessage {
            bus,
            start_ticks: start,
            events: wire.events,
            endpoints,
        };
        self.monitor.observe(&mut self.mem, &message)?;
        self.clock += wire.ticks;
        self.regs.last_error = error;

        Ok(match t.halt {
            HaltControl::NoHalt => false,
            HaltControl::OnTransferError => error,
            HaltControl::OnStatusException => exception,
            HaltControl::OnErrorOrException => error || exception,
            HaltControl::OnAnyInterrupt => interrupt.is_some(),
        })
    }

    fn bc_to_rt(
        &mut self,
        t: &Transfer,
        cw: CommandWord,
        buf_addr: u32,
        bus: Bus,
        tt: u32,
        wire: &mut Wire,
    ) -> Result<Responses> {
        self.dytags.apply(&mut self.mem, t.xid, buf_addr)?;
        let cw_ok = wire.send_bc(WordKind::Command, cw.raw(), 0);
        let expected = cw.data_words();
        let count = match t.error.kind {
            ErrorKind::WordCountHigh => expected + 1,
            ErrorKind::WordCountLow => expected.saturating_sub(1),
            _ => expected,
        };
        let mut data = Vec::with_capacity(count);
        let mut data_ok = true;
        for i in 0..count {
            let value = self.mem.read_u16(buf_addr + 2 * (i as u32 % 32))?;
            data_ok &= wire.send_bc(WordKind::Data, value, (i + 1) as u8);
            data.push(value);
        }
        if count > expected {
            wire.error(flags::HCNT);
            data_ok = false;
        } else if count < expected {
            wire.error(flags::LCNT);
            data_ok = false;
        }
        let mut resp = Responses::default();
        if !cw_ok {
            if !cw.is_broadcast() {
                wire.no_response(self.response_timeout_qus, t.response != ResponseControl::NoStatus1);
            }
            return Ok(resp);
        }
        resp.status1 = self.rt_receive(cw, &data, data_ok, bus, tt, wire, t.response != ResponseControl::NoStatus1)?;
        Ok(resp)
    }

    fn rt_to_bc(&mut self, t: &Transfer, cw: CommandWord, bus: Bus, tt: u32, wire: &mut Wire) -> Result<Responses> {
        let cw_ok = wire.send_bc(WordKind::Command, cw.raw(), 0);
        let expected = t.response != ResponseControl::NoStatus1;
        let mut resp = Responses::default();
        if !cw_ok {
            wire.no_response(self.response_timeout_qus, expected);
            return Ok(resp);
        }
        if let Some((status, data)) = self.rt_transmit(cw, bus, tt, wire, expected)? {
            resp.status1 = status;
            resp.received = Some(data);
        }
        Ok(resp)
    }

    fn rt_to_rt(
        &mut self,
        t: &Transfer,
        cw1: CommandWord,
        cw2: CommandWord,
        bus: Bus,
        tt: u32,
        wire: &mut Wire,
    ) -> Result<Responses> {
        let rcv_ok = wire.send_bc(WordKind::Command, cw1.raw(), 0);
        let xmt_ok = wire.send_bc(WordKind::Command2, cw2.raw(), 0);
        let mut resp = Responses::default();
        if !xmt_ok {
            wire.no_response(self.response_timeout_qus, t.response != ResponseControl::NoStatus1);
            return Ok(resp);
        }
        let Some((status, data)) =
            self.rt_transmit(cw2, bus, tt, wire, t.response != ResponseControl::NoStatus1)?
        else {
            return Ok(resp);
        };
        resp.status1 = status;
        if !rcv_ok {
            if !cw1.is_broadcast() {
                wire.no_response(self.response_timeout_qus, t.response != ResponseControl::NoStatus2);
            }
            return Ok(resp);
        }
        let data_ok = data.len() == cw1.data_words();
        resp.status2 = self.rt_receive(cw1, &data, data_ok, bus, tt, wire, t.response != ResponseControl::NoStatus2)?;
        resp.received = Some(data);
        Ok(resp)
    }

    /// A terminal takes a receive command and its data; broadcasts go to every listener
    ///
    /// Returns the status word put on the bus, 0 when none was sent.
    #[allow(clippy::too_many_arguments)]
    fn rt_receive(
        &mut self,
        cw: CommandWord,
        data: &[u16],
        data_ok: bool,
        bus: Bus,
        tt: u32,
        wire: &mut Wire,
        expected: bool,
    ) -> Result<u16> {
        if cw.is_broadcast() {
            self.broadcast_receive(cw, data, data_ok, bus, tt)?;
            return Ok(0);
        }
        let timeout = self.response_timeout_qus;
        let sa = cw.sa();
        let Some(term) = self.rts.responder(cw.rt()) else {
            wire.no_response(timeout, expected);
            return Ok(0);
        };
        if !data_ok {
            term.record(sa, Direction::Receive, true);
            wire.no_response(timeout, expected);
            return Ok(0);
        }
        let response = term.response_time_qus();
        if response > timeout {
            term.record_late();
            wire.no_response(timeout, expected);
            return Ok(0);
        }
        let mode = cw.is_mode_code();
        let binding = term.binding(sa, Direction::Receive);
        let message_error = !mode && binding.is_none();
        term.accept(cw);
        if mode {
            if let Some(first) = data.first() {
                term.store_mode_data(*first);
            }
        }
        term.record(sa, Direction::Receive, message_error);
        let status = term.status_word(message_error).raw();
        if mode {
            self.note_mode_code(cw);
        }
        if let Some(hid) = binding {
            self.rt_store(hid, data, bus, status, tt)?;
        }
        wire.respond(status, response);
        Ok(status)
    }

    /// Deliver a broadcast receive to every enabled terminal; none of them answers
    fn broadcast_receive(&mut self, cw: CommandWord, data: &[u16], data_ok: bool, bus: Bus, tt: u32) -> Result<()> {
        let sa = cw.sa();
        let mode = cw.is_mode_code();
        for rt in self.rts.listeners() {
            let term = self.rts.get_mut(rt)?;
            if !data_ok {
                term.record(sa, Direction::Receive, true);
                continue;
            }
            let binding = term.binding(sa, Direction::Receive);
            let message_error = !mode && binding.is_none();
            term.accept(cw);
            if mode {
                if let Some(first) = data.first() {
                    term.store_mode_data(*first);
                }
            }
            term.record(sa, Direction::Receive, message_error);
            let status = term.broadcast_status(message_error).raw();
            if let Some(hid) = binding {
                self.rt_store(hid, data, bus, status, tt)?;
            }
        }
        if mode && data_ok {
            self.note_mode_code(cw);
        }
        Ok(())
    }

    /// A terminal answers a transmit command; `None` if it stayed silent
    fn rt_transmit(
        &mut self,
        cw: CommandWord,
        bus: Bus,
        tt: u32,
        wire: &mut Wire,
        expected: bool,
    ) -> Result<Option<(u16, Vec<u16>)>> {
        let timeout = self.response_timeout_qus;
        let sa = cw.sa();
        let Some(term) = self.rts.responder(cw.rt()).filter(|_| !cw.is_broadcast()) else {
            wire.no_response(timeout, expected);
            return Ok(None);
        };
        let response = term.response_time_qus();
        if response > timeout {
            term.record_late();
            wire.no_response(timeout, expected);
            return Ok(None);
        }
        let mode = cw.is_mode_code();
        let binding = term.binding(sa, Direction::Transmit);
        let message_error = !mode && binding.is_none();
        let mode_word = if mode && cw.data_words() == 1 {
            Some(term.mode_code_word(cw.word_count_field()).unwrap_or(0))
        } else {
            None
        };
        term.accept(cw);
        term.record(sa, Direction::Transmit, message_error);
        let status = term.status_word(message_error).raw();
        if mode {
            self.note_mode_code(cw);
        }
        let data = match (mode_word, binding) {
            (Some(word), _) => vec![word],
            (None, Some(hid)) if !message_error => self.rt_load(hid, cw.data_words(), bus, status, tt)?,
            _ => Vec::new(),
        };
        wire.respond(status, response);
        wire.data(&data);
        Ok(Some((status, data)))
    }

    fn note_mode_code(&mut self, cw: CommandWord) {
        let code = cw.word_count_field();
        self.triggers[TriggerSource::RtModeCode as usize] =
            self.triggers[TriggerSource::RtModeCode as usize].saturating_add(1);
        match ModeCode::try_from(code) {
            Ok(mc) => debug!("RT {} mode code {:?}", cw.rt(), mc),
            Err(_) => debug!("RT {} reserved mode code {}", cw.rt(), code),
        }
    }

    fn rt_store(&mut self, hid: u16, data: &[u16], bus: Bus, status: u16, tt: u32) -> Result<()> {
        let (index, addr) = self.buffers.active_buffer(&self.mem, hid)?;
        for (i, w) in data.iter().take(32).enumerate() {
            self.mem.write_u16(addr + 2 * i as u32, *w)?;
        }
        self.rt_complete(hid, index, addr, bus, status, tt)
    }

    fn rt_load(&mut self, hid: u16, count: usize, bus: Bus, status: u16, tt: u32) -> Result<Vec<u16>> {
        let (index, addr) = self.buffers.active_buffer(&self.mem, hid)?;
        let data = (0..count.min(32))
            .map(|i| self.mem.read_u16(addr + 2 * i as u32))
            .collect::<Result<Vec<u16>>>()?;
        self.rt_complete(hid, index, addr, bus, status, tt)?;
        Ok(data)
    }

    fn rt_complete(&mut self, hid: u16, index: u8, addr: u32, bus: Bus, status: u16, tt: u32) -> Result<()> {
        self.buffers.push_status(
            &mut self.mem,
            hid,
            &StatusEntry {
                bus,
                buffer_index: index,
                status1: status,
                buffer_addr: addr,
                time_tag: tt,
                ..StatusEntry::default()
            },
        )?;
        self.buffers.advance(&mut self.mem, hid, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StatusQueueMode;
    use crate::monitor::{tag, CaptureMode, Trigger};

    fn biu() -> BusInterfaceUnit {
        BusInterfaceUnit::new(BiuConfig::default()).unwrap()
    }

    fn header(biu: &mut BusInterfaceUnit, hid: u16, bid: u16) -> Result<HeaderInfo> {
        biu.define_header(HeaderSpec::new(hid, bid, QueueSize::One, BufferQueueMode::Cyclic))
    }

    fn single_frame(biu: &mut BusInterfaceUnit, xids: &[u16]) -> Result<()> {
        let instructions: Vec<FrameInstruction> =
            xids.iter().map(|x| FrameInstruction::Transfer(*x)).collect();
        biu.define_minor_frame(1, &instructions)?;
        biu.define_major_frame(&[1])
    }

    fn start_monitor(biu: &mut BusInterfaceUnit) -> Result<()> {
        biu.bm_init(MonitorConfig::default())?;
        biu.bm_start();
        Ok(())
    }

    #[test]
    fn test_broadcast_reaches_every_listening_terminal() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        header(&mut biu, 2, 2)?;
        header(&mut biu, 3, 3)?;
        biu.rt_init(5, RtConfig::default())?;
        biu.rt_bind(5, 1, Direction::Receive, Some(2))?;
        biu.rt_init(9, RtConfig::default())?;
        biu.rt_bind(9, 1, Direction::Receive, Some(3))?;
        biu.rt_init(12, RtConfig::default())?;
        biu.write_buffer(1, &[0xAAAA, 0x5555])?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 2))?;
        single_frame(&mut biu, &[1])?;
        biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
        biu.run_until_halt(10_000)?;

        assert_eq!(biu.transfer_status(1)?, TransferStatus { msg_count: 1, err_count: 0 });
        for (rt, bid) in [(5, 2), (9, 3)] {
            assert_eq!(
                biu.rt_sa_status(rt, 1, Direction::Receive)?,
                RtCounters { msg_count: 1, err_count: 0 }
            );
            assert_eq!(biu.read_buffer(bid, 2)?, vec![0xAAAA, 0x5555]);
            assert_ne!(biu.rt_status(rt)?.last_status & 0x0010, 0);
        }
        assert_eq!(biu.rt_sa_status(12, 1, Direction::Receive)?.err_count, 1);
        Ok(())
    }

    #[test]
    fn test_broadcast_battery_counts() -> Result<()> {
        let mut biu = biu();
        for i in 1..=30u16 {
            header(&mut biu, i, i)?;
            biu.define_transfer(Transfer::bc_to_rt(i, i, 31, i as u8, i as u8))?;
        }
        single_frame(&mut biu, &(1..=30).collect::<Vec<u16>>())?;
        biu.bc_start(StartMode::Immediately, 1, Some(50_000))?;
        assert_eq!(biu.run_until_halt(1_000_000)?, BcState::Halted);

        let bc = biu.bc_status()?;
        assert_eq!(bc.msg_count, 30);
        assert_eq!(bc.err_count, 0);
        for i in 1..=30u16 {
            assert_eq!(biu.transfer_status(i)?, TransferStatus { msg_count: 1, err_count: 0 });
        }
        Ok(())
    }

    #[test]
    fn test_rt_to_rt_counts_and_record_order() -> Result<()> {
        let mut biu = biu();
        biu.rt_init(0, RtConfig::default())?;
        for i in 1..=30u8 {
            let i16 = i as u16;
            header(&mut biu, i16, i16)?;
            header(&mut biu, 100 + i16, 100 + i16)?;
            header(&mut biu, 200 + i16, 200 + i16)?;
            biu.rt_bind(0, i, Direction::Transmit, Some(100 + i16))?;
            biu.rt_init(i, RtConfig::default())?;
            biu.rt_bind(i, i, Direction::Receive, Some(200 + i16))?;
            biu.define_transfer(Transfer::rt_to_rt(i16, i16, (0, i), (i, i), 1))?;
        }
        biu.write_buffer(101, &[0xCAFE])?;
        single_frame(&mut biu, &(1..=30).collect::<Vec<u16>>())?;
        start_monitor(&mut biu)?;
        biu.bc_start(StartMode::Immediately, 1, Some(50_000))?;
        biu.run_until_halt(1_000_000)?;

        assert_eq!(biu.rt_sa_status(0, 1, Direction::Transmit)?.msg_count, 1);
        assert_eq!(biu.rt_status(0)?.counters.msg_count, 30);
        for i in 1..=30u8 {
            assert_eq!(biu.rt_status(i)?.counters, RtCounters { msg_count: 1, err_count: 0 });
        }
        assert_eq!(biu.read_buffer(201, 1)?, vec![0xCAFE]);

        let entries = biu.bm_entries()?;
        let kinds: Vec<u32> = entries[2..7].iter().map(|e| e >> 28).collect();
        let base = tag::WORD_BASE as u32;
        assert_eq!(
            kinds,
            vec![
                base + WordKind::Command as u32,
                base + WordKind::Command2 as u32,
                base + WordKind::Status as u32,
                base + WordKind::Data as u32,
                base + WordKind::Status as u32,
            ]
        );
        assert_eq!(entries[2] & 0xFFFF, (1 << 11) | (1 << 5) | 1);
        assert_eq!(entries[3] & 0xFFFF, (1 << 10) | (1 << 5) | 1);
        assert_eq!(entries[5] & 0xFFFF, 0xCAFE);
        Ok(())
    }

    #[test]
    fn test_forward_call_runs_from_instruction_table() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 3, 1, 2))?;
        let table = [
            TableEntry::new(Opcode::Call, 10, 0),
            TableEntry::new(Opcode::Halt, 0, 0),
            TableEntry::new(Opcode::Xfer, 1, 0).labelled(10),
            TableEntry::new(Opcode::Ret, 0, 0),
        ];
        let compiled = biu.compile_table(CompileMode::ConvertWrite, 0, &table, &[])?;
        let base = biu.layout().instr_base;
        assert_eq!(compiled.label_address(10), Some(base + 8));
        assert_eq!(InstructionWord(compiled.words[0]).operand(), base + 8);

        biu.bc_start(StartMode::InstructionTable(compiled.start_addr), 0, None)?;
        assert_eq!(biu.run_until_halt(10_000)?, BcState::Halted);
        assert_eq!(biu.transfer_status(1)?.msg_count, 1);
        Ok(())
    }

    #[test]
    fn test_forced_response_timeout() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        header(&mut biu, 2, 2)?;
        biu.rt_init(5, RtConfig::with_response_time(40))?;
        biu.rt_bind(5, 1, Direction::Receive, Some(2))?;
        biu.set_response_timeout(20)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 5, 1, 4))?;
        single_frame(&mut biu, &[1])?;
        start_monitor(&mut biu)?;
        biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
        biu.run_until_halt(10_000)?;

        assert_eq!(biu.transfer_status(1)?.err_count, 1);
        assert_eq!(biu.bc_status()?.err_count, 1);
        assert_eq!(biu.rt_status(5)?.counters.msg_count, 0);
        let nresp = MonitorRecord::error_entry(flags::ERR | flags::NRESP);
        assert_eq!(nresp, 0x1000_8001);
        assert!(biu.bm_find_entry(0xFFFF_FFFF, nresp)?.is_some());
        let queue = biu.read_status_queue(1, true)?;
        assert!(queue[0].error);
        assert_eq!(queue[0].error_flags, flags::NRESP);
        Ok(())
    }

    #[test]
    fn test_resize_keeps_index_in_range() -> Result<()> {
        let mut biu = biu();
        biu.define_header(HeaderSpec::new(1, 1, QueueSize::Eight, BufferQueueMode::Cyclic))?;
        biu.set_buffer_index(1, 5)?;
        let info = biu.modify_header(1, QueueSize::Four, BufferQueueMode::Cyclic)?;
        assert_eq!(info.current_index, 1);
        let info = biu.modify_header(1, QueueSize::Two, BufferQueueMode::Cyclic)?;
        assert_eq!(info.current_index, 1);
        Ok(())
    }

    #[test]
    fn test_status_time_tags_strictly_increase() -> Result<()> {
        let mut biu = biu();
        biu.define_header(HeaderSpec {
            status_mode: StatusQueueMode::AsQueueSize,
            ..HeaderSpec::new(1, 1, QueueSize::Eight, BufferQueueMode::Cyclic)
        })?;
        biu.rt_init(2, RtConfig::default())?;
        biu.define_transfer(Transfer::rt_to_bc(1, 1, 2, 1, 4))?;
        biu.define_transfer(Transfer::rt_to_bc(2, 1, 2, 2, 4))?;
        single_frame(&mut biu, &[1, 2])?;
        biu.bc_start(StartMode::Immediately, 3, Some(1_000))?;
        biu.run_until_halt(100_000)?;

        let queue = biu.read_status_queue(1, false)?;
        assert_eq!(queue.len(), 6);
        assert!(queue.windows(2).all(|w| w[0].time_tag < w[1].time_tag));
        assert!(!biu.status_overflow(1)?);
        Ok(())
    }

    #[test]
    fn test_status_time_tags_increase_across_the_hour() -> Result<()> {
        let mut biu = biu();
        biu.define_header(HeaderSpec {
            status_mode: StatusQueueMode::AsQueueSize,
            ..HeaderSpec::new(1, 1, QueueSize::Eight, BufferQueueMode::Cyclic)
        })?;
        biu.rt_init(2, RtConfig::default())?;
        biu.define_transfer(Transfer::rt_to_bc(1, 1, 2, 1, 4))?;
        single_frame(&mut biu, &[1])?;
        biu.run_for(3_600_000_000 - 2_500)?;
        biu.bc_start(StartMode::Immediately, 6, Some(1_000))?;
        biu.run_until_halt(100_000)?;

        let queue = biu.read_status_queue(1, false)?;
        assert_eq!(queue.len(), 6);
        assert!(queue.windows(2).all(|w| w[0].time_tag < w[1].time_tag));
        Ok(())
    }

    #[test]
    fn test_halt_takes_effect_at_frame_boundary() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 1))?;
        single_frame(&mut biu, &[1])?;
        biu.bc_start(StartMode::Immediately, 0, Some(1_000))?;
        biu.run_for(3_500)?;
        assert_eq!(biu.bc_status()?.state, BcState::Running);
        assert_eq!(biu.transfer_status(1)?.msg_count, 4);
        biu.bc_halt();
        biu.run_for(5_000)?;
        assert_eq!(biu.bc_status()?.state, BcState::Halted);
        assert_eq!(biu.transfer_status(1)?.msg_count, 4);
        Ok(())
    }

    #[test]
    fn test_external_trigger_gates_start() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 1))?;
        single_frame(&mut biu, &[1])?;
        biu.bc_start(StartMode::ExternalTrigger, 1, Some(1_000))?;
        biu.run_for(5_000)?;
        assert_eq!(biu.transfer_status(1)?.msg_count, 0);
        biu.raise_trigger(TriggerSource::External);
        assert_eq!(biu.run_until_halt(5_000)?, BcState::Halted);
        assert_eq!(biu.transfer_status(1)?.msg_count, 1);
        Ok(())
    }

    #[test]
    fn test_periodic_start_needs_frame_time() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 1))?;
        single_frame(&mut biu, &[1])?;
        let before = biu.memory().read_u32(biu.layout().frame_base)?;
        assert!(matches!(
            biu.bc_start(StartMode::Immediately, 1, None),
            Err(BiuError::ParamOutOfRange { position: 3, .. })
        ));
        assert_eq!(biu.memory().read_u32(biu.layout().frame_base)?, before);
        assert_eq!(biu.bc_status()?.state, BcState::Idle);
        Ok(())
    }

    #[test]
    fn test_parity_error_suppresses_response() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        header(&mut biu, 2, 2)?;
        biu.rt_init(4, RtConfig::default())?;
        biu.rt_bind(4, 1, Direction::Receive, Some(2))?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 4, 1, 2))?;
        biu.set_error_injection(
            1,
            ErrorInjection {
                kind: ErrorKind::Parity,
                word_pos: 1,
                ..ErrorInjection::none()
            },
        )?;
        single_frame(&mut biu, &[1])?;
        start_monitor(&mut biu)?;
        biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
        biu.run_until_halt(10_000)?;

        let entry = biu.read_status_queue(1, true)?[0];
        assert_eq!(entry.error_flags, flags::PARITY | flags::NRESP);
        assert_eq!(biu.rt_status(4)?.counters, RtCounters { msg_count: 1, err_count: 1 });
        let activity = biu.bm_activity(4, 1, Direction::Receive)?;
        assert_eq!(activity.err_count, 1);
        assert!(biu
            .bm_find_entry(0xFFFF_FFFF, MonitorRecord::error_entry(flags::ERR | flags::PARITY))?
            .is_some());
        Ok(())
    }

    #[test]
    fn test_alternate_bus_injection() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.rt_init(4, RtConfig::default())?;
        biu.define_transfer(Transfer::rt_to_bc(1, 1, 4, 1, 1))?;
        biu.set_error_injection(
            1,
            ErrorInjection {
                kind: ErrorKind::AlternateBus,
                ..ErrorInjection::none()
            },
        )?;
        single_frame(&mut biu, &[1])?;
        biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
        biu.run_until_halt(10_000)?;
        let entry = biu.read_status_queue(1, true)?[0];
        assert_eq!(entry.bus, Bus::BusB);
        assert!(!entry.error);
        Ok(())
    }

    #[test]
    fn test_dytag_ramp_reaches_terminal() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        header(&mut biu, 2, 2)?;
        biu.rt_init(6, RtConfig::default())?;
        biu.rt_bind(6, 3, Direction::Receive, Some(2))?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 6, 3, 2))?;
        biu.define_dytag(
            1,
            &[DytagSpec {
                function: crate::dytag::DytagFunction::PositiveRamp,
                min: 10,
                max: 100,
                step: 5,
                word_pos: 2,
            }],
        )?;
        single_frame(&mut biu, &[1])?;
        biu.bc_start(StartMode::Immediately, 3, Some(1_000))?;
        biu.run_until_halt(10_000)?;
        assert_eq!(biu.read_buffer(2, 2)?[1], 20);
        assert_eq!(biu.descriptor_words(1)?[7] >> 31, 1);
        Ok(())
    }

    #[test]
    fn test_mode_code_transmit_last_command() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        header(&mut biu, 2, 2)?;
        header(&mut biu, 3, 3)?;
        biu.rt_init(7, RtConfig::default())?;
        biu.rt_bind(7, 2, Direction::Receive, Some(3))?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 7, 2, 3))?;
        biu.define_transfer(Transfer::rt_to_bc(2, 2, 7, 31, ModeCode::TransmitLastCommand as u8))?;
        single_frame(&mut biu, &[1, 2])?;
        biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
        biu.run_until_halt(10_000)?;

        let (cw1, _) = biu.read_transfer(1)?.command_words();
        assert_eq!(biu.read_buffer(2, 1)?, vec![cw1.raw()]);
        let entry = biu.read_status_queue(2, true)?[0];
        assert_eq!(entry.status1 >> 11, 7);
        Ok(())
    }

    #[test]
    fn test_halt_on_error_stops_immediately() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        let mut t = Transfer::bc_to_rt(1, 1, 9, 1, 1);
        t.halt = HaltControl::OnTransferError;
        t.interrupt = InterruptControl::OnError;
        biu.define_transfer(t)?;
        biu.define_transfer(Transfer::bc_to_rt(2, 1, 31, 1, 1))?;
        single_frame(&mut biu, &[1, 2])?;
        biu.bc_start(StartMode::Immediately, 0, Some(1_000))?;
        assert_eq!(biu.run_until_halt(10_000)?, BcState::Halted);
        assert_eq!(biu.transfer_status(2)?.msg_count, 0);
        let events = biu.read_events(1)?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, event::ERROR);
        assert_eq!(events[0].1, 1);
        Ok(())
    }

    #[test]
    fn test_strobe_skip_and_delay() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 1))?;
        biu.define_minor_frame(
            1,
            &[
                FrameInstruction::Strobe,
                FrameInstruction::Skip(1),
                FrameInstruction::Transfer(1),
                FrameInstruction::Wait(100),
                FrameInstruction::Strobe,
            ],
        )?;
        biu.define_major_frame(&[1])?;
        biu.bc_start(StartMode::Immediately, 2, Some(1_000))?;
        biu.run_until_halt(10_000)?;
        let bc = biu.bc_status()?;
        assert_eq!(bc.strobes, 4);
        assert_eq!(bc.minor_frames, 2);
        assert_eq!(biu.transfer_status(1)?.msg_count, 0);
        Ok(())
    }

    #[test]
    fn test_filtered_monitor_records_enabled_endpoints_only() -> Result<()> {
        let mut biu = biu();
        header(&mut biu, 1, 1)?;
        biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 1))?;
        biu.define_transfer(Transfer::bc_to_rt(2, 1, 31, 2, 1))?;
        single_frame(&mut biu, &[1, 2])?;
        biu.bm_init(MonitorConfig {
            capture_mode: CaptureMode::Filtered,
            start_trigger: Trigger::Immediate,
            ..MonitorConfig::default()
        })?;
        biu.bm_set_filter(31, 2, Direction::Receive, true)?;
        biu.bm_start();
        biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
        biu.run_until_halt(10_000)?;
        let entries = biu.bm_entries()?;
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2] & 0xFFFF, (31 << 11) | (2 << 5) | 1);
        assert_eq!(biu.bm_totals().msg_count, 2);
        Ok(())
    }

    #[test]
    fn test_board_enable_sequence() -> Result<()> {
        let mut biu = biu();
        biu.board_enable()?;
        assert_eq!(biu.poll_status()? & 0xF, 0xF);

        let mut slow = BusInterfaceUnit::new(BiuConfig {
            board_enable_latency_polls: u32::MAX,
            board_enable_timeout_ms: 1,
            ..BiuConfig::default()
        })?;
        assert!(matches!(slow.board_enable(), Err(BiuError::Timeout(_))));
        Ok(())
    }

    #[test]
    fn test_modify_instruction_patches_memory() -> Result<()> {
        let mut biu = biu();
        let base = biu.layout().instr_base;
        let desc = base + 0x100;
        let target = base + 0x110;
        biu.memory_mut().write_block(desc, &[target, 0xFFFF_0000, 0x0000_1234])?;
        biu.memory_mut().write_u32(target, 0xABCD_FFFF)?;
        let table = [
            TableEntry::new(Opcode::Modify, desc, 0),
            TableEntry::new(Opcode::Jump, 0, 0),
        ];
        let compiled = biu.compile_table(CompileMode::ConvertWrite, 0, &table, &[])?;
        biu.bc_start(StartMode::InstructionTable(compiled.start_addr), 0, None)?;
        biu.run_until_halt(1_000)?;
        assert_eq!(biu.memory().read_u32(target)?, 0xABCD_1234);
        Ok(())
    }
}
