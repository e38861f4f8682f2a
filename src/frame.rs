//! Minor/major frame scheduling
//!
//! Frames are kept as definitions until the bus controller is started. At
//! start the scheduler compiles the major frame and every defined minor frame
//! into one program in the frame area:
//!
//! ```text
//!          [WTRG source]            start gate, trigger modes only
//! major:   CALL frame_a
//!          WMFT
//!          CALL frame_b
//!          WMFT
//!          ...
//!          DJZ  done                finite cycle count only
//!          JUMP major
//! done:    HALT
//! frame_a: XFER / SKIP / DELAY / STRB ...
//!          RET
//! ```

use log::{debug, info};
use std::collections::BTreeMap;

use crate::config::MemoryLayout;
use crate::error::{BiuError, Result};
use crate::instr::{Compiler, Opcode, TableEntry};
use crate::limits::{MAX_MAJOR_FRAME_ENTRIES, MAX_MINOR_FRAMES, MAX_MINOR_FRAME_INSTRUCTIONS};
use crate::memory::DeviceMemory;
use crate::transfer::TransferStore;

const MAJOR_LABEL: u16 = 1;
const DONE_LABEL: u16 = 2;
const FRAME_LABEL_BASE: u16 = 0x100;

/// One entry of a minor frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameInstruction {
    /// Execute a transfer
    Transfer(u16),
    /// Skip the following n instructions
    Skip(u16),
    /// Delay in microseconds
    Wait(u16),
    /// Pulse the strobe output
    Strobe,
}

impl FrameInstruction {
    /// Decode an (instruction code, argument) pair
    pub fn from_raw(code: u8, arg: u16) -> Result<Self> {
        match code {
            1 => Ok(FrameInstruction::Transfer(arg)),
            2 => Ok(FrameInstruction::Skip(arg)),
            3 => Ok(FrameInstruction::Wait(arg)),
            4 => Ok(FrameInstruction::Strobe),
            _ => Err(BiuError::param(3, "instr", code)),
        }
    }

    /// Encode as (instruction code, argument)
    pub fn to_raw(&self) -> (u8, u16) {
        match *self {
            FrameInstruction::Transfer(x) => (1, x),
            FrameInstruction::Skip(n) => (2, n),
            FrameInstruction::Wait(d) => (3, d),
            FrameInstruction::Strobe => (4, 0),
        }
    }

    fn entry(&self) -> TableEntry {
        match *self {
            FrameInstruction::Transfer(x) => TableEntry::new(Opcode::Xfer, x as u32, 0),
            FrameInstruction::Skip(n) => TableEntry::new(Opcode::Skip, n as u32, 0),
            FrameInstruction::Wait(d) => TableEntry::new(Opcode::Delay, d as u32, 0),
            FrameInstruction::Strobe => TableEntry::new(Opcode::Strobe, 0, 0),
        }
    }
}

/// How the bus controller starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StartMode {
    /// Run the major frame now
    Immediately,
    /// Run the major frame on the next external trigger
    ExternalTrigger,
    /// Run the major frame when an RT mode code is received
    RtModeCode,
    /// Jump into an instruction table at the given address
    InstructionTable(u32),
}

impl StartMode {
    /// Decode a start mode code and its table address argument
    pub fn from_raw(mode: u8, addr: u32) -> Result<Self> {
        match mode {
            1 => Ok(StartMode::Immediately),
            2 => Ok(StartMode::ExternalTrigger),
            3 => Ok(StartMode::RtModeCode),
            7 => Ok(StartMode::InstructionTable(addr)),
            _ => Err(BiuError::param(1, "start_mode", mode)),
        }
    }

    /// Encode as (mode code, table address)
    pub fn to_raw(&self) -> (u8, u32) {
        match *self {
            StartMode::Immediately => (1, 0),
            StartMode::ExternalTrigger => (2, 0),
            StartMode::RtModeCode => (3, 0),
            StartMode::InstructionTable(addr) => (7, addr),
        }
    }

    /// Whether the mode runs the frame schedule at a fixed period
    pub fn is_periodic(&self) -> bool {
        !matches!(self, StartMode::InstructionTable(_))
    }
}

/// Bus controller run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BcState {
    /// Never started
    #[default]
    Idle,
    /// Executing
    Running,
    /// Stopped by halt request or HALT instruction
    Halted,
}

/// Program entry produced by a successful start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStart {
    /// First instruction address
    pub entry: u32,
    /// Major frame repetitions (0 = forever)
    pub cycles: u32,
    /// Minor frame period in microseconds
    pub frame_time_us: u32,
}

/// Frame definitions and the bus controller state machine
#[derive(Debug, Clone)]
pub struct Scheduler {
    layout: MemoryLayout,
    minor: BTreeMap<u8, Vec<FrameInstruction>>,
    major: Vec<u8>,
    state: BcState,
    halt_requested: bool,
}

impl Scheduler {
    /// Create a scheduler with no frames
    pub fn new(layout: MemoryLayout) -> Self {
        Scheduler {
            layout,
            minor: BTreeMap::new(),
            major: Vec::new(),
            state: BcState::Idle,
            halt_requested: false,
        }
    }

    /// Define a minor frame
    pub fn define_minor_frame(
        &mut self,
        store: &TransferStore,
        id: u8,
        instructions: &[FrameInstruction],
    ) -> Result<()> {
        if id == 0 || id as usize > MAX_MINOR_FRAMES {
            return Err(BiuError::param(1, "frame_id", id));
        }
        if instructions.is_empty() || instructions.len() > MAX_MINOR_FRAME_INSTRUCTIONS {
            return Err(BiuError::param(2, "cnt", instructions.len() as u32));
        }
        for instr in instructions {
            match instr {
                FrameInstruction::Transfer(xid) if !store.contains(*xid) => {
                    return Err(BiuError::UndefinedTransfer(*xid));
                }
                FrameInstruction::Skip(0) => return Err(BiuError::param(2, "skip", 0u16)),
                _ => {}
            }
        }
        self.minor.insert(id, instructions.to_vec());
        debug!("minor frame {} defined with {} instruction(s)", id, instructions.len());
        Ok(())
    }

    /// Define the major frame as an ordered list of minor frame ids
    pub fn define_major_frame(&mut self, ids: &[u8]) -> Result<()> {
        if ids.is_empty() || ids.len() > MAX_MAJOR_FRAME_ENTRIES {
            return Err(BiuError::param(1, "frame_cnt", ids.len() as u32));
        }
        if let Some(missing) = ids.iter().find(|id| !self.minor.contains_key(id)) {
            return Err(BiuError::UndefinedFrame(*missing as u16));
        }
        self.major = ids.to_vec();
        debug!("major frame defined: {:?}", ids);
        Ok(())
    }

    /// Minor frame definition
    pub fn minor_frame(&self, id: u8) -> Option<&[FrameInstruction]> {
        self.minor.get(&id).map(|v| v.as_slice())
    }

    /// Major frame definition
    pub fn major_frame(&self) -> &[u8] {
        &self.major
    }

    /// Current state
    pub fn state(&self) -> BcState {
        self.state
    }

    /// Build the frame program and move to Running
    ///
    /// Every check runs before the frame area is touched.
    pub fn start<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        mode: StartMode,
        cycles: u32,
        frame_time_us: Option<u32>,
    ) -> Result<ProgramStart> {
        if self.state == BcState::Running {
            return Err(BiuError::invalid_state("bus controller already running"));
        }
        let frame_time_us = match (mode.is_periodic(), frame_time_us) {
            (true, None) | (true, Some(0)) => {
                return Err(BiuError::param(3, "frame_time", frame_time_us.unwrap_or(0)))
            }
            (_, t) => t.unwrap_or(0),
        };
        let entry = match mode {
            StartMode::InstructionTable(addr) => {
                let end = self.layout.instr_base + 4 * self.layout.instr_words;
                let in_frames = addr >= self.layout.frame_base
                    && addr < self.layout.frame_base + self.layout.frame_size;
                if addr % 4 != 0 || !((addr >= self.layout.instr_base && addr < end) || in_frames) {
                    return Err(BiuError::param(4, "instr_addr", addr));
                }
                addr
            }
            _ => {
                if self.major.is_empty() {
                    return Err(BiuError::invalid_state("no major frame defined"));
                }
                let table = self.program(mode, cycles);
                let compiler =
                    Compiler::for_area(&self.layout, self.layout.frame_base, self.layout.frame_size / 4);
                let compiled = compiler.compile(&table, 0)?;
                compiler.flush(mem, &compiled.words, 0)?
            }
        };
        self.state = BcState::Running;
        self.halt_requested = false;
        info!(
            "bus controller started: {:?}, {} cycle(s), frame time {} µs",
            mode, cycles, frame_time_us
        );
        Ok(ProgramStart {
            entry,
            cycles,
            frame_time_us,
        })
    }

    fn program(&self, mode: StartMode, cycles: u32) -> Vec<TableEntry> {
        let mut table = Vec::new();
        match mode {
            StartMode::ExternalTrigger => table.push(TableEntry::new(Opcode::WaitTrigger, 0, 0)),
            StartMode::RtModeCode => table.push(TableEntry::new(Opcode::WaitTrigger, 0, 1)),
            _ => {}
        }
        for (i, id) in self.major.iter().enumerate() {
            let call = TableEntry::new(Opcode::Call, (FRAME_LABEL_BASE + *id as u16) as u32, 0);
            table.push(if i == 0 { call.labelled(MAJOR_LABEL) } else { call });
            table.push(TableEntry::new(Opcode::WaitMinorFrame, 0, 0));
        }
        if cycles > 0 {
            table.push(TableEntry::new(Opcode::DecJumpZero, DONE_LABEL as u32, 0));
        }
        table.push(TableEntry::new(Opcode::Jump, MAJOR_LABEL as u32, 0));
        table.push(TableEntry::new(Opcode::Halt, 0, 0).labelled(DONE_LABEL));
        for (id, instructions) in &self.minor {
            for (i, instr) in instructions.iter().enumerate() {
                let entry = instr.entry();
                table.push(if i == 0 {
                    entry.labelled(FRAME_LABEL_BASE + *id as u16)
                } else {
                    entry
                });
            }
            table.push(TableEntry::new(Opcode::Ret, 0, 0));
        }
        table
    }

    /// Ask the bus controller to stop at the next minor frame boundary
    pub fn request_halt(&mut self) {
        if self.state == BcState::Running {
            self.halt_requested = true;
            info!("bus controller halt requested");
        }
    }

    /// Whether a halt is pending
    pub fn halt_pending(&self) -> bool {
        self.halt_requested
    }

    /// Record that execution stopped
    pub(crate) fn mark_halted(&mut self) {
        self.state = BcState::Halted;
        self.halt_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferManager, BufferQueueMode, HeaderSpec, QueueSize};
    use crate::config::BiuConfig;
    use crate::instr::InstructionWord;
    use crate::memory::SimMemory;
    use crate::transfer::Transfer;

    fn setup() -> (SimMemory, TransferStore, Scheduler) {
        let config = BiuConfig::default();
        let layout = config.layout();
        let mut mem = SimMemory::new(layout.total);
        let mut buffers = BufferManager::new(layout);
        buffers
            .define_header(&mut mem, HeaderSpec::new(1, 1, QueueSize::One, BufferQueueMode::Cyclic))
            .unwrap();
        let mut store = TransferStore::new(layout, config.max_xfer_id);
        store
            .define(&mut mem, &buffers, Transfer::bc_to_rt(1, 1, 1, 1, 1))
            .unwrap();
        (mem, store, Scheduler::new(layout))
    }

    #[test]
    fn test_minor_frame_limits() {
        let (_, store, mut sched) = setup();
        assert_eq!(
            sched.define_minor_frame(&store, 65, &[FrameInstruction::Strobe]),
            Err(BiuError::param(1, "frame_id", 65u8))
        );
        let too_many = vec![FrameInstruction::Strobe; 129];
        assert!(sched.define_minor_frame(&store, 1, &too_many).is_err());
        assert_eq!(
            sched.define_minor_frame(&store, 1, &[FrameInstruction::Transfer(2)]),
            Err(BiuError::UndefinedTransfer(2))
        );
    }

    #[test]
    fn test_zero_skip_rejected() -> Result<()> {
        let (_, store, mut sched) = setup();
        let frame = [FrameInstruction::Transfer(1), FrameInstruction::Skip(0), FrameInstruction::Strobe];
        assert_eq!(
            sched.define_minor_frame(&store, 1, &frame),
            Err(BiuError::param(2, "skip", 0u16))
        );
        assert!(sched.minor_frame(1).is_none());
        sched.define_minor_frame(&store, 1, &[FrameInstruction::Skip(1), FrameInstruction::Strobe])?;
        Ok(())
    }

    #[test]
    fn test_major_frame_requires_defined_minor() -> Result<()> {
        let (_, store, mut sched) = setup();
        sched.define_minor_frame(&store, 1, &[FrameInstruction::Transfer(1)])?;
        assert_eq!(sched.define_major_frame(&[1, 2]), Err(BiuError::UndefinedFrame(2)));
        sched.define_major_frame(&[1, 1])?;
        assert_eq!(sched.major_frame(), &[1, 1]);
        Ok(())
    }

    #[test]
    fn test_periodic_start_needs_frame_time_before_any_write() -> Result<()> {
        let (mut mem, store, mut sched) = setup();
        sched.define_minor_frame(&store, 1, &[FrameInstruction::Transfer(1)])?;
        sched.define_major_frame(&[1])?;
        let layout = BiuConfig::default().layout();
        assert!(sched.start(&mut mem, StartMode::Immediately, 1, None).is_err());
        assert_eq!(mem.read_u32(layout.frame_base)?, 0);
        assert_eq!(sched.state(), BcState::Idle);
        Ok(())
    }

    #[test]
    fn test_program_layout() -> Result<()> {
        let (mut mem, store, mut sched) = setup();
        sched.define_minor_frame(&store, 1, &[FrameInstruction::Transfer(1), FrameInstruction::Strobe])?;
        sched.define_major_frame(&[1])?;
        let start = sched.start(&mut mem, StartMode::Immediately, 3, Some(1000))?;
        let layout = BiuConfig::default().layout();
        assert_eq!(start.entry, layout.frame_base);
        let mut words = [0u32; 7];
        mem.read_block(layout.frame_base, &mut words)?;
        let ops: Vec<Option<Opcode>> = words.iter().map(|w| InstructionWord(*w).op()).collect();
        assert_eq!(
            ops,
            vec![
                Some(Opcode::Call),
                Some(Opcode::WaitMinorFrame),
                Some(Opcode::DecJumpZero),
                Some(Opcode::Jump),
                Some(Opcode::Halt),
                Some(Opcode::Xfer),
                Some(Opcode::Strobe),
            ]
        );
        assert_eq!(InstructionWord(words[0]).operand(), layout.frame_base + 20);
        assert_eq!(sched.state(), BcState::Running);
        assert!(sched.start(&mut mem, StartMode::Immediately, 3, Some(1000)).is_err());
        Ok(())
    }

    #[test]
    fn test_halt_request_state() -> Result<()> {
        let (mut mem, store, mut sched) = setup();
        sched.request_halt();
        assert!(!sched.halt_pending());
        sched.define_minor_frame(&store, 1, &[FrameInstruction::Transfer(1)])?;
        sched.define_major_frame(&[1])?;
        sched.start(&mut mem, StartMode::ExternalTrigger, 0, Some(500))?;
        sched.request_halt();
        assert!(sched.halt_pending());
        sched.mark_halted();
        assert_eq!(sched.state(), BcState::Halted);
        Ok(())
    }

    #[test]
    fn test_start_mode_codes() {
        assert_eq!(StartMode::from_raw(7, 0x40), Ok(StartMode::InstructionTable(0x40)));
        assert!(StartMode::from_raw(4, 0).is_err());
        assert_eq!(FrameInstruction::from_raw(3, 20), Ok(FrameInstruction::Wait(20)));
    }
}
