//! # MIL-STD-1553B Bus Interface Engine
//!
//! A simulated MIL-STD-1553B bus interface unit: a bus controller, remote
//! terminals and a bus monitor sharing one device memory image.
//!
//! The engine provides:
//!
//! - Transfer descriptors with error injection
//! - Buffer headers with data buffer rings, status queues and event queues
//! - Minor/major frame scheduling and an instruction-table compiler
//! - Dynamic data tags
//! - A bus monitor with triggers, filters and activity counters
//! - Built-in test (BITE)
//! - A command-id interface over a pluggable transport
//!
//! All bus timing runs on a virtual clock of 0.25 µs ticks, so runs are
//! deterministic.
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support and JSON configuration
//!
//! ## Example
//!
//! ```
//! use milstd1553b_biu::buffer::{BufferQueueMode, HeaderSpec, QueueSize};
//! use milstd1553b_biu::frame::{BcState, FrameInstruction, StartMode};
//! use milstd1553b_biu::transfer::Transfer;
//! use milstd1553b_biu::{BiuConfig, BusInterfaceUnit};
//!
//! let mut biu = BusInterfaceUnit::new(BiuConfig::default())?;
//! biu.define_header(HeaderSpec::new(1, 1, QueueSize::One, BufferQueueMode::Cyclic))?;
//! biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 4))?;
//! biu.define_minor_frame(1, &[FrameInstruction::Transfer(1)])?;
//! biu.define_major_frame(&[1])?;
//! biu.bc_start(StartMode::Immediately, 1, Some(1_000))?;
//! assert_eq!(biu.run_until_halt(10_000)?, BcState::Halted);
//! assert_eq!(biu.transfer_status(1)?.msg_count, 1);
//! # Ok::<(), milstd1553b_biu::BiuError>(())
//! ```

pub mod bite;
pub mod buffer;
pub mod command;
pub mod config;
pub mod core;
pub mod dytag;
pub mod engine;
pub mod error;
pub mod frame;
pub mod instr;
pub mod memory;
pub mod monitor;
pub mod rt;
pub mod timetag;
pub mod transfer;
pub mod word;

pub use crate::core::{Address, Bus, Direction, SubAddress};
pub use config::{BiuConfig, LabelBase, MemoryLayout};
pub use engine::BusInterfaceUnit;
pub use error::{BiuError, Result, TransportError};
pub use memory::{DeviceMemory, SimMemory};
pub use timetag::TimeTag;
pub use word::{CommandWord, ModeCode, StatusWord};

/// Table sizes of the frame scheduler
pub mod limits {
    /// Minor frames that can be defined
    pub const MAX_MINOR_FRAMES: usize = 64;

    /// Instructions in one minor frame
    pub const MAX_MINOR_FRAME_INSTRUCTIONS: usize = 128;

    /// Minor frame slots in the major frame
    pub const MAX_MAJOR_FRAME_ENTRIES: usize = 512;
}
