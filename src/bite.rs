//! Built-in test (BITE)
//!
//! Runs the self-test sequence against a [`BusInterfaceUnit`]: board enable,
//! memory pattern tests over three regions, a transfer battery on both buses
//! and minor frame timing. The first failing step aborts the run with
//! [`BiuError::BiteFailure`] carrying its phase and sub-code.
//!
//! The unit is reset before the memory tests, before every battery test and
//! once more at the end, so any prior configuration is lost.

use log::{info, warn};

use crate::buffer::{BufferQueueMode, HeaderSpec, QueueSize};
use crate::core::{Bus, Direction};
use crate::engine::{BoardFunction, BusInterfaceUnit};
use crate::error::{BiuError, Result};
use crate::frame::{BcState, FrameInstruction, StartMode};
use crate::memory::DeviceMemory;
use crate::monitor::{flags, tag, MonitorConfig, MonitorRecord, WordKind};
use crate::rt::RtConfig;
use crate::timetag::TimeTag;
use crate::transfer::Transfer;
use crate::word::ModeCode;

/// Phase numbers reported in [`BiuError::BiteFailure`]
pub mod phase {
    /// Board enable handshake
    pub const BOARD_ENABLE: u8 = 1;
    /// Control block RAM
    pub const CONTROL_BLOCK: u8 = 3;
    /// Transfer descriptor RAM
    pub const DESCRIPTORS: u8 = 4;
    /// Bus monitor RAM
    pub const MONITOR: u8 = 5;
    /// Transfer battery
    pub const TRANSFERS: u8 = 9;
    /// Minor frame timing
    pub const TIMING: u8 = 13;

    /// Every phase in execution order
    pub const ALL: [u8; 6] = [BOARD_ENABLE, CONTROL_BLOCK, DESCRIPTORS, MONITOR, TRANSFERS, TIMING];
}

/// Upper bound on the bytes exercised per memory region
pub const MEMORY_TEST_LIMIT_BYTES: u32 = 0x1_0000;

/// Allowed deviation of a measured minor frame period
pub const TIMING_TOLERANCE_US: u64 = 5;

const BATTERY_RTS: u8 = 30;
const FRAME_TIME_US: u32 = 50_000;
const RUN_LIMIT_US: u64 = 1_000_000;
const TIMING_CYCLES: u32 = 5;
const TIMING_PERIODS_US: [u32; 3] = [50_000, 10_000, 1_000];

/// Which phases to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BiteSelection {
    /// The full sequence
    #[default]
    All,
    /// A single phase
    Phase(u8),
}

impl BiteSelection {
    /// Decode the mode byte: 0 runs everything, otherwise a phase number
    pub fn from_raw(mode: u8) -> Result<Self> {
        match mode {
            0 => Ok(BiteSelection::All),
            p if phase::ALL.contains(&p) => Ok(BiteSelection::Phase(p)),
            _ => Err(BiuError::param(1, "bite_mode", mode)),
        }
    }

    fn includes(&self, p: u8) -> bool {
        match self {
            BiteSelection::All => true,
            BiteSelection::Phase(only) => *only == p,
        }
    }
}

/// Outcome of a passing BITE run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BiteReport {
    /// Phases that ran and passed, in order
    pub phases: Vec<u8>,
}

trait InPhase<T> {
    fn in_phase(self, phase: u8, sub_code: u8) -> Result<T>;
}

impl<T> InPhase<T> for Result<T> {
    fn in_phase(self, phase: u8, sub_code: u8) -> Result<T> {
        self.map_err(|e| {
            warn!("BITE phase {} sub-code {}: {}", phase, sub_code, e);
            BiuError::bite(phase, sub_code)
        })
    }
}

fn check(ok: bool, phase: u8, sub_code: u8, what: &str) -> Result<()> {
    if ok {
        return Ok(());
    }
    warn!("BITE phase {} sub-code {}: {}", phase, sub_code, what);
    Err(BiuError::bite(phase, sub_code))
}

/// Run the selected BITE phases
pub fn run_bite<M: DeviceMemory>(
    biu: &mut BusInterfaceUnit<M>,
    selection: BiteSelection,
) -> Result<BiteReport> {
    let mut report = BiteReport::default();
    biu.reset()?;
    for p in phase::ALL.into_iter().filter(|p| selection.includes(*p)) {
        info!("BITE phase {} started", p);
        match p {
            phase::BOARD_ENABLE => board_enable(biu)?,
            phase::CONTROL_BLOCK => {
                let layout = *biu.layout();
                memory_test(biu, p, layout.cb_base, crate::config::CONTROL_BLOCK_BYTES)?;
            }
            phase::DESCRIPTORS => {
                let layout = *biu.layout();
                memory_test(biu, p, layout.xfer_base, layout.bh_base - layout.xfer_base)?;
            }
            phase::MONITOR => {
                let layout = *biu.layout();
                memory_test(biu, p, layout.bm_base, layout.bm_size)?;
            }
            phase::TRANSFERS => transfer_battery(biu)?,
            _ => timing(biu)?,
        }
        info!("BITE phase {} passed", p);
        report.phases.push(p);
    }
    biu.reset()?;
    Ok(report)
}

fn board_enable<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>) -> Result<()> {
    let timeout = biu.config().board_enable_timeout();
    for (sub, function) in (1u8..).zip(BoardFunction::SEQUENCE) {
        biu.request_enable(function).in_phase(phase::BOARD_ENABLE, sub)?;
        biu.wait_for_status(function.bit(), timeout)
            .in_phase(phase::BOARD_ENABLE, sub)?;
    }
    Ok(())
}

fn pattern(sub_code: u8, index: u32, addr: u32) -> u32 {
    match sub_code {
        1 => 0x0000_0000,
        2 => 0x5555_5555,
        3 => 0xAAAA_AAAA,
        4 => 0xFFFF_FFFF,
        5 => 1 << (index % 32),
        6 => !(1 << (index % 32)),
        _ => addr,
    }
}

fn memory_test<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, p: u8, base: u32, bytes: u32) -> Result<()> {
    let words = bytes.min(MEMORY_TEST_LIMIT_BYTES) / 4;
    let mem = biu.memory_mut();
    for sub in 1..=7u8 {
        for i in 0..words {
            let addr = base + 4 * i;
            mem.write_u32(addr, pattern(sub, i, addr)).in_phase(p, sub)?;
        }
        for i in 0..words {
            let addr = base + 4 * i;
            let expected = pattern(sub, i, addr);
            let got = mem.read_u32(addr).in_phase(p, sub)?;
            check(
                got == expected,
                p,
                sub,
                &format!("0x{:08X} read 0x{:08X}, expected 0x{:08X}", addr, got, expected),
            )?;
        }
    }

    // alternate the two ends of the region so every data line toggles
    let (lo, hi) = (base, base + 4 * (words.max(1) - 1));
    for k in 0..32u32 {
        let value = 0x5555_5555u32.rotate_left(k);
        mem.write_u32(lo, value).in_phase(p, 8)?;
        mem.write_u32(hi, !value).in_phase(p, 8)?;
        let ok = lo == hi || (mem.read_u32(lo).in_phase(p, 8)? == value && mem.read_u32(hi).in_phase(p, 8)? == !value);
        check(ok, p, 8, &format!("ping-pong 0x{:08X}/0x{:08X}", lo, hi))?;
    }

    mem.fill(base, words, 0).in_phase(p, 8)?;
    biu.reset().in_phase(p, 8)
}

fn payload(id: u8, count: usize) -> Vec<u16> {
    (0..count as u16).map(|j| ((id as u16) << 8) | j).collect()
}

fn data_words(count: u8) -> usize {
    crate::core::word_count_from_field(count as u16)
}

fn header<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, hid: u16) -> Result<()> {
    biu.define_header(HeaderSpec::new(hid, hid, QueueSize::One, BufferQueueMode::Cyclic))?;
    Ok(())
}

fn prepare<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>) -> Result<()> {
    biu.reset()?;
    biu.bm_init(MonitorConfig::default())?;
    biu.bm_start();
    Ok(())
}

fn run_frame<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, xids: &[u16], frame_time_us: u32, cycles: u32) -> Result<BcState> {
    let instructions: Vec<FrameInstruction> =
        xids.iter().map(|x| FrameInstruction::Transfer(*x)).collect();
    biu.define_minor_frame(1, &instructions)?;
    biu.define_major_frame(&[1])?;
    biu.bc_start(StartMode::Immediately, cycles, Some(frame_time_us))?;
    biu.run_until_halt(RUN_LIMIT_US * cycles as u64)
}

fn word_entry(bus: Bus, kind: WordKind, value: u16) -> u32 {
    (((tag::WORD_BASE + 4 * bus.as_bit() + kind as u8) as u32) << 28) | value as u32
}

fn entries(bus: Bus, kind: WordKind, values: &[u16]) -> Vec<u32> {
    values.iter().map(|v| word_entry(bus, kind, *v)).collect()
}

/// Bus words of each retained message (entry type and value), time tags dropped
fn recorded_messages<M: DeviceMemory>(biu: &BusInterfaceUnit<M>) -> Result<Vec<Vec<u32>>> {
    let mut messages: Vec<Vec<u32>> = Vec::new();
    for entry in biu.bm_entries()? {
        match (entry >> 28) as u8 {
            tag::TIME_HIGH => messages.push(Vec::new()),
            tag::TIME_LOW => {}
            _ => {
                if let Some(words) = messages.last_mut() {
                    words.push(entry & 0xF000_FFFF);
                }
            }
        }
    }
    Ok(messages)
}

/// The monitor must hold exactly `expected`, message by message and word by word
fn expect_recorded<M: DeviceMemory>(biu: &BusInterfaceUnit<M>, sub: u8, expected: &[Vec<u32>]) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let recorded = recorded_messages(biu).in_phase(P, sub)?;
    check(
        recorded.len() == expected.len(),
        P,
        sub,
        &format!("monitor holds {} message(s), expected {}", recorded.len(), expected.len()),
    )?;
    for (n, (got, want)) in recorded.iter().zip(expected).enumerate() {
        check(
            got == want,
            P,
            sub,
            &format!("message {} recorded as {:08X?}, expected {:08X?}", n + 1, got, want),
        )?;
    }
    Ok(())
}

fn transfer_battery<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>) -> Result<()> {
    for (i, bus) in [Bus::BusA, Bus::BusB].into_iter().enumerate() {
        let offset = i as u8;
        broadcast(biu, bus, 1 + offset)?;
        bc_to_rt(biu, bus, 3 + offset)?;
        rt_to_bc(biu, bus, 5 + offset)?;
        rt_to_rt(biu, bus, 7 + offset)?;
        mode_code(biu, bus, 9 + offset)?;
        forced_timeout(biu, bus, 11 + offset)?;
    }
    time_tags(biu, 13)
}

fn expect_clean_run<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, sub: u8, xids: &[u16]) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let state = run_frame(biu, xids, FRAME_TIME_US, 1).in_phase(P, sub)?;
    check(state == BcState::Halted, P, sub, "bus controller did not halt")?;
    let bc = biu.bc_status().in_phase(P, sub)?;
    check(
        bc.msg_count == xids.len() as u32 && bc.err_count == 0,
        P,
        sub,
        &format!("BC counted {} message(s), {} error(s)", bc.msg_count, bc.err_count),
    )?;
    for xid in xids {
        let status = biu.transfer_status(*xid).in_phase(P, sub)?;
        check(
            status.msg_count == 1 && status.err_count == 0,
            P,
            sub,
            &format!("transfer {} counters {:?}", xid, status),
        )?;
    }
    Ok(())
}

fn broadcast<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, bus: Bus, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let n = BATTERY_RTS as u16;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        biu.rt_init(31, RtConfig::default())?;
        for sa in 1..=BATTERY_RTS {
            let i = sa as u16;
            header(biu, i)?;
            header(biu, n + i)?;
            biu.rt_bind(31, sa, Direction::Receive, Some(n + i))?;
            biu.write_buffer(i, &payload(sa, data_words(sa)))?;
            biu.define_transfer(Transfer::bc_to_rt(i, i, 31, sa, sa).on_bus(bus))?;
        }
        Ok((1..=n).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    expect_clean_run(biu, sub, &xids)?;
    let mut expected = Vec::new();
    for sa in 1..=BATTERY_RTS {
        let i = sa as u16;
        let rt = biu.rt_sa_status(31, sa, Direction::Receive).in_phase(P, sub)?;
        check(rt.msg_count == 1, P, sub, &format!("broadcast SA {} not received", sa))?;
        let data = biu.read_buffer(n + i, data_words(sa)).in_phase(P, sub)?;
        check(data == payload(sa, data_words(sa)), P, sub, &format!("broadcast SA {} data", sa))?;
        let (cw, _) = biu.read_transfer(i).in_phase(P, sub)?.command_words();
        // no terminal answers a broadcast
        expected.push(
            [
                entries(bus, WordKind::Command, &[cw.raw()]),
                entries(bus, WordKind::Data, &payload(sa, data_words(sa))),
            ]
            .concat(),
        );
    }
    expect_recorded(biu, sub, &expected)
}

fn bc_to_rt<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, bus: Bus, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let n = BATTERY_RTS as u16;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        for rt in 1..=BATTERY_RTS {
            let i = rt as u16;
            header(biu, i)?;
            header(biu, n + i)?;
            biu.rt_init(rt, RtConfig::default())?;
            biu.rt_bind(rt, rt, Direction::Receive, Some(n + i))?;
            biu.write_buffer(i, &payload(rt, data_words(rt)))?;
            biu.define_transfer(Transfer::bc_to_rt(i, i, rt, rt, rt).on_bus(bus))?;
        }
        Ok((1..=n).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    expect_clean_run(biu, sub, &xids)?;
    let mut expected = Vec::new();
    for rt in 1..=BATTERY_RTS {
        let i = rt as u16;
        let (cw, _) = biu.read_transfer(i).in_phase(P, sub)?.command_words();
        expected.push(
            [
                entries(bus, WordKind::Command, &[cw.raw()]),
                entries(bus, WordKind::Data, &payload(rt, data_words(rt))),
                entries(bus, WordKind::Status, &[i << 11]),
            ]
            .concat(),
        );
        let counters = biu.rt_status(rt).in_phase(P, sub)?.counters;
        check(counters.msg_count == 1 && counters.err_count == 0, P, sub, &format!("RT {} counters", rt))?;
        let entry = biu.read_status_queue(i, false).in_phase(P, sub)?;
        check(
            entry.first().is_some_and(|e| e.status1 >> 11 == rt as u16 && e.bus == bus),
            P,
            sub,
            &format!("RT {} status word", rt),
        )?;
        let data = biu.read_buffer(n + i, data_words(rt)).in_phase(P, sub)?;
        check(data == payload(rt, data_words(rt)), P, sub, &format!("RT {} received data", rt))?;
    }
    expect_recorded(biu, sub, &expected)
}

fn rt_to_bc<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, bus: Bus, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let n = BATTERY_RTS as u16;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        for rt in 1..=BATTERY_RTS {
            let i = rt as u16;
            header(biu, i)?;
            header(biu, n + i)?;
            biu.rt_init(rt, RtConfig::default())?;
            biu.rt_bind(rt, rt, Direction::Transmit, Some(n + i))?;
            biu.write_buffer(n + i, &payload(rt, data_words(rt)))?;
            biu.define_transfer(Transfer::rt_to_bc(i, i, rt, rt, rt).on_bus(bus))?;
        }
        Ok((1..=n).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    expect_clean_run(biu, sub, &xids)?;
    let mut expected = Vec::new();
    for rt in 1..=BATTERY_RTS {
        let i = rt as u16;
        let data = biu.read_buffer(i, data_words(rt)).in_phase(P, sub)?;
        check(data == payload(rt, data_words(rt)), P, sub, &format!("data from RT {}", rt))?;
        let (cw, _) = biu.read_transfer(i).in_phase(P, sub)?.command_words();
        expected.push(
            [
                entries(bus, WordKind::Command, &[cw.raw()]),
                entries(bus, WordKind::Status, &[i << 11]),
                entries(bus, WordKind::Data, &payload(rt, data_words(rt))),
            ]
            .concat(),
        );
    }
    expect_recorded(biu, sub, &expected)
}

fn rt_to_rt<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, bus: Bus, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let n = BATTERY_RTS as u16;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        biu.rt_init(0, RtConfig::default())?;
        for rt in 1..=BATTERY_RTS {
            let i = rt as u16;
            header(biu, i)?;
            header(biu, n + i)?;
            header(biu, 2 * n + i)?;
            biu.rt_bind(0, rt, Direction::Transmit, Some(n + i))?;
            biu.write_buffer(n + i, &payload(rt, data_words(rt)))?;
            biu.rt_init(rt, RtConfig::default())?;
            biu.rt_bind(rt, rt, Direction::Receive, Some(2 * n + i))?;
            biu.define_transfer(Transfer::rt_to_rt(i, i, (0, rt), (rt, rt), rt).on_bus(bus))?;
        }
        Ok((1..=n).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    expect_clean_run(biu, sub, &xids)?;
    let source = biu.rt_status(0).in_phase(P, sub)?.counters;
    check(source.msg_count == BATTERY_RTS as u32, P, sub, "RT 0 transmit count")?;
    let mut expected = Vec::new();
    for rt in 1..=BATTERY_RTS {
        let i = rt as u16;
        let counters = biu.rt_status(rt).in_phase(P, sub)?.counters;
        check(counters.msg_count == 1, P, sub, &format!("RT {} receive count", rt))?;
        let data = biu.read_buffer(2 * n + i, data_words(rt)).in_phase(P, sub)?;
        check(data == payload(rt, data_words(rt)), P, sub, &format!("RT {} received data", rt))?;
        let (rcv, xmt) = biu.read_transfer(i).in_phase(P, sub)?.command_words();
        let xmt = xmt.map(|cw| cw.raw()).unwrap_or_default();
        // receive command, transmit command, transmitter status, data, receiver status
        expected.push(
            [
                entries(bus, WordKind::Command, &[rcv.raw()]),
                entries(bus, WordKind::Command2, &[xmt]),
                entries(bus, WordKind::Status, &[0]),
                entries(bus, WordKind::Data, &payload(rt, data_words(rt))),
                entries(bus, WordKind::Status, &[i << 11]),
            ]
            .concat(),
        );
    }
    expect_recorded(biu, sub, &expected)
}

fn mode_code<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, bus: Bus, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        for rt in 1..=BATTERY_RTS {
            let i = rt as u16;
            header(biu, i)?;
            biu.rt_init(
                rt,
                RtConfig {
                    vector_word: 0xA000 | i,
                    ..RtConfig::default()
                },
            )?;
            let code = ModeCode::TransmitVectorWord as u8;
            biu.define_transfer(Transfer::rt_to_bc(i, i, rt, 31, code).on_bus(bus))?;
        }
        Ok((1..=BATTERY_RTS as u16).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    expect_clean_run(biu, sub, &xids)?;
    let mut expected = Vec::new();
    for rt in 1..=BATTERY_RTS {
        let i = rt as u16;
        let vector = biu.read_buffer(i, 1).in_phase(P, sub)?;
        check(vector == [0xA000 | i], P, sub, &format!("vector word of RT {}", rt))?;
        let (cw, _) = biu.read_transfer(i).in_phase(P, sub)?.command_words();
        expected.push(
            [
                entries(bus, WordKind::Command, &[cw.raw()]),
                entries(bus, WordKind::Status, &[i << 11]),
                entries(bus, WordKind::Data, &[0xA000 | i]),
            ]
            .concat(),
        );
    }
    expect_recorded(biu, sub, &expected)
}

fn forced_timeout<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, bus: Bus, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        let timeout = biu.config().response_timeout_qus;
        for rt in 1..=BATTERY_RTS {
            let i = rt as u16;
            header(biu, i)?;
            biu.rt_init(rt, RtConfig::with_response_time(timeout + 4))?;
            biu.rt_bind(rt, 1, Direction::Receive, Some(i))?;
            biu.define_transfer(Transfer::bc_to_rt(i, i, rt, 1, 1).on_bus(bus))?;
        }
        Ok((1..=BATTERY_RTS as u16).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    let state = run_frame(biu, &xids, FRAME_TIME_US, 1).in_phase(P, sub)?;
    check(state == BcState::Halted, P, sub, "bus controller did not halt")?;
    let bc = biu.bc_status().in_phase(P, sub)?;
    check(bc.err_count == xids.len() as u32, P, sub, "timeouts not counted by the BC")?;
    for rt in 1..=BATTERY_RTS {
        let status = biu.transfer_status(rt as u16).in_phase(P, sub)?;
        check(status.err_count == 1, P, sub, &format!("transfer {} error count", rt))?;
        let counters = biu.rt_status(rt).in_phase(P, sub)?.counters;
        check(counters.msg_count == 0, P, sub, &format!("late RT {} counted a message", rt))?;
    }
    let nresp = MonitorRecord::error_entry(flags::ERR | flags::NRESP);
    let found = biu.bm_find_entry(0xFFFF_FFFF, nresp).in_phase(P, sub)?;
    check(found.is_some(), P, sub, "monitor missed the no-response entry")
}

fn time_tags<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>, sub: u8) -> Result<()> {
    const P: u8 = phase::TRANSFERS;
    let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<Vec<u16>> {
        prepare(biu)?;
        biu.define_header(HeaderSpec::new(1, 1, QueueSize::Sixteen, BufferQueueMode::Cyclic).with_status_queue())?;
        for i in 1..=16u16 {
            biu.define_transfer(Transfer::bc_to_rt(i, 1, 31, 1, 4))?;
        }
        Ok((1..=16).collect())
    };
    let xids = setup(biu).in_phase(P, sub)?;
    expect_clean_run(biu, sub, &xids)?;
    let queue = biu.read_status_queue(1, true).in_phase(P, sub)?;
    check(queue.len() == xids.len(), P, sub, "status queue entry count")?;
    check(
        queue.windows(2).all(|w| w[0].time_tag < w[1].time_tag),
        P,
        sub,
        "status queue time tags not strictly increasing",
    )?;
    let starts = message_starts(biu).in_phase(P, sub)?;
    check(
        starts.windows(2).all(|w| w[0] < w[1]),
        P,
        sub,
        "monitor time tags not strictly increasing",
    )
}

/// Start times (µs) of the messages retained by the monitor
fn message_starts<M: DeviceMemory>(biu: &BusInterfaceUnit<M>) -> Result<Vec<u64>> {
    let entries = biu.bm_entries()?;
    Ok(entries
        .windows(2)
        .filter(|w| w[0] >> 28 == tag::TIME_HIGH as u32 && w[1] >> 28 == tag::TIME_LOW as u32)
        .map(|w| TimeTag::from_words(w[0], w[1]).total_micros())
        .collect())
}

fn timing<M: DeviceMemory>(biu: &mut BusInterfaceUnit<M>) -> Result<()> {
    const P: u8 = phase::TIMING;
    for (sub, period) in (1u8..).zip(TIMING_PERIODS_US) {
        let setup = |biu: &mut BusInterfaceUnit<M>| -> Result<()> {
            prepare(biu)?;
            header(biu, 1)?;
            biu.define_transfer(Transfer::bc_to_rt(1, 1, 31, 1, 1))?;
            Ok(())
        };
        setup(biu).in_phase(P, sub)?;
        let state = run_frame(biu, &[1], period, TIMING_CYCLES).in_phase(P, sub)?;
        check(state == BcState::Halted, P, sub, "bus controller did not halt")?;
        let starts = message_starts(biu).in_phase(P, sub)?;
        check(starts.len() == TIMING_CYCLES as usize, P, sub, "frame count")?;
        for w in starts.windows(2) {
            let delta = w[1] - w[0];
            check(
                delta.abs_diff(period as u64) <= TIMING_TOLERANCE_US,
                P,
                sub,
                &format!("frame period {} µs, expected {} µs", delta, period),
            )?;
        }
    }
    Ok(())
}
