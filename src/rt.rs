//! Remote terminal simulation
//!
//! Every terminal address the engine answers for is an entry in an
//! [`RtSet`]. Address 31 stands for the broadcast receiver: its subaddress
//! bindings decide where broadcast data lands, and it never sends a status
//! word.

use log::debug;
use std::collections::BTreeMap;

use crate::core::{Address, Direction};
use crate::error::{BiuError, Result};
use crate::word::{CommandWord, ModeCode, StatusWord};

/// State of a simulated remote terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RtState {
    /// Last message completed normally
    #[default]
    Idle,
    /// Last message was invalid
    Error,
    /// Last response arrived after the BC gave up
    NoResponse,
}

/// Terminal initialisation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtConfig {
    /// Terminal answers at all
    pub enabled: bool,
    /// Response time in units of 0.25 µs
    pub response_time_qus: u16,
    /// Status bits (10..0) sent in every status word
    pub status_flags: u16,
    /// Word returned for "transmit vector word"
    pub vector_word: u16,
    /// Word returned for "transmit BIT word"
    pub bit_word: u16,
}

impl Default for RtConfig {
    fn default() -> Self {
        RtConfig {
            enabled: true,
            response_time_qus: 32,
            status_flags: 0,
            vector_word: 0,
            bit_word: 0,
        }
    }
}

impl RtConfig {
    /// An enabled terminal with the given response time
    pub fn with_response_time(response_time_qus: u16) -> Self {
        RtConfig {
            response_time_qus,
            ..RtConfig::default()
        }
    }
}

/// Message and error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtCounters {
    /// Messages handled
    pub msg_count: u32,
    /// Messages that were invalid
    pub err_count: u32,
}

impl RtCounters {
    fn record(&mut self, error: bool) {
        self.msg_count = self.msg_count.wrapping_add(1);
        if error {
            self.err_count = self.err_count.wrapping_add(1);
        }
    }
}

/// Snapshot of one terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtStatus {
    /// Terminal address
    pub address: u8,
    /// State after the last message
    pub state: RtState,
    /// Counters over all subaddresses
    pub counters: RtCounters,
    /// Last valid command word received
    pub last_command: u16,
    /// Last status word sent
    pub last_status: u16,
}

/// A simulated remote terminal
#[derive(Debug, Clone)]
pub struct RemoteTerminal {
    address: Address,
    config: RtConfig,
    state: RtState,
    bindings: BTreeMap<(u8, Direction), u16>,
    sa_counters: BTreeMap<(u8, Direction), RtCounters>,
    counters: RtCounters,
    last_command: u16,
    last_status: u16,
    mode_data: u16,
    broadcast_pending: bool,
}

impl RemoteTerminal {
    /// Create a terminal with no subaddress bindings
    pub fn new(address: Address, config: RtConfig) -> Self {
        RemoteTerminal {
            address,
            config,
            state: RtState::Idle,
            bindings: BTreeMap::new(),
            sa_counters: BTreeMap::new(),
            counters: RtCounters::default(),
            last_command: 0,
            last_status: 0,
            mode_data: 0,
            broadcast_pending: false,
        }
    }

    /// Terminal address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the terminal answers
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Response time in 0.25 µs units
    pub fn response_time_qus(&self) -> u16 {
        self.config.response_time_qus
    }

    /// Buffer header bound to a subaddress and direction
    pub fn binding(&self, sa: u8, direction: Direction) -> Option<u16> {
        self.bindings.get(&(sa, direction)).copied()
    }

    /// Data word last received with a mode code
    pub fn mode_data(&self) -> u16 {
        self.mode_data
    }

    /// Status word for the current message
    ///
    /// Carries the broadcast-received bit once after a broadcast message.
    pub fn status_word(&mut self, message_error: bool) -> StatusWord {
        let mut word = StatusWord::for_rt(self.address);
        word.0 |= self.config.status_flags & 0x07FF;
        word.set_message_error(message_error);
        if std::mem::take(&mut self.broadcast_pending) {
            word.set_broadcast_received(true);
        }
        self.last_status = word.raw();
        word
    }

    /// Status kept after a broadcast message; it is never put on the bus
    pub fn broadcast_status(&mut self, message_error: bool) -> StatusWord {
        self.broadcast_pending = true;
        let word = self.status_word(message_error);
        self.broadcast_pending = true;
        word
    }

    /// Data word the terminal sends for a transmit mode code
    ///
    /// Must be called before [`RemoteTerminal::accept`] so "transmit last
    /// command" returns the previous command.
    pub fn mode_code_word(&self, code: u8) -> Option<u16> {
        match ModeCode::try_from(code).ok()? {
            ModeCode::TransmitVectorWord => Some(self.config.vector_word),
            ModeCode::TransmitLastCommand => Some(self.last_command),
            ModeCode::TransmitBitWord => Some(self.config.bit_word),
            _ => None,
        }
    }

    /// Take a valid command into account
    pub fn accept(&mut self, cw: CommandWord) {
        let last_command_request = cw.is_mode_code()
            && cw.word_count_field() == ModeCode::TransmitLastCommand as u8;
        if !last_command_request {
            self.last_command = cw.raw();
        }
        if cw.is_mode_code() && cw.word_count_field() == ModeCode::ResetRemoteTerminal as u8 {
            self.state = RtState::Idle;
        }
    }

    /// Store the data word of a receive mode code
    pub fn store_mode_data(&mut self, value: u16) {
        self.mode_data = value;
    }

    /// Count a completed message on a subaddress
    pub fn record(&mut self, sa: u8, direction: Direction, error: bool) {
        self.counters.record(error);
        self.sa_counters.entry((sa, direction)).or_default().record(error);
        self.state = if error { RtState::Error } else { RtState::Idle };
    }

    /// Note a response the bus controller never saw
    pub fn record_late(&mut self) {
        self.state = RtState::NoResponse;
    }

    /// Counters of one subaddress
    pub fn sa_counters(&self, sa: u8, direction: Direction) -> RtCounters {
        self.sa_counters.get(&(sa, direction)).copied().unwrap_or_default()
    }

    /// Snapshot
    pub fn status(&self) -> RtStatus {
        RtStatus {
            address: self.address.value(),
            state: self.state,
            counters: self.counters,
            last_command: self.last_command,
            last_status: self.last_status,
        }
    }
}

/// All simulated terminals of one interface
#[derive(Debug, Clone, Default)]
pub struct RtSet {
    terminals: BTreeMap<u8, RemoteTerminal>,
}

impl RtSet {
    /// Create an empty set
    pub fn new() -> Self {
        RtSet::default()
    }

    /// Initialise (or re-initialise) a terminal; bindings and counters are reset
    pub fn init(&mut self, rt: u8, config: RtConfig) -> Result<()> {
        let address = Address::new(rt)?;
        if config.status_flags > 0x07FF {
            return Err(BiuError::param(4, "nxw", config.status_flags));
        }
        self.terminals.insert(rt, RemoteTerminal::new(address, config));
        debug!(
            "RT {} initialised: enabled={} response {} qus",
            rt, config.enabled, config.response_time_qus
        );
        Ok(())
    }

    /// Bind a subaddress to a buffer header, or unbind it with `None`
    pub fn bind(&mut self, rt: u8, sa: u8, direction: Direction, hid: Option<u16>) -> Result<()> {
        if sa == 0 || sa > 30 {
            return Err(BiuError::param(2, "sa", sa));
        }
        let terminal = self.get_mut(rt)?;
        match hid {
            Some(hid) => terminal.bindings.insert((sa, direction), hid),
            None => terminal.bindings.remove(&(sa, direction)),
        };
        debug!("RT {} SA {} {:?} bound to {:?}", rt, sa, direction, hid);
        Ok(())
    }

    /// Initialised terminal
    pub fn get(&self, rt: u8) -> Result<&RemoteTerminal> {
        self.terminals
            .get(&rt)
            .ok_or_else(|| BiuError::invalid_state(format!("RT {} not initialised", rt)))
    }

    /// Mutable initialised terminal
    pub fn get_mut(&mut self, rt: u8) -> Result<&mut RemoteTerminal> {
        self.terminals
            .get_mut(&rt)
            .ok_or_else(|| BiuError::invalid_state(format!("RT {} not initialised", rt)))
    }

    /// Terminal that answers at an address, if any
    pub fn responder(&mut self, rt: u8) -> Option<&mut RemoteTerminal> {
        self.terminals.get_mut(&rt).filter(|t| t.is_enabled())
    }

    /// Enabled terminals, in address order
    pub fn listeners(&self) -> Vec<u8> {
        self.terminals
            .iter()
            .filter(|(_, t)| t.is_enabled())
            .map(|(rt, _)| *rt)
            .collect()
    }

    /// Counters of one subaddress
    pub fn sa_status(&self, rt: u8, sa: u8, direction: Direction) -> Result<RtCounters> {
        if sa > 31 {
            return Err(BiuError::param(2, "sa", sa));
        }
        Ok(self.get(rt)?.sa_counters(sa, direction))
    }

    /// Sum of the counters of all terminals
    pub fn totals(&self) -> RtCounters {
        self.terminals.values().fold(RtCounters::default(), |acc, t| RtCounters {
            msg_count: acc.msg_count.wrapping_add(t.counters.msg_count),
            err_count: acc.err_count.wrapping_add(t.counters.err_count),
        })
    }

    /// Number of initialised terminals
    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    /// Whether no terminal is initialised
    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SubAddress;

    #[test]
    fn test_init_and_bind() -> Result<()> {
        let mut rts = RtSet::new();
        rts.init(5, RtConfig::default())?;
        rts.bind(5, 2, Direction::Receive, Some(7))?;
        assert_eq!(rts.get(5)?.binding(2, Direction::Receive), Some(7));
        assert_eq!(rts.get(5)?.binding(2, Direction::Transmit), None);
        assert!(rts.bind(5, 0, Direction::Receive, Some(7)).is_err());
        assert!(rts.bind(6, 1, Direction::Receive, Some(7)).is_err());
        Ok(())
    }

    #[test]
    fn test_reinit_resets_counters() -> Result<()> {
        let mut rts = RtSet::new();
        rts.init(1, RtConfig::default())?;
        rts.get_mut(1)?.record(3, Direction::Receive, true);
        assert_eq!(rts.totals(), RtCounters { msg_count: 1, err_count: 1 });
        assert_eq!(rts.get(1)?.status().state, RtState::Error);
        rts.init(1, RtConfig::default())?;
        assert_eq!(rts.totals(), RtCounters::default());
        Ok(())
    }

    #[test]
    fn test_disabled_terminal_does_not_respond() -> Result<()> {
        let mut rts = RtSet::new();
        rts.init(
            4,
            RtConfig {
                enabled: false,
                ..RtConfig::default()
            },
        )?;
        assert!(rts.responder(4).is_none());
        assert!(rts.responder(9).is_none());
        Ok(())
    }

    #[test]
    fn test_status_word_carries_flags() -> Result<()> {
        let mut rts = RtSet::new();
        rts.init(
            3,
            RtConfig {
                status_flags: 0x0008,
                ..RtConfig::default()
            },
        )?;
        let sw = rts.get_mut(3)?.status_word(true);
        assert_eq!(sw.rt(), 3);
        assert!(sw.busy());
        assert!(sw.message_error());
        assert_eq!(rts.get(3)?.status().last_status, sw.raw());
        assert!(rts.init(3, RtConfig { status_flags: 0x800, ..RtConfig::default() }).is_err());
        Ok(())
    }

    #[test]
    fn test_broadcast_bit_reported_once() -> Result<()> {
        let mut rts = RtSet::new();
        rts.init(3, RtConfig::default())?;
        rts.init(
            4,
            RtConfig {
                enabled: false,
                ..RtConfig::default()
            },
        )?;
        rts.init(7, RtConfig::default())?;
        assert_eq!(rts.listeners(), vec![3, 7]);

        let rt = rts.get_mut(3)?;
        assert!(rt.broadcast_status(false).broadcast_received());
        assert!(rt.status_word(false).broadcast_received());
        assert!(!rt.status_word(false).broadcast_received());
        Ok(())
    }

    #[test]
    fn test_transmit_last_command() -> Result<()> {
        let mut rt = RemoteTerminal::new(Address::new(2)?, RtConfig::default());
        let data = CommandWord::new(Address::new(2)?, Direction::Receive, SubAddress::new(1)?, 4);
        rt.accept(data);
        let mode = CommandWord::new(
            Address::new(2)?,
            Direction::Transmit,
            SubAddress::new(31)?,
            ModeCode::TransmitLastCommand as u8,
        );
        assert_eq!(rt.mode_code_word(mode.word_count_field()), Some(data.raw()));
        rt.accept(mode);
        assert_eq!(rt.status().last_command, data.raw());
        Ok(())
    }
}
