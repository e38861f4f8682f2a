//! Command and status word layouts as they appear on the bus

use bitfield::bitfield;

use crate::core::{Address, Direction, SubAddress};
use crate::error::{BiuError, Result};

bitfield! {
    /// A MIL-STD-1553B command word
    ///
    /// Format:
    /// - Bits 15-11: RT address
    /// - Bit 10: Transmit/Receive flag
    /// - Bits 9-5: Subaddress or mode selector (0/31)
    /// - Bits 4-0: Data word count (0 means 32) or mode code
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CommandWord(u16);
    impl Debug;
    pub u8, rt, set_rt: 15, 11;
    pub tr, set_tr: 10;
    pub u8, sa, set_sa: 9, 5;
    pub u8, word_count_field, set_word_count_field: 4, 0;
}

impl CommandWord {
    /// Build a command word from its parts
    pub fn new(rt: Address, direction: Direction, sa: SubAddress, count_or_code: u8) -> Self {
        let mut word = CommandWord(0);
        word.set_rt(rt.value());
        word.set_tr(direction == Direction::Transmit);
        word.set_sa(sa.value());
        word.set_word_count_field(count_or_code & 0x1F);
        word
    }

    /// Raw 16-bit value
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Transfer direction encoded in the T/R bit
    pub fn direction(&self) -> Direction {
        Direction::from_bit(self.tr() as u16)
    }

    /// Whether the subaddress field selects a mode code
    pub fn is_mode_code(&self) -> bool {
        self.sa() == 0 || self.sa() == 31
    }

    /// Whether the command is addressed to all terminals
    pub fn is_broadcast(&self) -> bool {
        self.rt() == Address::BROADCAST
    }

    /// Number of data words that follow the command
    ///
    /// Mode codes 16-31 carry one data word, 0-15 none.
    pub fn data_words(&self) -> usize {
        if self.is_mode_code() {
            if self.word_count_field() >= 16 {
                1
            } else {
                0
            }
        } else {
            crate::core::word_count_from_field(self.word_count_field() as u16)
        }
    }
}

bitfield! {
    /// A MIL-STD-1553B status word returned by a remote terminal
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct StatusWord(u16);
    impl Debug;
    pub u8, rt, set_rt: 15, 11;
    pub message_error, set_message_error: 10;
    pub instrumentation, set_instrumentation: 9;
    pub service_request, set_service_request: 8;
    pub u8, reserved, set_reserved: 7, 5;
    pub broadcast_received, set_broadcast_received: 4;
    pub busy, set_busy: 3;
    pub subsystem_flag, set_subsystem_flag: 2;
    pub dynamic_bus_acceptance, set_dynamic_bus_acceptance: 1;
    pub terminal_flag, set_terminal_flag: 0;
}

impl StatusWord {
    /// A clear status word for the given terminal
    pub fn for_rt(rt: Address) -> Self {
        let mut word = StatusWord(0);
        word.set_rt(rt.value());
        word
    }

    /// Raw 16-bit value
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Status bits (everything below the address field)
    pub fn flags(&self) -> u16 {
        self.0 & 0x07FF
    }
}

/// Mode codes defined by MIL-STD-1553B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModeCode {
    /// Dynamic bus control
    DynamicBusControl = 0,
    /// Synchronize
    Synchronize = 1,
    /// Transmit status word
    TransmitStatusWord = 2,
    /// Initiate self test
    InitiateSelfTest = 3,
    /// Transmitter shutdown
    TransmitterShutdown = 4,
    /// Override transmitter shutdown
    OverrideTransmitterShutdown = 5,
    /// Inhibit terminal flag bit
    InhibitTerminalFlag = 6,
    /// Override inhibit terminal flag bit
    OverrideInhibitTerminalFlag = 7,
    /// Reset remote terminal
    ResetRemoteTerminal = 8,
    /// Transmit vector word
    TransmitVectorWord = 16,
    /// Synchronize with data word
    SynchronizeWithData = 17,
    /// Transmit last command word
    TransmitLastCommand = 18,
    /// Transmit built-in test word
    TransmitBitWord = 19,
    /// Selected transmitter shutdown
    SelectedTransmitterShutdown = 20,
    /// Override selected transmitter shutdown
    OverrideSelectedTransmitterShutdown = 21,
}

impl ModeCode {
    /// Whether the mode code carries one data word
    pub fn has_data_word(&self) -> bool {
        (*self as u8) >= 16
    }
}

impl TryFrom<u8> for ModeCode {
    type Error = BiuError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ModeCode::DynamicBusControl),
            1 => Ok(ModeCode::Synchronize),
            2 => Ok(ModeCode::TransmitStatusWord),
            3 => Ok(ModeCode::InitiateSelfTest),
            4 => Ok(ModeCode::TransmitterShutdown),
            5 => Ok(ModeCode::OverrideTransmitterShutdown),
            6 => Ok(ModeCode::InhibitTerminalFlag),
            7 => Ok(ModeCode::OverrideInhibitTerminalFlag),
            8 => Ok(ModeCode::ResetRemoteTerminal),
            16 => Ok(ModeCode::TransmitVectorWord),
            17 => Ok(ModeCode::SynchronizeWithData),
            18 => Ok(ModeCode::TransmitLastCommand),
            19 => Ok(ModeCode::TransmitBitWord),
            20 => Ok(ModeCode::SelectedTransmitterShutdown),
            21 => Ok(ModeCode::OverrideSelectedTransmitterShutdown),
            _ => Err(BiuError::param(1, "mode_code", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_word_layout() -> Result<()> {
        let cw = CommandWord::new(Address::new(31)?, Direction::Receive, SubAddress::new(5)?, 5);
        assert_eq!(cw.raw(), (31 << 11) | (5 << 5) | 5);
        assert!(cw.is_broadcast());
        assert_eq!(cw.data_words(), 5);
        Ok(())
    }

    #[test]
    fn test_command_word_full_count() -> Result<()> {
        let cw = CommandWord::new(Address::new(3)?, Direction::Transmit, SubAddress::new(1)?, 32);
        assert_eq!(cw.word_count_field(), 0);
        assert_eq!(cw.data_words(), 32);
        assert_eq!(cw.direction(), Direction::Transmit);
        Ok(())
    }

    #[test]
    fn test_mode_code_data_words() -> Result<()> {
        let tx_status = CommandWord::new(Address::new(1)?, Direction::Transmit, SubAddress::new(31)?, 2);
        assert_eq!(tx_status.data_words(), 0);
        let vector = CommandWord::new(Address::new(1)?, Direction::Transmit, SubAddress::new(0)?, 16);
        assert_eq!(vector.data_words(), 1);
        Ok(())
    }

    #[test]
    fn test_status_word_bits() -> Result<()> {
        let mut sw = StatusWord::for_rt(Address::new(3)?);
        sw.set_busy(true);
        assert_eq!(sw.raw(), (3 << 11) | 0x0008);
        assert_eq!(sw.flags(), 0x0008);
        Ok(())
    }

    #[test]
    fn test_mode_code_conversion() {
        let code: ModeCode = 2u8.try_into().unwrap();
        assert_eq!(code, ModeCode::TransmitStatusWord);
        assert!(!code.has_data_word());

        let result: Result<ModeCode> = 9u8.try_into();
        assert!(result.is_err());
    }
}
