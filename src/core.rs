//! Core addressing types shared by every part of the bus interface

use crate::error::{BiuError, Result};

/// Bus identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bus {
    /// Bus A (primary)
    #[default]
    BusA,
    /// Bus B (redundant)
    BusB,
}

impl Bus {
    /// Convert bus to bit representation
    pub fn as_bit(&self) -> u8 {
        match self {
            Bus::BusA => 0,
            Bus::BusB => 1,
        }
    }

    /// Decode the bus from a single bit
    pub fn from_bit(bit: u32) -> Self {
        if bit & 1 == 0 {
            Bus::BusA
        } else {
            Bus::BusB
        }
    }

    /// The other bus of the redundant pair
    pub fn alternate(&self) -> Self {
        match self {
            Bus::BusA => Bus::BusB,
            Bus::BusB => Bus::BusA,
        }
    }
}

impl std::fmt::Display for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bus::BusA => write!(f, "Bus A"),
            Bus::BusB => write!(f, "Bus B"),
        }
    }
}

/// Remote terminal address (0-30, with 31 being broadcast)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(u8);

impl Address {
    /// Maximum address value (31)
    pub const MAX: u8 = 31;
    /// Broadcast address
    pub const BROADCAST: u8 = 31;

    /// Create a new address, validating it's within range [0, 31]
    pub fn new(addr: u8) -> Result<Self> {
        if addr > Self::MAX {
            return Err(BiuError::param(1, "rt_addr", addr));
        }
        Ok(Address(addr))
    }

    /// Create a broadcast address
    pub fn broadcast() -> Self {
        Address(Self::BROADCAST)
    }

    /// Get the raw address value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Check if this is a broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "RT-31 (broadcast)")
        } else {
            write!(f, "RT-{}", self.0)
        }
    }
}

/// Subaddress or mode-code selector (0-31)
///
/// Subaddresses 0 and 31 select mode-code transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubAddress(u8);

impl SubAddress {
    /// Highest subaddress
    pub const MAX: u8 = 31;

    /// Create a new sub-address (0-31)
    pub fn new(sa: u8) -> Result<Self> {
        if sa > Self::MAX {
            return Err(BiuError::param(1, "sa", sa));
        }
        Ok(SubAddress(sa))
    }

    /// Get the raw sub-address value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Check whether this selects a mode code
    pub fn is_mode_code(&self) -> bool {
        self.0 == 0 || self.0 == 31
    }
}

/// Transfer direction as seen from the remote terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// RT receives data
    Receive,
    /// RT transmits data
    Transmit,
}

impl Direction {
    /// The T/R bit of a command word
    pub fn as_bit(&self) -> u16 {
        match self {
            Direction::Receive => 0,
            Direction::Transmit => 1,
        }
    }

    /// Decode from the T/R bit
    pub fn from_bit(bit: u16) -> Self {
        if bit & 1 == 0 {
            Direction::Receive
        } else {
            Direction::Transmit
        }
    }
}

/// Convert a logical word count (1-32) into the 5-bit command field
pub fn word_count_field(count: u8) -> u16 {
    (count as u16) & 0x1F
}

/// Convert the 5-bit command field back into a data word count
pub fn word_count_from_field(field: u16) -> usize {
    match field & 0x1F {
        0 => 32,
        n => n as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_creation() {
        assert!(Address::new(0).is_ok());
        assert!(Address::new(31).is_ok());
        assert!(Address::new(32).is_err());
    }

    #[test]
    fn test_address_broadcast() {
        let addr = Address::broadcast();
        assert!(addr.is_broadcast());
        assert_eq!(addr.to_string(), "RT-31 (broadcast)");
    }

    #[test]
    fn test_subaddress_mode_code() {
        assert!(SubAddress::new(0).unwrap().is_mode_code());
        assert!(SubAddress::new(31).unwrap().is_mode_code());
        assert!(!SubAddress::new(5).unwrap().is_mode_code());
        assert!(SubAddress::new(32).is_err());
    }

    #[test]
    fn test_word_count_field() {
        assert_eq!(word_count_field(32), 0);
        assert_eq!(word_count_from_field(0), 32);
        assert_eq!(word_count_from_field(word_count_field(7)), 7);
    }

    #[test]
    fn test_bus_display() {
        assert_eq!(Bus::BusA.to_string(), "Bus A");
        assert_eq!(Bus::BusB.to_string(), "Bus B");
        assert_eq!(Bus::BusA.alternate(), Bus::BusB);
    }
}
