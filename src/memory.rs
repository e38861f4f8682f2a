//! Device memory access
//!
//! All engine state that the host and the bus engine share lives in a flat
//! 32-bit word addressed memory. Words are stored big-endian regardless of
//! host byte order; only the typed accessors touch the byte image.

use crate::error::{BiuError, Result};

/// Typed access to BIU device memory
pub trait DeviceMemory {
    /// Size of the memory in bytes
    fn size(&self) -> u32;

    /// Read one 32-bit word at a 4-byte aligned byte address
    fn read_u32(&self, addr: u32) -> Result<u32>;

    /// Write one 32-bit word at a 4-byte aligned byte address
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Read a 16-bit half word at a 2-byte aligned address
    fn read_u16(&self, addr: u32) -> Result<u16> {
        let word = self.read_u32(addr & !3)?;
        Ok(if addr & 2 == 0 {
            (word >> 16) as u16
        } else {
            word as u16
        })
    }

    /// Write a 16-bit half word at a 2-byte aligned address
    fn write_u16(&mut self, addr: u32, value: u16) -> Result<()> {
        let base = addr & !3;
        let word = self.read_u32(base)?;
        let merged = if addr & 2 == 0 {
            (word & 0x0000_FFFF) | ((value as u32) << 16)
        } else {
            (word & 0xFFFF_0000) | value as u32
        };
        self.write_u32(base, merged)
    }

    /// Read `out.len()` consecutive words
    fn read_block(&self, addr: u32, out: &mut [u32]) -> Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_u32(addr + 4 * i as u32)?;
        }
        Ok(())
    }

    /// Write consecutive words
    fn write_block(&mut self, addr: u32, words: &[u32]) -> Result<()> {
        for (i, word) in words.iter().enumerate() {
            self.write_u32(addr + 4 * i as u32, *word)?;
        }
        Ok(())
    }

    /// Fill `count` words with the same value
    fn fill(&mut self, addr: u32, count: u32, value: u32) -> Result<()> {
        for i in 0..count {
            self.write_u32(addr + 4 * i, value)?;
        }
        Ok(())
    }
}

/// In-process device memory image
#[derive(Debug, Clone)]
pub struct SimMemory {
    bytes: Vec<u8>,
}

impl SimMemory {
    /// Create a zeroed memory image of `size` bytes (rounded down to words)
    pub fn new(size: u32) -> Self {
        SimMemory {
            bytes: vec![0; (size & !3) as usize],
        }
    }

    fn check(&self, addr: u32, width: u32) -> Result<usize> {
        let end = addr as u64 + width as u64;
        if addr % width != 0 || end > self.bytes.len() as u64 {
            return Err(BiuError::AddressOutOfRange(addr));
        }
        Ok(addr as usize)
    }
}

impl DeviceMemory for SimMemory {
    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read_u32(&self, addr: u32) -> Result<u32> {
        let at = self.check(addr, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at..at + 4]);
        Ok(u32::from_be_bytes(raw))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        let at = self.check(addr, 4)?;
        self.bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

impl<M: DeviceMemory + ?Sized> DeviceMemory for Box<M> {
    fn size(&self) -> u32 {
        (**self).size()
    }

    fn read_u32(&self, addr: u32) -> Result<u32> {
        (**self).read_u32(addr)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        (**self).write_u32(addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_round_trip() -> Result<()> {
        let mut mem = SimMemory::new(64);
        mem.write_u32(8, 0xDEAD_BEEF)?;
        assert_eq!(mem.read_u32(8)?, 0xDEAD_BEEF);
        Ok(())
    }

    #[test]
    fn test_half_words_are_big_endian_within_word() -> Result<()> {
        let mut mem = SimMemory::new(16);
        mem.write_u32(0, 0x1111_2222)?;
        assert_eq!(mem.read_u16(0)?, 0x1111);
        assert_eq!(mem.read_u16(2)?, 0x2222);
        mem.write_u16(2, 0xABCD)?;
        assert_eq!(mem.read_u32(0)?, 0x1111_ABCD);
        Ok(())
    }

    #[test]
    fn test_out_of_range_and_misaligned() {
        let mut mem = SimMemory::new(16);
        assert_eq!(mem.read_u32(16), Err(BiuError::AddressOutOfRange(16)));
        assert!(mem.write_u32(2, 0).is_err());
    }

    #[test]
    fn test_block_access() -> Result<()> {
        let mut mem = SimMemory::new(64);
        mem.write_block(16, &[1, 2, 3])?;
        let mut out = [0u32; 3];
        mem.read_block(16, &mut out)?;
        assert_eq!(out, [1, 2, 3]);
        mem.fill(16, 3, 7)?;
        mem.read_block(16, &mut out)?;
        assert_eq!(out, [7, 7, 7]);
        Ok(())
    }
}
