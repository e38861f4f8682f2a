//! Engine configuration and device memory layout

use crate::error::{BiuError, Result};
use std::time::Duration;

/// Bytes per transfer descriptor (8 words)
pub const DESCRIPTOR_BYTES: u32 = 32;
/// Bytes per buffer header (4 words)
pub const HEADER_BYTES: u32 = 16;
/// Bytes per status or event queue entry (4 words)
pub const QUEUE_ENTRY_BYTES: u32 = 16;
/// Bytes per data buffer (32 words of 16 bits)
pub const DATA_BUFFER_BYTES: u32 = 64;
/// Bytes reserved for the control block
pub const CONTROL_BLOCK_BYTES: u32 = 0x400;

/// How labels are addressed when a table is compiled at a destination offset
///
/// `Relocated` resolves labels to where the code finally lands
/// (`base + offset + 4 * index`); `TableBase` keeps the historical behaviour
/// of resolving against the instruction area base only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LabelBase {
    /// Labels include the destination offset
    #[default]
    Relocated,
    /// Labels ignore the destination offset
    TableBase,
}

/// Tunable parameters for a bus interface unit
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BiuConfig {
    /// Highest transfer id (ids start at 1)
    pub max_xfer_id: u16,
    /// Highest buffer header id
    pub max_header_id: u16,
    /// Highest data buffer id
    pub max_buffer_id: u16,
    /// Words reserved for status and event queues of all headers
    pub queue_pool_words: u32,
    /// Capacity of the user instruction area in instructions
    pub instr_table_words: u32,
    /// Bus monitor ring capacity in bytes
    pub monitor_buffer_bytes: u32,
    /// BC no-response timeout in units of 0.25 µs
    pub response_timeout_qus: u16,
    /// Deadline for each board-enable handshake step, in milliseconds
    pub board_enable_timeout_ms: u64,
    /// Status polls before the simulated firmware reports an enable bit
    pub board_enable_latency_polls: u32,
    /// Label resolution for offset compiles
    pub label_base: LabelBase,
}

impl Default for BiuConfig {
    fn default() -> Self {
        BiuConfig {
            max_xfer_id: 4095,
            max_header_id: 4095,
            max_buffer_id: 4095,
            queue_pool_words: 0x8000,
            instr_table_words: 1024,
            monitor_buffer_bytes: 0x1_0000,
            response_timeout_qus: 56,
            board_enable_timeout_ms: 500,
            board_enable_latency_polls: 3,
            label_base: LabelBase::Relocated,
        }
    }
}

impl BiuConfig {
    /// Load a configuration from JSON; missing fields take their defaults
    #[cfg(feature = "serde")]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: BiuConfig =
            serde_json::from_str(text).map_err(|e| BiuError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internally inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.max_xfer_id == 0 {
            return Err(BiuError::config("max_xfer_id must be at least 1"));
        }
        if self.max_header_id == 0 || self.max_buffer_id == 0 {
            return Err(BiuError::config("header and buffer pools must not be empty"));
        }
        if self.monitor_buffer_bytes < 64 || self.monitor_buffer_bytes % 4 != 0 {
            return Err(BiuError::config("monitor buffer must be word aligned and >= 64 bytes"));
        }
        if self.instr_table_words == 0 {
            return Err(BiuError::config("instruction area must not be empty"));
        }
        Ok(())
    }

    /// Deadline for one board-enable step
    pub fn board_enable_timeout(&self) -> Duration {
        Duration::from_millis(self.board_enable_timeout_ms)
    }

    /// Derive the device memory map from this configuration
    pub fn layout(&self) -> MemoryLayout {
        MemoryLayout::new(self)
    }
}

/// Byte addresses of every region of device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryLayout {
    /// System control block
    pub cb_base: u32,
    /// Transfer descriptors; the second half holds paired high-speed slots
    pub xfer_base: u32,
    /// Descriptor slots per half
    pub xfer_slots: u32,
    /// Buffer headers
    pub bh_base: u32,
    /// Status and event queue pool
    pub queue_base: u32,
    /// Queue pool size in bytes
    pub queue_size: u32,
    /// Data buffers
    pub buf_base: u32,
    /// User instruction area
    pub instr_base: u32,
    /// User instruction area capacity in instructions
    pub instr_words: u32,
    /// Frame program area written by the scheduler
    pub frame_base: u32,
    /// Frame program area size in bytes
    pub frame_size: u32,
    /// Bus monitor ring
    pub bm_base: u32,
    /// Bus monitor ring size in bytes
    pub bm_size: u32,
    /// Total device memory in bytes
    pub total: u32,
}

impl MemoryLayout {
    /// Words reserved per minor frame in the frame program area (code plus RET)
    pub const MINOR_FRAME_WORDS: u32 = crate::limits::MAX_MINOR_FRAME_INSTRUCTIONS as u32 + 1;

    fn new(config: &BiuConfig) -> Self {
        let cb_base = 0;
        let xfer_base = cb_base + CONTROL_BLOCK_BYTES;
        let xfer_slots = config.max_xfer_id as u32 + 1;
        let bh_base = xfer_base + 2 * xfer_slots * DESCRIPTOR_BYTES;
        let queue_base = bh_base + (config.max_header_id as u32 + 1) * HEADER_BYTES;
        let queue_size = config.queue_pool_words * 4;
        let buf_base = queue_base + queue_size;
        let instr_base = buf_base + (config.max_buffer_id as u32 + 1) * DATA_BUFFER_BYTES;
        let frame_base = instr_base + config.instr_table_words * 4;
        let frame_words = crate::limits::MAX_MINOR_FRAMES as u32 * Self::MINOR_FRAME_WORDS
            + 2 * crate::limits::MAX_MAJOR_FRAME_ENTRIES as u32
            + 16;
        let frame_size = frame_words * 4;
        let bm_base = frame_base + frame_size;
        let bm_size = config.monitor_buffer_bytes;
        MemoryLayout {
            cb_base,
            xfer_base,
            xfer_slots,
            bh_base,
            queue_base,
            queue_size,
            buf_base,
            instr_base,
            instr_words: config.instr_table_words,
            frame_base,
            frame_size,
            bm_base,
            bm_size,
            total: bm_base + bm_size,
        }
    }

    /// Descriptor address of a transfer id
    pub fn descriptor_addr(&self, xid: u16) -> u32 {
        self.xfer_base + xid as u32 * DESCRIPTOR_BYTES
    }

    /// Buffer header address of a header id
    pub fn header_addr(&self, hid: u16) -> u32 {
        self.bh_base + hid as u32 * HEADER_BYTES
    }

    /// Data buffer address of a buffer id
    pub fn buffer_addr(&self, bid: u16) -> u32 {
        self.buf_base + bid as u32 * DATA_BUFFER_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_contiguous() {
        let layout = BiuConfig::default().layout();
        assert_eq!(layout.xfer_base, CONTROL_BLOCK_BYTES);
        assert!(layout.bh_base > layout.descriptor_addr(4095));
        assert!(layout.buf_base >= layout.queue_base + layout.queue_size);
        assert!(layout.frame_base >= layout.instr_base + layout.instr_words * 4);
        assert_eq!(layout.total, layout.bm_base + layout.bm_size);
    }

    #[test]
    fn test_descriptor_address() {
        let layout = BiuConfig::default().layout();
        assert_eq!(layout.descriptor_addr(3), layout.xfer_base + 96);
    }

    #[test]
    fn test_validate_rejects_empty_pools() {
        let config = BiuConfig {
            max_xfer_id: 0,
            ..BiuConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(BiuConfig::default().validate().is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_json_partial() -> Result<()> {
        let config = BiuConfig::from_json(r#"{ "max_xfer_id": 255, "label_base": "TableBase" }"#)?;
        assert_eq!(config.max_xfer_id, 255);
        assert_eq!(config.label_base, LabelBase::TableBase);
        assert_eq!(config.instr_table_words, 1024);
        Ok(())
    }
}
