//! Instruction-table compiler
//!
//! Turns a symbolic program of opcodes with labels into 32-bit firmware
//! words `(opcode << 26) | operand`. Compilation runs in two passes: the
//! first assigns an address to every labelled line, the second encodes each
//! line's operand, resolving branch labels through the first pass.

use bitfield::bitfield;
use log::debug;
use std::collections::BTreeMap;

use crate::config::{LabelBase, MemoryLayout, DESCRIPTOR_BYTES};
use crate::error::{BiuError, CompileErrorKind, Result};
use crate::memory::DeviceMemory;

/// Operand field width
pub const OPERAND_MASK: u32 = 0x03FF_FFFF;

bitfield! {
    /// One firmware instruction
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct InstructionWord(u32);
    impl Debug;
    pub u8, opcode, set_opcode: 31, 26;
    pub u32, operand, set_operand: 25, 0;
}

impl InstructionWord {
    /// Assemble an instruction word
    pub fn new(op: Opcode, operand: u32) -> Self {
        let mut word = InstructionWord(0);
        word.set_opcode(op as u8);
        word.set_operand(operand & OPERAND_MASK);
        word
    }

    /// Decoded opcode, if the code is known
    pub fn op(&self) -> Option<Opcode> {
        Opcode::from_code(self.opcode())
    }
}

/// Firmware opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Opcode {
    /// Execute the transfer whose descriptor is at the operand address
    Xfer = 0x10,
    /// Execute an enhanced-format transfer by id
    EfexXfer = 0x11,
    /// Call a subtable
    Call = 0x20,
    /// Return from a subtable
    Ret = 0x21,
    /// Jump; operand 0 ends the program
    Jump = 0x22,
    /// Skip a relative instruction count
    Skip = 0x24,
    /// Wait for a trigger source
    WaitTrigger = 0x25,
    /// Pulse the strobe output
    Strobe = 0x26,
    /// Decrement the cycle counter and jump when it reaches zero
    DecJumpZero = 0x27,
    /// Wait for the next minor frame time slot
    WaitMinorFrame = 0x28,
    /// Halt the bus controller
    Halt = 0x29,
    /// Delay by the operand in microseconds
    Delay = 0x2A,
    /// Apply the modify descriptor at the operand address
    Modify = 0x2B,
    /// Change the minor frame time (operand in microseconds)
    ChangeMinorFrameTime = 0x2C,
    /// Reset the major frame counter
    ResetMajorFrame = 0x2D,
    /// Return if the previous transfer ended in error
    ReturnOnXferError = 0x2F,
}

impl Opcode {
    /// Decode a 6-bit opcode
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x10 => Opcode::Xfer,
            0x11 => Opcode::EfexXfer,
            0x20 => Opcode::Call,
            0x21 => Opcode::Ret,
            0x22 => Opcode::Jump,
            0x24 => Opcode::Skip,
            0x25 => Opcode::WaitTrigger,
            0x26 => Opcode::Strobe,
            0x27 => Opcode::DecJumpZero,
            0x28 => Opcode::WaitMinorFrame,
            0x29 => Opcode::Halt,
            0x2A => Opcode::Delay,
            0x2B => Opcode::Modify,
            0x2C => Opcode::ChangeMinorFrameTime,
            0x2D => Opcode::ResetMajorFrame,
            0x2F => Opcode::ReturnOnXferError,
            _ => return None,
        })
    }
}

/// One line of a symbolic instruction table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableEntry {
    /// Label of this line (0 = none)
    pub label: u16,
    /// Opcode
    pub op: Opcode,
    /// First parameter (transfer id, target label, count or immediate)
    pub par1: u32,
    /// Second parameter (paired-slot flag, skip condition or wait source)
    pub par2: u32,
}

impl TableEntry {
    /// An unlabelled line
    pub fn new(op: Opcode, par1: u32, par2: u32) -> Self {
        TableEntry {
            label: 0,
            op,
            par1,
            par2,
        }
    }

    /// The same line carrying a label
    pub fn labelled(mut self, label: u16) -> Self {
        self.label = label;
        self
    }
}

/// What a compile call does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompileMode {
    /// Zero the instruction area
    Clear = 0,
    /// Compile only
    Convert = 1,
    /// Write previously compiled words
    Write = 2,
    /// Compile and write
    ConvertWrite = 3,
    /// Compile for a destination offset
    ConvertOffset = 4,
    /// Compile for a destination offset and write
    ConvertOffsetWrite = 5,
}

impl CompileMode {
    /// Decode the mode
    pub fn from_raw(value: u8) -> Result<Self> {
        Ok(match value {
            0 => CompileMode::Clear,
            1 => CompileMode::Convert,
            2 => CompileMode::Write,
            3 => CompileMode::ConvertWrite,
            4 => CompileMode::ConvertOffset,
            5 => CompileMode::ConvertOffsetWrite,
            _ => return Err(BiuError::param(1, "mode", value)),
        })
    }

    fn converts(&self) -> bool {
        !matches!(self, CompileMode::Clear | CompileMode::Write)
    }

    fn writes(&self) -> bool {
        matches!(
            self,
            CompileMode::Write | CompileMode::ConvertWrite | CompileMode::ConvertOffsetWrite
        )
    }

    fn relocates(&self) -> bool {
        matches!(self, CompileMode::ConvertOffset | CompileMode::ConvertOffsetWrite)
    }
}

/// Result of a compilation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledTable {
    /// Encoded words in table order
    pub words: Vec<u32>,
    /// Resolved label addresses
    pub labels: BTreeMap<u16, u32>,
    /// Address of the first word once written
    pub start_addr: u32,
}

impl CompiledTable {
    /// Address a label resolved to
    pub fn label_address(&self, label: u16) -> Option<u32> {
        self.labels.get(&label).copied()
    }
}

/// Two-pass assembler for one instruction area
#[derive(Debug, Clone)]
pub struct Compiler {
    area_base: u32,
    area_words: u32,
    xfer_base: u32,
    xfer_slots: u32,
    label_base: LabelBase,
}

impl Compiler {
    /// Compiler for the user instruction area
    pub fn new(layout: &MemoryLayout, label_base: LabelBase) -> Self {
        Compiler {
            area_base: layout.instr_base,
            area_words: layout.instr_words,
            xfer_base: layout.xfer_base,
            xfer_slots: layout.xfer_slots,
            label_base,
        }
    }

    /// Compiler for an arbitrary area (used for scheduler-generated code)
    pub fn for_area(layout: &MemoryLayout, area_base: u32, area_words: u32) -> Self {
        Compiler {
            area_base,
            area_words,
            xfer_base: layout.xfer_base,
            xfer_slots: layout.xfer_slots,
            label_base: LabelBase::Relocated,
        }
    }

    /// Base address of the area this compiler writes into
    pub fn area_base(&self) -> u32 {
        self.area_base
    }

    fn area_end(&self) -> u64 {
        self.area_base as u64 + 4 * self.area_words as u64
    }

    /// `words` instruction words placed at `dest_offset` stay inside the area
    fn check_placement(&self, dest_offset: u32, words: usize) -> Result<()> {
        if dest_offset % 4 != 0 {
            return Err(BiuError::param(2, "dest_offset", dest_offset));
        }
        let end = self.area_base as u64 + dest_offset as u64 + 4 * words as u64;
        if end > self.area_end() {
            return Err(BiuError::compile(0, CompileErrorKind::DestinationOverflow));
        }
        Ok(())
    }

    /// Compile a table for placement at `dest_offset` bytes into the area
    pub fn compile(&self, entries: &[TableEntry], dest_offset: u32) -> Result<CompiledTable> {
        self.check_placement(dest_offset, entries.len())?;
        let label_offset = match self.label_base {
            LabelBase::Relocated => dest_offset,
            LabelBase::TableBase => 0,
        };

        let mut labels = BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if entry.label == 0 {
                continue;
            }
            if entries[i + 1..].iter().any(|e| e.label == entry.label) {
                return Err(BiuError::compile(i, CompileErrorKind::DuplicateLabel));
            }
            labels.insert(entry.label, self.area_base + label_offset + 4 * i as u32);
        }

        let words = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let operand = self
                    .operand(entry, &labels)
                    .map_err(|kind| BiuError::compile(i, kind))?;
                Ok(InstructionWord::new(entry.op, operand).0)
            })
            .collect::<Result<Vec<u32>>>()?;

        debug!(
            "compiled {} instruction(s), {} label(s), offset 0x{:X}",
            words.len(),
            labels.len(),
            dest_offset
        );
        Ok(CompiledTable {
            words,
            labels,
            start_addr: self.area_base + dest_offset,
        })
    }

    fn operand(
        &self,
        entry: &TableEntry,
        labels: &BTreeMap<u16, u32>,
    ) -> std::result::Result<u32, CompileErrorKind> {
        let resolve = |label: u32| -> std::result::Result<u32, CompileErrorKind> {
            if label == 0 {
                return Err(CompileErrorKind::ZeroOperand);
            }
            u16::try_from(label)
                .ok()
                .and_then(|l| labels.get(&l).copied())
                .ok_or(CompileErrorKind::UnresolvedLabel)
        };
        let p1 = entry.par1;
        let p2 = entry.par2;
        Ok(match entry.op {
            Opcode::Xfer => {
                if p1 == 0 || p1 >= self.xfer_slots {
                    return Err(CompileErrorKind::TransferOutOfRange);
                }
                let slot = if p2 != 0 { p1 + self.xfer_slots } else { p1 };
                self.xfer_base + slot * DESCRIPTOR_BYTES
            }
            Opcode::EfexXfer => p1 & OPERAND_MASK,
            Opcode::Call | Opcode::DecJumpZero => resolve(p1)?,
            Opcode::Jump => {
                if p1 == 0 {
                    0
                } else {
                    resolve(p1)?
                }
            }
            Opcode::Skip => {
                if p1 & 0xFFFF == 0 {
                    return Err(CompileErrorKind::ZeroOperand);
                }
                (p1 & 0xFFFF) | ((p2 & 3) << 24)
            }
            Opcode::WaitTrigger => p2 & 3,
            Opcode::Delay => p1 & 0xFFFF,
            Opcode::Modify => p1 & OPERAND_MASK,
            Opcode::ChangeMinorFrameTime => p1 & 0xF_FFFF,
            Opcode::ResetMajorFrame => (p1 & 1) << 24,
            Opcode::Ret
            | Opcode::Strobe
            | Opcode::WaitMinorFrame
            | Opcode::Halt
            | Opcode::ReturnOnXferError => 0,
        })
    }

    /// Write compiled words at `dest_offset`; nothing is written if they do not fit
    pub fn flush<M: DeviceMemory + ?Sized>(&self, mem: &mut M, words: &[u32], dest_offset: u32) -> Result<u32> {
        self.check_placement(dest_offset, words.len())?;
        let start = self.area_base + dest_offset;
        mem.write_block(start, words)?;
        Ok(start)
    }

    /// Run one compile request
    ///
    /// `words` is only read in [`CompileMode::Write`]. The offset modes
    /// compile and write the whole table at `dest_offset`. The plain write
    /// modes keep table-base addresses and write the part of the table from
    /// `dest_offset` onwards at that same offset.
    pub fn generate<M: DeviceMemory + ?Sized>(
        &self,
        mem: &mut M,
        mode: CompileMode,
        dest_offset: u32,
        entries: &[TableEntry],
        words: &[u32],
    ) -> Result<CompiledTable> {
        if mode == CompileMode::Clear {
            mem.fill(self.area_base, self.area_words, 0)?;
            return Ok(CompiledTable {
                start_addr: self.area_base,
                ..CompiledTable::default()
            });
        }
        let table = if mode.relocates() {
            self.compile(entries, dest_offset)?
        } else if mode.converts() {
            self.compile(entries, 0)?
        } else {
            self.check_placement(0, words.len())?;
            CompiledTable {
                words: words.to_vec(),
                labels: BTreeMap::new(),
                start_addr: self.area_base,
            }
        };
        if mode.writes() {
            if mode.relocates() {
                self.flush(mem, &table.words, dest_offset)?;
            } else {
                let skip = (dest_offset / 4) as usize;
                if dest_offset % 4 != 0 || skip > table.words.len() {
                    return Err(BiuError::param(2, "dest_offset", dest_offset));
                }
                self.flush(mem, &table.words[skip..], dest_offset)?;
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiuConfig;
    use crate::memory::SimMemory;
    use proptest::prelude::*;

    fn compiler() -> (MemoryLayout, Compiler) {
        let config = BiuConfig::default();
        let layout = config.layout();
        (layout, Compiler::new(&layout, config.label_base))
    }

    #[test]
    fn test_encode_transfer_and_halt() -> Result<()> {
        let (layout, c) = compiler();
        let table = c.compile(
            &[TableEntry::new(Opcode::Xfer, 3, 0), TableEntry::new(Opcode::Halt, 0, 0)],
            0,
        )?;
        assert_eq!(table.words[0], (0x10 << 26) | (layout.xfer_base + 96));
        assert_eq!(table.words[1], 0x29 << 26);
        Ok(())
    }

    #[test]
    fn test_paired_transfer_slot() -> Result<()> {
        let (layout, c) = compiler();
        let table = c.compile(&[TableEntry::new(Opcode::Xfer, 2, 1)], 0)?;
        let expected = layout.xfer_base + (2 + layout.xfer_slots) * 32;
        assert_eq!(InstructionWord(table.words[0]).operand(), expected);
        Ok(())
    }

    #[test]
    fn test_labels_resolve_forward_and_backward() -> Result<()> {
        let (layout, c) = compiler();
        let entries = [
            TableEntry::new(Opcode::Call, 7, 0).labelled(1),
            TableEntry::new(Opcode::Jump, 1, 0),
            TableEntry::new(Opcode::Ret, 0, 0).labelled(7),
        ];
        let table = c.compile(&entries, 0)?;
        assert_eq!(table.words[0], (0x20 << 26) | (layout.instr_base + 8));
        assert_eq!(table.words[1], (0x22 << 26) | layout.instr_base);
        assert_eq!(table.label_address(7), Some(layout.instr_base + 8));
        Ok(())
    }

    #[test]
    fn test_duplicate_label_reports_first_line() {
        let (_, c) = compiler();
        let entries = [
            TableEntry::new(Opcode::Halt, 0, 0),
            TableEntry::new(Opcode::Halt, 0, 0).labelled(4),
            TableEntry::new(Opcode::Halt, 0, 0),
            TableEntry::new(Opcode::Halt, 0, 0).labelled(4),
        ];
        assert_eq!(
            c.compile(&entries, 0),
            Err(BiuError::compile(1, CompileErrorKind::DuplicateLabel))
        );
    }

    #[test]
    fn test_branch_errors() {
        let (_, c) = compiler();
        assert_eq!(
            c.compile(&[TableEntry::new(Opcode::Call, 0, 0)], 0),
            Err(BiuError::compile(0, CompileErrorKind::ZeroOperand))
        );
        assert_eq!(
            c.compile(&[TableEntry::new(Opcode::Halt, 0, 0), TableEntry::new(Opcode::Jump, 9, 0)], 0),
            Err(BiuError::compile(1, CompileErrorKind::UnresolvedLabel))
        );
        assert_eq!(
            c.compile(&[TableEntry::new(Opcode::Skip, 0, 1)], 0),
            Err(BiuError::compile(0, CompileErrorKind::ZeroOperand))
        );
        assert_eq!(
            c.compile(&[TableEntry::new(Opcode::Xfer, 4096, 0)], 0),
            Err(BiuError::compile(0, CompileErrorKind::TransferOutOfRange))
        );
    }

    #[test]
    fn test_jump_zero_ends_list() -> Result<()> {
        let (_, c) = compiler();
        let table = c.compile(&[TableEntry::new(Opcode::Jump, 0, 0)], 0)?;
        assert_eq!(table.words[0], 0x22 << 26);
        Ok(())
    }

    #[test]
    fn test_immediate_masks() -> Result<()> {
        let (_, c) = compiler();
        let table = c.compile(
            &[
                TableEntry::new(Opcode::Skip, 0x1_0002, 7),
                TableEntry::new(Opcode::Delay, 0x12_3456, 0),
                TableEntry::new(Opcode::ChangeMinorFrameTime, 0xFFF_FFFF, 0),
                TableEntry::new(Opcode::ResetMajorFrame, 3, 0),
                TableEntry::new(Opcode::WaitTrigger, 9, 6),
            ],
            0,
        )?;
        let operands: Vec<u32> = table.words.iter().map(|w| InstructionWord(*w).operand()).collect();
        assert_eq!(operands, vec![0x0300_0002, 0x3456, 0xF_FFFF, 1 << 24, 2]);
        Ok(())
    }

    #[test]
    fn test_offset_modes_relocate_labels() -> Result<()> {
        let (layout, c) = compiler();
        let mut mem = SimMemory::new(layout.total);
        let entries = [TableEntry::new(Opcode::Jump, 1, 0).labelled(1)];
        let table = c.generate(&mut mem, CompileMode::ConvertOffsetWrite, 0x40, &entries, &[])?;
        assert_eq!(table.start_addr, layout.instr_base + 0x40);
        assert_eq!(mem.read_u32(layout.instr_base + 0x40)?, (0x22 << 26) | (layout.instr_base + 0x40));

        let legacy = Compiler::new(&layout, LabelBase::TableBase);
        let table = legacy.compile(&entries, 0x40)?;
        assert_eq!(table.label_address(1), Some(layout.instr_base));
        Ok(())
    }

    #[test]
    fn test_overflow_writes_nothing() -> Result<()> {
        let (layout, c) = compiler();
        let mut mem = SimMemory::new(layout.total);
        let entries = vec![TableEntry::new(Opcode::Halt, 0, 0); 4];
        let offset = (layout.instr_words - 2) * 4;
        assert_eq!(
            c.generate(&mut mem, CompileMode::ConvertOffsetWrite, offset, &entries, &[]),
            Err(BiuError::compile(0, CompileErrorKind::DestinationOverflow))
        );
        assert_eq!(mem.read_u32(layout.instr_base + offset)?, 0);
        Ok(())
    }

    #[test]
    fn test_write_only_and_clear() -> Result<()> {
        let (layout, c) = compiler();
        let mut mem = SimMemory::new(layout.total);
        c.generate(&mut mem, CompileMode::Write, 8, &[], &[1, 2, 0xAAAA_5555])?;
        assert_eq!(mem.read_u32(layout.instr_base)?, 0);
        assert_eq!(mem.read_u32(layout.instr_base + 8)?, 0xAAAA_5555);
        c.generate(&mut mem, CompileMode::Clear, 0, &[], &[])?;
        assert_eq!(mem.read_u32(layout.instr_base + 8)?, 0);
        Ok(())
    }

    #[test]
    fn test_offset_beyond_area_is_rejected() {
        let (_, c) = compiler();
        let entries = [TableEntry::new(Opcode::Halt, 0, 0).labelled(1)];
        assert_eq!(
            c.compile(&entries, u32::MAX - 3),
            Err(BiuError::compile(0, CompileErrorKind::DestinationOverflow))
        );
        assert_eq!(
            c.compile(&entries, u32::MAX - 2),
            Err(BiuError::param(2, "dest_offset", u32::MAX - 2))
        );
    }

    #[test]
    fn test_convert_write_flushes_from_offset() -> Result<()> {
        let (layout, c) = compiler();
        let mut mem = SimMemory::new(layout.total);
        let entries = [
            TableEntry::new(Opcode::Strobe, 0, 0),
            TableEntry::new(Opcode::Strobe, 0, 0),
            TableEntry::new(Opcode::Jump, 1, 0).labelled(1),
        ];
        let table = c.generate(&mut mem, CompileMode::ConvertWrite, 8, &entries, &[])?;
        assert_eq!(table.label_address(1), Some(layout.instr_base + 8));
        assert_eq!(mem.read_u32(layout.instr_base)?, 0);
        assert_eq!(mem.read_u32(layout.instr_base + 4)?, 0);
        assert_eq!(mem.read_u32(layout.instr_base + 8)?, (0x22 << 26) | (layout.instr_base + 8));
        assert_eq!(
            c.generate(&mut mem, CompileMode::ConvertWrite, 16, &entries, &[]),
            Err(BiuError::param(2, "dest_offset", 16u32))
        );
        Ok(())
    }

    fn arb_entry() -> impl Strategy<Value = TableEntry> {
        prop_oneof![
            (1u32..100).prop_map(|x| TableEntry::new(Opcode::Xfer, x, 0)),
            (1u32..0xFFFF).prop_map(|n| TableEntry::new(Opcode::Skip, n, 0)),
            any::<u32>().prop_map(|d| TableEntry::new(Opcode::Delay, d, 0)),
            Just(TableEntry::new(Opcode::WaitMinorFrame, 0, 0)),
            Just(TableEntry::new(Opcode::Strobe, 0, 0)),
            Just(TableEntry::new(Opcode::Jump, 0, 0)),
        ]
    }

    proptest! {
        #[test]
        fn prop_convert_then_write_is_idempotent(
            body in proptest::collection::vec(arb_entry(), 1..40)
        ) {
            let (layout, c) = compiler();
            let mut entries = body;
            entries.push(TableEntry::new(Opcode::Jump, 1, 0));
            entries[0].label = 1;
            let mut mem = SimMemory::new(layout.total);
            let first = c.generate(&mut mem, CompileMode::Convert, 0, &entries, &[]).unwrap();
            let second = c.generate(&mut mem, CompileMode::ConvertWrite, 0, &entries, &[]).unwrap();
            prop_assert_eq!(&first.words, &second.words);
            let mut stored = vec![0u32; entries.len()];
            mem.read_block(layout.instr_base, &mut stored).unwrap();
            prop_assert_eq!(stored, second.words);
        }
    }
}
