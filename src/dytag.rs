//! Dynamic data word generation
//!
//! Up to four generator slots per transfer rewrite single words of the
//! transmit buffer before each transmission.

use log::debug;
use std::collections::BTreeMap;

use crate::core::word_count_from_field;
use crate::error::{BiuError, Result};
use crate::memory::DeviceMemory;
use crate::transfer::TransferStore;

/// Generator slots per transfer
pub const MAX_SLOTS: usize = 4;

/// Generator function of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DytagFunction {
    /// Slot unused
    #[default]
    Disabled = 0,
    /// min, min+step, ... wrapping to min past max
    PositiveRamp = 1,
    /// max, max-step, ... wrapping to max below min
    NegativeRamp = 2,
    /// Up from min to max and back down
    PositiveTriangle = 3,
    /// Down from max to min and back up
    NegativeTriangle = 4,
    /// Fixed substitution value (`min`)
    TransmitWord = 5,
    /// Running transmission counter, masked by `max`
    SyncCounter = 6,
}

impl DytagFunction {
    /// Decode the function code
    pub fn from_raw(value: u8) -> Result<Self> {
        Ok(match value {
            0 => DytagFunction::Disabled,
            1 => DytagFunction::PositiveRamp,
            2 => DytagFunction::NegativeRamp,
            3 => DytagFunction::PositiveTriangle,
            4 => DytagFunction::NegativeTriangle,
            5 => DytagFunction::TransmitWord,
            6 => DytagFunction::SyncCounter,
            _ => return Err(BiuError::param(2, "dytag_fct", value)),
        })
    }
}

/// Definition of one generator slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DytagSpec {
    /// Function
    pub function: DytagFunction,
    /// Lower limit (or substituted word)
    pub min: u16,
    /// Upper limit (or counter mask)
    pub max: u16,
    /// Increment per transmission
    pub step: u16,
    /// Data word position, 1-based
    pub word_pos: u8,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    spec: DytagSpec,
    value: u16,
    rising: bool,
    count: u16,
}

impl Slot {
    fn new(spec: DytagSpec) -> Self {
        let (value, rising) = match spec.function {
            DytagFunction::NegativeRamp | DytagFunction::NegativeTriangle => (spec.max, false),
            _ => (spec.min, true),
        };
        Slot {
            spec,
            value,
            rising,
            count: 0,
        }
    }

    /// Value to transmit now; advances the generator
    fn next(&mut self) -> u16 {
        let DytagSpec { min, max, step, .. } = self.spec;
        match self.spec.function {
            DytagFunction::Disabled | DytagFunction::TransmitWord => min,
            DytagFunction::SyncCounter => {
                let out = self.count & max;
                self.count = self.count.wrapping_add(step.max(1));
                out
            }
            DytagFunction::PositiveRamp => {
                let out = self.value;
                self.value = match self.value.checked_add(step) {
                    Some(v) if v <= max => v,
                    _ => min,
                };
                out
            }
            DytagFunction::NegativeRamp => {
                let out = self.value;
                self.value = match self.value.checked_sub(step) {
                    Some(v) if v >= min => v,
                    _ => max,
                };
                out
            }
            DytagFunction::PositiveTriangle | DytagFunction::NegativeTriangle => {
                let out = self.value;
                if self.rising {
                    match self.value.checked_add(step) {
                        Some(v) if v <= max => self.value = v,
                        _ => {
                            self.rising = false;
                            self.value = self.value.saturating_sub(step).max(min);
                        }
                    }
                } else {
                    match self.value.checked_sub(step) {
                        Some(v) if v >= min => self.value = v,
                        _ => {
                            self.rising = true;
                            self.value = self.value.saturating_add(step).min(max);
                        }
                    }
                }
                out
            }
        }
    }
}

/// Dynamic tag state of all transfers
#[derive(Debug, Clone, Default)]
pub struct DytagGenerator {
    slots: BTreeMap<u16, Vec<Slot>>,
}

impl DytagGenerator {
    /// Create a generator with no tags
    pub fn new() -> Self {
        DytagGenerator::default()
    }

    /// Attach generator slots to a defined transfer
    ///
    /// An empty slot list (or only disabled slots) removes the tags.
    pub fn define<M: DeviceMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        store: &mut TransferStore,
        xid: u16,
        specs: &[DytagSpec],
    ) -> Result<()> {
        let transfer = store.read(xid)?;
        if specs.len() > MAX_SLOTS {
            return Err(BiuError::param(2, "dytag_slots", specs.len() as u32));
        }
        let words = word_count_from_field(transfer.word_count as u16);
        for spec in specs.iter().filter(|s| s.function != DytagFunction::Disabled) {
            if spec.word_pos == 0 || spec.word_pos as usize > words {
                return Err(BiuError::param(6, "dytag_wpos", spec.word_pos));
            }
            let ranged = !matches!(
                spec.function,
                DytagFunction::TransmitWord | DytagFunction::SyncCounter
            );
            if ranged && spec.min > spec.max {
                return Err(BiuError::param(3, "dytag_min", spec.min));
            }
        }
        let active: Vec<Slot> = specs
            .iter()
            .filter(|s| s.function != DytagFunction::Disabled)
            .map(|s| Slot::new(*s))
            .collect();
        let enabled = !active.is_empty();
        store.set_dytag_enabled(mem, xid, enabled)?;
        if enabled {
            debug!("transfer {}: {} dynamic tag slot(s)", xid, active.len());
            self.slots.insert(xid, active);
        } else {
            self.slots.remove(&xid);
        }
        Ok(())
    }

    /// Whether a transfer has active tags
    pub fn is_enabled(&self, xid: u16) -> bool {
        self.slots.contains_key(&xid)
    }

    /// Write the next generated words into a transmit buffer
    pub fn apply<M: DeviceMemory + ?Sized>(&mut self, mem: &mut M, xid: u16, buffer_addr: u32) -> Result<()> {
        if let Some(slots) = self.slots.get_mut(&xid) {
            for slot in slots.iter_mut() {
                let value = slot.next();
                let addr = buffer_addr + 2 * (slot.spec.word_pos as u32 - 1);
                mem.write_u16(addr, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(spec: DytagSpec, n: usize) -> Vec<u16> {
        let mut slot = Slot::new(spec);
        (0..n).map(|_| slot.next()).collect()
    }

    fn spec(function: DytagFunction, min: u16, max: u16, step: u16) -> DytagSpec {
        DytagSpec {
            function,
            min,
            max,
            step,
            word_pos: 1,
        }
    }

    #[test]
    fn test_positive_ramp_wraps() {
        assert_eq!(run(spec(DytagFunction::PositiveRamp, 0, 4, 2), 5), vec![0, 2, 4, 0, 2]);
    }

    #[test]
    fn test_negative_ramp_wraps() {
        assert_eq!(run(spec(DytagFunction::NegativeRamp, 1, 5, 2), 5), vec![5, 3, 1, 5, 3]);
    }

    #[test]
    fn test_triangle_turns_at_limits() {
        assert_eq!(
            run(spec(DytagFunction::PositiveTriangle, 0, 3, 1), 8),
            vec![0, 1, 2, 3, 2, 1, 0, 1]
        );
        assert_eq!(
            run(spec(DytagFunction::NegativeTriangle, 0, 2, 1), 6),
            vec![2, 1, 0, 1, 2, 1]
        );
    }

    #[test]
    fn test_sync_counter_masks() {
        assert_eq!(run(spec(DytagFunction::SyncCounter, 0, 0x3, 1), 6), vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_transmit_word_is_constant() {
        assert_eq!(run(spec(DytagFunction::TransmitWord, 0xBEEF, 0, 0), 3), vec![0xBEEF; 3]);
    }
}
