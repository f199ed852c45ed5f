//! Dense register-file and spill-slot bookkeeping for the allocator.

use crate::backend::riscv::registers::Register;
use crate::common::error::AllocationError;
use crate::ir::statement::ValueRef;

/// Occupancy of the 32 physical registers at one program point: each entry
/// is the SSA value currently assigned to that register, or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    slots: [Option<ValueRef>; 32],
}

impl RegisterFile {
    pub fn new() -> Self {
        RegisterFile::default()
    }

    pub fn get(&self, register: Register) -> Option<ValueRef> {
        self.slots[register.index()]
    }

    pub fn set(&mut self, register: Register, value: ValueRef) {
        self.slots[register.index()] = Some(value);
    }

    pub fn clear(&mut self, register: Register) {
        self.slots[register.index()] = None;
    }

    /// Drop every entry holding `value`.
    pub fn clear_value(&mut self, value: ValueRef) {
        for slot in &mut self.slots {
            if *slot == Some(value) {
                *slot = None;
            }
        }
    }

    pub fn is_free(&self, register: Register) -> bool {
        self.slots[register.index()].is_none()
    }

    /// Highest-indexed free register, skipping x0 and the frame pointer.
    pub fn find_free(&self) -> Option<Register> {
        for index in (1..32).rev() {
            if index == Register::FP.index() {
                continue;
            }
            if self.slots[index].is_none() {
                return Some(Register::from_index(index));
            }
        }
        None
    }

    /// Registers currently holding a value, skipping x0 and the frame
    /// pointer (neither is ever an eviction candidate).
    pub fn occupied(&self) -> impl Iterator<Item = (Register, ValueRef)> + '_ {
        (1..32).filter(|&index| index != Register::FP.index()).filter_map(move |index| {
            self.slots[index].map(|value| (Register::from_index(index), value))
        })
    }

    /// Field-wise merge of a successor's file into this one. Empty absorbs
    /// anything; two disagreeing occupants cannot be reconciled.
    pub fn merge(&mut self, other: &RegisterFile) -> Result<(), AllocationError> {
        for index in 0..32 {
            match (self.slots[index], other.slots[index]) {
                (_, None) => {}
                (None, Some(value)) => self.slots[index] = Some(value),
                (Some(mine), Some(theirs)) if mine == theirs => {}
                (Some(_), Some(_)) => {
                    return Err(AllocationError::InvalidMerge {
                        register: Register::from_index(index),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Growable spill-slot array with a lowest-free cursor and a high-water
/// mark. Slot indices are dense and reused after release.
#[derive(Debug, Clone, Default)]
pub struct Spill {
    slots: Vec<Option<ValueRef>>,
    lowest_free: usize,
    high_water: usize,
}

impl Spill {
    pub fn new() -> Self {
        Spill::default()
    }

    /// Claim the lowest free slot for `value` and return its index.
    pub fn put(&mut self, value: ValueRef) -> usize {
        let slot = self.lowest_free;
        if slot == self.slots.len() {
            self.slots.push(Some(value));
        } else {
            self.slots[slot] = Some(value);
        }
        self.high_water = self.high_water.max(slot + 1);
        while self.lowest_free < self.slots.len() && self.slots[self.lowest_free].is_some() {
            self.lowest_free += 1;
        }
        slot
    }

    pub fn get(&self, slot: usize) -> Option<ValueRef> {
        self.slots.get(slot).copied().flatten()
    }

    /// Release a slot and lower the cursor.
    pub fn delete(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.lowest_free = self.lowest_free.min(slot);
    }

    /// Most slots ever simultaneously claimed; the function's spill size.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}
