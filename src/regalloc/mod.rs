//! Dominator-tree-directed register allocation.
//!
//! The allocator walks the dominator chain from the epilogue up to the
//! prologue. Within each block it walks statements backwards: a definition
//! frees its location, a use claims one. A use is therefore assigned at the
//! last point the value is needed, and the assignment stays pinned in the
//! register file until the walk reaches the definition. Register pressure is
//! resolved by evicting the occupant whose definition sits closest to the
//! root and earliest in its block: in the backward walk that value is the
//! least recently live.

pub mod register_file;
pub mod verifier;

use log::{debug, trace};
use smallvec::SmallVec;

use crate::backend::riscv::registers::Register;
use crate::cfg::Cfg;
use crate::common::error::AllocationError;
use crate::ir::block::BlockId;
use crate::ir::function::{Function, EPILOGUE};
use crate::ir::statement::{
    MemoryAction, RegisterAllocation, StatementKind, Value, ValueInfo, ValueRef,
};
use register_file::{RegisterFile, Spill};

/// Registers claimed while processing a single statement. They are off
/// limits for further claims within the same statement: an operand must not
/// evict its sibling, and a transient load must not reuse a sibling's
/// register.
type Pinned = SmallVec<[Register; 4]>;

pub(crate) struct RegisterAllocator<'a> {
    function: &'a mut Function,
    cfg: &'a Cfg,
    file: RegisterFile,
    spill: Spill,
}

impl<'a> RegisterAllocator<'a> {
    pub(crate) fn new(function: &'a mut Function, cfg: &'a Cfg) -> Self {
        RegisterAllocator { function, cfg, file: RegisterFile::new(), spill: Spill::new() }
    }

    /// Allocate every block on the dominator chain of the epilogue. Returns
    /// the number of spill slots used.
    pub(crate) fn run(mut self) -> Result<usize, AllocationError> {
        let chain: Vec<usize> = self.cfg.dominator_iter(EPILOGUE.index()).collect();
        for node in chain {
            self.allocate_block(BlockId(node))?;
        }
        Ok(self.spill.high_water())
    }

    fn allocate_block(&mut self, block: BlockId) -> Result<(), AllocationError> {
        debug!("{}: allocating block {}", self.function.name(), block.index());
        self.file = RegisterFile::new();
        for &successor in self.cfg.successors(block.index()) {
            let successor_file = self.function.block(BlockId(successor)).register_file().clone();
            self.file.merge(&successor_file)?;
        }
        let count = self.function.block(block).statements().len();
        for index in (0..count).rev() {
            self.allocate_statement(block, index)?;
        }
        self.function.block_mut(block).register_file = self.file.clone();
        Ok(())
    }

    fn allocate_statement(&mut self, block: BlockId, index: usize) -> Result<(), AllocationError> {
        let here = ValueRef { function: self.function.id(), block, statement: index };
        if self.function.statement(here).produces_value() {
            self.free_definition(here);
        }
        let write_target = match &self.function.statement(here).kind {
            StatementKind::ReadRegister(_) => return Ok(()),
            StatementKind::WriteRegister { register, .. } => Some(*register),
            StatementKind::Add { .. } => None,
        };
        let mut pinned = Pinned::new();
        match write_target {
            Some(target) => self.allocate_write(here, target, &mut pinned),
            None => {
                self.allocate_operand(here, 0, None, &mut pinned)?;
                self.allocate_operand(here, 1, None, &mut pinned)
            }
        }
    }

    /// Release the location a definition was assigned from downstream uses.
    /// Above the definition the value does not exist, so its register or
    /// slot becomes available to the operands of this very statement. A
    /// definition nothing ever read still needs somewhere to land.
    fn free_definition(&mut self, definition: ValueRef) {
        let allocation = self.function.statement(definition).allocation;
        match allocation {
            Some(RegisterAllocation::Register(register)) => {
                debug_assert!(self
                    .file
                    .get(register)
                    .map_or(true, |occupant| occupant == definition));
                self.file.clear_value(definition);
            }
            Some(RegisterAllocation::Spill(slot)) => {
                self.spill.delete(slot);
                self.file.clear_value(definition);
            }
            None => {
                let preferred = self
                    .function
                    .statement(definition)
                    .preferred_register()
                    .filter(|&register| self.file.is_free(register));
                let allocation = if let Some(register) = preferred {
                    RegisterAllocation::Register(register)
                } else if let Some(register) = self.file.find_free() {
                    RegisterAllocation::Register(register)
                } else {
                    // A transient slot: claimed and released at one point, so
                    // it cannot overlap a live spill range.
                    let slot = self.spill.put(definition);
                    self.spill.delete(slot);
                    RegisterAllocation::Spill(slot)
                };
                trace!("dead definition {:?} lands in {:?}", definition, allocation);
                self.function.statement_mut(definition).allocation = Some(allocation);
            }
        }
    }

    /// Fixed-register write. The target register is a hard preference for
    /// the operand; a different value occupying the target must be parked in
    /// a free register around the write.
    fn allocate_write(
        &mut self,
        statement: ValueRef,
        target: Register,
        pinned: &mut Pinned,
    ) -> Result<(), AllocationError> {
        let operand_value = self
            .function
            .statement(statement)
            .operand(0)
            .map(|info| info.value);
        let displaced = match self.file.get(target) {
            Some(occupant) if operand_value != Some(Value::Result(occupant)) => Some(occupant),
            _ => None,
        };
        if let Some(occupant) = displaced {
            let park = self
                .scan_free(pinned)
                .ok_or(AllocationError::InvalidConstraint { register: target })?;
            trace!("parking {:?} in {} around a write to {}", occupant, park, target);
            self.file.set(park, occupant);
            pinned.push(park);
            self.operand_mut(statement, 0).read.restore = Some(park);
        }
        self.allocate_operand(statement, 0, Some(target), pinned)
    }

    /// Find the register an operand read is satisfied from: reuse an
    /// existing assignment, else a preferred register, else the highest free
    /// register, else evict.
    fn allocate_operand(
        &mut self,
        statement: ValueRef,
        operand: usize,
        hint: Option<Register>,
        pinned: &mut Pinned,
    ) -> Result<(), AllocationError> {
        let Some((value, needs_register)) = self
            .function
            .statement(statement)
            .operand(operand)
            .map(|info| (info.value, info.needs_register()))
        else {
            return Ok(());
        };
        if !needs_register {
            return Ok(());
        }
        match value {
            Value::Constant(constant) => {
                // The register is clobbered by a load immediately before the
                // use, so it is claimed transiently and stays out of the file.
                let (register, evicted) = self.claim(&hint_list(None, hint), pinned)?;
                pinned.push(register);
                let info = self.operand_mut(statement, operand);
                info.read.register = Some(register);
                info.read.before = Some(MemoryAction::LoadImmediate(constant));
                if let Some(slot) = evicted {
                    info.read.after = Some(MemoryAction::LoadFromSpill(slot));
                }
            }
            Value::Result(definition) => {
                let allocation = self.function.statement(definition).allocation;
                match allocation {
                    Some(RegisterAllocation::Register(register)) => {
                        debug_assert!(self
                            .file
                            .get(register)
                            .map_or(true, |occupant| occupant == definition));
                        self.file.set(register, definition);
                        pinned.push(register);
                        self.operand_mut(statement, operand).read.register = Some(register);
                    }
                    Some(RegisterAllocation::Spill(slot)) => {
                        // The value lives in its slot upstream of this use;
                        // it is reloaded here and the reload register stays
                        // out of the file.
                        let preferred = hint_list(
                            self.function.statement(definition).preferred_register(),
                            hint,
                        );
                        let (register, evicted) = self.claim(&preferred, pinned)?;
                        pinned.push(register);
                        let info = self.operand_mut(statement, operand);
                        info.read.register = Some(register);
                        info.read.before = Some(MemoryAction::LoadFromSpill(slot));
                        if let Some(evicted_slot) = evicted {
                            info.read.after = Some(MemoryAction::LoadFromSpill(evicted_slot));
                        }
                    }
                    None => {
                        // First use seen in the backward walk, which is the
                        // last use in program order: bind the value here.
                        let preferred = hint_list(
                            self.function.statement(definition).preferred_register(),
                            hint,
                        );
                        let (register, evicted) = self.claim(&preferred, pinned)?;
                        pinned.push(register);
                        self.function.statement_mut(definition).allocation =
                            Some(RegisterAllocation::Register(register));
                        self.file.set(register, definition);
                        trace!("{:?} bound to {} at its last use", definition, register);
                        let info = self.operand_mut(statement, operand);
                        info.read.register = Some(register);
                        if let Some(slot) = evicted {
                            info.read.after = Some(MemoryAction::LoadFromSpill(slot));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Find a register for a use: preferred candidates in order, then the
    /// highest-indexed free register, then eviction. Returns the register
    /// and, when an occupant was evicted, the slot it now lives in.
    fn claim(
        &mut self,
        preferred: &[Register],
        pinned: &Pinned,
    ) -> Result<(Register, Option<usize>), AllocationError> {
        for &candidate in preferred {
            if candidate != Register::ZERO
                && !pinned.contains(&candidate)
                && self.file.is_free(candidate)
            {
                return Ok((candidate, None));
            }
        }
        if let Some(register) = self.scan_free(pinned) {
            return Ok((register, None));
        }
        let (register, victim) = self.pick_victim(pinned)?;
        let slot = self.spill.put(victim);
        self.function.statement_mut(victim).allocation = Some(RegisterAllocation::Spill(slot));
        self.file.clear(register);
        debug!("evicted {:?} from {} to spill slot {}", victim, register, slot);
        Ok((register, Some(slot)))
    }

    /// Highest-indexed free register outside x0, fp, and the pinned set.
    fn scan_free(&self, pinned: &Pinned) -> Option<Register> {
        for index in (1..32).rev() {
            if index == Register::FP.index() {
                continue;
            }
            let register = Register::from_index(index);
            if !pinned.contains(&register) && self.file.is_free(register) {
                return Some(register);
            }
        }
        None
    }

    /// Choose the occupant to evict: the value defined closest to the root
    /// and earliest in its block. Only register reads are evictable, because
    /// only they can store straight to their spill slot at the definition.
    fn pick_victim(&self, pinned: &Pinned) -> Result<(Register, ValueRef), AllocationError> {
        let mut best: Option<((usize, usize), Register, ValueRef)> = None;
        for (register, value) in self.file.occupied() {
            if pinned.contains(&register) {
                continue;
            }
            if !matches!(self.function.statement(value).kind, StatementKind::ReadRegister(_)) {
                continue;
            }
            let score = (self.cfg.dominator_tree_depth(value.block.index()), value.statement);
            if best.map_or(true, |(current, _, _)| score < current) {
                best = Some((score, register, value));
            }
        }
        best.map(|(_, register, value)| (register, value)).ok_or(AllocationError::InvalidValue)
    }

    fn operand_mut(&mut self, statement: ValueRef, operand: usize) -> &mut ValueInfo {
        self.function
            .statement_mut(statement)
            .operand_mut(operand)
            .expect("operand index out of range")
    }
}

/// Preference order for a claim: the defining statement's own preference
/// first, then the consumer's hint.
fn hint_list(preference: Option<Register>, hint: Option<Register>) -> SmallVec<[Register; 2]> {
    preference.into_iter().chain(hint).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::{Function, ENTRY, PROLOGUE};

    fn allocated(build: impl FnOnce(&mut Function) -> Value) -> Function {
        let mut function = Function::new("test");
        let result = build(&mut function);
        function.set_function_exit(ENTRY, result).unwrap();
        function.add_pseudo_instructions().unwrap();
        function.allocate_registers().unwrap();
        function
    }

    fn allocation_of(function: &Function, value: Value) -> RegisterAllocation {
        let Value::Result(reference) = value else { panic!("expected a result") };
        function.statement(reference).allocation.expect("value not allocated")
    }

    #[test]
    fn test_saved_registers_keep_their_homes() {
        let function = allocated(|f| {
            let a = f.add_parameter(None).unwrap();
            f.append_add(ENTRY, a, Value::Constant(1), None).unwrap()
        });
        for (register, value) in function.saved_registers().iter().collect::<Vec<_>>() {
            assert_eq!(
                allocation_of(&function, value),
                RegisterAllocation::Register(register)
            );
        }
    }

    #[test]
    fn test_return_value_prefers_a0() {
        let function = allocated(|f| {
            let a = f.add_parameter(None).unwrap();
            let b = f.add_parameter(None).unwrap();
            f.append_add(ENTRY, a, b, None).unwrap()
        });
        let statements = function.block(ENTRY).statements();
        assert_eq!(
            statements[0].allocation,
            Some(RegisterAllocation::Register(Register::A0))
        );
        // Both operands stay in their argument registers.
        assert_eq!(statements[0].operand(0).unwrap().read.register, Some(Register::A0));
        assert_eq!(statements[0].operand(1).unwrap().read.register, Some(Register::A1));
    }

    #[test]
    fn test_small_constant_needs_no_register() {
        let function = allocated(|f| {
            let a = f.add_parameter(None).unwrap();
            f.append_add(ENTRY, a, Value::Constant(21), None).unwrap()
        });
        let add = &function.block(ENTRY).statements()[0];
        assert_eq!(add.operand(1).unwrap().read.register, None);
        assert_eq!(add.operand(1).unwrap().read.before, None);
    }

    #[test]
    fn test_large_constant_is_loaded_transiently() {
        let function = allocated(|f| {
            let a = f.add_parameter(None).unwrap();
            f.append_add(ENTRY, a, Value::Constant(80_000_000), None).unwrap()
        });
        let add = &function.block(ENTRY).statements()[0];
        let read = add.operand(1).unwrap().read;
        // Highest-indexed free register, scanned from x31 down.
        assert_eq!(read.register, Some(Register::T6));
        assert_eq!(read.before, Some(MemoryAction::LoadImmediate(80_000_000)));
        assert_eq!(function.spill_size(), Some(0));
    }

    #[test]
    fn test_pressure_spills_the_shallowest_read() {
        let mut function = Function::new("pressure");
        let mut parameters = Vec::new();
        for _ in 0..8 {
            parameters.push(function.add_parameter(None).unwrap());
        }
        // Doubles keep every parameter live past them, then a final fold
        // consumes doubles and parameters alternately. Together with the
        // sixteen captured callee-saved values, simultaneous residency peaks
        // at 31 against 30 allocatable registers.
        let mut doubles = Vec::new();
        for index in 0..7 {
            doubles.push(
                function
                    .append_add(ENTRY, parameters[index], parameters[index], None)
                    .unwrap(),
            );
        }
        let mut sum = function.append_add(ENTRY, doubles[0], parameters[7], None).unwrap();
        for index in 1..7 {
            sum = function.append_add(ENTRY, sum, doubles[index], None).unwrap();
            sum = function.append_add(ENTRY, sum, parameters[index - 1], None).unwrap();
        }
        sum = function.append_add(ENTRY, sum, parameters[6], None).unwrap();
        function.set_function_exit(ENTRY, sum).unwrap();
        function.add_pseudo_instructions().unwrap();
        function.allocate_registers().unwrap();

        assert!(function.spill_size().unwrap() > 0);
        // The evicted value is the earliest prologue read, the saved ra.
        let (ra, saved_ra) = function.saved_registers().iter().next().unwrap();
        assert_eq!(ra, Register::RA);
        assert!(matches!(
            allocation_of(&function, saved_ra),
            RegisterAllocation::Spill(_)
        ));
        function.verify_register_allocation().unwrap();
    }

    #[test]
    fn test_every_block_gets_a_register_file() {
        let function = allocated(|f| {
            let a = f.add_parameter(None).unwrap();
            f.append_add(ENTRY, a, Value::Constant(1), None).unwrap()
        });
        // The entry's top state pins the parameter into a0 for the add.
        assert!(function.block(ENTRY).register_file().get(Register::A0).is_some());
        // The prologue releases everything it defines.
        assert_eq!(function.block(PROLOGUE).register_file(), &RegisterFile::new());
    }
}
