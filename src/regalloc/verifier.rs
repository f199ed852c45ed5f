//! Register-allocation verification.
//!
//! A second, independent pass that re-executes the allocated program
//! symbolically: a simulated register file and spill array are driven
//! through every statement in program order, checking that each operand's
//! register really holds the value the read expects. Failures here are bugs
//! in the allocator, never in the input program.

use rustc_hash::FxHashSet;

use crate::backend::riscv::registers::Register;
use crate::common::error::VerificationError;
use crate::ir::block::{BlockId, Exit};
use crate::ir::function::{Function, PROLOGUE};
use crate::ir::statement::{
    MemoryAction, ReadAllocation, RegisterAllocation, Statement, StatementKind, Value, ValueRef,
};

/// What a simulated location can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimValue {
    Constant(u64),
    Result(ValueRef),
}

impl SimValue {
    fn of(value: Value) -> SimValue {
        match value {
            Value::Constant(constant) => SimValue::Constant(constant),
            Value::Result(reference) => SimValue::Result(reference),
        }
    }
}

/// One simulated machine state: register file plus spill array.
#[derive(Debug, Clone, Default)]
struct SimState {
    registers: [Option<SimValue>; 32],
    spill: Vec<Option<SimValue>>,
}

impl SimState {
    fn get(&self, register: Register) -> Option<SimValue> {
        self.registers[register.index()]
    }

    fn set(&mut self, register: Register, value: SimValue) {
        self.registers[register.index()] = Some(value);
    }

    fn load_spill(&self, slot: usize) -> Result<SimValue, VerificationError> {
        self.spill
            .get(slot)
            .copied()
            .flatten()
            .ok_or(VerificationError::InvalidMemoryAction)
    }

    fn store_spill(&mut self, slot: usize, value: SimValue) {
        if slot >= self.spill.len() {
            self.spill.resize(slot + 1, None);
        }
        self.spill[slot] = Some(value);
    }
}

pub(crate) struct Verifier<'a> {
    function: &'a Function,
}

impl<'a> Verifier<'a> {
    pub(crate) fn new(function: &'a Function) -> Self {
        Verifier { function }
    }

    pub(crate) fn run(&self) -> Result<(), VerificationError> {
        let mut visited: FxHashSet<(BlockId, BlockId)> = FxHashSet::default();
        let mut work: Vec<(BlockId, SimState)> = vec![(PROLOGUE, SimState::default())];
        while let Some((block, mut state)) = work.pop() {
            self.check_block_entry(block, &state)?;
            for (index, statement) in self.function.block(block).statements().iter().enumerate() {
                let here = ValueRef { function: self.function.id(), block, statement: index };
                self.simulate_statement(here, statement, &mut state)?;
            }
            match self.function.block(block).exit() {
                Exit::Jump(target) => {
                    // Each successor edge is traversed at most once, with its
                    // own clone of the simulator state.
                    if visited.insert((block, target)) {
                        work.push((target, state.clone()));
                    }
                }
                Exit::FunctionExit => {}
            }
        }
        Ok(())
    }

    /// The simulated state must agree with the allocator's top-of-block
    /// register file wherever the latter names an occupant.
    fn check_block_entry(&self, block: BlockId, state: &SimState) -> Result<(), VerificationError> {
        let file = self.function.block(block).register_file();
        for index in 0..32 {
            let register = Register::from_index(index);
            let Some(expected) = file.get(register) else { continue };
            if state.get(register) != Some(SimValue::Result(expected)) {
                return Err(VerificationError::InvalidRegisterFile { register });
            }
        }
        Ok(())
    }

    fn simulate_statement(
        &self,
        here: ValueRef,
        statement: &Statement,
        state: &mut SimState,
    ) -> Result<(), VerificationError> {
        for operand in statement.operands() {
            Self::apply_action(operand.read.before, &operand.read, state)?;
        }
        for operand in statement.operands() {
            if !operand.needs_register() {
                continue;
            }
            let register = operand.read.register.ok_or(VerificationError::MissingAllocation)?;
            if register == Register::ZERO {
                return Err(VerificationError::InvalidRegister);
            }
            if state.get(register) != Some(SimValue::of(operand.value)) {
                return Err(VerificationError::RegisterHoldsDifferentValue { register });
            }
        }
        match &statement.kind {
            StatementKind::ReadRegister(_) | StatementKind::Add { .. } => {
                let allocation =
                    statement.allocation.ok_or(VerificationError::MissingAllocation)?;
                match allocation {
                    RegisterAllocation::Register(register) => {
                        if register == Register::ZERO {
                            return Err(VerificationError::InvalidRegister);
                        }
                        state.set(register, SimValue::Result(here));
                    }
                    RegisterAllocation::Spill(slot) => {
                        state.store_spill(slot, SimValue::Result(here));
                    }
                }
            }
            StatementKind::WriteRegister { register, value } => {
                if statement.allocation.is_some() {
                    return Err(VerificationError::AllocationForNonValue);
                }
                if let Some(park) = value.read.restore {
                    // Park the displaced occupant, let the write land, then
                    // restore the occupant after the write.
                    let occupant = state.get(*register).ok_or(VerificationError::InvalidRestore)?;
                    state.set(park, occupant);
                    state.set(*register, SimValue::of(value.value));
                    state.set(*register, occupant);
                } else {
                    state.set(*register, SimValue::of(value.value));
                }
            }
        }
        for operand in statement.operands() {
            Self::apply_action(operand.read.after, &operand.read, state)?;
        }
        Ok(())
    }

    fn apply_action(
        action: Option<MemoryAction>,
        read: &ReadAllocation,
        state: &mut SimState,
    ) -> Result<(), VerificationError> {
        let Some(action) = action else { return Ok(()) };
        let register = read.register.ok_or(VerificationError::InvalidMemoryAction)?;
        match action {
            MemoryAction::LoadImmediate(constant) => {
                state.set(register, SimValue::Constant(constant));
            }
            MemoryAction::LoadFromSpill(slot) => {
                let value = state.load_spill(slot)?;
                state.set(register, value);
            }
            MemoryAction::StoreToSpill(slot) => {
                let value =
                    state.get(register).ok_or(VerificationError::InvalidMemoryAction)?;
                state.store_spill(slot, value);
            }
        }
        Ok(())
    }
}
