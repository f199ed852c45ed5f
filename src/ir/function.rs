//! Function construction: the producer-facing IR surface.
//!
//! A function starts with three fixed blocks: prologue (0), epilogue (1) and
//! entry (2). The prologue captures every callee-saved register as an SSA
//! value and jumps to the entry; the epilogue returns the result in a0,
//! restores the captured registers, and exits the function. The producer
//! fills the entry (and any further blocks) and wires the unique exit.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::{smallvec, SmallVec};

use crate::backend::elf::writer::ElfWriter;
use crate::backend::riscv::materialize;
use crate::backend::riscv::registers::Register;
use crate::cfg::Cfg;
use crate::common::error::{Error, FunctionError, ValueError, VerificationError};
use crate::ir::block::{Block, BlockId, Exit};
use crate::ir::statement::{
    Immediate, Statement, StatementKind, Value, ValueInfo, ValueRef,
};
use crate::regalloc::verifier::Verifier;
use crate::regalloc::RegisterAllocator;

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique function identity, minted from a relaxed atomic counter.
/// Used for debug identity and foreign-value rejection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u64);

impl FunctionId {
    fn next() -> FunctionId {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u64) -> FunctionId {
        FunctionId(id)
    }
}

/// Callee-saved registers paired with the SSA values the prologue captured.
#[derive(Debug, Clone, Default)]
pub struct SavedRegisters {
    entries: Vec<(Register, Value)>,
}

impl SavedRegisters {
    pub fn iter(&self) -> impl Iterator<Item = (Register, Value)> + '_ {
        self.entries.iter().copied()
    }
}

pub const PROLOGUE: BlockId = BlockId(0);
pub const EPILOGUE: BlockId = BlockId(1);
pub const ENTRY: BlockId = BlockId(2);

#[derive(Debug)]
pub struct Function {
    id: FunctionId,
    name: String,
    blocks: Vec<Block>,
    saved: SavedRegisters,
    parameter_count: usize,
    exit_block: Option<BlockId>,
    cfg: Option<Cfg>,
    spill_size: Option<usize>,
}

impl Function {
    pub fn new(name: &str) -> Function {
        let mut function = Function {
            id: FunctionId::next(),
            name: name.to_string(),
            blocks: Vec::new(),
            saved: SavedRegisters::default(),
            parameter_count: 0,
            exit_block: None,
            cfg: None,
            spill_size: None,
        };
        let prologue = function.add_block();
        let _epilogue = function.add_block();
        let entry = function.add_block();
        for register in Register::CALLEE_SAVED {
            let value = function.append_read_register(prologue, register);
            function.saved.entries.push((register, value));
        }
        function.jump(prologue, entry);
        function
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn saved_registers(&self) -> &SavedRegisters {
        &self.saved
    }

    /// Present after `allocate_registers`.
    pub fn spill_size(&self) -> Option<usize> {
        self.spill_size
    }

    /// Present after `allocate_registers`.
    pub fn cfg(&self) -> Option<&Cfg> {
        self.cfg.as_ref()
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block::new(id, self.id));
        id
    }

    /// Read the next ABI argument register in the prologue. Only the first
    /// eight arguments are passed in registers.
    pub fn add_parameter(&mut self, name: Option<&str>) -> Result<Value, FunctionError> {
        let register = Register::argument(self.parameter_count)
            .ok_or(FunctionError::TooManyParameters)?;
        self.parameter_count += 1;
        Ok(self.append_read_register_named(PROLOGUE, register, name))
    }

    /// Read the value a physical register holds. Reads of x0 fold to the
    /// constant zero and emit nothing.
    pub fn append_read_register(&mut self, block: BlockId, register: Register) -> Value {
        self.append_read_register_named(block, register, None)
    }

    fn append_read_register_named(
        &mut self,
        block: BlockId,
        register: Register,
        name: Option<&str>,
    ) -> Value {
        if register == Register::ZERO {
            return Value::Constant(0);
        }
        let statement =
            Statement::new(StatementKind::ReadRegister(register), name.map(str::to_string));
        let index = self.blocks[block.index()].push(statement);
        Value::Result(ValueRef { function: self.id, block, statement: index })
    }

    /// Append a wrapping add. Two constants fold at build time and emit no
    /// statement; a lone constant is swapped into the right operand, where it
    /// is eligible for a signed 12-bit immediate encoding.
    pub fn append_add(
        &mut self,
        block: BlockId,
        a: Value,
        b: Value,
        name: Option<&str>,
    ) -> Result<Value, ValueError> {
        self.check_value(a)?;
        self.check_value(b)?;
        let (a, b) = match (a, b) {
            (Value::Constant(x), Value::Constant(y)) => {
                return Ok(Value::Constant(x.wrapping_add(y)));
            }
            (Value::Constant(_), _) => (b, a),
            _ => (a, b),
        };
        let statement = Statement::new(
            StatementKind::Add {
                lhs: ValueInfo::new(a, Immediate::None),
                rhs: ValueInfo::new(b, Immediate::Sized { bits: 12, signed: true }),
            },
            name.map(str::to_string),
        );
        let index = self.blocks[block.index()].push(statement);
        Ok(Value::Result(ValueRef { function: self.id, block, statement: index }))
    }

    /// Bind `value` to a physical register at this point. Writes to x0 are
    /// silently discarded.
    pub fn append_write_register(
        &mut self,
        block: BlockId,
        register: Register,
        value: Value,
    ) -> Result<(), ValueError> {
        self.check_value(value)?;
        if register == Register::ZERO {
            return Ok(());
        }
        let statement = Statement::new(
            StatementKind::WriteRegister {
                register,
                value: ValueInfo::new(value, Immediate::Unlimited),
            },
            None,
        );
        self.blocks[block.index()].push(statement);
        Ok(())
    }

    pub fn jump(&mut self, block: BlockId, target: BlockId) {
        self.blocks[block.index()].exit = Exit::Jump(target);
    }

    /// Route `block` to the epilogue, returning `return_value` in a0. Legal
    /// exactly once per function.
    pub fn set_function_exit(&mut self, block: BlockId, return_value: Value) -> Result<(), Error> {
        if self.exit_block.is_some() {
            return Err(FunctionError::MultipleExits.into());
        }
        self.check_value(return_value)?;
        self.jump(block, EPILOGUE);
        self.append_write_register(EPILOGUE, Register::A0, return_value)?;
        self.exit_block = Some(block);
        Ok(())
    }

    /// Append the epilogue writes that restore the callee-saved registers
    /// from the prologue-captured values.
    pub fn add_pseudo_instructions(&mut self) -> Result<(), ValueError> {
        let entries = self.saved.entries.clone();
        for (register, value) in entries {
            self.append_write_register(EPILOGUE, register, value)?;
        }
        Ok(())
    }

    /// Assign every value a register or spill slot. Recomputes the CFG from
    /// scratch; both are cached on the function afterwards.
    pub fn allocate_registers(&mut self) -> Result<(), Error> {
        if self.exit_block.is_none() {
            return Err(FunctionError::NoExit.into());
        }
        let mut cfg = Cfg::new(self.successor_lists());
        cfg.analyze();
        let spill_size = RegisterAllocator::new(self, &cfg).run()?;
        self.spill_size = Some(spill_size);
        self.cfg = Some(cfg);
        Ok(())
    }

    /// Re-execute the allocated program symbolically and check register-file
    /// consistency at every use.
    pub fn verify_register_allocation(&self) -> Result<(), VerificationError> {
        Verifier::new(self).run()
    }

    /// Lower the allocated program into RV64I machine code in `assembler`.
    pub fn materialize(&self, assembler: &mut ElfWriter) -> Result<(), Error> {
        materialize::run(self, assembler)
    }

    fn check_value(&self, value: Value) -> Result<(), ValueError> {
        match value {
            Value::Result(reference) if reference.function != self.id => {
                Err(ValueError::InvalidValue)
            }
            _ => Ok(()),
        }
    }

    /// Per-block successor lists derived from the exits, in block-index
    /// order. Input shape for CFG analysis.
    pub(crate) fn successor_lists(&self) -> Vec<SmallVec<[usize; 2]>> {
        self.blocks
            .iter()
            .map(|block| match block.exit {
                Exit::Jump(target) => smallvec![target.index()],
                Exit::FunctionExit => SmallVec::new(),
            })
            .collect()
    }

    pub(crate) fn statement(&self, reference: ValueRef) -> &Statement {
        &self.blocks[reference.block.index()].statements[reference.statement]
    }

    pub(crate) fn statement_mut(&mut self, reference: ValueRef) -> &mut Statement {
        &mut self.blocks[reference.block.index()].statements[reference.statement]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::statement::RegisterAllocation;

    #[test]
    fn test_new_function_shape() {
        let function = Function::new("empty");
        assert_eq!(function.blocks().len(), 3);
        // The prologue captures all sixteen callee-saved registers.
        assert_eq!(function.block(PROLOGUE).statements().len(), 16);
        assert_eq!(function.block(PROLOGUE).exit(), Exit::Jump(ENTRY));
        assert_eq!(function.block(EPILOGUE).exit(), Exit::FunctionExit);
        assert_eq!(function.saved_registers().iter().count(), 16);
    }

    #[test]
    fn test_function_ids_are_unique() {
        let a = Function::new("a");
        let b = Function::new("b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_parameters_map_to_argument_registers() {
        let mut function = Function::new("params");
        for index in 0..8 {
            let value = function.add_parameter(None).unwrap();
            let Value::Result(reference) = value else { panic!("expected a result") };
            assert_eq!(reference.block, PROLOGUE);
            let statement = function.statement(reference);
            assert_eq!(
                statement.preferred_register(),
                Some(Register::argument(index).unwrap())
            );
        }
        assert_eq!(function.add_parameter(None), Err(FunctionError::TooManyParameters));
    }

    #[test]
    fn test_read_x0_folds_to_zero() {
        let mut function = Function::new("zero");
        let value = function.append_read_register(ENTRY, Register::ZERO);
        assert_eq!(value, Value::Constant(0));
        assert!(function.block(ENTRY).statements().is_empty());
    }

    #[test]
    fn test_write_x0_is_discarded() {
        let mut function = Function::new("discard");
        let value = function.append_read_register(ENTRY, Register::A0);
        function.append_write_register(ENTRY, Register::ZERO, value).unwrap();
        assert_eq!(function.block(ENTRY).statements().len(), 1);
    }

    #[test]
    fn test_constant_add_folds() {
        let mut function = Function::new("fold");
        let sum = function
            .append_add(ENTRY, Value::Constant(40), Value::Constant(2), None)
            .unwrap();
        assert_eq!(sum, Value::Constant(42));
        assert!(function.block(ENTRY).statements().is_empty());
    }

    #[test]
    fn test_constant_folding_wraps() {
        let mut function = Function::new("wrap");
        let sum = function
            .append_add(ENTRY, Value::Constant(u64::MAX), Value::Constant(2), None)
            .unwrap();
        assert_eq!(sum, Value::Constant(1));
    }

    #[test]
    fn test_lone_constant_becomes_rhs() {
        let mut function = Function::new("swap");
        let parameter = function.add_parameter(None).unwrap();
        let sum = function
            .append_add(ENTRY, Value::Constant(21), parameter, None)
            .unwrap();
        let Value::Result(reference) = sum else { panic!("expected a result") };
        let StatementKind::Add { lhs, rhs } = &function.statement(reference).kind else {
            panic!("expected an add");
        };
        assert_eq!(lhs.value, parameter);
        assert_eq!(rhs.value, Value::Constant(21));
        assert_eq!(rhs.immediate, Immediate::Sized { bits: 12, signed: true });
        assert!(!rhs.needs_register());
    }

    #[test]
    fn test_foreign_values_are_rejected() {
        let mut a = Function::new("a");
        let mut b = Function::new("b");
        let foreign = b.add_parameter(None).unwrap();
        assert_eq!(
            a.append_add(ENTRY, foreign, Value::Constant(1), None),
            Err(ValueError::InvalidValue)
        );
        assert_eq!(
            a.append_write_register(ENTRY, Register::A0, foreign),
            Err(ValueError::InvalidValue)
        );
    }

    #[test]
    fn test_exit_is_legal_exactly_once() {
        let mut function = Function::new("exits");
        let value = function.add_parameter(None).unwrap();
        function.set_function_exit(ENTRY, value).unwrap();
        assert_eq!(function.block(ENTRY).exit(), Exit::Jump(EPILOGUE));
        assert!(matches!(
            function.set_function_exit(ENTRY, value),
            Err(Error::Function(FunctionError::MultipleExits))
        ));
    }

    #[test]
    fn test_allocate_requires_an_exit() {
        let mut function = Function::new("no_exit");
        assert!(matches!(
            function.allocate_registers(),
            Err(Error::Function(FunctionError::NoExit))
        ));
    }

    #[test]
    fn test_allocation_covers_every_value() {
        let mut function = Function::new("covered");
        let a = function.add_parameter(None).unwrap();
        let b = function.add_parameter(None).unwrap();
        let sum = function.append_add(ENTRY, a, b, Some("sum")).unwrap();
        function.set_function_exit(ENTRY, sum).unwrap();
        function.add_pseudo_instructions().unwrap();
        function.allocate_registers().unwrap();

        for block in function.blocks() {
            for statement in block.statements() {
                assert_eq!(statement.allocation.is_some(), statement.produces_value());
            }
        }
        let Value::Result(sum_ref) = sum else { panic!("expected a result") };
        // The epilogue's a0 write makes a0 the preferred home for the sum.
        assert_eq!(
            function.statement(sum_ref).allocation,
            Some(RegisterAllocation::Register(Register::A0))
        );
        assert_eq!(function.spill_size(), Some(0));
    }
}
