pub mod block;
pub mod function;
pub mod statement;

pub use block::{Block, BlockId, Exit};
pub use function::{Function, FunctionId, SavedRegisters, ENTRY, EPILOGUE, PROLOGUE};
pub use statement::{
    Immediate, MemoryAction, ReadAllocation, RegisterAllocation, Statement, StatementKind, Value,
    ValueInfo, ValueRef,
};
