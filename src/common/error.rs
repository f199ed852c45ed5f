//! Error taxonomy for IR construction, register allocation, verification,
//! and materialization.

use std::io;

use thiserror::Error;

use crate::backend::riscv::registers::Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValueError {
    /// A `Result` value references a statement of a different function.
    #[error("value belongs to a different function")]
    InvalidValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Successor register files disagree on a register's occupant.
    #[error("successor register files disagree on {register}")]
    InvalidMerge { register: Register },
    /// A fixed-register write needs to park a displaced value and no
    /// register is free to park it in.
    #[error("fixed write to {register} conflicts with a committed constraint")]
    InvalidConstraint { register: Register },
    /// Register pressure cannot be resolved: no register is free and no
    /// occupant can be stored to a spill slot.
    #[error("no free register and no spillable occupant")]
    InvalidValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("value-producing statement has no register allocation")]
    MissingAllocation,
    #[error("non-value statement carries a register allocation")]
    AllocationForNonValue,
    #[error("simulated state disagrees with the block's register file at {register}")]
    InvalidRegisterFile { register: Register },
    #[error("{register} holds a different value than the read expects")]
    RegisterHoldsDifferentValue { register: Register },
    #[error("memory action reads or writes an invalid location")]
    InvalidMemoryAction,
    #[error("x0 used as an allocation target")]
    InvalidRegister,
    #[error("phi operand missing for a predecessor edge")]
    MissingPhiAt,
    #[error("restore register has nothing to park")]
    InvalidRestore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FunctionError {
    #[error("function exit was already set")]
    MultipleExits,
    #[error("function has no exit")]
    NoExit,
    #[error("only the first eight arguments map to registers")]
    TooManyParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MaterializationError {
    #[error("materialize called before register allocation")]
    NoRegisterAllocation,
    #[error("constant {0:#x} does not fit the implemented li strategy")]
    UnencodableImmediate(u64),
    #[error("only register reads may live in spill slots")]
    UnsupportedSpill,
}

/// Any failure the backend can surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Function(#[from] FunctionError),
    #[error(transparent)]
    Materialization(#[from] MaterializationError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
