//! A miniature RISC-V compiler backend.
//!
//! An external producer builds a [`Function`] out of SSA statements, then
//! the backend analyzes its control-flow graph, assigns every value a
//! register or spill slot, optionally re-verifies the allocation by symbolic
//! re-execution, and materializes RV64I machine code into a relocatable
//! ELF64 object a standard RISC-V linker can consume.

pub mod backend;
pub mod cfg;
pub mod common;
pub mod ir;
pub mod regalloc;

pub use backend::elf::writer::ElfWriter;
pub use backend::riscv::registers::Register;
pub use common::error::Error;
pub use ir::function::Function;
pub use ir::statement::Value;
