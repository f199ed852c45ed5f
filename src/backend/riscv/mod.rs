//! RV64I code generation: register model, instruction encoders, and the
//! materializer that lowers allocated IR into machine code.

pub mod encode;
pub mod materialize;
pub mod registers;
