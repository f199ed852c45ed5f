//! Lowering of allocated IR into RV64I machine code.
//!
//! The walk starts at the prologue and follows the unique jump chain to the
//! function exit, so every jump becomes fallthrough and no branch
//! instructions are needed. Moves whose source and destination coincide are
//! elided. Spill traffic is addressed relative to fp; a function with any
//! spill slots saves the caller's fp below sp on entry and restores it on
//! exit.

use log::debug;

use super::encode;
use super::registers::Register;
use crate::backend::elf::writer::ElfWriter;
use crate::common::error::{Error, MaterializationError};
use crate::ir::block::Exit;
use crate::ir::function::{Function, PROLOGUE};
use crate::ir::statement::{
    MemoryAction, ReadAllocation, RegisterAllocation, Statement, StatementKind, Value,
};

/// Frame bytes reserved when any value lives in a spill slot: the saved fp.
const SPILL_FRAME: i32 = 8;

/// fp-relative offset of a spill slot.
fn spill_offset(slot: usize) -> i32 {
    -8 * slot as i32 - SPILL_FRAME - 8
}

pub(crate) fn run(function: &Function, assembler: &mut ElfWriter) -> Result<(), Error> {
    let spill_size = function
        .spill_size()
        .ok_or(MaterializationError::NoRegisterAllocation)?;
    assembler.add_symbol_at_end(function.name());
    let has_frame = spill_size > 0;
    if has_frame {
        assembler.emit(encode::sd(Register::FP, Register::SP, -8));
        assembler.emit(encode::mv(Register::FP, Register::SP));
    }
    let mut block = PROLOGUE;
    loop {
        for statement in function.block(block).statements() {
            emit_statement(statement, assembler)?;
        }
        match function.block(block).exit() {
            Exit::Jump(target) => block = target,
            Exit::FunctionExit => break,
        }
    }
    if has_frame {
        assembler.emit(encode::ld(Register::FP, Register::FP, -8));
    }
    assembler.emit(encode::ret());
    debug!(
        "materialized {}: {} bytes of text, {} spill slots",
        function.name(),
        assembler.text().len(),
        spill_size
    );
    Ok(())
}

fn emit_statement(statement: &Statement, assembler: &mut ElfWriter) -> Result<(), Error> {
    for operand in statement.operands() {
        emit_action(operand.read.before, &operand.read, assembler)?;
    }
    match &statement.kind {
        StatementKind::ReadRegister(source) => {
            match statement
                .allocation
                .ok_or(MaterializationError::NoRegisterAllocation)?
            {
                RegisterAllocation::Register(destination) if destination != *source => {
                    assembler.emit(encode::mv(destination, *source));
                }
                RegisterAllocation::Register(_) => {}
                RegisterAllocation::Spill(slot) => {
                    assembler.emit(encode::sd(*source, Register::FP, spill_offset(slot)));
                }
            }
        }
        StatementKind::WriteRegister { register, value } => {
            if let Some(park) = value.read.restore {
                assembler.emit(encode::mv(park, *register));
            }
            match value.value {
                Value::Constant(constant) if !value.needs_register() => {
                    emit_li(*register, constant, assembler)?;
                }
                _ => {
                    let source = value
                        .read
                        .register
                        .ok_or(MaterializationError::NoRegisterAllocation)?;
                    if source != *register {
                        assembler.emit(encode::mv(*register, source));
                    }
                }
            }
            if let Some(park) = value.read.restore {
                assembler.emit(encode::mv(*register, park));
            }
        }
        StatementKind::Add { lhs, rhs } => {
            let destination = match statement
                .allocation
                .ok_or(MaterializationError::NoRegisterAllocation)?
            {
                RegisterAllocation::Register(register) => register,
                RegisterAllocation::Spill(_) => {
                    return Err(MaterializationError::UnsupportedSpill.into());
                }
            };
            let left = lhs
                .read
                .register
                .ok_or(MaterializationError::NoRegisterAllocation)?;
            match rhs.read.register {
                Some(right) => assembler.emit(encode::add(destination, left, right)),
                None => {
                    // The allocator left the operand out of a register, so
                    // the 12-bit immediate policy admitted it.
                    let Value::Constant(constant) = rhs.value else {
                        return Err(MaterializationError::NoRegisterAllocation.into());
                    };
                    assembler.emit(encode::addi(destination, left, constant as i64 as i32));
                }
            }
        }
    }
    for operand in statement.operands() {
        emit_action(operand.read.after, &operand.read, assembler)?;
    }
    Ok(())
}

fn emit_action(
    action: Option<MemoryAction>,
    read: &ReadAllocation,
    assembler: &mut ElfWriter,
) -> Result<(), Error> {
    let Some(action) = action else { return Ok(()) };
    let register = read
        .register
        .ok_or(MaterializationError::NoRegisterAllocation)?;
    match action {
        MemoryAction::LoadImmediate(constant) => emit_li(register, constant, assembler)?,
        MemoryAction::LoadFromSpill(slot) => {
            assembler.emit(encode::ld(register, Register::FP, spill_offset(slot)));
        }
        MemoryAction::StoreToSpill(slot) => {
            assembler.emit(encode::sd(register, Register::FP, spill_offset(slot)));
        }
    }
    Ok(())
}

/// Materialize a constant: one `addi` for i12, `lui` plus `addiw` for i32.
/// Wider constants are not implemented.
fn emit_li(destination: Register, value: u64, assembler: &mut ElfWriter) -> Result<(), Error> {
    let signed = value as i64;
    if (-2048..=2047).contains(&signed) {
        assembler.emit(encode::addi(destination, Register::ZERO, signed as i32));
    } else if let Ok(value) = i32::try_from(signed) {
        // The low part is sign-extended by addiw, so the high part carries
        // the compensation.
        let low = (value << 20) >> 20;
        let high = (value.wrapping_sub(low) as u32) >> 12;
        assembler.emit(encode::lui(destination, high));
        assembler.emit(encode::addiw(destination, destination, low));
    } else {
        return Err(MaterializationError::UnencodableImmediate(value).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(assembler: &ElfWriter) -> Vec<u32> {
        assembler
            .text()
            .chunks(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn test_li_small() {
        let mut assembler = ElfWriter::new();
        emit_li(Register::A0, 5, &mut assembler).unwrap();
        assert_eq!(words(&assembler), vec![encode::addi(Register::A0, Register::ZERO, 5)]);
    }

    #[test]
    fn test_li_negative_small() {
        let mut assembler = ElfWriter::new();
        emit_li(Register::A0, (-1i64) as u64, &mut assembler).unwrap();
        assert_eq!(words(&assembler), vec![encode::addi(Register::A0, Register::ZERO, -1)]);
    }

    #[test]
    fn test_li_32_bit() {
        let mut assembler = ElfWriter::new();
        emit_li(Register::T6, 80_000_000, &mut assembler).unwrap();
        assert_eq!(
            words(&assembler),
            vec![
                encode::lui(Register::T6, 0x04c4b),
                encode::addiw(Register::T6, Register::T6, 0x400),
            ]
        );
    }

    #[test]
    fn test_li_32_bit_with_carry() {
        // The low half is negative, so the high half compensates upward.
        let mut assembler = ElfWriter::new();
        emit_li(Register::A0, 0x1800, &mut assembler).unwrap();
        assert_eq!(
            words(&assembler),
            vec![
                encode::lui(Register::A0, 0x2),
                encode::addiw(Register::A0, Register::A0, -2048),
            ]
        );
    }

    #[test]
    fn test_li_too_wide() {
        let mut assembler = ElfWriter::new();
        let result = emit_li(Register::A0, 1 << 32, &mut assembler);
        assert!(matches!(
            result,
            Err(Error::Materialization(MaterializationError::UnencodableImmediate(_)))
        ));
    }

    #[test]
    fn test_spill_offsets() {
        assert_eq!(spill_offset(0), -16);
        assert_eq!(spill_offset(1), -24);
        assert_eq!(spill_offset(5), -56);
    }
}
