use thiserror::Error;

/// Fatal, structural failures of a method body.
///
/// Everything else the pipeline encounters (dangling branches, unreachable
/// code, handler ends past the last instruction, missing local variable
/// tables) is recovered from in place; these are the cases where the body
/// cannot be given a meaning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodeError {
	#[error("unrecognized opcode {opcode:#04x} at bytecode offset {offset}")]
	UnknownOpcode { offset: u32, opcode: u8 },

	#[error("unexpected end of code reading {what} at bytecode offset {offset}")]
	UnexpectedEndOfCode { offset: u32, what: &'static str },

	#[error("inconsistent stack size at bytecode offset {offset} (coming from offset {from}): {actual}, expected {expected}")]
	InconsistentStackSize { offset: u32, from: u32, expected: usize, actual: usize },

	#[error("stack underflow at bytecode offset {offset}")]
	StackUnderflow { offset: u32 },

	#[error("subroutine instruction at bytecode offset {offset} cannot be analyzed")]
	Subroutine { offset: u32 },
}
