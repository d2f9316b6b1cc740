//! The decoded instruction stream and the exception handler model built on
//! top of it.
//!
//! Instructions live in an arena ([`InstructionCollection`]) and refer to
//! each other by arena index; branch operands and exception blocks are
//! indices, never pointers, so there are no ownership cycles and identity
//! comparisons are plain index comparisons.

use std::collections::HashMap;
use anyhow::{anyhow, Result};
use crate::metadata::{DynamicCallSite, FieldRef, Loadable, MethodRef, PrimitiveKind, TypeReference};
use crate::opcode::OpCode;

/// A bytecode offset label. Labels are created for branch targets while
/// decoding and numbered in a post-pass, in instruction order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label {
	pub offset: u32,
	pub index: u16,
}

/// Switch dispatch data. Targets are instruction arena indices.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
	pub default_target: usize,
	pub keys: SwitchKeys,
	pub targets: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchKeys {
	/// `tableswitch`: consecutive keys `low..=high`.
	Table { low: i32, high: i32 },
	/// `lookupswitch`: explicit, ordered keys.
	Lookup(Vec<i32>),
}

/// A decoded operand. Variable operands index into the method body's
/// variable definition collection; branch operands index the instruction
/// arena.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
	None,
	PrimitiveType(PrimitiveKind),
	Type(TypeReference),
	/// Class reference plus dimension count (`multianewarray`).
	TypeU1(TypeReference, u8),
	Field(FieldRef),
	Method(MethodRef),
	CallSite(DynamicCallSite),
	Constant(Loadable),
	Immediate(i64),
	Local(usize),
	/// Local variable plus immediate (`iinc`).
	LocalImmediate(usize, i32),
	Branch(usize),
	Switch(SwitchInfo),
	/// A malformed operand the decoder chose to carry instead of failing.
	Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
	/// Byte offset of the opcode; stable and unique within a body.
	pub offset: u32,
	/// Offset one past the last operand byte.
	pub end_offset: u32,
	pub op: OpCode,
	pub operand: Operand,
	pub label: Option<Label>,
	/// Synthetic instructions carry offsets for range resolution (dangling
	/// branch targets, handler ends past the body) but are not part of the
	/// decoded sequence.
	pub synthetic: bool,
}

impl Instruction {
	pub fn new(offset: u32, end_offset: u32, op: OpCode, operand: Operand) -> Instruction {
		Instruction { offset, end_offset, op, operand, label: None, synthetic: false }
	}

	pub fn synthetic_nop(offset: u32) -> Instruction {
		Instruction {
			offset,
			end_offset: offset + 1,
			op: OpCode::Nop,
			operand: Operand::None,
			label: None,
			synthetic: true,
		}
	}
}

/// The instruction arena of one method body, in decode order, with an
/// offset lookup side table.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InstructionCollection {
	items: Vec<Instruction>,
	by_offset: HashMap<u32, usize>,
}

impl InstructionCollection {
	pub fn new() -> InstructionCollection {
		InstructionCollection::default()
	}

	pub fn push(&mut self, instruction: Instruction) -> usize {
		let index = self.items.len();
		self.by_offset.insert(instruction.offset, index);
		self.items.push(instruction);
		index
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn get(&self, index: usize) -> &Instruction {
		&self.items[index]
	}

	pub fn get_mut(&mut self, index: usize) -> &mut Instruction {
		&mut self.items[index]
	}

	pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
		self.items.iter()
	}

	/// Indices of the decoded (non-synthetic) instructions, in stream order.
	pub fn real_indices(&self) -> impl Iterator<Item = usize> + '_ {
		self.items.iter().enumerate().filter(|(_, i)| !i.synthetic).map(|(index, _)| index)
	}

	pub fn try_at_offset(&self, offset: u32) -> Option<usize> {
		self.by_offset.get(&offset).copied()
	}

	pub fn at_offset(&self, offset: u32) -> Result<usize> {
		self.try_at_offset(offset)
			.ok_or_else(|| anyhow!("no instruction at bytecode offset {offset}"))
	}

	/// Looks up the instruction at `offset`, appending a synthetic `nop`
	/// carrier when the offset lies outside the decoded stream.
	pub fn ensure_at_offset(&mut self, offset: u32) -> usize {
		match self.try_at_offset(offset) {
			Some(index) => index,
			None => self.push(Instruction::synthetic_nop(offset)),
		}
	}

	/// The decoded instruction following `index` in stream order.
	pub fn next_index(&self, index: usize) -> Option<usize> {
		self.items[index + 1..]
			.iter()
			.position(|i| !i.synthetic)
			.map(|p| index + 1 + p)
	}

	/// The decoded instruction preceding `index` in stream order.
	pub fn previous_index(&self, index: usize) -> Option<usize> {
		self.items[..index]
			.iter()
			.rposition(|i| !i.synthetic)
	}

	/// The last decoded instruction.
	pub fn last_real_index(&self) -> Option<usize> {
		self.items.iter().rposition(|i| !i.synthetic)
	}
}

/// An inclusive instruction range, by arena index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionBlock {
	pub first: usize,
	pub last: usize,
}

impl ExceptionBlock {
	pub fn new(first: usize, last: usize) -> ExceptionBlock {
		ExceptionBlock { first, last }
	}
}

/// A normalized exception handler: a try range plus the handler code range,
/// with the raw table's catch-type token already resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ExceptionHandler {
	Catch {
		try_block: ExceptionBlock,
		handler_block: ExceptionBlock,
		catch_type: TypeReference,
	},
	Finally {
		try_block: ExceptionBlock,
		handler_block: ExceptionBlock,
	},
}

impl ExceptionHandler {
	pub fn try_block(&self) -> ExceptionBlock {
		match self {
			ExceptionHandler::Catch { try_block, .. } | ExceptionHandler::Finally { try_block, .. } => *try_block,
		}
	}

	pub fn handler_block(&self) -> ExceptionBlock {
		match self {
			ExceptionHandler::Catch { handler_block, .. } | ExceptionHandler::Finally { handler_block, .. } => *handler_block,
		}
	}

	pub fn is_finally(&self) -> bool {
		matches!(self, ExceptionHandler::Finally { .. })
	}

	pub fn is_catch(&self) -> bool {
		matches!(self, ExceptionHandler::Catch { .. })
	}

	pub fn catch_type(&self) -> Option<&TypeReference> {
		match self {
			ExceptionHandler::Catch { catch_type, .. } => Some(catch_type),
			ExceptionHandler::Finally { .. } => None,
		}
	}

	/// The same handler over a different try range.
	pub fn with_try_block(&self, try_block: ExceptionBlock) -> ExceptionHandler {
		match self {
			ExceptionHandler::Catch { handler_block, catch_type, .. } => ExceptionHandler::Catch {
				try_block,
				handler_block: *handler_block,
				catch_type: catch_type.clone(),
			},
			ExceptionHandler::Finally { handler_block, .. } => ExceptionHandler::Finally {
				try_block,
				handler_block: *handler_block,
			},
		}
	}

	/// The same handler over a different handler range.
	pub fn with_handler_block(&self, handler_block: ExceptionBlock) -> ExceptionHandler {
		match self {
			ExceptionHandler::Catch { try_block, catch_type, .. } => ExceptionHandler::Catch {
				try_block: *try_block,
				handler_block,
				catch_type: catch_type.clone(),
			},
			ExceptionHandler::Finally { try_block, .. } => ExceptionHandler::Finally {
				try_block: *try_block,
				handler_block,
			},
		}
	}
}

/// One raw `exception_table` entry, offsets as stored in the class file.
/// A `catch_type` token of zero means catch-any (a `finally` handler).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionTableEntry {
	pub start_offset: u32,
	pub end_offset: u32,
	pub handler_offset: u32,
	pub catch_type: u16,
}
