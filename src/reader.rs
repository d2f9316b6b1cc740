//! Decodes a method body: one pass over the code bytes producing the
//! instruction arena (with forward branches patched through a fixup table),
//! the merged local variable set, and the normalized exception handler list.

use std::collections::HashSet;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, trace};
use petgraph::graph::NodeIndex;
use crate::body::{
	CodeAttribute, LocalVariableEntry, MethodBody, MethodDefinition, ParameterDefinition,
	VariableDefinition, VariableDefinitionCollection,
};
use crate::error::CodeError;
use crate::flow::{ControlFlowGraph, NodeKind};
use crate::ir::{
	ExceptionBlock, ExceptionHandler, ExceptionTableEntry, Instruction, InstructionCollection,
	Label, Operand, SwitchInfo, SwitchKeys,
};
use crate::metadata::{MetadataScope, PrimitiveKind};
use crate::opcode::{OpCode, OperandKind, WIDE};

/// Reads the body of one method against a metadata scope.
pub struct MethodReader<'a, S> {
	method: &'a MethodDefinition,
	scope: &'a S,
}

/// Branch deltas resolve after their instruction is pushed; switch targets
/// resolve one by one the same way.
enum Pending {
	Done,
	Branch(i64),
	Switch { default_delta: i64, target_deltas: Vec<i64> },
}

/// A deferred operand patch, applied when the instruction at the fixup's
/// offset is finally emitted. Several branches into the same offset chain up.
#[derive(Debug, Copy, Clone)]
enum Fixup {
	Branch(usize),
	SwitchDefault(usize),
	SwitchTarget(usize, usize),
}

impl Fixup {
	fn apply(self, instructions: &mut InstructionCollection, target: usize) {
		match self {
			Fixup::Branch(at) => instructions.get_mut(at).operand = Operand::Branch(target),
			Fixup::SwitchDefault(at) => {
				if let Operand::Switch(switch) = &mut instructions.get_mut(at).operand {
					switch.default_target = target;
				}
			},
			Fixup::SwitchTarget(at, slot) => {
				if let Operand::Switch(switch) = &mut instructions.get_mut(at).operand {
					switch.targets[slot] = target;
				}
			},
		}
	}
}

impl<'a, S: MetadataScope> MethodReader<'a, S> {
	pub fn new(method: &'a MethodDefinition, scope: &'a S) -> MethodReader<'a, S> {
		MethodReader { method, scope }
	}

	pub fn read_body(&self) -> Result<MethodBody> {
		let code: &CodeAttribute = &self.method.code;
		let code_size = code.code.len() as u32;

		let mut variables = VariableDefinitionCollection::new();
		let (this_parameter, mut parameters) = self.declare_parameters(&mut variables, code_size);

		if let Some(table) = &code.local_variable_table {
			process_local_variable_table(&mut variables, table, &mut parameters);
		}
		if let Some(table) = &code.local_variable_type_table {
			process_local_variable_table(&mut variables, table, &mut parameters);
		}
		variables.merge_variables();

		let mut body = MethodBody {
			method_name: self.method.name.clone(),
			is_static: self.method.is_static,
			is_constructor: self.method.is_constructor(),
			declaring_type: self.method.declaring_type.clone(),
			descriptor: self.method.descriptor.clone(),
			max_stack: code.max_stack,
			max_locals: code.max_locals,
			code_size,
			instructions: InstructionCollection::new(),
			variables,
			exception_handlers: Vec::new(),
			parameters,
			this_parameter,
		};

		self.decode(&mut body)?;
		trace!("decoded {} instructions for {}", body.instructions.len(), self.method.name);

		body.variables.update_scopes(code_size);
		body.variables.merge_variables();
		body.variables.update_scopes(code_size);

		resolve_variable_operands(&mut body);
		number_labels(&mut body.instructions);

		if !code.exception_table.is_empty() && !body.instructions.is_empty() {
			body.exception_handlers =
				self.populate_exception_handler_info(&mut body.instructions, &code.exception_table)?;
			debug!(
				"normalized {} exception table entries into {} handlers",
				code.exception_table.len(),
				body.exception_handlers.len()
			);
		}

		Ok(body)
	}

	fn declare_parameters(
		&self,
		variables: &mut VariableDefinitionCollection,
		code_size: u32,
	) -> (Option<ParameterDefinition>, Vec<ParameterDefinition>) {
		let mut this_parameter = None;
		let mut slot: u16 = 0;

		if !self.method.is_static {
			variables.add(VariableDefinition {
				slot: 0,
				name: Some("this".to_owned()),
				variable_type: Some(self.method.declaring_type.clone()),
				scope_start: 0,
				scope_end: code_size,
				from_metadata: true,
				type_known: true,
				merged: false,
			});
			this_parameter = Some(ParameterDefinition {
				name: "this".to_owned(),
				position: 0,
				slot: 0,
				parameter_type: self.method.declaring_type.clone(),
			});
			slot = 1;
		}

		let mut parameters = Vec::with_capacity(self.method.descriptor.parameters.len());
		for (position, parameter_type) in self.method.descriptor.parameters.iter().enumerate() {
			let index = variables.ensure(slot, OpCode::Nop, 0);
			let v = variables.get_mut(index);
			v.name = Some(format!("p{position}"));
			v.variable_type = Some(parameter_type.clone());
			v.scope_start = 0;
			v.scope_end = code_size;
			v.from_metadata = true;
			v.type_known = true;

			parameters.push(ParameterDefinition {
				name: format!("p{position}"),
				position,
				slot,
				parameter_type: parameter_type.clone(),
			});
			slot += parameter_type.slot_width() as u16;
		}

		(this_parameter, parameters)
	}

	fn decode(&self, body: &mut MethodBody) -> Result<()> {
		let code = &self.method.code.code;
		let size = code.len() as u32;
		let max_locals = self.method.code.max_locals;
		let mut r = CodeReader { code, pos: 0 };

		// Indexed by target offset; entry `size` catches branches to the very
		// end of the code.
		let mut fixups: Vec<Vec<Fixup>> = vec![Vec::new(); code.len() + 1];

		while !r.is_at_end() {
			let offset = r.position();
			let mut byte = r.read_u8("opcode")?;
			let mut wide = false;

			if byte == WIDE {
				wide = true;
				byte = r.read_u8("wide opcode")?;
			}

			let op = OpCode::from_byte(byte)
				.ok_or(CodeError::UnknownOpcode { offset, opcode: byte })
				.with_context(|| anyhow!("at bytecode offset {offset}"))?;
			let kind = op.operand_kind();
			if wide && !matches!(kind, OperandKind::Local | OperandKind::LocalI1) {
				bail!(CodeError::UnknownOpcode { offset, opcode: byte });
			}

			let index = body.instructions.len();
			let mut pending = Pending::Done;

			let operand = match kind {
				OperandKind::None => {
					if let Some(slot) = op.macro_slot() {
						body.variables.ensure(slot, op, offset);
					}
					Operand::None
				},
				OperandKind::PrimitiveTypeCode => {
					let atype = r.read_u8("array type")?;
					Operand::PrimitiveType(primitive_from_atype(atype, offset)?)
				},
				OperandKind::TypeReference => {
					let token = r.read_u16("type token")?;
					Operand::Type(self.scope.lookup_type(token)?)
				},
				OperandKind::TypeReferenceU1 => {
					let token = r.read_u16("type token")?;
					let dimensions = r.read_u8("dimensions")?;
					Operand::TypeU1(self.scope.lookup_type(token)?, dimensions)
				},
				OperandKind::DynamicCallSite => {
					let token = r.read_u16("call site token")?;
					r.read_u8("call site padding")?;
					r.read_u8("call site padding")?;
					Operand::CallSite(self.scope.lookup_dynamic_call_site(token)?)
				},
				OperandKind::MethodReference => {
					let token = r.read_u16("method token")?;
					let method = self.scope.lookup_method(token)?;
					if op == OpCode::InvokeInterface {
						r.read_u8("count")?;
						r.read_u8("padding")?;
					}
					Operand::Method(method)
				},
				OperandKind::FieldReference => {
					let token = r.read_u16("field token")?;
					Operand::Field(self.scope.lookup_field(token)?)
				},
				OperandKind::BranchTarget => {
					let delta = r.read_i16("branch target")? as i64;
					pending = Pending::Branch(delta);
					Operand::None
				},
				OperandKind::BranchTargetWide => {
					let delta = r.read_i32("wide branch target")? as i64;
					pending = Pending::Branch(delta);
					Operand::None
				},
				OperandKind::I1 => Operand::Immediate(r.read_i8("immediate")? as i64),
				OperandKind::I2 => Operand::Immediate(r.read_i16("immediate")? as i64),
				OperandKind::I8 => Operand::Immediate(r.read_i64("immediate")?),
				OperandKind::Constant => {
					let token = r.read_u8("constant token")? as u16;
					Operand::Constant(self.scope.lookup_constant(token)?)
				},
				OperandKind::WideConstant => {
					let token = r.read_u16("constant token")?;
					Operand::Constant(self.scope.lookup_constant(token)?)
				},
				OperandKind::Switch => {
					while r.position() % 4 != 0 {
						r.read_u8("switch padding")?;
					}
					let default_delta = r.read_i32("switch default")? as i64;
					let (keys, target_deltas) = if op == OpCode::TableSwitch {
						let low = r.read_i32("tableswitch low")?;
						let high = r.read_i32("tableswitch high")?;
						if low > high {
							bail!("tableswitch at offset {offset} has low {low} > high {high}");
						}
						let count = (high as i64 - low as i64 + 1) as usize;
						let mut deltas = Vec::with_capacity(count);
						for _ in 0..count {
							deltas.push(r.read_i32("tableswitch target")? as i64);
						}
						(SwitchKeys::Table { low, high }, deltas)
					} else {
						let pair_count = r.read_i32("lookupswitch pair count")?;
						if pair_count < 0 {
							bail!("lookupswitch at offset {offset} has negative pair count {pair_count}");
						}
						let mut keys = Vec::with_capacity(pair_count as usize);
						let mut deltas = Vec::with_capacity(pair_count as usize);
						for _ in 0..pair_count {
							keys.push(r.read_i32("lookupswitch key")?);
							deltas.push(r.read_i32("lookupswitch target")? as i64);
						}
						(SwitchKeys::Lookup(keys), deltas)
					};
					let targets = vec![usize::MAX; target_deltas.len()];
					pending = Pending::Switch { default_delta, target_deltas };
					Operand::Switch(SwitchInfo { default_target: usize::MAX, keys, targets })
				},
				OperandKind::Local => {
					let slot = if wide { r.read_u16("local slot")? } else { r.read_u8("local slot")? as u16 };
					local_operand(&mut body.variables, slot, max_locals, op, offset)
				},
				OperandKind::LocalI1 => {
					let slot = if wide { r.read_u16("local slot")? } else { r.read_u8("local slot")? as u16 };
					let immediate = if wide {
						r.read_i16("increment")? as i32
					} else {
						r.read_i8("increment")? as i32
					};
					match local_operand(&mut body.variables, slot, max_locals, op, offset) {
						Operand::Local(v) => Operand::LocalImmediate(v, immediate),
						error => error,
					}
				},
				OperandKind::LocalI2 => {
					let slot = r.read_u16("local slot")?;
					let immediate = r.read_i16("increment")? as i32;
					match local_operand(&mut body.variables, slot, max_locals, op, offset) {
						Operand::Local(v) => Operand::LocalImmediate(v, immediate),
						error => error,
					}
				},
			};

			let end_offset = r.position();
			body.instructions.push(Instruction::new(offset, end_offset, op, operand));

			match pending {
				Pending::Done => {},
				Pending::Branch(delta) => {
					self.resolve_branch(body, &mut fixups, index, offset, delta, size, |instructions, target| {
						instructions.get_mut(index).operand = Operand::Branch(target);
					})?;
				},
				Pending::Switch { default_delta, target_deltas } => {
					self.resolve_switch_target(body, &mut fixups, index, offset, default_delta, size, None)?;
					for (slot, delta) in target_deltas.into_iter().enumerate() {
						self.resolve_switch_target(body, &mut fixups, index, offset, delta, size, Some(slot))?;
					}
				},
			}

			// Everything waiting on this offset binds to the freshly emitted
			// instruction.
			let waiting = std::mem::take(&mut fixups[offset as usize]);
			if !waiting.is_empty() {
				ensure_label(&mut body.instructions, index);
				for fixup in waiting {
					fixup.apply(&mut body.instructions, index);
				}
			}
		}

		// Branches into the middle of an instruction (or to the very end of
		// the code) never see their target emitted; give them a synthetic
		// carrier instead of leaving the operand dangling.
		for offset in 0..fixups.len() {
			if fixups[offset].is_empty() {
				continue;
			}
			let target = body.instructions.ensure_at_offset(offset as u32);
			for fixup in std::mem::take(&mut fixups[offset]) {
				fixup.apply(&mut body.instructions, target);
			}
		}

		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	fn resolve_branch(
		&self,
		body: &mut MethodBody,
		fixups: &mut [Vec<Fixup>],
		index: usize,
		offset: u32,
		delta: i64,
		size: u32,
		bind: impl FnOnce(&mut InstructionCollection, usize),
	) -> Result<()> {
		let target = offset as i64 + delta;
		if !(0..=u32::MAX as i64).contains(&target) {
			bail!("branch at offset {offset} targets offset {target} outside the addressable range");
		}
		let target = target as u32;

		if target < offset {
			let resolved = body
				.instructions
				.at_offset(target)
				.with_context(|| anyhow!("branch at offset {offset}"))?;
			ensure_label(&mut body.instructions, resolved);
			bind(&mut body.instructions, resolved);
		} else if target == offset {
			ensure_label(&mut body.instructions, index);
			bind(&mut body.instructions, index);
		} else if target > size {
			let synthetic = body.instructions.ensure_at_offset(target);
			bind(&mut body.instructions, synthetic);
		} else {
			fixups[target as usize].push(Fixup::Branch(index));
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	fn resolve_switch_target(
		&self,
		body: &mut MethodBody,
		fixups: &mut [Vec<Fixup>],
		index: usize,
		offset: u32,
		delta: i64,
		size: u32,
		slot: Option<usize>,
	) -> Result<()> {
		let set = move |instructions: &mut InstructionCollection, target: usize| {
			if let Operand::Switch(switch) = &mut instructions.get_mut(index).operand {
				match slot {
					None => switch.default_target = target,
					Some(s) => switch.targets[s] = target,
				}
			}
		};

		let target = offset as i64 + delta;
		if !(0..=u32::MAX as i64).contains(&target) {
			bail!("switch at offset {offset} targets offset {target} outside the addressable range");
		}
		let target = target as u32;

		if target < offset {
			let resolved = body
				.instructions
				.at_offset(target)
				.with_context(|| anyhow!("switch at offset {offset}"))?;
			ensure_label(&mut body.instructions, resolved);
			set(&mut body.instructions, resolved);
		} else if target == offset {
			ensure_label(&mut body.instructions, index);
			set(&mut body.instructions, index);
		} else if target > size {
			let synthetic = body.instructions.ensure_at_offset(target);
			set(&mut body.instructions, synthetic);
		} else {
			fixups[target as usize].push(match slot {
				None => Fixup::SwitchDefault(index),
				Some(s) => Fixup::SwitchTarget(index, s),
			});
		}
		Ok(())
	}

	/// Derives each raw table entry's handler end from control flow, then
	/// materializes the `ExceptionHandler` list.
	fn populate_exception_handler_info(
		&self,
		instructions: &mut InstructionCollection,
		table: &[ExceptionTableEntry],
	) -> Result<Vec<ExceptionHandler>> {
		struct HandlerWithRange {
			entry: ExceptionTableEntry,
			handler_start: u32,
			handler_end: u32,
		}

		let body_end = instructions.last_real_index().expect("non-empty body");
		let body_end_offset = instructions.get(body_end).offset;
		let body_end_end_offset = instructions.get(body_end).end_offset;

		let mut entries: Vec<HandlerWithRange> = table
			.iter()
			.map(|&entry| HandlerWithRange {
				entry,
				handler_start: entry.handler_offset,
				handler_end: u32::MAX,
			})
			.collect();

		// No exception edges: the handler end reconstruction wants the pure
		// jump structure. Handler entries and try ends still need to start
		// blocks so the searches below find their nodes.
		let mut boundaries = Vec::new();
		for entry in table {
			boundaries.push(entry.handler_offset);
			boundaries.push(entry.end_offset);
			if let Some(at_end) = instructions.try_at_offset(entry.end_offset) {
				boundaries.push(instructions.get(at_end).end_offset);
			}
		}

		let mut cfg = ControlFlowGraph::build(instructions, &[], &boundaries);
		cfg.compute_dominance();
		cfg.compute_dominance_frontier();

		for i in 0..entries.len() {
			let mut min_offset = u32::MAX;

			// The node whose last instruction sits at the raw try end; a
			// trailing goto into the nearest handler belongs to the try.
			let mut try_end: Option<NodeIndex> = None;
			for node in cfg.nodes() {
				let weight = cfg.node(node);
				let Some(last) = weight.last else { continue };
				if instructions.get(last).offset != entries[i].entry.end_offset {
					continue;
				}

				let nearest_start = entries
					.iter()
					.filter(|h| {
						h.entry.start_offset == entries[i].entry.start_offset
							&& h.entry.end_offset == entries[i].entry.end_offset
					})
					.map(|h| h.handler_start)
					.min()
					.unwrap_or(entries[i].handler_start);
				let first_handler_insn = instructions.try_at_offset(nearest_start);

				let last_insn = instructions.get(last);
				if last_insn.op == OpCode::Goto && instructions.next_index(last) == first_handler_insn {
					try_end = Some(node);
				} else if let Some(first) = weight.first {
					if let Some(previous) = instructions.previous_index(first) {
						try_end = cfg.node_containing(previous);
					}
				}
				break;
			}

			for node in cfg.nodes() {
				let weight = cfg.node(node);
				if weight.kind != NodeKind::Normal || weight.start_offset != Some(entries[i].handler_start) {
					continue;
				}

				let mut visited = HashSet::new();
				let end = find_handler_end(&cfg, node, try_end, &mut visited, cfg.regular_exit);
				min_offset = match end {
					Some(e) if cfg.node(e).kind == NodeKind::Normal => cfg.node(e).end_offset.unwrap(),
					_ => weight.end_offset.unwrap(),
				};

				// A handler cannot run into an enclosing handler.
				for (k, other) in entries.iter().enumerate() {
					if k != i
						&& entries[i].entry.start_offset >= other.entry.start_offset
						&& entries[i].entry.handler_offset < other.entry.handler_offset
						&& entries[i].entry.end_offset <= other.entry.end_offset
						&& other.handler_start < min_offset
					{
						min_offset = other.handler_start;
					}
				}
				break;
			}

			if min_offset != u32::MAX {
				entries[i].handler_end = min_offset;
			}
		}

		let mut handlers = Vec::with_capacity(entries.len());

		for entry in &entries {
			let resolve_last = |instructions: &mut InstructionCollection, end_offset: u32| -> Result<usize> {
				if end_offset <= body_end_offset {
					let at_end = instructions
						.at_offset(end_offset)
						.with_context(|| anyhow!("exception table references offset {end_offset}"))?;
					instructions
						.previous_index(at_end)
						.ok_or_else(|| anyhow!("empty range ending at offset {end_offset}"))
				} else if end_offset == body_end_end_offset {
					Ok(body_end)
				} else {
					Ok(instructions.ensure_at_offset(end_offset))
				}
			};

			let first = instructions
				.at_offset(entry.entry.start_offset)
				.with_context(|| anyhow!("exception table try start {}", entry.entry.start_offset))?;
			let last = resolve_last(instructions, entry.entry.end_offset)?;
			let handler_first = instructions
				.at_offset(entry.handler_start)
				.with_context(|| anyhow!("exception table handler start {}", entry.handler_start))?;
			let handler_end = if entry.handler_end == u32::MAX { body_end_end_offset } else { entry.handler_end };
			let handler_last = resolve_last(instructions, handler_end)?;

			let try_block = ExceptionBlock::new(first, last);
			let handler_block = ExceptionBlock::new(handler_first, handler_last);

			handlers.push(if entry.entry.catch_type == 0 {
				ExceptionHandler::Finally { try_block, handler_block }
			} else {
				ExceptionHandler::Catch {
					try_block,
					handler_block,
					catch_type: self.scope.lookup_type(entry.entry.catch_type)?,
				}
			});
		}

		Ok(handlers)
	}
}

/// Walks the handler's successor tree for the first node that neither leads
/// back into the try block nor reaches the regular exit; that node ends the
/// handler.
fn find_handler_end(
	cfg: &ControlFlowGraph,
	node: NodeIndex,
	try_end: Option<NodeIndex>,
	visited: &mut HashSet<NodeIndex>,
	regular_exit: NodeIndex,
) -> Option<NodeIndex> {
	if !visited.insert(node) {
		return None;
	}

	for successor in cfg.successors(node) {
		if cfg.node(successor).kind != NodeKind::Normal {
			continue;
		}
		if let Some(try_end) = try_end {
			if cfg.dominates(try_end, successor) {
				continue;
			}
		}
		if cfg.dominator_tree_children(successor).is_empty() {
			if let Some(result) = find_handler_end(cfg, successor, try_end, visited, regular_exit) {
				return Some(result);
			}
			let escapes = cfg
				.dominance_frontier(successor)
				.map_or(true, |frontier| !frontier.contains(&regular_exit));
			if escapes {
				return Some(successor);
			}
		}
	}

	None
}

struct CodeReader<'a> {
	code: &'a [u8],
	pos: usize,
}

impl<'a> CodeReader<'a> {
	fn position(&self) -> u32 {
		self.pos as u32
	}

	fn is_at_end(&self) -> bool {
		self.pos >= self.code.len()
	}

	fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
		if self.pos + n > self.code.len() {
			bail!(CodeError::UnexpectedEndOfCode { offset: self.position(), what });
		}
		let bytes = &self.code[self.pos..self.pos + n];
		self.pos += n;
		Ok(bytes)
	}

	fn read_u8(&mut self, what: &'static str) -> Result<u8> {
		Ok(self.take(1, what)?[0])
	}

	fn read_i8(&mut self, what: &'static str) -> Result<i8> {
		Ok(self.read_u8(what)? as i8)
	}

	fn read_u16(&mut self, what: &'static str) -> Result<u16> {
		let b = self.take(2, what)?;
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}

	fn read_i16(&mut self, what: &'static str) -> Result<i16> {
		Ok(self.read_u16(what)? as i16)
	}

	fn read_i32(&mut self, what: &'static str) -> Result<i32> {
		let b = self.take(4, what)?;
		Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	fn read_i64(&mut self, what: &'static str) -> Result<i64> {
		let b = self.take(8, what)?;
		Ok(i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
	}
}

fn primitive_from_atype(atype: u8, offset: u32) -> Result<PrimitiveKind> {
	Ok(match atype {
		4 => PrimitiveKind::Boolean,
		5 => PrimitiveKind::Char,
		6 => PrimitiveKind::Float,
		7 => PrimitiveKind::Double,
		8 => PrimitiveKind::Byte,
		9 => PrimitiveKind::Short,
		10 => PrimitiveKind::Int,
		11 => PrimitiveKind::Long,
		_ => bail!("unknown array element type {atype} at offset {offset}"),
	})
}

fn local_operand(
	variables: &mut VariableDefinitionCollection,
	slot: u16,
	max_locals: u16,
	op: OpCode,
	offset: u32,
) -> Operand {
	if slot >= max_locals {
		Operand::Error(format!("bad local slot {slot}"))
	} else {
		Operand::Local(variables.ensure(slot, op, offset))
	}
}

fn ensure_label(instructions: &mut InstructionCollection, index: usize) {
	let insn = instructions.get_mut(index);
	if insn.label.is_none() {
		let offset = insn.offset;
		insn.label = Some(Label { offset, index: 0 });
	}
}

/// Re-resolves variable operands against the merged variable set. A store's
/// value becomes visible after the instruction, so stores resolve at their
/// end offset.
fn resolve_variable_operands(body: &mut MethodBody) {
	let indices: Vec<usize> = body.instructions.real_indices().collect();
	for index in indices {
		let insn = body.instructions.get(index);
		let (variable, immediate) = match &insn.operand {
			Operand::Local(v) => (*v, None),
			Operand::LocalImmediate(v, imm) => (*v, Some(*imm)),
			_ => continue,
		};
		let slot = body.variables.get(variable).slot;
		let effective = if insn.op.is_store() { insn.end_offset } else { insn.offset };
		if let Some(actual) = body.variables.try_find(slot, effective) {
			if actual != variable {
				body.instructions.get_mut(index).operand = match immediate {
					None => Operand::Local(actual),
					Some(imm) => Operand::LocalImmediate(actual, imm),
				};
			}
		}
	}
}

fn number_labels(instructions: &mut InstructionCollection) {
	let indices: Vec<usize> = instructions.real_indices().collect();
	let mut count = 0;
	for index in indices {
		if let Some(label) = &mut instructions.get_mut(index).label {
			label.index = count;
			count += 1;
		}
	}
}

fn process_local_variable_table(
	variables: &mut VariableDefinitionCollection,
	table: &[LocalVariableEntry],
	parameters: &mut [ParameterDefinition],
) {
	for entry in table {
		let scope_start = entry.start_pc as u32;
		let scope_end = scope_start + entry.length as u32;

		match variables.try_find(entry.slot, scope_start) {
			Some(index) => {
				let v = variables.get_mut(index);
				if !entry.name.is_empty() {
					v.name = Some(entry.name.clone());
				}
				v.variable_type = Some(entry.variable_type.clone());
				v.type_known = true;
				v.from_metadata = true;
				v.scope_start = scope_start;
				v.scope_end = scope_end;
			},
			None => {
				variables.add(VariableDefinition {
					slot: entry.slot,
					name: Some(entry.name.clone()),
					variable_type: Some(entry.variable_type.clone()),
					scope_start,
					scope_end,
					from_metadata: true,
					type_known: true,
					merged: false,
				});
			},
		}

		// Parameter names come from the variable table when present.
		if entry.start_pc == 0 && !entry.name.is_empty() {
			for parameter in parameters.iter_mut() {
				if parameter.slot == entry.slot {
					parameter.name = entry.name.clone();
				}
			}
		}
	}
}

#[cfg(test)]
mod testing {
	use super::*;
	use anyhow::Result;
	use crate::metadata::{DynamicCallSite, FieldRef, Loadable, MethodDescriptor, MethodRef, TypeReference};

	struct EmptyScope;

	impl MetadataScope for EmptyScope {
		fn lookup_type(&self, token: u16) -> Result<TypeReference> {
			Ok(TypeReference::object(&format!("Type{token}")))
		}
		fn lookup_constant(&self, token: u16) -> Result<Loadable> {
			Ok(Loadable::Integer(token as i32))
		}
		fn lookup_field(&self, _token: u16) -> Result<FieldRef> {
			bail!("no fields")
		}
		fn lookup_method(&self, _token: u16) -> Result<MethodRef> {
			bail!("no methods")
		}
		fn lookup_dynamic_call_site(&self, _token: u16) -> Result<DynamicCallSite> {
			bail!("no call sites")
		}
	}

	fn static_method(code: Vec<u8>, max_locals: u16) -> MethodDefinition {
		MethodDefinition {
			name: "test".to_owned(),
			is_static: true,
			declaring_type: TypeReference::object("Test"),
			descriptor: MethodDescriptor { parameters: vec![], return_type: None },
			code: CodeAttribute {
				max_stack: 4,
				max_locals,
				code,
				exception_table: vec![],
				local_variable_table: None,
				local_variable_type_table: None,
			},
		}
	}

	#[test]
	fn forward_branch_binds_through_fixup() -> Result<()> {
		// ifeq +5 jumps over iconst_1/ireturn to iconst_0.
		let code = vec![0x03, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
		let body = MethodReader::new(&static_method(code, 0), &EmptyScope).read_body()?;

		let branch = body.instructions.at_offset(1)?;
		let target = body.instructions.at_offset(6)?;
		assert_eq!(body.instructions.get(branch).operand, Operand::Branch(target));

		let label = body.instructions.get(target).label.expect("target is labeled");
		assert_eq!(label.offset, 6);
		assert_eq!(label.index, 0);
		Ok(())
	}

	#[test]
	fn backward_branch_binds_immediately() -> Result<()> {
		// iconst_0; pop; goto -2 back to offset 0.
		let code = vec![0x03, 0x57, 0xa7, 0xff, 0xfe];
		let body = MethodReader::new(&static_method(code, 0), &EmptyScope).read_body()?;

		let goto = body.instructions.at_offset(2)?;
		let target = body.instructions.at_offset(0)?;
		assert_eq!(body.instructions.get(goto).operand, Operand::Branch(target));
		assert!(body.instructions.get(target).label.is_some());
		Ok(())
	}

	#[test]
	fn dangling_branch_gets_synthetic_nop() -> Result<()> {
		// goto +100 points far past the end of the two-byte body.
		let code = vec![0xa7, 0x00, 0x64];
		let body = MethodReader::new(&static_method(code, 0), &EmptyScope).read_body()?;

		let goto = body.instructions.at_offset(0)?;
		let Operand::Branch(target) = body.instructions.get(goto).operand else {
			panic!("expected branch operand");
		};
		assert!(body.instructions.get(target).synthetic);
		assert_eq!(body.instructions.get(target).offset, 100);
		Ok(())
	}

	#[test]
	fn unknown_opcode_is_fatal_with_offset() {
		let code = vec![0x03, 0xca];
		let err = MethodReader::new(&static_method(code, 0), &EmptyScope)
			.read_body()
			.unwrap_err();
		let code_error = err.downcast_ref::<CodeError>().expect("typed failure");
		assert_eq!(*code_error, CodeError::UnknownOpcode { offset: 1, opcode: 0xca });
	}

	#[test]
	fn tableswitch_decodes_and_resolves_targets() -> Result<()> {
		// 0: iconst_0
		// 1: tableswitch pad(2) default=+23 low=0 high=1 targets +23 +23
		// 24: return
		let mut code = vec![0x03, 0xaa, 0x00, 0x00];
		code.extend_from_slice(&23i32.to_be_bytes());
		code.extend_from_slice(&0i32.to_be_bytes());
		code.extend_from_slice(&1i32.to_be_bytes());
		code.extend_from_slice(&23i32.to_be_bytes());
		code.extend_from_slice(&23i32.to_be_bytes());
		code.push(0xb1);
		let body = MethodReader::new(&static_method(code, 0), &EmptyScope).read_body()?;

		let switch_index = body.instructions.at_offset(1)?;
		let return_index = body.instructions.at_offset(24)?;
		let Operand::Switch(switch) = &body.instructions.get(switch_index).operand else {
			panic!("expected switch operand");
		};
		assert_eq!(switch.default_target, return_index);
		assert_eq!(switch.targets, vec![return_index, return_index]);
		assert_eq!(switch.keys, SwitchKeys::Table { low: 0, high: 1 });
		Ok(())
	}

	#[test]
	fn bad_local_slot_downgrades_to_error_operand() -> Result<()> {
		// iload 7 with max_locals 1.
		let code = vec![0x15, 0x07, 0xb1];
		let body = MethodReader::new(&static_method(code, 1), &EmptyScope).read_body()?;
		let load = body.instructions.at_offset(0)?;
		assert!(matches!(body.instructions.get(load).operand, Operand::Error(_)));
		Ok(())
	}
}
