//! Lifts an analyzed method body into the expression tree: canonicalizes the
//! handler table, runs the stack analysis to a fixed point, trades the
//! operand stack for temporaries, splits locals along their reaching
//! definitions, and assembles the try/catch scope tree.

use std::collections::HashMap;
use anyhow::{anyhow, bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use log::{debug, trace};
use crate::ast::{
	label_name, AstCode, AstOperand, Block, CatchBlock, DecompilerContext, Expression, MethodAst,
	Node, Range, TryCatchBlock, VarId, Variable,
};
use crate::body::MethodBody;
use crate::error::CodeError;
use crate::flow::{ControlFlowGraph, NodeKind};
use crate::frames::{self, Frame, FrameValue, StackMappingVisitor};
use crate::ir::{ExceptionBlock, ExceptionHandler, Operand, SwitchInfo};
use crate::metadata::{Loadable, MetadataScope, PrimitiveKind, TypeReference};
use crate::opcode::{FlowControl, OpCode};

/// One operand stack entry at a program point: its abstract value, the set of
/// instructions that may have pushed it, and (after rewriting) the temporary
/// it is loaded from.
#[derive(Debug, Clone, PartialEq)]
struct StackSlot {
	value: FrameValue,
	definitions: Vec<usize>,
	load_from: Option<VarId>,
}

impl StackSlot {
	fn new(value: FrameValue, definitions: Vec<usize>) -> StackSlot {
		StackSlot { value, definitions, load_from: None }
	}
}

/// One local variable slot at a program point.
#[derive(Debug, Clone, PartialEq)]
struct VariableSlot {
	value: FrameValue,
	definitions: Vec<usize>,
}

impl VariableSlot {
	fn unknown() -> VariableSlot {
		VariableSlot { value: FrameValue::Uninitialized(None), definitions: Vec::new() }
	}

	fn is_uninitialized(&self) -> bool {
		self.value.is_uninitialized()
	}
}

/// The mutable per-instruction analysis record.
#[derive(Debug, Clone)]
struct ByteCode {
	/// Arena index of the decoded instruction; `None` for the synthetic
	/// load-exception records.
	instruction: Option<usize>,
	offset: u32,
	end_offset: u32,
	code: AstCode,
	operand: AstOperand,
	second_operand: Option<i32>,
	/// `None` pops the whole stack.
	pop_count: Option<u16>,
	push_count: u16,
	label: Option<String>,
	/// `None` until the analysis reaches this record; still `None` afterwards
	/// means unreachable.
	stack_before: Option<Vec<StackSlot>>,
	variables_before: Option<Vec<VariableSlot>>,
	store_to: Vec<VarId>,
}

impl ByteCode {
	fn is_variable_definition(&self) -> bool {
		matches!(self.code, AstCode::Store | AstCode::Inc)
	}
}

/// Builds the expression tree for `body`.
pub fn build<S: MetadataScope>(
	body: &MethodBody,
	scope: &S,
	context: &DecompilerContext,
) -> Result<MethodAst> {
	if body.instructions.is_empty() {
		return Ok(MethodAst { nodes: Vec::new(), variables: Vec::new() });
	}

	let mut builder = AstBuilder {
		body,
		scope,
		context,
		handlers: body.exception_handlers.clone(),
		bytecodes: Vec::new(),
		order: Vec::new(),
		bc_of_insn: HashMap::new(),
		load_exceptions: IndexMap::new(),
		variables: Vec::new(),
	};

	builder.prune_exception_handlers();
	trace!("{} handlers after pruning", builder.handlers.len());

	let cfg = ControlFlowGraph::build(&body.instructions, &builder.handlers, &[]);
	builder.perform_stack_analysis(&cfg)?;

	let mut active: IndexSet<usize> = (0..builder.handlers.len()).collect();
	let mut end_index = builder.order.len();
	let mut nodes = builder.convert_to_ast(&mut active, 0, &mut end_index)?;

	builder.inline_temporaries(&mut nodes);

	Ok(MethodAst { nodes, variables: builder.variables })
}

struct AstBuilder<'a, S> {
	body: &'a MethodBody,
	scope: &'a S,
	context: &'a DecompilerContext,
	handlers: Vec<ExceptionHandler>,
	bytecodes: Vec<ByteCode>,
	/// The reachable records, analysis order; indices into `bytecodes`.
	order: Vec<usize>,
	bc_of_insn: HashMap<usize, usize>,
	/// Handler index to its synthetic load-exception record.
	load_exceptions: IndexMap<usize, usize>,
	variables: Vec<Variable>,
}

impl<'a, S: MetadataScope> AstBuilder<'a, S> {
	fn offset_of(&self, instruction: usize) -> u32 {
		self.body.instructions.get(instruction).offset
	}

	fn end_offset_of(&self, instruction: usize) -> u32 {
		self.body.instructions.get(instruction).end_offset
	}

	fn op_of(&self, instruction: usize) -> OpCode {
		self.body.instructions.get(instruction).op
	}

	fn new_variable(&mut self, variable: Variable) -> VarId {
		self.variables.push(variable);
		self.variables.len() - 1
	}

	fn generated_variable(&mut self, name: String, variable_type: Option<TypeReference>) -> VarId {
		self.new_variable(Variable {
			name,
			variable_type,
			generated: true,
			original_parameter_slot: None,
			original_variable: None,
		})
	}

	// ------------------------------------------------------------------
	// Handler pruning
	// ------------------------------------------------------------------

	/// Handlers sharing `try_block`, ordered by handler start offset.
	fn find_handlers(&self, try_block: ExceptionBlock) -> Vec<usize> {
		let mut result: Vec<usize> = (0..self.handlers.len())
			.filter(|&h| self.handlers[h].try_block() == try_block)
			.collect();
		result.sort_by_key(|&h| self.offset_of(self.handlers[h].handler_block().first));
		result
	}

	fn find_first_handler(&self, try_block: ExceptionBlock) -> Option<usize> {
		self.find_handlers(try_block).into_iter().next()
	}

	/// The handler whose try block most tightly encloses `offset`.
	fn find_innermost_handler(&self, offset: u32, exclude: usize) -> Option<usize> {
		let mut result: Option<usize> = None;
		for h in 0..self.handlers.len() {
			if h == exclude {
				continue;
			}
			let try_block = self.handlers[h].try_block();
			let start = self.offset_of(try_block.first);
			let end = self.end_offset_of(try_block.last);
			if start <= offset && offset < end {
				let better = match result {
					None => true,
					Some(r) => start > self.offset_of(self.handlers[r].try_block().first),
				};
				if better {
					result = Some(h);
				}
			}
		}
		result
	}

	fn prune_exception_handlers(&mut self) {
		self.remove_self_handling_finallies();
		self.close_try_handler_gaps();
		self.align_sibling_try_blocks();
		self.align_catch_to_next_catch();
		self.remove_catch_sibling_finally_duplicates();
		self.merge_split_finallies();
		self.extend_try_past_trailing_exit();
		self.remove_finally_duplicating_outer_catch();
	}

	/// A finally that begins where its own try begins handles itself; it adds
	/// nothing to the tree.
	fn remove_self_handling_finallies(&mut self) {
		let mut i = 0;
		while i < self.handlers.len() {
			let handler = &self.handlers[i];
			let try_block = handler.try_block();
			let handler_block = handler.handler_block();
			if handler.is_finally()
				&& handler_block.first == try_block.first
				&& self.offset_of(try_block.last) < self.end_offset_of(handler_block.last)
			{
				self.handlers.remove(i);
				continue;
			}
			i += 1;
		}
	}

	/// A try range split around an exit branch shares one handler; the parts
	/// merge back into a single range.
	fn close_try_handler_gaps(&mut self) {
		let mut i = 0;
		while i + 1 < self.handlers.len() {
			let current = self.handlers[i].clone();
			let next = self.handlers[i + 1].clone();

			if current.handler_block() == next.handler_block() {
				let last_in_current = current.try_block().last;
				let first_in_next = next.try_block().first;
				let branch_in_between = self.body.instructions.previous_index(first_in_next);
				let before_branch = branch_in_between.and_then(|b| self.body.instructions.previous_index(b));

				if let Some(branch) = branch_in_between {
					if self.op_of(branch).flow_control() == FlowControl::Branch
						&& before_branch == Some(last_in_current)
					{
						let merged = current.with_try_block(ExceptionBlock::new(
							current.try_block().first,
							next.try_block().last,
						));
						self.handlers[i] = merged;
						self.handlers.remove(i + 1);
					}
				}
			}
			i += 1;
		}
	}

	/// All siblings of a try block end one instruction before the first
	/// sibling handler begins.
	fn align_sibling_try_blocks(&mut self) {
		for i in 0..self.handlers.len() {
			let try_block = self.handlers[i].try_block();
			let siblings = self.find_handlers(try_block);
			let Some(&first_sibling) = siblings.first() else { continue };
			let first_handler_block = self.handlers[first_sibling].handler_block();
			let Some(desired_end_try) = self.body.instructions.previous_index(first_handler_block.first) else {
				continue;
			};

			if try_block.last == desired_end_try {
				continue;
			}
			for &sibling in &siblings {
				self.handlers[sibling] = self.handlers[sibling]
					.with_try_block(ExceptionBlock::new(try_block.first, desired_end_try));
			}
		}
	}

	/// A catch preceding another sibling is clamped to end right before it.
	fn align_catch_to_next_catch(&mut self) {
		for i in 0..self.handlers.len() {
			if !self.handlers[i].is_finally() {
				continue;
			}
			let siblings = self.find_handlers(self.handlers[i].try_block());
			for j in 0..siblings.len().saturating_sub(1) {
				let sibling = siblings[j];
				if !self.handlers[sibling].is_catch() {
					continue;
				}
				let next_first = self.handlers[siblings[j + 1]].handler_block().first;
				let Some(desired_last) = self.body.instructions.previous_index(next_first) else { continue };
				let handler_block = self.handlers[sibling].handler_block();
				if handler_block.last != desired_last {
					self.handlers[sibling] = self.handlers[sibling]
						.with_handler_block(ExceptionBlock::new(handler_block.first, desired_last));
				}
			}
		}
	}

	/// A finally that re-enters a catch sibling's handler and duplicates the
	/// outer finally is redundant.
	fn remove_catch_sibling_finally_duplicates(&mut self) {
		'restart: loop {
			for i in 0..self.handlers.len() {
				if !self.handlers[i].is_finally() {
					continue;
				}
				let handler_block = self.handlers[i].handler_block();
				let siblings = self.find_handlers(self.handlers[i].try_block());
				for &sibling in &siblings {
					if sibling == i || self.handlers[sibling].is_finally() {
						continue;
					}
					let sibling_handler_first = self.handlers[sibling].handler_block().first;
					for j in 0..self.handlers.len() {
						if j == i || j == sibling || !self.handlers[j].is_finally() {
							continue;
						}
						if self.handlers[j].try_block().first == sibling_handler_first
							&& self.handlers[j].handler_block() == handler_block
						{
							self.handlers.remove(j);
							continue 'restart;
						}
					}
				}
			}
			break;
		}
	}

	/// Two finallies with one handler where one try contains the other and
	/// both end together are the same finally.
	fn merge_split_finallies(&mut self) {
		'restart: loop {
			for i in 0..self.handlers.len() {
				if !self.handlers[i].is_finally() {
					continue;
				}
				let try_block = self.handlers[i].try_block();
				let handler_block = self.handlers[i].handler_block();
				for j in 0..self.handlers.len() {
					if j == i || !self.handlers[j].is_finally() {
						continue;
					}
					let other_try = self.handlers[j].try_block();
					let contains = self.offset_of(try_block.first) <= self.offset_of(other_try.first)
						&& self.end_offset_of(other_try.last) <= self.end_offset_of(try_block.last);
					if self.handlers[j].handler_block() == handler_block
						&& contains
						&& try_block.last == other_try.last
					{
						self.handlers.remove(j);
						continue 'restart;
					}
				}
			}
			break;
		}
	}

	/// An exit branch, throw, or typed return wedged between the try and its
	/// first handler belongs to the try.
	fn extend_try_past_trailing_exit(&mut self) {
		for i in 0..self.handlers.len() {
			let try_block = self.handlers[i].try_block();
			let Some(first_handler) = self.find_first_handler(try_block) else { continue };
			let first_in_handler = self.handlers[first_handler].handler_block().first;
			let first_after_try = self.body.instructions.next_index(try_block.last);
			let last_before_handler = self.body.instructions.previous_index(first_in_handler);

			let (Some(first_after_try), Some(last_before_handler)) = (first_after_try, last_before_handler) else {
				continue;
			};
			if first_after_try == first_in_handler {
				continue;
			}

			let op = self.op_of(last_before_handler);
			let flow = op.flow_control();
			let mut new_try_block = None;

			if flow == FlowControl::Branch || (flow == FlowControl::Return && op == OpCode::Return) {
				if last_before_handler == first_after_try {
					new_try_block = Some(ExceptionBlock::new(try_block.first, last_before_handler));
				}
			} else if flow == FlowControl::Throw || (flow == FlowControl::Return && op != OpCode::Return) {
				if self.body.instructions.previous_index(last_before_handler) == Some(first_after_try) {
					new_try_block = Some(ExceptionBlock::new(try_block.first, last_before_handler));
				}
			}

			if let Some(new_try_block) = new_try_block {
				for sibling in self.find_handlers(try_block) {
					self.handlers[sibling] = self.handlers[sibling].with_try_block(new_try_block);
				}
			}
		}
	}

	/// A nested finally that merely re-enters an outer catch is the
	/// compiler's duplicate of that catch; drop it.
	fn remove_finally_duplicating_outer_catch(&mut self) {
		'restart: loop {
			for i in 0..self.handlers.len() {
				if !self.handlers[i].is_finally() {
					continue;
				}
				let try_block = self.handlers[i].try_block();
				let handler_block = self.handlers[i].handler_block();

				let innermost = self.find_innermost_handler(self.offset_of(try_block.first), i);
				let Some(innermost) = innermost else { continue };
				if innermost == i || self.handlers[innermost].is_finally() {
					continue;
				}

				for j in 0..self.handlers.len() {
					if j == i || j == innermost {
						continue;
					}
					if self.handlers[j].try_block() == handler_block
						&& self.handlers[j].handler_block() == self.handlers[innermost].handler_block()
					{
						self.handlers.remove(j);
						continue 'restart;
					}
				}
			}
			break;
		}
	}

	// ------------------------------------------------------------------
	// Stack analysis
	// ------------------------------------------------------------------

	fn slot_count(&self) -> usize {
		let parameter_slots = self
			.body
			.all_parameters()
			.map(|p| p.slot as usize + p.parameter_type.slot_width())
			.max()
			.unwrap_or(0);
		(self.body.max_locals as usize).max(parameter_slots)
	}

	fn initial_variable_state(&self) -> Vec<VariableSlot> {
		let mut state = vec![VariableSlot::unknown(); self.slot_count()];

		if self.body.has_this() {
			state[0] = VariableSlot {
				value: if self.body.is_constructor {
					FrameValue::UninitializedThis
				} else {
					FrameValue::Reference(self.context.current_type.clone())
				},
				definitions: Vec::new(),
			};
		}

		for parameter in &self.body.parameters {
			let slot = parameter.slot as usize;
			state[slot] = VariableSlot {
				value: FrameValue::from_type(&parameter.parameter_type),
				definitions: Vec::new(),
			};
			if parameter.parameter_type.is_double_word() {
				state[slot + 1] = VariableSlot { value: FrameValue::Top, definitions: Vec::new() };
			}
		}

		state
	}

	fn frame_before(&self, bc: usize) -> Frame {
		let record = &self.bytecodes[bc];
		Frame {
			locals: record
				.variables_before
				.as_ref()
				.map(|v| v.iter().map(|s| s.value.clone()).collect())
				.unwrap_or_default(),
			stack: record
				.stack_before
				.as_ref()
				.map(|v| v.iter().map(|s| s.value.clone()).collect())
				.unwrap_or_default(),
		}
	}

	fn perform_stack_analysis(&mut self, cfg: &ControlFlowGraph) -> Result<()> {
		// One record per decoded instruction, in stream order, so the record
		// index doubles as the position.
		for index in self.body.instructions.real_indices() {
			let insn = self.body.instructions.get(index);
			let (code, operand, second_operand) = self.lower_instruction(index)?;
			let bc = self.bytecodes.len();
			self.bytecodes.push(ByteCode {
				instruction: Some(index),
				offset: insn.offset,
				end_offset: insn.end_offset,
				code,
				operand,
				second_operand,
				pop_count: frames::pop_delta(insn),
				push_count: frames::push_delta(insn),
				label: None,
				stack_before: None,
				variables_before: None,
				store_to: Vec::new(),
			});
			self.bc_of_insn.insert(index, bc);
			self.order.push(bc);
		}
		let real_count = self.order.len();

		let unknown_variables = self.initial_variable_state();
		let mut agenda: Vec<usize> = Vec::new();

		for h in 0..self.handlers.len() {
			let handler_first = self.handlers[h].handler_block().first;
			let catch_type = self.handlers[h]
				.catch_type()
				.cloned()
				.unwrap_or_else(TypeReference::throwable);
			let Some(&handler_start) = self.bc_of_insn.get(&handler_first) else { continue };

			let load_exception = self.bytecodes.len();
			self.bytecodes.push(ByteCode {
				instruction: None,
				offset: self.bytecodes[handler_start].offset,
				end_offset: self.bytecodes[handler_start].offset,
				code: AstCode::LoadException,
				operand: AstOperand::Type(catch_type.clone()),
				second_operand: None,
				pop_count: Some(0),
				push_count: 1,
				label: None,
				stack_before: None,
				variables_before: None,
				store_to: Vec::new(),
			});
			self.load_exceptions.insert(h, load_exception);

			self.bytecodes[handler_start].stack_before = Some(vec![StackSlot::new(
				FrameValue::Reference(catch_type),
				vec![load_exception],
			)]);
			self.bytecodes[handler_start].variables_before = Some(unknown_variables.clone());
			agenda.push(handler_start);
		}

		self.bytecodes[0].stack_before = Some(Vec::new());
		self.bytecodes[0].variables_before = Some(unknown_variables);
		agenda.push(0);

		let mut visitor = StackMappingVisitor::new(self.slot_count());
		let mut steps = 0u32;

		while let Some(bc) = agenda.pop() {
			steps += 1;
			let instruction = self.bytecodes[bc].instruction.expect("worklist holds real records");
			let offset = self.bytecodes[bc].offset;

			visitor.set_frame(self.frame_before(bc));
			visitor.execute(instruction, self.body)?;

			let new_stack = self.create_modified_stack(bc, &visitor);

			let mut new_variables = self.bytecodes[bc].variables_before.clone().expect("reached record has state");
			for slot in new_variables.iter_mut() {
				if let FrameValue::Uninitialized(Some(site)) = slot.value {
					if let Some(initialized) = visitor.initializations().get(&site) {
						slot.value = FrameValue::Reference(initialized.clone());
					}
				}
			}
			if self.bytecodes[bc].is_variable_definition() {
				if let AstOperand::VariableDef(definition) = &self.bytecodes[bc].operand {
					let slot = self.body.variables.get(*definition).slot as usize;
					if slot < new_variables.len() {
						new_variables[slot] = VariableSlot {
							value: visitor.local_value(slot),
							definitions: vec![bc],
						};
					}
				}
			}

			// Fall through inside a block; fan out over the graph at its end.
			let node = cfg
				.node_containing(instruction)
				.ok_or_else(|| anyhow!("no flow node for instruction at offset {offset}"))?;
			let mut branch_targets = Vec::new();

			if cfg.node(node).last != Some(instruction) {
				if bc + 1 < real_count {
					branch_targets.push(bc + 1);
				}
			} else {
				for successor in cfg.successors(node) {
					if cfg.node(successor).kind != NodeKind::Normal {
						continue;
					}
					let target_instruction = cfg.node(successor).first.expect("normal node");
					let target = self.bc_of_insn[&target_instruction];
					if self.bytecodes[target].label.is_none() {
						self.bytecodes[target].label = Some(label_name(self.bytecodes[target].offset));
					}
					branch_targets.push(target);
				}
			}

			for target in branch_targets {
				let target_offset = self.bytecodes[target].offset;
				if self.bytecodes[target].stack_before.is_none() {
					// Never share slot vectors between records; merges mutate
					// them in place.
					self.bytecodes[target].stack_before = Some(new_stack.clone());
					self.bytecodes[target].variables_before = Some(new_variables.clone());
					agenda.push(target);
					continue;
				}

				let existing_len = self.bytecodes[target].stack_before.as_ref().unwrap().len();
				if existing_len != new_stack.len() {
					bail!(CodeError::InconsistentStackSize {
						offset: target_offset,
						from: offset,
						expected: existing_len,
						actual: new_stack.len(),
					});
				}

				let mut modified = false;

				{
					let target_stack = self.bytecodes[target].stack_before.as_mut().unwrap();
					for (i, incoming) in new_stack.iter().enumerate() {
						if let Some(union) = union_definitions(&target_stack[i].definitions, &incoming.definitions) {
							target_stack[i] = StackSlot::new(incoming.value.clone(), union);
							modified = true;
						}
					}
				}
				{
					let target_variables = self.bytecodes[target].variables_before.as_mut().unwrap();
					for (i, incoming) in new_variables.iter().enumerate() {
						let old = &target_variables[i];
						if old.is_uninitialized() {
							continue;
						}
						if incoming.is_uninitialized() {
							target_variables[i] = incoming.clone();
							modified = true;
						} else if let Some(union) = union_definitions(&old.definitions, &incoming.definitions) {
							target_variables[i] = VariableSlot { value: old.value.clone(), definitions: union };
							modified = true;
						}
					}
				}

				if modified {
					agenda.push(target);
				}
			}
		}
		trace!("stack analysis fixed point after {steps} steps");

		// Unreachable records drop out of the body; their arena entries stay
		// so definition sets remain valid.
		self.order.retain(|&bc| self.bytecodes[bc].stack_before.is_some());

		self.introduce_stack_temporaries();
		self.coalesce_duplicated_temporaries();
		self.convert_local_variables();
		self.convert_branch_operands();

		Ok(())
	}

	fn create_modified_stack(&self, bc: usize, visitor: &StackMappingVisitor) -> Vec<StackSlot> {
		let record = &self.bytecodes[bc];
		let mut stack = record.stack_before.clone().expect("reached record has state");

		for slot in stack.iter_mut() {
			if let FrameValue::Uninitialized(Some(site)) = slot.value {
				if let Some(initialized) = visitor.initializations().get(&site) {
					slot.value = FrameValue::Reference(initialized.clone());
				}
			}
		}

		if record.pop_count == Some(0) && record.push_count == 0 {
			return stack;
		}

		let len = stack.len();
		match record.code {
			AstCode::Dup => {
				stack.push(StackSlot::new(visitor.stack_value(0), stack[len - 1].definitions.clone()));
				stack
			},
			AstCode::DupX1 => {
				let slot = StackSlot::new(visitor.stack_value(0), stack[len - 1].definitions.clone());
				stack.insert(len - 2, slot);
				stack
			},
			AstCode::DupX2 => {
				let slot = StackSlot::new(visitor.stack_value(0), stack[len - 1].definitions.clone());
				stack.insert(len - 3, slot);
				stack
			},
			AstCode::Dup2 => {
				let lower = StackSlot::new(visitor.stack_value(1), stack[len - 2].definitions.clone());
				let upper = StackSlot::new(visitor.stack_value(0), stack[len - 1].definitions.clone());
				stack.push(lower);
				stack.push(upper);
				stack
			},
			AstCode::Dup2X1 => {
				let lower = StackSlot::new(visitor.stack_value(1), stack[len - 2].definitions.clone());
				let upper = StackSlot::new(visitor.stack_value(0), stack[len - 1].definitions.clone());
				stack.insert(len - 3, lower);
				stack.insert(len - 2, upper);
				stack
			},
			AstCode::Dup2X2 => {
				let lower = StackSlot::new(visitor.stack_value(1), stack[len - 2].definitions.clone());
				let upper = StackSlot::new(visitor.stack_value(0), stack[len - 1].definitions.clone());
				stack.insert(len - 4, lower);
				stack.insert(len - 3, upper);
				stack
			},
			AstCode::Swap => {
				stack.swap(len - 1, len - 2);
				stack
			},
			_ => {
				let pop = record.pop_count.map(|p| p as usize).unwrap_or(len);
				stack.truncate(len - pop);
				for i in 0..record.push_count as usize {
					let value = visitor.stack_value(record.push_count as usize - 1 - i);
					stack.push(StackSlot::new(value, vec![bc]));
				}
				stack
			},
		}
	}

	fn type_of_frame_value(&self, value: &FrameValue) -> Option<TypeReference> {
		match value {
			FrameValue::Integer => Some(TypeReference::Primitive(PrimitiveKind::Int)),
			FrameValue::Float => Some(TypeReference::Primitive(PrimitiveKind::Float)),
			FrameValue::Long => Some(TypeReference::Primitive(PrimitiveKind::Long)),
			FrameValue::Double => Some(TypeReference::Primitive(PrimitiveKind::Double)),
			FrameValue::Reference(t) => Some(t.clone()),
			FrameValue::UninitializedThis => Some(self.context.current_type.clone()),
			FrameValue::Uninitialized(Some(site)) => match &self.body.instructions.get(*site).operand {
				Operand::Type(t) => Some(t.clone()),
				_ => None,
			},
			_ => None,
		}
	}

	/// Every popped slot gets a fresh temporary; every producer of that slot
	/// learns it must store into it.
	fn introduce_stack_temporaries(&mut self) {
		for position in 0..self.order.len() {
			let bc = self.order[position];
			let len = self.bytecodes[bc].stack_before.as_ref().unwrap().len();
			let pop = self.bytecodes[bc].pop_count.map(|p| p as usize).unwrap_or(len);
			let offset = self.bytecodes[bc].offset;

			for (argument, i) in (len - pop..len).enumerate() {
				let (value, definitions) = {
					let slot = &self.bytecodes[bc].stack_before.as_ref().unwrap()[i];
					(slot.value.clone(), slot.definitions.clone())
				};
				let variable_type = self.type_of_frame_value(&value);
				let temporary = self.generated_variable(format!("stack_{offset:02X}_{argument}"), variable_type);

				self.bytecodes[bc].stack_before.as_mut().unwrap()[i].load_from = Some(temporary);
				for producer in definitions {
					self.bytecodes[producer].store_to.push(temporary);
				}
			}
		}
	}

	/// A record storing into several temporaries that are each loaded exactly
	/// once, all from this record alone, really produced one value; fold the
	/// temporaries into a single `expr` variable. This is what erases `dup`.
	fn coalesce_duplicated_temporaries(&mut self) {
		for position in 0..self.order.len() {
			let bc = self.order[position];
			if self.bytecodes[bc].store_to.len() <= 1 {
				continue;
			}
			let locals = self.bytecodes[bc].store_to.clone();

			let mut loaded_by: Vec<(usize, usize)> = Vec::new();
			for &local in &locals {
				'search: for &consumer in &self.order {
					let stack = self.bytecodes[consumer].stack_before.as_ref().unwrap();
					for (i, slot) in stack.iter().enumerate() {
						if slot.load_from == Some(local) {
							loaded_by.push((consumer, i));
							break 'search;
						}
					}
				}
			}
			if loaded_by.is_empty() {
				continue;
			}

			let mut single_store = true;
			let mut variable_type = None;
			for &(consumer, i) in &loaded_by {
				let slot = &self.bytecodes[consumer].stack_before.as_ref().unwrap()[i];
				if slot.definitions.len() != 1 || slot.definitions[0] != bc {
					single_store = false;
					break;
				}
				if variable_type.is_none() {
					variable_type = self.type_of_frame_value(&slot.value);
				}
			}
			if !single_store {
				continue;
			}

			let offset = self.bytecodes[bc].offset;
			let merged = self.generated_variable(format!("expr_{offset:02X}"), variable_type);
			self.bytecodes[bc].store_to = vec![merged];

			for &consumer in &self.order {
				let stack = self.bytecodes[consumer].stack_before.as_mut().unwrap();
				for slot in stack.iter_mut() {
					if slot.load_from.is_some_and(|v| locals.contains(&v)) {
						slot.load_from = Some(merged);
					}
				}
			}
		}
	}

	// ------------------------------------------------------------------
	// Local variable splitting
	// ------------------------------------------------------------------

	fn stored_value(&self, bc: usize) -> Option<FrameValue> {
		let record = &self.bytecodes[bc];
		if record.code == AstCode::Inc {
			return Some(FrameValue::Integer);
		}
		let stack = record.stack_before.as_ref()?;
		let pop = record.pop_count.map(|p| p as usize).unwrap_or(stack.len());
		stack.get(stack.len() - pop).map(|s| s.value.clone())
	}

	fn inferred_definition_type(&self, definitions: &[usize], fallback: &Option<TypeReference>) -> Option<TypeReference> {
		for &bc in definitions {
			let Some(value) = self.stored_value(bc) else { continue };
			match value {
				FrameValue::Null | FrameValue::Uninitialized(None) => continue,
				FrameValue::Uninitialized(Some(site)) => {
					if let Operand::Type(t) = &self.body.instructions.get(site).operand {
						return Some(t.clone());
					}
					return fallback.clone();
				},
				other => {
					if let Some(t) = self.type_of_frame_value(&other) {
						return Some(t);
					}
					return fallback.clone();
				},
			}
		}
		None
	}

	/// Splits declared slots into AST variables, one per reaching-definition
	/// group when optimizing, one per slot otherwise.
	fn convert_local_variables(&mut self) {
		let mut parameter_by_slot: HashMap<u16, (String, TypeReference)> = HashMap::new();
		for parameter in self.body.all_parameters() {
			parameter_by_slot.insert(
				parameter.slot,
				(parameter.name.clone(), parameter.parameter_type.clone()),
			);
		}

		let definitions_indices: Vec<usize> = self.body.variables.live_indices().collect();
		for definition_index in definitions_indices {
			let mut definitions = Vec::new();
			let mut references = Vec::new();

			for &bc in &self.order {
				if self.bytecodes[bc].operand != AstOperand::VariableDef(definition_index) {
					continue;
				}
				if self.bytecodes[bc].is_variable_definition() {
					definitions.push(bc);
				} else {
					references.push(bc);
				}
			}
			if definitions.is_empty() && references.is_empty() {
				continue;
			}

			let declared = self.body.variables.get(definition_index).clone();
			let slot = declared.slot;

			let from_unknown_definition = self.context.optimize
				&& references.iter().any(|&bc| {
					self.bytecodes[bc]
						.variables_before
						.as_ref()
						.map_or(false, |v| v.get(slot as usize).map_or(false, VariableSlot::is_uninitialized))
				});

			struct VariableInfo {
				variable: VarId,
				definitions: Vec<usize>,
				references: Vec<usize>,
			}

			let mut infos: Vec<VariableInfo> = Vec::new();

			if let (Some((name, parameter_type)), 0) = (parameter_by_slot.get(&slot), declared.scope_start) {
				let variable = self.new_variable(Variable {
					name: name.clone(),
					variable_type: Some(parameter_type.clone()),
					generated: false,
					original_parameter_slot: Some(slot),
					original_variable: None,
				});
				infos.push(VariableInfo { variable, definitions, references });
			} else if !self.context.optimize || from_unknown_definition {
				let name = declared.name.clone().unwrap_or_else(|| format!("var_{slot}"));
				let variable_type = if declared.from_metadata {
					declared.variable_type.clone()
				} else {
					self.inferred_definition_type(&definitions, &declared.variable_type)
						.or_else(|| Some(TypeReference::object("java/lang/Object")))
				};
				let variable = self.new_variable(Variable {
					name,
					variable_type,
					generated: false,
					original_parameter_slot: None,
					original_variable: Some(definition_index),
				});
				infos.push(VariableInfo { variable, definitions, references });
			} else {
				let base = declared.name.clone().unwrap_or_else(|| format!("var_{slot}"));

				for &bc in &definitions {
					let variable_type = if declared.from_metadata {
						declared.variable_type.clone()
					} else {
						self.inferred_definition_type(&[bc], &declared.variable_type)
					};
					let variable = self.new_variable(Variable {
						name: format!("{base}_{:02X}", self.bytecodes[bc].offset),
						variable_type,
						generated: false,
						original_parameter_slot: None,
						original_variable: Some(definition_index),
					});
					infos.push(VariableInfo { variable, definitions: vec![bc], references: Vec::new() });
				}

				for &reference in &references {
					let reaching: Vec<usize> = self.bytecodes[reference]
						.variables_before
						.as_ref()
						.and_then(|v| v.get(slot as usize).map(|s| s.definitions.clone()))
						.unwrap_or_default();

					if reaching.len() == 1 {
						if let Some(info) = infos.iter_mut().find(|info| info.definitions.contains(&reaching[0])) {
							info.references.push(reference);
						}
					} else {
						let (merging, kept): (Vec<VariableInfo>, Vec<VariableInfo>) = infos
							.drain(..)
							.partition(|info| info.definitions.iter().any(|d| reaching.contains(d)));
						infos = kept;
						if merging.is_empty() {
							// A use with no visible store; pin it to the
							// first definition group if one exists.
							if let Some(info) = infos.first_mut() {
								info.references.push(reference);
							}
							continue;
						}
						let mut merged = VariableInfo {
							variable: merging[0].variable,
							definitions: Vec::new(),
							references: Vec::new(),
						};
						for info in merging {
							merged.definitions.extend(info.definitions);
							merged.references.extend(info.references);
						}
						merged.references.push(reference);
						infos.push(merged);
					}
				}
			}

			for info in &infos {
				for &bc in info.definitions.iter().chain(info.references.iter()) {
					self.bytecodes[bc].operand = AstOperand::Variable(info.variable);
				}
			}
		}
	}

	/// Branch and switch operands become label names now that every target
	/// record knows whether it is labeled.
	fn convert_branch_operands(&mut self) {
		for position in 0..self.order.len() {
			let bc = self.order[position];
			let Some(instruction) = self.bytecodes[bc].instruction else { continue };
			match &self.body.instructions.get(instruction).operand {
				Operand::Branch(target) => {
					let label = self.label_for_target(*target);
					self.bytecodes[bc].operand = AstOperand::Label(label);
				},
				Operand::Switch(switch) => {
					let labels = self.switch_labels(switch);
					self.bytecodes[bc].operand = AstOperand::Labels(labels);
				},
				_ => {},
			}
		}
	}

	fn label_for_target(&self, target: usize) -> String {
		if let Some(&bc) = self.bc_of_insn.get(&target) {
			if let Some(label) = &self.bytecodes[bc].label {
				return label.clone();
			}
		}
		label_name(self.body.instructions.get(target).offset)
	}

	fn switch_labels(&self, switch: &SwitchInfo) -> Vec<String> {
		let mut labels = Vec::with_capacity(switch.targets.len() + 1);
		labels.push(self.label_for_target(switch.default_target));
		for &target in &switch.targets {
			labels.push(self.label_for_target(target));
		}
		labels
	}

	// ------------------------------------------------------------------
	// Instruction lowering
	// ------------------------------------------------------------------

	/// Normalizes one instruction to its expression code and operand:
	/// constants become `LdC`, the load/store families collapse onto their
	/// variables, everything else maps across one to one.
	fn lower_instruction(&self, index: usize) -> Result<(AstCode, AstOperand, Option<i32>)> {
		use OpCode::*;

		let insn = self.body.instructions.get(index);
		let constant = |loadable: Loadable| (AstCode::LdC, AstOperand::Constant(loadable), None);

		let variable_operand = |effective: u32| -> Result<AstOperand> {
			Ok(match &insn.operand {
				Operand::Local(v) | Operand::LocalImmediate(v, _) => AstOperand::VariableDef(*v),
				Operand::Error(message) => AstOperand::Error(message.clone()),
				Operand::None => {
					let slot = insn.op.macro_slot().expect("macro load/store");
					// A store ending exactly at the code size misses its own
					// half-open scope; its start offset still hits.
					let v = self
						.body
						.variables
						.try_find(slot, effective)
						.or_else(|| self.body.variables.try_find(slot, insn.offset))
						.with_context(|| anyhow!("no variable for slot {slot} at offset {}", insn.offset))?;
					AstOperand::VariableDef(v)
				},
				other => bail!("unexpected operand {other:?} at offset {}", insn.offset),
			})
		};

		Ok(match insn.op {
			Nop => (AstCode::Nop, AstOperand::None, None),
			AConstNull => (AstCode::AConstNull, AstOperand::None, None),
			IConstM1 => constant(Loadable::Integer(-1)),
			IConst0 => constant(Loadable::Integer(0)),
			IConst1 => constant(Loadable::Integer(1)),
			IConst2 => constant(Loadable::Integer(2)),
			IConst3 => constant(Loadable::Integer(3)),
			IConst4 => constant(Loadable::Integer(4)),
			IConst5 => constant(Loadable::Integer(5)),
			LConst0 => constant(Loadable::Long(0)),
			LConst1 => constant(Loadable::Long(1)),
			FConst0 => constant(Loadable::Float(0.0)),
			FConst1 => constant(Loadable::Float(1.0)),
			FConst2 => constant(Loadable::Float(2.0)),
			DConst0 => constant(Loadable::Double(0.0)),
			DConst1 => constant(Loadable::Double(1.0)),
			BiPush | SiPush => match insn.operand {
				Operand::Immediate(value) => constant(Loadable::Integer(value as i32)),
				_ => bail!("push instruction without immediate at offset {}", insn.offset),
			},
			Ldc | LdcW | Ldc2W => match &insn.operand {
				Operand::Constant(loadable) => (AstCode::LdC, AstOperand::Constant(loadable.clone()), None),
				other => bail!("ldc without constant operand at offset {}: {other:?}", insn.offset),
			},

			op if op.is_load() => (AstCode::Load, variable_operand(insn.offset)?, None),
			op if op.is_store() => (AstCode::Store, variable_operand(insn.end_offset)?, None),

			IInc => {
				let immediate = match insn.operand {
					Operand::LocalImmediate(_, immediate) => immediate,
					_ => 0,
				};
				(AstCode::Inc, variable_operand(insn.offset)?, Some(immediate))
			},
			Ret => (AstCode::Ret, variable_operand(insn.offset)?, None),

			Goto | GotoW => (AstCode::Goto, AstOperand::None, None),
			Jsr | JsrW => (AstCode::Jsr, AstOperand::None, None),
			IfEq => (AstCode::IfEq, AstOperand::None, None),
			IfNe => (AstCode::IfNe, AstOperand::None, None),
			IfLt => (AstCode::IfLt, AstOperand::None, None),
			IfGe => (AstCode::IfGe, AstOperand::None, None),
			IfGt => (AstCode::IfGt, AstOperand::None, None),
			IfLe => (AstCode::IfLe, AstOperand::None, None),
			IfICmpEq => (AstCode::IfICmpEq, AstOperand::None, None),
			IfICmpNe => (AstCode::IfICmpNe, AstOperand::None, None),
			IfICmpLt => (AstCode::IfICmpLt, AstOperand::None, None),
			IfICmpGe => (AstCode::IfICmpGe, AstOperand::None, None),
			IfICmpGt => (AstCode::IfICmpGt, AstOperand::None, None),
			IfICmpLe => (AstCode::IfICmpLe, AstOperand::None, None),
			IfACmpEq => (AstCode::IfACmpEq, AstOperand::None, None),
			IfACmpNe => (AstCode::IfACmpNe, AstOperand::None, None),
			IfNull => (AstCode::IfNull, AstOperand::None, None),
			IfNonNull => (AstCode::IfNonNull, AstOperand::None, None),
			TableSwitch => (AstCode::TableSwitch, AstOperand::None, None),
			LookupSwitch => (AstCode::LookupSwitch, AstOperand::None, None),

			GetStatic | PutStatic | GetField | PutField => {
				let operand = match &insn.operand {
					Operand::Field(field) => AstOperand::Field(field.clone()),
					other => bail!("field instruction without field operand at offset {}: {other:?}", insn.offset),
				};
				let code = match insn.op {
					GetStatic => AstCode::GetStatic,
					PutStatic => AstCode::PutStatic,
					GetField => AstCode::GetField,
					_ => AstCode::PutField,
				};
				(code, operand, None)
			},
			InvokeVirtual | InvokeSpecial | InvokeStatic | InvokeInterface => {
				let operand = match &insn.operand {
					Operand::Method(method) => AstOperand::Method(method.clone()),
					other => bail!("invoke without method operand at offset {}: {other:?}", insn.offset),
				};
				let code = match insn.op {
					InvokeVirtual => AstCode::InvokeVirtual,
					InvokeSpecial => AstCode::InvokeSpecial,
					InvokeStatic => AstCode::InvokeStatic,
					_ => AstCode::InvokeInterface,
				};
				(code, operand, None)
			},
			InvokeDynamic => match &insn.operand {
				Operand::CallSite(call_site) => {
					(AstCode::InvokeDynamic, AstOperand::CallSite(call_site.clone()), None)
				},
				other => bail!("invokedynamic without call site at offset {}: {other:?}", insn.offset),
			},

			New | ANewArray | CheckCast | InstanceOf => {
				let operand = match &insn.operand {
					Operand::Type(t) => AstOperand::Type(t.clone()),
					other => bail!("type instruction without type operand at offset {}: {other:?}", insn.offset),
				};
				let code = match insn.op {
					New => AstCode::New,
					ANewArray => AstCode::ANewArray,
					CheckCast => AstCode::CheckCast,
					_ => AstCode::InstanceOf,
				};
				(code, operand, None)
			},
			NewArray => match insn.operand {
				Operand::PrimitiveType(kind) => (AstCode::NewArray, AstOperand::PrimitiveType(kind), None),
				_ => bail!("newarray without element type at offset {}", insn.offset),
			},
			MultiANewArray => match &insn.operand {
				Operand::TypeU1(t, _) => (AstCode::MultiANewArray, AstOperand::Type(t.clone()), None),
				other => bail!("multianewarray without type operand at offset {}: {other:?}", insn.offset),
			},

			other => (passthrough_code(other), AstOperand::None, None),
		})
	}

	// ------------------------------------------------------------------
	// Assembly
	// ------------------------------------------------------------------

	fn position_at_or_after(&self, offset: u32) -> usize {
		self.order
			.iter()
			.position(|&bc| self.bytecodes[bc].offset >= offset)
			.unwrap_or(self.order.len())
	}

	fn convert_to_ast(
		&mut self,
		active: &mut IndexSet<usize>,
		start_index: usize,
		end_index: &mut usize,
	) -> Result<Vec<Node>> {
		let mut ast = Vec::new();
		let mut tail_start = start_index;

		while !active.is_empty() {
			let head_start = tail_start;
			if head_start >= self.order.len() {
				break;
			}
			let min_try_start = self.bytecodes[self.order[head_start]].offset;

			// The earliest, widest try range still active.
			let mut try_start = u32::MAX;
			for &h in active.iter() {
				let start = self.offset_of(self.handlers[h].try_block().first);
				if start < try_start && start >= min_try_start {
					try_start = start;
				}
			}
			if try_start == u32::MAX {
				break;
			}

			let mut try_end: i64 = -1;
			for &h in active.iter() {
				let handler = &self.handlers[h];
				if self.offset_of(handler.try_block().first) != try_start {
					continue;
				}
				let end = self.end_offset_of(handler.try_block().last) as i64;
				if end > try_end {
					try_end = end;
				}
			}
			let try_end = try_end as u32;

			let group: Vec<usize> = active
				.iter()
				.copied()
				.filter(|&h| {
					let handler = &self.handlers[h];
					self.offset_of(handler.try_block().first) == try_start
						&& self.end_offset_of(handler.try_block().last) == try_end
				})
				.collect();

			// Linear prefix up to the try entry.
			let try_start_index = self.position_at_or_after(try_start);
			if head_start < try_start_index {
				let prefix: Vec<usize> = self.order[head_start..try_start_index].to_vec();
				ast.extend(self.convert_linear(&prefix));
			}

			// The try block, with strictly nested handlers recursed into.
			let mut nested: IndexSet<usize> = active
				.iter()
				.copied()
				.filter(|&h| {
					let handler = &self.handlers[h];
					let ts = self.offset_of(handler.try_block().first);
					let te = self.end_offset_of(handler.try_block().last);
					(try_start < ts && te <= try_end) || (try_start <= ts && te < try_end)
				})
				.collect();
			active.retain(|h| !nested.contains(h));

			let try_end_index = self.position_at_or_after(try_end);
			let mut nested_end = try_end_index;
			let mut try_ast = self.convert_to_ast(&mut nested, try_start_index, &mut nested_end)?;
			if nested_end > tail_start {
				tail_start = nested_end;
			}
			if try_ast.last().is_some_and(|last| !last.is_unconditional_control_flow()) {
				try_ast.push(Node::Expression(Expression::new(AstCode::Leave, AstOperand::None)));
			}
			let try_block = Block { body: try_ast };
			tail_start = tail_start.max(try_end_index);

			let mut catch_blocks: Vec<CatchBlock> = Vec::new();
			let mut finally_block: Option<Block> = None;

			'handler_loop: for &h in &group {
				let handler = self.handlers[h].clone();
				let handler_start = self.offset_of(handler.handler_block().first);
				let handler_end = self.end_offset_of(handler.handler_block().last);

				let handlers_start_index = self.position_at_or_after(handler_start);
				let mut handlers_end_index = handlers_start_index;
				while handlers_end_index < self.order.len()
					&& self.bytecodes[self.order[handlers_end_index]].offset < handler_end
				{
					handlers_end_index += 1;
				}
				tail_start = tail_start.max(handlers_end_index);

				// Several table entries can share one handler body; fold them
				// into a multi-catch instead of emitting the body twice.
				if let Some(catch_type) = handler.catch_type() {
					let mut aliased = false;
					for catch_block in catch_blocks.iter_mut() {
						let first_ranged = catch_block
							.block
							.expressions()
							.into_iter()
							.find(|e| !e.ranges.is_empty())
							.map(|e| e.ranges[0].start);
						if first_ranged == Some(handler_start) {
							catch_block.caught_types.push(catch_type.clone());
							catch_block.exception_type =
								self.scope.common_super_type(&catch_block.exception_type, catch_type);
							aliased = true;
							break;
						}
					}
					if aliased {
						continue 'handler_loop;
					}
				}

				// Handlers nested inside this handler's range recurse with it.
				let mut nested: IndexSet<usize> = IndexSet::new();
				for &e in active.iter() {
					if e == h {
						continue;
					}
					let other = &self.handlers[e];
					let ts = self.offset_of(other.try_block().first);
					let te = self.offset_of(other.try_block().last);
					if ts == try_start && te == try_end {
						continue;
					}
					if handler_start <= ts && te < handler_end {
						nested.insert(e);
						let nested_last = other.handler_block().last;
						if let Some(position) = self
							.order
							.iter()
							.position(|&bc| self.bytecodes[bc].instruction == Some(nested_last))
						{
							handlers_end_index = handlers_end_index.max(position);
						}
					}
				}
				tail_start = tail_start.max(handlers_end_index);
				active.retain(|e| !nested.contains(e));

				let mut handler_tail = handlers_end_index;
				let mut handler_ast = self.convert_to_ast(&mut nested, handlers_start_index, &mut handler_tail)?;
				if handler_tail > tail_start {
					tail_start = handler_tail;
				}
				if handler_ast.last().is_some_and(|last| !last.is_unconditional_control_flow()) {
					handler_ast.push(Node::Expression(Expression::new(AstCode::Leave, AstOperand::None)));
				}

				let load_exception = self.load_exceptions.get(&h).copied();

				if let Some(catch_type) = handler.catch_type() {
					let mut catch_block = CatchBlock {
						exception_type: catch_type.clone(),
						caught_types: vec![catch_type.clone()],
						exception_variable: None,
						block: Block { body: handler_ast },
					};
					self.bind_catch_exception_variable(&mut catch_block, load_exception, handler_start);
					catch_blocks.push(catch_block);
				} else {
					let mut block = Block { body: handler_ast };
					let exception_temporary =
						self.generated_variable(format!("ex_{handler_start:02X}"), Some(TypeReference::throwable()));

					let store_to = load_exception
						.map(|le| self.bytecodes[le].store_to.clone())
						.unwrap_or_default();
					if store_to.is_empty() {
						// The handler's own leading store, if any, reads the
						// shared temporary instead.
						if let Some(first) = first_expression_mut(&mut block.body) {
							if first.code == AstCode::Store && !first.arguments.is_empty() {
								first.arguments[0] = Expression::load(exception_temporary);
							}
						}
					} else {
						for &variable in &store_to {
							block.body.insert(
								0,
								Node::Expression(Expression::store(variable, Expression::load(exception_temporary))),
							);
						}
					}
					block.body.insert(
						0,
						Node::Expression(Expression::with_arguments(
							AstCode::Store,
							AstOperand::Variable(exception_temporary),
							vec![Expression::new(
								AstCode::LoadException,
								AstOperand::Type(TypeReference::throwable()),
							)],
						)),
					);
					finally_block = Some(block);
				}
			}

			active.retain(|h| !group.contains(h));

			// Handlers that handled themselves leave nothing behind; drop the
			// empty scope.
			let has_try_content = !try_block.expressions().is_empty();
			let has_handler_content = if let Some(last_catch) = catch_blocks.last() {
				!last_catch.block.expressions().is_empty()
			} else if let Some(finally) = &finally_block {
				!finally.expressions().is_empty()
			} else {
				false
			};
			if !has_try_content && !has_handler_content {
				continue;
			}

			ast.push(Node::TryCatch(TryCatchBlock { try_block, catch_blocks, finally_block }));
		}

		if tail_start < *end_index {
			let tail: Vec<usize> = self.order[tail_start..*end_index].to_vec();
			ast.extend(self.convert_linear(&tail));
		} else {
			*end_index = tail_start;
		}

		Ok(ast)
	}

	/// Applies the exception-variable rules to a fresh catch block: nothing
	/// bound when the exception is unused, the handler's own local when it
	/// stores the exception straight away, a generated variable otherwise.
	fn bind_catch_exception_variable(
		&mut self,
		catch_block: &mut CatchBlock,
		load_exception: Option<usize>,
		handler_start: u32,
	) {
		let store_to = load_exception
			.map(|le| self.bytecodes[le].store_to.clone())
			.unwrap_or_default();

		match store_to.len() {
			0 => catch_block.exception_variable = None,
			1 => {
				let temporary = store_to[0];
				let pops_it_away = match catch_block.block.body.first() {
					Some(Node::Expression(first)) if first.code == AstCode::Pop => first
						.arguments
						.first()
						.is_some_and(|a| a.code == AstCode::Load && a.operand == AstOperand::Variable(temporary)),
					_ => false,
				};
				if pops_it_away {
					catch_block.exception_variable =
						if self.context.settings.always_generate_exception_variable_for_catch_blocks {
							Some(self.generated_variable(format!("ex_{handler_start:02X}"), None))
						} else {
							None
						};
				} else {
					catch_block.exception_variable = Some(temporary);
					self.simplify_catch_entry(catch_block, temporary);
				}
			},
			_ => {
				let temporary = self.generated_variable(format!("ex_{handler_start:02X}"), None);
				catch_block.exception_variable = Some(temporary);
				for &variable in &store_to {
					catch_block.block.body.insert(
						0,
						Node::Expression(Expression::store(variable, Expression::load(temporary))),
					);
				}
			},
		}
	}

	/// `catch (T ex) { v = ex; ... }` where `ex` has no other reader binds
	/// `v` directly instead.
	fn simplify_catch_entry(&mut self, catch_block: &mut CatchBlock, temporary: VarId) {
		let copies_into = match catch_block.block.body.first() {
			Some(Node::Expression(first)) if first.code == AstCode::Store && first.arguments.len() == 1 => {
				let argument = &first.arguments[0];
				if argument.code == AstCode::Load && argument.operand == AstOperand::Variable(temporary) {
					match &first.operand {
						AstOperand::Variable(target) => Some(*target),
						_ => None,
					}
				} else {
					None
				}
			},
			_ => None,
		};
		let Some(target) = copies_into else { return };

		let other_reads = catch_block
			.block
			.expressions()
			.iter()
			.filter(|e| e.code == AstCode::Load && e.operand == AstOperand::Variable(temporary))
			.count();
		if other_reads == 1 {
			catch_block.block.body.remove(0);
			catch_block.exception_variable = Some(target);
		}
	}

	/// Straight-line lowering of a bytecode run: labels come out as label
	/// nodes, stack shuffles vanish, everything else becomes one expression
	/// wired to its temporaries.
	fn convert_linear(&mut self, run: &[usize]) -> Vec<Node> {
		let mut ast = Vec::new();

		for &bc in run {
			if self.bytecodes[bc].stack_before.is_none() {
				continue;
			}
			if let Some(label) = self.bytecodes[bc].label.clone() {
				ast.push(Node::Label(label));
			}
			if self.bytecodes[bc].code.is_stack_shuffle() {
				continue;
			}

			let record = &self.bytecodes[bc];
			let mut expression = Expression::new(record.code, record.operand.clone());
			if record.code == AstCode::Inc {
				if let Some(amount) = record.second_operand {
					expression
						.arguments
						.push(Expression::new(AstCode::LdC, AstOperand::Constant(Loadable::Integer(amount))));
				}
			}
			expression.ranges.push(Range { start: record.offset, end: record.end_offset });

			let stack = record.stack_before.as_ref().unwrap();
			let pop = record.pop_count.map(|p| p as usize).unwrap_or(stack.len());
			let mut i = stack.len() - pop;
			while i < stack.len() {
				let slot = &stack[i];
				if let Some(variable) = slot.load_from {
					expression.arguments.push(Expression::load(variable));
				}
				if slot.value.is_double_word() {
					i += 1;
				}
				i += 1;
			}

			let store_to = record.store_to.clone();
			let offset = record.offset;
			match store_to.len() {
				0 => ast.push(Node::Expression(expression)),
				1 => ast.push(Node::Expression(Expression::store(store_to[0], expression))),
				_ => {
					let temporary = self.generated_variable(format!("expr_{offset:02X}"), None);
					ast.push(Node::Expression(Expression::store(temporary, expression)));
					for &variable in store_to.iter().rev() {
						ast.push(Node::Expression(Expression::store(variable, Expression::load(temporary))));
					}
				},
			}
		}

		ast
	}

	// ------------------------------------------------------------------
	// Temporary inlining
	// ------------------------------------------------------------------

	/// Folds generated temporaries with exactly one store and one load into
	/// their use site, when evaluation order allows. Straight-line arithmetic
	/// loses its scaffolding here.
	fn inline_temporaries(&self, nodes: &mut Vec<Node>) {
		let mut stores: HashMap<VarId, usize> = HashMap::new();
		let mut loads: HashMap<VarId, usize> = HashMap::new();
		count_variable_uses(nodes, &mut stores, &mut loads);

		let inlinable = |v: VarId| {
			self.variables[v].generated
				&& stores.get(&v).copied().unwrap_or(0) == 1
				&& loads.get(&v).copied().unwrap_or(0) == 1
		};

		let mut total = 0;
		inline_in_nodes(nodes, &inlinable, &mut total);
		debug!("inlined {total} single-use temporaries");
	}
}

fn passthrough_code(op: OpCode) -> AstCode {
	use OpCode::*;
	match op {
		IALoad => AstCode::IALoad, LALoad => AstCode::LALoad, FALoad => AstCode::FALoad,
		DALoad => AstCode::DALoad, AALoad => AstCode::AALoad, BALoad => AstCode::BALoad,
		CALoad => AstCode::CALoad, SALoad => AstCode::SALoad,
		IAStore => AstCode::IAStore, LAStore => AstCode::LAStore, FAStore => AstCode::FAStore,
		DAStore => AstCode::DAStore, AAStore => AstCode::AAStore, BAStore => AstCode::BAStore,
		CAStore => AstCode::CAStore, SAStore => AstCode::SAStore,
		Pop => AstCode::Pop, Pop2 => AstCode::Pop2,
		Dup => AstCode::Dup, DupX1 => AstCode::DupX1, DupX2 => AstCode::DupX2,
		Dup2 => AstCode::Dup2, Dup2X1 => AstCode::Dup2X1, Dup2X2 => AstCode::Dup2X2,
		Swap => AstCode::Swap,
		IAdd => AstCode::IAdd, LAdd => AstCode::LAdd, FAdd => AstCode::FAdd, DAdd => AstCode::DAdd,
		ISub => AstCode::ISub, LSub => AstCode::LSub, FSub => AstCode::FSub, DSub => AstCode::DSub,
		IMul => AstCode::IMul, LMul => AstCode::LMul, FMul => AstCode::FMul, DMul => AstCode::DMul,
		IDiv => AstCode::IDiv, LDiv => AstCode::LDiv, FDiv => AstCode::FDiv, DDiv => AstCode::DDiv,
		IRem => AstCode::IRem, LRem => AstCode::LRem, FRem => AstCode::FRem, DRem => AstCode::DRem,
		INeg => AstCode::INeg, LNeg => AstCode::LNeg, FNeg => AstCode::FNeg, DNeg => AstCode::DNeg,
		IShl => AstCode::IShl, LShl => AstCode::LShl, IShr => AstCode::IShr, LShr => AstCode::LShr,
		IUShr => AstCode::IUShr, LUShr => AstCode::LUShr,
		IAnd => AstCode::IAnd, LAnd => AstCode::LAnd, IOr => AstCode::IOr, LOr => AstCode::LOr,
		IXor => AstCode::IXor, LXor => AstCode::LXor,
		I2L => AstCode::I2L, I2F => AstCode::I2F, I2D => AstCode::I2D,
		L2I => AstCode::L2I, L2F => AstCode::L2F, L2D => AstCode::L2D,
		F2I => AstCode::F2I, F2L => AstCode::F2L, F2D => AstCode::F2D,
		D2I => AstCode::D2I, D2L => AstCode::D2L, D2F => AstCode::D2F,
		I2B => AstCode::I2B, I2C => AstCode::I2C, I2S => AstCode::I2S,
		LCmp => AstCode::LCmp, FCmpL => AstCode::FCmpL, FCmpG => AstCode::FCmpG,
		DCmpL => AstCode::DCmpL, DCmpG => AstCode::DCmpG,
		IReturn => AstCode::IReturn, LReturn => AstCode::LReturn, FReturn => AstCode::FReturn,
		DReturn => AstCode::DReturn, AReturn => AstCode::AReturn, Return => AstCode::Return,
		ArrayLength => AstCode::ArrayLength, AThrow => AstCode::AThrow,
		MonitorEnter => AstCode::MonitorEnter, MonitorExit => AstCode::MonitorExit,
		_ => AstCode::Nop,
	}
}

fn union_definitions(old: &[usize], new: &[usize]) -> Option<Vec<usize>> {
	let mut grew = false;
	let mut union = old.to_vec();
	for &d in new {
		if !union.contains(&d) {
			union.push(d);
			grew = true;
		}
	}
	grew.then_some(union)
}

fn first_expression_mut(nodes: &mut [Node]) -> Option<&mut Expression> {
	for node in nodes {
		match node {
			Node::Expression(e) => return Some(e),
			Node::Block(b) => {
				if let Some(e) = first_expression_mut(&mut b.body) {
					return Some(e);
				}
			},
			Node::TryCatch(t) => {
				if let Some(e) = first_expression_mut(&mut t.try_block.body) {
					return Some(e);
				}
			},
			Node::Label(_) => {},
		}
	}
	None
}

fn count_variable_uses(nodes: &[Node], stores: &mut HashMap<VarId, usize>, loads: &mut HashMap<VarId, usize>) {
	fn count_expression(e: &Expression, stores: &mut HashMap<VarId, usize>, loads: &mut HashMap<VarId, usize>) {
		if let AstOperand::Variable(v) = &e.operand {
			let v = *v;
			match e.code {
				AstCode::Store | AstCode::Inc => *stores.entry(v).or_default() += 1,
				AstCode::Load => *loads.entry(v).or_default() += 1,
				_ => {},
			}
		}
		for argument in &e.arguments {
			count_expression(argument, stores, loads);
		}
	}

	for node in nodes {
		match node {
			Node::Expression(e) => count_expression(e, stores, loads),
			Node::Block(b) => count_variable_uses(&b.body, stores, loads),
			Node::TryCatch(t) => {
				count_variable_uses(&t.try_block.body, stores, loads);
				for c in &t.catch_blocks {
					count_variable_uses(&c.block.body, stores, loads);
				}
				if let Some(f) = &t.finally_block {
					count_variable_uses(&f.body, stores, loads);
				}
			},
			Node::Label(_) => {},
		}
	}
}

fn is_pure(e: &Expression) -> bool {
	matches!(e.code, AstCode::LdC | AstCode::Load | AstCode::AConstNull)
}

fn first_evaluated_leaf(e: &Expression) -> &Expression {
	match e.arguments.first() {
		Some(first) => first_evaluated_leaf(first),
		None => e,
	}
}

/// Replaces the unique `Load(variable)` inside `target` with `value`.
fn replace_load(target: &mut Expression, variable: VarId, value: &Expression) -> bool {
	for argument in target.arguments.iter_mut() {
		if argument.code == AstCode::Load && argument.operand == AstOperand::Variable(variable) {
			*argument = value.clone();
			return true;
		}
		if replace_load(argument, variable, value) {
			return true;
		}
	}
	false
}

fn inline_in_block(body: &mut Vec<Node>, inlinable: &dyn Fn(VarId) -> bool, total: &mut usize) {
	let mut changed = true;
	while changed {
		changed = false;
		for i in 0..body.len().saturating_sub(1) {
			let Node::Expression(store) = &body[i] else { continue };
			if store.code != AstCode::Store || store.arguments.len() != 1 {
				continue;
			}
			let AstOperand::Variable(variable) = store.operand.clone() else { continue };
			if !inlinable(variable) {
				continue;
			}
			let Node::Expression(next) = &body[i + 1] else { continue };

			// A pure value can move past anything; an effectful one must be
			// the first thing the next statement evaluates.
			let value = store.arguments[0].clone();
			let allowed = if is_pure(&value) {
				true
			} else {
				let leaf = first_evaluated_leaf(next);
				leaf.code == AstCode::Load && leaf.operand == AstOperand::Variable(variable)
			};
			if !allowed {
				continue;
			}

			let Node::Expression(next) = &mut body[i + 1] else { unreachable!() };
			if replace_load(next, variable, &value) {
				body.remove(i);
				*total += 1;
				changed = true;
				break;
			}
		}
	}
}

fn inline_in_nodes(nodes: &mut Vec<Node>, inlinable: &dyn Fn(VarId) -> bool, total: &mut usize) {
	inline_in_block(nodes, inlinable, total);
	for node in nodes {
		match node {
			Node::Block(b) => inline_in_nodes(&mut b.body, inlinable, total),
			Node::TryCatch(t) => {
				inline_in_nodes(&mut t.try_block.body, inlinable, total);
				for c in &mut t.catch_blocks {
					inline_in_nodes(&mut c.block.body, inlinable, total);
				}
				if let Some(f) = &mut t.finally_block {
					inline_in_nodes(&mut f.body, inlinable, total);
				}
			},
			_ => {},
		}
	}
}

#[cfg(test)]
mod testing {
	use super::*;
	use crate::body::VariableDefinitionCollection;
	use crate::ir::{Instruction, InstructionCollection};
	use crate::metadata::{DynamicCallSite, FieldRef, MethodDescriptor, MethodRef};

	struct NoScope;

	impl MetadataScope for NoScope {
		fn lookup_type(&self, _token: u16) -> Result<TypeReference> {
			bail!("no types")
		}
		fn lookup_constant(&self, _token: u16) -> Result<Loadable> {
			bail!("no constants")
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

	fn nop_body(count: u32, handlers: Vec<ExceptionHandler>) -> MethodBody {
		let mut instructions = InstructionCollection::new();
		for offset in 0..count {
			instructions.push(Instruction::new(offset, offset + 1, OpCode::Nop, Operand::None));
		}
		MethodBody {
			method_name: "test".to_owned(),
			is_static: true,
			is_constructor: false,
			declaring_type: TypeReference::object("Test"),
			descriptor: MethodDescriptor { parameters: vec![], return_type: None },
			max_stack: 1,
			max_locals: 0,
			code_size: count,
			instructions,
			variables: VariableDefinitionCollection::new(),
			exception_handlers: handlers,
			parameters: vec![],
			this_parameter: None,
		}
	}

	fn builder_for<'a>(body: &'a MethodBody, scope: &'a NoScope, context: &'a DecompilerContext) -> AstBuilder<'a, NoScope> {
		AstBuilder {
			body,
			scope,
			context,
			handlers: body.exception_handlers.clone(),
			bytecodes: Vec::new(),
			order: Vec::new(),
			bc_of_insn: HashMap::new(),
			load_exceptions: IndexMap::new(),
			variables: Vec::new(),
		}
	}

	fn catch(try_first: usize, try_last: usize, h_first: usize, h_last: usize) -> ExceptionHandler {
		ExceptionHandler::Catch {
			try_block: ExceptionBlock::new(try_first, try_last),
			handler_block: ExceptionBlock::new(h_first, h_last),
			catch_type: TypeReference::object("java/lang/Exception"),
		}
	}

	fn finally(try_first: usize, try_last: usize, h_first: usize, h_last: usize) -> ExceptionHandler {
		ExceptionHandler::Finally {
			try_block: ExceptionBlock::new(try_first, try_last),
			handler_block: ExceptionBlock::new(h_first, h_last),
		}
	}

	#[test]
	fn finally_duplicating_outer_catch_is_dropped() {
		// The compiler guards the outer catch's body (5..6) with a finally
		// that jumps straight back into that catch; only the real outer
		// catch and the real finally survive.
		let outer_catch = catch(0, 2, 5, 6);
		let real_finally = finally(1, 2, 8, 9);
		let duplicate = finally(8, 9, 5, 6);
		let body = nop_body(10, vec![outer_catch.clone(), real_finally.clone(), duplicate]);
		let scope = NoScope;
		let context = DecompilerContext::new(TypeReference::object("Test"));
		let mut builder = builder_for(&body, &scope, &context);

		builder.remove_finally_duplicating_outer_catch();
		assert_eq!(builder.handlers, vec![outer_catch, real_finally]);

		builder.remove_finally_duplicating_outer_catch();
		assert_eq!(builder.handlers.len(), 2);
	}

	#[test]
	fn self_handling_finally_is_dropped() {
		let body = nop_body(6, vec![finally(0, 1, 0, 4)]);
		let scope = NoScope;
		let context = DecompilerContext::new(TypeReference::object("Test"));
		let mut builder = builder_for(&body, &scope, &context);

		builder.remove_self_handling_finallies();
		assert!(builder.handlers.is_empty());
	}

	#[test]
	fn pruning_is_a_fixed_point() {
		let body = nop_body(10, vec![catch(0, 3, 5, 7), finally(0, 3, 8, 9)]);
		let scope = NoScope;
		let context = DecompilerContext::new(TypeReference::object("Test"));
		let mut builder = builder_for(&body, &scope, &context);

		builder.prune_exception_handlers();
		let first = builder.handlers.clone();
		builder.prune_exception_handlers();
		assert_eq!(builder.handlers, first);

		// The sibling alignment ran: both handlers end right before the
		// first handler's entry.
		for handler in &first {
			assert_eq!(handler.try_block().last, 4);
		}
	}
}
