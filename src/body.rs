//! Method body inputs and outputs, and the local variable bookkeeping shared
//! by the decoder and the later analyses.

use anyhow::{anyhow, Result};
use crate::ir::{ExceptionHandler, ExceptionTableEntry, InstructionCollection};
use crate::metadata::{MethodDescriptor, TypeReference};
use crate::opcode::OpCode;

/// The `Code` attribute contents of one method, with constant pool tokens
/// still unresolved where the table stores tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
	pub max_stack: u16,
	pub max_locals: u16,
	pub code: Vec<u8>,
	pub exception_table: Vec<ExceptionTableEntry>,
	pub local_variable_table: Option<Vec<LocalVariableEntry>>,
	pub local_variable_type_table: Option<Vec<LocalVariableEntry>>,
}

/// One `LocalVariableTable` (or type table) entry, names and types already
/// resolved through the scope.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVariableEntry {
	pub start_pc: u16,
	pub length: u16,
	pub name: String,
	pub variable_type: TypeReference,
	pub slot: u16,
}

/// The method being lifted, as far as its body needs to know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDefinition {
	pub name: String,
	pub is_static: bool,
	pub declaring_type: TypeReference,
	pub descriptor: MethodDescriptor,
	pub code: CodeAttribute,
}

impl MethodDefinition {
	pub fn is_constructor(&self) -> bool {
		self.name == "<init>"
	}
}

/// A formal parameter, with its assigned local variable slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
	pub name: String,
	pub position: usize,
	pub slot: u16,
	pub parameter_type: TypeReference,
}

/// A local variable lifetime, either declared by the variable tables or
/// inferred from load/store instructions during decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
	pub slot: u16,
	pub name: Option<String>,
	pub variable_type: Option<TypeReference>,
	pub scope_start: u32,
	pub scope_end: u32,
	pub from_metadata: bool,
	pub type_known: bool,
	/// Tombstone left behind by [`VariableDefinitionCollection::merge_variables`]
	/// so operand indices stay stable until the decoder re-resolves them.
	pub merged: bool,
}

impl VariableDefinition {
	fn inferred(slot: u16, offset: u32) -> VariableDefinition {
		VariableDefinition {
			slot,
			name: None,
			variable_type: None,
			scope_start: offset,
			scope_end: offset + 1,
			from_metadata: false,
			type_known: false,
			merged: false,
		}
	}

	fn covers(&self, offset: u32) -> bool {
		self.scope_start <= offset && offset < self.scope_end
	}
}

/// All known variable lifetimes of a body, indexed densely; the indices are
/// what instruction operands carry.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VariableDefinitionCollection {
	items: Vec<VariableDefinition>,
}

impl VariableDefinitionCollection {
	pub fn new() -> VariableDefinitionCollection {
		VariableDefinitionCollection::default()
	}

	pub fn add(&mut self, variable: VariableDefinition) -> usize {
		self.items.push(variable);
		self.items.len() - 1
	}

	pub fn get(&self, index: usize) -> &VariableDefinition {
		&self.items[index]
	}

	pub fn get_mut(&mut self, index: usize) -> &mut VariableDefinition {
		&mut self.items[index]
	}

	/// Indices of the surviving (non-tombstoned) definitions.
	pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
		self.items.iter().enumerate().filter(|(_, v)| !v.merged).map(|(index, _)| index)
	}

	/// Finds or creates the variable live in `slot` around `offset`.
	///
	/// The decoder calls this eagerly for every load/store it sees, including
	/// the `*load_<n>`/`*store_<n>` macro forms; inferred lifetimes widen to
	/// cover every touch.
	pub fn ensure(&mut self, slot: u16, _op: OpCode, offset: u32) -> usize {
		if let Some(index) = self.try_find(slot, offset) {
			return index;
		}
		// Widen an existing inferred lifetime rather than piling up one
		// variable per touch; the declared tables get merged in later and
		// take over whatever they overlap.
		if let Some(index) = self
			.items
			.iter()
			.position(|v| !v.merged && !v.from_metadata && v.slot == slot)
		{
			let v = &mut self.items[index];
			v.scope_start = v.scope_start.min(offset);
			v.scope_end = v.scope_end.max(offset + 1);
			return index;
		}
		self.add(VariableDefinition::inferred(slot, offset))
	}

	/// The variable live in `slot` at `offset`, preferring declared entries.
	pub fn try_find(&self, slot: u16, offset: u32) -> Option<usize> {
		let mut inferred = None;
		for (index, v) in self.items.iter().enumerate() {
			if v.merged || v.slot != slot || !v.covers(offset) {
				continue;
			}
			if v.from_metadata {
				return Some(index);
			}
			inferred.get_or_insert(index);
		}
		inferred
	}

	pub fn find(&self, slot: u16, offset: u32) -> Result<usize> {
		self.try_find(slot, offset)
			.ok_or_else(|| anyhow!("no variable for slot {slot} at bytecode offset {offset}"))
	}

	/// Collapses same-slot lifetimes that overlap or touch, unless both are
	/// declared entries that disagree on name or type (those stay distinct
	/// slot-sharing variables).
	pub fn merge_variables(&mut self) {
		let mut order: Vec<usize> = self.live_indices().collect();
		order.sort_by_key(|&i| (self.items[i].slot, self.items[i].scope_start));

		for w in 0..order.len().saturating_sub(1) {
			let (a, b) = (order[w], order[w + 1]);
			if self.items[a].merged || self.items[b].merged {
				continue;
			}
			if self.items[a].slot != self.items[b].slot {
				continue;
			}
			if self.items[a].scope_end < self.items[b].scope_start {
				continue;
			}
			let distinct_declared = self.items[a].from_metadata
				&& self.items[b].from_metadata
				&& (self.items[a].name != self.items[b].name
					|| self.items[a].variable_type != self.items[b].variable_type);
			if distinct_declared {
				continue;
			}

			// The declared entry keeps its identity; the other becomes a
			// tombstone.
			let (keep, drop) = if self.items[b].from_metadata && !self.items[a].from_metadata {
				(b, a)
			} else {
				(a, b)
			};
			let (start, end) = (
				self.items[a].scope_start.min(self.items[b].scope_start),
				self.items[a].scope_end.max(self.items[b].scope_end),
			);
			self.items[keep].scope_start = start;
			self.items[keep].scope_end = end;
			self.items[drop].merged = true;
			// Let the survivor take the tombstone's place in the scan so
			// chains of adjacent lifetimes collapse in one pass.
			order[w + 1] = keep;
		}
	}

	/// Clamps scope ends to the code size; inferred lifetimes extend to the
	/// end of the code, since nothing bounds them from below.
	pub fn update_scopes(&mut self, code_size: u32) {
		for v in &mut self.items {
			if v.merged {
				continue;
			}
			if !v.from_metadata {
				v.scope_end = code_size;
			}
			v.scope_end = v.scope_end.min(code_size);
			v.scope_start = v.scope_start.min(code_size);
		}
	}
}

/// The decoded, normalized method body: the input to the AST builder.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
	pub method_name: String,
	pub is_static: bool,
	pub is_constructor: bool,
	pub declaring_type: TypeReference,
	pub descriptor: MethodDescriptor,
	pub max_stack: u16,
	pub max_locals: u16,
	pub code_size: u32,
	pub instructions: InstructionCollection,
	pub variables: VariableDefinitionCollection,
	pub exception_handlers: Vec<ExceptionHandler>,
	pub parameters: Vec<ParameterDefinition>,
	pub this_parameter: Option<ParameterDefinition>,
}

impl MethodBody {
	pub fn has_this(&self) -> bool {
		self.this_parameter.is_some()
	}

	/// Every parameter, `this` first for instance methods.
	pub fn all_parameters(&self) -> impl Iterator<Item = &ParameterDefinition> {
		self.this_parameter.iter().chain(self.parameters.iter())
	}
}

#[cfg(test)]
mod testing {
	use super::*;
	use crate::metadata::PrimitiveKind;

	#[test]
	fn ensure_widens_inferred_lifetimes() {
		let mut variables = VariableDefinitionCollection::new();
		let a = variables.ensure(1, OpCode::IStore1, 4);
		let b = variables.ensure(1, OpCode::ILoad1, 9);
		assert_eq!(a, b);
		assert_eq!(variables.get(a).scope_start, 4);
		assert_eq!(variables.get(a).scope_end, 10);
	}

	#[test]
	fn declared_entry_wins_over_overlapping_inferred() {
		let mut variables = VariableDefinitionCollection::new();
		variables.ensure(1, OpCode::IStore1, 4);
		variables.add(VariableDefinition {
			slot: 1,
			name: Some("count".to_owned()),
			variable_type: Some(TypeReference::Primitive(PrimitiveKind::Int)),
			scope_start: 2,
			scope_end: 12,
			from_metadata: true,
			type_known: true,
			merged: false,
		});
		let found = variables.try_find(1, 4).unwrap();
		assert_eq!(variables.get(found).name.as_deref(), Some("count"));
	}

	#[test]
	fn merge_collapses_adjacent_same_slot_lifetimes() {
		let mut variables = VariableDefinitionCollection::new();
		let a = variables.ensure(2, OpCode::IStore2, 0);
		variables.get_mut(a).scope_end = 6;
		let b = variables.add(VariableDefinition::inferred(2, 6));
		variables.merge_variables();
		assert!(!variables.get(a).merged);
		assert!(variables.get(b).merged);
		assert_eq!(variables.get(a).scope_end, 7);
		assert_eq!(variables.live_indices().count(), 1);
	}
}
