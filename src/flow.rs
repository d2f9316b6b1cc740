//! Control-flow graphs over the decoded instruction stream, with dominance
//! and dominance frontiers.
//!
//! Two builds are used: the exception-table normalizer works on a graph with
//! no exception edges (but with block boundaries at the raw handler offsets,
//! so handler entries have nodes), and the stack analysis works on a graph
//! that carries one node per exception handler.

use std::collections::{BTreeSet, HashMap, HashSet};
use petgraph::Direction;
use petgraph::algo::dominators::{self, Dominators};
use petgraph::graph::{DiGraph, NodeIndex};
use crate::ir::{ExceptionHandler, InstructionCollection, Operand};
use crate::opcode::FlowControl;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
	Normal,
	EntryPoint,
	RegularExit,
	ExceptionalExit,
	CatchHandler,
	FinallyHandler,
	EndFinally,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlFlowNode {
	pub kind: NodeKind,
	/// First instruction of the block (Normal nodes only).
	pub first: Option<usize>,
	/// Last instruction of the block (Normal nodes only).
	pub last: Option<usize>,
	/// Offset of the first instruction.
	pub start_offset: Option<u32>,
	/// End offset of the last instruction (exclusive).
	pub end_offset: Option<u32>,
	/// Index into the handler list for handler nodes.
	pub exception_handler: Option<usize>,
}

impl ControlFlowNode {
	fn special(kind: NodeKind) -> ControlFlowNode {
		ControlFlowNode {
			kind,
			first: None,
			last: None,
			start_offset: None,
			end_offset: None,
			exception_handler: None,
		}
	}
}

pub struct ControlFlowGraph {
	graph: DiGraph<ControlFlowNode, ()>,
	pub entry: NodeIndex,
	pub regular_exit: NodeIndex,
	pub exceptional_exit: NodeIndex,
	node_of_instruction: HashMap<usize, NodeIndex>,
	dominators: Option<Dominators<NodeIndex>>,
	dominance_frontier: HashMap<NodeIndex, HashSet<NodeIndex>>,
	dominator_children: HashMap<NodeIndex, Vec<NodeIndex>>,
}

impl ControlFlowGraph {
	/// Builds the graph. `boundary_offsets` force extra block starts; the
	/// normalizer passes the raw handler offsets here since it builds without
	/// exception edges.
	pub fn build(
		instructions: &InstructionCollection,
		handlers: &[ExceptionHandler],
		boundary_offsets: &[u32],
	) -> ControlFlowGraph {
		let order: Vec<usize> = instructions.real_indices().collect();
		let position: HashMap<usize, usize> = order.iter().enumerate().map(|(p, &i)| (i, p)).collect();

		// Block starts, as positions in stream order.
		let mut starts = BTreeSet::new();
		if !order.is_empty() {
			starts.insert(0);
		}
		let mark_target = |starts: &mut BTreeSet<usize>, target: usize| {
			if let Some(&p) = position.get(&target) {
				starts.insert(p);
			}
		};
		for (p, &index) in order.iter().enumerate() {
			let insn = instructions.get(index);
			match &insn.operand {
				Operand::Branch(target) => mark_target(&mut starts, *target),
				Operand::Switch(switch) => {
					mark_target(&mut starts, switch.default_target);
					for &target in &switch.targets {
						mark_target(&mut starts, target);
					}
				},
				_ => {},
			}
			if insn.op.flow_control() != FlowControl::Next && p + 1 < order.len() {
				starts.insert(p + 1);
			}
		}
		for &offset in boundary_offsets {
			if let Some(index) = instructions.try_at_offset(offset) {
				mark_target(&mut starts, index);
			}
		}
		for handler in handlers {
			mark_target(&mut starts, handler.try_block().first);
			mark_target(&mut starts, handler.handler_block().first);
			if let Some(after_try) = instructions.next_index(handler.try_block().last) {
				mark_target(&mut starts, after_try);
			}
		}

		let mut graph = DiGraph::new();
		let entry = graph.add_node(ControlFlowNode::special(NodeKind::EntryPoint));
		let regular_exit = graph.add_node(ControlFlowNode::special(NodeKind::RegularExit));
		let exceptional_exit = graph.add_node(ControlFlowNode::special(NodeKind::ExceptionalExit));

		let starts: Vec<usize> = starts.into_iter().collect();
		let mut node_of_instruction = HashMap::new();
		let mut blocks = Vec::new();

		for (b, &start) in starts.iter().enumerate() {
			let end = starts.get(b + 1).copied().unwrap_or(order.len());
			let first = order[start];
			let last = order[end - 1];
			let node = graph.add_node(ControlFlowNode {
				kind: NodeKind::Normal,
				first: Some(first),
				last: Some(last),
				start_offset: Some(instructions.get(first).offset),
				end_offset: Some(instructions.get(last).end_offset),
				exception_handler: None,
			});
			for &index in &order[start..end] {
				node_of_instruction.insert(index, node);
			}
			blocks.push(node);
		}

		let block_at = |index: usize| node_of_instruction.get(&index).copied();

		let mut edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();

		if let Some(&first_block) = blocks.first() {
			edges.push((entry, first_block));
		} else {
			edges.push((entry, regular_exit));
		}

		for (b, &node) in blocks.iter().enumerate() {
			let last = graph[node].last.expect("normal node has instructions");
			let insn = instructions.get(last);
			let fall_through = blocks.get(b + 1).copied().unwrap_or(regular_exit);
			let branch_target = |edges: &mut Vec<_>, target: usize| {
				if instructions.get(target).synthetic {
					// Dangling jump past the end of the body.
					edges.push((node, regular_exit));
				} else if let Some(t) = block_at(target) {
					edges.push((node, t));
				}
			};

			match insn.op.flow_control() {
				FlowControl::Return => edges.push((node, regular_exit)),
				FlowControl::Throw => edges.push((node, exceptional_exit)),
				FlowControl::Branch => match &insn.operand {
					Operand::Branch(target) => branch_target(&mut edges, *target),
					// `ret` leaves the graph as far as this analysis goes.
					_ => edges.push((node, exceptional_exit)),
				},
				FlowControl::ConditionalBranch => match &insn.operand {
					Operand::Branch(target) => {
						branch_target(&mut edges, *target);
						edges.push((node, fall_through));
					},
					Operand::Switch(switch) => {
						branch_target(&mut edges, switch.default_target);
						for &target in &switch.targets {
							branch_target(&mut edges, target);
						}
					},
					_ => edges.push((node, fall_through)),
				},
				FlowControl::Next => edges.push((node, fall_through)),
			}
		}

		// One node per handler; every block of the try range can reach it.
		for (h, handler) in handlers.iter().enumerate() {
			let kind = if handler.is_finally() { NodeKind::FinallyHandler } else { NodeKind::CatchHandler };
			let mut handler_weight = ControlFlowNode::special(kind);
			handler_weight.exception_handler = Some(h);
			let handler_node = graph.add_node(handler_weight);

			let try_block = handler.try_block();
			let (Some(&try_start), Some(&try_end)) = (position.get(&try_block.first), position.get(&try_block.last)) else {
				continue;
			};
			for &block in &blocks {
				let Some(first) = graph[block].first else { continue };
				let p = position[&first];
				if p >= try_start && p <= try_end {
					edges.push((block, handler_node));
				}
			}
			if let Some(body) = block_at(handler.handler_block().first) {
				edges.push((handler_node, body));
			}
			if handler.is_finally() {
				let end_finally = graph.add_node(ControlFlowNode::special(NodeKind::EndFinally));
				edges.push((handler_node, end_finally));
			}
		}

		for (a, b) in edges {
			graph.update_edge(a, b, ());
		}

		ControlFlowGraph {
			graph,
			entry,
			regular_exit,
			exceptional_exit,
			node_of_instruction,
			dominators: None,
			dominance_frontier: HashMap::new(),
			dominator_children: HashMap::new(),
		}
	}

	pub fn compute_dominance(&mut self) {
		let dominators = dominators::simple_fast(&self.graph, self.entry);

		let mut children: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
		for node in self.graph.node_indices() {
			if let Some(idom) = dominators.immediate_dominator(node) {
				children.entry(idom).or_default().push(node);
			}
		}

		self.dominators = Some(dominators);
		self.dominator_children = children;
	}

	/// Cooper/Harvey/Kennedy runner construction over the dominator tree.
	pub fn compute_dominance_frontier(&mut self) {
		let dominators = self.dominators.as_ref().expect("dominance computed first");
		let mut frontier: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();

		for node in self.graph.node_indices() {
			let Some(idom) = dominators.immediate_dominator(node) else { continue };
			let preds: Vec<NodeIndex> = self.graph.neighbors_directed(node, Direction::Incoming).collect();
			if preds.len() < 2 {
				continue;
			}
			for pred in preds {
				let mut runner = pred;
				loop {
					if runner == idom {
						break;
					}
					frontier.entry(runner).or_default().insert(node);
					match dominators.immediate_dominator(runner) {
						Some(up) => runner = up,
						None => break,
					}
				}
			}
		}

		self.dominance_frontier = frontier;
	}

	pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
		self.graph.node_indices()
	}

	pub fn node(&self, index: NodeIndex) -> &ControlFlowNode {
		&self.graph[index]
	}

	pub fn successors(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
		self.graph.neighbors(index)
	}

	/// The Normal node containing an instruction.
	pub fn node_containing(&self, instruction: usize) -> Option<NodeIndex> {
		self.node_of_instruction.get(&instruction).copied()
	}

	/// Whether `a` dominates `b` (reflexively).
	pub fn dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
		let Some(dominators) = &self.dominators else { return false };
		match dominators.dominators(b) {
			Some(mut chain) => chain.any(|d| d == a),
			None => false,
		}
	}

	pub fn dominator_tree_children(&self, node: NodeIndex) -> &[NodeIndex] {
		self.dominator_children.get(&node).map_or(&[], Vec::as_slice)
	}

	pub fn dominance_frontier(&self, node: NodeIndex) -> Option<&HashSet<NodeIndex>> {
		self.dominance_frontier.get(&node)
	}

	/// The handlers that actually appear in the graph, in node order.
	pub fn handlers_present(&self) -> Vec<usize> {
		self.graph
			.node_indices()
			.filter_map(|n| self.graph[n].exception_handler)
			.collect()
	}
}

#[cfg(test)]
mod testing {
	use super::*;
	use crate::ir::Instruction;
	use crate::opcode::OpCode;

	// if 0 then {a} else {b}; join; return
	fn diamond() -> InstructionCollection {
		let mut instructions = InstructionCollection::new();
		instructions.push(Instruction::new(0, 1, OpCode::IConst0, Operand::None));
		let branch = instructions.push(Instruction::new(1, 4, OpCode::IfEq, Operand::None));
		instructions.push(Instruction::new(4, 5, OpCode::IConst1, Operand::None));
		let goto = instructions.push(Instruction::new(5, 8, OpCode::Goto, Operand::None));
		let else_start = instructions.push(Instruction::new(8, 9, OpCode::IConst2, Operand::None));
		let join = instructions.push(Instruction::new(9, 10, OpCode::Pop, Operand::None));
		instructions.push(Instruction::new(10, 11, OpCode::Return, Operand::None));
		instructions.get_mut(branch).operand = Operand::Branch(else_start);
		instructions.get_mut(goto).operand = Operand::Branch(join);
		instructions
	}

	#[test]
	fn dominance_on_a_diamond() {
		let instructions = diamond();
		let mut cfg = ControlFlowGraph::build(&instructions, &[], &[]);
		cfg.compute_dominance();
		cfg.compute_dominance_frontier();

		let head = cfg.node_containing(1).unwrap();
		let then_arm = cfg.node_containing(2).unwrap();
		let else_arm = cfg.node_containing(4).unwrap();
		let join = cfg.node_containing(5).unwrap();

		assert_ne!(then_arm, else_arm);
		assert!(cfg.dominates(head, then_arm));
		assert!(cfg.dominates(head, else_arm));
		assert!(cfg.dominates(head, join));
		assert!(!cfg.dominates(then_arm, join));

		// Both arms see the join in their frontier.
		assert!(cfg.dominance_frontier(then_arm).unwrap().contains(&join));
		assert!(cfg.dominance_frontier(else_arm).unwrap().contains(&join));
	}

	#[test]
	fn straight_line_has_single_block() {
		let mut instructions = InstructionCollection::new();
		instructions.push(Instruction::new(0, 1, OpCode::IConst1, Operand::None));
		instructions.push(Instruction::new(1, 2, OpCode::IConst2, Operand::None));
		instructions.push(Instruction::new(2, 3, OpCode::IAdd, Operand::None));
		instructions.push(Instruction::new(3, 4, OpCode::IReturn, Operand::None));
		let cfg = ControlFlowGraph::build(&instructions, &[], &[]);

		let a = cfg.node_containing(0).unwrap();
		let d = cfg.node_containing(3).unwrap();
		assert_eq!(a, d);
		assert!(cfg.successors(a).any(|s| s == cfg.regular_exit));
	}
}
