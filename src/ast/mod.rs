//! The variable-based expression tree the builder produces, and the
//! context/settings handle the build is parameterized on.

pub mod builder;

use crate::metadata::{DynamicCallSite, FieldRef, Loadable, MethodRef, PrimitiveKind, TypeReference};

/// A byte-offset range of the original code attributed to an expression.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Range {
	pub start: u32,
	pub end: u32,
}

/// Expression opcodes: the instruction set with the stack machinery
/// normalized away.
///
/// Constant macros become [`AstCode::LdC`], the load/store families become
/// [`AstCode::Load`]/[`AstCode::Store`] over variables, and two synthetic
/// codes exist only in the tree: [`AstCode::LoadException`] models the
/// implicit push at a handler entry, [`AstCode::Leave`] marks the structured
/// exit of a try or handler scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AstCode {
	Nop,
	AConstNull,
	LdC,
	Load,
	Store,
	Inc,
	LoadException,
	Leave,
	IALoad, LALoad, FALoad, DALoad, AALoad, BALoad, CALoad, SALoad,
	IAStore, LAStore, FAStore, DAStore, AAStore, BAStore, CAStore, SAStore,
	Pop, Pop2,
	Dup, DupX1, DupX2, Dup2, Dup2X1, Dup2X2, Swap,
	IAdd, LAdd, FAdd, DAdd,
	ISub, LSub, FSub, DSub,
	IMul, LMul, FMul, DMul,
	IDiv, LDiv, FDiv, DDiv,
	IRem, LRem, FRem, DRem,
	INeg, LNeg, FNeg, DNeg,
	IShl, LShl, IShr, LShr, IUShr, LUShr,
	IAnd, LAnd, IOr, LOr, IXor, LXor,
	I2L, I2F, I2D, L2I, L2F, L2D, F2I, F2L, F2D, D2I, D2L, D2F, I2B, I2C, I2S,
	LCmp, FCmpL, FCmpG, DCmpL, DCmpG,
	IfEq, IfNe, IfLt, IfGe, IfGt, IfLe,
	IfICmpEq, IfICmpNe, IfICmpLt, IfICmpGe, IfICmpGt, IfICmpLe,
	IfACmpEq, IfACmpNe,
	IfNull, IfNonNull,
	Goto, Jsr, Ret,
	TableSwitch, LookupSwitch,
	IReturn, LReturn, FReturn, DReturn, AReturn, Return,
	GetStatic, PutStatic, GetField, PutField,
	InvokeVirtual, InvokeSpecial, InvokeStatic, InvokeInterface, InvokeDynamic,
	New, NewArray, ANewArray, ArrayLength,
	AThrow, CheckCast, InstanceOf,
	MonitorEnter, MonitorExit, MultiANewArray,
}

impl AstCode {
	/// `true` when evaluation never continues into the next sibling.
	pub fn is_unconditional_control_flow(self) -> bool {
		matches!(
			self,
			AstCode::Goto
				| AstCode::Jsr
				| AstCode::Ret
				| AstCode::TableSwitch
				| AstCode::LookupSwitch
				| AstCode::IReturn
				| AstCode::LReturn
				| AstCode::FReturn
				| AstCode::DReturn
				| AstCode::AReturn
				| AstCode::Return
				| AstCode::AThrow
				| AstCode::Leave
		)
	}

	pub fn is_stack_shuffle(self) -> bool {
		matches!(
			self,
			AstCode::Dup
				| AstCode::DupX1
				| AstCode::DupX2
				| AstCode::Dup2
				| AstCode::Dup2X1
				| AstCode::Dup2X2
				| AstCode::Swap
		)
	}
}

/// Index of a [`Variable`] in its [`MethodAst`] arena.
pub type VarId = usize;

/// An AST variable: a parameter, a (possibly split) local, or a generated
/// temporary.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
	pub name: String,
	pub variable_type: Option<TypeReference>,
	pub generated: bool,
	/// Slot of the parameter this variable stands for, if any.
	pub original_parameter_slot: Option<u16>,
	/// The metadata variable definition this variable was split from.
	pub original_variable: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstOperand {
	None,
	Variable(VarId),
	/// Unsplit reference to a metadata variable definition; only seen while
	/// the builder is still running, never in the finished tree.
	VariableDef(usize),
	Constant(Loadable),
	Type(TypeReference),
	PrimitiveType(PrimitiveKind),
	Field(FieldRef),
	Method(MethodRef),
	CallSite(DynamicCallSite),
	/// Unconverted branch target (instruction arena index); never in the
	/// finished tree.
	Branch(usize),
	Label(String),
	/// Switch targets, default first.
	Labels(Vec<String>),
	Immediate(i64),
	Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
	pub code: AstCode,
	pub operand: AstOperand,
	pub arguments: Vec<Expression>,
	pub ranges: Vec<Range>,
}

impl Expression {
	pub fn new(code: AstCode, operand: AstOperand) -> Expression {
		Expression { code, operand, arguments: Vec::new(), ranges: Vec::new() }
	}

	pub fn with_arguments(code: AstCode, operand: AstOperand, arguments: Vec<Expression>) -> Expression {
		Expression { code, operand, arguments, ranges: Vec::new() }
	}

	pub fn load(variable: VarId) -> Expression {
		Expression::new(AstCode::Load, AstOperand::Variable(variable))
	}

	pub fn store(variable: VarId, value: Expression) -> Expression {
		Expression::with_arguments(AstCode::Store, AstOperand::Variable(variable), vec![value])
	}

	/// This expression and every argument below it, pre-order.
	pub fn self_and_children(&self) -> Vec<&Expression> {
		let mut out = Vec::new();
		collect_expression(self, &mut out);
		out
	}
}

fn collect_expression<'a>(expression: &'a Expression, out: &mut Vec<&'a Expression>) {
	out.push(expression);
	for argument in &expression.arguments {
		collect_expression(argument, out);
	}
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
	pub body: Vec<Node>,
}

impl Block {
	/// Every expression in the block, pre-order, descending into nested
	/// scopes.
	pub fn expressions(&self) -> Vec<&Expression> {
		let mut out = Vec::new();
		for node in &self.body {
			collect_node(node, &mut out);
		}
		out
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchBlock {
	pub exception_type: TypeReference,
	/// All types this handler catches; more than one after multi-catch
	/// aliasing, with `exception_type` their common supertype.
	pub caught_types: Vec<TypeReference>,
	pub exception_variable: Option<VarId>,
	pub block: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TryCatchBlock {
	pub try_block: Block,
	pub catch_blocks: Vec<CatchBlock>,
	pub finally_block: Option<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
	Label(String),
	Expression(Expression),
	Block(Block),
	TryCatch(TryCatchBlock),
}

impl Node {
	pub fn is_unconditional_control_flow(&self) -> bool {
		match self {
			Node::Expression(e) => e.code.is_unconditional_control_flow(),
			_ => false,
		}
	}

	pub fn expressions(&self) -> Vec<&Expression> {
		let mut out = Vec::new();
		collect_node(self, &mut out);
		out
	}
}

fn collect_node<'a>(node: &'a Node, out: &mut Vec<&'a Expression>) {
	match node {
		Node::Label(_) => {},
		Node::Expression(e) => collect_expression(e, out),
		Node::Block(b) => {
			for n in &b.body {
				collect_node(n, out);
			}
		},
		Node::TryCatch(t) => {
			for n in &t.try_block.body {
				collect_node(n, out);
			}
			for c in &t.catch_blocks {
				for n in &c.block.body {
					collect_node(n, out);
				}
			}
			if let Some(f) = &t.finally_block {
				for n in &f.body {
					collect_node(n, out);
				}
			}
		},
	}
}

/// The finished lift of one method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodAst {
	pub nodes: Vec<Node>,
	pub variables: Vec<Variable>,
}

impl MethodAst {
	pub fn variable(&self, id: VarId) -> &Variable {
		&self.variables[id]
	}

	pub fn expressions(&self) -> Vec<&Expression> {
		let mut out = Vec::new();
		for node in &self.nodes {
			collect_node(node, &mut out);
		}
		out
	}
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecompilerSettings {
	pub always_generate_exception_variable_for_catch_blocks: bool,
}

/// Per-job knob bundle; nothing in the pipeline is global.
#[derive(Debug, Clone, PartialEq)]
pub struct DecompilerContext {
	pub current_type: TypeReference,
	pub optimize: bool,
	pub settings: DecompilerSettings,
}

impl DecompilerContext {
	pub fn new(current_type: TypeReference) -> DecompilerContext {
		DecompilerContext {
			current_type,
			optimize: true,
			settings: DecompilerSettings::default(),
		}
	}
}

/// The display name of the label at a bytecode offset.
pub fn label_name(offset: u32) -> String {
	format!("Label_{offset:04}")
}
