use std::collections::HashMap;
use anyhow::{anyhow, Result};
use molt::ast::{AstCode, AstOperand, Expression, MethodAst, Node, Range};
use molt::body::{CodeAttribute, MethodDefinition};
use molt::ir::ExceptionTableEntry;
use molt::metadata::{
	ClassName, DynamicCallSite, FieldRef, Loadable, MetadataScope, MethodDescriptor, MethodRef,
	PrimitiveKind, TypeReference,
};
use molt::{build, DecompilerContext, MethodReader};

#[derive(Default)]
struct TableScope {
	types: HashMap<u16, TypeReference>,
	fields: HashMap<u16, FieldRef>,
	methods: HashMap<u16, MethodRef>,
}

impl MetadataScope for TableScope {
	fn lookup_type(&self, token: u16) -> Result<TypeReference> {
		self.types.get(&token).cloned().ok_or_else(|| anyhow!("no type for token {token}"))
	}
	fn lookup_constant(&self, token: u16) -> Result<Loadable> {
		Err(anyhow!("no constant for token {token}"))
	}
	fn lookup_field(&self, token: u16) -> Result<FieldRef> {
		self.fields.get(&token).cloned().ok_or_else(|| anyhow!("no field for token {token}"))
	}
	fn lookup_method(&self, token: u16) -> Result<MethodRef> {
		self.methods.get(&token).cloned().ok_or_else(|| anyhow!("no method for token {token}"))
	}
	fn lookup_dynamic_call_site(&self, token: u16) -> Result<DynamicCallSite> {
		Err(anyhow!("no call site for token {token}"))
	}
}

struct MethodCase {
	is_static: bool,
	parameters: Vec<TypeReference>,
	return_type: Option<TypeReference>,
	max_stack: u16,
	max_locals: u16,
	code: Vec<u8>,
	exception_table: Vec<ExceptionTableEntry>,
}

fn lift(input: MethodCase, scope: &TableScope) -> Result<MethodAst> {
	let method = MethodDefinition {
		name: "test".to_owned(),
		is_static: input.is_static,
		declaring_type: TypeReference::object("Test"),
		descriptor: MethodDescriptor { parameters: input.parameters, return_type: input.return_type },
		code: CodeAttribute {
			max_stack: input.max_stack,
			max_locals: input.max_locals,
			code: input.code,
			exception_table: input.exception_table,
			local_variable_table: None,
			local_variable_type_table: None,
		},
	};
	let body = MethodReader::new(&method, scope).read_body()?;
	let context = DecompilerContext::new(TypeReference::object("Test"));
	build(&body, scope, &context)
}

fn int() -> TypeReference {
	TypeReference::Primitive(PrimitiveKind::Int)
}

fn throwable() -> TypeReference {
	TypeReference::throwable()
}

fn assert_no_stack_shuffles(ast: &MethodAst) {
	for e in ast.expressions() {
		assert!(!e.code.is_stack_shuffle(), "stack shuffle survived into the tree: {e:?}");
	}
}

fn assert_ranges_monotone(ast: &MethodAst, code_size: u32) {
	for e in ast.expressions() {
		for range in &e.ranges {
			assert!(range.start < range.end, "empty range on {:?}", e.code);
			assert!(range.end <= code_size, "range past the code on {:?}", e.code);
		}
	}
}

#[test]
fn empty_body_lifts_to_nothing() -> Result<()> {
	let ast = lift(
		MethodCase {
			is_static: true,
			parameters: vec![],
			return_type: None,
			max_stack: 0,
			max_locals: 0,
			code: vec![],
			exception_table: vec![],
		},
		&TableScope::default(),
	)?;
	assert!(ast.nodes.is_empty());
	Ok(())
}

#[test]
fn straight_line_add_folds_into_one_expression() -> Result<()> {
	// iconst_1; iconst_2; iadd; ireturn
	let ast = lift(
		MethodCase {
			is_static: true,
			parameters: vec![],
			return_type: Some(int()),
			max_stack: 2,
			max_locals: 0,
			code: vec![0x04, 0x05, 0x60, 0xac],
			exception_table: vec![],
		},
		&TableScope::default(),
	)?;

	// Every temporary folded into its use site: the tree is exactly the one
	// nested return expression, ranges tracing back to the original bytes.
	let constant = |value: i32, start: u32| Expression {
		code: AstCode::LdC,
		operand: AstOperand::Constant(Loadable::Integer(value)),
		arguments: vec![],
		ranges: vec![Range { start, end: start + 1 }],
	};
	let expected = vec![Node::Expression(Expression {
		code: AstCode::IReturn,
		operand: AstOperand::None,
		arguments: vec![Expression {
			code: AstCode::IAdd,
			operand: AstOperand::None,
			arguments: vec![constant(1, 0), constant(2, 1)],
			ranges: vec![Range { start: 2, end: 3 }],
		}],
		ranges: vec![Range { start: 3, end: 4 }],
	})];
	pretty_assertions::assert_eq!(ast.nodes, expected);

	assert_no_stack_shuffles(&ast);
	assert_ranges_monotone(&ast, 4);
	Ok(())
}

#[test]
fn forward_branch_produces_labeled_join() -> Result<()> {
	// iload_0; ifeq +5; iconst_1; ireturn; iconst_0; ireturn
	let input = MethodCase {
		is_static: true,
		parameters: vec![int()],
		return_type: Some(int()),
		max_stack: 1,
		max_locals: 1,
		code: vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac],
		exception_table: vec![],
	};

	// The branch target instruction carries the method's only label.
	let method = MethodDefinition {
		name: "test".to_owned(),
		is_static: true,
		declaring_type: TypeReference::object("Test"),
		descriptor: MethodDescriptor { parameters: vec![int()], return_type: Some(int()) },
		code: CodeAttribute {
			max_stack: 1,
			max_locals: 1,
			code: input.code.clone(),
			exception_table: vec![],
			local_variable_table: None,
			local_variable_type_table: None,
		},
	};
	let scope = TableScope::default();
	let body = MethodReader::new(&method, &scope).read_body()?;
	let target = body.instructions.at_offset(6)?;
	let label = body.instructions.get(target).label.expect("branch target labeled");
	assert_eq!((label.offset, label.index), (6, 0));
	let labeled = body
		.instructions
		.iter()
		.filter(|i| i.label.is_some())
		.count();
	assert_eq!(labeled, 1);

	let ast = lift(input, &scope)?;

	let branch = ast
		.expressions()
		.into_iter()
		.find(|e| e.code == AstCode::IfEq)
		.expect("conditional branch")
		.clone();
	assert_eq!(branch.operand, AstOperand::Label("Label_0006".to_owned()));
	assert_eq!(branch.arguments.len(), 1);

	assert!(ast.nodes.contains(&Node::Label("Label_0006".to_owned())));

	let returns: Vec<&Expression> = ast
		.expressions()
		.into_iter()
		.filter(|e| e.code == AstCode::IReturn)
		.collect();
	assert_eq!(returns.len(), 2);
	for ret in returns {
		assert_eq!(ret.arguments.len(), 1, "one value returned at {ret:?}");
	}

	assert_ranges_monotone(&ast, 8);
	Ok(())
}

#[test]
fn catch_rethrow_binds_the_exception_variable() -> Result<()> {
	// try { aload_0; athrow } catch (Throwable) { astore_1; aload_1; athrow }
	let mut scope = TableScope::default();
	scope.types.insert(1, throwable());

	let ast = lift(
		MethodCase {
			is_static: true,
			parameters: vec![throwable()],
			return_type: None,
			max_stack: 1,
			max_locals: 2,
			code: vec![0x2a, 0xbf, 0x4c, 0x2b, 0xbf],
			exception_table: vec![ExceptionTableEntry {
				start_offset: 0,
				end_offset: 2,
				handler_offset: 2,
				catch_type: 1,
			}],
		},
		&scope,
	)?;

	assert_eq!(ast.nodes.len(), 1);
	let Node::TryCatch(try_catch) = &ast.nodes[0] else { panic!("expected a try/catch") };
	assert!(try_catch.finally_block.is_none());
	assert_eq!(try_catch.catch_blocks.len(), 1);

	let catch_block = &try_catch.catch_blocks[0];
	assert_eq!(catch_block.exception_type, throwable());
	let exception_variable = catch_block.exception_variable.expect("exception bound");

	let rethrow = catch_block
		.block
		.expressions()
		.into_iter()
		.find(|e| e.code == AstCode::AThrow)
		.expect("rethrow")
		.clone();
	assert_eq!(rethrow.arguments.len(), 1);
	assert_eq!(rethrow.arguments[0].code, AstCode::Load);
	assert_eq!(rethrow.arguments[0].operand, AstOperand::Variable(exception_variable));

	assert_no_stack_shuffles(&ast);
	assert_ranges_monotone(&ast, 5);
	Ok(())
}

#[test]
fn try_finally_keeps_one_scope_with_a_finally_block() -> Result<()> {
	// try { f() } finally { g() } in its compiled shape: the inlined finally
	// on the normal path, then the catch-any handler that runs g() and
	// rethrows.
	let mut scope = TableScope::default();
	let void_call = |name: &str| MethodRef {
		class: ClassName::from("Test"),
		name: name.to_owned(),
		descriptor: MethodDescriptor { parameters: vec![], return_type: None },
	};
	scope.methods.insert(1, void_call("f"));
	scope.methods.insert(2, void_call("g"));

	let ast = lift(
		MethodCase {
			is_static: true,
			parameters: vec![],
			return_type: None,
			max_stack: 1,
			max_locals: 2,
			code: vec![
				0xb8, 0x00, 0x01, // invokestatic f
				0xb8, 0x00, 0x02, // invokestatic g
				0xb1, // return
				0x4c, // astore_1
				0xb8, 0x00, 0x02, // invokestatic g
				0x2b, // aload_1
				0xbf, // athrow
			],
			exception_table: vec![ExceptionTableEntry {
				start_offset: 0,
				end_offset: 3,
				handler_offset: 7,
				catch_type: 0,
			}],
		},
		&scope,
	)?;

	let try_catch = ast
		.nodes
		.iter()
		.find_map(|n| match n {
			Node::TryCatch(t) => Some(t),
			_ => None,
		})
		.expect("try scope");
	assert!(try_catch.catch_blocks.is_empty());
	let finally = try_catch.finally_block.as_ref().expect("finally block");

	// The handler starts by capturing the in-flight exception and ends by
	// rethrowing it.
	let expressions = finally.expressions();
	assert!(expressions.iter().any(|e| e.code == AstCode::LoadException));
	assert!(expressions.iter().any(|e| e.code == AstCode::AThrow));

	assert_no_stack_shuffles(&ast);
	assert_ranges_monotone(&ast, 13);
	Ok(())
}

#[test]
fn dup_collapses_to_one_shared_temporary() -> Result<()> {
	// this.y = this.x: aload_0; dup; getfield x; putfield y; return
	let mut scope = TableScope::default();
	scope.fields.insert(1, FieldRef {
		class: ClassName::from("Test"),
		name: "x".to_owned(),
		field_type: int(),
	});
	scope.fields.insert(2, FieldRef {
		class: ClassName::from("Test"),
		name: "y".to_owned(),
		field_type: int(),
	});

	let ast = lift(
		MethodCase {
			is_static: false,
			parameters: vec![],
			return_type: None,
			max_stack: 2,
			max_locals: 1,
			code: vec![0x2a, 0x59, 0xb4, 0x00, 0x01, 0xb5, 0x00, 0x02, 0xb1],
			exception_table: vec![],
		},
		&scope,
	)?;

	assert_no_stack_shuffles(&ast);

	// Exactly one shared temporary carries the receiver, loaded at both the
	// read and the write.
	let shared: Vec<usize> = ast
		.variables
		.iter()
		.enumerate()
		.filter(|(_, v)| v.generated && v.name.starts_with("expr_"))
		.map(|(id, _)| id)
		.collect();
	assert_eq!(shared.len(), 1, "one coalesced receiver temporary, got {:?}", ast.variables);

	let loads = ast
		.expressions()
		.iter()
		.filter(|e| e.code == AstCode::Load && e.operand == AstOperand::Variable(shared[0]))
		.count();
	assert_eq!(loads, 2);

	assert_ranges_monotone(&ast, 9);
	Ok(())
}
