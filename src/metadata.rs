use std::fmt::{Display, Formatter};
use anyhow::Result;

/// A class name in internal form, like `java/lang/Object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassName(pub String);

impl ClassName {
	pub fn new(name: impl Into<String>) -> ClassName {
		ClassName(name.into())
	}
}

impl Display for ClassName {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for ClassName {
	fn from(value: &str) -> ClassName {
		ClassName(value.to_owned())
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
	Boolean,
	Byte,
	Char,
	Short,
	Int,
	Long,
	Float,
	Double,
}

/// A resolved reference to a type.
///
/// Generic signatures are not modeled; a scope that resolves a generic type
/// hands back its erasure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeReference {
	Primitive(PrimitiveKind),
	Object(ClassName),
	Array(Box<TypeReference>),
}

impl TypeReference {
	pub fn object(name: &str) -> TypeReference {
		TypeReference::Object(ClassName::from(name))
	}

	pub fn throwable() -> TypeReference {
		TypeReference::object("java/lang/Throwable")
	}

	/// `long` and `double` take two local variable slots and two stack words.
	pub fn is_double_word(&self) -> bool {
		matches!(self, TypeReference::Primitive(PrimitiveKind::Long | PrimitiveKind::Double))
	}

	/// The number of local variable slots a value of this type occupies.
	pub fn slot_width(&self) -> usize {
		if self.is_double_word() { 2 } else { 1 }
	}
}

/// A resolved field reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
	pub class: ClassName,
	pub name: String,
	pub field_type: TypeReference,
}

/// A parsed method descriptor.
///
/// The scope resolves descriptors before handing them out, so the core never
/// parses descriptor strings itself.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
	pub parameters: Vec<TypeReference>,
	/// `None` for `void`.
	pub return_type: Option<TypeReference>,
}

impl MethodDescriptor {
	/// The number of local variable slots the parameters occupy.
	pub fn parameter_slots(&self) -> usize {
		self.parameters.iter().map(TypeReference::slot_width).sum()
	}

	/// The number of stack words the arguments occupy.
	pub fn argument_words(&self) -> usize {
		self.parameter_slots()
	}

	/// The number of stack words the return value occupies.
	pub fn return_words(&self) -> usize {
		self.return_type.as_ref().map_or(0, TypeReference::slot_width)
	}
}

/// A resolved method reference.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRef {
	pub class: ClassName,
	pub name: String,
	pub descriptor: MethodDescriptor,
}

impl MethodRef {
	pub fn is_constructor(&self) -> bool {
		self.name == "<init>"
	}
}

/// A resolved `invokedynamic` call site.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicCallSite {
	pub name: String,
	pub descriptor: MethodDescriptor,
}

/// A loadable constant, as produced by `ldc` and friends.
#[derive(Debug, Clone, PartialEq)]
pub enum Loadable {
	Integer(i32),
	Float(f32),
	Long(i64),
	Double(f64),
	String(String),
	Class(ClassName),
}

impl Loadable {
	/// The number of stack words the constant occupies when pushed.
	pub fn stack_words(&self) -> usize {
		match self {
			Loadable::Long(_) | Loadable::Double(_) => 2,
			_ => 1,
		}
	}
}

/// Token-keyed lookups into the enclosing class file's constant pool and
/// metadata.
///
/// Implementations must be safe for concurrent read: independent method
/// bodies are analyzed in parallel against one shared scope.
pub trait MetadataScope: Sync {
	fn lookup_type(&self, token: u16) -> Result<TypeReference>;
	fn lookup_constant(&self, token: u16) -> Result<Loadable>;
	fn lookup_field(&self, token: u16) -> Result<FieldRef>;
	fn lookup_method(&self, token: u16) -> Result<MethodRef>;
	fn lookup_dynamic_call_site(&self, token: u16) -> Result<DynamicCallSite>;

	/// The nearest common supertype of two throwable types, used when sibling
	/// handlers merge into a multi-catch.
	///
	/// The default has no hierarchy to consult and falls back to
	/// `java/lang/Throwable` for distinct types.
	fn common_super_type(&self, a: &TypeReference, b: &TypeReference) -> TypeReference {
		if a == b {
			a.clone()
		} else {
			TypeReference::throwable()
		}
	}
}
