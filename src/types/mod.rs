//! Interned IR types.
//!
//! Type tuples and function signatures are content-interned into a
//! process-wide pool: constructing the same sequence of value types twice
//! yields handles that are pointer-equal. Equality and hashing on the
//! handles are therefore O(1), and a `FunctionType` can be flattened to a
//! pointer-sized [`Encoding`] for use in runtime data structures such as
//! indirect-call tables.
//!
//! The pool is append-only for the lifetime of the process, so handles
//! never invalidate. The hot path (lookup of an already-interned value)
//! takes a read lock; insertion is rare and takes the write lock.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{LazyLock, RwLock};

/// The type of a WebAssembly operand.
///
/// `Any` is the validator-only bottom type used for polymorphic stack
/// positions after an unconditional control transfer. It never appears in a
/// serialized module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Any,
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl ValueType {
    /// Width of a value of this type in bytes.
    ///
    /// Panics on `Any`, which has no runtime representation.
    pub fn byte_width(self) -> u8 {
        match self {
            ValueType::I32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::F64 => 8,
            ValueType::V128 => 16,
            ValueType::Any => unreachable!("ValueType::Any has no byte width"),
        }
    }

    pub fn bit_width(self) -> u8 {
        self.byte_width() * 8
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueType::Any => "any",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::V128 => "v128",
        })
    }
}

// ---------------------------------------------------------------------------
// Interning pool
// ---------------------------------------------------------------------------

/// Deterministic content hash, stable for the process lifetime.
fn content_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

struct TupleData {
    hash: u64,
    elems: Box<[ValueType]>,
}

struct FunctionTypeData {
    hash: u64,
    results: TypeTuple,
    params: TypeTuple,
}

type PoolMap<K, V> = LazyLock<RwLock<HashMap<K, V>>>;

static TUPLE_POOL: PoolMap<Box<[ValueType]>, &'static TupleData> = LazyLock::new(Default::default);
static FUNCTION_POOL: PoolMap<(TypeTuple, TypeTuple), &'static FunctionTypeData> = LazyLock::new(Default::default);

/// An immutable, content-interned sequence of [`ValueType`].
///
/// Two tuples constructed from equal element sequences share identity:
/// `a == b` iff they point at the same canonical allocation.
#[derive(Clone, Copy)]
pub struct TypeTuple(&'static TupleData);

impl TypeTuple {
    /// The empty tuple.
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Intern a sequence of element types.
    pub fn new(elems: &[ValueType]) -> Self {
        debug_assert!(!elems.contains(&ValueType::Any), "Any cannot be interned");
        if let Some(data) = TUPLE_POOL.read().unwrap().get(elems) {
            return TypeTuple(data);
        }
        let mut pool = TUPLE_POOL.write().unwrap();
        // Re-check under the write lock: another thread may have won the race.
        if let Some(data) = pool.get(elems) {
            return TypeTuple(data);
        }
        let boxed: Box<[ValueType]> = elems.into();
        let data: &'static TupleData = Box::leak(Box::new(TupleData {
            hash: content_hash(elems),
            elems: boxed.clone(),
        }));
        pool.insert(boxed, data);
        TypeTuple(data)
    }

    pub fn len(&self) -> usize {
        self.0.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.elems.is_empty()
    }

    pub fn as_slice(&self) -> &'static [ValueType] {
        &self.0.elems
    }

    /// Precomputed content hash, stable for the process lifetime.
    pub fn content_hash(&self) -> u64 {
        self.0.hash
    }
}

impl From<ValueType> for TypeTuple {
    fn from(elem: ValueType) -> Self {
        TypeTuple::new(&[elem])
    }
}

impl Deref for TypeTuple {
    type Target = [ValueType];

    fn deref(&self) -> &Self::Target {
        &self.0.elems
    }
}

impl PartialEq for TypeTuple {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for TypeTuple {}

impl Hash for TypeTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for TypeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TypeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len() == 1 {
            return write!(f, "{}", self[0]);
        }
        f.write_str("(")?;
        for (i, elem) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{elem}")?;
        }
        f.write_str(")")
    }
}

/// The type of a WebAssembly function: interned `(results, params)`.
#[derive(Clone, Copy)]
pub struct FunctionType(&'static FunctionTypeData);

/// A `FunctionType` represented as a pointer-sized opaque value, suitable
/// for storage in runtime data structures (e.g. table slot signature tags).
///
/// Encodings compare equal iff their function types are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Encoding(usize);

impl FunctionType {
    pub fn new(results: TypeTuple, params: TypeTuple) -> Self {
        let key = (results, params);
        if let Some(data) = FUNCTION_POOL.read().unwrap().get(&key) {
            return FunctionType(data);
        }
        let mut pool = FUNCTION_POOL.write().unwrap();
        if let Some(data) = pool.get(&key) {
            return FunctionType(data);
        }
        let data: &'static FunctionTypeData = Box::leak(Box::new(FunctionTypeData {
            hash: content_hash(&(results.content_hash(), params.content_hash())),
            results,
            params,
        }));
        pool.insert(key, data);
        FunctionType(data)
    }

    pub fn results(&self) -> TypeTuple {
        self.0.results
    }

    pub fn params(&self) -> TypeTuple {
        self.0.params
    }

    pub fn content_hash(&self) -> u64 {
        self.0.hash
    }

    pub fn encoding(&self) -> Encoding {
        Encoding(self.0 as *const FunctionTypeData as usize)
    }

    /// Recover a `FunctionType` from an [`Encoding`].
    ///
    /// The encoding must have been produced by [`FunctionType::encoding`];
    /// the interning pool is append-only, so such pointers stay valid for
    /// the process lifetime.
    pub fn from_encoding(encoding: Encoding) -> Self {
        // SAFETY: encodings only originate from `encoding()`, which takes the
        // address of a leaked, never-freed pool allocation.
        FunctionType(unsafe { &*(encoding.0 as *const FunctionTypeData) })
    }
}

impl PartialEq for FunctionType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for FunctionType {}

impl Hash for FunctionType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.params(), self.results())
    }
}

// ---------------------------------------------------------------------------
// Size-constrained and composite types
// ---------------------------------------------------------------------------

/// A range of expected sizes for a size-constrained type (table element
/// counts, memory pages). `max == u64::MAX` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeConstraints {
    pub min: u64,
    pub max: u64,
}

impl SizeConstraints {
    pub const UNBOUNDED: u64 = u64::MAX;

    pub fn new(min: u64, max: Option<u64>) -> Self {
        Self {
            min,
            max: max.unwrap_or(Self::UNBOUNDED),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.max != Self::UNBOUNDED
    }

    /// `sub` is a subset of `super` when every size `sub` permits is also
    /// permitted by `super`.
    pub fn is_subset(sup: &SizeConstraints, sub: &SizeConstraints) -> bool {
        sub.min >= sup.min && sub.max <= sup.max
    }
}

impl fmt::Display for SizeConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bounded() {
            write!(f, "{}..{}", self.min, self.max)
        } else {
            write!(f, "{}..", self.min)
        }
    }
}

/// The element type a table contains. Only `anyfunc` (a function reference
/// tagged with its signature) is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableElementType {
    AnyFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub element_type: TableElementType,
    pub is_shared: bool,
    pub size: SizeConstraints,
}

impl TableType {
    pub fn is_subset(sup: &TableType, sub: &TableType) -> bool {
        sup.element_type == sub.element_type
            && sup.is_shared == sub.is_shared
            && SizeConstraints::is_subset(&sup.size, &sub.size)
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} anyfunc", self.size, if self.is_shared { " shared" } else { "" })
    }
}

/// The type of a linear memory; sizes are in 64 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub is_shared: bool,
    pub size: SizeConstraints,
}

impl MemoryType {
    pub fn is_subset(sup: &MemoryType, sub: &MemoryType) -> bool {
        sup.is_shared == sub.is_shared && SizeConstraints::is_subset(&sup.size, &sub.size)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.size, if self.is_shared { " shared" } else { "" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub value_type: ValueType,
    pub is_mutable: bool,
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_mutable {
            write!(f, "global {}", self.value_type)
        } else {
            write!(f, "immutable {}", self.value_type)
        }
    }
}

/// The type of an exception tag: the parameter tuple thrown with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionType {
    pub params: TypeTuple,
}

/// The kind of an importable/exportable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Function,
    Table,
    Memory,
    Global,
    ExceptionType,
    Invalid,
}

/// The type of an importable/exportable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Function(FunctionType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
    ExceptionType(ExceptionType),
}

impl ObjectType {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectType::Function(_) => ObjectKind::Function,
            ObjectType::Table(_) => ObjectKind::Table,
            ObjectType::Memory(_) => ObjectKind::Memory,
            ObjectType::Global(_) => ObjectKind::Global,
            ObjectType::ExceptionType(_) => ObjectKind::ExceptionType,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Function(ty) => write!(f, "func {ty}"),
            ObjectType::Table(ty) => write!(f, "table {ty}"),
            ObjectType::Memory(ty) => write!(f, "memory {ty}"),
            ObjectType::Global(ty) => write!(f, "{ty}"),
            ObjectType::ExceptionType(ty) => write!(f, "exception_type {}", ty.params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_tuples_share_identity() {
        let a = TypeTuple::new(&[ValueType::I32, ValueType::F64]);
        let b = TypeTuple::new(&[ValueType::I32, ValueType::F64]);
        let c = TypeTuple::new(&[ValueType::F64, ValueType::I32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(std::ptr::eq(a.as_slice(), b.as_slice()));
    }

    #[test]
    fn tuple_hash_is_stable() {
        let a = TypeTuple::new(&[ValueType::I64]);
        let h = a.content_hash();
        let b = TypeTuple::new(&[ValueType::I64]);
        assert_eq!(b.content_hash(), h);
    }

    #[test]
    fn empty_tuple_is_legal() {
        let a = TypeTuple::empty();
        let b = TypeTuple::new(&[]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 0);
    }

    #[test]
    fn function_types_intern() {
        let params = TypeTuple::new(&[ValueType::I32, ValueType::I32]);
        let results = TypeTuple::from(ValueType::I32);
        let a = FunctionType::new(results, params);
        let b = FunctionType::new(TypeTuple::from(ValueType::I32), TypeTuple::new(&[ValueType::I32, ValueType::I32]));
        assert_eq!(a, b);
        assert_eq!(a.encoding(), b.encoding());

        let c = FunctionType::new(TypeTuple::empty(), params);
        assert_ne!(a, c);
        assert_ne!(a.encoding(), c.encoding());
    }

    #[test]
    fn encoding_round_trips() {
        let ty = FunctionType::new(TypeTuple::from(ValueType::F32), TypeTuple::empty());
        let enc = ty.encoding();
        assert_eq!(FunctionType::from_encoding(enc), ty);
    }

    #[test]
    fn size_constraint_subsets() {
        let sup = SizeConstraints::new(1, None);
        let sub = SizeConstraints::new(2, Some(10));
        assert!(SizeConstraints::is_subset(&sup, &sub));
        assert!(!SizeConstraints::is_subset(&sub, &sup));
    }

    #[test]
    fn display_forms() {
        let ty = FunctionType::new(
            TypeTuple::from(ValueType::I32),
            TypeTuple::new(&[ValueType::I32, ValueType::I64]),
        );
        assert_eq!(ty.to_string(), "(i32, i64)->i32");
        assert_eq!(SizeConstraints::new(1, Some(2)).to_string(), "1..2");
        assert_eq!(SizeConstraints::new(0, None).to_string(), "0..");
    }
}
