//! The runtime: compartments, runtime objects, linking, instantiation,
//! and the interpreter.
//!
//! A [`Compartment`] is the ownership root for every runtime object
//! created within it and the boundary traps do not cross. Instances are
//! bound to one compartment for life; distinct compartments are fully
//! isolated and may run in parallel.

mod exec;
mod host;
mod instance;
pub(crate) mod memory;
mod stack;

pub use host::IntoHostFunc;
pub use instance::{instantiate, Instance};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::compile::CompiledFunction;
use crate::trap_handler::GuardRegion;
use crate::types::{
    Encoding, ExceptionType, FunctionType, GlobalType, MemoryType, TableType, ValueType,
};
use memory::MemoryInstance;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A runtime value crossing the host/guest boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::V128(_) => ValueType::V128,
        }
    }

    pub fn default_for(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::V128 => Value::V128(0),
            ValueType::Any => unreachable!("Any has no runtime value"),
        }
    }

    /// Pack into one raw stack slot. `V128` values take two slots and are
    /// handled by the callers that know the layout.
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
            Value::V128(_) => unreachable!("v128 is not a single slot"),
        }
    }

    pub(crate) fn from_bits(ty: ValueType, bits: u64) -> Value {
        match ty {
            ValueType::I32 => Value::I32(bits as u32 as i32),
            ValueType::I64 => Value::I64(bits as i64),
            ValueType::F32 => Value::F32(f32::from_bits(bits as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(bits)),
            ValueType::V128 | ValueType::Any => unreachable!("not a single-slot type"),
        }
    }

    pub fn unwrap_i32(self) -> i32 {
        match self {
            Value::I32(v) => v,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    pub fn unwrap_i64(self) -> i64 {
        match self {
            Value::I64(v) => v,
            other => panic!("expected i64, got {other:?}"),
        }
    }

    pub fn unwrap_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            other => panic!("expected f32, got {other:?}"),
        }
    }

    pub fn unwrap_f64(self) -> f64 {
        match self {
            Value::F64(v) => v,
            other => panic!("expected f64, got {other:?}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::V128(v) => write!(f, "0x{v:032x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Traps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    AccessViolation,
    InvalidIndirectCall,
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidFloatConversion,
    Unreachable,
    StackOverflow,
    OutOfMemory,
    UncaughtException,
    /// Host-boundary misuse: bad argument count/types, unknown export.
    InvalidArgument,
    /// The owning compartment was asked to terminate.
    Terminated,
}

impl TrapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrapKind::AccessViolation => "access violation",
            TrapKind::InvalidIndirectCall => "invalid indirect call",
            TrapKind::IntegerDivideByZero => "integer divide by zero",
            TrapKind::IntegerOverflow => "integer overflow",
            TrapKind::InvalidFloatConversion => "invalid float-to-integer conversion",
            TrapKind::Unreachable => "unreachable executed",
            TrapKind::StackOverflow => "stack overflow",
            TrapKind::OutOfMemory => "out of memory",
            TrapKind::UncaughtException => "uncaught exception",
            TrapKind::InvalidArgument => "invalid argument",
            TrapKind::Terminated => "compartment terminated",
        }
    }
}

/// One guest frame captured when a trap unwound.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub function_index: u32,
    pub pc: usize,
}

/// A guest-side fault. Traps unwind every guest frame back to the host
/// caller; they never cross compartment boundaries and never leave an
/// instance in a corrupt state.
#[derive(Debug, Clone)]
pub struct Trap {
    kind: TrapKind,
    message: String,
    call_stack: Vec<TrapFrame>,
}

impl Trap {
    pub fn new(kind: TrapKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn kind(&self) -> TrapKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn call_stack(&self) -> &[TrapFrame] {
        &self.call_stack
    }

    pub(crate) fn with_frame(mut self, frame: TrapFrame) -> Self {
        self.call_stack.push(frame);
        self
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trap ({}): {}", self.kind.as_str(), self.message)?;
        for frame in &self.call_stack {
            write!(f, "\n  at function {} pc {}", frame.function_index, frame.pc)?;
        }
        Ok(())
    }
}

impl std::error::Error for Trap {}

// ---------------------------------------------------------------------------
// Link and instantiation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unresolved import {module}.{name}")]
    Missing { module: String, name: String },

    #[error("import {module}.{name}: expected {expected}, found {found}")]
    Mismatch {
        module: String,
        name: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Error)]
pub enum InstantiationError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("element segment does not fit its table")]
    ElemSegmentOutOfBounds,

    #[error("data segment does not fit its memory")]
    DataSegmentOutOfBounds,

    #[error("out of memory allocating runtime objects")]
    OutOfMemory,

    #[error("start function trapped")]
    StartTrap(#[source] Trap),
}

// ---------------------------------------------------------------------------
// Compartment
// ---------------------------------------------------------------------------

/// Groups related instances sharing a trap domain; the ownership root for
/// every runtime object created within it. Tearing the compartment down
/// (dropping the last handle) releases all of its instances.
#[derive(Clone)]
pub struct Compartment {
    pub(crate) inner: Arc<CompartmentInner>,
}

pub(crate) struct CompartmentInner {
    pub(crate) terminated: AtomicBool,
    pub(crate) instances: Mutex<Vec<Arc<instance::InstanceInner>>>,
    /// Reservations of every memory reachable from this compartment,
    /// registered with the trap handler on each guest entry.
    pub(crate) memory_regions: Mutex<Vec<GuardRegion>>,
}

impl Compartment {
    pub fn new() -> Self {
        // The fault handler is process-wide and idempotent to install.
        crate::trap_handler::init();
        Self {
            inner: Arc::new(CompartmentInner {
                terminated: AtomicBool::new(false),
                instances: Mutex::new(Vec::new()),
                memory_regions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Ask every guest running in this compartment to stop: execution
    /// traps at the next safepoint (branch or call boundary). Host
    /// functions currently running are responsible for surfacing this.
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

impl Default for Compartment {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Runtime objects
// ---------------------------------------------------------------------------

pub(crate) type HostThunk = Box<dyn Fn(&[Value]) -> Result<Vec<Value>, Trap> + Send + Sync>;

pub(crate) enum FunctionInstance {
    Wasm {
        ty: FunctionType,
        /// The owning instance; weak to avoid an ownership cycle, and
        /// always upgradable while the compartment holds the instance.
        instance: Weak<instance::InstanceInner>,
        code: Arc<CompiledFunction>,
        function_index: u32,
    },
    Host {
        ty: FunctionType,
        thunk: HostThunk,
    },
}

/// A callable function: a compiled guest function bound to its instance,
/// or a registered host function.
#[derive(Clone)]
pub struct Function(pub(crate) Arc<FunctionInstance>);

impl Function {
    /// Register a host function from an untyped thunk. Prefer
    /// [`Function::wrap`] for native-typed closures.
    pub fn from_host<F>(ty: FunctionType, thunk: F) -> Function
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, Trap> + Send + Sync + 'static,
    {
        Function(Arc::new(FunctionInstance::Host {
            ty,
            thunk: Box::new(thunk),
        }))
    }

    /// Register a host function from a closure over native types. The
    /// marshalling thunk is monomorphised per signature here, at
    /// registration, not by runtime reflection.
    pub fn wrap<Params, Results>(func: impl IntoHostFunc<Params, Results>) -> Function {
        func.into_host_func()
    }

    pub fn ty(&self) -> FunctionType {
        match &*self.0 {
            FunctionInstance::Wasm { ty, .. } | FunctionInstance::Host { ty, .. } => *ty,
        }
    }

    /// Call the function with type-checked arguments.
    pub fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, Trap> {
        exec::invoke_function(self, args)
    }
}

/// An indirect-call table: `anyfunc` slots holding a function reference
/// tagged with its signature encoding, or null.
#[derive(Clone)]
pub struct Table(pub(crate) Arc<TableInstance>);

pub(crate) struct TableInstance {
    ty: TableType,
    pub(crate) elements: RwLock<Vec<Option<TableElement>>>,
}

#[derive(Clone)]
pub(crate) struct TableElement {
    pub(crate) encoding: Encoding,
    pub(crate) function: Function,
}

impl Table {
    pub fn new(ty: TableType) -> Table {
        Table(Arc::new(TableInstance {
            ty,
            elements: RwLock::new(vec![None; ty.size.min as usize]),
        }))
    }

    pub fn ty(&self) -> TableType {
        self.0.ty
    }

    pub fn size(&self) -> u64 {
        self.0.elements.read().unwrap().len() as u64
    }

    pub fn get(&self, index: u64) -> Option<Function> {
        self.0
            .elements
            .read()
            .unwrap()
            .get(index as usize)?
            .as_ref()
            .map(|element| element.function.clone())
    }

    pub fn set(&self, index: u64, function: Option<Function>) -> Result<(), Trap> {
        let mut elements = self.0.elements.write().unwrap();
        let slot = elements
            .get_mut(index as usize)
            .ok_or_else(|| Trap::new(TrapKind::AccessViolation, "table index out of bounds"))?;
        *slot = function.map(|function| TableElement {
            encoding: function.ty().encoding(),
            function,
        });
        Ok(())
    }

    pub(crate) fn element(&self, index: u64) -> Result<Option<TableElement>, Trap> {
        self.0
            .elements
            .read()
            .unwrap()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Trap::new(TrapKind::AccessViolation, "table index out of bounds"))
    }
}

/// A mutable or immutable global cell.
#[derive(Clone)]
pub struct Global(pub(crate) Arc<GlobalInstance>);

pub(crate) struct GlobalInstance {
    ty: GlobalType,
    pub(crate) value: RwLock<Value>,
}

impl Global {
    pub fn new(ty: GlobalType, value: Value) -> Result<Global, Trap> {
        if value.ty() != ty.value_type {
            return Err(Trap::new(
                TrapKind::InvalidArgument,
                format!("global of type {} initialized with {}", ty.value_type, value.ty()),
            ));
        }
        Ok(Global(Arc::new(GlobalInstance {
            ty,
            value: RwLock::new(value),
        })))
    }

    pub fn ty(&self) -> GlobalType {
        self.0.ty
    }

    pub fn get(&self) -> Value {
        *self.0.value.read().unwrap()
    }

    /// Host-side set: rejects immutable globals and type mismatches. The
    /// interpreter performs validated sets directly on the cell.
    pub fn set(&self, value: Value) -> Result<(), Trap> {
        if !self.0.ty.is_mutable {
            return Err(Trap::new(TrapKind::InvalidArgument, "set of an immutable global"));
        }
        if value.ty() != self.0.ty.value_type {
            return Err(Trap::new(TrapKind::InvalidArgument, "global type mismatch"));
        }
        *self.0.value.write().unwrap() = value;
        Ok(())
    }
}

/// An exception tag: a fresh identity per instantiation, carrying its
/// parameter types.
#[derive(Clone)]
pub struct Tag(pub(crate) Arc<TagInstance>);

pub(crate) struct TagInstance {
    ty: ExceptionType,
}

impl Tag {
    pub fn new(ty: ExceptionType) -> Tag {
        Tag(Arc::new(TagInstance { ty }))
    }

    pub fn ty(&self) -> ExceptionType {
        self.0.ty
    }

    pub(crate) fn same_identity(a: &Tag, b: &Tag) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

/// A sandboxed linear memory.
#[derive(Clone)]
pub struct Memory(pub(crate) Arc<MemoryInstance>);

impl Memory {
    pub fn new(ty: MemoryType) -> Result<Memory, Trap> {
        Ok(Memory(Arc::new(MemoryInstance::new(ty)?)))
    }

    pub fn ty(&self) -> MemoryType {
        self.0.ty()
    }

    pub fn size_pages(&self) -> u64 {
        self.0.size_pages()
    }

    pub fn grow(&self, delta_pages: u64) -> i64 {
        self.0.grow(delta_pages)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), Trap> {
        self.0.read(offset, out)
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), Trap> {
        self.0.write(offset, bytes)
    }
}

/// Any importable/exportable runtime object.
#[derive(Clone)]
pub enum Extern {
    Function(Function),
    Table(Table),
    Memory(Memory),
    Global(Global),
    Tag(Tag),
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

/// Resolves an import by `(module name, export name)`.
pub trait Resolver {
    fn resolve(&self, module: &str, name: &str) -> Option<Extern>;
}

/// A flat bag of definitions keyed by `(module, name)`.
#[derive(Default)]
pub struct Linker {
    definitions: HashMap<(String, String), Extern>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, module: &str, name: &str, value: Extern) -> &mut Self {
        self.definitions
            .insert((module.to_string(), name.to_string()), value);
        self
    }

    /// Define a host function from a native-typed closure.
    pub fn func<Params, Results>(
        &mut self,
        module: &str,
        name: &str,
        func: impl IntoHostFunc<Params, Results>,
    ) -> &mut Self {
        self.define(module, name, Extern::Function(Function::wrap(func)))
    }
}

impl Resolver for Linker {
    fn resolve(&self, module: &str, name: &str) -> Option<Extern> {
        self.definitions
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }
}

/// A thin linker that chains named sub-resolvers: the import's module
/// name picks the sub-resolver.
#[derive(Default)]
pub struct NamedLinker {
    sub_resolvers: HashMap<String, Box<dyn Resolver>>,
}

impl NamedLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: &str, resolver: impl Resolver + 'static) -> &mut Self {
        self.sub_resolvers
            .insert(module.to_string(), Box::new(resolver));
        self
    }
}

impl Resolver for NamedLinker {
    fn resolve(&self, module: &str, name: &str) -> Option<Extern> {
        self.sub_resolvers.get(module)?.resolve(module, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SizeConstraints, TypeTuple};

    #[test]
    fn table_slots_carry_signature_encodings() {
        let table = Table::new(TableType {
            element_type: crate::types::TableElementType::AnyFunc,
            is_shared: false,
            size: SizeConstraints::new(2, None),
        });
        let ty = FunctionType::new(TypeTuple::from(ValueType::I32), TypeTuple::empty());
        let func = Function::from_host(ty, |_| Ok(vec![Value::I32(9)]));
        table.set(0, Some(func)).unwrap();

        let element = table.element(0).unwrap().unwrap();
        assert_eq!(element.encoding, ty.encoding());
        assert!(table.element(1).unwrap().is_none());
        assert!(table.element(2).is_err());
    }

    #[test]
    fn globals_enforce_mutability_at_the_host_boundary() {
        let global = Global::new(
            GlobalType { value_type: ValueType::I32, is_mutable: false },
            Value::I32(3),
        )
        .unwrap();
        assert_eq!(global.get(), Value::I32(3));
        assert!(global.set(Value::I32(4)).is_err());
    }

    #[test]
    fn tags_have_per_instance_identity() {
        let ty = ExceptionType { params: TypeTuple::empty() };
        let a = Tag::new(ty);
        let b = Tag::new(ty);
        assert!(Tag::same_identity(&a, &a.clone()));
        assert!(!Tag::same_identity(&a, &b));
    }

    #[test]
    fn named_linker_routes_by_module_name() {
        let mut env = Linker::new();
        env.func("env", "three", || 3i32);
        let mut outer = NamedLinker::new();
        outer.add("env", env);
        assert!(outer.resolve("env", "three").is_some());
        assert!(outer.resolve("wasi", "three").is_none());
    }
}
