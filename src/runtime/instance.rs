//! Instantiation: resolving imports, allocating runtime state, and
//! publishing exports.
//!
//! The protocol is all-or-nothing. Imports are resolved and type-checked
//! first; defined memories, tables, globals, and tags are allocated next;
//! every data and element segment is bounds-checked *before* the first
//! byte is copied, so a failing instantiation never leaves a partial
//! write observable through other instances; finally exports are
//! published and the start function (if any) runs, with a trap there
//! reported as instantiation failure and the instance discarded.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::compile::{compile_module, CompiledFunction, CompiledModule};
use crate::module::{InitializerExpression, Module};
use crate::runtime::memory::PAGE_BYTES;
use crate::runtime::{
    Compartment, CompartmentInner, Extern, Function, FunctionInstance, Global, InstantiationError,
    LinkError, Memory, Resolver, Table, TableElement, Tag, Trap, TrapKind, Value,
};
use crate::types::{Encoding, MemoryType, ObjectKind, TableType};

pub(crate) struct InstanceInner {
    pub(crate) compartment: Weak<CompartmentInner>,
    pub(crate) module: Arc<Module>,
    /// Signature encodings for `call_indirect`, indexed by type index.
    pub(crate) type_encodings: Vec<Encoding>,
    pub(crate) functions: Vec<Function>,
    pub(crate) tables: Vec<Table>,
    pub(crate) memories: Vec<Memory>,
    pub(crate) globals: Vec<Global>,
    pub(crate) tags: Vec<Tag>,
    pub(crate) exports: HashMap<String, Extern>,
}

/// An instantiated module: imports resolved, state allocated, exports
/// published. Bound to its compartment for life; the handle keeps the
/// compartment alive, while internal back-references stay weak so that
/// dropping every handle tears the whole compartment down.
#[derive(Clone)]
pub struct Instance {
    pub(crate) inner: Arc<InstanceInner>,
    compartment: Compartment,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Instance {
    /// The immutable module this instance was created from.
    pub fn module(&self) -> &Module {
        &self.inner.module
    }

    pub fn export(&self, name: &str) -> Option<Extern> {
        self.inner.exports.get(name).cloned()
    }

    pub fn get_function(&self, name: &str) -> Option<Function> {
        match self.export(name)? {
            Extern::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn get_memory(&self, name: &str) -> Option<Memory> {
        match self.export(name)? {
            Extern::Memory(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn get_table(&self, name: &str) -> Option<Table> {
        match self.export(name)? {
            Extern::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn get_global(&self, name: &str) -> Option<Global> {
        match self.export(name)? {
            Extern::Global(global) => Some(global),
            _ => None,
        }
    }

    pub fn get_tag(&self, name: &str) -> Option<Tag> {
        match self.export(name)? {
            Extern::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    /// The compartment this instance is bound to.
    pub fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    /// Invoke an exported function by name.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let function = self.get_function(name).ok_or_else(|| {
            Trap::new(TrapKind::InvalidArgument, format!("no exported function {name:?}"))
        })?;
        function.invoke(args)
    }
}

fn eval_initializer(expr: &InitializerExpression, globals: &[Global]) -> Value {
    match *expr {
        InitializerExpression::I32Const(value) => Value::I32(value),
        InitializerExpression::I64Const(value) => Value::I64(value),
        InitializerExpression::F32Const(value) => Value::F32(value),
        InitializerExpression::F64Const(value) => Value::F64(value),
        // Validation restricts this to an imported immutable global.
        InitializerExpression::GetGlobal(index) => globals[index as usize].get(),
    }
}

fn mismatch(module: &str, name: &str, expected: impl ToString, found: impl ToString) -> LinkError {
    LinkError::Mismatch {
        module: module.to_string(),
        name: name.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Instantiate a validated module inside a compartment.
pub fn instantiate(
    compartment: &Compartment,
    module: &Module,
    resolver: &impl Resolver,
) -> Result<Instance, InstantiationError> {
    let resolve = |module_name: &str, export_name: &str| -> Result<Extern, LinkError> {
        resolver
            .resolve(module_name, export_name)
            .ok_or_else(|| LinkError::Missing {
                module: module_name.to_string(),
                name: export_name.to_string(),
            })
    };

    // 1. Resolve and type-check every import. Function, global, and tag
    // imports match exactly; table and memory imports accept any provided
    // type whose limits are a subset of the declared ones.
    let mut functions: Vec<Function> = Vec::with_capacity(module.functions.size());
    for import in &module.functions.imports {
        let expected = module.types[import.ty as usize];
        match resolve(&import.module_name, &import.export_name)? {
            Extern::Function(function) if function.ty() == expected => functions.push(function),
            Extern::Function(function) => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("func {expected}"),
                    format!("func {}", function.ty()),
                )
                .into());
            }
            _ => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("func {expected}"),
                    "a non-function object",
                )
                .into());
            }
        }
    }

    let mut tables: Vec<Table> = Vec::with_capacity(module.tables.size());
    for import in &module.tables.imports {
        match resolve(&import.module_name, &import.export_name)? {
            Extern::Table(table) if TableType::is_subset(&import.ty, &table.ty()) => {
                tables.push(table);
            }
            Extern::Table(table) => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("table {}", import.ty),
                    format!("table {}", table.ty()),
                )
                .into());
            }
            _ => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("table {}", import.ty),
                    "a non-table object",
                )
                .into());
            }
        }
    }

    let mut memories: Vec<Memory> = Vec::with_capacity(module.memories.size());
    for import in &module.memories.imports {
        match resolve(&import.module_name, &import.export_name)? {
            Extern::Memory(memory) if MemoryType::is_subset(&import.ty, &memory.ty()) => {
                memories.push(memory);
            }
            Extern::Memory(memory) => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("memory {}", import.ty),
                    format!("memory {}", memory.ty()),
                )
                .into());
            }
            _ => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("memory {}", import.ty),
                    "a non-memory object",
                )
                .into());
            }
        }
    }

    let mut globals: Vec<Global> = Vec::with_capacity(module.globals.size());
    for import in &module.globals.imports {
        match resolve(&import.module_name, &import.export_name)? {
            // Global matching is strict equality; mutability weakening is
            // not a subtype relation here.
            Extern::Global(global) if global.ty() == import.ty => globals.push(global),
            Extern::Global(global) => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    import.ty,
                    global.ty(),
                )
                .into());
            }
            _ => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    import.ty,
                    "a non-global object",
                )
                .into());
            }
        }
    }

    let mut tags: Vec<Tag> = Vec::with_capacity(module.exception_types.size());
    for import in &module.exception_types.imports {
        match resolve(&import.module_name, &import.export_name)? {
            Extern::Tag(tag) if tag.ty() == import.ty => tags.push(tag),
            _ => {
                return Err(mismatch(
                    &import.module_name,
                    &import.export_name,
                    format!("tag {}", import.ty.params),
                    "a tag of a different type",
                )
                .into());
            }
        }
    }

    // 2. Allocate defined tables and memories.
    for ty in &module.tables.defs {
        tables.push(Table::new(*ty));
    }
    for ty in &module.memories.defs {
        let memory = Memory::new(*ty).map_err(|_| InstantiationError::OutOfMemory)?;
        memories.push(memory);
    }

    // 3. Allocate defined globals, evaluating initializers against the
    // already-resolved imports.
    for def in &module.globals.defs {
        let value = eval_initializer(&def.initializer, &globals);
        let global =
            Global::new(def.ty, value).map_err(|_| InstantiationError::OutOfMemory)?;
        globals.push(global);
    }

    // 5. Exception tags get a fresh identity per instance.
    for ty in &module.exception_types.defs {
        tags.push(Tag::new(*ty));
    }

    // 4a. Bounds-check every segment before copying anything, so a
    // failing instantiation has no observable side effects.
    let mut elem_bases: Vec<u64> = Vec::with_capacity(module.table_segments.len());
    for segment in &module.table_segments {
        let base = eval_initializer(&segment.base_offset, &globals).unwrap_i32() as u32 as u64;
        let table = &tables[segment.table_index as usize];
        if base + segment.indices.len() as u64 > table.size() {
            return Err(InstantiationError::ElemSegmentOutOfBounds);
        }
        elem_bases.push(base);
    }
    let mut data_bases: Vec<u64> = Vec::with_capacity(module.data_segments.len());
    for segment in &module.data_segments {
        let base = eval_initializer(&segment.base_offset, &globals).unwrap_i32() as u32 as u64;
        let memory = &memories[segment.memory_index as usize];
        if base + segment.data.len() as u64 > memory.size_pages() * PAGE_BYTES {
            return Err(InstantiationError::DataSegmentOutOfBounds);
        }
        data_bases.push(base);
    }

    // Compile once per instantiation; bodies are shared by reference with
    // every function handle.
    let compiled: CompiledModule = compile_module(module);

    let module = Arc::new(module.clone());
    let type_encodings: Vec<Encoding> = module.types.iter().map(|ty| ty.encoding()).collect();

    // 6. Build the instance and publish exports. Defined functions hold a
    // weak back-reference to their instance, created cyclically.
    let num_function_imports = module.functions.imports.len();
    let inner = Arc::new_cyclic(|weak: &Weak<InstanceInner>| {
        for (def_index, def) in module.functions.defs.iter().enumerate() {
            let code: Arc<CompiledFunction> = compiled.functions[def_index].clone();
            functions.push(Function(Arc::new(FunctionInstance::Wasm {
                ty: module.types[def.type_index as usize],
                instance: weak.clone(),
                code,
                function_index: (num_function_imports + def_index) as u32,
            })));
        }

        let mut exports = HashMap::new();
        for export in &module.exports {
            let value = match export.kind {
                ObjectKind::Function => Extern::Function(functions[export.index as usize].clone()),
                ObjectKind::Table => Extern::Table(tables[export.index as usize].clone()),
                ObjectKind::Memory => Extern::Memory(memories[export.index as usize].clone()),
                ObjectKind::Global => Extern::Global(globals[export.index as usize].clone()),
                ObjectKind::ExceptionType => Extern::Tag(tags[export.index as usize].clone()),
                ObjectKind::Invalid => unreachable!("validated module"),
            };
            exports.insert(export.name.clone(), value);
        }

        InstanceInner {
            compartment: Arc::downgrade(&compartment.inner),
            module: module.clone(),
            type_encodings,
            functions: std::mem::take(&mut functions),
            tables: std::mem::take(&mut tables),
            memories: std::mem::take(&mut memories),
            globals: std::mem::take(&mut globals),
            tags: std::mem::take(&mut tags),
            exports,
        }
    });

    // 4b. Copy segments; bounds were verified above.
    for (segment, &base) in module.table_segments.iter().zip(&elem_bases) {
        let table = &inner.tables[segment.table_index as usize];
        let mut elements = table.0.elements.write().unwrap();
        for (i, &func_index) in segment.indices.iter().enumerate() {
            let function = inner.functions[func_index as usize].clone();
            elements[base as usize + i] = Some(TableElement {
                encoding: function.ty().encoding(),
                function,
            });
        }
    }
    for (segment, &base) in module.data_segments.iter().zip(&data_bases) {
        let memory = &inner.memories[segment.memory_index as usize];
        memory
            .0
            .write(base, &segment.data)
            .expect("segment bounds were checked");
    }

    // Register memory reservations so guest entries in this compartment
    // recover faults in them as traps. Do this before the start function
    // runs; roll it back if the start function fails.
    let regions_before = {
        let mut regions = compartment.inner.memory_regions.lock().unwrap();
        let before = regions.len();
        regions.extend(inner.memories.iter().map(|memory| memory.0.guard_region()));
        before
    };

    // 7. Run the start function; a trap is an instantiation failure and
    // the instance is discarded.
    if let Some(start_index) = module.start_function_index {
        let start = inner.functions[start_index as usize].clone();
        if let Err(trap) = start.invoke(&[]) {
            compartment
                .inner
                .memory_regions
                .lock()
                .unwrap()
                .truncate(regions_before);
            return Err(InstantiationError::StartTrap(trap));
        }
    }

    compartment.inner.instances.lock().unwrap().push(inner.clone());
    debug!(
        functions = inner.functions.len(),
        memories = inner.memories.len(),
        exports = inner.exports.len(),
        "module instantiated"
    );
    Ok(Instance { inner, compartment: compartment.clone() })
}
