//! The in-memory module: the immutable IR produced by the decoder and
//! consumed by the validator, printer, and compiler.
//!
//! Cross-references inside a module are stored as indices, not pointers,
//! so forward references within the module need no special handling; the
//! validator and compiler resolve them against the fully built module.
//! Index spaces follow the binary format convention: imported objects come
//! first, then module definitions.

mod names;

pub use names::{get_disassembly_names, DisassemblyNames, FunctionNames};

use crate::features::FeatureSpec;
use crate::types::{
    ExceptionType, FunctionType, GlobalType, MemoryType, ObjectKind, TableType, ValueType,
};

/// One kind's index space: imports first, then definitions.
#[derive(Debug, Clone)]
pub struct IndexedObjects<Def, Type> {
    pub imports: Vec<Import<Type>>,
    pub defs: Vec<Def>,
}

impl<Def, Type> Default for IndexedObjects<Def, Type> {
    fn default() -> Self {
        Self { imports: Vec::new(), defs: Vec::new() }
    }
}

impl<Def, Type> IndexedObjects<Def, Type> {
    pub fn size(&self) -> usize {
        self.imports.len() + self.defs.len()
    }

    pub fn is_import(&self, index: u32) -> bool {
        (index as usize) < self.imports.len()
    }

    /// The definition at `index`, or `None` if `index` names an import or
    /// is out of range.
    pub fn get_def(&self, index: u32) -> Option<&Def> {
        (index as usize).checked_sub(self.imports.len()).and_then(|i| self.defs.get(i))
    }
}

#[derive(Debug, Clone)]
pub struct Import<Type> {
    pub module_name: String,
    pub export_name: String,
    pub ty: Type,
}

/// A defined function: its signature index plus the locals and the raw
/// operator bytes of its body, decoded lazily by the validator and
/// compiler.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub type_index: u32,
    pub non_param_locals: Vec<ValueType>,
    /// Operator stream, terminated by `end`.
    pub code: Vec<u8>,
    /// Absolute offset of `code[0]` in the module image, for diagnostics.
    pub code_offset: usize,
}

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub ty: GlobalType,
    pub initializer: InitializerExpression,
}

/// A constant expression evaluated at instantiation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitializerExpression {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    /// Reads an imported immutable global.
    GetGlobal(u32),
}

/// An element segment: function indices copied into a table at
/// instantiation.
#[derive(Debug, Clone)]
pub struct TableSegment {
    pub table_index: u32,
    pub base_offset: InitializerExpression,
    pub indices: Vec<u32>,
}

/// A data segment: bytes copied into a memory at instantiation.
#[derive(Debug, Clone)]
pub struct DataSegment {
    pub memory_index: u32,
    pub base_offset: InitializerExpression,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ObjectKind,
    pub index: u32,
}

/// An uninterpreted custom section, preserved for round-tripping. The
/// `name` and `linking` sections are decoded on demand by their consumers.
#[derive(Debug, Clone)]
pub struct UserSection {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub features: FeatureSpec,
    pub types: Vec<FunctionType>,
    /// Function imports carry a type index into `types`.
    pub functions: IndexedObjects<FunctionDef, u32>,
    pub tables: IndexedObjects<TableType, TableType>,
    pub memories: IndexedObjects<MemoryType, MemoryType>,
    pub globals: IndexedObjects<GlobalDef, GlobalType>,
    pub exception_types: IndexedObjects<ExceptionType, ExceptionType>,
    pub exports: Vec<Export>,
    pub data_segments: Vec<DataSegment>,
    pub table_segments: Vec<TableSegment>,
    pub user_sections: Vec<UserSection>,
    pub start_function_index: Option<u32>,
}

impl Module {
    pub fn new(features: FeatureSpec) -> Self {
        Self {
            features,
            types: Vec::new(),
            functions: IndexedObjects::default(),
            tables: IndexedObjects::default(),
            memories: IndexedObjects::default(),
            globals: IndexedObjects::default(),
            exception_types: IndexedObjects::default(),
            exports: Vec::new(),
            data_segments: Vec::new(),
            table_segments: Vec::new(),
            user_sections: Vec::new(),
            start_function_index: None,
        }
    }

    /// The signature of the function at `index` (import or definition).
    pub fn function_type(&self, index: u32) -> Option<FunctionType> {
        let type_index = if self.functions.is_import(index) {
            self.functions.imports[index as usize].ty
        } else {
            self.functions.get_def(index)?.type_index
        };
        self.types.get(type_index as usize).copied()
    }

    pub fn table_type(&self, index: u32) -> Option<TableType> {
        if self.tables.is_import(index) {
            Some(self.tables.imports[index as usize].ty)
        } else {
            self.tables.get_def(index).copied()
        }
    }

    pub fn memory_type(&self, index: u32) -> Option<MemoryType> {
        if self.memories.is_import(index) {
            Some(self.memories.imports[index as usize].ty)
        } else {
            self.memories.get_def(index).copied()
        }
    }

    pub fn global_type(&self, index: u32) -> Option<GlobalType> {
        if self.globals.is_import(index) {
            Some(self.globals.imports[index as usize].ty)
        } else {
            self.globals.get_def(index).map(|def| def.ty)
        }
    }

    pub fn exception_type(&self, index: u32) -> Option<ExceptionType> {
        if self.exception_types.is_import(index) {
            Some(self.exception_types.imports[index as usize].ty)
        } else {
            self.exception_types.get_def(index).copied()
        }
    }

    /// The user section with the given name, if present.
    pub fn user_section(&self, name: &str) -> Option<&UserSection> {
        self.user_sections.iter().find(|section| section.name == name)
    }

    /// Resolve a block type to its `(params, results)` signature.
    pub fn block_signature(
        &self,
        ty: crate::operators::BlockType,
    ) -> Option<(crate::types::TypeTuple, crate::types::TypeTuple)> {
        use crate::types::TypeTuple;
        match ty {
            crate::operators::BlockType::Empty => Some((TypeTuple::empty(), TypeTuple::empty())),
            crate::operators::BlockType::Value(value) => {
                Some((TypeTuple::empty(), TypeTuple::from(value)))
            }
            crate::operators::BlockType::Func(index) => {
                let func_type = self.types.get(index as usize)?;
                Some((func_type.params(), func_type.results()))
            }
        }
    }
}
