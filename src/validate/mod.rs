//! Module validation.
//!
//! Two layers: per-definition checks over the module record (imports,
//! limits, initializers, segments, exports), then a streaming
//! stack-polymorphic type check over each function body. Function bodies
//! share only read-only module metadata, so body validation is trivially
//! parallelisable; it runs sequentially here.
//!
//! The body checker keeps two stacks: an operand stack of [`ValueType`]
//! where `Any` stands for a polymorphic slot conjured in unreachable code,
//! and a control stack of frames recording each enclosing block's label
//! and end types. After an unconditional transfer (`br`, `return`,
//! `throw`, `unreachable`) the current frame turns polymorphic: any
//! operand demanded by later operators materialises as `Any` until the
//! frame's `end` or `else`.

use thiserror::Error;
use tracing::debug;

use crate::module::{FunctionDef, InitializerExpression, Module};
use crate::operators::{BlockType, Operator, OperatorReader};
use crate::types::{FunctionType, ObjectKind, SizeConstraints, TypeTuple, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TypeMismatch,
    IndexOutOfRange,
    InvalidInitializer,
    DuplicateExportName,
    InvalidLimits,
    FeatureRequired,
    ControlStructure,
    Alignment,
    Module,
}

#[derive(Debug, Error)]
#[error("validation error{}{}: {message}",
    .function_index.map(|i| format!(" in function {i}")).unwrap_or_default(),
    .offset.map(|o| format!(" at offset {o}")).unwrap_or_default())]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub function_index: Option<u32>,
    pub offset: Option<usize>,
    pub message: String,
}

impl ValidationError {
    fn module(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            function_index: None,
            offset: None,
            message: message.into(),
        }
    }
}

type Result<T = ()> = std::result::Result<T, ValidationError>;

/// Validate every definition and function body in the module.
pub fn validate_module(module: &Module) -> Result {
    validate_types(module)?;
    validate_imports(module)?;
    validate_function_declarations(module)?;
    validate_tables(module)?;
    validate_memories(module)?;
    validate_globals(module)?;
    validate_exports(module)?;
    validate_start_function(module)?;
    validate_elem_segments(module)?;
    validate_data_segments(module)?;
    for (def_index, def) in module.functions.defs.iter().enumerate() {
        let func_index = (module.functions.imports.len() + def_index) as u32;
        validate_function_body(module, func_index, def)?;
    }
    debug!(
        functions = module.functions.defs.len(),
        "module validated"
    );
    Ok(())
}

fn validate_types(module: &Module) -> Result {
    for ty in &module.types {
        if ty.results().len() > 1 && !module.features.multi_value {
            return Err(ValidationError::module(
                ErrorKind::FeatureRequired,
                "multiple results require the multi-value feature",
            ));
        }
    }
    Ok(())
}

fn validate_imports(module: &Module) -> Result {
    for import in &module.functions.imports {
        if module.types.get(import.ty as usize).is_none() {
            return Err(ValidationError::module(
                ErrorKind::IndexOutOfRange,
                format!("function import type index {} out of range", import.ty),
            ));
        }
    }
    Ok(())
}

fn validate_function_declarations(module: &Module) -> Result {
    for def in &module.functions.defs {
        if module.types.get(def.type_index as usize).is_none() {
            return Err(ValidationError::module(
                ErrorKind::IndexOutOfRange,
                format!("function type index {} out of range", def.type_index),
            ));
        }
    }
    Ok(())
}

fn validate_size_constraints(size: &SizeConstraints, is_shared: bool, what: &str) -> Result {
    if size.min > size.max {
        return Err(ValidationError::module(
            ErrorKind::InvalidLimits,
            format!("{what} minimum size exceeds maximum"),
        ));
    }
    // Shared objects are visible to multiple threads, whose reservation
    // must be fixed up front; unbounded shared sizes are not allocatable.
    if is_shared && !size.is_bounded() {
        return Err(ValidationError::module(
            ErrorKind::InvalidLimits,
            format!("shared {what} must declare a maximum size"),
        ));
    }
    Ok(())
}

fn validate_tables(module: &Module) -> Result {
    let count = module.tables.size();
    if count > 1 && !module.features.reference_types {
        return Err(ValidationError::module(
            ErrorKind::FeatureRequired,
            "multiple tables require the reference-types feature",
        ));
    }
    for import in &module.tables.imports {
        validate_size_constraints(&import.ty.size, import.ty.is_shared, "table")?;
        validate_shared_needs_threads(module, import.ty.is_shared, "table")?;
    }
    for ty in &module.tables.defs {
        validate_size_constraints(&ty.size, ty.is_shared, "table")?;
        validate_shared_needs_threads(module, ty.is_shared, "table")?;
    }
    Ok(())
}

/// Hard cap on a 32-bit memory: 65536 pages of 64 KiB.
const MAX_MEMORY_PAGES: u64 = 1 << 16;

fn validate_memories(module: &Module) -> Result {
    let count = module.memories.size();
    if count > 1 && !module.features.multi_memory {
        return Err(ValidationError::module(
            ErrorKind::FeatureRequired,
            "multiple memories require the multi-memory feature",
        ));
    }
    let all_types = module
        .memories
        .imports
        .iter()
        .map(|import| import.ty)
        .chain(module.memories.defs.iter().copied());
    for ty in all_types {
        validate_size_constraints(&ty.size, ty.is_shared, "memory")?;
        validate_shared_needs_threads(module, ty.is_shared, "memory")?;
        if ty.size.min > MAX_MEMORY_PAGES || (ty.size.is_bounded() && ty.size.max > MAX_MEMORY_PAGES) {
            return Err(ValidationError::module(
                ErrorKind::InvalidLimits,
                "memory size exceeds the 65536 page limit",
            ));
        }
    }
    Ok(())
}

fn validate_shared_needs_threads(module: &Module, is_shared: bool, what: &str) -> Result {
    if is_shared && !module.features.threads {
        return Err(ValidationError::module(
            ErrorKind::FeatureRequired,
            format!("shared {what} requires the threads feature"),
        ));
    }
    Ok(())
}

/// Type an initializer expression: constants carry their own type, and
/// `get_global` may only read an imported immutable global.
fn initializer_type(module: &Module, expr: &InitializerExpression) -> Result<ValueType> {
    match *expr {
        InitializerExpression::I32Const(_) => Ok(ValueType::I32),
        InitializerExpression::I64Const(_) => Ok(ValueType::I64),
        InitializerExpression::F32Const(_) => Ok(ValueType::F32),
        InitializerExpression::F64Const(_) => Ok(ValueType::F64),
        InitializerExpression::GetGlobal(index) => {
            let num_imports = module.globals.imports.len() as u32;
            if index >= num_imports {
                return Err(ValidationError::module(
                    ErrorKind::InvalidInitializer,
                    "initializer get_global must reference an imported global",
                ));
            }
            let ty = module.globals.imports[index as usize].ty;
            if ty.is_mutable {
                return Err(ValidationError::module(
                    ErrorKind::InvalidInitializer,
                    "initializer get_global must reference an immutable global",
                ));
            }
            Ok(ty.value_type)
        }
    }
}

fn validate_initializer(
    module: &Module,
    expr: &InitializerExpression,
    expected: ValueType,
    what: &str,
) -> Result {
    let actual = initializer_type(module, expr)?;
    if actual != expected {
        return Err(ValidationError::module(
            ErrorKind::InvalidInitializer,
            format!("{what} initializer has type {actual}, expected {expected}"),
        ));
    }
    Ok(())
}

fn validate_globals(module: &Module) -> Result {
    for def in &module.globals.defs {
        validate_initializer(module, &def.initializer, def.ty.value_type, "global")?;
    }
    Ok(())
}

fn validate_exports(module: &Module) -> Result {
    let mut names: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for export in &module.exports {
        if !names.insert(&export.name) {
            return Err(ValidationError::module(
                ErrorKind::DuplicateExportName,
                format!("duplicate export name {:?}", export.name),
            ));
        }
        let in_range = match export.kind {
            ObjectKind::Function => (export.index as usize) < module.functions.size(),
            ObjectKind::Table => (export.index as usize) < module.tables.size(),
            ObjectKind::Memory => (export.index as usize) < module.memories.size(),
            ObjectKind::Global => (export.index as usize) < module.globals.size(),
            ObjectKind::ExceptionType => (export.index as usize) < module.exception_types.size(),
            ObjectKind::Invalid => false,
        };
        if !in_range {
            return Err(ValidationError::module(
                ErrorKind::IndexOutOfRange,
                format!("export {:?} index out of range", export.name),
            ));
        }
    }
    Ok(())
}

fn validate_start_function(module: &Module) -> Result {
    if let Some(index) = module.start_function_index {
        let ty = module.function_type(index).ok_or_else(|| {
            ValidationError::module(ErrorKind::IndexOutOfRange, "start function index out of range")
        })?;
        if !ty.params().is_empty() || !ty.results().is_empty() {
            return Err(ValidationError::module(
                ErrorKind::TypeMismatch,
                "start function must take and return nothing",
            ));
        }
    }
    Ok(())
}

fn validate_elem_segments(module: &Module) -> Result {
    for segment in &module.table_segments {
        if module.table_type(segment.table_index).is_none() {
            return Err(ValidationError::module(
                ErrorKind::IndexOutOfRange,
                "element segment table index out of range",
            ));
        }
        validate_initializer(module, &segment.base_offset, ValueType::I32, "element segment")?;
        for &func_index in &segment.indices {
            if module.function_type(func_index).is_none() {
                return Err(ValidationError::module(
                    ErrorKind::IndexOutOfRange,
                    format!("element segment function index {func_index} out of range"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_data_segments(module: &Module) -> Result {
    for segment in &module.data_segments {
        if module.memory_type(segment.memory_index).is_none() {
            return Err(ValidationError::module(
                ErrorKind::IndexOutOfRange,
                "data segment memory index out of range",
            ));
        }
        validate_initializer(module, &segment.base_offset, ValueType::I32, "data segment")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Function body validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    Function,
    Block,
    Loop,
    IfThen,
    IfElse,
    Try,
    Catch,
}

struct ControlFrame {
    kind: ControlKind,
    /// Types a branch to this frame's label carries.
    label_types: TypeTuple,
    /// Types on the stack when the frame ends.
    end_types: TypeTuple,
    /// Block parameter types, re-pushed on `else`/`catch` entry.
    param_types: TypeTuple,
    stack_height: usize,
    unreachable: bool,
}

struct BodyValidator<'m> {
    module: &'m Module,
    func_index: u32,
    locals: Vec<ValueType>,
    stack: Vec<ValueType>,
    control: Vec<ControlFrame>,
    /// Offset of the operator currently being validated.
    offset: usize,
}

/// Validate one function body against its declared signature.
pub fn validate_function_body(module: &Module, func_index: u32, def: &FunctionDef) -> Result {
    let func_type = module.types[def.type_index as usize];

    let mut locals: Vec<ValueType> = func_type.params().to_vec();
    locals.extend_from_slice(&def.non_param_locals);

    let mut validator = BodyValidator {
        module,
        func_index,
        locals,
        stack: Vec::new(),
        control: Vec::new(),
        offset: def.code_offset,
    };
    validator.control.push(ControlFrame {
        kind: ControlKind::Function,
        label_types: func_type.results(),
        end_types: func_type.results(),
        param_types: TypeTuple::empty(),
        stack_height: 0,
        unreachable: false,
    });

    let cursor = crate::binary::Cursor::new(&def.code);
    let mut reader = OperatorReader::new(cursor, module.features);
    while !validator.control.is_empty() {
        validator.offset = def.code_offset + reader.offset();
        if reader.is_eof() {
            return Err(validator.error(ErrorKind::ControlStructure, "body truncated before end"));
        }
        let op = reader.read().map_err(|e| ValidationError {
            kind: ErrorKind::Module,
            function_index: Some(func_index),
            offset: Some(def.code_offset + e.offset()),
            message: e.to_string(),
        })?;
        validator.visit(&op)?;
    }
    if !reader.is_eof() {
        return Err(validator.error(ErrorKind::ControlStructure, "operators after final end"));
    }
    Ok(())
}

impl<'m> BodyValidator<'m> {
    fn error(&self, kind: ErrorKind, message: impl Into<String>) -> ValidationError {
        ValidationError {
            kind,
            function_index: Some(self.func_index),
            offset: Some(self.offset),
            message: message.into(),
        }
    }

    fn frame(&self) -> &ControlFrame {
        self.control.last().expect("control stack is never empty while validating")
    }

    fn push_operand(&mut self, ty: ValueType) {
        self.stack.push(ty);
    }

    /// Pop an operand of any type; in unreachable code, conjure `Any`.
    fn pop_operand(&mut self) -> Result<ValueType> {
        let frame = self.frame();
        if self.stack.len() == frame.stack_height {
            if frame.unreachable {
                return Ok(ValueType::Any);
            }
            return Err(self.error(ErrorKind::TypeMismatch, "operand stack underflow"));
        }
        Ok(self.stack.pop().expect("stack height checked above"))
    }

    fn pop_expected(&mut self, expected: ValueType) -> Result<ValueType> {
        let actual = self.pop_operand()?;
        if actual != expected && actual != ValueType::Any {
            return Err(self.error(
                ErrorKind::TypeMismatch,
                format!("expected {expected} on the stack, found {actual}"),
            ));
        }
        Ok(actual)
    }

    fn pop_tuple(&mut self, types: TypeTuple) -> Result {
        for &ty in types.iter().rev() {
            self.pop_expected(ty)?;
        }
        Ok(())
    }

    fn push_tuple(&mut self, types: TypeTuple) {
        for &ty in types.iter() {
            self.push_operand(ty);
        }
    }

    fn set_unreachable(&mut self) {
        let frame = self.control.last_mut().expect("control stack non-empty");
        self.stack.truncate(frame.stack_height);
        frame.unreachable = true;
    }

    fn push_frame(&mut self, kind: ControlKind, ty: BlockType) -> Result {
        let (params, results) = self.block_signature(ty)?;
        self.pop_tuple(params)?;
        let label_types = if kind == ControlKind::Loop { params } else { results };
        self.control.push(ControlFrame {
            kind,
            label_types,
            end_types: results,
            param_types: params,
            stack_height: self.stack.len(),
            unreachable: false,
        });
        self.push_tuple(params);
        Ok(())
    }

    fn block_signature(&self, ty: BlockType) -> Result<(TypeTuple, TypeTuple)> {
        if let BlockType::Func(index) = ty {
            if !self.module.features.multi_value {
                return Err(self.error(
                    ErrorKind::FeatureRequired,
                    "block type indices require the multi-value feature",
                ));
            }
            if self.module.types.get(index as usize).is_none() {
                return Err(self.error(ErrorKind::IndexOutOfRange, "block type index out of range"));
            }
        }
        Ok(self.module.block_signature(ty).expect("index checked above"))
    }

    /// Check the stack against the current frame's end types without
    /// popping the frame; used by `end`, `else`, and `catch`.
    fn check_frame_end(&mut self) -> Result {
        let end_types = self.frame().end_types;
        let stack_height = self.frame().stack_height;
        self.pop_tuple(end_types)?;
        if self.stack.len() != stack_height {
            return Err(self.error(
                ErrorKind::TypeMismatch,
                format!(
                    "block leaves {} extra operand(s) on the stack",
                    self.stack.len() - stack_height
                ),
            ));
        }
        Ok(())
    }

    fn branch_target(&self, depth: u32) -> Result<&ControlFrame> {
        self.control
            .len()
            .checked_sub(1 + depth as usize)
            .map(|i| &self.control[i])
            .ok_or_else(|| self.error(ErrorKind::ControlStructure, "branch depth out of range"))
    }

    fn local_type(&self, index: u32) -> Result<ValueType> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| self.error(ErrorKind::IndexOutOfRange, "local index out of range"))
    }

    fn visit(&mut self, op: &Operator) -> Result {
        // Operators with a context-free signature take the generic path.
        if let Some((params, results)) = op.simple_signature() {
            if let Some(access) = op.memory_access() {
                self.check_memory_access(&access)?;
            }
            for &ty in params.iter().rev() {
                self.pop_expected(ty)?;
            }
            for &ty in results {
                self.push_operand(ty);
            }
            return Ok(());
        }

        match op {
            Operator::Unreachable => self.set_unreachable(),
            Operator::Nop => {}

            Operator::Block { ty } => self.push_frame(ControlKind::Block, *ty)?,
            Operator::Loop { ty } => self.push_frame(ControlKind::Loop, *ty)?,
            Operator::If { ty } => {
                self.pop_expected(ValueType::I32)?;
                self.push_frame(ControlKind::IfThen, *ty)?;
            }
            Operator::Else => {
                if self.frame().kind != ControlKind::IfThen {
                    return Err(self.error(ErrorKind::ControlStructure, "else outside if"));
                }
                self.check_frame_end()?;
                let frame = self.control.last_mut().expect("control stack non-empty");
                frame.kind = ControlKind::IfElse;
                frame.unreachable = false;
                let params = frame.param_types;
                self.push_tuple(params);
            }
            Operator::Try { ty } => self.push_frame(ControlKind::Try, *ty)?,
            Operator::Catch { tag_index } => {
                if self.frame().kind != ControlKind::Try {
                    return Err(self.error(ErrorKind::ControlStructure, "catch outside try"));
                }
                let exception_type =
                    self.module.exception_type(*tag_index).ok_or_else(|| {
                        self.error(ErrorKind::IndexOutOfRange, "catch tag index out of range")
                    })?;
                self.check_frame_end()?;
                let frame = self.control.last_mut().expect("control stack non-empty");
                frame.kind = ControlKind::Catch;
                frame.unreachable = false;
                self.push_tuple(exception_type.params);
            }
            Operator::Throw { tag_index } => {
                let exception_type =
                    self.module.exception_type(*tag_index).ok_or_else(|| {
                        self.error(ErrorKind::IndexOutOfRange, "throw tag index out of range")
                    })?;
                self.pop_tuple(exception_type.params)?;
                self.set_unreachable();
            }
            Operator::Rethrow => {
                if !self.control.iter().any(|frame| frame.kind == ControlKind::Catch) {
                    return Err(self.error(ErrorKind::ControlStructure, "rethrow outside catch"));
                }
                self.set_unreachable();
            }
            Operator::End => {
                // An `if` without `else` must produce its params as results.
                if self.frame().kind == ControlKind::IfThen
                    && self.frame().param_types != self.frame().end_types
                {
                    return Err(self.error(
                        ErrorKind::TypeMismatch,
                        "if without else must have matching parameter and result types",
                    ));
                }
                self.check_frame_end()?;
                let frame = self.control.pop().expect("control stack non-empty");
                if !self.control.is_empty() {
                    self.push_tuple(frame.end_types);
                }
            }

            Operator::Br { depth } => {
                let label_types = self.branch_target(*depth)?.label_types;
                self.pop_tuple(label_types)?;
                self.set_unreachable();
            }
            Operator::BrIf { depth } => {
                self.pop_expected(ValueType::I32)?;
                let label_types = self.branch_target(*depth)?.label_types;
                self.pop_tuple(label_types)?;
                self.push_tuple(label_types);
            }
            Operator::BrTable { targets, default } => {
                self.pop_expected(ValueType::I32)?;
                let default_types = self.branch_target(*default)?.label_types;
                for &target in targets.iter() {
                    let target_types = self.branch_target(target)?.label_types;
                    if target_types != default_types {
                        return Err(self.error(
                            ErrorKind::TypeMismatch,
                            "br_table targets have mismatched label types",
                        ));
                    }
                }
                self.pop_tuple(default_types)?;
                self.set_unreachable();
            }
            Operator::Return => {
                let result_types = self.control[0].end_types;
                self.pop_tuple(result_types)?;
                self.set_unreachable();
            }

            Operator::Call { func_index } => {
                let ty = self.module.function_type(*func_index).ok_or_else(|| {
                    self.error(ErrorKind::IndexOutOfRange, "call function index out of range")
                })?;
                self.pop_tuple(ty.params())?;
                self.push_tuple(ty.results());
            }
            Operator::CallIndirect { type_index, table_index } => {
                if self.module.table_type(*table_index).is_none() {
                    return Err(
                        self.error(ErrorKind::IndexOutOfRange, "call_indirect table out of range")
                    );
                }
                let ty: FunctionType =
                    *self.module.types.get(*type_index as usize).ok_or_else(|| {
                        self.error(ErrorKind::IndexOutOfRange, "call_indirect type out of range")
                    })?;
                self.pop_expected(ValueType::I32)?;
                self.pop_tuple(ty.params())?;
                self.push_tuple(ty.results());
            }

            Operator::Drop => {
                self.pop_operand()?;
            }
            Operator::Select => {
                self.pop_expected(ValueType::I32)?;
                let first = self.pop_operand()?;
                let second = self.pop_operand()?;
                let result = match (first, second) {
                    (ValueType::Any, other) | (other, ValueType::Any) => other,
                    (a, b) if a == b => a,
                    (a, b) => {
                        return Err(self.error(
                            ErrorKind::TypeMismatch,
                            format!("select operands disagree: {a} vs {b}"),
                        ));
                    }
                };
                self.push_operand(result);
            }

            Operator::LocalGet { index } => {
                let ty = self.local_type(*index)?;
                self.push_operand(ty);
            }
            Operator::LocalSet { index } => {
                let ty = self.local_type(*index)?;
                self.pop_expected(ty)?;
            }
            Operator::LocalTee { index } => {
                let ty = self.local_type(*index)?;
                self.pop_expected(ty)?;
                self.push_operand(ty);
            }
            Operator::GlobalGet { index } => {
                let ty = self.module.global_type(*index).ok_or_else(|| {
                    self.error(ErrorKind::IndexOutOfRange, "global index out of range")
                })?;
                self.push_operand(ty.value_type);
            }
            Operator::GlobalSet { index } => {
                let ty = self.module.global_type(*index).ok_or_else(|| {
                    self.error(ErrorKind::IndexOutOfRange, "global index out of range")
                })?;
                if !ty.is_mutable {
                    return Err(
                        self.error(ErrorKind::TypeMismatch, "global.set on an immutable global")
                    );
                }
                self.pop_expected(ty.value_type)?;
            }

            Operator::MemorySize { memory_index } => {
                self.check_memory_index(*memory_index)?;
                self.push_operand(ValueType::I32);
            }
            Operator::MemoryGrow { memory_index } => {
                self.check_memory_index(*memory_index)?;
                self.pop_expected(ValueType::I32)?;
                self.push_operand(ValueType::I32);
            }

            _ => unreachable!("operator {op} has a simple signature"),
        }
        Ok(())
    }

    fn check_memory_index(&self, index: u32) -> Result {
        if index != 0 && !self.module.features.multi_memory {
            return Err(self.error(
                ErrorKind::FeatureRequired,
                "non-zero memory index requires the multi-memory feature",
            ));
        }
        if self.module.memory_type(index).is_none() {
            return Err(self.error(ErrorKind::IndexOutOfRange, "memory index out of range"));
        }
        Ok(())
    }

    fn check_memory_access(&self, access: &crate::operators::MemoryAccess) -> Result {
        self.check_memory_index(0)?;
        if access.requires_exact_align {
            if access.imm.align_log2 != access.natural_align_log2 {
                return Err(self.error(
                    ErrorKind::Alignment,
                    "atomic access alignment must equal the natural alignment",
                ));
            }
        } else if access.imm.align_log2 > access.natural_align_log2 {
            return Err(self.error(
                ErrorKind::Alignment,
                "alignment must not exceed the natural alignment",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_module;
    use crate::features::FeatureSpec;

    fn validate(source: &str) -> Result {
        validate_with(source, FeatureSpec::default())
    }

    fn validate_with(source: &str, features: FeatureSpec) -> Result {
        let bytes = wat::parse_str(source).unwrap();
        let module = decode_module(&bytes, features).unwrap();
        validate_module(&module)
    }

    #[test]
    fn accepts_a_simple_function() {
        validate(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_stack_underflow_at_end() {
        let err = validate(
            r#"(module (func (result i32)
                i32.const 1
                drop))"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert_eq!(err.function_index, Some(0));
        assert!(err.offset.is_some());
    }

    #[test]
    fn rejects_wrong_operand_type() {
        let err = validate(
            r#"(module (func (result i32)
                i64.const 1
                i32.eqz))"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
    }

    #[test]
    fn unreachable_code_is_stack_polymorphic() {
        // After `unreachable`, i32.add conjures operands and the block
        // still ends with the declared result.
        validate(
            r#"(module (func (result i32)
                unreachable
                i32.add))"#,
        )
        .unwrap();
        validate(
            r#"(module (func (result f64)
                (block (result f64)
                    br 0
                    i32.add
                    drop
                    f64.const 0)))"#,
        )
        .unwrap();
    }

    #[test]
    fn values_do_not_leak_out_of_unreachable_blocks() {
        // The i64 conjured after `br` must not satisfy the outer i32.
        let err = validate(
            r#"(module (func (result i32)
                (block (result i64)
                    br 0
                    i64.const 0)
                i32.eqz))"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn branch_depth_checked() {
        let err = validate(r#"(module (func br 2))"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ControlStructure);
    }

    #[test]
    fn loop_labels_use_params() {
        // A backward branch to a loop carries the loop params (none here),
        // not its results.
        validate(
            r#"(module (func
                (loop
                    br 0)))"#,
        )
        .unwrap();
    }

    #[test]
    fn if_without_else_must_balance() {
        let err = validate(
            r#"(module (func (result i32)
                i32.const 1
                (if (result i32) (then i32.const 2))))"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_misaligned_hint() {
        let err = validate(
            r#"(module (memory 1) (func (result i32)
                i32.const 0
                i32.load align=8))"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Alignment);
    }

    #[test]
    fn memory_ops_require_a_memory() {
        let err = validate
            (r#"(module (func (result i32) i32.const 0 i32.load))"#)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfRange);
    }

    #[test]
    fn rejects_duplicate_export_names() {
        let err = validate(
            r#"(module
                (func $a)
                (func $b)
                (export "x" (func $a))
                (export "x" (func $b)))"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateExportName);
    }

    #[test]
    fn rejects_set_of_immutable_global() {
        let err = validate(
            r#"(module
                (global $g i32 (i32.const 0))
                (func i32.const 1 global.set $g))"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
    }

    #[test]
    fn initializer_must_match_global_type() {
        let bytes = wat::parse_str(
            r#"(module (global $g i64 (i64.const 1)))"#,
        )
        .unwrap();
        let mut module = decode_module(&bytes, FeatureSpec::default()).unwrap();
        module.globals.defs[0].initializer = crate::module::InitializerExpression::I32Const(1);
        let err = validate_module(&module).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInitializer);
    }

    #[test]
    fn start_function_must_be_nullary() {
        let err = validate(
            r#"(module
                (func $f (param i32))
                (start $f))"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn shared_memory_requires_threads() {
        let err = validate_with(
            r#"(module (memory 1 1 shared))"#,
            FeatureSpec::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FeatureRequired);

        let mut features = FeatureSpec::default();
        features.threads = true;
        validate_with(r#"(module (memory 1 1 shared))"#, features).unwrap();
    }

    #[test]
    fn call_indirect_validates_against_declared_type() {
        validate(
            r#"(module
                (type $t (func (result i32)))
                (table 1 anyfunc)
                (func (result i32)
                    i32.const 0
                    call_indirect (type $t)))"#,
        )
        .unwrap();
        let err = validate(
            r#"(module
                (type $t (func (param i64) (result i32)))
                (table 1 anyfunc)
                (func (result i32)
                    i32.const 0
                    call_indirect (type $t)))"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn exception_handlers_type_check() {
        // (module (tag (param i32)) (func (result i32)
        //     try (result i32) i32.const 1 catch 0 end))
        // Assembled by hand; the text toolchain's legacy exception syntax
        // is not relied upon.
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        // Type section: (func (param i32)) and (func (result i32)).
        bytes.extend_from_slice(&[1, 9, 2, 0x60, 1, 0x7f, 0, 0x60, 0, 1, 0x7f]);
        // Function section: one function of type 1.
        bytes.extend_from_slice(&[3, 2, 1, 1]);
        // Tag section: one tag with attribute 0 and type 0.
        bytes.extend_from_slice(&[13, 3, 1, 0x00, 0x00]);
        // Code: try (result i32); i32.const 1; catch 0; end; end.
        bytes.extend_from_slice(&[10, 11, 1, 9, 0, 0x06, 0x7f, 0x41, 0x01, 0x07, 0x00, 0x0b, 0x0b]);

        let mut features = FeatureSpec::default();
        features.exception_handling = true;
        let module = decode_module(&bytes, features).unwrap();
        validate_module(&module).unwrap();

        // The catch body's i32 param satisfies the try's result, so a
        // throw-y variant with a mismatched tag index must fail instead.
        let mut bad = bytes.clone();
        let catch_tag = bad.len() - 3;
        bad[catch_tag] = 7; // catch references tag 7, which does not exist
        let module = decode_module(&bad, features).unwrap();
        assert!(validate_module(&module).is_err());
    }
}
