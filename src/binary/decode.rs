//! Binary module decoding.
//!
//! A single forward pass over the section stream. Sections must appear in
//! the canonical order, each non-custom section at most once; every section
//! body must be consumed exactly. Function bodies are kept as raw operator
//! bytes (plus their decoded local declarations) for the validator and
//! compiler to stream later.

use tracing::trace;

use super::{leb, Cursor, DecodeError};
use crate::features::FeatureSpec;
use crate::module::{
    DataSegment, Export, FunctionDef, GlobalDef, Import, InitializerExpression, Module,
    TableSegment, UserSection,
};
use crate::types::{
    ExceptionType, FunctionType, GlobalType, MemoryType, ObjectKind, SizeConstraints,
    TableElementType, TableType, TypeTuple, ValueType,
};

const MAGIC: [u8; 4] = [0x00, b'a', b's', b'm'];
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Section ids in the binary format.
mod section {
    pub const CUSTOM: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const TABLE: u8 = 4;
    pub const MEMORY: u8 = 5;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
    pub const START: u8 = 8;
    pub const ELEM: u8 = 9;
    pub const CODE: u8 = 10;
    pub const DATA: u8 = 11;
    pub const TAG: u8 = 13;
}

/// Monotonic rank used to enforce section order; the tag section sits
/// between memories and globals per the exception-handling layout.
fn section_rank(id: u8) -> Option<u8> {
    Some(match id {
        section::TYPE => 1,
        section::IMPORT => 2,
        section::FUNCTION => 3,
        section::TABLE => 4,
        section::MEMORY => 5,
        section::TAG => 6,
        section::GLOBAL => 7,
        section::EXPORT => 8,
        section::START => 9,
        section::ELEM => 10,
        section::CODE => 11,
        section::DATA => 12,
        _ => return None,
    })
}

/// Decode a binary module image.
///
/// Structural checks only; run the validator on the result before
/// compiling or instantiating it.
pub fn decode_module(bytes: &[u8], features: FeatureSpec) -> Result<Module, DecodeError> {
    let mut cur = Cursor::new(bytes);

    if cur.read_bytes(4).map_err(|_| DecodeError::malformed(0, "truncated magic"))? != MAGIC {
        return Err(DecodeError::malformed(0, "bad magic"));
    }
    if cur.read_bytes(4).map_err(|_| DecodeError::malformed(4, "truncated version"))? != VERSION {
        return Err(DecodeError::malformed(4, "unsupported version"));
    }

    let mut module = Module::new(features);
    // Declared function type indices, paired with bodies by the code section.
    let mut declared_functions: Vec<u32> = Vec::new();
    let mut seen_code_section = false;
    let mut last_rank = 0u8;

    while !cur.is_eof() {
        let section_start = cur.offset();
        let id = cur.read_u8()?;
        let len = leb::read_u32(&mut cur)? as usize;
        let mut body = cur.split_off(len)?;

        if let Some(rank) = section_rank(id) {
            if rank <= last_rank {
                return Err(DecodeError::malformed(section_start, "section out of order"));
            }
            last_rank = rank;
        } else if id != section::CUSTOM {
            return Err(DecodeError::malformed(section_start, "unknown section id"));
        }
        trace!(section = id, length = len, "decoding section");

        match id {
            section::CUSTOM => decode_custom_section(&mut body, &mut module)?,
            section::TYPE => decode_type_section(&mut body, &mut module)?,
            section::IMPORT => decode_import_section(&mut body, &mut module)?,
            section::FUNCTION => decode_function_section(&mut body, &mut declared_functions)?,
            section::TABLE => decode_table_section(&mut body, &mut module)?,
            section::MEMORY => decode_memory_section(&mut body, &mut module)?,
            section::TAG => decode_tag_section(&mut body, &mut module)?,
            section::GLOBAL => decode_global_section(&mut body, &mut module)?,
            section::EXPORT => decode_export_section(&mut body, &mut module)?,
            section::START => {
                module.start_function_index = Some(leb::read_u32(&mut body)?);
            }
            section::ELEM => decode_elem_section(&mut body, &mut module)?,
            section::CODE => {
                seen_code_section = true;
                decode_code_section(&mut body, &declared_functions, &mut module)?;
            }
            section::DATA => decode_data_section(&mut body, &mut module)?,
            _ => unreachable!(),
        }

        if !body.is_eof() {
            return Err(DecodeError::malformed(body.offset(), "trailing bytes in section"));
        }
    }

    if !declared_functions.is_empty() && !seen_code_section {
        return Err(DecodeError::malformed(cur.offset(), "missing code section"));
    }
    Ok(module)
}

pub(crate) fn decode_value_type(cur: &mut Cursor) -> Result<ValueType, DecodeError> {
    let offset = cur.offset();
    match cur.read_u8()? {
        0x7f => Ok(ValueType::I32),
        0x7e => Ok(ValueType::I64),
        0x7d => Ok(ValueType::F32),
        0x7c => Ok(ValueType::F64),
        0x7b => Ok(ValueType::V128),
        _ => Err(DecodeError::malformed(offset, "invalid value type")),
    }
}

fn decode_result_types(cur: &mut Cursor) -> Result<TypeTuple, DecodeError> {
    let count = leb::read_u32(cur)? as usize;
    let mut elems = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        elems.push(decode_value_type(cur)?);
    }
    Ok(TypeTuple::new(&elems))
}

fn decode_size_constraints(cur: &mut Cursor, allow_shared: bool) -> Result<(SizeConstraints, bool), DecodeError> {
    let offset = cur.offset();
    let flags = cur.read_u8()?;
    let has_max = flags & 0x01 != 0;
    let is_shared = flags & 0x02 != 0;
    if flags & !0x03 != 0 || (is_shared && (!allow_shared || !has_max)) {
        return Err(DecodeError::malformed(offset, "invalid limits flags"));
    }
    let min = leb::read_u32(cur)? as u64;
    let max = if has_max { Some(leb::read_u32(cur)? as u64) } else { None };
    Ok((SizeConstraints::new(min, max), is_shared))
}

fn decode_table_type(cur: &mut Cursor) -> Result<TableType, DecodeError> {
    let offset = cur.offset();
    if cur.read_u8()? != 0x70 {
        return Err(DecodeError::malformed(offset, "invalid table element type"));
    }
    let (size, is_shared) = decode_size_constraints(cur, true)?;
    Ok(TableType { element_type: TableElementType::AnyFunc, is_shared, size })
}

fn decode_memory_type(cur: &mut Cursor) -> Result<MemoryType, DecodeError> {
    let (size, is_shared) = decode_size_constraints(cur, true)?;
    Ok(MemoryType { is_shared, size })
}

fn decode_global_type(cur: &mut Cursor) -> Result<GlobalType, DecodeError> {
    let value_type = decode_value_type(cur)?;
    let offset = cur.offset();
    let is_mutable = match cur.read_u8()? {
        0x00 => false,
        0x01 => true,
        _ => return Err(DecodeError::malformed(offset, "invalid global mutability")),
    };
    Ok(GlobalType { value_type, is_mutable })
}

fn decode_exception_type(cur: &mut Cursor, module: &Module) -> Result<ExceptionType, DecodeError> {
    // Tag form: attribute byte (must be 0) plus a function type index whose
    // results must be empty.
    let offset = cur.offset();
    if !module.features.exception_handling {
        return Err(DecodeError::malformed(
            offset,
            "exception tags require the exception-handling feature",
        ));
    }
    if cur.read_u8()? != 0x00 {
        return Err(DecodeError::malformed(offset, "invalid tag attribute"));
    }
    let type_index = leb::read_u32(cur)?;
    let ty = module
        .types
        .get(type_index as usize)
        .ok_or(DecodeError::malformed(offset, "tag type index out of range"))?;
    if !ty.results().is_empty() {
        return Err(DecodeError::malformed(offset, "tag type must have no results"));
    }
    Ok(ExceptionType { params: ty.params() })
}

pub(crate) fn decode_initializer(cur: &mut Cursor) -> Result<InitializerExpression, DecodeError> {
    let offset = cur.offset();
    let expr = match cur.read_u8()? {
        0x41 => InitializerExpression::I32Const(leb::read_i32(cur)?),
        0x42 => InitializerExpression::I64Const(leb::read_i64(cur)?),
        0x43 => InitializerExpression::F32Const(cur.read_f32_le()?),
        0x44 => InitializerExpression::F64Const(cur.read_f64_le()?),
        0x23 => InitializerExpression::GetGlobal(leb::read_u32(cur)?),
        _ => return Err(DecodeError::malformed(offset, "invalid constant expression opcode")),
    };
    let end_offset = cur.offset();
    if cur.read_u8()? != 0x0b {
        return Err(DecodeError::malformed(end_offset, "constant expression missing end"));
    }
    Ok(expr)
}

fn decode_custom_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let name = cur.read_string()?;
    let data = cur.read_bytes(cur.remaining())?.to_vec();
    module.user_sections.push(UserSection { name, data });
    Ok(())
}

fn decode_type_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let offset = cur.offset();
        if cur.read_u8()? != 0x60 {
            return Err(DecodeError::malformed(offset, "invalid function type form"));
        }
        let params = decode_result_types(cur)?;
        let results = decode_result_types(cur)?;
        module.types.push(FunctionType::new(results, params));
    }
    Ok(())
}

fn decode_import_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let module_name = cur.read_string()?;
        let export_name = cur.read_string()?;
        let kind_offset = cur.offset();
        match cur.read_u8()? {
            0x00 => {
                let type_index = leb::read_u32(cur)?;
                module.functions.imports.push(Import { module_name, export_name, ty: type_index });
            }
            0x01 => {
                let ty = decode_table_type(cur)?;
                module.tables.imports.push(Import { module_name, export_name, ty });
            }
            0x02 => {
                let ty = decode_memory_type(cur)?;
                module.memories.imports.push(Import { module_name, export_name, ty });
            }
            0x03 => {
                let ty = decode_global_type(cur)?;
                module.globals.imports.push(Import { module_name, export_name, ty });
            }
            0x04 => {
                let ty = decode_exception_type(cur, module)?;
                module.exception_types.imports.push(Import { module_name, export_name, ty });
            }
            _ => return Err(DecodeError::malformed(kind_offset, "invalid import kind")),
        }
    }
    Ok(())
}

fn decode_function_section(cur: &mut Cursor, declared: &mut Vec<u32>) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        declared.push(leb::read_u32(cur)?);
    }
    Ok(())
}

fn decode_table_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let ty = decode_table_type(cur)?;
        module.tables.defs.push(ty);
    }
    Ok(())
}

fn decode_memory_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let ty = decode_memory_type(cur)?;
        module.memories.defs.push(ty);
    }
    Ok(())
}

fn decode_tag_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let ty = decode_exception_type(cur, module)?;
        module.exception_types.defs.push(ty);
    }
    Ok(())
}

fn decode_global_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let ty = decode_global_type(cur)?;
        let initializer = decode_initializer(cur)?;
        module.globals.defs.push(GlobalDef { ty, initializer });
    }
    Ok(())
}

fn decode_export_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let name = cur.read_string()?;
        let kind_offset = cur.offset();
        let kind = match cur.read_u8()? {
            0x00 => ObjectKind::Function,
            0x01 => ObjectKind::Table,
            0x02 => ObjectKind::Memory,
            0x03 => ObjectKind::Global,
            0x04 => ObjectKind::ExceptionType,
            _ => return Err(DecodeError::malformed(kind_offset, "invalid export kind")),
        };
        let index = leb::read_u32(cur)?;
        module.exports.push(Export { name, kind, index });
    }
    Ok(())
}

fn decode_elem_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let table_index = leb::read_u32(cur)?;
        let base_offset = decode_initializer(cur)?;
        let num_indices = leb::read_u32(cur)?;
        let mut indices = Vec::new();
        for _ in 0..num_indices {
            indices.push(leb::read_u32(cur)?);
        }
        module.table_segments.push(TableSegment { table_index, base_offset, indices });
    }
    Ok(())
}

fn decode_data_section(cur: &mut Cursor, module: &mut Module) -> Result<(), DecodeError> {
    let count = leb::read_u32(cur)?;
    for _ in 0..count {
        let memory_index = leb::read_u32(cur)?;
        let base_offset = decode_initializer(cur)?;
        let len = leb::read_u32(cur)? as usize;
        let data = cur.read_bytes(len)?.to_vec();
        module.data_segments.push(DataSegment { memory_index, base_offset, data });
    }
    Ok(())
}

/// Upper bound on declared locals per function; guards against absurd
/// local-count encodings expanding into huge allocations.
const MAX_LOCALS: u64 = 1 << 20;

fn decode_code_section(
    cur: &mut Cursor,
    declared: &[u32],
    module: &mut Module,
) -> Result<(), DecodeError> {
    let count_offset = cur.offset();
    let count = leb::read_u32(cur)? as usize;
    if count != declared.len() {
        return Err(DecodeError::malformed(
            count_offset,
            "code entry count does not match function section",
        ));
    }
    for &type_index in declared {
        let size = leb::read_u32(cur)? as usize;
        let mut body = cur.split_off(size)?;

        let num_local_runs = leb::read_u32(&mut body)?;
        let mut non_param_locals = Vec::new();
        let mut total: u64 = 0;
        for _ in 0..num_local_runs {
            let run_offset = body.offset();
            let run_len = leb::read_u32(&mut body)? as u64;
            let ty = decode_value_type(&mut body)?;
            total += run_len;
            if total > MAX_LOCALS {
                return Err(DecodeError::malformed(run_offset, "too many locals"));
            }
            non_param_locals.extend(std::iter::repeat_n(ty, run_len as usize));
        }

        let code_offset = body.offset();
        let code = body.read_bytes(body.remaining())?.to_vec();
        if code.last() != Some(&0x0b) {
            return Err(DecodeError::malformed(code_offset, "function body missing end"));
        }
        module.functions.defs.push(FunctionDef {
            type_index,
            non_param_locals,
            code,
            code_offset,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wat(source: &str) -> Vec<u8> {
        wat::parse_str(source).unwrap()
    }

    #[test]
    fn decodes_a_small_module() {
        let bytes = wat(
            r#"(module
                (memory 1)
                (global $g (mut i32) (i32.const 7))
                (func (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        );
        let module = decode_module(&bytes, FeatureSpec::default()).unwrap();
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.functions.defs.len(), 1);
        assert_eq!(module.memories.defs.len(), 1);
        assert_eq!(module.globals.defs.len(), 1);
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.exports[0].name, "add");
        assert_eq!(module.exports[0].kind, ObjectKind::Function);
        assert!(matches!(
            module.globals.defs[0].initializer,
            InitializerExpression::I32Const(7)
        ));
        // Body ends with the terminating `end` opcode.
        assert_eq!(module.functions.defs[0].code.last(), Some(&0x0b));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert!(matches!(
            decode_module(b"\0wasm\x01\0\0\0", FeatureSpec::default()),
            Err(DecodeError::Malformed { offset: 0, .. })
        ));
        assert!(matches!(
            decode_module(b"\0asm\x02\0\0\0", FeatureSpec::default()),
            Err(DecodeError::Malformed { offset: 4, .. })
        ));
    }

    #[test]
    fn rejects_out_of_order_sections() {
        // Valid header, then a memory section (5) followed by a table
        // section (4): out of order.
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.extend_from_slice(&[5, 3, 1, 0x00, 0x00]); // memory section, one entry, min=0
        bytes.extend_from_slice(&[4, 4, 1, 0x70, 0x00, 0x00]); // table section
        let err = decode_module(&bytes, FeatureSpec::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { message: "section out of order", .. }));
    }

    #[test]
    fn rejects_duplicate_sections() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.extend_from_slice(&[5, 3, 1, 0x00, 0x00]);
        bytes.extend_from_slice(&[5, 3, 1, 0x00, 0x00]);
        assert!(decode_module(&bytes, FeatureSpec::default()).is_err());
    }

    #[test]
    fn rejects_trailing_section_bytes() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        // Memory section claims 4 bytes but the entry only needs 3.
        bytes.extend_from_slice(&[5, 4, 1, 0x00, 0x00, 0xff]);
        let err = decode_module(&bytes, FeatureSpec::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { message: "trailing bytes in section", .. }));
    }

    #[test]
    fn malformed_leb_reports_offset_in_type_section() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        // Type section with an over-long LEB for the type count.
        bytes.extend_from_slice(&[1, 6, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00]);
        let err = decode_module(&bytes, FeatureSpec::default()).unwrap_err();
        assert!(matches!(err, DecodeError::LebOverlong { offset: 10 }));
    }

    #[test]
    fn preserves_user_sections() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        // Custom section "note" with payload [1, 2, 3].
        bytes.extend_from_slice(&[0, 8, 4, b'n', b'o', b't', b'e', 1, 2, 3]);
        let module = decode_module(&bytes, FeatureSpec::default()).unwrap();
        let section = module.user_section("note").unwrap();
        assert_eq!(section.data, vec![1, 2, 3]);
    }
}
