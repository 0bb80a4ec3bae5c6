//! Binary module encoding: the inverse of [`decode_module`].
//!
//! `decode(encode(m))` yields a module equal to `m` except that user
//! sections, which may originally have been interleaved anywhere, are
//! re-emitted after the known sections in their original relative order.
//!
//! [`decode_module`]: super::decode_module

use crate::module::{InitializerExpression, Module};
use crate::types::{
    FunctionType, GlobalType, MemoryType, SizeConstraints, TableType, TypeTuple, ValueType,
};

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_u32(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_i32(&mut self, value: i32) {
        self.write_i64(value as i64);
    }

    fn write_i64(&mut self, mut value: i64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    /// Emit a section: id byte, LEB length, body.
    fn write_section(&mut self, id: u8, body: Writer) {
        self.write_u8(id);
        self.write_u32(body.buf.len() as u32);
        self.write_bytes(&body.buf);
    }
}

fn write_value_type(w: &mut Writer, ty: ValueType) {
    w.write_u8(match ty {
        ValueType::I32 => 0x7f,
        ValueType::I64 => 0x7e,
        ValueType::F32 => 0x7d,
        ValueType::F64 => 0x7c,
        ValueType::V128 => 0x7b,
        ValueType::Any => unreachable!("Any never appears in a serialized module"),
    });
}

fn write_result_types(w: &mut Writer, types: TypeTuple) {
    w.write_u32(types.len() as u32);
    for &ty in types.iter() {
        write_value_type(w, ty);
    }
}

fn write_size_constraints(w: &mut Writer, size: &SizeConstraints, is_shared: bool) {
    let mut flags = 0u8;
    if size.is_bounded() {
        flags |= 0x01;
    }
    if is_shared {
        flags |= 0x02;
    }
    w.write_u8(flags);
    w.write_u32(size.min as u32);
    if size.is_bounded() {
        w.write_u32(size.max as u32);
    }
}

fn write_table_type(w: &mut Writer, ty: &TableType) {
    w.write_u8(0x70);
    write_size_constraints(w, &ty.size, ty.is_shared);
}

fn write_memory_type(w: &mut Writer, ty: &MemoryType) {
    write_size_constraints(w, &ty.size, ty.is_shared);
}

fn write_global_type(w: &mut Writer, ty: &GlobalType) {
    write_value_type(w, ty.value_type);
    w.write_u8(if ty.is_mutable { 0x01 } else { 0x00 });
}

fn write_initializer(w: &mut Writer, expr: &InitializerExpression) {
    match *expr {
        InitializerExpression::I32Const(value) => {
            w.write_u8(0x41);
            w.write_i32(value);
        }
        InitializerExpression::I64Const(value) => {
            w.write_u8(0x42);
            w.write_i64(value);
        }
        InitializerExpression::F32Const(value) => {
            w.write_u8(0x43);
            w.write_bytes(&value.to_bits().to_le_bytes());
        }
        InitializerExpression::F64Const(value) => {
            w.write_u8(0x44);
            w.write_bytes(&value.to_bits().to_le_bytes());
        }
        InitializerExpression::GetGlobal(index) => {
            w.write_u8(0x23);
            w.write_u32(index);
        }
    }
    w.write_u8(0x0b);
}

/// Encode a module to the binary format.
pub fn encode_module(module: &Module) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_bytes(b"\0asm");
    w.write_bytes(&[0x01, 0x00, 0x00, 0x00]);

    // Exception types are serialized as references to a function type with
    // no results; synthesise any signature the type section is missing.
    let mut types = module.types.clone();
    let tag_type_index = |types: &mut Vec<FunctionType>, params: TypeTuple| -> u32 {
        let ty = FunctionType::new(TypeTuple::empty(), params);
        match types.iter().position(|&t| t == ty) {
            Some(index) => index as u32,
            None => {
                types.push(ty);
                (types.len() - 1) as u32
            }
        }
    };
    let import_tag_types: Vec<u32> = module
        .exception_types
        .imports
        .iter()
        .map(|import| tag_type_index(&mut types, import.ty.params))
        .collect();
    let def_tag_types: Vec<u32> = module
        .exception_types
        .defs
        .iter()
        .map(|def| tag_type_index(&mut types, def.params))
        .collect();

    if !types.is_empty() {
        let mut body = Writer::new();
        body.write_u32(types.len() as u32);
        for ty in &types {
            body.write_u8(0x60);
            write_result_types(&mut body, ty.params());
            write_result_types(&mut body, ty.results());
        }
        w.write_section(1, body);
    }

    let num_imports = module.functions.imports.len()
        + module.tables.imports.len()
        + module.memories.imports.len()
        + module.globals.imports.len()
        + module.exception_types.imports.len();
    if num_imports != 0 {
        let mut body = Writer::new();
        body.write_u32(num_imports as u32);
        for import in &module.functions.imports {
            body.write_string(&import.module_name);
            body.write_string(&import.export_name);
            body.write_u8(0x00);
            body.write_u32(import.ty);
        }
        for import in &module.tables.imports {
            body.write_string(&import.module_name);
            body.write_string(&import.export_name);
            body.write_u8(0x01);
            write_table_type(&mut body, &import.ty);
        }
        for import in &module.memories.imports {
            body.write_string(&import.module_name);
            body.write_string(&import.export_name);
            body.write_u8(0x02);
            write_memory_type(&mut body, &import.ty);
        }
        for import in &module.globals.imports {
            body.write_string(&import.module_name);
            body.write_string(&import.export_name);
            body.write_u8(0x03);
            write_global_type(&mut body, &import.ty);
        }
        for (import, &type_index) in module.exception_types.imports.iter().zip(&import_tag_types) {
            body.write_string(&import.module_name);
            body.write_string(&import.export_name);
            body.write_u8(0x04);
            body.write_u8(0x00);
            body.write_u32(type_index);
        }
        w.write_section(2, body);
    }

    if !module.functions.defs.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.functions.defs.len() as u32);
        for def in &module.functions.defs {
            body.write_u32(def.type_index);
        }
        w.write_section(3, body);
    }

    if !module.tables.defs.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.tables.defs.len() as u32);
        for ty in &module.tables.defs {
            write_table_type(&mut body, ty);
        }
        w.write_section(4, body);
    }

    if !module.memories.defs.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.memories.defs.len() as u32);
        for ty in &module.memories.defs {
            write_memory_type(&mut body, ty);
        }
        w.write_section(5, body);
    }

    if !module.exception_types.defs.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.exception_types.defs.len() as u32);
        for &type_index in &def_tag_types {
            body.write_u8(0x00);
            body.write_u32(type_index);
        }
        w.write_section(13, body);
    }

    if !module.globals.defs.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.globals.defs.len() as u32);
        for def in &module.globals.defs {
            write_global_type(&mut body, &def.ty);
            write_initializer(&mut body, &def.initializer);
        }
        w.write_section(6, body);
    }

    if !module.exports.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.exports.len() as u32);
        for export in &module.exports {
            body.write_string(&export.name);
            body.write_u8(match export.kind {
                crate::types::ObjectKind::Function => 0x00,
                crate::types::ObjectKind::Table => 0x01,
                crate::types::ObjectKind::Memory => 0x02,
                crate::types::ObjectKind::Global => 0x03,
                crate::types::ObjectKind::ExceptionType => 0x04,
                crate::types::ObjectKind::Invalid => unreachable!("invalid export kind"),
            });
            body.write_u32(export.index);
        }
        w.write_section(7, body);
    }

    if let Some(start) = module.start_function_index {
        let mut body = Writer::new();
        body.write_u32(start);
        w.write_section(8, body);
    }

    if !module.table_segments.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.table_segments.len() as u32);
        for segment in &module.table_segments {
            body.write_u32(segment.table_index);
            write_initializer(&mut body, &segment.base_offset);
            body.write_u32(segment.indices.len() as u32);
            for &index in &segment.indices {
                body.write_u32(index);
            }
        }
        w.write_section(9, body);
    }

    if !module.functions.defs.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.functions.defs.len() as u32);
        for def in &module.functions.defs {
            let mut entry = Writer::new();
            // Run-length encode the local declarations.
            let mut runs: Vec<(u32, ValueType)> = Vec::new();
            for &ty in &def.non_param_locals {
                match runs.last_mut() {
                    Some((count, last)) if *last == ty => *count += 1,
                    _ => runs.push((1, ty)),
                }
            }
            entry.write_u32(runs.len() as u32);
            for (count, ty) in runs {
                entry.write_u32(count);
                write_value_type(&mut entry, ty);
            }
            entry.write_bytes(&def.code);
            body.write_u32(entry.buf.len() as u32);
            body.write_bytes(&entry.buf);
        }
        w.write_section(10, body);
    }

    if !module.data_segments.is_empty() {
        let mut body = Writer::new();
        body.write_u32(module.data_segments.len() as u32);
        for segment in &module.data_segments {
            body.write_u32(segment.memory_index);
            write_initializer(&mut body, &segment.base_offset);
            body.write_u32(segment.data.len() as u32);
            body.write_bytes(&segment.data);
        }
        w.write_section(11, body);
    }

    // User sections go last, preserving their relative order.
    for section in &module.user_sections {
        let mut body = Writer::new();
        body.write_string(&section.name);
        body.write_bytes(&section.data);
        w.write_section(0, body);
    }

    w.buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_module;
    use crate::features::FeatureSpec;

    fn round_trip(source: &str, features: FeatureSpec) -> (Module, Module) {
        let bytes = wat::parse_str(source).unwrap();
        let module = decode_module(&bytes, features).unwrap();
        let encoded = encode_module(&module);
        let reparsed = decode_module(&encoded, features).unwrap();
        (module, reparsed)
    }

    #[test]
    fn encode_decode_round_trips() {
        let (a, b) = round_trip(
            r#"(module
                (import "env" "mul" (func $mul (param i32 i32) (result i32)))
                (memory 1 4)
                (table 2 anyfunc)
                (global $g i32 (i32.const -5))
                (elem (i32.const 0) $f $f)
                (data (i32.const 8) "hi")
                (start $f)
                (func $f
                    i32.const 1
                    i32.const 2
                    call $mul
                    drop)
                (export "f" (func $f))
                (export "mem" (memory 0)))"#,
            FeatureSpec::default(),
        );
        assert_eq!(a.types.len(), b.types.len());
        assert_eq!(a.functions.imports.len(), b.functions.imports.len());
        assert_eq!(a.functions.defs.len(), b.functions.defs.len());
        assert_eq!(a.functions.defs[0].code, b.functions.defs[0].code);
        assert_eq!(a.exports.len(), b.exports.len());
        assert_eq!(a.exports[0].name, b.exports[0].name);
        assert_eq!(a.start_function_index, b.start_function_index);
        assert_eq!(a.data_segments[0].data, b.data_segments[0].data);
        assert_eq!(a.table_segments[0].indices, b.table_segments[0].indices);
        assert_eq!(a.memories.defs, b.memories.defs);
        assert_eq!(a.tables.defs, b.tables.defs);
        assert!(matches!(
            b.globals.defs[0].initializer,
            InitializerExpression::I32Const(-5)
        ));
    }

    #[test]
    fn signed_leb_encoding_round_trips_extremes() {
        let mut w = Writer::new();
        w.write_i32(i32::MIN);
        w.write_i32(-1);
        w.write_i32(i32::MAX);
        let mut cur = crate::binary::Cursor::new(&w.buf);
        assert_eq!(crate::binary::leb::read_i32(&mut cur).unwrap(), i32::MIN);
        assert_eq!(crate::binary::leb::read_i32(&mut cur).unwrap(), -1);
        assert_eq!(crate::binary::leb::read_i32(&mut cur).unwrap(), i32::MAX);
    }
}
