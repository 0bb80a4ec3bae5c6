//! Rendering a module back to the S-expression text format.
//!
//! Layout is decoupled from generation: printers emit opaque INDENT/DEDENT
//! marker characters as they traverse the module, and a second pass expands
//! the markers into newline indentation. Names come from the `name` user
//! section where present and are synthesised otherwise; a [`NameScope`]
//! guarantees uniqueness within each namespace.
//!
//! Function bodies are disassembled one operator per line with a parallel
//! control stack so branches print their target labels and each `end`
//! carries an `;; $label` comment. The `linking` user section is
//! disassembled into a comment block; if that sub-decode fails the failure
//! degrades to a diagnostic comment and printing continues.

use std::collections::{HashMap, HashSet};

use crate::binary::{leb, Cursor};
use crate::module::{
    get_disassembly_names, InitializerExpression, Module, UserSection,
};
use crate::operators::{BlockType, Operator, OperatorReader};
use crate::types::{GlobalType, SizeConstraints, TypeTuple};

/// Private-use markers absorbed by [`expand_indentation`].
const INDENT: char = '\u{e000}';
const DEDENT: char = '\u{e001}';

const SPACES_PER_LEVEL: usize = 2;

/// Print a module in text form.
pub fn print_module(module: &Module) -> String {
    let mut ctx = PrintContext::new(module);
    ctx.print_module();
    expand_indentation(ctx.out)
}

/// Expand INDENT/DEDENT markers into post-newline spaces.
fn expand_indentation(input: String) -> String {
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;
    for c in input.chars() {
        match c {
            INDENT => depth += 1,
            DEDENT => depth = depth.saturating_sub(1),
            '\n' => {
                out.push('\n');
                out.extend(std::iter::repeat_n(' ', depth * SPACES_PER_LEVEL));
            }
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn f32_to_text(value: f32) -> String {
    if value.is_nan() {
        let sign = if value.is_sign_negative() { "-" } else { "" };
        format!("{sign}nan:0x{:x}", value.to_bits() & 0x7f_ffff)
    } else if value.is_infinite() {
        if value < 0.0 { "-inf".to_string() } else { "inf".to_string() }
    } else {
        format!("{value}")
    }
}

pub(crate) fn f64_to_text(value: f64) -> String {
    if value.is_nan() {
        let sign = if value.is_sign_negative() { "-" } else { "" };
        format!("{sign}nan:0x{:x}", value.to_bits() & 0xf_ffff_ffff_ffff)
    } else if value.is_infinite() {
        if value < 0.0 { "-inf".to_string() } else { "inf".to_string() }
    } else {
        format!("{value}")
    }
}

/// Escape a string for a quoted literal: backslash, quote, newline, and
/// anything non-printable as two hex digits.
fn escape_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\{byte:02x}")),
        }
    }
    out
}

/// Keep only characters legal in a text-format identifier.
fn sanitize_id(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "!#$%&'*+-./:<=>?@\\^_`|~".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Assigns unique `$`-sigiled identifiers: a free name is used as-is, a
/// duplicate or empty name gets the first free numeric suffix.
struct NameScope {
    taken: HashSet<String>,
    dup_counts: HashMap<String, usize>,
}

impl NameScope {
    fn new() -> Self {
        Self { taken: HashSet::new(), dup_counts: HashMap::new() }
    }

    fn map(&mut self, name: &str, fallback: &str) -> String {
        let (base, sep) = if name.is_empty() {
            (fallback.to_string(), "")
        } else {
            (sanitize_id(name), "_")
        };
        if !name.is_empty() && self.taken.insert(base.clone()) {
            return format!("${base}");
        }
        let counter = self.dup_counts.entry(base.clone()).or_insert(0);
        loop {
            let candidate = format!("{base}{sep}{counter}");
            *counter += 1;
            if self.taken.insert(candidate.clone()) {
                return format!("${candidate}");
            }
        }
    }
}

struct FunctionLabels {
    name: String,
    locals: Vec<String>,
}

struct PrintContext<'m> {
    module: &'m Module,
    out: String,
    type_names: Vec<String>,
    function_names: Vec<FunctionLabels>,
    table_names: Vec<String>,
    memory_names: Vec<String>,
    global_names: Vec<String>,
    tag_names: Vec<String>,
}

impl<'m> PrintContext<'m> {
    fn new(module: &'m Module) -> Self {
        let raw = get_disassembly_names(module);
        let mut scope = NameScope::new();

        let type_names = raw
            .types
            .iter()
            .map(|name| scope.map(name, "type"))
            .collect();
        let table_names = raw
            .tables
            .iter()
            .map(|name| scope.map(name, "table"))
            .collect();
        let memory_names = raw
            .memories
            .iter()
            .map(|name| scope.map(name, "memory"))
            .collect();
        let global_names = raw
            .globals
            .iter()
            .map(|name| scope.map(name, "global"))
            .collect();
        let tag_names = (0..module.exception_types.size())
            .map(|_| scope.map("", "tag"))
            .collect();
        let function_names = raw
            .functions
            .iter()
            .map(|function| {
                let name = scope.map(&function.name, "func");
                let mut local_scope = NameScope::new();
                let locals = function
                    .locals
                    .iter()
                    .map(|local| local_scope.map(local, "local"))
                    .collect();
                FunctionLabels { name, locals }
            })
            .collect();

        Self {
            module,
            out: String::new(),
            type_names,
            function_names,
            table_names,
            memory_names,
            global_names,
            tag_names,
        }
    }

    fn open(&mut self, tag: &str) {
        self.out.push('(');
        self.out.push_str(tag);
        self.out.push(INDENT);
    }

    fn close(&mut self) {
        self.out.push(DEDENT);
        self.out.push(')');
    }

    fn newline(&mut self) {
        self.out.push('\n');
    }

    fn print_module(&mut self) {
        self.open("module");

        for index in 0..self.module.types.len() {
            let ty = self.module.types[index];
            self.newline();
            self.out
                .push_str(&format!("(type {} (func", self.type_names[index]));
            self.print_function_signature(ty.params(), ty.results());
            self.out.push_str("))");
        }

        self.print_imports();
        self.print_tables();
        self.print_memories();
        self.print_tags();
        self.print_globals();
        self.print_exports();

        if let Some(start) = self.module.start_function_index {
            self.newline();
            let name = self.function_names[start as usize].name.clone();
            self.out.push_str(&format!("(start {name})"));
        }

        self.print_elem_segments();
        self.print_data_segments();
        self.print_functions();
        self.print_user_sections();

        self.close();
        self.newline();
    }

    fn print_function_signature(&mut self, params: TypeTuple, results: TypeTuple) {
        if !params.is_empty() {
            self.out.push_str(" (param");
            for &ty in params.iter() {
                self.out.push_str(&format!(" {ty}"));
            }
            self.out.push(')');
        }
        if !results.is_empty() {
            self.out.push_str(" (result");
            for &ty in results.iter() {
                self.out.push_str(&format!(" {ty}"));
            }
            self.out.push(')');
        }
    }

    fn print_size(&mut self, size: &SizeConstraints) {
        self.out.push_str(&format!(" {}", size.min));
        if size.is_bounded() {
            self.out.push_str(&format!(" {}", size.max));
        }
    }

    fn print_global_type(&mut self, ty: &GlobalType) {
        if ty.is_mutable {
            self.out.push_str(&format!(" (mut {})", ty.value_type));
        } else {
            self.out.push_str(&format!(" {}", ty.value_type));
        }
    }

    fn print_imports(&mut self) {
        let module = self.module;
        for (index, import) in module.functions.imports.iter().enumerate() {
            self.newline();
            self.out.push_str(&format!(
                "(import \"{}\" \"{}\" (func {} (type {})))",
                escape_string(import.module_name.as_bytes()),
                escape_string(import.export_name.as_bytes()),
                self.function_names[index].name,
                self.type_names[import.ty as usize],
            ));
        }
        for (index, import) in module.tables.imports.iter().enumerate() {
            self.newline();
            self.out.push_str(&format!(
                "(import \"{}\" \"{}\" (table {}",
                escape_string(import.module_name.as_bytes()),
                escape_string(import.export_name.as_bytes()),
                self.table_names[index],
            ));
            self.print_size(&import.ty.size);
            if import.ty.is_shared {
                self.out.push_str(" shared");
            }
            self.out.push_str(" anyfunc))");
        }
        for (index, import) in module.memories.imports.iter().enumerate() {
            self.newline();
            self.out.push_str(&format!(
                "(import \"{}\" \"{}\" (memory {}",
                escape_string(import.module_name.as_bytes()),
                escape_string(import.export_name.as_bytes()),
                self.memory_names[index],
            ));
            self.print_size(&import.ty.size);
            if import.ty.is_shared {
                self.out.push_str(" shared");
            }
            self.out.push_str("))");
        }
        for (index, import) in module.globals.imports.iter().enumerate() {
            self.newline();
            self.out.push_str(&format!(
                "(import \"{}\" \"{}\" (global {}",
                escape_string(import.module_name.as_bytes()),
                escape_string(import.export_name.as_bytes()),
                self.global_names[index],
            ));
            self.print_global_type(&import.ty);
            self.out.push_str("))");
        }
        for (index, import) in module.exception_types.imports.iter().enumerate() {
            self.newline();
            self.out.push_str(&format!(
                "(import \"{}\" \"{}\" (tag {}",
                escape_string(import.module_name.as_bytes()),
                escape_string(import.export_name.as_bytes()),
                self.tag_names[index],
            ));
            self.print_function_signature(import.ty.params, TypeTuple::empty());
            self.out.push_str("))");
        }
    }

    fn print_tables(&mut self) {
        for (def_index, ty) in self.module.tables.defs.iter().enumerate() {
            let index = self.module.tables.imports.len() + def_index;
            self.newline();
            self.out.push_str(&format!("(table {}", self.table_names[index]));
            self.print_size(&ty.size);
            if ty.is_shared {
                self.out.push_str(" shared");
            }
            self.out.push_str(" anyfunc)");
        }
    }

    fn print_memories(&mut self) {
        for (def_index, ty) in self.module.memories.defs.iter().enumerate() {
            let index = self.module.memories.imports.len() + def_index;
            self.newline();
            self.out.push_str(&format!("(memory {}", self.memory_names[index]));
            self.print_size(&ty.size);
            if ty.is_shared {
                self.out.push_str(" shared");
            }
            self.out.push(')');
        }
    }

    fn print_tags(&mut self) {
        for (def_index, ty) in self.module.exception_types.defs.iter().enumerate() {
            let index = self.module.exception_types.imports.len() + def_index;
            self.newline();
            self.out.push_str(&format!("(tag {}", self.tag_names[index]));
            self.print_function_signature(ty.params, TypeTuple::empty());
            self.out.push(')');
        }
    }

    fn print_globals(&mut self) {
        for (def_index, def) in self.module.globals.defs.iter().enumerate() {
            let index = self.module.globals.imports.len() + def_index;
            self.newline();
            self.out.push_str(&format!("(global {}", self.global_names[index]));
            self.print_global_type(&def.ty);
            self.out.push(' ');
            self.print_initializer(&def.initializer);
            self.out.push(')');
        }
    }

    fn print_initializer(&mut self, expr: &InitializerExpression) {
        let text = match *expr {
            InitializerExpression::I32Const(value) => format!("(i32.const {value})"),
            InitializerExpression::I64Const(value) => format!("(i64.const {value})"),
            InitializerExpression::F32Const(value) => format!("(f32.const {})", f32_to_text(value)),
            InitializerExpression::F64Const(value) => format!("(f64.const {})", f64_to_text(value)),
            InitializerExpression::GetGlobal(index) => {
                format!("(global.get {})", self.global_names[index as usize])
            }
        };
        self.out.push_str(&text);
    }

    fn print_exports(&mut self) {
        use crate::types::ObjectKind;
        for export in &self.module.exports {
            self.newline();
            let target = match export.kind {
                ObjectKind::Function => {
                    format!("func {}", self.function_names[export.index as usize].name)
                }
                ObjectKind::Table => format!("table {}", self.table_names[export.index as usize]),
                ObjectKind::Memory => {
                    format!("memory {}", self.memory_names[export.index as usize])
                }
                ObjectKind::Global => {
                    format!("global {}", self.global_names[export.index as usize])
                }
                ObjectKind::ExceptionType => {
                    format!("tag {}", self.tag_names[export.index as usize])
                }
                ObjectKind::Invalid => "invalid".to_string(),
            };
            self.out.push_str(&format!(
                "(export \"{}\" ({target}))",
                escape_string(export.name.as_bytes())
            ));
        }
    }

    fn print_elem_segments(&mut self) {
        for segment in &self.module.table_segments {
            self.newline();
            self.out.push_str("(elem ");
            if segment.table_index != 0 {
                self.out.push_str(&format!("(table {}) ", segment.table_index));
            }
            self.print_initializer(&segment.base_offset);
            if segment.table_index != 0 {
                self.out.push_str(" func");
            }
            for &func_index in &segment.indices {
                let name = self.function_names[func_index as usize].name.clone();
                self.out.push_str(&format!(" {name}"));
            }
            self.out.push(')');
        }
    }

    fn print_data_segments(&mut self) {
        for segment in &self.module.data_segments {
            self.newline();
            self.out.push_str("(data ");
            if segment.memory_index != 0 {
                self.out.push_str(&format!("(memory {}) ", segment.memory_index));
            }
            self.print_initializer(&segment.base_offset);
            self.out
                .push_str(&format!(" \"{}\")", escape_string(&segment.data)));
        }
    }

    fn print_functions(&mut self) {
        for def_index in 0..self.module.functions.defs.len() {
            let index = self.module.functions.imports.len() + def_index;
            self.newline();
            self.print_function(index, def_index);
        }
    }

    fn print_function(&mut self, index: usize, def_index: usize) {
        let def = &self.module.functions.defs[def_index];
        let ty = self.module.types[def.type_index as usize];
        let num_params = ty.params().len();

        let header = {
            let labels = &self.function_names[index];
            let mut header = format!(
                "func {} (type {})",
                labels.name, self.type_names[def.type_index as usize]
            );
            for (i, &param) in ty.params().iter().enumerate() {
                header.push_str(&format!(" (param {} {param})", labels.locals[i]));
            }
            if !ty.results().is_empty() {
                header.push_str(" (result");
                for &result in ty.results().iter() {
                    header.push_str(&format!(" {result}"));
                }
                header.push(')');
            }
            header
        };
        self.open(&header);

        for (i, &local) in def.non_param_locals.iter().enumerate() {
            self.newline();
            let name = self.function_names[index].locals[num_params + i].clone();
            self.out.push_str(&format!("(local {name} {local})"));
        }

        self.print_function_body(index, def_index);
        self.close();
    }

    fn print_function_body(&mut self, index: usize, def_index: usize) {
        let def = &self.module.functions.defs[def_index];
        let mut reader = OperatorReader::new(Cursor::new(&def.code), self.module.features);

        // One label slot per open control structure; `None` is the function
        // frame, branch targets to it print numerically.
        let mut labels: Vec<Option<String>> = vec![None];
        let mut label_scope = NameScope::new();

        while !labels.is_empty() {
            if reader.is_eof() {
                self.newline();
                self.out.push_str(";; error: body truncated");
                break;
            }
            let op = match reader.read() {
                Ok(op) => op,
                Err(err) => {
                    self.newline();
                    self.out.push_str(&format!(";; error: {err}"));
                    break;
                }
            };
            match &op {
                Operator::Block { ty } | Operator::Loop { ty } | Operator::If { ty }
                | Operator::Try { ty } => {
                    let label = label_scope.map("", "label");
                    self.newline();
                    self.out.push_str(&format!("{} {label}", op.name()));
                    self.print_block_type(*ty);
                    self.out.push(INDENT);
                    labels.push(Some(label));
                }
                Operator::Else => {
                    self.out.push(DEDENT);
                    self.newline();
                    self.out.push_str("else");
                    self.out.push(INDENT);
                }
                Operator::Catch { tag_index } => {
                    self.out.push(DEDENT);
                    self.newline();
                    let tag = self.tag_names[*tag_index as usize].clone();
                    self.out.push_str(&format!("catch {tag}"));
                    self.out.push(INDENT);
                }
                Operator::End => {
                    let label = labels.pop().expect("label stack non-empty");
                    if labels.is_empty() {
                        // The function's own end is implied by the closing paren.
                        break;
                    }
                    self.out.push(DEDENT);
                    self.newline();
                    match label {
                        Some(label) => self.out.push_str(&format!("end ;; {label}")),
                        None => self.out.push_str("end"),
                    }
                }
                Operator::Br { depth } => self.print_branch("br", *depth, &labels),
                Operator::BrIf { depth } => self.print_branch("br_if", *depth, &labels),
                Operator::BrTable { targets, default } => {
                    self.newline();
                    self.out.push_str("br_table");
                    for &target in targets.iter() {
                        let text = self.branch_label(target, &labels);
                        self.out.push_str(&format!(" {text}"));
                    }
                    let text = self.branch_label(*default, &labels);
                    self.out.push_str(&format!(" {text}"));
                }
                Operator::Call { func_index } => {
                    self.newline();
                    let name = self.function_names[*func_index as usize].name.clone();
                    self.out.push_str(&format!("call {name}"));
                }
                Operator::CallIndirect { type_index, table_index } => {
                    self.newline();
                    self.out.push_str("call_indirect ");
                    if *table_index != 0 {
                        self.out
                            .push_str(&format!("{} ", self.table_names[*table_index as usize]));
                    }
                    self.out
                        .push_str(&format!("(type {})", self.type_names[*type_index as usize]));
                }
                Operator::Throw { tag_index } => {
                    self.newline();
                    let tag = self.tag_names[*tag_index as usize].clone();
                    self.out.push_str(&format!("throw {tag}"));
                }
                Operator::LocalGet { index: local } | Operator::LocalSet { index: local }
                | Operator::LocalTee { index: local } => {
                    self.newline();
                    let name = self.function_names[index]
                        .locals
                        .get(*local as usize)
                        .cloned()
                        .unwrap_or_else(|| local.to_string());
                    self.out.push_str(&format!("{} {name}", op.name()));
                }
                Operator::GlobalGet { index: global } | Operator::GlobalSet { index: global } => {
                    self.newline();
                    let name = self
                        .global_names
                        .get(*global as usize)
                        .cloned()
                        .unwrap_or_else(|| global.to_string());
                    self.out.push_str(&format!("{} {name}", op.name()));
                }
                Operator::MemorySize { memory_index } | Operator::MemoryGrow { memory_index } => {
                    self.newline();
                    self.out.push_str(op.name());
                    if *memory_index != 0 {
                        self.out.push_str(&format!(" {memory_index}"));
                    }
                }
                _ => {
                    self.newline();
                    self.out.push_str(op.name());
                    op.fmt_immediates(&mut self.out);
                }
            }
        }
    }

    fn print_block_type(&mut self, ty: BlockType) {
        match ty {
            BlockType::Empty => {}
            BlockType::Value(value) => self.out.push_str(&format!(" (result {value})")),
            BlockType::Func(index) => {
                let (params, results) = self
                    .module
                    .block_signature(BlockType::Func(index))
                    .unwrap_or((TypeTuple::empty(), TypeTuple::empty()));
                self.print_function_signature(params, results);
            }
        }
    }

    fn branch_label(&self, depth: u32, labels: &[Option<String>]) -> String {
        labels
            .len()
            .checked_sub(1 + depth as usize)
            .and_then(|i| labels[i].clone())
            .unwrap_or_else(|| depth.to_string())
    }

    fn print_branch(&mut self, name: &str, depth: u32, labels: &[Option<String>]) {
        self.newline();
        let target = self.branch_label(depth, labels);
        self.out.push_str(&format!("{name} {target}"));
    }

    fn print_user_sections(&mut self) {
        for section in &self.module.user_sections {
            match section.name.as_str() {
                // Consumed for identifiers; nothing further to show.
                "name" => {}
                "linking" => self.print_linking_section(section),
                _ => {
                    self.newline();
                    self.out.push_str(&format!(
                        ";; user section \"{}\": {} bytes",
                        escape_string(section.name.as_bytes()),
                        section.data.len()
                    ));
                }
            }
        }
    }

    /// Disassemble the `linking` section as comments. Any decode failure
    /// degrades to a diagnostic comment; printing never aborts.
    fn print_linking_section(&mut self, section: &UserSection) {
        self.newline();
        match disassemble_linking_section(&section.data) {
            Ok(lines) => {
                self.out.push_str(";; linking section:");
                for line in lines {
                    self.newline();
                    self.out.push_str(&format!(";;   {line}"));
                }
            }
            Err(message) => {
                self.out
                    .push_str(&format!(";; linking section: malformed ({message})"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Linking section disassembly
// ---------------------------------------------------------------------------

const LINKING_SEGMENT_INFO: u8 = 5;
const LINKING_INIT_FUNCS: u8 = 6;
const LINKING_COMDAT_INFO: u8 = 7;
const LINKING_SYMBOL_TABLE: u8 = 8;

const SYM_KIND_FUNCTION: u8 = 0;
const SYM_KIND_DATA: u8 = 1;
const SYM_KIND_GLOBAL: u8 = 2;
const SYM_KIND_SECTION: u8 = 3;
const SYM_KIND_EVENT: u8 = 4;

const SYM_FLAG_UNDEFINED: u32 = 0x10;
const SYM_FLAG_EXPLICIT_NAME: u32 = 0x40;

fn disassemble_linking_section(data: &[u8]) -> Result<Vec<String>, String> {
    let mut cur = Cursor::new(data);
    let err = |e: crate::binary::DecodeError| e.to_string();
    let mut lines = Vec::new();

    let version = leb::read_u32(&mut cur).map_err(err)?;
    lines.push(format!("version {version}"));

    while !cur.is_eof() {
        let kind = cur.read_u8().map_err(err)?;
        let len = leb::read_u32(&mut cur).map_err(err)? as usize;
        let mut body = cur.split_off(len).map_err(err)?;
        match kind {
            LINKING_SEGMENT_INFO => {
                lines.push("segment info:".to_string());
                let count = leb::read_u32(&mut body).map_err(err)?;
                for index in 0..count {
                    let name = body.read_string().map_err(err)?;
                    let align_log2 = leb::read_u32(&mut body).map_err(err)?;
                    let flags = leb::read_u32(&mut body).map_err(err)?;
                    lines.push(format!(
                        "  {index}: name=\"{}\" align={} flags={flags:#x}",
                        escape_string(name.as_bytes()),
                        1u64 << align_log2
                    ));
                }
            }
            LINKING_INIT_FUNCS => {
                lines.push("init funcs:".to_string());
                let count = leb::read_u32(&mut body).map_err(err)?;
                for _ in 0..count {
                    let priority = leb::read_u32(&mut body).map_err(err)?;
                    let symbol = leb::read_u32(&mut body).map_err(err)?;
                    lines.push(format!("  priority={priority} symbol={symbol}"));
                }
            }
            LINKING_COMDAT_INFO => {
                lines.push("comdats:".to_string());
                let count = leb::read_u32(&mut body).map_err(err)?;
                for _ in 0..count {
                    let name = body.read_string().map_err(err)?;
                    let flags = leb::read_u32(&mut body).map_err(err)?;
                    let num_symbols = leb::read_u32(&mut body).map_err(err)?;
                    let mut members = Vec::new();
                    for _ in 0..num_symbols {
                        let sym_kind = cur_comdat_kind(body.read_u8().map_err(err)?);
                        let index = leb::read_u32(&mut body).map_err(err)?;
                        members.push(format!("{sym_kind} {index}"));
                    }
                    lines.push(format!(
                        "  \"{}\" flags={flags:#x}: {}",
                        escape_string(name.as_bytes()),
                        members.join(", ")
                    ));
                }
            }
            LINKING_SYMBOL_TABLE => {
                lines.push("symbol table:".to_string());
                let count = leb::read_u32(&mut body).map_err(err)?;
                for index in 0..count {
                    let line = disassemble_symbol(&mut body).map_err(err)?;
                    lines.push(format!("  {index}: {line}"));
                }
            }
            _ => {
                lines.push(format!("unknown subsection {kind} ({len} bytes)"));
            }
        }
        if !body.is_eof() {
            return Err("trailing bytes in subsection".to_string());
        }
    }
    Ok(lines)
}

fn cur_comdat_kind(kind: u8) -> &'static str {
    match kind {
        0 => "data",
        1 => "func",
        2 => "global",
        3 => "event",
        _ => "unknown",
    }
}

fn disassemble_symbol(body: &mut Cursor) -> Result<String, crate::binary::DecodeError> {
    let kind = body.read_u8()?;
    let flags = leb::read_u32(body)?;
    let undefined = flags & SYM_FLAG_UNDEFINED != 0;
    let text = match kind {
        SYM_KIND_FUNCTION | SYM_KIND_GLOBAL | SYM_KIND_EVENT => {
            let what = match kind {
                SYM_KIND_FUNCTION => "func",
                SYM_KIND_GLOBAL => "global",
                _ => "event",
            };
            let index = leb::read_u32(body)?;
            let named = !undefined || flags & SYM_FLAG_EXPLICIT_NAME != 0;
            let name = if named { Some(body.read_string()?) } else { None };
            match name {
                Some(name) => format!(
                    "{what} index={index} flags={flags:#x} name=\"{}\"",
                    escape_string(name.as_bytes())
                ),
                None => format!("{what} index={index} flags={flags:#x}"),
            }
        }
        SYM_KIND_DATA => {
            let name = body.read_string()?;
            if undefined {
                format!("data flags={flags:#x} name=\"{}\"", escape_string(name.as_bytes()))
            } else {
                let segment = leb::read_u32(body)?;
                let offset = leb::read_u32(body)?;
                let size = leb::read_u32(body)?;
                format!(
                    "data flags={flags:#x} name=\"{}\" segment={segment} offset={offset} size={size}",
                    escape_string(name.as_bytes())
                )
            }
        }
        SYM_KIND_SECTION => {
            let section = leb::read_u32(body)?;
            format!("section index={section} flags={flags:#x}")
        }
        _ => format!("unknown kind {kind} flags={flags:#x}"),
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_module;
    use crate::features::FeatureSpec;

    fn decode(source: &str) -> Module {
        let bytes = wat::parse_str(source).unwrap();
        decode_module(&bytes, FeatureSpec::default()).unwrap()
    }

    #[test]
    fn prints_and_reparses() {
        let module = decode(
            r#"(module
                (import "env" "mul" (func $mul (param i32 i32) (result i32)))
                (memory 1 4)
                (table 2 anyfunc)
                (global $g (mut i32) (i32.const 7))
                (elem (i32.const 0) $f $f)
                (data (i32.const 8) "hi\00")
                (func $f (param $x i32) (result i32)
                    (local $tmp i32)
                    block (result i32)
                        local.get $x
                        i32.const 3
                        i32.add
                        br 0
                    end
                    local.tee $tmp)
                (export "f" (func $f)))"#,
        );
        let text = print_module(&module);
        // The printed text must itself be a valid module that decodes to
        // the same shape.
        let bytes = wat::parse_str(&text).unwrap_or_else(|e| panic!("reparse failed: {e}\n{text}"));
        let reparsed = decode_module(&bytes, FeatureSpec::default()).unwrap();
        assert_eq!(reparsed.functions.defs.len(), module.functions.defs.len());
        assert_eq!(reparsed.exports.len(), module.exports.len());
        assert_eq!(reparsed.data_segments[0].data, module.data_segments[0].data);
        assert_eq!(reparsed.table_segments[0].indices.len(), 2);
    }

    #[test]
    fn labels_annotate_block_ends() {
        let module = decode(
            r#"(module (func
                block
                    loop
                        br 1
                    end
                end))"#,
        );
        let text = print_module(&module);
        assert!(text.contains("block $label0"), "{text}");
        assert!(text.contains("loop $label1"), "{text}");
        assert!(text.contains("end ;; $label1"), "{text}");
        // The br resolves through the control stack to the block's label.
        assert!(text.contains("br $label0"), "{text}");
    }

    #[test]
    fn names_come_from_the_name_section() {
        let module = decode(r#"(module (func $riddle (param $x i32) local.get $x drop))"#);
        let text = print_module(&module);
        assert!(text.contains("func $riddle"), "{text}");
        assert!(text.contains("local.get $x"), "{text}");
    }

    #[test]
    fn duplicate_names_are_uniquified() {
        let mut scope = NameScope::new();
        assert_eq!(scope.map("f", "func"), "$f");
        assert_eq!(scope.map("f", "func"), "$f_0");
        assert_eq!(scope.map("f", "func"), "$f_1");
        assert_eq!(scope.map("", "func"), "$func0");
        assert_eq!(scope.map("", "func"), "$func1");
    }

    #[test]
    fn malformed_linking_section_degrades_to_comment() {
        let mut module = decode(r#"(module)"#);
        module.user_sections.push(crate::module::UserSection {
            name: "linking".to_string(),
            data: vec![0x80], // truncated version LEB
        });
        let text = print_module(&module);
        assert!(text.contains(";; linking section: malformed"), "{text}");
    }

    #[test]
    fn linking_section_symbols_disassemble() {
        // version 2; symbol table subsection with one defined function
        // symbol "boot" at index 0.
        let mut data = vec![2u8];
        let mut body = vec![1u8]; // one symbol
        body.push(SYM_KIND_FUNCTION);
        body.push(0x00); // flags
        body.push(0x00); // index
        body.push(4);
        body.extend_from_slice(b"boot");
        data.push(LINKING_SYMBOL_TABLE);
        data.push(body.len() as u8);
        data.extend_from_slice(&body);

        let mut module = decode(r#"(module)"#);
        module.user_sections.push(crate::module::UserSection {
            name: "linking".to_string(),
            data,
        });
        let text = print_module(&module);
        assert!(text.contains("symbol table:"), "{text}");
        assert!(text.contains("func index=0"), "{text}");
        assert!(text.contains("name=\"boot\""), "{text}");
    }

    #[test]
    fn float_rendering_handles_special_values() {
        assert_eq!(f32_to_text(1.5), "1.5");
        assert_eq!(f64_to_text(-0.0), "-0");
        assert_eq!(f32_to_text(f32::INFINITY), "inf");
        assert_eq!(f64_to_text(f64::NEG_INFINITY), "-inf");
        assert!(f32_to_text(f32::NAN).starts_with("nan:0x"));
    }
}
