//! Disassembly names extracted from the `name` custom section.
//!
//! The name section is advisory, so this parser is deliberately lenient: a
//! malformed subsection terminates name extraction but never fails the
//! caller. Missing names come back as empty strings for the printer to
//! synthesise.

use crate::binary::{leb, Cursor};
use crate::module::Module;

#[derive(Debug, Clone, Default)]
pub struct FunctionNames {
    pub name: String,
    /// Names for params followed by locals, indexed by local index.
    pub locals: Vec<String>,
}

/// Names for every index space the printer labels.
#[derive(Debug, Clone, Default)]
pub struct DisassemblyNames {
    pub module_name: String,
    pub functions: Vec<FunctionNames>,
    pub types: Vec<String>,
    pub tables: Vec<String>,
    pub memories: Vec<String>,
    pub globals: Vec<String>,
}

const SUBSECTION_MODULE: u8 = 0;
const SUBSECTION_FUNCTIONS: u8 = 1;
const SUBSECTION_LOCALS: u8 = 2;

/// Extract names for `module`, sized to its index spaces, from its `name`
/// user section when present.
pub fn get_disassembly_names(module: &Module) -> DisassemblyNames {
    let mut names = DisassemblyNames {
        module_name: String::new(),
        functions: vec![FunctionNames::default(); module.functions.size()],
        types: vec![String::new(); module.types.len()],
        tables: vec![String::new(); module.tables.size()],
        memories: vec![String::new(); module.memories.size()],
        globals: vec![String::new(); module.globals.size()],
    };
    for (index, def) in module.functions.defs.iter().enumerate() {
        let function = &mut names.functions[module.functions.imports.len() + index];
        let num_params = module
            .types
            .get(def.type_index as usize)
            .map_or(0, |ty| ty.params().len());
        function.locals = vec![String::new(); num_params + def.non_param_locals.len()];
    }

    if let Some(section) = module.user_section("name") {
        // Best effort only; stop at the first malformed subsection.
        let _ = parse_name_section(&section.data, &mut names);
    }
    names
}

fn parse_name_section(data: &[u8], names: &mut DisassemblyNames) -> Option<()> {
    let mut cur = Cursor::new(data);
    while !cur.is_eof() {
        let kind = cur.read_u8().ok()?;
        let len = leb::read_u32(&mut cur).ok()? as usize;
        let mut body = cur.split_off(len).ok()?;
        match kind {
            SUBSECTION_MODULE => {
                names.module_name = body.read_string().ok()?;
            }
            SUBSECTION_FUNCTIONS => {
                let count = leb::read_u32(&mut body).ok()?;
                for _ in 0..count {
                    let index = leb::read_u32(&mut body).ok()? as usize;
                    let name = body.read_string().ok()?;
                    if let Some(entry) = names.functions.get_mut(index) {
                        entry.name = name;
                    }
                }
            }
            SUBSECTION_LOCALS => {
                let count = leb::read_u32(&mut body).ok()?;
                for _ in 0..count {
                    let func_index = leb::read_u32(&mut body).ok()? as usize;
                    let num_locals = leb::read_u32(&mut body).ok()?;
                    for _ in 0..num_locals {
                        let local_index = leb::read_u32(&mut body).ok()? as usize;
                        let name = body.read_string().ok()?;
                        if let Some(entry) = names
                            .functions
                            .get_mut(func_index)
                            .and_then(|f| f.locals.get_mut(local_index))
                        {
                            *entry = name;
                        }
                    }
                }
            }
            // Unknown subsections are skipped, not errors.
            _ => {}
        }
    }
    Some(())
}
