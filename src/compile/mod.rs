//! Lowering validated functions to threaded code.
//!
//! Each operator becomes one flat [`Op`] — a 16-byte `(code, imm)` pair —
//! so the interpreter never re-parses bytecode. Structured control flow is
//! resolved here: every `block`/`loop`/`if`/`try` gets a [`BlockInfo`]
//! entry with its end (and else/catch) program counters patched in when
//! the matching `end` is reached, and `br_table` vectors live out-of-line
//! so `Op` stays fixed-size.
//!
//! Value representation: every operand occupies one 8-byte stack slot,
//! except `v128` which occupies two. Local variables use the same layout,
//! so a callee's parameter area is exactly the caller's pushed argument
//! slots. Because `drop` and `select` are width-polymorphic, lowering
//! tracks operand slot widths (a reduced shadow of the validator's stack)
//! and bakes the width into those ops' immediates.
//!
//! Lowering is deterministic given the module bytes and feature spec. The
//! input must already be validated; malformed input here is an internal
//! invariant violation, not a user-reachable error.

use std::sync::Arc;

use crate::binary::Cursor;
use crate::module::{FunctionDef, Module};
use crate::operators::{BlockType, OpCode, Operator, OperatorReader};
use crate::types::{FunctionType, TypeTuple, ValueType};

/// Flat instruction for execution — 16 bytes, cache friendly.
#[derive(Clone, Copy)]
pub struct Op {
    pub code: u16,
    pub imm: u64,
}

const _: () = assert!(std::mem::size_of::<Op>() == 16);

impl Op {
    #[inline(always)]
    pub fn new(code: OpCode, imm: u64) -> Self {
        Op { code: code as u16, imm }
    }

    #[inline(always)]
    pub fn unit(code: OpCode) -> Self {
        Op { code: code as u16, imm: 0 }
    }

    #[inline(always)]
    pub fn pair(code: OpCode, hi: u32, lo: u32) -> Self {
        Op { code: code as u16, imm: ((hi as u64) << 32) | lo as u64 }
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:x})", OpCode::from_u16(self.code).name(), self.imm)
    }
}

/// Resolved control-structure targets for one `block`/`loop`/`if`/`try`.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// PC of the matching `end` op.
    pub end_pc: u32,
    /// PC of the `else` or `catch` op; `u32::MAX` when absent.
    pub else_pc: u32,
    /// Tag index a `catch` clause handles; meaningful only for `try`.
    pub catch_tag: u32,
    /// Operand slots consumed as block parameters.
    pub param_slots: u16,
    /// Operand slots produced as block results.
    pub result_slots: u16,
}

/// One function lowered to threaded code.
#[derive(Debug)]
pub struct CompiledFunction {
    pub ty: FunctionType,
    pub ops: Vec<Op>,
    pub blocks: Vec<BlockInfo>,
    /// `(target depths, default depth)` for each `br_table`.
    pub br_tables: Vec<(Box<[u32]>, u32)>,
    /// 128-bit immediates (v128 constants, shuffle lane vectors).
    pub wide_imms: Vec<u128>,
    /// Byte offset of each local (params first) within the frame.
    pub local_offsets: Vec<u32>,
    /// Total frame bytes: parameters plus zero-initialized locals.
    pub frame_bytes: u32,
    /// Bytes occupied by the parameter slots at the front of the frame.
    pub param_bytes: u32,
    /// Bytes occupied by the result slots on return.
    pub result_bytes: u32,
}

/// The compiled bodies of a module's defined functions, shared by every
/// instance of the module.
#[derive(Debug)]
pub struct CompiledModule {
    pub functions: Vec<Arc<CompiledFunction>>,
}

/// Stack slot bytes a value of this type occupies.
pub fn slot_bytes(ty: ValueType) -> u32 {
    match ty {
        ValueType::V128 => 16,
        _ => 8,
    }
}

fn slot_width(ty: ValueType) -> u8 {
    (slot_bytes(ty) / 8) as u8
}

fn tuple_slot_bytes(types: &[ValueType]) -> u32 {
    types.iter().map(|&ty| slot_bytes(ty)).sum()
}

/// Lower every defined function. The module must have passed validation.
pub fn compile_module(module: &Module) -> CompiledModule {
    let functions = module
        .functions
        .defs
        .iter()
        .map(|def| Arc::new(compile_function(module, def)))
        .collect();
    CompiledModule { functions }
}

fn compile_function(module: &Module, def: &FunctionDef) -> CompiledFunction {
    let ty = module.types[def.type_index as usize];

    let mut local_offsets = Vec::with_capacity(ty.params().len() + def.non_param_locals.len());
    let mut frame_bytes = 0u32;
    for &local in ty.params().iter().chain(def.non_param_locals.iter()) {
        local_offsets.push(frame_bytes);
        frame_bytes += slot_bytes(local);
    }
    let param_bytes = tuple_slot_bytes(ty.params().as_slice());
    let result_bytes = tuple_slot_bytes(ty.results().as_slice());

    let mut lowering = Lowering {
        module,
        def,
        local_offsets: &local_offsets,
        ops: Vec::new(),
        blocks: Vec::new(),
        br_tables: Vec::new(),
        wide_imms: Vec::new(),
        open_blocks: Vec::new(),
        widths: Vec::new(),
        width_frames: vec![WidthFrame { height: 0, unreachable: false }],
    };
    lowering.run();

    CompiledFunction {
        ty,
        ops: lowering.ops,
        blocks: lowering.blocks,
        br_tables: lowering.br_tables,
        wide_imms: lowering.wide_imms,
        local_offsets,
        frame_bytes,
        param_bytes,
        result_bytes,
    }
}

struct OpenBlock {
    index: usize,
    params: TypeTuple,
    results: TypeTuple,
}

/// Shadow of the validator's height/unreachable bookkeeping, just enough
/// to know operand slot widths.
struct WidthFrame {
    height: usize,
    unreachable: bool,
}

struct Lowering<'m> {
    module: &'m Module,
    def: &'m FunctionDef,
    local_offsets: &'m [u32],
    ops: Vec<Op>,
    blocks: Vec<BlockInfo>,
    br_tables: Vec<(Box<[u32]>, u32)>,
    wide_imms: Vec<u128>,
    /// Structures whose `end` is still open.
    open_blocks: Vec<OpenBlock>,
    /// Slot width (1 or 2) of each operand on the shadow stack.
    widths: Vec<u8>,
    width_frames: Vec<WidthFrame>,
}

impl<'m> Lowering<'m> {
    fn run(&mut self) {
        let mut reader =
            OperatorReader::new(Cursor::new(&self.def.code), self.module.features);
        loop {
            let op = reader
                .read()
                .expect("compiling a function that failed to decode; module not validated");
            let done = self.lower(&op);
            if done {
                break;
            }
        }
    }

    // -- width shadow stack ------------------------------------------------

    fn push_width_for(&mut self, ty: ValueType) {
        self.widths.push(slot_width(ty));
    }

    fn push_widths(&mut self, types: TypeTuple) {
        for &ty in types.iter() {
            self.push_width_for(ty);
        }
    }

    fn pop_width(&mut self) -> u8 {
        let frame = self.width_frames.last().expect("width frame underflow");
        if self.widths.len() == frame.height {
            debug_assert!(frame.unreachable, "operand underflow; module not validated");
            return 1;
        }
        self.widths.pop().expect("height checked above")
    }

    fn pop_widths(&mut self, count: usize) {
        for _ in 0..count {
            self.pop_width();
        }
    }

    fn set_unreachable(&mut self) {
        let frame = self.width_frames.last_mut().expect("width frame underflow");
        self.widths.truncate(frame.height);
        frame.unreachable = true;
    }

    // -- emission ----------------------------------------------------------

    fn open_block(&mut self, ty: BlockType, is_if: bool) -> u64 {
        let (params, results) = self
            .module
            .block_signature(ty)
            .expect("block type out of range; module not validated");
        if is_if {
            self.pop_width();
        }
        self.pop_widths(params.len());
        let index = self.blocks.len();
        self.blocks.push(BlockInfo {
            end_pc: 0,
            else_pc: u32::MAX,
            catch_tag: u32::MAX,
            param_slots: (tuple_slot_bytes(params.as_slice()) / 8) as u16,
            result_slots: (tuple_slot_bytes(results.as_slice()) / 8) as u16,
        });
        self.open_blocks.push(OpenBlock { index, params, results });
        self.width_frames.push(WidthFrame {
            height: self.widths.len(),
            unreachable: false,
        });
        self.push_widths(params);
        index as u64
    }

    fn local_imm(&self, index: u32) -> u64 {
        let offset = self.local_offsets[index as usize];
        let size = slot_bytes(local_type(self.module, self.def, index));
        ((offset as u64) << 8) | size as u64
    }

    fn local_width(&self, index: u32) -> ValueType {
        local_type(self.module, self.def, index)
    }

    /// Lower one operator; returns true at the function's final `end`.
    fn lower(&mut self, op: &Operator) -> bool {
        let pc = self.ops.len() as u32;
        let code = op.opcode();
        match op {
            Operator::Nop => self.ops.push(Op::unit(code)),
            Operator::Unreachable => {
                self.set_unreachable();
                self.ops.push(Op::unit(code));
            }
            Operator::Block { ty } | Operator::Loop { ty } => {
                let imm = self.open_block(*ty, false);
                self.ops.push(Op::new(code, imm));
            }
            Operator::If { ty } => {
                let imm = self.open_block(*ty, true);
                self.ops.push(Op::new(code, imm));
            }
            Operator::Try { ty } => {
                let imm = self.open_block(*ty, false);
                self.ops.push(Op::new(code, imm));
            }
            Operator::Else => {
                let open = self.open_blocks.last().expect("else outside a block");
                let index = open.index;
                let params = open.params;
                self.blocks[index].else_pc = pc;
                let frame = self.width_frames.last_mut().expect("width frame underflow");
                frame.unreachable = false;
                let height = frame.height;
                self.widths.truncate(height);
                self.push_widths(params);
                self.ops.push(Op::new(code, index as u64));
            }
            Operator::Catch { tag_index } => {
                let open = self.open_blocks.last().expect("catch outside a block");
                let index = open.index;
                self.blocks[index].else_pc = pc;
                self.blocks[index].catch_tag = *tag_index;
                let exception_params = self
                    .module
                    .exception_type(*tag_index)
                    .expect("tag index out of range; module not validated")
                    .params;
                let frame = self.width_frames.last_mut().expect("width frame underflow");
                frame.unreachable = false;
                let height = frame.height;
                self.widths.truncate(height);
                self.push_widths(exception_params);
                self.ops.push(Op::new(code, index as u64));
            }
            Operator::End => {
                match self.open_blocks.pop() {
                    Some(open) => {
                        self.blocks[open.index].end_pc = pc;
                        let frame = self.width_frames.pop().expect("width frame underflow");
                        self.widths.truncate(frame.height);
                        self.push_widths(open.results);
                        self.ops.push(Op::new(code, open.index as u64));
                    }
                    None => {
                        // The function's own end lowers to a return.
                        self.ops.push(Op::unit(OpCode::Return));
                        return true;
                    }
                }
            }
            Operator::Br { depth } => {
                self.set_unreachable();
                self.ops.push(Op::new(code, *depth as u64));
            }
            Operator::BrIf { depth } => {
                self.pop_width();
                self.ops.push(Op::new(code, *depth as u64));
            }
            Operator::BrTable { targets, default } => {
                self.set_unreachable();
                let index = self.br_tables.len() as u64;
                self.br_tables.push((targets.clone(), *default));
                self.ops.push(Op::new(code, index));
            }
            Operator::Return => {
                self.set_unreachable();
                self.ops.push(Op::unit(code));
            }
            Operator::Throw { tag_index } => {
                self.set_unreachable();
                self.ops.push(Op::new(code, *tag_index as u64));
            }
            Operator::Rethrow => {
                self.set_unreachable();
                self.ops.push(Op::unit(code));
            }
            Operator::Call { func_index } => {
                let ty = self
                    .module
                    .function_type(*func_index)
                    .expect("call index out of range; module not validated");
                self.pop_widths(ty.params().len());
                self.push_widths(ty.results());
                self.ops.push(Op::new(code, *func_index as u64));
            }
            Operator::CallIndirect { type_index, table_index } => {
                let ty = self.module.types[*type_index as usize];
                self.pop_width();
                self.pop_widths(ty.params().len());
                self.push_widths(ty.results());
                self.ops.push(Op::pair(code, *type_index, *table_index));
            }
            Operator::Drop => {
                let width = self.pop_width();
                self.ops.push(Op::new(code, width as u64));
            }
            Operator::Select => {
                self.pop_width();
                let width = self.pop_width();
                self.pop_width();
                self.widths.push(width);
                self.ops.push(Op::new(code, width as u64));
            }
            Operator::LocalGet { index } => {
                let ty = self.local_width(*index);
                self.push_width_for(ty);
                self.ops.push(Op::new(code, self.local_imm(*index)));
            }
            Operator::LocalSet { index } => {
                self.pop_width();
                self.ops.push(Op::new(code, self.local_imm(*index)));
            }
            Operator::LocalTee { index } => {
                self.ops.push(Op::new(code, self.local_imm(*index)));
            }
            Operator::GlobalGet { index } => {
                let ty = self
                    .module
                    .global_type(*index)
                    .expect("global index out of range; module not validated");
                self.push_width_for(ty.value_type);
                self.ops.push(Op::new(code, *index as u64));
            }
            Operator::GlobalSet { index } => {
                self.pop_width();
                self.ops.push(Op::new(code, *index as u64));
            }
            Operator::MemorySize { memory_index } => {
                self.widths.push(1);
                self.ops.push(Op::new(code, *memory_index as u64));
            }
            Operator::MemoryGrow { memory_index } => {
                self.pop_width();
                self.widths.push(1);
                self.ops.push(Op::new(code, *memory_index as u64));
            }
            Operator::I32Const { value } => {
                self.widths.push(1);
                self.ops.push(Op::new(code, *value as u32 as u64));
            }
            Operator::I64Const { value } => {
                self.widths.push(1);
                self.ops.push(Op::new(code, *value as u64));
            }
            Operator::F32Const { value } => {
                self.widths.push(1);
                self.ops.push(Op::new(code, value.to_bits() as u64));
            }
            Operator::F64Const { value } => {
                self.widths.push(1);
                self.ops.push(Op::new(code, value.to_bits()));
            }
            Operator::V128Const { value } => {
                self.widths.push(2);
                let index = self.wide_imms.len() as u64;
                self.wide_imms.push(*value);
                self.ops.push(Op::new(code, index));
            }
            Operator::I8x16Shuffle { lanes } => {
                self.pop_widths(2);
                self.widths.push(2);
                let index = self.wide_imms.len() as u64;
                self.wide_imms.push(u128::from_le_bytes(*lanes));
                self.ops.push(Op::new(code, index));
            }
            Operator::I8x16ExtractLaneS { lane }
            | Operator::I8x16ExtractLaneU { lane }
            | Operator::I8x16ReplaceLane { lane }
            | Operator::I16x8ExtractLaneS { lane }
            | Operator::I16x8ExtractLaneU { lane }
            | Operator::I16x8ReplaceLane { lane }
            | Operator::I32x4ExtractLane { lane }
            | Operator::I32x4ReplaceLane { lane }
            | Operator::I64x2ExtractLane { lane }
            | Operator::I64x2ReplaceLane { lane }
            | Operator::F32x4ExtractLane { lane }
            | Operator::F32x4ReplaceLane { lane }
            | Operator::F64x2ExtractLane { lane }
            | Operator::F64x2ReplaceLane { lane } => {
                self.apply_simple_signature(op);
                self.ops.push(Op::new(code, *lane as u64));
            }
            _ => {
                self.apply_simple_signature(op);
                match op.memory_access() {
                    Some(access) => self.ops.push(Op::new(code, access.imm.offset)),
                    None => self.ops.push(Op::unit(code)),
                }
            }
        }
        false
    }

    fn apply_simple_signature(&mut self, op: &Operator) {
        let (params, results) = op
            .simple_signature()
            .expect("operator without special lowering has a simple signature");
        self.pop_widths(params.len());
        for &ty in results {
            self.push_width_for(ty);
        }
    }
}

fn local_type(module: &Module, def: &FunctionDef, index: u32) -> ValueType {
    let ty = module.types[def.type_index as usize];
    let num_params = ty.params().len();
    if (index as usize) < num_params {
        ty.params()[index as usize]
    } else {
        def.non_param_locals[index as usize - num_params]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_module;
    use crate::features::FeatureSpec;

    fn compile(source: &str) -> CompiledModule {
        let bytes = wat::parse_str(source).unwrap();
        let module = decode_module(&bytes, FeatureSpec::default()).unwrap();
        crate::validate::validate_module(&module).unwrap();
        compile_module(&module)
    }

    #[test]
    fn lowers_to_flat_ops() {
        let compiled = compile(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        );
        let func = &compiled.functions[0];
        assert_eq!(func.ops.len(), 4); // two gets, add, return
        assert_eq!(OpCode::from_u16(func.ops[0].code), OpCode::LocalGet);
        assert_eq!(OpCode::from_u16(func.ops[2].code), OpCode::I32Add);
        assert_eq!(OpCode::from_u16(func.ops[3].code), OpCode::Return);
        assert_eq!(func.param_bytes, 16);
        assert_eq!(func.frame_bytes, 16);
        // local 1 lives 8 bytes in, one 8-byte slot wide.
        assert_eq!(func.ops[1].imm, (8 << 8) | 8);
    }

    #[test]
    fn resolves_block_targets() {
        let compiled = compile(
            r#"(module (func (result i32)
                block (result i32)
                    i32.const 1
                    br 0
                end))"#,
        );
        let func = &compiled.functions[0];
        // block, const, br, end, return
        assert_eq!(func.ops.len(), 5);
        let block = func.blocks[func.ops[0].imm as usize];
        assert_eq!(block.end_pc, 3);
        assert_eq!(block.else_pc, u32::MAX);
        assert_eq!(block.result_slots, 1);
        assert_eq!(block.param_slots, 0);
    }

    #[test]
    fn if_else_records_both_targets() {
        let compiled = compile(
            r#"(module (func (param i32) (result i32)
                local.get 0
                (if (result i32)
                    (then i32.const 1)
                    (else i32.const 2))))"#,
        );
        let func = &compiled.functions[0];
        // get, if, const, else, const, end, return
        let if_op = func.ops[1];
        assert_eq!(OpCode::from_u16(if_op.code), OpCode::If);
        let block = func.blocks[if_op.imm as usize];
        assert_eq!(block.else_pc, 3);
        assert_eq!(block.end_pc, 5);
    }

    #[test]
    fn br_table_data_is_out_of_line() {
        let compiled = compile(
            r#"(module (func (param i32)
                block
                    block
                        local.get 0
                        br_table 0 1 0
                    end
                end))"#,
        );
        let func = &compiled.functions[0];
        assert_eq!(func.br_tables.len(), 1);
        let (targets, default) = &func.br_tables[0];
        assert_eq!(targets.as_ref(), &[0, 1]);
        assert_eq!(*default, 0);
    }

    #[test]
    fn drop_and_select_carry_slot_widths() {
        let mut features = FeatureSpec::default();
        features.simd = true;
        let bytes = wat::parse_str(
            r#"(module (func
                v128.const i32x4 0 0 0 0
                drop
                i32.const 1
                drop))"#,
        )
        .unwrap();
        let module = decode_module(&bytes, features).unwrap();
        crate::validate::validate_module(&module).unwrap();
        let compiled = compile_module(&module);
        let func = &compiled.functions[0];
        let drops: Vec<u64> = func
            .ops
            .iter()
            .filter(|op| OpCode::from_u16(op.code) == OpCode::Drop)
            .map(|op| op.imm)
            .collect();
        assert_eq!(drops, vec![2, 1]);
    }

    #[test]
    fn v128_locals_take_two_slots() {
        let mut features = FeatureSpec::default();
        features.simd = true;
        let bytes = wat::parse_str(
            r#"(module (func (param v128 i32)
                (local i64)))"#,
        )
        .unwrap();
        let module = decode_module(&bytes, features).unwrap();
        crate::validate::validate_module(&module).unwrap();
        let compiled = compile_module(&module);
        let func = &compiled.functions[0];
        assert_eq!(func.local_offsets, vec![0, 16, 24]);
        assert_eq!(func.frame_bytes, 32);
        assert_eq!(func.param_bytes, 24);
    }
}
