//! The closed set of operators and their immediates.
//!
//! One table, [`for_each_operator!`], is the single source of truth for the
//! operator set. Each row carries the variant name, text name, binary
//! encoding (prefix byte + opcode), immediate fields, a validation
//! signature, the memory-access shape, and the gating feature. The decoder,
//! validator, printer, and compiler are all generated from or dispatch over
//! this table, so adding an opcode touches one site.
//!
//! Rows use `special` as their signature when the operator needs bespoke
//! validation (control flow, variable access, calls); everything else
//! declares a plain `params -> results` signature that the validator
//! applies generically.

use std::fmt;

use crate::binary::{leb, Cursor, DecodeError};
use crate::features::{Feature, FeatureSpec};
use crate::types::ValueType;

/// A load/store immediate: alignment hint and constant address offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemImm {
    pub align_log2: u32,
    pub offset: u64,
}

impl MemImm {
    fn decode(cur: &mut Cursor) -> Result<Self, DecodeError> {
        let align_log2 = leb::read_u32(cur)?;
        let offset = leb::read_u32(cur)? as u64;
        Ok(MemImm { align_log2, offset })
    }
}

/// The declared type of a block, loop, if, or try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValueType),
    /// Index of a function type; requires the multi-value feature.
    Func(u32),
}

impl BlockType {
    fn decode(cur: &mut Cursor) -> Result<Self, DecodeError> {
        let start = cur.offset();
        match cur.peek_u8()? {
            0x40 => {
                cur.read_u8()?;
                Ok(BlockType::Empty)
            }
            0x7f => {
                cur.read_u8()?;
                Ok(BlockType::Value(ValueType::I32))
            }
            0x7e => {
                cur.read_u8()?;
                Ok(BlockType::Value(ValueType::I64))
            }
            0x7d => {
                cur.read_u8()?;
                Ok(BlockType::Value(ValueType::F32))
            }
            0x7c => {
                cur.read_u8()?;
                Ok(BlockType::Value(ValueType::F64))
            }
            0x7b => {
                cur.read_u8()?;
                Ok(BlockType::Value(ValueType::V128))
            }
            _ => {
                let value = leb::read_i33(cur)?;
                if value < 0 {
                    return Err(DecodeError::malformed(start, "invalid block type"));
                }
                Ok(BlockType::Func(value as u32))
            }
        }
    }
}

pub type LaneIdx = u8;
pub type ShuffleLanes = [u8; 16];
pub type BrTargets = Box<[u32]>;

/// Static shape of a memory-touching operator, paired with its immediate.
#[derive(Debug, Clone, Copy)]
pub struct MemoryAccess {
    pub natural_align_log2: u32,
    /// Atomic accesses require the alignment to equal the natural one;
    /// plain accesses only require it not to exceed it.
    pub requires_exact_align: bool,
    pub imm: MemImm,
}

// ---------------------------------------------------------------------------
// Immediate readers, keyed by field type.
// ---------------------------------------------------------------------------

macro_rules! read_imm {
    ($cur:expr, u32) => {
        leb::read_u32($cur)?
    };
    ($cur:expr, i32) => {
        leb::read_i32($cur)?
    };
    ($cur:expr, i64) => {
        leb::read_i64($cur)?
    };
    ($cur:expr, f32) => {
        $cur.read_f32_le()?
    };
    ($cur:expr, f64) => {
        $cur.read_f64_le()?
    };
    ($cur:expr, u128) => {
        $cur.read_u128_le()?
    };
    ($cur:expr, LaneIdx) => {
        $cur.read_u8()?
    };
    ($cur:expr, ShuffleLanes) => {{
        let bytes = $cur.read_bytes(16)?;
        let mut lanes = [0u8; 16];
        lanes.copy_from_slice(bytes);
        lanes
    }};
    ($cur:expr, BrTargets) => {{
        let count = leb::read_u32($cur)?;
        let mut targets = Vec::new();
        for _ in 0..count {
            targets.push(leb::read_u32($cur)?);
        }
        targets.into_boxed_slice()
    }};
    ($cur:expr, BlockType) => {
        BlockType::decode($cur)?
    };
    ($cur:expr, MemImm) => {
        MemImm::decode($cur)?
    };
}

macro_rules! sig_value {
    (special) => {
        None
    };
    ((sig [$($p:ident)*] -> [$($r:ident)*])) => {
        Some((
            &[$(ValueType::$p),*] as &'static [ValueType],
            &[$(ValueType::$r),*] as &'static [ValueType],
        ))
    };
}

macro_rules! feature_value {
    (mvp) => {
        None
    };
    (sign_ext) => {
        Some(Feature::SignExtension)
    };
    (sat_fti) => {
        Some(Feature::NonTrappingFloatToInt)
    };
    (simd) => {
        Some(Feature::Simd)
    };
    (threads) => {
        Some(Feature::Threads)
    };
    (eh) => {
        Some(Feature::ExceptionHandling)
    };
}

// Rows whose mem token is `m`/`x` always carry their `MemImm` as the first
// immediate field; the field binding is passed through to keep hygiene.
macro_rules! mem_access_value {
    (-) => {
        None
    };
    (-, $($rest:ident),*) => {
        None
    };
    ((m $n:literal), $first:ident $(, $rest:ident)*) => {
        Some(MemoryAccess {
            natural_align_log2: $n,
            requires_exact_align: false,
            imm: *$first,
        })
    };
    ((x $n:literal), $first:ident $(, $rest:ident)*) => {
        Some(MemoryAccess {
            natural_align_log2: $n,
            requires_exact_align: true,
            imm: *$first,
        })
    };
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

macro_rules! define_operators {
    ($(($name:ident, $text:literal, $pre:literal $code:literal, $sig:tt, $mem:tt, $feat:ident $(, { $($f:ident : $fty:ident),* })?))*) => {
        /// A decoded operator with its immediates.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Operator {
            $( $name $({ $($f: $fty),* })?, )*
        }

        /// Compact operator tag used by the compiler's threaded code.
        ///
        /// Discriminants are assigned in table order; the interpreter
        /// recovers the tag from a `u16` with a transmute, which is sound
        /// because compiled code only ever stores valid tags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum OpCode {
            $( $name, )*
        }

        impl Operator {
            /// The operator's name in the text format.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Operator::$name $({ $($f: _),* })? => $text, )*
                }
            }

            /// The compact tag for this operator.
            pub fn opcode(&self) -> OpCode {
                match self {
                    $( Operator::$name $({ $($f: _),* })? => OpCode::$name, )*
                }
            }

            /// The feature this operator is gated behind, if any.
            pub fn required_feature(&self) -> Option<Feature> {
                match self {
                    $( Operator::$name $({ $($f: _),* })? => feature_value!($feat), )*
                }
            }

            /// The plain `params -> results` signature for operators whose
            /// typing does not depend on module context. `None` for
            /// operators the validator handles specially.
            pub fn simple_signature(&self) -> Option<(&'static [ValueType], &'static [ValueType])> {
                match self {
                    $( Operator::$name $({ $($f: _),* })? => sig_value!($sig), )*
                }
            }

            /// The memory-access shape for load/store/atomic operators.
            #[allow(unused_variables)]
            pub fn memory_access(&self) -> Option<MemoryAccess> {
                match self {
                    $( Operator::$name $({ $($f),* })? => {
                        mem_access_value!($mem $($(, $f)*)?)
                    } )*
                }
            }

            /// Append this operator's immediates in text form. Callers that
            /// can resolve indices to names (calls, variable access,
            /// control structure) render those operators themselves.
            pub fn fmt_immediates(&self, out: &mut String) {
                match self {
                    $( Operator::$name $({ $($f),* })? => {
                        $( $( WriteImm::write_imm($f, out); )* )?
                    } )*
                }
            }
        }

        impl OpCode {
            pub fn name(self) -> &'static str {
                match self {
                    $( OpCode::$name => $text, )*
                }
            }
        }

        /// Decode a single operator from the cursor, enforcing feature gates.
        pub fn read_operator(cur: &mut Cursor, features: &FeatureSpec) -> Result<Operator, DecodeError> {
            let start = cur.offset();
            let byte = cur.read_u8()?;
            let (prefix, code) = match byte {
                0xfc | 0xfd | 0xfe => (byte, leb::read_u32(cur)?),
                _ => (0u8, byte as u32),
            };
            let operator = match (prefix, code) {
                $( ($pre, $code) => Operator::$name $({ $($f: read_imm!(cur, $fty)),* })?, )*
                _ => {
                    let opcode = ((prefix as u32) << 8) | code;
                    return Err(DecodeError::UnknownOpcode { opcode, offset: start });
                }
            };
            if let Some(feature) = operator.required_feature() {
                if !features.supports(feature) {
                    return Err(DecodeError::FeatureDisabled {
                        name: operator.name(),
                        feature: feature.name(),
                        offset: start,
                    });
                }
            }
            Ok(operator)
        }
    };
}

/// Text rendering for immediate fields, used by the table-generated
/// `fmt_immediates`.
trait WriteImm {
    fn write_imm(&self, out: &mut String);
}

impl WriteImm for u32 {
    fn write_imm(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&self.to_string());
    }
}

impl WriteImm for i32 {
    fn write_imm(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&self.to_string());
    }
}

impl WriteImm for i64 {
    fn write_imm(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&self.to_string());
    }
}

impl WriteImm for u8 {
    fn write_imm(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&self.to_string());
    }
}

impl WriteImm for f32 {
    fn write_imm(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&crate::print::f32_to_text(*self));
    }
}

impl WriteImm for f64 {
    fn write_imm(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&crate::print::f64_to_text(*self));
    }
}

impl WriteImm for u128 {
    fn write_imm(&self, out: &mut String) {
        out.push_str(" i32x4");
        for i in 0..4 {
            out.push_str(&format!(" 0x{:08x}", (self >> (32 * i)) as u32));
        }
    }
}

impl WriteImm for ShuffleLanes {
    fn write_imm(&self, out: &mut String) {
        for lane in self {
            out.push(' ');
            out.push_str(&lane.to_string());
        }
    }
}

impl WriteImm for BrTargets {
    fn write_imm(&self, out: &mut String) {
        for target in self.iter() {
            out.push(' ');
            out.push_str(&target.to_string());
        }
    }
}

impl WriteImm for BlockType {
    fn write_imm(&self, out: &mut String) {
        match self {
            BlockType::Empty => {}
            BlockType::Value(ty) => {
                out.push_str(" (result ");
                out.push_str(&ty.to_string());
                out.push(')');
            }
            BlockType::Func(index) => {
                out.push_str(" (type ");
                out.push_str(&index.to_string());
                out.push(')');
            }
        }
    }
}

impl WriteImm for MemImm {
    fn write_imm(&self, out: &mut String) {
        if self.offset != 0 {
            out.push_str(" offset=");
            out.push_str(&self.offset.to_string());
        }
        out.push_str(" align=");
        out.push_str(&(1u64 << self.align_log2).to_string());
    }
}

macro_rules! for_each_operator {
    ($mac:ident) => {
        $mac! {
            // --- Control ---
            (Unreachable, "unreachable", 0x00 0x00, special, -, mvp)
            (Nop, "nop", 0x00 0x01, special, -, mvp)
            (Block, "block", 0x00 0x02, special, -, mvp, { ty: BlockType })
            (Loop, "loop", 0x00 0x03, special, -, mvp, { ty: BlockType })
            (If, "if", 0x00 0x04, special, -, mvp, { ty: BlockType })
            (Else, "else", 0x00 0x05, special, -, mvp)
            (Try, "try", 0x00 0x06, special, -, eh, { ty: BlockType })
            (Catch, "catch", 0x00 0x07, special, -, eh, { tag_index: u32 })
            (Throw, "throw", 0x00 0x08, special, -, eh, { tag_index: u32 })
            (Rethrow, "rethrow", 0x00 0x09, special, -, eh)
            (End, "end", 0x00 0x0b, special, -, mvp)
            (Br, "br", 0x00 0x0c, special, -, mvp, { depth: u32 })
            (BrIf, "br_if", 0x00 0x0d, special, -, mvp, { depth: u32 })
            (BrTable, "br_table", 0x00 0x0e, special, -, mvp, { targets: BrTargets, default: u32 })
            (Return, "return", 0x00 0x0f, special, -, mvp)
            (Call, "call", 0x00 0x10, special, -, mvp, { func_index: u32 })
            (CallIndirect, "call_indirect", 0x00 0x11, special, -, mvp, { type_index: u32, table_index: u32 })

            // --- Parametric ---
            (Drop, "drop", 0x00 0x1a, special, -, mvp)
            (Select, "select", 0x00 0x1b, special, -, mvp)

            // --- Variable access ---
            (LocalGet, "local.get", 0x00 0x20, special, -, mvp, { index: u32 })
            (LocalSet, "local.set", 0x00 0x21, special, -, mvp, { index: u32 })
            (LocalTee, "local.tee", 0x00 0x22, special, -, mvp, { index: u32 })
            (GlobalGet, "global.get", 0x00 0x23, special, -, mvp, { index: u32 })
            (GlobalSet, "global.set", 0x00 0x24, special, -, mvp, { index: u32 })

            // --- Memory ---
            (I32Load, "i32.load", 0x00 0x28, (sig [I32] -> [I32]), (m 2), mvp, { imm: MemImm })
            (I64Load, "i64.load", 0x00 0x29, (sig [I32] -> [I64]), (m 3), mvp, { imm: MemImm })
            (F32Load, "f32.load", 0x00 0x2a, (sig [I32] -> [F32]), (m 2), mvp, { imm: MemImm })
            (F64Load, "f64.load", 0x00 0x2b, (sig [I32] -> [F64]), (m 3), mvp, { imm: MemImm })
            (I32Load8S, "i32.load8_s", 0x00 0x2c, (sig [I32] -> [I32]), (m 0), mvp, { imm: MemImm })
            (I32Load8U, "i32.load8_u", 0x00 0x2d, (sig [I32] -> [I32]), (m 0), mvp, { imm: MemImm })
            (I32Load16S, "i32.load16_s", 0x00 0x2e, (sig [I32] -> [I32]), (m 1), mvp, { imm: MemImm })
            (I32Load16U, "i32.load16_u", 0x00 0x2f, (sig [I32] -> [I32]), (m 1), mvp, { imm: MemImm })
            (I64Load8S, "i64.load8_s", 0x00 0x30, (sig [I32] -> [I64]), (m 0), mvp, { imm: MemImm })
            (I64Load8U, "i64.load8_u", 0x00 0x31, (sig [I32] -> [I64]), (m 0), mvp, { imm: MemImm })
            (I64Load16S, "i64.load16_s", 0x00 0x32, (sig [I32] -> [I64]), (m 1), mvp, { imm: MemImm })
            (I64Load16U, "i64.load16_u", 0x00 0x33, (sig [I32] -> [I64]), (m 1), mvp, { imm: MemImm })
            (I64Load32S, "i64.load32_s", 0x00 0x34, (sig [I32] -> [I64]), (m 2), mvp, { imm: MemImm })
            (I64Load32U, "i64.load32_u", 0x00 0x35, (sig [I32] -> [I64]), (m 2), mvp, { imm: MemImm })
            (I32Store, "i32.store", 0x00 0x36, (sig [I32 I32] -> []), (m 2), mvp, { imm: MemImm })
            (I64Store, "i64.store", 0x00 0x37, (sig [I32 I64] -> []), (m 3), mvp, { imm: MemImm })
            (F32Store, "f32.store", 0x00 0x38, (sig [I32 F32] -> []), (m 2), mvp, { imm: MemImm })
            (F64Store, "f64.store", 0x00 0x39, (sig [I32 F64] -> []), (m 3), mvp, { imm: MemImm })
            (I32Store8, "i32.store8", 0x00 0x3a, (sig [I32 I32] -> []), (m 0), mvp, { imm: MemImm })
            (I32Store16, "i32.store16", 0x00 0x3b, (sig [I32 I32] -> []), (m 1), mvp, { imm: MemImm })
            (I64Store8, "i64.store8", 0x00 0x3c, (sig [I32 I64] -> []), (m 0), mvp, { imm: MemImm })
            (I64Store16, "i64.store16", 0x00 0x3d, (sig [I32 I64] -> []), (m 1), mvp, { imm: MemImm })
            (I64Store32, "i64.store32", 0x00 0x3e, (sig [I32 I64] -> []), (m 2), mvp, { imm: MemImm })
            (MemorySize, "memory.size", 0x00 0x3f, special, -, mvp, { memory_index: u32 })
            (MemoryGrow, "memory.grow", 0x00 0x40, special, -, mvp, { memory_index: u32 })

            // --- Constants ---
            (I32Const, "i32.const", 0x00 0x41, (sig [] -> [I32]), -, mvp, { value: i32 })
            (I64Const, "i64.const", 0x00 0x42, (sig [] -> [I64]), -, mvp, { value: i64 })
            (F32Const, "f32.const", 0x00 0x43, (sig [] -> [F32]), -, mvp, { value: f32 })
            (F64Const, "f64.const", 0x00 0x44, (sig [] -> [F64]), -, mvp, { value: f64 })

            // --- i32 comparison ---
            (I32Eqz, "i32.eqz", 0x00 0x45, (sig [I32] -> [I32]), -, mvp)
            (I32Eq, "i32.eq", 0x00 0x46, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Ne, "i32.ne", 0x00 0x47, (sig [I32 I32] -> [I32]), -, mvp)
            (I32LtS, "i32.lt_s", 0x00 0x48, (sig [I32 I32] -> [I32]), -, mvp)
            (I32LtU, "i32.lt_u", 0x00 0x49, (sig [I32 I32] -> [I32]), -, mvp)
            (I32GtS, "i32.gt_s", 0x00 0x4a, (sig [I32 I32] -> [I32]), -, mvp)
            (I32GtU, "i32.gt_u", 0x00 0x4b, (sig [I32 I32] -> [I32]), -, mvp)
            (I32LeS, "i32.le_s", 0x00 0x4c, (sig [I32 I32] -> [I32]), -, mvp)
            (I32LeU, "i32.le_u", 0x00 0x4d, (sig [I32 I32] -> [I32]), -, mvp)
            (I32GeS, "i32.ge_s", 0x00 0x4e, (sig [I32 I32] -> [I32]), -, mvp)
            (I32GeU, "i32.ge_u", 0x00 0x4f, (sig [I32 I32] -> [I32]), -, mvp)

            // --- i64 comparison ---
            (I64Eqz, "i64.eqz", 0x00 0x50, (sig [I64] -> [I32]), -, mvp)
            (I64Eq, "i64.eq", 0x00 0x51, (sig [I64 I64] -> [I32]), -, mvp)
            (I64Ne, "i64.ne", 0x00 0x52, (sig [I64 I64] -> [I32]), -, mvp)
            (I64LtS, "i64.lt_s", 0x00 0x53, (sig [I64 I64] -> [I32]), -, mvp)
            (I64LtU, "i64.lt_u", 0x00 0x54, (sig [I64 I64] -> [I32]), -, mvp)
            (I64GtS, "i64.gt_s", 0x00 0x55, (sig [I64 I64] -> [I32]), -, mvp)
            (I64GtU, "i64.gt_u", 0x00 0x56, (sig [I64 I64] -> [I32]), -, mvp)
            (I64LeS, "i64.le_s", 0x00 0x57, (sig [I64 I64] -> [I32]), -, mvp)
            (I64LeU, "i64.le_u", 0x00 0x58, (sig [I64 I64] -> [I32]), -, mvp)
            (I64GeS, "i64.ge_s", 0x00 0x59, (sig [I64 I64] -> [I32]), -, mvp)
            (I64GeU, "i64.ge_u", 0x00 0x5a, (sig [I64 I64] -> [I32]), -, mvp)

            // --- float comparison ---
            (F32Eq, "f32.eq", 0x00 0x5b, (sig [F32 F32] -> [I32]), -, mvp)
            (F32Ne, "f32.ne", 0x00 0x5c, (sig [F32 F32] -> [I32]), -, mvp)
            (F32Lt, "f32.lt", 0x00 0x5d, (sig [F32 F32] -> [I32]), -, mvp)
            (F32Gt, "f32.gt", 0x00 0x5e, (sig [F32 F32] -> [I32]), -, mvp)
            (F32Le, "f32.le", 0x00 0x5f, (sig [F32 F32] -> [I32]), -, mvp)
            (F32Ge, "f32.ge", 0x00 0x60, (sig [F32 F32] -> [I32]), -, mvp)
            (F64Eq, "f64.eq", 0x00 0x61, (sig [F64 F64] -> [I32]), -, mvp)
            (F64Ne, "f64.ne", 0x00 0x62, (sig [F64 F64] -> [I32]), -, mvp)
            (F64Lt, "f64.lt", 0x00 0x63, (sig [F64 F64] -> [I32]), -, mvp)
            (F64Gt, "f64.gt", 0x00 0x64, (sig [F64 F64] -> [I32]), -, mvp)
            (F64Le, "f64.le", 0x00 0x65, (sig [F64 F64] -> [I32]), -, mvp)
            (F64Ge, "f64.ge", 0x00 0x66, (sig [F64 F64] -> [I32]), -, mvp)

            // --- i32 arithmetic ---
            (I32Clz, "i32.clz", 0x00 0x67, (sig [I32] -> [I32]), -, mvp)
            (I32Ctz, "i32.ctz", 0x00 0x68, (sig [I32] -> [I32]), -, mvp)
            (I32Popcnt, "i32.popcnt", 0x00 0x69, (sig [I32] -> [I32]), -, mvp)
            (I32Add, "i32.add", 0x00 0x6a, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Sub, "i32.sub", 0x00 0x6b, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Mul, "i32.mul", 0x00 0x6c, (sig [I32 I32] -> [I32]), -, mvp)
            (I32DivS, "i32.div_s", 0x00 0x6d, (sig [I32 I32] -> [I32]), -, mvp)
            (I32DivU, "i32.div_u", 0x00 0x6e, (sig [I32 I32] -> [I32]), -, mvp)
            (I32RemS, "i32.rem_s", 0x00 0x6f, (sig [I32 I32] -> [I32]), -, mvp)
            (I32RemU, "i32.rem_u", 0x00 0x70, (sig [I32 I32] -> [I32]), -, mvp)
            (I32And, "i32.and", 0x00 0x71, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Or, "i32.or", 0x00 0x72, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Xor, "i32.xor", 0x00 0x73, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Shl, "i32.shl", 0x00 0x74, (sig [I32 I32] -> [I32]), -, mvp)
            (I32ShrS, "i32.shr_s", 0x00 0x75, (sig [I32 I32] -> [I32]), -, mvp)
            (I32ShrU, "i32.shr_u", 0x00 0x76, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Rotl, "i32.rotl", 0x00 0x77, (sig [I32 I32] -> [I32]), -, mvp)
            (I32Rotr, "i32.rotr", 0x00 0x78, (sig [I32 I32] -> [I32]), -, mvp)

            // --- i64 arithmetic ---
            (I64Clz, "i64.clz", 0x00 0x79, (sig [I64] -> [I64]), -, mvp)
            (I64Ctz, "i64.ctz", 0x00 0x7a, (sig [I64] -> [I64]), -, mvp)
            (I64Popcnt, "i64.popcnt", 0x00 0x7b, (sig [I64] -> [I64]), -, mvp)
            (I64Add, "i64.add", 0x00 0x7c, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Sub, "i64.sub", 0x00 0x7d, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Mul, "i64.mul", 0x00 0x7e, (sig [I64 I64] -> [I64]), -, mvp)
            (I64DivS, "i64.div_s", 0x00 0x7f, (sig [I64 I64] -> [I64]), -, mvp)
            (I64DivU, "i64.div_u", 0x00 0x80, (sig [I64 I64] -> [I64]), -, mvp)
            (I64RemS, "i64.rem_s", 0x00 0x81, (sig [I64 I64] -> [I64]), -, mvp)
            (I64RemU, "i64.rem_u", 0x00 0x82, (sig [I64 I64] -> [I64]), -, mvp)
            (I64And, "i64.and", 0x00 0x83, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Or, "i64.or", 0x00 0x84, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Xor, "i64.xor", 0x00 0x85, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Shl, "i64.shl", 0x00 0x86, (sig [I64 I64] -> [I64]), -, mvp)
            (I64ShrS, "i64.shr_s", 0x00 0x87, (sig [I64 I64] -> [I64]), -, mvp)
            (I64ShrU, "i64.shr_u", 0x00 0x88, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Rotl, "i64.rotl", 0x00 0x89, (sig [I64 I64] -> [I64]), -, mvp)
            (I64Rotr, "i64.rotr", 0x00 0x8a, (sig [I64 I64] -> [I64]), -, mvp)

            // --- f32 arithmetic ---
            (F32Abs, "f32.abs", 0x00 0x8b, (sig [F32] -> [F32]), -, mvp)
            (F32Neg, "f32.neg", 0x00 0x8c, (sig [F32] -> [F32]), -, mvp)
            (F32Ceil, "f32.ceil", 0x00 0x8d, (sig [F32] -> [F32]), -, mvp)
            (F32Floor, "f32.floor", 0x00 0x8e, (sig [F32] -> [F32]), -, mvp)
            (F32Trunc, "f32.trunc", 0x00 0x8f, (sig [F32] -> [F32]), -, mvp)
            (F32Nearest, "f32.nearest", 0x00 0x90, (sig [F32] -> [F32]), -, mvp)
            (F32Sqrt, "f32.sqrt", 0x00 0x91, (sig [F32] -> [F32]), -, mvp)
            (F32Add, "f32.add", 0x00 0x92, (sig [F32 F32] -> [F32]), -, mvp)
            (F32Sub, "f32.sub", 0x00 0x93, (sig [F32 F32] -> [F32]), -, mvp)
            (F32Mul, "f32.mul", 0x00 0x94, (sig [F32 F32] -> [F32]), -, mvp)
            (F32Div, "f32.div", 0x00 0x95, (sig [F32 F32] -> [F32]), -, mvp)
            (F32Min, "f32.min", 0x00 0x96, (sig [F32 F32] -> [F32]), -, mvp)
            (F32Max, "f32.max", 0x00 0x97, (sig [F32 F32] -> [F32]), -, mvp)
            (F32Copysign, "f32.copysign", 0x00 0x98, (sig [F32 F32] -> [F32]), -, mvp)

            // --- f64 arithmetic ---
            (F64Abs, "f64.abs", 0x00 0x99, (sig [F64] -> [F64]), -, mvp)
            (F64Neg, "f64.neg", 0x00 0x9a, (sig [F64] -> [F64]), -, mvp)
            (F64Ceil, "f64.ceil", 0x00 0x9b, (sig [F64] -> [F64]), -, mvp)
            (F64Floor, "f64.floor", 0x00 0x9c, (sig [F64] -> [F64]), -, mvp)
            (F64Trunc, "f64.trunc", 0x00 0x9d, (sig [F64] -> [F64]), -, mvp)
            (F64Nearest, "f64.nearest", 0x00 0x9e, (sig [F64] -> [F64]), -, mvp)
            (F64Sqrt, "f64.sqrt", 0x00 0x9f, (sig [F64] -> [F64]), -, mvp)
            (F64Add, "f64.add", 0x00 0xa0, (sig [F64 F64] -> [F64]), -, mvp)
            (F64Sub, "f64.sub", 0x00 0xa1, (sig [F64 F64] -> [F64]), -, mvp)
            (F64Mul, "f64.mul", 0x00 0xa2, (sig [F64 F64] -> [F64]), -, mvp)
            (F64Div, "f64.div", 0x00 0xa3, (sig [F64 F64] -> [F64]), -, mvp)
            (F64Min, "f64.min", 0x00 0xa4, (sig [F64 F64] -> [F64]), -, mvp)
            (F64Max, "f64.max", 0x00 0xa5, (sig [F64 F64] -> [F64]), -, mvp)
            (F64Copysign, "f64.copysign", 0x00 0xa6, (sig [F64 F64] -> [F64]), -, mvp)

            // --- Conversions ---
            (I32WrapI64, "i32.wrap_i64", 0x00 0xa7, (sig [I64] -> [I32]), -, mvp)
            (I32TruncF32S, "i32.trunc_f32_s", 0x00 0xa8, (sig [F32] -> [I32]), -, mvp)
            (I32TruncF32U, "i32.trunc_f32_u", 0x00 0xa9, (sig [F32] -> [I32]), -, mvp)
            (I32TruncF64S, "i32.trunc_f64_s", 0x00 0xaa, (sig [F64] -> [I32]), -, mvp)
            (I32TruncF64U, "i32.trunc_f64_u", 0x00 0xab, (sig [F64] -> [I32]), -, mvp)
            (I64ExtendI32S, "i64.extend_i32_s", 0x00 0xac, (sig [I32] -> [I64]), -, mvp)
            (I64ExtendI32U, "i64.extend_i32_u", 0x00 0xad, (sig [I32] -> [I64]), -, mvp)
            (I64TruncF32S, "i64.trunc_f32_s", 0x00 0xae, (sig [F32] -> [I64]), -, mvp)
            (I64TruncF32U, "i64.trunc_f32_u", 0x00 0xaf, (sig [F32] -> [I64]), -, mvp)
            (I64TruncF64S, "i64.trunc_f64_s", 0x00 0xb0, (sig [F64] -> [I64]), -, mvp)
            (I64TruncF64U, "i64.trunc_f64_u", 0x00 0xb1, (sig [F64] -> [I64]), -, mvp)
            (F32ConvertI32S, "f32.convert_i32_s", 0x00 0xb2, (sig [I32] -> [F32]), -, mvp)
            (F32ConvertI32U, "f32.convert_i32_u", 0x00 0xb3, (sig [I32] -> [F32]), -, mvp)
            (F32ConvertI64S, "f32.convert_i64_s", 0x00 0xb4, (sig [I64] -> [F32]), -, mvp)
            (F32ConvertI64U, "f32.convert_i64_u", 0x00 0xb5, (sig [I64] -> [F32]), -, mvp)
            (F32DemoteF64, "f32.demote_f64", 0x00 0xb6, (sig [F64] -> [F32]), -, mvp)
            (F64ConvertI32S, "f64.convert_i32_s", 0x00 0xb7, (sig [I32] -> [F64]), -, mvp)
            (F64ConvertI32U, "f64.convert_i32_u", 0x00 0xb8, (sig [I32] -> [F64]), -, mvp)
            (F64ConvertI64S, "f64.convert_i64_s", 0x00 0xb9, (sig [I64] -> [F64]), -, mvp)
            (F64ConvertI64U, "f64.convert_i64_u", 0x00 0xba, (sig [I64] -> [F64]), -, mvp)
            (F64PromoteF32, "f64.promote_f32", 0x00 0xbb, (sig [F32] -> [F64]), -, mvp)
            (I32ReinterpretF32, "i32.reinterpret_f32", 0x00 0xbc, (sig [F32] -> [I32]), -, mvp)
            (I64ReinterpretF64, "i64.reinterpret_f64", 0x00 0xbd, (sig [F64] -> [I64]), -, mvp)
            (F32ReinterpretI32, "f32.reinterpret_i32", 0x00 0xbe, (sig [I32] -> [F32]), -, mvp)
            (F64ReinterpretI64, "f64.reinterpret_i64", 0x00 0xbf, (sig [I64] -> [F64]), -, mvp)

            // --- Sign extension ---
            (I32Extend8S, "i32.extend8_s", 0x00 0xc0, (sig [I32] -> [I32]), -, sign_ext)
            (I32Extend16S, "i32.extend16_s", 0x00 0xc1, (sig [I32] -> [I32]), -, sign_ext)
            (I64Extend8S, "i64.extend8_s", 0x00 0xc2, (sig [I64] -> [I64]), -, sign_ext)
            (I64Extend16S, "i64.extend16_s", 0x00 0xc3, (sig [I64] -> [I64]), -, sign_ext)
            (I64Extend32S, "i64.extend32_s", 0x00 0xc4, (sig [I64] -> [I64]), -, sign_ext)

            // --- Non-trapping float-to-int ---
            (I32TruncSatF32S, "i32.trunc_sat_f32_s", 0xfc 0x00, (sig [F32] -> [I32]), -, sat_fti)
            (I32TruncSatF32U, "i32.trunc_sat_f32_u", 0xfc 0x01, (sig [F32] -> [I32]), -, sat_fti)
            (I32TruncSatF64S, "i32.trunc_sat_f64_s", 0xfc 0x02, (sig [F64] -> [I32]), -, sat_fti)
            (I32TruncSatF64U, "i32.trunc_sat_f64_u", 0xfc 0x03, (sig [F64] -> [I32]), -, sat_fti)
            (I64TruncSatF32S, "i64.trunc_sat_f32_s", 0xfc 0x04, (sig [F32] -> [I64]), -, sat_fti)
            (I64TruncSatF32U, "i64.trunc_sat_f32_u", 0xfc 0x05, (sig [F32] -> [I64]), -, sat_fti)
            (I64TruncSatF64S, "i64.trunc_sat_f64_s", 0xfc 0x06, (sig [F64] -> [I64]), -, sat_fti)
            (I64TruncSatF64U, "i64.trunc_sat_f64_u", 0xfc 0x07, (sig [F64] -> [I64]), -, sat_fti)

            // --- SIMD ---
            (V128Load, "v128.load", 0xfd 0x00, (sig [I32] -> [V128]), (m 4), simd, { imm: MemImm })
            (V128Store, "v128.store", 0xfd 0x0b, (sig [I32 V128] -> []), (m 4), simd, { imm: MemImm })
            (V128Const, "v128.const", 0xfd 0x0c, (sig [] -> [V128]), -, simd, { value: u128 })
            (I8x16Shuffle, "i8x16.shuffle", 0xfd 0x0d, (sig [V128 V128] -> [V128]), -, simd, { lanes: ShuffleLanes })
            (I8x16Swizzle, "i8x16.swizzle", 0xfd 0x0e, (sig [V128 V128] -> [V128]), -, simd)
            (I8x16Splat, "i8x16.splat", 0xfd 0x0f, (sig [I32] -> [V128]), -, simd)
            (I16x8Splat, "i16x8.splat", 0xfd 0x10, (sig [I32] -> [V128]), -, simd)
            (I32x4Splat, "i32x4.splat", 0xfd 0x11, (sig [I32] -> [V128]), -, simd)
            (I64x2Splat, "i64x2.splat", 0xfd 0x12, (sig [I64] -> [V128]), -, simd)
            (F32x4Splat, "f32x4.splat", 0xfd 0x13, (sig [F32] -> [V128]), -, simd)
            (F64x2Splat, "f64x2.splat", 0xfd 0x14, (sig [F64] -> [V128]), -, simd)
            (I8x16ExtractLaneS, "i8x16.extract_lane_s", 0xfd 0x15, (sig [V128] -> [I32]), -, simd, { lane: LaneIdx })
            (I8x16ExtractLaneU, "i8x16.extract_lane_u", 0xfd 0x16, (sig [V128] -> [I32]), -, simd, { lane: LaneIdx })
            (I8x16ReplaceLane, "i8x16.replace_lane", 0xfd 0x17, (sig [V128 I32] -> [V128]), -, simd, { lane: LaneIdx })
            (I16x8ExtractLaneS, "i16x8.extract_lane_s", 0xfd 0x18, (sig [V128] -> [I32]), -, simd, { lane: LaneIdx })
            (I16x8ExtractLaneU, "i16x8.extract_lane_u", 0xfd 0x19, (sig [V128] -> [I32]), -, simd, { lane: LaneIdx })
            (I16x8ReplaceLane, "i16x8.replace_lane", 0xfd 0x1a, (sig [V128 I32] -> [V128]), -, simd, { lane: LaneIdx })
            (I32x4ExtractLane, "i32x4.extract_lane", 0xfd 0x1b, (sig [V128] -> [I32]), -, simd, { lane: LaneIdx })
            (I32x4ReplaceLane, "i32x4.replace_lane", 0xfd 0x1c, (sig [V128 I32] -> [V128]), -, simd, { lane: LaneIdx })
            (I64x2ExtractLane, "i64x2.extract_lane", 0xfd 0x1d, (sig [V128] -> [I64]), -, simd, { lane: LaneIdx })
            (I64x2ReplaceLane, "i64x2.replace_lane", 0xfd 0x1e, (sig [V128 I64] -> [V128]), -, simd, { lane: LaneIdx })
            (F32x4ExtractLane, "f32x4.extract_lane", 0xfd 0x1f, (sig [V128] -> [F32]), -, simd, { lane: LaneIdx })
            (F32x4ReplaceLane, "f32x4.replace_lane", 0xfd 0x20, (sig [V128 F32] -> [V128]), -, simd, { lane: LaneIdx })
            (F64x2ExtractLane, "f64x2.extract_lane", 0xfd 0x21, (sig [V128] -> [F64]), -, simd, { lane: LaneIdx })
            (F64x2ReplaceLane, "f64x2.replace_lane", 0xfd 0x22, (sig [V128 F64] -> [V128]), -, simd, { lane: LaneIdx })
            (I8x16Eq, "i8x16.eq", 0xfd 0x23, (sig [V128 V128] -> [V128]), -, simd)
            (I16x8Eq, "i16x8.eq", 0xfd 0x2d, (sig [V128 V128] -> [V128]), -, simd)
            (I32x4Eq, "i32x4.eq", 0xfd 0x37, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Eq, "f32x4.eq", 0xfd 0x41, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Eq, "f64x2.eq", 0xfd 0x47, (sig [V128 V128] -> [V128]), -, simd)
            (V128Not, "v128.not", 0xfd 0x4d, (sig [V128] -> [V128]), -, simd)
            (V128And, "v128.and", 0xfd 0x4e, (sig [V128 V128] -> [V128]), -, simd)
            (V128AndNot, "v128.andnot", 0xfd 0x4f, (sig [V128 V128] -> [V128]), -, simd)
            (V128Or, "v128.or", 0xfd 0x50, (sig [V128 V128] -> [V128]), -, simd)
            (V128Xor, "v128.xor", 0xfd 0x51, (sig [V128 V128] -> [V128]), -, simd)
            (V128Bitselect, "v128.bitselect", 0xfd 0x52, (sig [V128 V128 V128] -> [V128]), -, simd)
            (V128AnyTrue, "v128.any_true", 0xfd 0x53, (sig [V128] -> [I32]), -, simd)
            (I8x16Neg, "i8x16.neg", 0xfd 0x61, (sig [V128] -> [V128]), -, simd)
            (I8x16AllTrue, "i8x16.all_true", 0xfd 0x63, (sig [V128] -> [I32]), -, simd)
            (I8x16Add, "i8x16.add", 0xfd 0x6e, (sig [V128 V128] -> [V128]), -, simd)
            (I8x16Sub, "i8x16.sub", 0xfd 0x71, (sig [V128 V128] -> [V128]), -, simd)
            (I16x8Neg, "i16x8.neg", 0xfd 0x81, (sig [V128] -> [V128]), -, simd)
            (I16x8AllTrue, "i16x8.all_true", 0xfd 0x83, (sig [V128] -> [I32]), -, simd)
            (I16x8Add, "i16x8.add", 0xfd 0x8e, (sig [V128 V128] -> [V128]), -, simd)
            (I16x8Sub, "i16x8.sub", 0xfd 0x91, (sig [V128 V128] -> [V128]), -, simd)
            (I16x8Mul, "i16x8.mul", 0xfd 0x95, (sig [V128 V128] -> [V128]), -, simd)
            (I32x4Neg, "i32x4.neg", 0xfd 0xa1, (sig [V128] -> [V128]), -, simd)
            (I32x4AllTrue, "i32x4.all_true", 0xfd 0xa3, (sig [V128] -> [I32]), -, simd)
            (I32x4Add, "i32x4.add", 0xfd 0xae, (sig [V128 V128] -> [V128]), -, simd)
            (I32x4Sub, "i32x4.sub", 0xfd 0xb1, (sig [V128 V128] -> [V128]), -, simd)
            (I32x4Mul, "i32x4.mul", 0xfd 0xb5, (sig [V128 V128] -> [V128]), -, simd)
            (I64x2Neg, "i64x2.neg", 0xfd 0xc1, (sig [V128] -> [V128]), -, simd)
            (I64x2AllTrue, "i64x2.all_true", 0xfd 0xc3, (sig [V128] -> [I32]), -, simd)
            (I64x2Add, "i64x2.add", 0xfd 0xce, (sig [V128 V128] -> [V128]), -, simd)
            (I64x2Sub, "i64x2.sub", 0xfd 0xd1, (sig [V128 V128] -> [V128]), -, simd)
            (I64x2Mul, "i64x2.mul", 0xfd 0xd5, (sig [V128 V128] -> [V128]), -, simd)
            (I64x2Eq, "i64x2.eq", 0xfd 0xd6, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Abs, "f32x4.abs", 0xfd 0xe0, (sig [V128] -> [V128]), -, simd)
            (F32x4Neg, "f32x4.neg", 0xfd 0xe1, (sig [V128] -> [V128]), -, simd)
            (F32x4Sqrt, "f32x4.sqrt", 0xfd 0xe3, (sig [V128] -> [V128]), -, simd)
            (F32x4Add, "f32x4.add", 0xfd 0xe4, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Sub, "f32x4.sub", 0xfd 0xe5, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Mul, "f32x4.mul", 0xfd 0xe6, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Div, "f32x4.div", 0xfd 0xe7, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Min, "f32x4.min", 0xfd 0xe8, (sig [V128 V128] -> [V128]), -, simd)
            (F32x4Max, "f32x4.max", 0xfd 0xe9, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Abs, "f64x2.abs", 0xfd 0xec, (sig [V128] -> [V128]), -, simd)
            (F64x2Neg, "f64x2.neg", 0xfd 0xed, (sig [V128] -> [V128]), -, simd)
            (F64x2Sqrt, "f64x2.sqrt", 0xfd 0xef, (sig [V128] -> [V128]), -, simd)
            (F64x2Add, "f64x2.add", 0xfd 0xf0, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Sub, "f64x2.sub", 0xfd 0xf1, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Mul, "f64x2.mul", 0xfd 0xf2, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Div, "f64x2.div", 0xfd 0xf3, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Min, "f64x2.min", 0xfd 0xf4, (sig [V128 V128] -> [V128]), -, simd)
            (F64x2Max, "f64x2.max", 0xfd 0xf5, (sig [V128 V128] -> [V128]), -, simd)

            // --- Atomics ---
            (AtomicNotify, "memory.atomic.notify", 0xfe 0x00, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I32AtomicWait, "memory.atomic.wait32", 0xfe 0x01, (sig [I32 I32 I64] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicWait, "memory.atomic.wait64", 0xfe 0x02, (sig [I32 I64 I64] -> [I32]), (x 3), threads, { imm: MemImm })
            (I32AtomicLoad, "i32.atomic.load", 0xfe 0x10, (sig [I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicLoad, "i64.atomic.load", 0xfe 0x11, (sig [I32] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicLoad8U, "i32.atomic.load8_u", 0xfe 0x12, (sig [I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicLoad16U, "i32.atomic.load16_u", 0xfe 0x13, (sig [I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicLoad8U, "i64.atomic.load8_u", 0xfe 0x14, (sig [I32] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicLoad16U, "i64.atomic.load16_u", 0xfe 0x15, (sig [I32] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicLoad32U, "i64.atomic.load32_u", 0xfe 0x16, (sig [I32] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicStore, "i32.atomic.store", 0xfe 0x17, (sig [I32 I32] -> []), (x 2), threads, { imm: MemImm })
            (I64AtomicStore, "i64.atomic.store", 0xfe 0x18, (sig [I32 I64] -> []), (x 3), threads, { imm: MemImm })
            (I32AtomicStore8, "i32.atomic.store8", 0xfe 0x19, (sig [I32 I32] -> []), (x 0), threads, { imm: MemImm })
            (I32AtomicStore16, "i32.atomic.store16", 0xfe 0x1a, (sig [I32 I32] -> []), (x 1), threads, { imm: MemImm })
            (I64AtomicStore8, "i64.atomic.store8", 0xfe 0x1b, (sig [I32 I64] -> []), (x 0), threads, { imm: MemImm })
            (I64AtomicStore16, "i64.atomic.store16", 0xfe 0x1c, (sig [I32 I64] -> []), (x 1), threads, { imm: MemImm })
            (I64AtomicStore32, "i64.atomic.store32", 0xfe 0x1d, (sig [I32 I64] -> []), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwAdd, "i32.atomic.rmw.add", 0xfe 0x1e, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwAdd, "i64.atomic.rmw.add", 0xfe 0x1f, (sig [I32 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8AddU, "i32.atomic.rmw8.add_u", 0xfe 0x20, (sig [I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16AddU, "i32.atomic.rmw16.add_u", 0xfe 0x21, (sig [I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8AddU, "i64.atomic.rmw8.add_u", 0xfe 0x22, (sig [I32 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16AddU, "i64.atomic.rmw16.add_u", 0xfe 0x23, (sig [I32 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32AddU, "i64.atomic.rmw32.add_u", 0xfe 0x24, (sig [I32 I64] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwSub, "i32.atomic.rmw.sub", 0xfe 0x25, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwSub, "i64.atomic.rmw.sub", 0xfe 0x26, (sig [I32 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8SubU, "i32.atomic.rmw8.sub_u", 0xfe 0x27, (sig [I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16SubU, "i32.atomic.rmw16.sub_u", 0xfe 0x28, (sig [I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8SubU, "i64.atomic.rmw8.sub_u", 0xfe 0x29, (sig [I32 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16SubU, "i64.atomic.rmw16.sub_u", 0xfe 0x2a, (sig [I32 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32SubU, "i64.atomic.rmw32.sub_u", 0xfe 0x2b, (sig [I32 I64] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwAnd, "i32.atomic.rmw.and", 0xfe 0x2c, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwAnd, "i64.atomic.rmw.and", 0xfe 0x2d, (sig [I32 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8AndU, "i32.atomic.rmw8.and_u", 0xfe 0x2e, (sig [I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16AndU, "i32.atomic.rmw16.and_u", 0xfe 0x2f, (sig [I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8AndU, "i64.atomic.rmw8.and_u", 0xfe 0x30, (sig [I32 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16AndU, "i64.atomic.rmw16.and_u", 0xfe 0x31, (sig [I32 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32AndU, "i64.atomic.rmw32.and_u", 0xfe 0x32, (sig [I32 I64] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwOr, "i32.atomic.rmw.or", 0xfe 0x33, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwOr, "i64.atomic.rmw.or", 0xfe 0x34, (sig [I32 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8OrU, "i32.atomic.rmw8.or_u", 0xfe 0x35, (sig [I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16OrU, "i32.atomic.rmw16.or_u", 0xfe 0x36, (sig [I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8OrU, "i64.atomic.rmw8.or_u", 0xfe 0x37, (sig [I32 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16OrU, "i64.atomic.rmw16.or_u", 0xfe 0x38, (sig [I32 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32OrU, "i64.atomic.rmw32.or_u", 0xfe 0x39, (sig [I32 I64] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwXor, "i32.atomic.rmw.xor", 0xfe 0x3a, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwXor, "i64.atomic.rmw.xor", 0xfe 0x3b, (sig [I32 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8XorU, "i32.atomic.rmw8.xor_u", 0xfe 0x3c, (sig [I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16XorU, "i32.atomic.rmw16.xor_u", 0xfe 0x3d, (sig [I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8XorU, "i64.atomic.rmw8.xor_u", 0xfe 0x3e, (sig [I32 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16XorU, "i64.atomic.rmw16.xor_u", 0xfe 0x3f, (sig [I32 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32XorU, "i64.atomic.rmw32.xor_u", 0xfe 0x40, (sig [I32 I64] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwXchg, "i32.atomic.rmw.xchg", 0xfe 0x41, (sig [I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwXchg, "i64.atomic.rmw.xchg", 0xfe 0x42, (sig [I32 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8XchgU, "i32.atomic.rmw8.xchg_u", 0xfe 0x43, (sig [I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16XchgU, "i32.atomic.rmw16.xchg_u", 0xfe 0x44, (sig [I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8XchgU, "i64.atomic.rmw8.xchg_u", 0xfe 0x45, (sig [I32 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16XchgU, "i64.atomic.rmw16.xchg_u", 0xfe 0x46, (sig [I32 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32XchgU, "i64.atomic.rmw32.xchg_u", 0xfe 0x47, (sig [I32 I64] -> [I64]), (x 2), threads, { imm: MemImm })
            (I32AtomicRmwCmpxchg, "i32.atomic.rmw.cmpxchg", 0xfe 0x48, (sig [I32 I32 I32] -> [I32]), (x 2), threads, { imm: MemImm })
            (I64AtomicRmwCmpxchg, "i64.atomic.rmw.cmpxchg", 0xfe 0x49, (sig [I32 I64 I64] -> [I64]), (x 3), threads, { imm: MemImm })
            (I32AtomicRmw8CmpxchgU, "i32.atomic.rmw8.cmpxchg_u", 0xfe 0x4a, (sig [I32 I32 I32] -> [I32]), (x 0), threads, { imm: MemImm })
            (I32AtomicRmw16CmpxchgU, "i32.atomic.rmw16.cmpxchg_u", 0xfe 0x4b, (sig [I32 I32 I32] -> [I32]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw8CmpxchgU, "i64.atomic.rmw8.cmpxchg_u", 0xfe 0x4c, (sig [I32 I64 I64] -> [I64]), (x 0), threads, { imm: MemImm })
            (I64AtomicRmw16CmpxchgU, "i64.atomic.rmw16.cmpxchg_u", 0xfe 0x4d, (sig [I32 I64 I64] -> [I64]), (x 1), threads, { imm: MemImm })
            (I64AtomicRmw32CmpxchgU, "i64.atomic.rmw32.cmpxchg_u", 0xfe 0x4e, (sig [I32 I64 I64] -> [I64]), (x 2), threads, { imm: MemImm })
        }
    };
}

for_each_operator!(define_operators);

impl OpCode {
    /// Recover an `OpCode` from its `u16` representation.
    ///
    /// Callers must pass a value previously obtained from `as u16` on a
    /// valid `OpCode`; the compiler's flat code stream satisfies this.
    #[inline(always)]
    pub fn from_u16(code: u16) -> OpCode {
        // SAFETY: OpCode is repr(u16) and `code` originates from a valid tag.
        unsafe { std::mem::transmute(code) }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Streams operators out of a function body or initializer expression.
pub struct OperatorReader<'a> {
    cursor: Cursor<'a>,
    features: FeatureSpec,
}

impl<'a> OperatorReader<'a> {
    pub fn new(cursor: Cursor<'a>, features: FeatureSpec) -> Self {
        Self { cursor, features }
    }

    /// Absolute byte offset of the next operator.
    pub fn offset(&self) -> usize {
        self.cursor.offset()
    }

    pub fn is_eof(&self) -> bool {
        self.cursor.is_eof()
    }

    pub fn read(&mut self) -> Result<Operator, DecodeError> {
        read_operator(&mut self.cursor, &self.features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(bytes: &[u8], features: FeatureSpec) -> Result<Operator, DecodeError> {
        read_operator(&mut Cursor::new(bytes), &features)
    }

    #[test]
    fn decodes_simple_operators() {
        let features = FeatureSpec::default();
        assert_eq!(read_one(&[0x6a], features).unwrap(), Operator::I32Add);
        assert_eq!(
            read_one(&[0x41, 0x2a], features).unwrap(),
            Operator::I32Const { value: 42 }
        );
        assert_eq!(
            read_one(&[0x28, 0x02, 0x08], features).unwrap(),
            Operator::I32Load {
                imm: MemImm { align_log2: 2, offset: 8 }
            }
        );
        assert_eq!(
            read_one(&[0x0e, 0x02, 0x00, 0x01, 0x02], features).unwrap(),
            Operator::BrTable {
                targets: vec![0, 1].into_boxed_slice(),
                default: 2
            }
        );
    }

    #[test]
    fn decodes_prefixed_operators() {
        let features = FeatureSpec::all();
        assert_eq!(
            read_one(&[0xfc, 0x00], features).unwrap(),
            Operator::I32TruncSatF32S
        );
        assert_eq!(
            read_one(&[0xfd, 0x0f], features).unwrap(),
            Operator::I8x16Splat
        );
        assert_eq!(
            read_one(&[0xfe, 0x00, 0x02, 0x00], features).unwrap(),
            Operator::AtomicNotify {
                imm: MemImm { align_log2: 2, offset: 0 }
            }
        );
    }

    #[test]
    fn feature_gated_opcode_rejected_when_disabled() {
        let mvp = FeatureSpec::mvp();
        assert!(matches!(
            read_one(&[0xfd, 0x0f], mvp),
            Err(DecodeError::FeatureDisabled { feature: "simd", .. })
        ));
        assert!(matches!(
            read_one(&[0xc0], mvp),
            Err(DecodeError::FeatureDisabled { feature: "sign-extension", .. })
        ));
    }

    #[test]
    fn unknown_opcode_rejected_with_offset() {
        assert!(matches!(
            read_one(&[0xd0], FeatureSpec::all()),
            Err(DecodeError::UnknownOpcode { offset: 0, .. })
        ));
    }

    #[test]
    fn signatures_come_from_the_table() {
        let (params, results) = Operator::I32Add.simple_signature().unwrap();
        assert_eq!(params, &[ValueType::I32, ValueType::I32]);
        assert_eq!(results, &[ValueType::I32]);
        assert!(Operator::Drop.simple_signature().is_none());
    }

    #[test]
    fn memory_access_shapes() {
        let op = read_one(&[0x29, 0x03, 0x00], FeatureSpec::default()).unwrap();
        let access = op.memory_access().unwrap();
        assert_eq!(access.natural_align_log2, 3);
        assert!(!access.requires_exact_align);
        assert!(Operator::I32Add.memory_access().is_none());
    }
}
