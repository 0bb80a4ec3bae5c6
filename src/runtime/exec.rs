//! The threaded-code interpreter.
//!
//! Executes the flat op stream produced by the compiler against a
//! [`Stack`]. Control flow uses a runtime control-entry stack (one entry
//! per open block) and a call-frame stack; `br` unwinds operand slots to
//! the target entry and jumps, exactly as the compiler's `BlockInfo`
//! layout prescribes.
//!
//! Guest memory accesses go straight through the linear memory's base
//! pointer with no bounds checks; the surrounding `enter_guarded` region
//! turns faults on guard pages into typed traps. Division, invalid float
//! conversions, indirect-call checks, and explicit `unreachable` trap in
//! line.
//!
//! Safepoints: branches and calls check the compartment's termination
//! flag, so a terminated compartment stops guest code at the next
//! boundary.

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::compile::{slot_bytes, BlockInfo, CompiledFunction};
use crate::operators::OpCode;
use crate::runtime::instance::InstanceInner;
use crate::runtime::stack::Stack;
use crate::runtime::{
    Function, FunctionInstance, Tag, Trap, TrapFrame, TrapKind, Value,
};
use crate::trap_handler::{enter_guarded, GuardKind};
use crate::types::ValueType;

/// Guest call depth limit; the operand stack has its own guard page, this
/// bounds the host-side frame bookkeeping.
const MAX_CALL_DEPTH: usize = 8192;

/// Invoke a function with host-provided, type-checked arguments.
pub(crate) fn invoke_function(function: &Function, args: &[Value]) -> Result<Vec<Value>, Trap> {
    let ty = function.ty();
    if args.len() != ty.params().len() {
        return Err(Trap::new(
            TrapKind::InvalidArgument,
            format!("expected {} argument(s), got {}", ty.params().len(), args.len()),
        ));
    }
    for (arg, &expected) in args.iter().zip(ty.params().iter()) {
        if arg.ty() != expected {
            return Err(Trap::new(
                TrapKind::InvalidArgument,
                format!("argument type mismatch: expected {expected}, got {}", arg.ty()),
            ));
        }
    }

    let (instance, code, function_index) = match &*function.0 {
        FunctionInstance::Host { thunk, .. } => {
            let results = thunk(args)?;
            check_host_results(&ty.results(), &results)?;
            return Ok(results);
        }
        FunctionInstance::Wasm { instance, code, function_index, .. } => {
            let instance = instance.upgrade().ok_or_else(|| {
                Trap::new(TrapKind::InvalidArgument, "instance has been torn down")
            })?;
            (instance, code.clone(), *function_index)
        }
    };

    let compartment = instance.compartment.upgrade().ok_or_else(|| {
        Trap::new(TrapKind::InvalidArgument, "compartment has been torn down")
    })?;
    if compartment.terminated.load(Ordering::SeqCst) {
        return Err(Trap::new(TrapKind::Terminated, "compartment terminated"));
    }

    // Non-shared memories are single-threaded: stamp them now so a second
    // thread's entry traps instead of racing.
    for memory in &instance.memories {
        memory.0.claim_thread()?;
    }

    let mut stack = Stack::new();
    let stack_guard = stack.guard_region();
    // SAFETY: a fresh stack has ample space for the argument slots.
    unsafe {
        for arg in args {
            match *arg {
                Value::V128(v) => stack.push_u128(v),
                v => stack.push_u64(v.to_bits()),
            }
        }
        stack.push_zeroes(code.frame_bytes - code.param_bytes);
    }

    let mut machine = Machine {
        stack,
        controls: Vec::new(),
        frames: Vec::new(),
        current: ActiveFrame::new(code, instance, function_index, 0, 0),
        pc: 0,
        compartment: compartment.clone(),
    };

    let mut regions = vec![stack_guard];
    regions.extend(compartment.memory_regions.lock().unwrap().iter().copied());

    let outcome = match enter_guarded(&regions, || machine.run()) {
        Ok(result) => result,
        Err(GuardKind::StackOverflow) => {
            Err(Trap::new(TrapKind::StackOverflow, "execution stack exhausted"))
        }
        Err(GuardKind::MemoryAccess) => {
            Err(Trap::new(TrapKind::AccessViolation, "out-of-bounds memory access"))
        }
    };

    match outcome {
        Ok(()) => {
            // Results were moved down to the frame base by the return.
            let mut results = Vec::with_capacity(ty.results().len());
            let mut offset = 0u32;
            for &result_ty in ty.results().iter() {
                // SAFETY: the returned frame holds exactly the result slots.
                let value = unsafe {
                    match result_ty {
                        ValueType::V128 => {
                            let lo = machine.stack.read_u64(offset);
                            let hi = machine.stack.read_u64(offset + 8);
                            Value::V128(((hi as u128) << 64) | lo as u128)
                        }
                        _ => Value::from_bits(result_ty, machine.stack.read_u64(offset)),
                    }
                };
                offset += slot_bytes(result_ty);
                results.push(value);
            }
            Ok(results)
        }
        Err(trap) => {
            let trap = machine.annotate(trap);
            tracing::debug!(kind = trap.kind().as_str(), "guest trapped");
            Err(trap)
        }
    }
}

fn check_host_results(expected: &[ValueType], results: &[Value]) -> Result<(), Trap> {
    let matches = results.len() == expected.len()
        && results.iter().zip(expected).all(|(value, &ty)| value.ty() == ty);
    if matches {
        Ok(())
    } else {
        Err(Trap::new(
            TrapKind::InvalidArgument,
            "host function returned mismatched results",
        ))
    }
}

// ---------------------------------------------------------------------------
// Machine state
// ---------------------------------------------------------------------------

struct ActiveFrame {
    code: Arc<CompiledFunction>,
    instance: Arc<InstanceInner>,
    function_index: u32,
    locals_sp: u32,
    controls_start: usize,
    /// Cached base of memory 0; growth never moves it.
    mem_base: *mut u8,
}

impl ActiveFrame {
    fn new(
        code: Arc<CompiledFunction>,
        instance: Arc<InstanceInner>,
        function_index: u32,
        locals_sp: u32,
        controls_start: usize,
    ) -> Self {
        let mem_base = instance
            .memories
            .first()
            .map(|memory| memory.0.base())
            .unwrap_or(std::ptr::null_mut());
        Self { code, instance, function_index, locals_sp, controls_start, mem_base }
    }
}

struct CallFrame {
    frame: ActiveFrame,
    return_pc: usize,
}

#[derive(Clone)]
struct Exception {
    tag: Tag,
    args: Vec<Value>,
}

enum EntryKind {
    Block,
    Loop,
    /// An open `try` whose catch clause (if any) is in `BlockInfo`.
    Try { block_index: u32 },
    /// A `try` whose handler is running; holds the caught exception for
    /// `rethrow`.
    Catch { exception: Exception },
}

struct ControlEntry {
    /// Operand-stack byte offset to unwind to on branch.
    return_sp: u32,
    /// Branch target: for blocks the `end` pc, for loops the pc after the
    /// `loop` op.
    target_pc: u32,
    /// Bytes of results (params for loops) a branch preserves.
    arity_bytes: u32,
    kind: EntryKind,
}

struct Machine {
    stack: Stack,
    controls: Vec<ControlEntry>,
    frames: Vec<CallFrame>,
    current: ActiveFrame,
    pc: usize,
    compartment: Arc<crate::runtime::CompartmentInner>,
}

// ---------------------------------------------------------------------------
// Operator families
// ---------------------------------------------------------------------------

macro_rules! binop_i32 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_i32();
        let a = $m.pop_i32();
        $m.push_i32($f(a, b));
    }};
}

macro_rules! binop_i64 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_i64();
        let a = $m.pop_i64();
        $m.push_i64($f(a, b));
    }};
}

macro_rules! binop_f32 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_f32();
        let a = $m.pop_f32();
        $m.push_f32($f(a, b));
    }};
}

macro_rules! binop_f64 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_f64();
        let a = $m.pop_f64();
        $m.push_f64($f(a, b));
    }};
}

macro_rules! unop_i32 {
    ($m:expr, $f:expr) => {{
        let a = $m.pop_i32();
        $m.push_i32($f(a));
    }};
}

macro_rules! unop_i64 {
    ($m:expr, $f:expr) => {{
        let a = $m.pop_i64();
        $m.push_i64($f(a));
    }};
}

macro_rules! unop_f32 {
    ($m:expr, $f:expr) => {{
        let a = $m.pop_f32();
        $m.push_f32($f(a));
    }};
}

macro_rules! unop_f64 {
    ($m:expr, $f:expr) => {{
        let a = $m.pop_f64();
        $m.push_f64($f(a));
    }};
}

macro_rules! cmp_i32 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_i32();
        let a = $m.pop_i32();
        $m.push_bool($f(a, b));
    }};
}

macro_rules! cmp_i64 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_i64();
        let a = $m.pop_i64();
        $m.push_bool($f(a, b));
    }};
}

macro_rules! cmp_f32 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_f32();
        let a = $m.pop_f32();
        $m.push_bool($f(a, b));
    }};
}

macro_rules! cmp_f64 {
    ($m:expr, $f:expr) => {{
        let b = $m.pop_f64();
        let a = $m.pop_f64();
        $m.push_bool($f(a, b));
    }};
}

macro_rules! div_s {
    ($m:expr, $pop:ident, $push:ident, $int:ty) => {{
        let b = $m.$pop();
        let a = $m.$pop();
        if b == 0 {
            return Err(Trap::new(TrapKind::IntegerDivideByZero, "integer division by zero"));
        }
        if a == <$int>::MIN && b == -1 {
            return Err(Trap::new(TrapKind::IntegerOverflow, "signed division overflow"));
        }
        $m.$push(a.wrapping_div(b));
    }};
}

macro_rules! div_u {
    ($m:expr, $pop:ident, $push:ident, $uint:ty, $int:ty) => {{
        let b = $m.$pop() as $uint;
        let a = $m.$pop() as $uint;
        if b == 0 {
            return Err(Trap::new(TrapKind::IntegerDivideByZero, "integer division by zero"));
        }
        $m.$push((a / b) as $int);
    }};
}

macro_rules! rem_s {
    ($m:expr, $pop:ident, $push:ident, $int:ty) => {{
        let b = $m.$pop();
        let a = $m.$pop();
        if b == 0 {
            return Err(Trap::new(TrapKind::IntegerDivideByZero, "integer remainder by zero"));
        }
        $m.$push(if a == <$int>::MIN && b == -1 { 0 } else { a.wrapping_rem(b) });
    }};
}

macro_rules! rem_u {
    ($m:expr, $pop:ident, $push:ident, $uint:ty, $int:ty) => {{
        let b = $m.$pop() as $uint;
        let a = $m.$pop() as $uint;
        if b == 0 {
            return Err(Trap::new(TrapKind::IntegerDivideByZero, "integer remainder by zero"));
        }
        $m.$push((a % b) as $int);
    }};
}

macro_rules! trunc_s {
    ($m:expr, $pop:ident, $push:ident, $int:ty, $min:expr, $max:expr) => {{
        let a = $m.$pop();
        if a.is_nan() {
            return Err(Trap::new(TrapKind::InvalidFloatConversion, "NaN in float-to-int conversion"));
        }
        let t = a.trunc();
        if t >= $max || t < $min {
            return Err(Trap::new(TrapKind::IntegerOverflow, "float-to-int overflow"));
        }
        $m.$push(t as $int);
    }};
}

macro_rules! trunc_u {
    ($m:expr, $pop:ident, $push:ident, $uint:ty, $int:ty, $max:expr) => {{
        let a = $m.$pop();
        if a.is_nan() {
            return Err(Trap::new(TrapKind::InvalidFloatConversion, "NaN in float-to-int conversion"));
        }
        let t = a.trunc();
        if t >= $max || t < 0.0 {
            return Err(Trap::new(TrapKind::IntegerOverflow, "float-to-int overflow"));
        }
        $m.$push(t as $uint as $int);
    }};
}

macro_rules! mem_load {
    ($m:expr, $imm:expr, $read:ty, $push:ident, $as:ty) => {{
        let ptr = $m.mem_addr($imm) as *const $read;
        // SAFETY: the address lands inside the memory reservation; OOB
        // faults recover through the guard handler.
        let value = unsafe { ptr.read_unaligned() };
        $m.$push(value as $as);
    }};
}

macro_rules! mem_store {
    ($m:expr, $imm:expr, $pop:ident, $write:ty) => {{
        let value = $m.$pop() as $write;
        let ptr = $m.mem_addr($imm) as *mut $write;
        // SAFETY: as in mem_load.
        unsafe { ptr.write_unaligned(value) };
    }};
}

macro_rules! atomic_load {
    ($m:expr, $imm:expr, $atomic:ty, $size:literal, $push:ident, $as:ty) => {{
        let ptr = $m.atomic_addr($imm, $size)? as *const $atomic;
        // SAFETY: aligned (checked) and inside the reservation.
        let value = unsafe { &*ptr }.load(Ordering::SeqCst);
        $m.$push(value as $as);
    }};
}

macro_rules! atomic_store {
    ($m:expr, $imm:expr, $atomic:ty, $size:literal, $pop:ident, $native:ty) => {{
        let value = $m.$pop() as $native;
        let ptr = $m.atomic_addr($imm, $size)? as *const $atomic;
        // SAFETY: as in atomic_load.
        unsafe { &*ptr }.store(value, Ordering::SeqCst);
    }};
}

macro_rules! atomic_rmw {
    ($m:expr, $imm:expr, $atomic:ty, $size:literal, $native:ty, $push:ident, $as:ty, $method:ident) => {{
        let operand = $m.pop_raw() as $native;
        let ptr = $m.atomic_addr($imm, $size)? as *const $atomic;
        // SAFETY: as in atomic_load.
        let old = unsafe { &*ptr }.$method(operand, Ordering::SeqCst);
        $m.$push(old as $as);
    }};
}

macro_rules! atomic_cmpxchg {
    ($m:expr, $imm:expr, $atomic:ty, $size:literal, $native:ty, $push:ident, $as:ty) => {{
        let replacement = $m.pop_raw() as $native;
        let expected = $m.pop_raw() as $native;
        let ptr = $m.atomic_addr($imm, $size)? as *const $atomic;
        // SAFETY: as in atomic_load.
        let old = match unsafe { &*ptr }.compare_exchange(
            expected,
            replacement,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(value) | Err(value) => value,
        };
        $m.$push(old as $as);
    }};
}

macro_rules! simd_binop {
    ($m:expr, $lane:ty, $f:expr) => {{
        let b = $m.pop_v128().to_le_bytes();
        let a = $m.pop_v128().to_le_bytes();
        let mut out = [0u8; 16];
        let size = std::mem::size_of::<$lane>();
        for i in 0..16 / size {
            let x = <$lane>::from_le_bytes(a[i * size..(i + 1) * size].try_into().unwrap());
            let y = <$lane>::from_le_bytes(b[i * size..(i + 1) * size].try_into().unwrap());
            let r: $lane = $f(x, y);
            out[i * size..(i + 1) * size].copy_from_slice(&r.to_le_bytes());
        }
        $m.push_v128(u128::from_le_bytes(out));
    }};
}

macro_rules! simd_unop {
    ($m:expr, $lane:ty, $f:expr) => {{
        let a = $m.pop_v128().to_le_bytes();
        let mut out = [0u8; 16];
        let size = std::mem::size_of::<$lane>();
        for i in 0..16 / size {
            let x = <$lane>::from_le_bytes(a[i * size..(i + 1) * size].try_into().unwrap());
            let r: $lane = $f(x);
            out[i * size..(i + 1) * size].copy_from_slice(&r.to_le_bytes());
        }
        $m.push_v128(u128::from_le_bytes(out));
    }};
}

macro_rules! simd_cmp {
    ($m:expr, $lane:ty, $f:expr) => {{
        let b = $m.pop_v128().to_le_bytes();
        let a = $m.pop_v128().to_le_bytes();
        let mut out = [0u8; 16];
        let size = std::mem::size_of::<$lane>();
        for i in 0..16 / size {
            let x = <$lane>::from_le_bytes(a[i * size..(i + 1) * size].try_into().unwrap());
            let y = <$lane>::from_le_bytes(b[i * size..(i + 1) * size].try_into().unwrap());
            let fill = if $f(x, y) { 0xffu8 } else { 0 };
            out[i * size..(i + 1) * size].fill(fill);
        }
        $m.push_v128(u128::from_le_bytes(out));
    }};
}

macro_rules! simd_all_true {
    ($m:expr, $size:literal) => {{
        let a = $m.pop_v128().to_le_bytes();
        let all = a.chunks_exact($size).all(|lane| lane.iter().any(|&b| b != 0));
        $m.push_bool(all);
    }};
}

macro_rules! simd_splat {
    ($m:expr, $pop:ident, $lane:ty) => {{
        let v = $m.$pop() as $lane;
        let mut out = [0u8; 16];
        let size = std::mem::size_of::<$lane>();
        for i in 0..16 / size {
            out[i * size..(i + 1) * size].copy_from_slice(&v.to_le_bytes());
        }
        $m.push_v128(u128::from_le_bytes(out));
    }};
}

macro_rules! simd_extract {
    ($m:expr, $lane:expr, $lane_ty:ty, $push:ident, $as:ty) => {{
        let a = $m.pop_v128().to_le_bytes();
        let size = std::mem::size_of::<$lane_ty>();
        let i = $lane as usize;
        let v = <$lane_ty>::from_le_bytes(a[i * size..(i + 1) * size].try_into().unwrap());
        $m.$push(v as $as);
    }};
}

macro_rules! simd_replace {
    ($m:expr, $lane:expr, $lane_ty:ty, $pop:ident) => {{
        let v = $m.$pop() as $lane_ty;
        let mut a = $m.pop_v128().to_le_bytes();
        let size = std::mem::size_of::<$lane_ty>();
        let i = $lane as usize;
        a[i * size..(i + 1) * size].copy_from_slice(&v.to_le_bytes());
        $m.push_v128(u128::from_le_bytes(a));
    }};
}

// Float min/max with wasm semantics: NaN propagates, -0 < +0.

fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

// ---------------------------------------------------------------------------
// The interpreter loop
// ---------------------------------------------------------------------------

impl Machine {
    #[inline(always)]
    fn pop_raw(&mut self) -> u64 {
        // SAFETY: the validator guarantees stack discipline for compiled code.
        unsafe { self.stack.pop_u64() }
    }

    #[inline(always)]
    fn push_raw(&mut self, value: u64) {
        // SAFETY: overflow lands on the stack guard page.
        unsafe { self.stack.push_u64(value) }
    }

    #[inline(always)]
    fn pop_i32(&mut self) -> i32 {
        self.pop_raw() as u32 as i32
    }

    #[inline(always)]
    fn pop_i64(&mut self) -> i64 {
        self.pop_raw() as i64
    }

    #[inline(always)]
    fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop_raw() as u32)
    }

    #[inline(always)]
    fn pop_f64(&mut self) -> f64 {
        f64::from_bits(self.pop_raw())
    }

    #[inline(always)]
    fn pop_v128(&mut self) -> u128 {
        // SAFETY: as in pop_raw.
        unsafe { self.stack.pop_u128() }
    }

    #[inline(always)]
    fn push_i32(&mut self, value: i32) {
        self.push_raw(value as u32 as u64);
    }

    #[inline(always)]
    fn push_i64(&mut self, value: i64) {
        self.push_raw(value as u64);
    }

    #[inline(always)]
    fn push_f32(&mut self, value: f32) {
        self.push_raw(value.to_bits() as u64);
    }

    #[inline(always)]
    fn push_f64(&mut self, value: f64) {
        self.push_raw(value.to_bits());
    }

    #[inline(always)]
    fn push_v128(&mut self, value: u128) {
        // SAFETY: as in push_raw.
        unsafe { self.stack.push_u128(value) }
    }

    #[inline(always)]
    fn push_bool(&mut self, value: bool) {
        self.push_i32(value as i32);
    }

    fn pop_value(&mut self, ty: ValueType) -> Value {
        match ty {
            ValueType::V128 => Value::V128(self.pop_v128()),
            _ => Value::from_bits(ty, self.pop_raw()),
        }
    }

    fn push_value(&mut self, value: Value) {
        match value {
            Value::V128(v) => self.push_v128(v),
            v => self.push_raw(v.to_bits()),
        }
    }

    /// Pop the guest address and compute the host pointer for a plain
    /// access. No bounds check: the reservation's guard absorbs OOB.
    #[inline(always)]
    fn mem_addr(&mut self, offset_imm: u64) -> *mut u8 {
        let address = self.pop_raw() as u32 as u64;
        // SAFETY: address + offset < 2^33, inside the reservation.
        unsafe { self.current.mem_base.add((address + offset_imm) as usize) }
    }

    /// As `mem_addr` but enforcing the exact natural alignment atomics
    /// require.
    #[inline(always)]
    fn atomic_addr(&mut self, offset_imm: u64, size: u64) -> Result<*mut u8, Trap> {
        let address = self.pop_raw() as u32 as u64;
        let effective = address + offset_imm;
        if effective % size != 0 {
            return Err(Trap::new(TrapKind::AccessViolation, "misaligned atomic access"));
        }
        // SAFETY: as in mem_addr.
        Ok(unsafe { self.current.mem_base.add(effective as usize) })
    }

    #[inline(always)]
    fn check_terminated(&self) -> Result<(), Trap> {
        if self.compartment.terminated.load(Ordering::Relaxed) {
            return Err(Trap::new(TrapKind::Terminated, "compartment terminated"));
        }
        Ok(())
    }

    fn block_info(&self, imm: u64) -> BlockInfo {
        self.current.code.blocks[imm as usize]
    }

    fn push_entry(&mut self, info: BlockInfo, kind: EntryKind) {
        let is_loop = matches!(kind, EntryKind::Loop);
        self.controls.push(ControlEntry {
            return_sp: self.stack.sp() - info.param_slots as u32 * 8,
            target_pc: if is_loop { self.pc as u32 } else { info.end_pc },
            arity_bytes: if is_loop {
                info.param_slots as u32 * 8
            } else {
                info.result_slots as u32 * 8
            },
            kind,
        });
    }

    /// Branch to the control entry `depth` levels up; a depth past the
    /// current frame's entries is a branch to the function label, i.e. a
    /// return. Returns true when the outermost frame returned.
    fn do_br(&mut self, depth: u32) -> bool {
        let live = self.controls.len() - self.current.controls_start;
        if depth as usize >= live {
            return self.do_return();
        }
        let index = self.controls.len() - 1 - depth as usize;
        let entry = &self.controls[index];
        let arity = entry.arity_bytes;
        let return_sp = entry.return_sp;
        let target_pc = entry.target_pc;
        let is_loop = matches!(entry.kind, EntryKind::Loop);

        let src = self.stack.sp() - arity;
        // SAFETY: both ranges are live stack bytes below sp.
        unsafe {
            self.stack.copy_down(src, return_sp, arity);
            self.stack.set_sp(return_sp + arity);
        }
        if is_loop {
            self.pc = target_pc as usize;
            self.controls.truncate(index + 1);
        } else {
            self.pc = target_pc as usize + 1;
            self.controls.truncate(index);
        }
        false
    }

    /// Return from the current function; true when it was the entry frame.
    fn do_return(&mut self) -> bool {
        let result_bytes = self.current.code.result_bytes;
        let src = self.stack.sp() - result_bytes;
        // SAFETY: results are the topmost live bytes; the target is the
        // frame base.
        unsafe {
            self.stack.copy_down(src, self.current.locals_sp, result_bytes);
            self.stack.set_sp(self.current.locals_sp + result_bytes);
        }
        self.controls.truncate(self.current.controls_start);
        match self.frames.pop() {
            Some(caller) => {
                self.pc = caller.return_pc;
                self.current = caller.frame;
                false
            }
            None => true,
        }
    }

    fn do_call(&mut self, function: &Function) -> Result<(), Trap> {
        match &*function.0 {
            FunctionInstance::Host { ty, thunk } => {
                let params = ty.params();
                let mut args = Vec::with_capacity(params.len());
                for &param_ty in params.iter().rev() {
                    args.push(self.pop_value(param_ty));
                }
                args.reverse();
                let results = thunk(&args)?;
                check_host_results(ty.results().as_slice(), &results)?;
                for value in results {
                    self.push_value(value);
                }
                Ok(())
            }
            FunctionInstance::Wasm { instance, code, function_index, .. } => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(Trap::new(TrapKind::StackOverflow, "call depth exceeded"));
                }
                let instance = instance.upgrade().ok_or_else(|| {
                    Trap::new(TrapKind::InvalidArgument, "instance has been torn down")
                })?;
                let locals_sp = self.stack.sp() - code.param_bytes;
                let callee = ActiveFrame::new(
                    code.clone(),
                    instance,
                    *function_index,
                    locals_sp,
                    self.controls.len(),
                );
                let caller = std::mem::replace(&mut self.current, callee);
                self.frames.push(CallFrame { frame: caller, return_pc: self.pc });
                // SAFETY: zero-initialize the non-parameter locals.
                unsafe {
                    self.stack.push_zeroes(self.current.code.frame_bytes - self.current.code.param_bytes);
                }
                self.pc = 0;
                Ok(())
            }
        }
    }

    /// Unwind to the nearest matching catch clause; errors with an
    /// uncaught-exception trap if none exists up the guest stack.
    fn raise(&mut self, exception: Exception) -> Result<(), Trap> {
        loop {
            while self.controls.len() > self.current.controls_start {
                let open_try = match &self.controls.last().expect("length checked").kind {
                    EntryKind::Try { block_index } => Some(*block_index),
                    _ => None,
                };
                if let Some(block_index) = open_try {
                    let info = self.current.code.blocks[block_index as usize];
                    if info.else_pc != u32::MAX {
                        let handler_tag =
                            &self.current.instance.tags[info.catch_tag as usize];
                        if Tag::same_identity(handler_tag, &exception.tag) {
                            let entry = self.controls.last_mut().expect("length checked");
                            let return_sp = entry.return_sp;
                            entry.kind = EntryKind::Catch { exception: exception.clone() };
                            // SAFETY: unwinding to a recorded lower sp.
                            unsafe { self.stack.set_sp(return_sp) };
                            for value in &exception.args {
                                self.push_value(*value);
                            }
                            self.pc = info.else_pc as usize + 1;
                            return Ok(());
                        }
                    }
                }
                self.controls.pop();
            }
            match self.frames.pop() {
                Some(caller) => {
                    // SAFETY: discard the faulting frame's stack space.
                    unsafe { self.stack.set_sp(self.current.locals_sp) };
                    self.pc = caller.return_pc;
                    self.current = caller.frame;
                }
                None => {
                    return Err(Trap::new(TrapKind::UncaughtException, "uncaught exception"));
                }
            }
        }
    }

    fn annotate(&self, mut trap: Trap) -> Trap {
        trap = trap.with_frame(TrapFrame {
            function_index: self.current.function_index,
            pc: self.pc,
        });
        for frame in self.frames.iter().rev() {
            trap = trap.with_frame(TrapFrame {
                function_index: frame.frame.function_index,
                pc: frame.return_pc,
            });
        }
        trap
    }

    fn run(&mut self) -> Result<(), Trap> {
        loop {
            let op = self.current.code.ops[self.pc];
            self.pc += 1;
            match OpCode::from_u16(op.code) {
                // --- Control ---
                OpCode::Unreachable => {
                    return Err(Trap::new(TrapKind::Unreachable, "unreachable executed"));
                }
                OpCode::Nop => {}
                OpCode::Block => {
                    let info = self.block_info(op.imm);
                    self.push_entry(info, EntryKind::Block);
                }
                OpCode::Loop => {
                    let info = self.block_info(op.imm);
                    self.push_entry(info, EntryKind::Loop);
                }
                OpCode::If => {
                    let info = self.block_info(op.imm);
                    let condition = self.pop_i32();
                    if condition != 0 {
                        self.push_entry(info, EntryKind::Block);
                    } else if info.else_pc != u32::MAX {
                        self.push_entry(info, EntryKind::Block);
                        self.pc = info.else_pc as usize + 1;
                    } else {
                        // No else: skip past the end; no entry was pushed.
                        self.pc = info.end_pc as usize + 1;
                    }
                }
                OpCode::Else => {
                    // Fallthrough from the then-branch: jump to the end op,
                    // which pops the entry.
                    self.pc = self.block_info(op.imm).end_pc as usize;
                }
                OpCode::Try => {
                    let info = self.block_info(op.imm);
                    self.push_entry(info, EntryKind::Try { block_index: op.imm as u32 });
                }
                OpCode::Catch => {
                    // Fallthrough from a try body that did not throw.
                    self.pc = self.block_info(op.imm).end_pc as usize;
                }
                OpCode::Throw => {
                    let tag = self.current.instance.tags[op.imm as usize].clone();
                    let params = tag.ty().params;
                    let mut args = Vec::with_capacity(params.len());
                    for &param_ty in params.iter().rev() {
                        args.push(self.pop_value(param_ty));
                    }
                    args.reverse();
                    self.raise(Exception { tag, args })?;
                }
                OpCode::Rethrow => {
                    let exception = self.controls[self.current.controls_start..]
                        .iter()
                        .rev()
                        .find_map(|entry| match &entry.kind {
                            EntryKind::Catch { exception } => Some(exception.clone()),
                            _ => None,
                        })
                        .expect("validated: rethrow only occurs inside catch");
                    self.raise(exception)?;
                }
                OpCode::End => {
                    self.controls.pop();
                }
                OpCode::Br => {
                    self.check_terminated()?;
                    if self.do_br(op.imm as u32) {
                        return Ok(());
                    }
                }
                OpCode::BrIf => {
                    let condition = self.pop_i32();
                    if condition != 0 {
                        self.check_terminated()?;
                        if self.do_br(op.imm as u32) {
                            return Ok(());
                        }
                    }
                }
                OpCode::BrTable => {
                    self.check_terminated()?;
                    let index = self.pop_raw() as u32 as usize;
                    let code = Arc::clone(&self.current.code);
                    let (targets, default) = &code.br_tables[op.imm as usize];
                    let depth = targets.get(index).copied().unwrap_or(*default);
                    if self.do_br(depth) {
                        return Ok(());
                    }
                }
                OpCode::Return => {
                    if self.do_return() {
                        return Ok(());
                    }
                }
                OpCode::Call => {
                    self.check_terminated()?;
                    let function = self.current.instance.functions[op.imm as usize].clone();
                    self.do_call(&function)?;
                }
                OpCode::CallIndirect => {
                    self.check_terminated()?;
                    let type_index = (op.imm >> 32) as usize;
                    let table_index = op.imm as u32 as usize;
                    let index = self.pop_raw() as u32 as u64;
                    let table = self.current.instance.tables[table_index].clone();
                    let element = table.element(index).map_err(|_| {
                        Trap::new(TrapKind::InvalidIndirectCall, "table index out of bounds")
                    })?;
                    let element = element.ok_or_else(|| {
                        Trap::new(TrapKind::InvalidIndirectCall, "null table element")
                    })?;
                    if element.encoding != self.current.instance.type_encodings[type_index] {
                        return Err(Trap::new(
                            TrapKind::InvalidIndirectCall,
                            "indirect call signature mismatch",
                        ));
                    }
                    self.do_call(&element.function)?;
                }

                // --- Parametric ---
                OpCode::Drop => {
                    for _ in 0..op.imm {
                        self.pop_raw();
                    }
                }
                OpCode::Select => {
                    let condition = self.pop_i32();
                    if op.imm == 2 {
                        let b = self.pop_v128();
                        let a = self.pop_v128();
                        self.push_v128(if condition != 0 { a } else { b });
                    } else {
                        let b = self.pop_raw();
                        let a = self.pop_raw();
                        self.push_raw(if condition != 0 { a } else { b });
                    }
                }

                // --- Variable access ---
                OpCode::LocalGet => {
                    let base = self.current.locals_sp + (op.imm >> 8) as u32;
                    let size = (op.imm & 0xff) as u32;
                    // SAFETY: locals live below sp for the whole frame.
                    unsafe {
                        let lo = self.stack.read_u64(base);
                        self.stack.push_u64(lo);
                        if size == 16 {
                            let hi = self.stack.read_u64(base + 8);
                            self.stack.push_u64(hi);
                        }
                    }
                }
                OpCode::LocalSet => {
                    let base = self.current.locals_sp + (op.imm >> 8) as u32;
                    let size = (op.imm & 0xff) as u32;
                    // SAFETY: as in LocalGet.
                    unsafe {
                        if size == 16 {
                            let hi = self.stack.pop_u64();
                            let lo = self.stack.pop_u64();
                            self.stack.write_u64(base, lo);
                            self.stack.write_u64(base + 8, hi);
                        } else {
                            let value = self.stack.pop_u64();
                            self.stack.write_u64(base, value);
                        }
                    }
                }
                OpCode::LocalTee => {
                    let base = self.current.locals_sp + (op.imm >> 8) as u32;
                    let size = (op.imm & 0xff) as u32;
                    // SAFETY: as in LocalGet.
                    unsafe {
                        if size == 16 {
                            let hi = self.stack.read_u64(self.stack.sp() - 8);
                            let lo = self.stack.read_u64(self.stack.sp() - 16);
                            self.stack.write_u64(base, lo);
                            self.stack.write_u64(base + 8, hi);
                        } else {
                            let value = self.stack.peek_u64();
                            self.stack.write_u64(base, value);
                        }
                    }
                }
                OpCode::GlobalGet => {
                    let value = self.current.instance.globals[op.imm as usize].get();
                    self.push_value(value);
                }
                OpCode::GlobalSet => {
                    let global = self.current.instance.globals[op.imm as usize].clone();
                    let value = self.pop_value(global.ty().value_type);
                    *global.0.value.write().unwrap() = value;
                }

                // --- Memory ---
                OpCode::I32Load => mem_load!(self, op.imm, u32, push_i32, i32),
                OpCode::I64Load => mem_load!(self, op.imm, u64, push_i64, i64),
                OpCode::F32Load => {
                    let ptr = self.mem_addr(op.imm) as *const u32;
                    // SAFETY: see mem_load.
                    let bits = unsafe { ptr.read_unaligned() };
                    self.push_f32(f32::from_bits(bits));
                }
                OpCode::F64Load => {
                    let ptr = self.mem_addr(op.imm) as *const u64;
                    // SAFETY: see mem_load.
                    let bits = unsafe { ptr.read_unaligned() };
                    self.push_f64(f64::from_bits(bits));
                }
                OpCode::I32Load8S => mem_load!(self, op.imm, i8, push_i32, i32),
                OpCode::I32Load8U => mem_load!(self, op.imm, u8, push_i32, i32),
                OpCode::I32Load16S => mem_load!(self, op.imm, i16, push_i32, i32),
                OpCode::I32Load16U => mem_load!(self, op.imm, u16, push_i32, i32),
                OpCode::I64Load8S => mem_load!(self, op.imm, i8, push_i64, i64),
                OpCode::I64Load8U => mem_load!(self, op.imm, u8, push_i64, i64),
                OpCode::I64Load16S => mem_load!(self, op.imm, i16, push_i64, i64),
                OpCode::I64Load16U => mem_load!(self, op.imm, u16, push_i64, i64),
                OpCode::I64Load32S => mem_load!(self, op.imm, i32, push_i64, i64),
                OpCode::I64Load32U => mem_load!(self, op.imm, u32, push_i64, i64),
                OpCode::I32Store => mem_store!(self, op.imm, pop_i32, u32),
                OpCode::I64Store => mem_store!(self, op.imm, pop_i64, u64),
                OpCode::F32Store => {
                    let value = self.pop_f32().to_bits();
                    let ptr = self.mem_addr(op.imm) as *mut u32;
                    // SAFETY: see mem_store.
                    unsafe { ptr.write_unaligned(value) };
                }
                OpCode::F64Store => {
                    let value = self.pop_f64().to_bits();
                    let ptr = self.mem_addr(op.imm) as *mut u64;
                    // SAFETY: see mem_store.
                    unsafe { ptr.write_unaligned(value) };
                }
                OpCode::I32Store8 => mem_store!(self, op.imm, pop_i32, u8),
                OpCode::I32Store16 => mem_store!(self, op.imm, pop_i32, u16),
                OpCode::I64Store8 => mem_store!(self, op.imm, pop_i64, u8),
                OpCode::I64Store16 => mem_store!(self, op.imm, pop_i64, u16),
                OpCode::I64Store32 => mem_store!(self, op.imm, pop_i64, u32),
                OpCode::MemorySize => {
                    let pages = self.current.instance.memories[op.imm as usize].0.size_pages();
                    self.push_i32(pages as i32);
                }
                OpCode::MemoryGrow => {
                    let delta = self.pop_i32() as u32 as u64;
                    let memory = self.current.instance.memories[op.imm as usize].clone();
                    self.push_i32(memory.0.grow(delta) as i32);
                }

                // --- Constants ---
                OpCode::I32Const => self.push_raw(op.imm),
                OpCode::I64Const => self.push_raw(op.imm),
                OpCode::F32Const => self.push_raw(op.imm),
                OpCode::F64Const => self.push_raw(op.imm),

                // --- i32 comparison ---
                OpCode::I32Eqz => {
                    let a = self.pop_i32();
                    self.push_bool(a == 0);
                }
                OpCode::I32Eq => cmp_i32!(self, |a, b| a == b),
                OpCode::I32Ne => cmp_i32!(self, |a, b| a != b),
                OpCode::I32LtS => cmp_i32!(self, |a, b| a < b),
                OpCode::I32LtU => cmp_i32!(self, |a: i32, b: i32| (a as u32) < b as u32),
                OpCode::I32GtS => cmp_i32!(self, |a, b| a > b),
                OpCode::I32GtU => cmp_i32!(self, |a: i32, b: i32| a as u32 > b as u32),
                OpCode::I32LeS => cmp_i32!(self, |a, b| a <= b),
                OpCode::I32LeU => cmp_i32!(self, |a: i32, b: i32| a as u32 <= b as u32),
                OpCode::I32GeS => cmp_i32!(self, |a, b| a >= b),
                OpCode::I32GeU => cmp_i32!(self, |a: i32, b: i32| a as u32 >= b as u32),

                // --- i64 comparison ---
                OpCode::I64Eqz => {
                    let a = self.pop_i64();
                    self.push_bool(a == 0);
                }
                OpCode::I64Eq => cmp_i64!(self, |a, b| a == b),
                OpCode::I64Ne => cmp_i64!(self, |a, b| a != b),
                OpCode::I64LtS => cmp_i64!(self, |a, b| a < b),
                OpCode::I64LtU => cmp_i64!(self, |a: i64, b: i64| (a as u64) < b as u64),
                OpCode::I64GtS => cmp_i64!(self, |a, b| a > b),
                OpCode::I64GtU => cmp_i64!(self, |a: i64, b: i64| a as u64 > b as u64),
                OpCode::I64LeS => cmp_i64!(self, |a, b| a <= b),
                OpCode::I64LeU => cmp_i64!(self, |a: i64, b: i64| a as u64 <= b as u64),
                OpCode::I64GeS => cmp_i64!(self, |a, b| a >= b),
                OpCode::I64GeU => cmp_i64!(self, |a: i64, b: i64| a as u64 >= b as u64),

                // --- float comparison ---
                OpCode::F32Eq => cmp_f32!(self, |a, b| a == b),
                OpCode::F32Ne => cmp_f32!(self, |a, b| a != b),
                OpCode::F32Lt => cmp_f32!(self, |a, b| a < b),
                OpCode::F32Gt => cmp_f32!(self, |a, b| a > b),
                OpCode::F32Le => cmp_f32!(self, |a, b| a <= b),
                OpCode::F32Ge => cmp_f32!(self, |a, b| a >= b),
                OpCode::F64Eq => cmp_f64!(self, |a, b| a == b),
                OpCode::F64Ne => cmp_f64!(self, |a, b| a != b),
                OpCode::F64Lt => cmp_f64!(self, |a, b| a < b),
                OpCode::F64Gt => cmp_f64!(self, |a, b| a > b),
                OpCode::F64Le => cmp_f64!(self, |a, b| a <= b),
                OpCode::F64Ge => cmp_f64!(self, |a, b| a >= b),

                // --- i32 arithmetic ---
                OpCode::I32Clz => unop_i32!(self, |a: i32| a.leading_zeros() as i32),
                OpCode::I32Ctz => unop_i32!(self, |a: i32| a.trailing_zeros() as i32),
                OpCode::I32Popcnt => unop_i32!(self, |a: i32| a.count_ones() as i32),
                OpCode::I32Add => binop_i32!(self, i32::wrapping_add),
                OpCode::I32Sub => binop_i32!(self, i32::wrapping_sub),
                OpCode::I32Mul => binop_i32!(self, i32::wrapping_mul),
                OpCode::I32DivS => div_s!(self, pop_i32, push_i32, i32),
                OpCode::I32DivU => div_u!(self, pop_i32, push_i32, u32, i32),
                OpCode::I32RemS => rem_s!(self, pop_i32, push_i32, i32),
                OpCode::I32RemU => rem_u!(self, pop_i32, push_i32, u32, i32),
                OpCode::I32And => binop_i32!(self, |a, b| a & b),
                OpCode::I32Or => binop_i32!(self, |a, b| a | b),
                OpCode::I32Xor => binop_i32!(self, |a, b| a ^ b),
                OpCode::I32Shl => binop_i32!(self, |a: i32, b: i32| a.wrapping_shl(b as u32)),
                OpCode::I32ShrS => binop_i32!(self, |a: i32, b: i32| a.wrapping_shr(b as u32)),
                OpCode::I32ShrU => {
                    binop_i32!(self, |a: i32, b: i32| (a as u32).wrapping_shr(b as u32) as i32)
                }
                OpCode::I32Rotl => binop_i32!(self, |a: i32, b: i32| a.rotate_left(b as u32)),
                OpCode::I32Rotr => binop_i32!(self, |a: i32, b: i32| a.rotate_right(b as u32)),

                // --- i64 arithmetic ---
                OpCode::I64Clz => unop_i64!(self, |a: i64| a.leading_zeros() as i64),
                OpCode::I64Ctz => unop_i64!(self, |a: i64| a.trailing_zeros() as i64),
                OpCode::I64Popcnt => unop_i64!(self, |a: i64| a.count_ones() as i64),
                OpCode::I64Add => binop_i64!(self, i64::wrapping_add),
                OpCode::I64Sub => binop_i64!(self, i64::wrapping_sub),
                OpCode::I64Mul => binop_i64!(self, i64::wrapping_mul),
                OpCode::I64DivS => div_s!(self, pop_i64, push_i64, i64),
                OpCode::I64DivU => div_u!(self, pop_i64, push_i64, u64, i64),
                OpCode::I64RemS => rem_s!(self, pop_i64, push_i64, i64),
                OpCode::I64RemU => rem_u!(self, pop_i64, push_i64, u64, i64),
                OpCode::I64And => binop_i64!(self, |a, b| a & b),
                OpCode::I64Or => binop_i64!(self, |a, b| a | b),
                OpCode::I64Xor => binop_i64!(self, |a, b| a ^ b),
                OpCode::I64Shl => binop_i64!(self, |a: i64, b: i64| a.wrapping_shl(b as u32)),
                OpCode::I64ShrS => binop_i64!(self, |a: i64, b: i64| a.wrapping_shr(b as u32)),
                OpCode::I64ShrU => {
                    binop_i64!(self, |a: i64, b: i64| (a as u64).wrapping_shr(b as u32) as i64)
                }
                OpCode::I64Rotl => binop_i64!(self, |a: i64, b: i64| a.rotate_left(b as u32)),
                OpCode::I64Rotr => binop_i64!(self, |a: i64, b: i64| a.rotate_right(b as u32)),

                // --- f32 arithmetic ---
                OpCode::F32Abs => unop_f32!(self, f32::abs),
                OpCode::F32Neg => unop_f32!(self, |a: f32| -a),
                OpCode::F32Ceil => unop_f32!(self, f32::ceil),
                OpCode::F32Floor => unop_f32!(self, f32::floor),
                OpCode::F32Trunc => unop_f32!(self, f32::trunc),
                OpCode::F32Nearest => unop_f32!(self, f32::round_ties_even),
                OpCode::F32Sqrt => unop_f32!(self, f32::sqrt),
                OpCode::F32Add => binop_f32!(self, |a, b| a + b),
                OpCode::F32Sub => binop_f32!(self, |a, b| a - b),
                OpCode::F32Mul => binop_f32!(self, |a, b| a * b),
                OpCode::F32Div => binop_f32!(self, |a, b| a / b),
                OpCode::F32Min => binop_f32!(self, fmin32),
                OpCode::F32Max => binop_f32!(self, fmax32),
                OpCode::F32Copysign => binop_f32!(self, f32::copysign),

                // --- f64 arithmetic ---
                OpCode::F64Abs => unop_f64!(self, f64::abs),
                OpCode::F64Neg => unop_f64!(self, |a: f64| -a),
                OpCode::F64Ceil => unop_f64!(self, f64::ceil),
                OpCode::F64Floor => unop_f64!(self, f64::floor),
                OpCode::F64Trunc => unop_f64!(self, f64::trunc),
                OpCode::F64Nearest => unop_f64!(self, f64::round_ties_even),
                OpCode::F64Sqrt => unop_f64!(self, f64::sqrt),
                OpCode::F64Add => binop_f64!(self, |a, b| a + b),
                OpCode::F64Sub => binop_f64!(self, |a, b| a - b),
                OpCode::F64Mul => binop_f64!(self, |a, b| a * b),
                OpCode::F64Div => binop_f64!(self, |a, b| a / b),
                OpCode::F64Min => binop_f64!(self, fmin64),
                OpCode::F64Max => binop_f64!(self, fmax64),
                OpCode::F64Copysign => binop_f64!(self, f64::copysign),

                // --- Conversions ---
                OpCode::I32WrapI64 => {
                    let a = self.pop_i64();
                    self.push_i32(a as i32);
                }
                OpCode::I32TruncF32S => {
                    trunc_s!(self, pop_f32, push_i32, i32, -2147483648.0f32, 2147483648.0f32)
                }
                OpCode::I32TruncF32U => {
                    trunc_u!(self, pop_f32, push_i32, u32, i32, 4294967296.0f32)
                }
                OpCode::I32TruncF64S => {
                    trunc_s!(self, pop_f64, push_i32, i32, -2147483648.0f64, 2147483648.0f64)
                }
                OpCode::I32TruncF64U => {
                    trunc_u!(self, pop_f64, push_i32, u32, i32, 4294967296.0f64)
                }
                OpCode::I64ExtendI32S => {
                    let a = self.pop_i32();
                    self.push_i64(a as i64);
                }
                OpCode::I64ExtendI32U => {
                    let a = self.pop_i32();
                    self.push_i64(a as u32 as i64);
                }
                OpCode::I64TruncF32S => trunc_s!(
                    self,
                    pop_f32,
                    push_i64,
                    i64,
                    -9223372036854775808.0f32,
                    9223372036854775808.0f32
                ),
                OpCode::I64TruncF32U => {
                    trunc_u!(self, pop_f32, push_i64, u64, i64, 18446744073709551616.0f32)
                }
                OpCode::I64TruncF64S => trunc_s!(
                    self,
                    pop_f64,
                    push_i64,
                    i64,
                    -9223372036854775808.0f64,
                    9223372036854775808.0f64
                ),
                OpCode::I64TruncF64U => {
                    trunc_u!(self, pop_f64, push_i64, u64, i64, 18446744073709551616.0f64)
                }
                OpCode::F32ConvertI32S => {
                    let a = self.pop_i32();
                    self.push_f32(a as f32);
                }
                OpCode::F32ConvertI32U => {
                    let a = self.pop_i32();
                    self.push_f32(a as u32 as f32);
                }
                OpCode::F32ConvertI64S => {
                    let a = self.pop_i64();
                    self.push_f32(a as f32);
                }
                OpCode::F32ConvertI64U => {
                    let a = self.pop_i64();
                    self.push_f32(a as u64 as f32);
                }
                OpCode::F32DemoteF64 => {
                    let a = self.pop_f64();
                    self.push_f32(a as f32);
                }
                OpCode::F64ConvertI32S => {
                    let a = self.pop_i32();
                    self.push_f64(a as f64);
                }
                OpCode::F64ConvertI32U => {
                    let a = self.pop_i32();
                    self.push_f64(a as u32 as f64);
                }
                OpCode::F64ConvertI64S => {
                    let a = self.pop_i64();
                    self.push_f64(a as f64);
                }
                OpCode::F64ConvertI64U => {
                    let a = self.pop_i64();
                    self.push_f64(a as u64 as f64);
                }
                OpCode::F64PromoteF32 => {
                    let a = self.pop_f32();
                    self.push_f64(a as f64);
                }
                OpCode::I32ReinterpretF32 => {
                    let a = self.pop_f32();
                    self.push_i32(a.to_bits() as i32);
                }
                OpCode::I64ReinterpretF64 => {
                    let a = self.pop_f64();
                    self.push_i64(a.to_bits() as i64);
                }
                OpCode::F32ReinterpretI32 => {
                    let a = self.pop_i32();
                    self.push_f32(f32::from_bits(a as u32));
                }
                OpCode::F64ReinterpretI64 => {
                    let a = self.pop_i64();
                    self.push_f64(f64::from_bits(a as u64));
                }

                // --- Sign extension ---
                OpCode::I32Extend8S => unop_i32!(self, |a: i32| a as i8 as i32),
                OpCode::I32Extend16S => unop_i32!(self, |a: i32| a as i16 as i32),
                OpCode::I64Extend8S => unop_i64!(self, |a: i64| a as i8 as i64),
                OpCode::I64Extend16S => unop_i64!(self, |a: i64| a as i16 as i64),
                OpCode::I64Extend32S => unop_i64!(self, |a: i64| a as i32 as i64),

                // --- Non-trapping float-to-int: Rust saturating casts have
                // exactly the required semantics (NaN -> 0). ---
                OpCode::I32TruncSatF32S => {
                    let a = self.pop_f32();
                    self.push_i32(a as i32);
                }
                OpCode::I32TruncSatF32U => {
                    let a = self.pop_f32();
                    self.push_i32(a as u32 as i32);
                }
                OpCode::I32TruncSatF64S => {
                    let a = self.pop_f64();
                    self.push_i32(a as i32);
                }
                OpCode::I32TruncSatF64U => {
                    let a = self.pop_f64();
                    self.push_i32(a as u32 as i32);
                }
                OpCode::I64TruncSatF32S => {
                    let a = self.pop_f32();
                    self.push_i64(a as i64);
                }
                OpCode::I64TruncSatF32U => {
                    let a = self.pop_f32();
                    self.push_i64(a as u64 as i64);
                }
                OpCode::I64TruncSatF64S => {
                    let a = self.pop_f64();
                    self.push_i64(a as i64);
                }
                OpCode::I64TruncSatF64U => {
                    let a = self.pop_f64();
                    self.push_i64(a as u64 as i64);
                }

                // --- SIMD ---
                OpCode::V128Load => {
                    let ptr = self.mem_addr(op.imm) as *const u128;
                    // SAFETY: see mem_load.
                    let value = unsafe { ptr.read_unaligned() };
                    self.push_v128(value);
                }
                OpCode::V128Store => {
                    let value = self.pop_v128();
                    let ptr = self.mem_addr(op.imm) as *mut u128;
                    // SAFETY: see mem_store.
                    unsafe { ptr.write_unaligned(value) };
                }
                OpCode::V128Const => {
                    let value = self.current.code.wide_imms[op.imm as usize];
                    self.push_v128(value);
                }
                OpCode::I8x16Shuffle => {
                    let lanes = self.current.code.wide_imms[op.imm as usize].to_le_bytes();
                    let b = self.pop_v128().to_le_bytes();
                    let a = self.pop_v128().to_le_bytes();
                    let mut out = [0u8; 16];
                    for (slot, &select) in out.iter_mut().zip(lanes.iter()) {
                        let select = select as usize;
                        *slot = if select < 16 { a[select] } else { b[select - 16] };
                    }
                    self.push_v128(u128::from_le_bytes(out));
                }
                OpCode::I8x16Swizzle => {
                    let selectors = self.pop_v128().to_le_bytes();
                    let a = self.pop_v128().to_le_bytes();
                    let mut out = [0u8; 16];
                    for (slot, &select) in out.iter_mut().zip(selectors.iter()) {
                        *slot = if (select as usize) < 16 { a[select as usize] } else { 0 };
                    }
                    self.push_v128(u128::from_le_bytes(out));
                }
                OpCode::I8x16Splat => simd_splat!(self, pop_i32, u8),
                OpCode::I16x8Splat => simd_splat!(self, pop_i32, u16),
                OpCode::I32x4Splat => simd_splat!(self, pop_i32, u32),
                OpCode::I64x2Splat => simd_splat!(self, pop_i64, u64),
                OpCode::F32x4Splat => {
                    let v = self.pop_f32().to_bits();
                    let mut out = [0u8; 16];
                    for chunk in out.chunks_exact_mut(4) {
                        chunk.copy_from_slice(&v.to_le_bytes());
                    }
                    self.push_v128(u128::from_le_bytes(out));
                }
                OpCode::F64x2Splat => {
                    let v = self.pop_f64().to_bits();
                    let mut out = [0u8; 16];
                    for chunk in out.chunks_exact_mut(8) {
                        chunk.copy_from_slice(&v.to_le_bytes());
                    }
                    self.push_v128(u128::from_le_bytes(out));
                }
                OpCode::I8x16ExtractLaneS => simd_extract!(self, op.imm, i8, push_i32, i32),
                OpCode::I8x16ExtractLaneU => simd_extract!(self, op.imm, u8, push_i32, i32),
                OpCode::I8x16ReplaceLane => simd_replace!(self, op.imm, u8, pop_i32),
                OpCode::I16x8ExtractLaneS => simd_extract!(self, op.imm, i16, push_i32, i32),
                OpCode::I16x8ExtractLaneU => simd_extract!(self, op.imm, u16, push_i32, i32),
                OpCode::I16x8ReplaceLane => simd_replace!(self, op.imm, u16, pop_i32),
                OpCode::I32x4ExtractLane => simd_extract!(self, op.imm, i32, push_i32, i32),
                OpCode::I32x4ReplaceLane => simd_replace!(self, op.imm, u32, pop_i32),
                OpCode::I64x2ExtractLane => simd_extract!(self, op.imm, i64, push_i64, i64),
                OpCode::I64x2ReplaceLane => simd_replace!(self, op.imm, u64, pop_i64),
                OpCode::F32x4ExtractLane => {
                    let a = self.pop_v128().to_le_bytes();
                    let i = op.imm as usize;
                    let bits = u32::from_le_bytes(a[i * 4..(i + 1) * 4].try_into().unwrap());
                    self.push_f32(f32::from_bits(bits));
                }
                OpCode::F32x4ReplaceLane => {
                    let v = self.pop_f32().to_bits();
                    let mut a = self.pop_v128().to_le_bytes();
                    let i = op.imm as usize;
                    a[i * 4..(i + 1) * 4].copy_from_slice(&v.to_le_bytes());
                    self.push_v128(u128::from_le_bytes(a));
                }
                OpCode::F64x2ExtractLane => {
                    let a = self.pop_v128().to_le_bytes();
                    let i = op.imm as usize;
                    let bits = u64::from_le_bytes(a[i * 8..(i + 1) * 8].try_into().unwrap());
                    self.push_f64(f64::from_bits(bits));
                }
                OpCode::F64x2ReplaceLane => {
                    let v = self.pop_f64().to_bits();
                    let mut a = self.pop_v128().to_le_bytes();
                    let i = op.imm as usize;
                    a[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
                    self.push_v128(u128::from_le_bytes(a));
                }
                OpCode::I8x16Eq => simd_cmp!(self, u8, |a, b| a == b),
                OpCode::I16x8Eq => simd_cmp!(self, u16, |a, b| a == b),
                OpCode::I32x4Eq => simd_cmp!(self, u32, |a, b| a == b),
                OpCode::I64x2Eq => simd_cmp!(self, u64, |a, b| a == b),
                OpCode::F32x4Eq => simd_cmp!(self, f32, |a, b| a == b),
                OpCode::F64x2Eq => simd_cmp!(self, f64, |a, b| a == b),
                OpCode::V128Not => {
                    let a = self.pop_v128();
                    self.push_v128(!a);
                }
                OpCode::V128And => {
                    let b = self.pop_v128();
                    let a = self.pop_v128();
                    self.push_v128(a & b);
                }
                OpCode::V128AndNot => {
                    let b = self.pop_v128();
                    let a = self.pop_v128();
                    self.push_v128(a & !b);
                }
                OpCode::V128Or => {
                    let b = self.pop_v128();
                    let a = self.pop_v128();
                    self.push_v128(a | b);
                }
                OpCode::V128Xor => {
                    let b = self.pop_v128();
                    let a = self.pop_v128();
                    self.push_v128(a ^ b);
                }
                OpCode::V128Bitselect => {
                    let mask = self.pop_v128();
                    let b = self.pop_v128();
                    let a = self.pop_v128();
                    self.push_v128((a & mask) | (b & !mask));
                }
                OpCode::V128AnyTrue => {
                    let a = self.pop_v128();
                    self.push_bool(a != 0);
                }
                OpCode::I8x16AllTrue => simd_all_true!(self, 1),
                OpCode::I16x8AllTrue => simd_all_true!(self, 2),
                OpCode::I32x4AllTrue => simd_all_true!(self, 4),
                OpCode::I64x2AllTrue => simd_all_true!(self, 8),
                OpCode::I8x16Neg => simd_unop!(self, u8, u8::wrapping_neg),
                OpCode::I16x8Neg => simd_unop!(self, u16, u16::wrapping_neg),
                OpCode::I32x4Neg => simd_unop!(self, u32, u32::wrapping_neg),
                OpCode::I64x2Neg => simd_unop!(self, u64, u64::wrapping_neg),
                OpCode::I8x16Add => simd_binop!(self, u8, u8::wrapping_add),
                OpCode::I16x8Add => simd_binop!(self, u16, u16::wrapping_add),
                OpCode::I32x4Add => simd_binop!(self, u32, u32::wrapping_add),
                OpCode::I64x2Add => simd_binop!(self, u64, u64::wrapping_add),
                OpCode::I8x16Sub => simd_binop!(self, u8, u8::wrapping_sub),
                OpCode::I16x8Sub => simd_binop!(self, u16, u16::wrapping_sub),
                OpCode::I32x4Sub => simd_binop!(self, u32, u32::wrapping_sub),
                OpCode::I64x2Sub => simd_binop!(self, u64, u64::wrapping_sub),
                OpCode::I16x8Mul => simd_binop!(self, u16, u16::wrapping_mul),
                OpCode::I32x4Mul => simd_binop!(self, u32, u32::wrapping_mul),
                OpCode::I64x2Mul => simd_binop!(self, u64, u64::wrapping_mul),
                OpCode::F32x4Abs => simd_unop!(self, f32, f32::abs),
                OpCode::F32x4Neg => simd_unop!(self, f32, |a: f32| -a),
                OpCode::F32x4Sqrt => simd_unop!(self, f32, f32::sqrt),
                OpCode::F32x4Add => simd_binop!(self, f32, |a, b| a + b),
                OpCode::F32x4Sub => simd_binop!(self, f32, |a, b| a - b),
                OpCode::F32x4Mul => simd_binop!(self, f32, |a, b| a * b),
                OpCode::F32x4Div => simd_binop!(self, f32, |a, b| a / b),
                OpCode::F32x4Min => simd_binop!(self, f32, fmin32),
                OpCode::F32x4Max => simd_binop!(self, f32, fmax32),
                OpCode::F64x2Abs => simd_unop!(self, f64, f64::abs),
                OpCode::F64x2Neg => simd_unop!(self, f64, |a: f64| -a),
                OpCode::F64x2Sqrt => simd_unop!(self, f64, f64::sqrt),
                OpCode::F64x2Add => simd_binop!(self, f64, |a, b| a + b),
                OpCode::F64x2Sub => simd_binop!(self, f64, |a, b| a - b),
                OpCode::F64x2Mul => simd_binop!(self, f64, |a, b| a * b),
                OpCode::F64x2Div => simd_binop!(self, f64, |a, b| a / b),
                OpCode::F64x2Min => simd_binop!(self, f64, fmin64),
                OpCode::F64x2Max => simd_binop!(self, f64, fmax64),

                // --- Atomics ---
                OpCode::AtomicNotify => {
                    let count = self.pop_i32() as u32;
                    let address = self.pop_raw() as u32 as u64;
                    let memory = self.current.instance.memories[0].clone();
                    let woken = memory.0.notify(address + op.imm, count)?;
                    self.push_i32(woken);
                }
                OpCode::I32AtomicWait => {
                    let timeout = self.pop_i64();
                    let expected = self.pop_i32();
                    let address = self.pop_raw() as u32 as u64;
                    let memory = self.current.instance.memories[0].clone();
                    let outcome = memory.0.wait32(address + op.imm, expected, timeout)?;
                    self.push_i32(outcome);
                }
                OpCode::I64AtomicWait => {
                    let timeout = self.pop_i64();
                    let expected = self.pop_i64();
                    let address = self.pop_raw() as u32 as u64;
                    let memory = self.current.instance.memories[0].clone();
                    let outcome = memory.0.wait64(address + op.imm, expected, timeout)?;
                    self.push_i32(outcome);
                }
                OpCode::I32AtomicLoad => atomic_load!(self, op.imm, AtomicU32, 4, push_i32, i32),
                OpCode::I64AtomicLoad => atomic_load!(self, op.imm, AtomicU64, 8, push_i64, i64),
                OpCode::I32AtomicLoad8U => atomic_load!(self, op.imm, AtomicU8, 1, push_i32, i32),
                OpCode::I32AtomicLoad16U => atomic_load!(self, op.imm, AtomicU16, 2, push_i32, i32),
                OpCode::I64AtomicLoad8U => atomic_load!(self, op.imm, AtomicU8, 1, push_i64, i64),
                OpCode::I64AtomicLoad16U => atomic_load!(self, op.imm, AtomicU16, 2, push_i64, i64),
                OpCode::I64AtomicLoad32U => atomic_load!(self, op.imm, AtomicU32, 4, push_i64, i64),
                OpCode::I32AtomicStore => atomic_store!(self, op.imm, AtomicU32, 4, pop_i32, u32),
                OpCode::I64AtomicStore => atomic_store!(self, op.imm, AtomicU64, 8, pop_i64, u64),
                OpCode::I32AtomicStore8 => atomic_store!(self, op.imm, AtomicU8, 1, pop_i32, u8),
                OpCode::I32AtomicStore16 => atomic_store!(self, op.imm, AtomicU16, 2, pop_i32, u16),
                OpCode::I64AtomicStore8 => atomic_store!(self, op.imm, AtomicU8, 1, pop_i64, u8),
                OpCode::I64AtomicStore16 => atomic_store!(self, op.imm, AtomicU16, 2, pop_i64, u16),
                OpCode::I64AtomicStore32 => atomic_store!(self, op.imm, AtomicU32, 4, pop_i64, u32),
                OpCode::I32AtomicRmwAdd => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i32, i32, fetch_add)
                }
                OpCode::I64AtomicRmwAdd => {
                    atomic_rmw!(self, op.imm, AtomicU64, 8, u64, push_i64, i64, fetch_add)
                }
                OpCode::I32AtomicRmw8AddU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i32, i32, fetch_add)
                }
                OpCode::I32AtomicRmw16AddU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i32, i32, fetch_add)
                }
                OpCode::I64AtomicRmw8AddU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i64, i64, fetch_add)
                }
                OpCode::I64AtomicRmw16AddU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i64, i64, fetch_add)
                }
                OpCode::I64AtomicRmw32AddU => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i64, i64, fetch_add)
                }
                OpCode::I32AtomicRmwSub => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i32, i32, fetch_sub)
                }
                OpCode::I64AtomicRmwSub => {
                    atomic_rmw!(self, op.imm, AtomicU64, 8, u64, push_i64, i64, fetch_sub)
                }
                OpCode::I32AtomicRmw8SubU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i32, i32, fetch_sub)
                }
                OpCode::I32AtomicRmw16SubU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i32, i32, fetch_sub)
                }
                OpCode::I64AtomicRmw8SubU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i64, i64, fetch_sub)
                }
                OpCode::I64AtomicRmw16SubU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i64, i64, fetch_sub)
                }
                OpCode::I64AtomicRmw32SubU => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i64, i64, fetch_sub)
                }
                OpCode::I32AtomicRmwAnd => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i32, i32, fetch_and)
                }
                OpCode::I64AtomicRmwAnd => {
                    atomic_rmw!(self, op.imm, AtomicU64, 8, u64, push_i64, i64, fetch_and)
                }
                OpCode::I32AtomicRmw8AndU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i32, i32, fetch_and)
                }
                OpCode::I32AtomicRmw16AndU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i32, i32, fetch_and)
                }
                OpCode::I64AtomicRmw8AndU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i64, i64, fetch_and)
                }
                OpCode::I64AtomicRmw16AndU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i64, i64, fetch_and)
                }
                OpCode::I64AtomicRmw32AndU => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i64, i64, fetch_and)
                }
                OpCode::I32AtomicRmwOr => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i32, i32, fetch_or)
                }
                OpCode::I64AtomicRmwOr => {
                    atomic_rmw!(self, op.imm, AtomicU64, 8, u64, push_i64, i64, fetch_or)
                }
                OpCode::I32AtomicRmw8OrU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i32, i32, fetch_or)
                }
                OpCode::I32AtomicRmw16OrU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i32, i32, fetch_or)
                }
                OpCode::I64AtomicRmw8OrU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i64, i64, fetch_or)
                }
                OpCode::I64AtomicRmw16OrU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i64, i64, fetch_or)
                }
                OpCode::I64AtomicRmw32OrU => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i64, i64, fetch_or)
                }
                OpCode::I32AtomicRmwXor => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i32, i32, fetch_xor)
                }
                OpCode::I64AtomicRmwXor => {
                    atomic_rmw!(self, op.imm, AtomicU64, 8, u64, push_i64, i64, fetch_xor)
                }
                OpCode::I32AtomicRmw8XorU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i32, i32, fetch_xor)
                }
                OpCode::I32AtomicRmw16XorU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i32, i32, fetch_xor)
                }
                OpCode::I64AtomicRmw8XorU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i64, i64, fetch_xor)
                }
                OpCode::I64AtomicRmw16XorU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i64, i64, fetch_xor)
                }
                OpCode::I64AtomicRmw32XorU => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i64, i64, fetch_xor)
                }
                OpCode::I32AtomicRmwXchg => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i32, i32, swap)
                }
                OpCode::I64AtomicRmwXchg => {
                    atomic_rmw!(self, op.imm, AtomicU64, 8, u64, push_i64, i64, swap)
                }
                OpCode::I32AtomicRmw8XchgU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i32, i32, swap)
                }
                OpCode::I32AtomicRmw16XchgU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i32, i32, swap)
                }
                OpCode::I64AtomicRmw8XchgU => {
                    atomic_rmw!(self, op.imm, AtomicU8, 1, u8, push_i64, i64, swap)
                }
                OpCode::I64AtomicRmw16XchgU => {
                    atomic_rmw!(self, op.imm, AtomicU16, 2, u16, push_i64, i64, swap)
                }
                OpCode::I64AtomicRmw32XchgU => {
                    atomic_rmw!(self, op.imm, AtomicU32, 4, u32, push_i64, i64, swap)
                }
                OpCode::I32AtomicRmwCmpxchg => {
                    atomic_cmpxchg!(self, op.imm, AtomicU32, 4, u32, push_i32, i32)
                }
                OpCode::I64AtomicRmwCmpxchg => {
                    atomic_cmpxchg!(self, op.imm, AtomicU64, 8, u64, push_i64, i64)
                }
                OpCode::I32AtomicRmw8CmpxchgU => {
                    atomic_cmpxchg!(self, op.imm, AtomicU8, 1, u8, push_i32, i32)
                }
                OpCode::I32AtomicRmw16CmpxchgU => {
                    atomic_cmpxchg!(self, op.imm, AtomicU16, 2, u16, push_i32, i32)
                }
                OpCode::I64AtomicRmw8CmpxchgU => {
                    atomic_cmpxchg!(self, op.imm, AtomicU8, 1, u8, push_i64, i64)
                }
                OpCode::I64AtomicRmw16CmpxchgU => {
                    atomic_cmpxchg!(self, op.imm, AtomicU16, 2, u16, push_i64, i64)
                }
                OpCode::I64AtomicRmw32CmpxchgU => {
                    atomic_cmpxchg!(self, op.imm, AtomicU32, 4, u32, push_i64, i64)
                }
            }
        }
    }
}
