//! End-to-end tests over the public API: decode, validate, instantiate,
//! invoke, and trap.

use std::time::Duration;

use wyrm::{
    instantiate, Compartment, Extern, FeatureSpec, Instance, InstantiationError, Linker, Memory,
    Resolver, TrapKind, Value,
};

fn module(source: &str) -> wyrm::Module {
    module_with(source, FeatureSpec::default())
}

fn module_with(source: &str, features: FeatureSpec) -> wyrm::Module {
    let bytes = wat::parse_str(source).unwrap();
    wyrm::decode_and_validate(&bytes, features).unwrap()
}

fn start(source: &str) -> Instance {
    start_with(source, FeatureSpec::default(), &Linker::new())
}

fn start_with(source: &str, features: FeatureSpec, linker: &impl Resolver) -> Instance {
    let module = module_with(source, features);
    let compartment = Compartment::new();
    instantiate(&compartment, &module, linker).unwrap()
}

#[test]
fn add_two_numbers() {
    let instance = start(
        r#"(module (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))"#,
    );
    let results = instance.invoke("add", &[Value::I32(2), Value::I32(3)]).unwrap();
    assert_eq!(results, vec![Value::I32(5)]);
}

#[test]
fn data_segments_initialize_memory() {
    let instance = start(
        r#"(module
            (memory 1)
            (data (i32.const 0) "hi")
            (func (export "first") (result i32)
                i32.const 0
                i32.load8_u)
            (func (export "last_word") (result i32)
                i32.const 0
                i32.load offset=65532)
            (func (export "past_end") (result i32)
                i32.const 0
                i32.load offset=65533))"#,
    );
    assert_eq!(instance.invoke("first", &[]).unwrap(), vec![Value::I32(0x68)]);
    // The final in-bounds word reads fine...
    instance.invoke("last_word", &[]).unwrap();
    // ...and one byte past it traps via the guard pages, never crashing.
    let trap = instance.invoke("past_end", &[]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::AccessViolation);
}

#[test]
fn any_i32_address_traps_or_loads() {
    let instance = start(
        r#"(module
            (memory 1)
            (func (export "peek") (param i32) (result i32)
                local.get 0
                i32.load))"#,
    );
    instance.invoke("peek", &[Value::I32(0)]).unwrap();
    for addr in [65536i32, i32::MAX, -1, -4096] {
        let trap = instance.invoke("peek", &[Value::I32(addr)]).unwrap_err();
        assert_eq!(trap.kind(), TrapKind::AccessViolation, "addr {addr}");
    }
}

#[test]
fn call_indirect_checks_signatures() {
    let instance = start(
        r#"(module
            (type $t (func (result i32)))
            (table 2 anyfunc)
            (elem (i32.const 0) $f)
            (func $f (result i32) i32.const 42)
            (func (export "ci") (param i32) (result i32)
                local.get 0
                call_indirect (type $t)))"#,
    );
    assert_eq!(instance.invoke("ci", &[Value::I32(0)]).unwrap(), vec![Value::I32(42)]);
    // Slot 1 is null.
    let trap = instance.invoke("ci", &[Value::I32(1)]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::InvalidIndirectCall);
    // Slot 2 is out of bounds.
    let trap = instance.invoke("ci", &[Value::I32(2)]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::InvalidIndirectCall);
}

#[test]
fn call_indirect_signature_mismatch_does_not_enter_target() {
    let instance = start(
        r#"(module
            (type $returns_i64 (func (result i64)))
            (table 1 anyfunc)
            (elem (i32.const 0) $store_then_return)
            (memory 1)
            (func $store_then_return (result i32)
                i32.const 0
                i32.const 99
                i32.store
                i32.const 7)
            (func (export "ci") (result i64)
                i32.const 0
                call_indirect (type $returns_i64))
            (func (export "peek") (result i32)
                i32.const 0
                i32.load))"#,
    );
    let trap = instance.invoke("ci", &[]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::InvalidIndirectCall);
    // The mismatched target never ran.
    assert_eq!(instance.invoke("peek", &[]).unwrap(), vec![Value::I32(0)]);
}

#[test]
fn host_functions_marshal_arguments() {
    let mut linker = Linker::new();
    linker.func("env", "mul", |a: i32, b: i32| a.wrapping_mul(b));
    let instance = start_with(
        r#"(module
            (import "env" "mul" (func $mul (param i32 i32) (result i32)))
            (func (export "square") (param i32) (result i32)
                local.get 0
                local.get 0
                call $mul))"#,
        FeatureSpec::default(),
        &linker,
    );
    assert_eq!(instance.invoke("square", &[Value::I32(9)]).unwrap(), vec![Value::I32(81)]);
}

#[test]
fn missing_import_is_a_link_error() {
    let module = module(r#"(module (import "env" "gone" (func)))"#);
    let err = instantiate(&Compartment::new(), &module, &Linker::new()).unwrap_err();
    assert!(matches!(err, InstantiationError::Link(_)));
}

#[test]
fn import_type_mismatch_is_a_link_error() {
    let mut linker = Linker::new();
    linker.func("env", "f", || 1i32);
    let module = module(r#"(module (import "env" "f" (func (param i32))))"#);
    let err = instantiate(&Compartment::new(), &module, &linker).unwrap_err();
    assert!(matches!(err, InstantiationError::Link(_)));
}

#[test]
fn globals_initialize_from_imports() {
    let mut linker = Linker::new();
    linker.define(
        "env",
        "base",
        Extern::Global(
            wyrm::Global::new(
                wyrm::types::GlobalType {
                    value_type: wyrm::types::ValueType::I32,
                    is_mutable: false,
                },
                Value::I32(40),
            )
            .unwrap(),
        ),
    );
    let instance = start_with(
        r#"(module
            (import "env" "base" (global $base i32))
            (global $g i32 (global.get $base))
            (func (export "read") (result i32)
                global.get $g
                i32.const 2
                i32.add))"#,
        FeatureSpec::default(),
        &linker,
    );
    assert_eq!(instance.invoke("read", &[]).unwrap(), vec![Value::I32(42)]);
}

#[test]
fn start_function_runs_before_exports_are_used() {
    let instance = start(
        r#"(module
            (memory 1)
            (func $init
                i32.const 0
                i32.const 7
                i32.store)
            (start $init)
            (func (export "read") (result i32)
                i32.const 0
                i32.load))"#,
    );
    assert_eq!(instance.invoke("read", &[]).unwrap(), vec![Value::I32(7)]);
}

#[test]
fn integer_division_traps() {
    let instance = start(
        r#"(module
            (func (export "div") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.div_s))"#,
    );
    let trap = instance.invoke("div", &[Value::I32(1), Value::I32(0)]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::IntegerDivideByZero);
    let trap = instance
        .invoke("div", &[Value::I32(i32::MIN), Value::I32(-1)])
        .unwrap_err();
    assert_eq!(trap.kind(), TrapKind::IntegerOverflow);
    assert_eq!(
        instance.invoke("div", &[Value::I32(-7), Value::I32(2)]).unwrap(),
        vec![Value::I32(-3)]
    );
}

#[test]
fn float_truncation_traps_on_nan_and_overflow() {
    let instance = start(
        r#"(module
            (func (export "trunc") (param f32) (result i32)
                local.get 0
                i32.trunc_f32_s)
            (func (export "sat") (param f32) (result i32)
                local.get 0
                i32.trunc_sat_f32_s))"#,
    );
    let trap = instance.invoke("trunc", &[Value::F32(f32::NAN)]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::InvalidFloatConversion);
    let trap = instance.invoke("trunc", &[Value::F32(3e9)]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::IntegerOverflow);
    // The saturating form never traps.
    assert_eq!(
        instance.invoke("sat", &[Value::F32(f32::NAN)]).unwrap(),
        vec![Value::I32(0)]
    );
    assert_eq!(
        instance.invoke("sat", &[Value::F32(3e9)]).unwrap(),
        vec![Value::I32(i32::MAX)]
    );
}

#[test]
fn unreachable_traps() {
    let instance = start(r#"(module (func (export "boom") unreachable))"#);
    let trap = instance.invoke("boom", &[]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::Unreachable);
    assert!(!trap.call_stack().is_empty());
}

#[test]
fn runaway_recursion_traps_with_stack_overflow() {
    let instance = start(
        r#"(module (func $spin (export "spin")
            call $spin))"#,
    );
    let trap = instance.invoke("spin", &[]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::StackOverflow);
}

#[test]
fn memory_grow_reports_old_size_and_respects_max() {
    let instance = start(
        r#"(module
            (memory 1 3)
            (func (export "grow") (param i32) (result i32)
                local.get 0
                memory.grow)
            (func (export "size") (result i32)
                memory.size))"#,
    );
    assert_eq!(instance.invoke("size", &[]).unwrap(), vec![Value::I32(1)]);
    assert_eq!(instance.invoke("grow", &[Value::I32(2)]).unwrap(), vec![Value::I32(1)]);
    assert_eq!(instance.invoke("size", &[]).unwrap(), vec![Value::I32(3)]);
    assert_eq!(instance.invoke("grow", &[Value::I32(1)]).unwrap(), vec![Value::I32(-1)]);
}

#[test]
fn loops_and_branches_compute() {
    // Sum 1..=n with a loop.
    let instance = start(
        r#"(module (func (export "sum") (param i32) (result i32)
            (local $acc i32)
            block $exit
                loop $top
                    local.get 0
                    i32.eqz
                    br_if $exit
                    local.get $acc
                    local.get 0
                    i32.add
                    local.set $acc
                    local.get 0
                    i32.const 1
                    i32.sub
                    local.set 0
                    br $top
                end
            end
            local.get $acc))"#,
    );
    assert_eq!(instance.invoke("sum", &[Value::I32(10)]).unwrap(), vec![Value::I32(55)]);
}

#[test]
fn instantiation_failure_leaves_no_partial_writes() {
    // The second data segment overflows the imported memory; the first
    // must not be applied either.
    let memory = Memory::new(wyrm::types::MemoryType {
        is_shared: false,
        size: wyrm::types::SizeConstraints::new(1, Some(1)),
    })
    .unwrap();
    let mut linker = Linker::new();
    linker.define("env", "mem", Extern::Memory(memory.clone()));

    let module = module(
        r#"(module
            (import "env" "mem" (memory 1))
            (data (i32.const 0) "xxxx")
            (data (i32.const 65534) "yyyy"))"#,
    );
    let err = instantiate(&Compartment::new(), &module, &linker).unwrap_err();
    assert!(matches!(err, InstantiationError::DataSegmentOutOfBounds));

    let mut buf = [0u8; 4];
    memory.read(0, &mut buf).unwrap();
    assert_eq!(buf, [0, 0, 0, 0], "first segment must not have been applied");
}

#[test]
fn start_function_trap_fails_instantiation() {
    let module = module(
        r#"(module
            (func $bad unreachable)
            (start $bad))"#,
    );
    let err = instantiate(&Compartment::new(), &module, &Linker::new()).unwrap_err();
    assert!(matches!(err, InstantiationError::StartTrap(_)));
}

#[test]
fn terminated_compartment_rejects_entry() {
    let module = module(r#"(module (func (export "f")))"#);
    let compartment = Compartment::new();
    let instance = instantiate(&compartment, &module, &Linker::new()).unwrap();
    compartment.terminate();
    let trap = instance.invoke("f", &[]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::Terminated);
}

#[test]
fn termination_stops_a_running_loop() {
    let module = module(
        r#"(module (func (export "spin")
            loop $top
                br $top
            end))"#,
    );
    let compartment = Compartment::new();
    let instance = instantiate(&compartment, &module, &Linker::new()).unwrap();

    let worker = std::thread::spawn(move || instance.invoke("spin", &[]).unwrap_err());
    std::thread::sleep(Duration::from_millis(50));
    compartment.terminate();
    let trap = worker.join().unwrap();
    assert_eq!(trap.kind(), TrapKind::Terminated);
}

#[test]
fn non_shared_memory_rejects_a_second_thread() {
    let instance = start(
        r#"(module
            (memory 1)
            (func (export "touch") (result i32)
                i32.const 0
                i32.load))"#,
    );
    instance.invoke("touch", &[]).unwrap();
    let other = {
        let instance = instance.clone();
        std::thread::spawn(move || instance.invoke("touch", &[]))
    };
    let trap = other.join().unwrap().unwrap_err();
    assert_eq!(trap.kind(), TrapKind::AccessViolation);
}

#[test]
fn atomic_wait_and_notify_across_threads() {
    let mut features = FeatureSpec::default();
    features.threads = true;
    let instance = start_with(
        r#"(module
            (memory 1 1 shared)
            (func (export "wait") (result i32)
                i32.const 0
                i32.const 0
                i64.const 5000000000
                memory.atomic.wait32)
            (func (export "notify") (result i32)
                i32.const 0
                i32.const 1
                memory.atomic.notify))"#,
        features,
        &Linker::new(),
    );

    let waiter = {
        let instance = instance.clone();
        std::thread::spawn(move || instance.invoke("wait", &[]).unwrap())
    };
    // Retry until the waiter has actually parked.
    let mut woken = 0;
    for _ in 0..200 {
        std::thread::sleep(Duration::from_millis(5));
        woken = instance.invoke("notify", &[]).unwrap()[0].unwrap_i32();
        if woken == 1 {
            break;
        }
    }
    assert_eq!(woken, 1, "notify never observed a parked waiter");
    assert_eq!(waiter.join().unwrap(), vec![Value::I32(0)]);
}

#[test]
fn atomic_wait_times_out() {
    let mut features = FeatureSpec::default();
    features.threads = true;
    let instance = start_with(
        r#"(module
            (memory 1 1 shared)
            (func (export "wait_briefly") (result i32)
                i32.const 0
                i32.const 0
                i64.const 1000000
                memory.atomic.wait32))"#,
        features,
        &Linker::new(),
    );
    assert_eq!(instance.invoke("wait_briefly", &[]).unwrap(), vec![Value::I32(2)]);
}

#[test]
fn atomic_rmw_operations_are_atomic_enough_to_count() {
    let mut features = FeatureSpec::default();
    features.threads = true;
    let instance = start_with(
        r#"(module
            (memory 1 1 shared)
            (func (export "incr") (result i32)
                i32.const 0
                i32.const 1
                i32.atomic.rmw.add)
            (func (export "read") (result i32)
                i32.const 0
                i32.atomic.load))"#,
        features,
        &Linker::new(),
    );
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let instance = instance.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    instance.invoke("incr", &[]).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(instance.invoke("read", &[]).unwrap(), vec![Value::I32(4000)]);
}

#[test]
fn exceptions_are_caught_by_matching_tags() {
    // (module (tag (param i32)) (func (export "f") (result i32)
    //     try (result i32) i32.const 42 throw 0 catch 0 end))
    // Assembled by hand; the text toolchain's legacy exception syntax is
    // not relied upon.
    let mut bytes = b"\0asm\x01\0\0\0".to_vec();
    bytes.extend_from_slice(&[1, 9, 2, 0x60, 1, 0x7f, 0, 0x60, 0, 1, 0x7f]); // types
    bytes.extend_from_slice(&[3, 2, 1, 1]); // function section
    bytes.extend_from_slice(&[13, 3, 1, 0x00, 0x00]); // tag section
    bytes.extend_from_slice(&[7, 5, 1, 1, b'f', 0x00, 0x00]); // export "f"
    bytes.extend_from_slice(&[
        10, 13, 1, 11, 0, // code section, one 11-byte body, no locals
        0x06, 0x7f, // try (result i32)
        0x41, 0x2a, // i32.const 42
        0x08, 0x00, // throw 0
        0x07, 0x00, // catch 0
        0x0b, // end (try)
        0x0b, // end (function)
    ]);

    let mut features = FeatureSpec::default();
    features.exception_handling = true;
    let module = wyrm::decode_and_validate(&bytes, features).unwrap();
    let instance = instantiate(&Compartment::new(), &module, &Linker::new()).unwrap();
    assert_eq!(instance.invoke("f", &[]).unwrap(), vec![Value::I32(42)]);
}

#[test]
fn uncaught_exceptions_surface_as_traps() {
    // (module (tag) (func (export "f") throw 0))
    let mut bytes = b"\0asm\x01\0\0\0".to_vec();
    bytes.extend_from_slice(&[1, 4, 1, 0x60, 0, 0]); // one empty type
    bytes.extend_from_slice(&[3, 2, 1, 0]);
    bytes.extend_from_slice(&[13, 3, 1, 0x00, 0x00]);
    bytes.extend_from_slice(&[7, 5, 1, 1, b'f', 0x00, 0x00]);
    bytes.extend_from_slice(&[10, 6, 1, 4, 0, 0x08, 0x00, 0x0b]);

    let mut features = FeatureSpec::default();
    features.exception_handling = true;
    let module = wyrm::decode_and_validate(&bytes, features).unwrap();
    let instance = instantiate(&Compartment::new(), &module, &Linker::new()).unwrap();
    let trap = instance.invoke("f", &[]).unwrap_err();
    assert_eq!(trap.kind(), TrapKind::UncaughtException);
}

#[test]
fn simd_lanes_compute() {
    let mut features = FeatureSpec::default();
    features.simd = true;
    let instance = start_with(
        r#"(module (func (export "dot_ish") (result i32)
            v128.const i32x4 1 2 3 4
            v128.const i32x4 10 20 30 40
            i32x4.add
            i32x4.extract_lane 2))"#,
        features,
        &Linker::new(),
    );
    assert_eq!(instance.invoke("dot_ish", &[]).unwrap(), vec![Value::I32(33)]);
}

#[test]
fn multi_value_blocks_flow_through() {
    let instance = start(
        r#"(module (func (export "swap") (param i32 i32) (result i32 i32)
            local.get 1
            local.get 0))"#,
    );
    assert_eq!(
        instance.invoke("swap", &[Value::I32(1), Value::I32(2)]).unwrap(),
        vec![Value::I32(2), Value::I32(1)]
    );
}

#[test]
fn exported_memory_is_shared_between_instances() {
    let provider = start(
        r#"(module
            (memory (export "mem") 1)
            (func (export "poke") (param i32 i32)
                local.get 0
                local.get 1
                i32.store))"#,
    );
    let memory = provider.get_memory("mem").unwrap();
    let mut linker = Linker::new();
    linker.define("env", "mem", Extern::Memory(memory));
    let consumer = start_with(
        r#"(module
            (import "env" "mem" (memory 1))
            (func (export "peek") (param i32) (result i32)
                local.get 0
                i32.load))"#,
        FeatureSpec::default(),
        &linker,
    );
    provider.invoke("poke", &[Value::I32(16), Value::I32(1234)]).unwrap();
    assert_eq!(
        consumer.invoke("peek", &[Value::I32(16)]).unwrap(),
        vec![Value::I32(1234)]
    );
}
