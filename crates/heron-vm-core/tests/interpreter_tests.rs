//! End-to-end interpreter scenarios.
//!
//! Each test assembles a module with the bytecode builder, runs it on a
//! fresh runtime, and checks the returned value plus any observable side
//! state (cache counters, GC statistics, global properties).

use heron_vm_bytecode::literal::LiteralValue;
use heron_vm_bytecode::{BytecodeBuilder, BytecodeModule, Opcode};
use heron_vm_core::{Runtime, RuntimeConfig, Value, VmError, object};

fn new_runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime creation")
}

fn run(module: &BytecodeModule) -> Result<Value, VmError> {
    new_runtime().run_module(module)
}

#[test]
fn arithmetic_fast_path() {
    let mut b = BytecodeBuilder::new("arith.js");
    let mut f = b.function("main", 3, 0);
    f.load_double(0, 2.5);
    f.load_double(1, 4.0);
    f.mul(2, 0, 1);
    f.ret(2);
    let main = f.finish();
    b.set_global_function(main);

    let result = run(&b.build()).unwrap();
    assert!(result.is_number());
    assert_eq!(result.as_number(), 10.0);
}

#[test]
fn division_by_zero_follows_ieee() {
    let mut b = BytecodeBuilder::new("div.js");
    let mut f = b.function("main", 4, 0);
    f.load_double(0, 1.0);
    f.load_double(1, 0.0);
    f.div(2, 0, 1); // +Infinity
    f.div(3, 1, 1); // NaN
    f.add(2, 2, 3); // Infinity + NaN = NaN
    f.ret(2);
    let main = f.finish();
    b.set_global_function(main);

    let result = run(&b.build()).unwrap();
    assert!(result.as_number().is_nan());
}

#[test]
fn hidden_class_transition_and_cache_reuse() {
    let mut b = BytecodeBuilder::new("shapes.js");
    let sym_a = b.intern_identifier("a");
    let sym_b = b.intern_identifier("b");
    let mut f = b.function("main", 6, 0);
    // obj1 = {}; obj1.a = 1; obj1.b = 2;  (same add sequence for obj2)
    f.new_object(0);
    f.load_int8(2, 1);
    f.put_by_id(0, 2, 0, sym_a);
    f.load_int8(2, 2);
    f.put_by_id(0, 2, 1, sym_b);
    f.new_object(1);
    f.load_int8(2, 1);
    f.put_by_id(1, 2, 2, sym_a);
    f.load_int8(2, 2);
    f.put_by_id(1, 2, 3, sym_b);
    // Read .b on each object through the SAME cache slot (4).
    f.get_by_id(3, 0, 4, sym_b);
    f.get_by_id(4, 1, 4, sym_b);
    f.add(5, 3, 4);
    f.ret(5);
    let main = f.finish();
    b.set_global_function(main);
    let module = b.build();

    let mut rt = new_runtime();
    let result = rt.run_module(&module).unwrap();
    assert_eq!(result.as_number(), 4.0, "both reads returned 2");

    let stats = rt.cache_stats();
    assert!(
        stats.hits >= 1,
        "the second read through the shared cache slot must hit \
         (hits={}, misses={})",
        stats.hits,
        stats.misses
    );
}

#[test]
fn objects_with_same_shape_share_a_hidden_class() {
    let mut rt = new_runtime();
    let a = rt.create_object().unwrap();
    let b = rt.create_object().unwrap();
    for obj in [a, b] {
        rt.set_property(obj, "x", Value::number(1.0)).unwrap();
        rt.set_property(obj, "y", Value::number(2.0)).unwrap();
    }
    assert_eq!(
        object::class_of(a),
        object::class_of(b),
        "same property-addition sequence must share a class"
    );

    // A different flag/key order diverges.
    let c = rt.create_object().unwrap();
    rt.set_property(c, "y", Value::number(2.0)).unwrap();
    rt.set_property(c, "x", Value::number(1.0)).unwrap();
    assert_ne!(object::class_of(a), object::class_of(c));
}

#[test]
fn young_to_old_promotion_preserves_the_array() {
    const COUNT: i32 = 20_000;
    let mut b = BytecodeBuilder::new("promote.js");
    let sym_length = b.intern_identifier("length");
    let mut f = b.function("main", 6, 0);
    // r0 = []; for (i = 0; i < COUNT; i++) { r0[i] = {} }  return r0.length
    f.new_array(0, 0);
    f.load_int8(1, 0); // i
    f.load_int32(2, COUNT);
    let top = f.label();
    let done = f.label();
    f.bind(top);
    f.binary(Opcode::Lt, 3, 1, 2);
    f.jmp_false(3, done);
    f.new_object(4);
    f.put_by_val(0, 1, 4);
    f.load_int8(5, 1);
    f.add(1, 1, 5);
    f.jmp(top);
    f.bind(done);
    f.get_by_id(4, 0, 0, sym_length);
    f.ret(4);
    let main = f.finish();
    b.set_global_function(main);
    let module = b.build();

    let mut rt = new_runtime();
    let result = rt.run_module(&module).unwrap();
    assert_eq!(
        result.as_number(),
        COUNT as f64,
        "array length observable to JS is unchanged by promotion"
    );
    assert!(
        rt.gc_stats().young_collections >= 1,
        "the loop must outgrow the nursery"
    );
    assert!(rt.gc_stats().bytes_promoted > 0);
}

#[test]
fn closures_capture_by_reference() {
    let mut b = BytecodeBuilder::new("closures.js");

    let mut outer = b.function("outer", 6, 0);
    // env = { x: 10 }; setter(); return reader();
    outer.create_environment(0, 1);
    outer.load_int8(1, 10);
    outer.store_to_environment(0, 0, 1);
    outer.create_closure(2, 0, 1); // reader
    outer.create_closure(3, 0, 2); // setter
    outer.load_undefined(4);
    outer.call(5, 3, 4, 0, 0); // setter()
    outer.call(5, 2, 4, 0, 0); // reader()
    outer.ret(5);
    let outer_idx = outer.finish();

    let mut reader = b.function("reader", 2, 0);
    reader.get_environment(0, 0);
    reader.load_from_environment(1, 0, 0);
    reader.ret(1);
    let reader_idx = reader.finish();
    assert_eq!(reader_idx, 1);

    let mut setter = b.function("setter", 2, 0);
    setter.get_environment(0, 0);
    setter.load_int8(1, 20);
    setter.store_to_environment(0, 0, 1);
    setter.load_undefined(1);
    setter.ret(1);
    let setter_idx = setter.finish();
    assert_eq!(setter_idx, 2);

    b.set_global_function(outer_idx);
    let result = run(&b.build()).unwrap();
    assert_eq!(
        result.as_number(),
        20.0,
        "the reader observes the setter's write through the shared environment"
    );
}

#[test]
fn exception_crosses_frames_and_skips_the_rest_of_g() {
    let mut b = BytecodeBuilder::new("throwy.js");
    let boom = b.intern_string("boom");
    let g_ran = b.intern_identifier("gRan");

    // f: try { g() } catch (e) { return e }
    let mut f = b.function("f", 4, 0);
    let try_start = f.label();
    let try_end = f.label();
    let handler = f.label();
    f.bind(try_start);
    f.create_environment(0, 0);
    f.create_closure(0, 0, 1); // g
    f.load_undefined(1);
    f.call(2, 0, 1, 0, 0);
    f.bind(try_end);
    f.ret(2); // not reached
    f.bind(handler);
    f.catch(3);
    f.ret(3);
    f.exception_range(try_start, try_end, handler);
    let f_idx = f.finish();

    // g: h(); globalThis.gRan = true  (never reached)
    let mut g = b.function("g", 4, 0);
    g.create_environment(0, 0);
    g.create_closure(0, 0, 2); // h
    g.load_undefined(1);
    g.call(2, 0, 1, 0, 0);
    g.get_global_object(3);
    g.load_true(2);
    g.put_by_id(3, 2, 0, g_ran);
    g.load_undefined(2);
    g.ret(2);
    let g_idx = g.finish();
    assert_eq!(g_idx, 1);

    // h: throw "boom"
    let mut h = b.function("h", 1, 0);
    h.load_string(0, boom);
    h.throw(0);
    let h_idx = h.finish();
    assert_eq!(h_idx, 2);

    // global: return f()
    let mut global = b.function("main", 3, 0);
    global.create_environment(0, 0);
    global.create_closure(0, 0, f_idx);
    global.load_undefined(1);
    global.call(2, 0, 1, 0, 0);
    global.ret(2);
    let main = global.finish();
    b.set_global_function(main);
    assert_eq!(f_idx, 0);
    let module = b.build();

    let mut rt = new_runtime();
    let result = rt.run_module(&module).unwrap();
    assert!(result.is_string());
    let caught = rt.get_property(rt.global_object(), "gRan").unwrap();
    assert!(
        caught.is_undefined(),
        "g must not continue after h throws through it"
    );
    let text = rt.create_string("boom").unwrap();
    assert!(result.strict_equals(text), "the caught value is the thrown string");
}

#[test]
fn inner_catch_wins_over_outer() {
    let mut b = BytecodeBuilder::new("nested.js");
    let mut f = b.function("main", 4, 0);
    let outer_start = f.label();
    let outer_end = f.label();
    let outer_handler = f.label();
    let inner_start = f.label();
    let inner_end = f.label();
    let inner_handler = f.label();

    f.bind(outer_start);
    f.bind(inner_start);
    f.load_int8(0, 42);
    f.throw(0);
    f.bind(inner_end);
    f.bind(outer_end);
    f.load_int8(1, 0);
    f.ret(1);
    f.bind(inner_handler);
    f.catch(2);
    f.load_int8(3, 1);
    f.add(2, 2, 3); // 43 marks the inner handler
    f.ret(2);
    f.bind(outer_handler);
    f.catch(2);
    f.ret(2); // 42 would mark the outer handler
    // Inner ranges first, as the compiler emits them.
    f.exception_range(inner_start, inner_end, inner_handler);
    f.exception_range(outer_start, outer_end, outer_handler);
    let main = f.finish();
    b.set_global_function(main);

    let result = run(&b.build()).unwrap();
    assert_eq!(result.as_number(), 43.0, "the innermost covering handler runs");
}

#[test]
fn uncaught_exception_reaches_the_embedder() {
    let mut b = BytecodeBuilder::new("uncaught.js");
    let boom = b.intern_string("kaboom");
    let mut f = b.function("main", 1, 0);
    f.load_string(0, boom);
    f.throw(0);
    let main = f.finish();
    b.set_global_function(main);

    match run(&b.build()) {
        Err(VmError::Uncaught(error)) => assert_eq!(error.message, "kaboom"),
        other => panic!("expected an uncaught exception, got {other:?}"),
    }
}

#[test]
fn strict_mode_gates_undeclared_global_assignment() {
    // Strict: ReferenceError.
    let mut b = BytecodeBuilder::new("strict.js");
    let name = b.intern_identifier("notDeclared");
    let mut f = b.function("main", 2, 0);
    f.set_strict(true);
    f.get_global_object(0);
    f.load_int8(1, 5);
    f.try_put_by_id(0, 1, 0, name);
    f.ret(1);
    let main = f.finish();
    b.set_global_function(main);
    match run(&b.build()) {
        Err(VmError::Uncaught(error)) => {
            assert!(
                error.message.starts_with("ReferenceError"),
                "got: {}",
                error.message
            );
        }
        other => panic!("expected ReferenceError, got {other:?}"),
    }

    // Non-strict: the assignment creates the global and reads back.
    let mut b = BytecodeBuilder::new("sloppy.js");
    let name = b.intern_identifier("notDeclared");
    let mut f = b.function("main", 2, 0);
    f.get_global_object(0);
    f.load_int8(1, 5);
    f.try_put_by_id(0, 1, 0, name);
    f.try_get_by_id(1, 0, 1, name);
    f.ret(1);
    let main = f.finish();
    b.set_global_function(main);
    let result = run(&b.build()).unwrap();
    assert_eq!(result.as_number(), 5.0);
}

#[test]
fn try_get_by_id_raises_on_missing_globals() {
    let mut b = BytecodeBuilder::new("missing.js");
    let name = b.intern_identifier("noSuchThing");
    let mut f = b.function("main", 2, 0);
    f.get_global_object(0);
    f.try_get_by_id(1, 0, 0, name);
    f.ret(1);
    let main = f.finish();
    b.set_global_function(main);

    match run(&b.build()) {
        Err(VmError::Uncaught(error)) => {
            assert!(error.message.starts_with("ReferenceError"));
        }
        other => panic!("expected ReferenceError, got {other:?}"),
    }
}

#[test]
fn cache_invalidates_after_structural_mutation() {
    let mut b = BytecodeBuilder::new("invalidate.js");
    let sym_a = b.intern_identifier("a");
    let sym_b = b.intern_identifier("b");
    let mut f = b.function("main", 4, 0);
    // obj = {a: 1, b: 7}; read b (fills cache); delete a (dictionary
    // mode); read b again (slow path, same answer).
    f.new_object(0);
    f.load_int8(1, 1);
    f.put_by_id(0, 1, 0, sym_a);
    f.load_int8(1, 7);
    f.put_by_id(0, 1, 1, sym_b);
    f.get_by_id(2, 0, 2, sym_b);
    f.del_by_id(3, 0, sym_a);
    f.get_by_id(3, 0, 2, sym_b);
    f.add(2, 2, 3);
    f.ret(2);
    let main = f.finish();
    b.set_global_function(main);

    let result = run(&b.build()).unwrap();
    assert_eq!(result.as_number(), 14.0, "both reads return 7");
}

#[test]
fn loose_and_strict_equality_cascades() {
    let mut b = BytecodeBuilder::new("eq.js");
    let five = b.intern_string("5");
    let mut f = b.function("main", 6, 0);
    // ("5" == 5) is true; ("5" === 5) is false; (null == undefined) true.
    f.load_string(0, five);
    f.load_int8(1, 5);
    f.binary(Opcode::Eq, 2, 0, 1);
    f.binary(Opcode::StrictEq, 3, 0, 1);
    f.load_null(4);
    f.load_undefined(5);
    f.binary(Opcode::Eq, 4, 4, 5);
    // Pack the three booleans: eq*4 + strict*2 + nulleq
    f.load_int8(5, 4);
    f.binary(Opcode::Mul, 2, 2, 5);
    f.load_int8(5, 2);
    f.binary(Opcode::Mul, 3, 3, 5);
    f.binary(Opcode::Add, 2, 2, 3);
    f.binary(Opcode::Add, 2, 2, 4);
    f.ret(2);
    let main = f.finish();
    b.set_global_function(main);

    let result = run(&b.build()).unwrap();
    // true*4 + false*2 + true = 5
    assert_eq!(result.as_number(), 5.0);
}

#[test]
fn for_in_enumerates_indices_then_names_and_skips_deletions() {
    let mut b = BytecodeBuilder::new("forin.js");
    let (key_off, val_off) = b.object_literal(&[
        ("first", LiteralValue::Number(1.0)),
        ("second", LiteralValue::Number(2.0)),
    ]);
    let comma = b.intern_string(",");
    let mut f = b.function("main", 8, 0);
    // obj = {first: 1, second: 2}; acc = ""; for (k in obj) acc += k + ","
    f.new_object_with_buffer(0, key_off, val_off, 2);
    f.load_string(1, comma);
    f.load_string(2, comma); // acc starts as ","
    f.get_pname_list(3, 0, 4, 5);
    let top = f.label();
    let done = f.label();
    f.bind(top);
    f.get_next_pname(6, 3, 0, 4, 5);
    f.jmp_undefined(6, done);
    f.add(2, 2, 6);
    f.add(2, 2, 1);
    f.jmp(top);
    f.bind(done);
    f.ret(2);
    let main = f.finish();
    b.set_global_function(main);

    let mut rt = new_runtime();
    let result = rt.run_module(&b.build()).unwrap();
    let expected = rt.create_string(",first,second,").unwrap();
    assert!(result.strict_equals(expected));
}

#[test]
fn construct_uses_prototype_and_keeps_receiver() {
    let mut b = BytecodeBuilder::new("construct.js");
    let sym_v = b.intern_identifier("v");
    let sym_proto = b.intern_identifier("prototype");
    let sym_tag = b.intern_identifier("tag");

    // main: C = closure(ctor); C.prototype = {tag: 9}; o = new C(41);
    //       return o.v + o.tag
    let mut main = b.function("main", 8, 0);
    main.create_environment(0, 0);
    main.create_closure(1, 0, 1); // C
    main.new_object(2);
    main.load_int8(3, 9);
    main.put_by_id(2, 3, 0, sym_tag);
    main.put_by_id(1, 2, 1, sym_proto);
    main.load_int8(4, 41);
    main.construct(5, 1, 4, 1);
    main.get_by_id(6, 5, 2, sym_v);
    main.get_by_id(7, 5, 3, sym_tag);
    main.add(6, 6, 7);
    main.ret(6);
    let main_idx = main.finish();

    // ctor: this.v = arg0 + 1; return undefined (receiver is kept)
    let mut ctor = b.function("C", 4, 0);
    ctor.load_param(0, 0); // this
    ctor.load_param(1, 1); // arg
    ctor.load_int8(2, 1);
    ctor.add(1, 1, 2);
    ctor.put_by_id(0, 1, 0, sym_v);
    ctor.load_undefined(3);
    ctor.ret(3);
    let ctor_idx = ctor.finish();
    assert_eq!(ctor_idx, 1);

    b.set_global_function(main_idx);
    let result = run(&b.build()).unwrap();
    assert_eq!(result.as_number(), 51.0, "own 42 plus inherited 9");
}

#[test]
fn interpreter_runs_are_deterministic() {
    let mut b = BytecodeBuilder::new("det.js");
    let (key_off, val_off) = b.object_literal(&[
        ("alpha", LiteralValue::Number(3.0)),
        ("beta", LiteralValue::String(0)),
    ]);
    let arr_off = b.array_literal(&[
        LiteralValue::Number(1.0),
        LiteralValue::Bool(true),
        LiteralValue::Null,
    ]);
    let sym_alpha = b.intern_identifier("alpha");
    let sym_length = b.intern_identifier("length");
    let mut f = b.function("main", 6, 0);
    f.new_object_with_buffer(0, key_off, val_off, 2);
    f.new_array_with_buffer(1, arr_off, 3);
    f.get_by_id(2, 0, 0, sym_alpha);
    f.get_by_id(3, 1, 1, sym_length);
    f.mul(4, 2, 3);
    f.ret(4);
    let main = f.finish();
    b.set_global_function(main);
    let module = b.build();

    let a = run(&module).unwrap();
    let b2 = run(&module).unwrap();
    assert_eq!(a.bits(), b2.bits(), "two runs return identical results");
    assert_eq!(a.as_number(), 9.0);
}

#[test]
fn call_variants_pass_inline_arguments() {
    let mut b = BytecodeBuilder::new("calls.js");

    let mut main = b.function("main", 8, 0);
    main.create_environment(0, 0);
    main.create_closure(1, 0, 1); // sum2
    main.load_undefined(2);
    main.load_int8(3, 30);
    main.load_int8(4, 12);
    main.call2(5, 1, 2, 3, 4);
    main.ret(5);
    let main_idx = main.finish();

    let mut sum2 = b.function("sum2", 3, 2);
    sum2.load_param(0, 1);
    sum2.load_param(1, 2);
    sum2.add(2, 0, 1);
    sum2.ret(2);
    let sum2_idx = sum2.finish();
    assert_eq!(sum2_idx, 1);

    b.set_global_function(main_idx);
    let result = run(&b.build()).unwrap();
    assert_eq!(result.as_number(), 42.0);
}

#[test]
fn missing_arguments_read_as_undefined() {
    let mut b = BytecodeBuilder::new("missing_args.js");

    let mut main = b.function("main", 6, 0);
    main.create_environment(0, 0);
    main.create_closure(1, 0, 1);
    main.load_undefined(2);
    main.call(3, 1, 2, 0, 0); // no arguments at all
    main.unary(Opcode::TypeOf, 4, 3);
    main.ret(4);
    let main_idx = main.finish();

    let mut probe = b.function("probe", 2, 2);
    probe.load_param(0, 2); // second parameter, never passed
    probe.ret(0);
    let probe_idx = probe.finish();
    assert_eq!(probe_idx, 1);

    b.set_global_function(main_idx);
    let mut rt = new_runtime();
    let result = rt.run_module(&b.build()).unwrap();
    let expected = rt.create_string("undefined").unwrap();
    assert!(result.strict_equals(expected));
}

#[test]
fn deep_recursion_overflows_with_a_range_error() {
    let mut b = BytecodeBuilder::new("overflow.js");

    // f(n) = f(n + 1); unbounded recursion must hit the register cap.
    let mut main = b.function("main", 6, 0);
    main.create_environment(0, 0);
    main.create_closure(1, 0, 1);
    main.load_undefined(2);
    main.load_int8(3, 0);
    main.call1(4, 1, 2, 3);
    main.ret(4);
    let main_idx = main.finish();

    let mut f = b.function("f", 6, 1);
    f.load_param(0, 1);
    f.load_int8(1, 1);
    f.add(0, 0, 1);
    f.get_environment(2, 0);
    // Reload ourselves through the environment-less closure trick: the
    // callee register is reachable as a parameter of the caller instead.
    f.load_param(3, 0); // this (unused)
    f.create_closure(4, 2, 1);
    f.call1(5, 4, 3, 0);
    f.ret(5);
    let f_idx = f.finish();
    assert_eq!(f_idx, 1);

    b.set_global_function(main_idx);
    match run(&b.build()) {
        Err(VmError::Uncaught(error)) => {
            assert!(
                error.message.starts_with("RangeError"),
                "got: {}",
                error.message
            );
        }
        other => panic!("expected RangeError, got {other:?}"),
    }
}
