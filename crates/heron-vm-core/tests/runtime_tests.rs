//! Runtime-surface tests: host functions, handles, bound functions,
//! custom roots, snapshots, and GC interaction with the object model.

use std::cell::RefCell;
use std::rc::Rc;

use heron_vm_bytecode::{BytecodeBuilder, Opcode};
use heron_vm_core::{
    JsResult, LockedRuntime, Runtime, RuntimeConfig, Value, function, object, strings,
    write_heap_snapshot,
};

fn new_runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime creation")
}

#[test]
fn host_functions_are_callable_from_bytecode() {
    let mut rt = new_runtime();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = Rc::clone(&seen);
    rt.register_host_function(
        "record",
        1,
        Rc::new(move |_rt, _this, args| {
            seen2.borrow_mut().push(args[0].as_number());
            Ok(Value::number(args[0].as_number() * 2.0))
        }),
    )
    .unwrap();

    let mut b = BytecodeBuilder::new("host.js");
    let record = b.intern_identifier("record");
    let mut f = b.function("main", 4, 0);
    f.get_global_object(0);
    f.try_get_by_id(1, 0, 0, record);
    f.load_int8(2, 21);
    f.call1(3, 1, 0, 2);
    f.ret(3);
    let main = f.finish();
    b.set_global_function(main);

    let result = rt.run_module(&b.build()).unwrap();
    assert_eq!(result.as_number(), 42.0);
    assert_eq!(*seen.borrow(), vec![21.0]);
}

#[test]
fn host_function_can_reenter_the_interpreter() {
    let mut rt = new_runtime();
    rt.register_host_function(
        "twice",
        1,
        Rc::new(|rt, _this, args| {
            // Call the JS callback twice and sum the results. The callee
            // is rooted in a scope across the re-entrant calls; the scope
            // closes on every exit path.
            let callback = args[0];
            rt.with_scope(|rt| {
                let h_callback = rt.new_handle(callback);
                let callback = rt.handle_value(h_callback);
                let first = rt.try_call(callback, Value::undefined(), &[Value::number(1.0)])?;
                let callback = rt.handle_value(h_callback);
                let second = rt.try_call(callback, Value::undefined(), &[Value::number(2.0)])?;
                Ok(Value::number(first.as_number() + second.as_number()))
            })
        }),
    )
    .unwrap();

    let mut b = BytecodeBuilder::new("reenter.js");
    let twice = b.intern_identifier("twice");
    let mut main = b.function("main", 5, 0);
    main.create_environment(0, 0);
    main.create_closure(1, 0, 1); // tenfold
    main.get_global_object(2);
    main.try_get_by_id(3, 2, 0, twice);
    main.call1(4, 3, 2, 1);
    main.ret(4);
    let main_idx = main.finish();

    let mut tenfold = b.function("tenfold", 3, 1);
    tenfold.load_param(0, 1);
    tenfold.load_int8(1, 10);
    tenfold.mul(2, 0, 1);
    tenfold.ret(2);
    let tenfold_idx = tenfold.finish();
    assert_eq!(tenfold_idx, 1);

    b.set_global_function(main_idx);
    let result = rt.run_module(&b.build()).unwrap();
    assert_eq!(result.as_number(), 30.0, "10*1 + 10*2");
}

#[test]
fn bound_functions_unwrap_with_leading_args() {
    let mut rt = new_runtime();
    rt.register_host_function(
        "subtract",
        2,
        Rc::new(|_rt, this, args| {
            let base = if this.is_number() { this.as_number() } else { 0.0 };
            Ok(Value::number(
                base + args[0].as_number() - args[1].as_number(),
            ))
        }),
    )
    .unwrap();
    let target = rt.get_property(rt.global_object(), "subtract").unwrap();

    let bound = function::new_bound_function(
        &mut rt,
        target,
        Value::number(100.0),
        &[Value::number(50.0)],
    )
    .unwrap();
    // bound(8) = 100 + 50 - 8
    let result = rt.call(bound, Value::undefined(), &[Value::number(8.0)]).unwrap();
    assert_eq!(result.as_number(), 142.0);

    // Double binding composes.
    let bound2 =
        function::new_bound_function(&mut rt, bound, Value::undefined(), &[]).unwrap();
    let result = rt
        .call(bound2, Value::undefined(), &[Value::number(8.0)])
        .unwrap();
    assert_eq!(result.as_number(), 142.0);
}

#[test]
fn handles_keep_values_alive_across_collections() {
    let mut rt = new_runtime();
    let scope = rt.push_scope();
    let s = rt.create_string("durable").unwrap();
    let h = rt.new_handle(s);

    // Churn enough garbage to force promotions and a full collection.
    for _ in 0..10_000 {
        rt.create_object().unwrap();
    }
    rt.collect_garbage();

    let survived = rt.handle_value(h);
    assert!(survived.is_string());
    assert_eq!(strings::to_rust_string(survived), "durable");
    rt.pop_scope(scope);
}

#[test]
fn custom_roots_are_visited() {
    let mut rt = new_runtime();
    let s = rt.create_string("pinned-by-callback").unwrap();
    let slot = Rc::new(RefCell::new(s));
    let slot2 = Rc::clone(&slot);
    rt.register_custom_root(Box::new(move |acceptor| {
        // SAFETY: the RefCell's interior is a valid Value slot for the
        // duration of the visit.
        unsafe { acceptor.value_slot(slot2.as_ptr()) };
    }));

    for _ in 0..10_000 {
        rt.create_object().unwrap();
    }
    rt.collect_garbage();

    let survived = *slot.borrow();
    assert!(survived.is_string());
    assert_eq!(strings::to_rust_string(survived), "pinned-by-callback");
}

#[test]
fn object_graphs_survive_collection_through_the_global() {
    let mut rt = new_runtime();
    let holder = rt.create_object().unwrap();
    let global = rt.global_object();
    rt.set_property(global, "holder", holder).unwrap();
    let payload = rt.create_array(3).unwrap();
    // Raw `Value`s go stale across allocations; re-fetch through the
    // rooted global after anything that can collect.
    let holder = rt.get_property(rt.global_object(), "holder").unwrap();
    rt.set_property(holder, "list", payload).unwrap();
    let text = rt.create_string("deep").unwrap();
    let holder = rt.get_property(rt.global_object(), "holder").unwrap();
    let list = rt.get_property(holder, "list").unwrap();
    object::set_indexed(&mut rt, list, 2, text).unwrap();

    rt.collect_garbage();
    rt.collect_garbage();

    let holder = rt.get_property(rt.global_object(), "holder").unwrap();
    let list = rt.get_property(holder, "list").unwrap();
    let cell = object::as_object(list).expect("array survived");
    assert_eq!(object::indexed_length(cell), 3);
    let deep = object::get_indexed(cell, 2).expect("element survived");
    assert_eq!(strings::to_rust_string(deep), "deep");
}

#[test]
fn deleting_a_property_converts_to_dictionary_and_keeps_the_rest() {
    let mut rt = new_runtime();
    let obj = rt.create_object().unwrap();
    let global = rt.global_object();
    rt.set_property(global, "dictObj", obj).unwrap();
    let fetch = |rt: &mut Runtime| rt.get_property(rt.global_object(), "dictObj").unwrap();

    for (name, n) in [("keep", 1.0), ("drop", 2.0), ("also", 3.0)] {
        let obj = fetch(&mut rt);
        rt.set_property(obj, name, Value::number(n)).unwrap();
    }

    let sym = rt.intern("drop");
    let obj = fetch(&mut rt);
    let deleted = object::delete_property(&mut rt, obj, sym, false).unwrap();
    assert!(deleted);

    let obj = fetch(&mut rt);
    assert!(rt.get_property(obj, "drop").unwrap().is_undefined());
    assert_eq!(rt.get_property(obj, "keep").unwrap().as_number(), 1.0);
    assert_eq!(rt.get_property(obj, "also").unwrap().as_number(), 3.0);

    // New properties keep working in dictionary mode, across a GC.
    rt.set_property(obj, "late", Value::number(4.0)).unwrap();
    rt.collect_garbage();
    let obj = fetch(&mut rt);
    assert_eq!(rt.get_property(obj, "late").unwrap().as_number(), 4.0);
}

#[test]
fn many_properties_cross_the_dictionary_threshold() {
    let mut rt = new_runtime();
    let obj = rt.create_object().unwrap();
    let global = rt.global_object();
    rt.set_property(global, "wideObj", obj).unwrap();
    for i in 0..100 {
        let obj = rt.get_property(rt.global_object(), "wideObj").unwrap();
        rt.set_property(obj, &format!("p{i}"), Value::number(i as f64))
            .unwrap();
    }
    rt.collect_garbage();
    let obj = rt.get_property(rt.global_object(), "wideObj").unwrap();
    for i in (0..100).step_by(17) {
        assert_eq!(
            rt.get_property(obj, &format!("p{i}")).unwrap().as_number(),
            i as f64
        );
    }
}

#[test]
fn jit_tier_transition_keeps_construct_semantics() {
    let mut rt = new_runtime();

    // Compile the constructor (function 1) once it runs hot. The native
    // entry mirrors the bytecode body: this.v = 42, return undefined.
    // It records what it received as `this` so the tier transition is
    // observable.
    let receiver_kinds = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&receiver_kinds);
    rt.set_jit_hook(Box::new(move |_module, index| {
        if index != 1 {
            return None;
        }
        let observed = Rc::clone(&observed);
        Some(Rc::new(
            move |rt: &mut Runtime, this: Value, _args: &[Value]| -> JsResult<Value> {
                observed.borrow_mut().push(this.is_object());
                let sym = rt.intern("v");
                object::set_property(rt, this, sym, Value::number(42.0), false)?;
                Ok(Value::undefined())
            },
        ))
    }));

    // main: sum = 0; repeat 200x { o = new C(); sum += o.v }; return sum.
    // 200 constructions cross the hot threshold mid-loop, so both tiers
    // contribute to the sum.
    const ROUNDS: i32 = 200;
    let mut b = BytecodeBuilder::new("jit.js");
    let sym_v = b.intern_identifier("v");
    let mut main = b.function("main", 8, 0);
    main.create_environment(0, 0);
    main.create_closure(1, 0, 1); // C
    main.load_int32(2, ROUNDS);
    main.load_int8(3, 1); // decrement
    main.load_int8(4, 0); // sum
    main.load_int8(7, 0); // zero
    let top = main.label();
    let done = main.label();
    main.bind(top);
    main.binary(Opcode::LtEq, 5, 2, 7);
    main.jmp_true(5, done);
    main.construct(6, 1, 0, 0);
    main.get_by_id(6, 6, 0, sym_v);
    main.add(4, 4, 6);
    main.sub(2, 2, 3);
    main.jmp(top);
    main.bind(done);
    main.ret(4);
    let main_idx = main.finish();

    let mut ctor = b.function("C", 3, 0);
    ctor.load_param(0, 0); // this
    ctor.load_int8(1, 42);
    ctor.put_by_id(0, 1, 0, sym_v);
    ctor.load_undefined(2);
    ctor.ret(2);
    let ctor_idx = ctor.finish();
    assert_eq!(ctor_idx, 1);

    b.set_global_function(main_idx);
    let result = rt.run_module(&b.build()).unwrap();
    assert_eq!(
        result.as_number(),
        (ROUNDS * 42) as f64,
        "interpreted and jitted constructions produce identical objects"
    );

    let kinds = receiver_kinds.borrow();
    assert!(
        !kinds.is_empty(),
        "the constructor crossed the hot threshold and ran as native code"
    );
    assert!(
        kinds.iter().all(|&is_object| is_object),
        "the JIT tier must receive an allocated receiver, never undefined"
    );
}

#[test]
fn frozen_objects_reject_writes_and_additions() {
    let mut rt = new_runtime();
    let obj = rt.create_object().unwrap();
    let global = rt.global_object();
    rt.set_property(global, "frozenObj", obj).unwrap();
    let obj = rt.get_property(rt.global_object(), "frozenObj").unwrap();
    rt.set_property(obj, "x", Value::number(1.0)).unwrap();

    let obj = rt.get_property(rt.global_object(), "frozenObj").unwrap();
    object::freeze(&mut rt, obj).unwrap();

    // Non-strict writes and additions drop silently.
    let obj = rt.get_property(rt.global_object(), "frozenObj").unwrap();
    rt.set_property(obj, "x", Value::number(9.0)).unwrap();
    rt.set_property(obj, "y", Value::number(2.0)).unwrap();
    assert_eq!(rt.get_property(obj, "x").unwrap().as_number(), 1.0);
    assert!(rt.get_property(obj, "y").unwrap().is_undefined());

    // Delete fails: frozen properties are non-configurable.
    let sym = rt.intern("x");
    let deleted = object::delete_property(&mut rt, obj, sym, false).unwrap();
    assert!(!deleted);
}

#[test]
fn heap_snapshot_is_valid_json_with_nodes_and_edges() {
    let mut rt = new_runtime();
    let obj = rt.create_object().unwrap();
    let global = rt.global_object();
    rt.set_property(global, "snapshotRoot", obj).unwrap();
    let s = rt.create_string("snapshot-me").unwrap();
    let obj = rt.get_property(rt.global_object(), "snapshotRoot").unwrap();
    rt.set_property(obj, "tag", s).unwrap();

    let mut out = Vec::new();
    write_heap_snapshot(&rt, &mut out).unwrap();
    let snapshot: serde_json::Value = serde_json::from_slice(&out).unwrap();

    let nodes = snapshot["nodes"].as_array().unwrap();
    let edges = snapshot["edges"].as_array().unwrap();
    assert!(!nodes.is_empty());
    assert!(!edges.is_empty());
    assert_eq!(
        snapshot["meta"]["node_count"].as_u64().unwrap() as usize,
        nodes.len()
    );
    assert!(
        snapshot["strings"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["content"] == "snapshot-me"),
        "string contents are recorded"
    );
}

#[test]
fn locked_runtime_serializes_access() {
    let rt = new_runtime();
    let locked = LockedRuntime::new(rt);
    let n = locked.with(|rt| {
        let v = rt.create_string("locked").unwrap();
        strings::to_rust_string(v).len()
    });
    assert_eq!(n, 6);
}

#[test]
fn pending_exception_is_cleared_after_take() {
    let mut rt = new_runtime();
    let mut b = BytecodeBuilder::new("boom.js");
    let s = b.intern_string("x");
    let mut f = b.function("main", 1, 0);
    f.load_string(0, s);
    f.throw(0);
    let main = f.finish();
    b.set_global_function(main);

    assert!(rt.run_module(&b.build()).is_err());
    assert!(
        rt.pending_exception().is_none(),
        "the embedding boundary consumes the thrown value"
    );

    // The runtime keeps working afterwards.
    let v = rt.create_string("fine").unwrap();
    assert_eq!(strings::to_rust_string(v), "fine");
}
