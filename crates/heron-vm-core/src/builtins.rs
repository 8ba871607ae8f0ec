//! Default builtins.
//!
//! The builtin table is a fixed array of callable values `CallBuiltin`
//! indexes by small integer, with no name lookup. The driver installs
//! these defaults; embedders can overwrite any slot with
//! [`Runtime::set_builtin`].

use std::rc::Rc;

use heron_vm_heap::value::Value;

use crate::error::VmResult;
use crate::operations;
use crate::runtime::Runtime;
use crate::strings;

/// `print(...)`: stringify and write to stdout, space-separated.
pub const BUILTIN_PRINT: usize = 0;
/// `gc()`: force a full collection.
pub const BUILTIN_GC: usize = 1;

/// Register the default builtins as globals and table slots.
pub fn install_default_builtins(rt: &mut Runtime) -> VmResult<()> {
    let print = rt.register_host_function(
        "print",
        1,
        Rc::new(|rt: &mut Runtime, _this: Value, args: &[Value]| {
            // Stringification allocates; the arguments must be rooted
            // across it.
            let pieces = rt.with_scope(|rt| {
                let handles: Vec<_> = args.iter().map(|&a| rt.handles.new_handle(a)).collect();
                let mut pieces = Vec::with_capacity(handles.len());
                for h in handles {
                    let value = rt.handles.get(h);
                    let s = operations::to_string_value(rt, value)?;
                    pieces.push(strings::to_rust_string(s));
                }
                Ok(pieces)
            })?;
            println!("{}", pieces.join(" "));
            Ok(Value::undefined())
        }),
    )?;
    rt.set_builtin(BUILTIN_PRINT, print);

    let gc = rt.register_host_function(
        "gc",
        0,
        Rc::new(|rt: &mut Runtime, _this: Value, _args: &[Value]| {
            rt.collect_garbage();
            Ok(Value::undefined())
        }),
    )?;
    rt.set_builtin(BUILTIN_GC, gc);

    Ok(())
}
