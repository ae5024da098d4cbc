//! VM bootstrap: the core class hierarchy, the error tree, and native
//! method registration.

use crate::natives;
use crate::object::ObjRef;
use crate::value::Value;
use crate::vm::Vm;

/// Errno-keyed SystemError subclasses (Linux numbering).
const ERRNO_CLASSES: &[(&str, i32)] = &[
    ("EPERM", 1),
    ("ENOENT", 2),
    ("EINTR", 4),
    ("E2BIG", 7),
    ("EBADF", 9),
    ("EAGAIN", 11),
    ("EACCES", 13),
    ("EEXIST", 17),
    ("EINVAL", 22),
    ("EADDRINUSE", 98),
    ("ECONNRESET", 104),
];

/// Builds the class hierarchy and registers every built-in native.
pub fn bootstrap(vm: &mut Vm) {
    // Object, Module, and Class refer to one another; wire them by
    // hand before anything else allocates.
    let object = vm.new_class(None, None, false);
    let module = vm.new_class(None, Some(object), false);
    let class = vm.new_class(None, Some(module), false);
    for (r, name) in [(object, "Object"), (module, "Module"), (class, "Class")] {
        let name = vm.intern(name);
        vm.heap.class_mut(r).info.name = Some(name);
        vm.heap.class_mut(r).core.klass = Some(class);
        vm.heap.promote_now(r);
        vm.constants.insert(name, Value::Obj(r));
        vm.globals.insert(name, Value::Obj(r));
    }
    vm.core.object = Some(object);
    vm.core.module = Some(module);
    vm.core.class = Some(class);

    vm.core.string = Some(vm.add_global_class("String", Some(object)));
    vm.core.array = Some(vm.add_global_class("Array", Some(object)));
    vm.core.map = Some(vm.add_global_class("Map", Some(object)));
    vm.core.iterator = Some(vm.add_global_class("Iterator", Some(object)));
    vm.core.block = Some(vm.add_global_class("Block", Some(object)));
    vm.core.thread = Some(vm.add_global_class("Thread", Some(object)));
    vm.core.mutex = Some(vm.add_global_class("Mutex", Some(object)));

    bootstrap_errors(vm, object);

    vm.core.gc_module = Some(vm.add_global_module("GC"));
    vm.core.signal_module = Some(vm.add_global_module("Signal"));

    natives::register_all(vm);

    log::debug!("vm bootstrap complete: {} live objects", vm.heap.live_objects());
}

fn bootstrap_errors(vm: &mut Vm, object: ObjRef) {
    let error = vm.add_global_class("Error", Some(object));
    vm.core.error = Some(error);
    vm.core.arg_error = Some(vm.add_global_class("ArgumentError", Some(error)));
    vm.core.type_error = Some(vm.add_global_class("TypeError", Some(error)));
    vm.core.name_error = Some(vm.add_global_class("NameError", Some(error)));
    vm.core.syntax_error = Some(vm.add_global_class("SyntaxError", Some(error)));
    vm.core.load_error = Some(vm.add_global_class("LoadError", Some(error)));
    vm.core.regex_error = Some(vm.add_global_class("RegexError", Some(error)));
    vm.core.recursion_error = Some(vm.add_global_class("RecursionError", Some(error)));

    let system_error = vm.add_global_class("SystemError", Some(error));
    vm.core.system_error = Some(system_error);
    for &(name, errno) in ERRNO_CLASSES {
        let key = vm.intern(name);
        let klass = vm.new_class(Some(key), Some(system_error), false);
        vm.heap.promote_now(klass);
        vm.add_constant_under(system_error, name, Value::Obj(klass));
        // The errno rides on the class itself as a property.
        let errno_key = vm.intern("errno");
        if let Some(core) = vm.heap.instance_core_mut(klass) {
            core.fields.insert(errno_key, Value::Number(errno as f64));
        }
        vm.errno_classes.insert(errno, klass);
    }

    // Internal block-control classes: real error classes, but not meant
    // to be caught by user code.
    let block_iter = vm.add_global_class("BlockIterError", Some(error));
    vm.core.break_block_error = Some(vm.add_global_class("BreakBlockError", Some(block_iter)));
    vm.core.continue_block_error =
        Some(vm.add_global_class("ContinueBlockError", Some(block_iter)));
    vm.core.return_block_error =
        Some(vm.add_global_class("ReturnBlockError", Some(block_iter)));
}

/// The SystemError subclass keyed by `errno`, or SystemError itself.
pub fn sys_err_class(vm: &Vm, errno: i32) -> ObjRef {
    vm.errno_classes
        .get(&errno)
        .copied()
        .or(vm.core.system_error)
        .expect("error classes bootstrapped")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_hierarchy() {
        let vm = Vm::new();
        let object = vm.core.object.unwrap();
        let class = vm.core.class.unwrap();
        let module = vm.core.module.unwrap();

        // Class < Module < Object, superclass chain terminates at
        // Object whose superclass is null.
        assert_eq!(vm.heap.class(class).info.superclass, Some(module));
        assert_eq!(vm.heap.class(module).info.superclass, Some(object));
        assert_eq!(vm.heap.class(object).info.superclass, None);

        // Everything is an instance of Class.
        assert_eq!(vm.heap.class(object).core.klass, Some(class));
        assert_eq!(vm.heap.class(class).core.klass, Some(class));
    }

    #[test]
    fn test_error_tree() {
        let mut vm = Vm::new();
        let error = vm.core.error.unwrap();
        for klass in [
            vm.core.arg_error.unwrap(),
            vm.core.type_error.unwrap(),
            vm.core.name_error.unwrap(),
            vm.core.recursion_error.unwrap(),
            vm.core.system_error.unwrap(),
        ] {
            let inst = vm.new_instance(klass);
            assert!(vm.is_a(&Value::Obj(inst), error));
        }
        // Errno subclasses resolve by number and fall back to the
        // umbrella class.
        let enoent = sys_err_class(&vm, 2);
        assert_eq!(vm.class_name(enoent), "ENOENT");
        assert_eq!(sys_err_class(&vm, 9999), vm.core.system_error.unwrap());
        let eintr = vm.new_instance(sys_err_class(&vm, 4));
        assert!(vm.is_a(&Value::Obj(eintr), vm.core.system_error.unwrap()));
    }
}
