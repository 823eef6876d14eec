use std::sync::atomic::{AtomicBool, Ordering};

use ember::runtime::{value::Value, vm::VM, ExitCode};

fn sum(vm: &mut VM, argc: usize) -> Result<Value, String> {
    let mut total = 0.0;
    for value in vm.native_args(argc) {
        match value {
            Value::Num(n) => total += n,
            other => {
                return Err(format!(
                    "sum expected a number, got {}",
                    vm.heap().type_name(*other)
                ))
            }
        }
    }
    Ok(Value::Num(total))
}

fn fail(_vm: &mut VM, _argc: usize) -> Result<Value, String> {
    Err("native exploded".to_string())
}

#[test]
fn test_native_result_replaces_callee_and_args() {
    let mut vm = VM::new();
    vm.register_native("sum", sum);
    assert_eq!(vm.interpret("return sum(1, 2, 3) + 10;"), ExitCode::Success);
    assert_eq!(vm.return_value, Value::Num(16.0));
}

#[test]
fn test_native_with_no_args() {
    let mut vm = VM::new();
    vm.register_native("sum", sum);
    assert_eq!(vm.interpret("return sum();"), ExitCode::Success);
    assert_eq!(vm.return_value, Value::Num(0.0));
}

#[test]
fn test_native_error_unwinds_as_runtime_error() {
    let mut vm = VM::new();
    vm.set_error_handler(|_, _| {});
    vm.register_native("fail", fail);
    assert_eq!(vm.interpret("fail();"), ExitCode::RuntimeError);
    let err = vm.last_error().unwrap();
    assert!(err.contains("native exploded"), "{}", err);
    assert!(err.contains("stack trace:"), "{}", err);
}

#[test]
fn test_native_type_error_carries_script_line() {
    let mut vm = VM::new();
    vm.set_error_handler(|_, _| {});
    vm.register_native("sum", sum);
    assert_eq!(vm.interpret("let a = 1;\nsum(a, nil);"), ExitCode::RuntimeError);
    let err = vm.last_error().unwrap();
    assert!(err.contains("sum expected a number, got nil"), "{}", err);
    assert!(err.contains("[line 2]"), "{}", err);
}

fn probe_depth(vm: &mut VM, _argc: usize) -> Result<Value, String> {
    // Script: closure + three locals + this native = five stack slots.
    if vm.stack_depth() != 5 {
        return Err(format!("unexpected stack depth {}", vm.stack_depth()));
    }
    Ok(Value::Nil)
}

#[test]
fn test_stack_discipline_observed_from_a_native() {
    let mut vm = VM::new();
    vm.register_native("probe", probe_depth);
    let code = vm.interpret("let a = 4; let b = 2; let c = a + b; probe(); return c;");
    assert_eq!(
        code,
        ExitCode::Success,
        "{}",
        vm.last_error().unwrap_or("<no error>")
    );
    assert_eq!(vm.return_value, Value::Num(6.0));
}

static HANDLER_CALLED: AtomicBool = AtomicBool::new(false);

fn record_error(_vm: &VM, message: &str) {
    assert!(message.contains("Attempt to divide by 0."));
    HANDLER_CALLED.store(true, Ordering::SeqCst);
}

#[test]
fn test_error_handler_receives_formatted_message() {
    let mut vm = VM::new();
    vm.set_error_handler(record_error);
    assert_eq!(vm.interpret("return 1 / 0;"), ExitCode::RuntimeError);
    assert!(HANDLER_CALLED.load(Ordering::SeqCst));
}

#[test]
fn test_interning_is_identity_across_the_api() {
    let mut vm = VM::new();
    let a = vm.intern("shared");
    let b = vm.intern("shared");
    assert_eq!(a, b);
    assert_eq!(vm.heap().str_contents(a), "shared");

    // A string built by the script resolves to the same object.
    assert_eq!(vm.interpret("return \"sha\" .. \"red\";"), ExitCode::Success);
    assert_eq!(vm.return_value, Value::Object(a));
}

#[test]
fn test_stdlib_print_and_clock() {
    let mut vm = VM::new();
    vm.load_stdlib();
    assert_eq!(
        vm.interpret("print(1, \"two\", nil, true); return clock() > 0;"),
        ExitCode::Success
    );
    assert_eq!(vm.return_value, Value::Bool(true));
}

#[test]
fn test_natives_are_reachable_as_globals() {
    let mut vm = VM::new();
    vm.load_stdlib();
    assert_eq!(vm.interpret("return print != nil;"), ExitCode::Success);
    assert_eq!(vm.return_value, Value::Bool(true));
}

#[test]
fn test_return_value_defaults_to_nil() {
    let mut vm = VM::new();
    assert_eq!(vm.interpret("let x = 1;"), ExitCode::Success);
    assert_eq!(vm.return_value, Value::Nil);
}
