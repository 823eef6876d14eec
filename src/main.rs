use std::{env, fs, process};

use ember::{
    bytecode::disassembler::disassemble_block,
    frontend::compiler,
    runtime::{value::Value, vm::VM, ExitCode},
};

fn main() {
    let mut args: Vec<String> = env::args().collect();
    let trace = args.iter().any(|arg| arg == "--trace");
    let bytecode = args.iter().any(|arg| arg == "--bytecode");
    if trace {
        args.retain(|arg| arg != "--trace");
    }
    if bytecode {
        args.retain(|arg| arg != "--bytecode");
    }

    if args.len() < 2 {
        print_help();
        return;
    }

    let path = &args[1];
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: cannot read {}: {}", path, err);
            process::exit(66);
        }
    };

    let mut vm = VM::new();
    vm.set_trace(trace);
    vm.load_stdlib();

    if bytecode {
        show_bytecode(&mut vm, &source);
        return;
    }

    match vm.interpret(&source) {
        ExitCode::Success => {
            if vm.return_value != Value::Nil {
                println!("{}", vm.heap().display(vm.return_value));
            }
        }
        ExitCode::CompileError => process::exit(65),
        ExitCode::RuntimeError => process::exit(70),
    }
}

fn show_bytecode(vm: &mut VM, source: &str) {
    match compiler::compile(vm, source) {
        Ok(handle) => {
            let code_block = vm.heap().code_block(handle);
            let name = vm.heap().str_contents(code_block.name);
            print!("{}", disassemble_block(vm.heap(), name, &code_block.block));
            vm.gc_unprotect(handle);
        }
        Err(err) => {
            eprintln!("[line {}]: {}", err.line, err.message);
            process::exit(65);
        }
    }
}

fn print_help() {
    eprintln!("Usage: ember <script.em> [--trace] [--bytecode]");
    eprintln!();
    eprintln!("  --trace      print each instruction and the stack while running");
    eprintln!("  --bytecode   print the compiled bytecode and exit");
}
