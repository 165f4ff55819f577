use clap::Parser;
use mask::lua_vm::{LuaError, SafeOption};
use mask::stdlib;
use mask::LuaVM;
use std::fs;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

const VERSION: &str = "Mask 0.1 (compatible)";

/// Exit codes per the embedding contract: 0 success, 1 runtime error,
/// 2 syntax error, 3 file I/O error, 4 memory error.
const EXIT_SUCCESS: i32 = 0;
const EXIT_RUNTIME_ERROR: i32 = 1;
const EXIT_SYNTAX_ERROR: i32 = 2;
const EXIT_IO_ERROR: i32 = 3;
const EXIT_MEMORY_ERROR: i32 = 4;

#[derive(Parser, Debug, Default)]
#[command(name = "mask", version = VERSION, about = "Mask language interpreter")]
struct Cli {
    /// Execute string 'chunk'
    #[arg(short = 'e', value_name = "chunk")]
    execute: Vec<String>,

    /// Require library 'name' into the matching global before running the script
    #[arg(short = 'l', value_name = "name")]
    require: Vec<String>,

    /// Enter interactive mode after executing the script
    #[arg(short = 'i')]
    interactive: bool,

    /// Script file to run, and its arguments
    #[arg(trailing_var_arg = true)]
    script: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt::try_init().ok();

    // Mirrors the recursive-descent VM's need for a deep native stack: each
    // call frame recurses through the dispatch loop.
    let stack_size = 16 * 1024 * 1024;
    let builder = std::thread::Builder::new()
        .name("mask-main".into())
        .stack_size(stack_size);

    let handler = builder.spawn(run).expect("failed to spawn mask-main thread");
    match handler.join() {
        Ok(code) => std::process::exit(code),
        Err(_) => {
            eprintln!("mask: internal error (thread panicked)");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

fn run() -> i32 {
    let cli = Cli::parse();

    let mut vm = LuaVM::new(SafeOption {
        max_stack_size: 1_000_000,
        max_call_depth: if cfg!(debug_assertions) { 25 } else { 256 },
        base_call_depth: if cfg!(debug_assertions) { 25 } else { 256 },
        max_memory_limit: 1024 * 1024 * 1024,
    });
    if let Err(e) = vm.open_stdlib(stdlib::Stdlib::All) {
        eprintln!("mask: failed to initialize stdlib: {}", e);
        return exit_code_for(e);
    }

    let (script_file, script_args) = match cli.script.split_first() {
        Some((first, rest)) => (Some(first.clone()), rest.to_vec()),
        None => (None, Vec::new()),
    };
    setup_arg_table(&mut vm, script_file.as_deref(), &script_args);

    for module in &cli.require {
        if let Err(code) = require_module(&mut vm, module) {
            return code;
        }
    }

    for chunk_src in &cli.execute {
        if let Err(code) = compile_and_run(&mut vm, chunk_src, "=(command line)") {
            return code;
        }
    }

    if let Some(filename) = &script_file {
        if let Err(code) = execute_file(&mut vm, filename) {
            return code;
        }
    }

    if cli.interactive || (cli.execute.is_empty() && script_file.is_none()) {
        run_repl(&mut vm);
    }

    EXIT_SUCCESS
}

fn setup_arg_table(vm: &mut LuaVM, script_name: Option<&str>, args: &[String]) {
    let arg_table = vm.create_table(args.len(), 1);
    if let Some(name) = script_name {
        let s = vm.create_string(name);
        vm.raw_seti(&arg_table, 0, s);
    }
    for (i, a) in args.iter().enumerate() {
        let s = vm.create_string(a);
        vm.raw_seti(&arg_table, (i + 1) as i64, s);
    }
    vm.set_global("arg", arg_table);
}

fn require_module(vm: &mut LuaVM, module: &str) -> Result<(), i32> {
    let code = format!("{module} = require('{module}')");
    compile_and_run(vm, &code, "=(require)")
}

/// Strips a leading shebang line, replacing it with a blank line so
/// reported line numbers still match the original source.
fn strip_shebang(source: &str) -> String {
    if source.starts_with("#!") {
        if let Some(nl) = source.find('\n') {
            return format!("\n{}", &source[nl + 1..]);
        }
        return String::new();
    }
    source.to_string()
}

fn execute_file(vm: &mut LuaVM, filename: &str) -> Result<(), i32> {
    let raw = match fs::read_to_string(filename) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("mask: cannot open {}: {}", filename, e);
            return Err(EXIT_IO_ERROR);
        }
    };
    let source = strip_shebang(&raw);

    match vm.compile_with_name(&source, filename) {
        Ok(chunk) => match vm.execute(Rc::new(chunk)) {
            Ok(_) => Ok(()),
            Err(e) => {
                let traceback = vm.generate_traceback(vm.get_error_message());
                eprintln!("mask: {}", traceback);
                Err(exit_code_for(e))
            }
        },
        Err(e) => {
            eprintln!("mask: {}: {}", filename, vm.get_error_message());
            Err(exit_code_for(e))
        }
    }
}

fn compile_and_run(vm: &mut LuaVM, source: &str, chunk_name: &str) -> Result<(), i32> {
    match vm.compile_with_name(source, chunk_name) {
        Ok(chunk) => match vm.execute(Rc::new(chunk)) {
            Ok(_) => Ok(()),
            Err(e) => {
                eprintln!("mask: {}", vm.get_error_message());
                Err(exit_code_for(e))
            }
        },
        Err(e) => {
            eprintln!("mask: {}", vm.get_error_message());
            Err(exit_code_for(e))
        }
    }
}

fn exit_code_for(e: LuaError) -> i32 {
    match e {
        LuaError::OutOfMemory => EXIT_MEMORY_ERROR,
        LuaError::CompileError => EXIT_SYNTAX_ERROR,
        _ => EXIT_RUNTIME_ERROR,
    }
}

fn run_repl(vm: &mut LuaVM) {
    println!("{}", VERSION);
    println!("Type Ctrl+C or Ctrl+D to exit\n");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut incomplete = String::new();

    loop {
        print!("{}", if incomplete.is_empty() { "> " } else { ">> " });
        io::stdout().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if incomplete.is_empty() && (trimmed == "exit" || trimmed == "quit") {
            break;
        }

        if !incomplete.is_empty() {
            incomplete.push('\n');
        }
        incomplete.push_str(&line);

        let expr_code = format!("return {}", incomplete);
        let code_to_run = if vm.compile(&expr_code).is_ok() {
            expr_code
        } else {
            incomplete.clone()
        };

        match vm.compile(&code_to_run) {
            Ok(chunk) => match vm.execute(Rc::new(chunk)) {
                Ok(results) => {
                    if let Some(first) = results.into_iter().next() {
                        if !first.is_nil() {
                            println!("{:?}", first);
                        }
                    }
                    incomplete.clear();
                }
                Err(_) => {
                    eprintln!("{}", vm.get_error_message());
                    incomplete.clear();
                }
            },
            Err(_) => {
                let msg = vm.get_error_message().to_string();
                if msg.contains("<eof>") || msg.contains("expected") {
                    continue;
                }
                eprintln!("{}", msg);
                incomplete.clear();
            }
        }
    }
}
