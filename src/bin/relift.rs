//! the decompiler binary.  loads an executable image, disassembles and
//! lifts it, runs the analyses, and prints what it is asked to (by
//! default, the reconstructed C-like program).  when an output file name
//! is '-', stdout is used.
//!
//! run with `--help` for more info.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use relift::back::{cfg_to_dot, ir_to_dot, regions_to_dot, CodeGenerator};
use relift::common::cancel::CancellationToken;
use relift::common::{ByteAddr, Map};
use relift::front::elf;
use relift::front::{disassemble_image, Image};
use relift::middle::cconv::Signatures;
use relift::middle::dataflow::DataflowAnalyzer;
use relift::middle::inline;
use relift::middle::ir::{FuncId, Program, StmtId};
use relift::middle::pipeline::Driver;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input executable image
    file: Option<PathBuf>,

    /// list available parsers and exit
    #[arg(long)]
    list_parsers: bool,

    /// inline the function with the given address everywhere
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    inline_function: Vec<ByteAddr>,

    /// inline the call at the given address
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    inline_call: Vec<ByteAddr>,

    /// dump the image sections to the file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    print_sections: Option<String>,

    /// dump parsed instructions to the file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    print_instructions: Option<String>,

    /// dump the control flow graph in DOT language to the file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    print_cfg: Option<String>,

    /// dump the intermediate representation in DOT language to the file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    print_ir: Option<String>,

    /// dump the results of structural analysis in DOT language to the file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    print_regions: Option<String>,

    /// print the reconstructed program into the given file
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "-")]
    print_cxx: Option<String>,
}

fn parse_addr(text: &str) -> Result<ByteAddr, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => ByteAddr::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|error| format!("bad address '{text}': {error}"))
}

fn write_output(target: &str, contents: &str) -> anyhow::Result<()> {
    if target == "-" {
        print!("{contents}");
        Ok(())
    } else {
        std::fs::write(target, contents).with_context(|| format!("could not write '{target}'"))
    }
}

fn sections_text(image: &Image) -> String {
    let mut out = String::new();
    for section in image.sections() {
        let mut flags = String::new();
        if section.is_readable() {
            flags.push('r');
        }
        if section.is_writable() {
            flags.push('w');
        }
        if section.is_executable() {
            flags.push('x');
        }
        if section.is_code() {
            flags.push_str(",code");
        }
        if section.is_data() {
            flags.push_str(",data");
        }
        if section.is_bss() {
            flags.push_str(",bss");
        }
        out.push_str(&format!(
            "section name = '{}', start = 0x{:x}, size = 0x{:x}, flags = {}\n",
            section.name(),
            section.addr(),
            section.size(),
            flags
        ));
    }
    out
}

/// Calls whose target is the literal address, everywhere in the program.
fn calls_to(program: &Program, addr: ByteAddr) -> Vec<(FuncId, StmtId)> {
    let mut result = Vec::new();
    for func in program.func_ids() {
        let function = program.function(func);
        for stmt in function.stmt_ids() {
            if let Some(target) = function.stmt(stmt).as_call() {
                if function.term(target).as_int_const().map(|value| value.value()) == Some(addr) {
                    result.push((func, stmt));
                }
            }
        }
    }
    result
}

fn function_at(program: &Program, addr: ByteAddr) -> Option<FuncId> {
    program
        .func_ids()
        .find(|&func| program.function(func).addr() == Some(addr))
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.list_parsers {
        for loader in elf::loaders() {
            println!("{}", loader.name());
        }
        return Ok(());
    }

    let file = args.file.as_ref().context("no input files given")?;
    let data =
        std::fs::read(file).with_context(|| format!("could not read '{}'", file.display()))?;
    let loaded = elf::load(&data)?;
    let image = loaded.image;
    let arch = loaded.arch;
    let token = CancellationToken::new();

    if let Some(target) = &args.print_sections {
        write_output(target, &sections_text(&image))?;
    }

    let instructions = disassemble_image(&image, &arch, &token)?;
    if let Some(target) = &args.print_instructions {
        let mut text = String::new();
        for instruction in instructions.iter() {
            text.push_str(&format!("{instruction}\n"));
        }
        write_output(target, &text)?;
    }

    let mut program = match arch.lowering() {
        Some(lowering) => {
            let entries: Vec<_> = image
                .symbols()
                .iter()
                .map(|symbol| (symbol.addr, Some(symbol.name)))
                .collect();
            lowering.lower(&image, &instructions, &entries)?
        }
        None => {
            log::warn!(
                "no instruction lowering is linked in for '{}'; IR-level output will be empty",
                arch.name()
            );
            Program::new()
        }
    };

    for &addr in &args.inline_function {
        let Some(callee) = function_at(&program, addr) else {
            bail!("there is no function having address 0x{addr:x} to inline");
        };
        let dataflow =
            DataflowAnalyzer::new(&program, callee, &arch, Some(&image), token.clone()).analyze()?;
        let returns = inline::likely_returns(program.function(callee), &dataflow);
        for (caller, call) in calls_to(&program, addr) {
            inline::inline_call(&mut program, caller, call, callee, &returns)?;
        }
    }

    for &addr in &args.inline_call {
        let mut performed = false;
        for func in program.func_ids().collect::<Vec<_>>() {
            let function = program.function(func);
            let calls: Vec<StmtId> = function
                .stmt_ids()
                .filter(|&stmt| {
                    function.stmt(stmt).as_call().is_some()
                        && function.stmt(stmt).addr() == Some(addr)
                })
                .collect();
            for call in calls {
                let target = program.function(func).stmt(call).as_call().expect("a call");
                let target_addr = program
                    .function(func)
                    .term(target)
                    .as_int_const()
                    .map(|value| value.value());
                let Some(callee) = target_addr.and_then(|addr| function_at(&program, addr)) else {
                    bail!("can't detect the function being called at 0x{addr:x}");
                };
                let dataflow =
                    DataflowAnalyzer::new(&program, callee, &arch, Some(&image), token.clone())
                        .analyze()?;
                let returns = inline::likely_returns(program.function(callee), &dataflow);
                inline::inline_call(&mut program, func, call, callee, &returns)?;
                performed = true;
            }
        }
        if !performed {
            bail!("there is no call at 0x{addr:x} to inline");
        }
    }

    if let Some(target) = &args.print_cfg {
        write_output(target, &cfg_to_dot(&program))?;
    }
    if let Some(target) = &args.print_ir {
        write_output(target, &ir_to_dot(&program))?;
    }

    let needs_analyses = args.print_regions.is_some() || args.print_cxx.is_some();
    let default_to_cxx = args.print_sections.is_none()
        && args.print_instructions.is_none()
        && args.print_cfg.is_none()
        && args.print_ir.is_none()
        && !needs_analyses;

    if needs_analyses || default_to_cxx {
        let mut signatures = Signatures::new();
        let driver = Driver::new(&arch, Some(&image)).with_token(token.clone());
        let analyses: Map<FuncId, _> = driver.analyze_program(&mut program, &mut signatures)?;

        if let Some(target) = &args.print_regions {
            write_output(target, &regions_to_dot(&program, &analyses))?;
        }
        let cxx_target = args
            .print_cxx
            .clone()
            .unwrap_or_else(|| "-".to_owned());
        if args.print_cxx.is_some() || default_to_cxx {
            let code = CodeGenerator::new(&program, &arch).emit_program(&analyses);
            write_output(&cxx_target, &code)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(error) = run(args) {
        eprintln!("relift: {error:#}");
        std::process::exit(1);
    }
}
