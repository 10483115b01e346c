use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{miette, IntoDiagnostic, Result};

use tiny16::{AsmParser, Memory, RunState};

/// Tiny16 is a self-contained assembler and emulator toolchain for a
/// 16-bit teaching ISA.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a source file into a raw byte image
    Asm {
        /// `.asm` file to assemble
        src: PathBuf,
        /// Destination for the image
        #[arg(short, default_value = "a.bin")]
        out: PathBuf,
    },
    /// Load a raw image and run it until the CPU halts
    Emu {
        /// Image file to load
        image: PathBuf,
        /// Address the image is loaded at
        #[arg(long, value_parser = parse_addr, default_value = "0x0000")]
        base: u16,
        /// Initial program counter
        #[arg(long, value_parser = parse_addr, default_value = "0x0000")]
        pc: u16,
        /// Print memory from START to END inclusive after the run
        #[arg(long, num_args = 2, value_parser = parse_addr, value_names = ["START", "END"])]
        dump: Option<Vec<u16>>,
    },
    /// Assemble a source file and run it in one step
    Run {
        /// `.asm` file to run
        src: PathBuf,
        /// Print memory from START to END inclusive after the run
        #[arg(long, num_args = 2, value_parser = parse_addr, value_names = ["START", "END"])]
        dump: Option<Vec<u16>>,
    },
}

/// Accepts decimal and `0x`-prefixed hex addresses on the command line.
fn parse_addr(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    match parsed {
        Ok(val) if val <= 0xFFFF => Ok(val as u16),
        _ => Err(format!("`{s}` is not a 16-bit address")),
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
                _ => process::exit(1),
            }
        }
    };

    if let Err(report) = dispatch(args.command) {
        eprintln!("{report:?}");
        process::exit(2);
    }
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Asm { src, out } => {
            let image = assemble_file(&src)?;
            fs::write(&out, &image).into_diagnostic()?;
            status(
                "Finished",
                &format!("{} ({} bytes)", out.display(), image.len()),
            );
            Ok(())
        }
        Command::Emu {
            image,
            base,
            pc,
            dump,
        } => {
            let bytes = fs::read(&image).into_diagnostic()?;
            let mut mem = Memory::new();
            mem.load(&bytes, base);
            let mut cpu = RunState::new(mem);
            cpu.set_pc(pc);
            status("Running", &image.display().to_string());
            cpu.run();
            finish(&mut cpu, dump)
        }
        Command::Run { src, dump } => {
            let image = assemble_file(&src)?;
            let mut mem = Memory::new();
            mem.load(&image, 0x0000);
            let mut cpu = RunState::new(mem);
            status("Running", "binary");
            cpu.run();
            finish(&mut cpu, dump)
        }
    }
}

fn assemble_file(src: &Path) -> Result<Vec<u8>> {
    // Diagnostics keep spans into the source for the rest of the process,
    // so the contents are leaked once per run.
    let text: &'static str =
        Box::leak(fs::read_to_string(src).into_diagnostic()?.into_boxed_str());
    status("Assembling", &src.display().to_string());
    AsmParser::new(text)?.parse()?.assemble()
}

/// Dump the final state and surface a runtime fault as a diagnostic.
fn finish(cpu: &mut RunState, dump: Option<Vec<u16>>) -> Result<()> {
    if let Some(range) = dump {
        dump_mem(cpu, range[0], range[1]);
    }
    if let Some(fault) = cpu.fault() {
        return Err(miette!(
            code = "run::bad_opcode",
            help = "the image may be corrupt, or PC ran past the end of the program",
            "Unknown opcode 0x{:02x} at PC=0x{:04x}",
            fault.op,
            fault.pc,
        ));
    }
    status("Halted", &format!("PC=0x{:04x}", cpu.pc()));
    Ok(())
}

/// 16 bytes per row: a four-digit hex row address, then the bytes.
fn dump_mem(cpu: &mut RunState, start: u16, end: u16) {
    let mut addr = start as u32;
    while addr <= end as u32 {
        print!("{:04x}: ", addr);
        for i in 0..16 {
            if addr + i <= end as u32 {
                print!("{:02x} ", cpu.mem_mut().read8((addr + i) as u16));
            }
        }
        println!();
        addr += 16;
    }
}

/// Right-aligned status line, kept on stderr so program output owns stdout.
fn status(verb: &str, rest: &str) {
    eprintln!("{:>12} {}", verb.green().bold(), rest);
}
