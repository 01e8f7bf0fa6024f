//! Command line driver: `csx [options] [--] <pathspec>...`.
//!
//! Thin by design: argument parsing, file I/O, and wiring the library's [`Assembler`],
//! [`csx64::linker::link`], and [`csx64::cpu::Cpu`] together. The library itself never
//! prints anything; every diagnostic the user sees is produced here.

#[macro_use]
extern crate clap;

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use clap::Arg;
use rand::Rng;

use csx64::assembler::{Assembler, AssemblerConfig};
use csx64::cpu::Cpu;
use csx64::error::{AssembleError, ContainerError, LinkError};
use csx64::executable::Executable;
use csx64::expr::Expr;
use csx64::linker;
use csx64::objfile::ObjectFile;

/// Exit status used when the program runs to completion but the CPU recorded an error.
const EXEC_ERROR_RETURN_CODE: i32 = -1;

/// Extension of the assemble/link error codes for failures in this driver's own I/O
/// layer.
const IO_ERROR_CODE: i32 = 100;
const CONTAINER_ERROR_CODE: i32 = 101;
const USAGE_ERROR_CODE: i32 = 102;
const ROOTDIR_ERROR_CODE: i32 = 103;

enum CliError {
    Io(PathBuf, std::io::Error),
    Container(PathBuf, ContainerError),
    Assemble(PathBuf, AssembleError),
    Link(LinkError),
    Usage(String),
    NoRootdir,
}

impl CliError {
    fn code(&self) -> i32 {
        match self {
            CliError::Io(..) => IO_ERROR_CODE,
            CliError::Container(..) => CONTAINER_ERROR_CODE,
            CliError::Assemble(_, err) => err.code(),
            CliError::Link(err) => err.code(),
            CliError::Usage(_) => USAGE_ERROR_CODE,
            CliError::NoRootdir => ROOTDIR_ERROR_CODE,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Io(path, err) => write!(f, "\"{}\": {}", path.display(), err),
            CliError::Container(path, err) => write!(f, "\"{}\": {}", path.display(), err),
            CliError::Assemble(path, err) => write!(f, "assemble error in \"{}\": {}", path.display(), err),
            CliError::Link(err) => write!(f, "link error: {}", err),
            CliError::Usage(message) => write!(f, "usage error: {}", message),
            CliError::NoRootdir => write!(
                f,
                "couldn't find an install directory to locate _start.o; pass --rootdir explicitly"
            ),
        }
    }
}

fn main() {
    // `--end` is this driver's spelling of the option terminator; fold it into the `--`
    // clap already understands so the two behave identically.
    let args: Vec<String> = std::env::args()
        .map(|a| if a == "--end" { "--".to_string() } else { a })
        .collect();

    let matches = app_from_crate!()
        .arg(
            Arg::with_name("assemble")
                .short("a")
                .long("assemble")
                .help("Assembles files into object files"),
        )
        .arg(
            Arg::with_name("link")
                .short("l")
                .long("link")
                .conflicts_with("assemble")
                .help("Links object files into an executable"),
        )
        .arg(
            Arg::with_name("out")
                .short("o")
                .long("out")
                .takes_value(true)
                .value_name("PATH")
                .help("Explicit output path"),
        )
        .arg(
            Arg::with_name("entry")
                .long("entry")
                .takes_value(true)
                .value_name("SYMBOL")
                .default_value("main")
                .help("Main entry point for the linker"),
        )
        .arg(
            Arg::with_name("rootdir")
                .long("rootdir")
                .takes_value(true)
                .value_name("PATH")
                .help("Overrides the install directory used to find _start.o and stdlib"),
        )
        .arg(Arg::with_name("fs").long("fs").help("Sets FSF at startup"))
        .arg(
            Arg::with_name("time")
                .long("time")
                .help("Prints elapsed wall time after execution"),
        )
        .arg(
            Arg::with_name("PATHSPEC")
                .multiple(true)
                .index(1)
                .help("Input files"),
        )
        .get_matches_from(args);

    let pathspec: Vec<&str> = matches.values_of("PATHSPEC").map(|v| v.collect()).unwrap_or_default();

    let result = if matches.is_present("assemble") {
        cmd_assemble(&pathspec, matches.value_of("out"))
    } else if matches.is_present("link") {
        cmd_link(
            &pathspec,
            matches.value_of("out").unwrap_or("a.exe"),
            matches.value_of("entry").unwrap_or("main"),
            matches.value_of("rootdir"),
        )
    } else {
        cmd_run(&pathspec, matches.is_present("fs"), matches.is_present("time"))
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(err.code());
        }
    }
}

/// Predefined `EQU`-style symbols the original toolchain injects before every assemble:
/// syscall numbers, runtime error codes, and the file open/seek mode flags.
fn predefines() -> HashMap<String, Expr> {
    let mut table = HashMap::new();
    let mut def = |name: &str, value: u64| {
        table.insert(name.to_string(), Expr::int(value));
    };

    def("sys_exit", 0);
    def("sys_read", 1);
    def("sys_write", 2);
    def("sys_open", 3);
    def("sys_close", 4);
    def("sys_seek", 5);
    def("sys_brk", 6);
    def("sys_rename", 7);
    def("sys_unlink", 8);
    def("sys_mkdir", 9);
    def("sys_rmdir", 10);

    def("err_outofbounds", 0);
    def("err_unhandledsyscall", 1);
    def("err_undefinedbehavior", 2);
    def("err_arithmeticerror", 3);
    def("err_abort", 4);
    def("err_iofailure", 5);
    def("err_fsdisabled", 6);
    def("err_accessviolation", 7);
    def("err_insufficientfds", 8);
    def("err_fdnotinuse", 9);
    def("err_notimplemented", 10);
    def("err_stackoverflow", 11);
    def("err_fpustackoverflow", 12);
    def("err_fpustackunderflow", 13);
    def("err_fpuerror", 14);
    def("err_fpuaccessviolation", 15);
    def("err_alignmentviolation", 16);
    def("err_unknownop", 17);

    def("O_CREAT", 1);
    def("O_TRUNC", 2);

    def("SEEK_SET", 0);
    def("SEEK_CUR", 1);
    def("SEEK_END", 2);

    table
}

fn read_to_string(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|err| CliError::Io(path.to_owned(), err))
}

fn read_object_file(path: &Path) -> Result<ObjectFile, CliError> {
    let file = File::open(path).map_err(|err| CliError::Io(path.to_owned(), err))?;
    let mut reader = BufReader::new(file);
    ObjectFile::read_from(&mut reader).map_err(|err| CliError::Container(path.to_owned(), err))
}

fn write_object_file(path: &Path, obj: &ObjectFile) -> Result<(), CliError> {
    let file = File::create(path).map_err(|err| CliError::Io(path.to_owned(), err))?;
    let mut writer = BufWriter::new(file);
    obj.write_to(&mut writer)
        .map_err(|err| CliError::Container(path.to_owned(), err))
}

fn write_executable(path: &Path, exe: &Executable) -> Result<(), CliError> {
    let file = File::create(path).map_err(|err| CliError::Io(path.to_owned(), err))?;
    let mut writer = BufWriter::new(file);
    exe.write_to(&mut writer)
        .map_err(|err| CliError::Container(path.to_owned(), err))
}

fn assemble_one(path: &Path) -> Result<ObjectFile, CliError> {
    let source = read_to_string(path)?;
    let config = AssemblerConfig { predefines: predefines() };
    Assembler::new(config)
        .assemble(&source)
        .map_err(|err| CliError::Assemble(path.to_owned(), err))
}

/// `-a/--assemble`: assembles each pathspec entry into a `.o` file. With no `-o`, each
/// input is assembled next to itself with its extension swapped for `.o`; with `-o`,
/// exactly one input is expected.
fn cmd_assemble(pathspec: &[&str], out: Option<&str>) -> Result<i32, CliError> {
    if pathspec.is_empty() {
        return Err(CliError::Usage("assembler expected at least one file to assemble".to_string()));
    }

    match out {
        Some(out) => {
            if pathspec.len() != 1 {
                return Err(CliError::Usage(
                    "assembler with an explicit output expected only one input".to_string(),
                ));
            }
            let obj = assemble_one(Path::new(pathspec[0]))?;
            write_object_file(Path::new(out), &obj)?;
        }
        None => {
            for path in pathspec {
                let obj = assemble_one(Path::new(path))?;
                let out_path = Path::new(path).with_extension("o");
                write_object_file(&out_path, &obj)?;
            }
        }
    }
    Ok(0)
}

/// Loads every `.o` file in `dir`, sorted by name for determinism.
fn load_object_dir(dir: &Path, objs: &mut Vec<ObjectFile>) -> Result<(), CliError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|err| CliError::Io(dir.to_owned(), err))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "o").unwrap_or(false))
        .collect();
    entries.sort();
    for path in entries {
        objs.push(read_object_file(&path)?);
    }
    Ok(())
}

/// `-l/--link`: loads the bootstrap `_start.o` and stdlib bundle from `rootdir` (falling
/// back to the directory this binary was launched from), then the user's own pathspec,
/// and links them all into an executable.
fn cmd_link(pathspec: &[&str], out: &str, entry: &str, rootdir: Option<&str>) -> Result<i32, CliError> {
    if pathspec.is_empty() {
        return Err(CliError::Usage("linker expected at least one file to link".to_string()));
    }

    let root: PathBuf = match rootdir {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_owned()))
            .ok_or(CliError::NoRootdir)?,
    };

    let mut objs = Vec::new();
    objs.push(read_object_file(&root.join("_start.o"))?);
    load_object_dir(&root.join("stdlib"), &mut objs)?;
    for path in pathspec {
        objs.push(read_object_file(Path::new(path))?);
    }

    let exe = linker::link(objs, entry).map_err(CliError::Link)?;
    write_executable(Path::new(out), &exe)?;
    Ok(0)
}

/// Default mode: loads `pathspec[0]` as an already-linked executable and runs it, passing
/// the full pathspec through as `argv`.
fn cmd_run(pathspec: &[&str], fsf: bool, time: bool) -> Result<i32, CliError> {
    let path = *pathspec.first().ok_or_else(|| CliError::Usage("expected a file to execute".to_string()))?;
    let file = File::open(path).map_err(|err| CliError::Io(PathBuf::from(path), err))?;
    let mut reader = BufReader::new(file);
    let exe = Executable::read_from(&mut reader).map_err(|err| CliError::Container(PathBuf::from(path), err))?;

    let argv: Vec<String> = pathspec.iter().map(|s| s.to_string()).collect();
    // Fresh per process: the guest must not be able to rely on scrambled register bits
    // staying stable across runs.
    let seed: u64 = rand::thread_rng().gen();
    let mut cpu = Cpu::init(&exe, &argv, seed).map_err(|err| {
        CliError::Usage(format!("failed to initialize the virtual CPU: {}", err))
    })?;
    cpu.flags.fsf = fsf;
    // This driver only cares about raw throughput, so batch string-op repeats.
    cpu.flags.otrf = true;

    let start = std::time::Instant::now();
    while cpu.running {
        cpu.tick(u64::MAX);
    }
    let elapsed = start.elapsed();

    if let Some(err) = &cpu.error {
        eprintln!("\nerror encountered: {}", err);
        return Ok(EXEC_ERROR_RETURN_CODE);
    }

    if time {
        println!("\nelapsed time: {:.9}s", elapsed.as_secs_f64());
    }
    Ok(cpu.return_value as i32)
}
