//! tinyvfs CLI - take and inspect advisory locks on a file
//!
//! Usage: tinyvfs [OPTIONS] PATH [LEVEL]
//!
//! Opens PATH (creating it if needed), climbs to LEVEL one step at a time and
//! prints the outcome together with the process-wide counters for the file.

use std::env;
use std::io::{self, BufRead, IsTerminal};

use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use tinyvfs::{os_init, LockType, OpenFlags, UnixVfs, VfsConfig, VfsFile};

fn log_level(verbosity: u8, from_env: Option<&str>) -> LevelFilter {
    match from_env {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        },
    }
}

fn init_logger(verbosity: u8) {
    let level = log_level(verbosity, env::var("TINYVFS_LOG").ok().as_deref());
    let _ = TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto);
}

fn parse_level(name: &str) -> Option<LockType> {
    match name.to_lowercase().as_str() {
        "none" => Some(LockType::None),
        "shared" => Some(LockType::Shared),
        "reserved" => Some(LockType::Reserved),
        "exclusive" => Some(LockType::Exclusive),
        _ => None,
    }
}

fn print_usage() {
    println!("Usage: tinyvfs [OPTIONS] PATH [LEVEL]");
    println!();
    println!("Options:");
    println!("  -help              Show this help");
    println!("  -version           Show version");
    println!("  -v                 More logging (repeat for trace)");
    println!("  -hold              Keep the lock until stdin is closed");
    println!();
    println!("LEVEL is one of none, shared, reserved, exclusive (default shared).");
}

fn print_counters(file: &tinyvfs::UnixFile) {
    let snap = file.inode().snapshot();
    println!("handle level:  {:?}", file.lock_type());
    println!("inode level:   {:?}", snap.level);
    println!("shared count:  {}", snap.shared_count);
    println!("lock count:    {}", snap.lock_count);
    println!("references:    {}", snap.ref_count);
    println!("pending fds:   {}", snap.pending_fds);
}

fn climb(file: &tinyvfs::UnixFile, target: LockType) -> tinyvfs::Result<()> {
    for step in [LockType::Shared, LockType::Reserved, LockType::Exclusive] {
        if step > target {
            break;
        }
        file.lock(step)?;
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut path: Option<String> = None;
    let mut target = LockType::Shared;
    let mut verbosity = 0u8;
    let mut hold = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-help" | "--help" | "-?" => {
                print_usage();
                return;
            }
            "-version" | "--version" => {
                println!("tinyvfs {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "-v" => verbosity = verbosity.saturating_add(1),
            "-vv" => verbosity = verbosity.saturating_add(2),
            "-hold" | "--hold" => hold = true,
            arg if !arg.starts_with('-') => {
                if path.is_none() {
                    path = Some(arg.to_string());
                } else {
                    match parse_level(arg) {
                        Some(level) => target = level,
                        None => {
                            eprintln!("Error: unknown lock level: {}", arg);
                            std::process::exit(2);
                        }
                    }
                }
            }
            arg => {
                eprintln!("Error: unknown option: {}", arg);
                std::process::exit(2);
            }
        }
        i += 1;
    }

    init_logger(verbosity);

    let Some(path) = path else {
        print_usage();
        std::process::exit(2);
    };

    if let Err(e) = os_init() {
        eprintln!("Error: failed to initialize: {}", e);
        std::process::exit(1);
    }

    let vfs = UnixVfs::with_config(VfsConfig::from_env());
    let file = match vfs.open_file(Some(&path), OpenFlags::CREATE | OpenFlags::READWRITE) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: unable to open \"{}\": {}", path, e);
            std::process::exit(1);
        }
    };

    let status = climb(&file, target);
    match &status {
        Ok(()) => println!("locked {} at {:?}", path, file.lock_type()),
        Err(e) => println!("lock on {} stopped at {:?}: {}", path, file.lock_type(), e),
    }
    print_counters(&file);

    if hold && status.is_ok() {
        if io::stdin().is_terminal() {
            println!("holding lock; press Ctrl-D to release");
        }
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() {
                break;
            }
        }
    }

    let failed = status.is_err();
    if let Err(e) = Box::new(file).close() {
        eprintln!("Error: close failed: {}", e);
        std::process::exit(1);
    }
    if failed {
        std::process::exit(1);
    }
}
