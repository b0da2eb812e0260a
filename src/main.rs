#![allow(non_snake_case)]

#[cfg(windows)]
use std::fs::File;
#[cfg(windows)]
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use HandleProbe::config::parse_mask;
use HandleProbe::{HandleDescriptor, TableFormat};
#[cfg(windows)]
use HandleProbe::ProbeConfig;

#[derive(Parser, Debug)]
#[command(name = "handleprobe", version, about = "Handle inheritance diagnostics")]
struct Args {
    /// Log probe and launch details.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Subcommand, Debug)]
enum Command {
    /// List the handles owned by this process.
    Handles {
        #[arg(long)]
        json: Option<PathBuf>,
        /// Only AFD endpoints (sockets).
        #[arg(long)]
        sockets: bool,
        #[arg(long)]
        legacy_table: bool,
        #[arg(long = "deny-mask", value_parser = parse_mask_arg)]
        deny_masks: Vec<u32>,
        #[arg(long)]
        skip_denylisted: bool,
    },
    /// Start a child process with an explicit inheritance decision.
    Launch {
        executable: String,
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Let the child inherit every inheritable handle.
        #[arg(long)]
        inherit: bool,
    },
}

#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Serialize)]
struct HandleReport<'a> {
    pid: u32,
    format: TableFormat,
    total: usize,
    sockets: usize,
    handles: &'a [HandleDescriptor],
}

fn parse_mask_arg(s: &str) -> Result<u32, String> {
    parse_mask(s).ok_or_else(|| format!("`{s}` is not a 32-bit access mask"))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

#[cfg(not(windows))]
fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    eprintln!("This CLI runs on Windows only.");
    ExitCode::FAILURE
}

#[cfg(windows)]
fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Handles {
            json,
            sockets,
            legacy_table,
            deny_masks,
            skip_denylisted,
        } => {
            let mut config = ProbeConfig::from_env();
            if legacy_table {
                config.format = TableFormat::Legacy;
            }
            if skip_denylisted {
                config.report_denylisted = false;
            }
            config.denylist = config.denylist.extended(deny_masks);
            run_handles(&config, json, sockets)
        }
        Command::Launch {
            executable,
            args,
            cwd,
            inherit,
        } => match HandleProbe::launch(&executable, &args, cwd.as_deref(), inherit) {
            Ok(ids) => {
                println!("Started pid {} (inherit handles: {})", ids.process_id, inherit);
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("Launch failed: {}", err);
                ExitCode::FAILURE
            }
        },
    }
}

#[cfg(windows)]
fn run_handles(config: &ProbeConfig, json: Option<PathBuf>, sockets_only: bool) -> ExitCode {
    let mut handles = match HandleProbe::list_own_handles(config) {
        Ok(handles) => handles,
        Err(err) => {
            eprintln!("Handle enumeration failed: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if sockets_only {
        handles.retain(HandleDescriptor::is_socket);
    }

    let report = HandleReport {
        pid: std::process::id(),
        format: config.format,
        total: handles.len(),
        sockets: handles.iter().filter(|h| h.is_socket()).count(),
        handles: &handles,
    };

    if let Some(path) = json {
        if let Err(err) = write_json_file(&path, &report) {
            eprintln!("Failed to write JSON: {}", err);
            return ExitCode::FAILURE;
        }
        println!("JSON report written: {}", path.display());
        return ExitCode::SUCCESS;
    }

    println!("Pid {}: {} handle(s), {} socket(s)", report.pid, report.total, report.sockets);
    for h in report.handles {
        println!("{:#06x} {} - {}", h.handle, h.type_name, h.name);
    }
    println!("End of list");
    ExitCode::SUCCESS
}

#[cfg(windows)]
fn write_json_file(path: &PathBuf, report: &HandleReport<'_>) -> io::Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, report).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
