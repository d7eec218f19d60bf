use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::PathBuf;
use std::process;

use vhd::handler::LocalHandler;
use vhd::{clean_vm_with_logger, CleanOptions};

fn usage() -> ! {
    eprintln!(
        "Usage: vhd-clean <vm-dir> [--remove] [--merge] [--fix-metadata] [--merge-limit N]\n\
         \n\
         Without flags the run only reports what it would do."
    );
    process::exit(2);
}

fn main() {
    let mut options = CleanOptions::default();
    let mut vm_dir: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--remove" => options.remove = true,
            "--merge" => options.merge = true,
            "--fix-metadata" => options.fix_metadata = true,
            "--merge-limit" => {
                options.merge_limit = args
                    .next()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or_else(|| usage())
            }
            "--help" | "-h" => usage(),
            other if !other.starts_with('-') && vm_dir.is_none() => {
                vm_dir = Some(PathBuf::from(other))
            }
            other => {
                eprintln!("unknown argument: {}", other);
                usage()
            }
        }
    }
    let vm_dir = match vm_dir {
        Some(vm_dir) => vm_dir,
        None => usage(),
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Info);
    builder.destination(Destination::Stderr);
    let logger = match builder.build() {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("unable to set up logging: {}", e);
            process::exit(1);
        }
    };

    match clean_vm_with_logger(&LocalHandler, &vm_dir, &options, logger) {
        Ok(report) => {
            println!(
                "{} VHDs, {} broken, {} orphans, {} interrupted, {} chains planned, \
                 {} merged ({} bytes), {} metadata fixed",
                report.vhds,
                report.broken_vhds.len(),
                report.orphan_vhds.len(),
                report.interrupted_merges.len(),
                report.planned_chains,
                report.merged_chains,
                report.merged_bytes,
                report.fixed_metadata.len(),
            );
            if report.failed_merges > 0 {
                eprintln!("{} merges failed", report.failed_merges);
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}
