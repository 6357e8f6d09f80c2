//! check front-end
//!
//! Read-only verification, plus the chunk-recover rescue entry point.

use anyhow::Context;
use btrfs_toolbox::check::{check_filesystem, CheckOptions};
use btrfs_toolbox::rescue::{chunk_recover, RescueOptions};
use btrfs_toolbox::{exit_code, VERSION};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

fn usage(program: &str) -> ! {
    eprintln!("check-toolbox v{}", VERSION);
    eprintln!();
    eprintln!("Usage: {} <device>", program);
    eprintln!("       {} rescue chunk-recover <device>", program);
    std::process::exit(exit_code::USAGE);
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();

    let result = if args.len() == 4 && args[1] == "rescue" && args[2] == "chunk-recover" {
        run_rescue(&args[3])
    } else if args.len() == 2 && !args[1].starts_with('-') {
        run_check(&args[1])
    } else {
        usage(&args[0])
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("check failed: {:#}", e);
            std::process::exit(exit_code::for_report(&e));
        }
    }
}

fn run_check(device: &str) -> anyhow::Result<i32> {
    let report = check_filesystem(device, &CheckOptions::default())
        .with_context(|| format!("checking {}", device))?;

    println!("checked {} tree blocks", report.blocks_checked);
    if !report.is_clean() {
        for err in &report.errors {
            eprintln!("error: {}", err);
        }
        eprintln!("{} problems found", report.errors.len());
        return Ok(exit_code::FAILURE);
    }
    println!("no problems found");
    Ok(exit_code::SUCCESS)
}

fn run_rescue(device: &str) -> anyhow::Result<i32> {
    let report = chunk_recover(device, &RescueOptions::default())
        .with_context(|| format!("recovering chunk tree on {}", device))?;

    println!(
        "recovered {} chunks from {} scanned blocks{}",
        report.chunks_recovered,
        report.scanned_blocks,
        if report.rebuilt_chunk_root {
            ", chunk tree rebuilt"
        } else {
            ""
        }
    );
    Ok(exit_code::SUCCESS)
}
