//! mkfs front-end
//!
//! Formats a device or image file with a fresh filesystem.

use anyhow::Context;
use btrfs_toolbox::core::checksum::ChecksumType;
use btrfs_toolbox::mkfs::{mkfs, MkfsConfig};
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
    eprintln!("mkfs-toolbox v{}", VERSION);
    eprintln!();
    eprintln!("Usage: {} [options] <device>", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -L <label>      filesystem label");
    eprintln!("  -n <size>       node size in bytes (default 16384)");
    eprintln!("  -s <size>       sector size in bytes (default: page size)");
    eprintln!("  --csum <algo>   crc32c | xxhash | sha256 | blake2");
    std::process::exit(exit_code::USAGE);
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let mut cfg = MkfsConfig::default();
    let mut device = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-L" => {
                i += 1;
                cfg.label = args.get(i).unwrap_or_else(|| usage(&args[0])).clone();
            }
            "-n" => {
                i += 1;
                cfg.nodesize = args
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage(&args[0]));
            }
            "-s" => {
                i += 1;
                cfg.sectorsize = args
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage(&args[0]));
            }
            "--csum" => {
                i += 1;
                cfg.csum_type = match args.get(i).map(|s| s.as_str()) {
                    Some("crc32c") => ChecksumType::Crc32c,
                    Some("xxhash") => ChecksumType::XxHash64,
                    Some("sha256") => ChecksumType::Sha256,
                    Some("blake2") => ChecksumType::Blake2b,
                    _ => usage(&args[0]),
                };
            }
            arg if arg.starts_with('-') => usage(&args[0]),
            arg => {
                if device.replace(arg.to_string()).is_some() {
                    usage(&args[0]);
                }
            }
        }
        i += 1;
    }

    let device = device.unwrap_or_else(|| usage(&args[0]));

    if let Err(e) = run(&device, &cfg) {
        eprintln!("mkfs failed: {:#}", e);
        eprintln!("hint: the device must be unmounted and large enough");
        std::process::exit(exit_code::for_report(&e));
    }
}

fn run(device: &str, cfg: &MkfsConfig) -> anyhow::Result<()> {
    let fsid = mkfs(device, cfg).with_context(|| format!("formatting {}", device))?;
    println!("filesystem created on {}", device);
    println!("fsid: {}", uuid::Uuid::from_bytes(fsid));
    Ok(())
}
