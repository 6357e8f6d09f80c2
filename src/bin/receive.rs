//! receive front-end
//!
//! Reads a send stream from stdin or a file and materialises it into a
//! mounted destination subvolume directory.

use btrfs_toolbox::core::CancelToken;
use btrfs_toolbox::{exit_code, VERSION};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

#[cfg(target_os = "linux")]
fn usage(program: &str) -> ! {
    eprintln!("receive-toolbox v{}", VERSION);
    eprintln!();
    eprintln!("Usage: {} [options] <dest-dir>", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -f <file>         read the stream from a file instead of stdin");
    eprintln!("  -E <max-errors>   tolerated command failures (default 1)");
    eprintln!("  -C, --chroot      chroot into the destination first");
    std::process::exit(exit_code::USAGE);
}

#[cfg(target_os = "linux")]
fn main() {
    use btrfs_toolbox::send::receive::ReceiveOptions;

    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = ReceiveOptions::default();
    let mut input_file = None;
    let mut dest = None;

    let cancel = CancelToken::new();
    opts.cancel = cancel.clone();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-f" => {
                i += 1;
                input_file = Some(args.get(i).unwrap_or_else(|| usage(&args[0])).clone());
            }
            "-E" => {
                i += 1;
                opts.max_errors = args
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage(&args[0]));
            }
            "-C" | "--chroot" => opts.chroot = true,
            arg if arg.starts_with('-') => usage(&args[0]),
            arg => {
                if dest.replace(arg.to_string()).is_some() {
                    usage(&args[0]);
                }
            }
        }
        i += 1;
    }

    let dest = dest.unwrap_or_else(|| usage(&args[0]));

    match run(&dest, input_file.as_deref(), opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("receive failed: {:#}", e);
            eprintln!("hint: the destination must be a mounted subvolume directory");
            std::process::exit(exit_code::for_report(&e));
        }
    }
}

#[cfg(target_os = "linux")]
fn run(
    dest: &str,
    input_file: Option<&str>,
    opts: btrfs_toolbox::send::receive::ReceiveOptions,
) -> anyhow::Result<i32> {
    use anyhow::Context;
    use btrfs_toolbox::send::receive::receive;

    let stats = match input_file {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening stream {}", path))?;
            receive(file, dest, opts).with_context(|| format!("receiving into {}", dest))?
        }
        None => receive(std::io::stdin().lock(), dest, opts)
            .with_context(|| format!("receiving into {}", dest))?,
    };

    if stats.errors > 0 {
        println!(
            "received {} subvolumes, {} commands, {} errors",
            stats.subvols.len(),
            stats.commands,
            stats.errors
        );
        return Ok(exit_code::WARNINGS);
    }
    println!(
        "received {} subvolumes, {} commands",
        stats.subvols.len(),
        stats.commands
    );
    Ok(exit_code::SUCCESS)
}

#[cfg(not(target_os = "linux"))]
fn main() {
    init_logging();
    let _ = CancelToken::new();
    eprintln!("receive-toolbox requires Linux (privileged subvolume ioctls)");
    std::process::exit(exit_code::FAILURE);
}
