//! convert front-end
//!
//! Converts an ext2 filesystem in place, or rolls a conversion back.

use anyhow::Context;
use btrfs_toolbox::convert::{convert, rollback, ConvertOptions};
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

fn usage(program: &str) -> ! {
    eprintln!("convert-toolbox v{}", VERSION);
    eprintln!();
    eprintln!("Usage: {} [options] <device>", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -r, --rollback    restore the original filesystem");
    eprintln!("  --no-datasum      skip data checksums (sets NODATASUM)");
    eprintln!("  --no-xattr        do not copy extended attributes");
    eprintln!("  -L <label>        override the copied label");
    std::process::exit(exit_code::USAGE);
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = ConvertOptions::default();
    let mut do_rollback = false;
    let mut device = None;

    let cancel = CancelToken::new();
    opts.cancel = cancel.clone();
    install_cancel_handler(cancel);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-r" | "--rollback" => do_rollback = true,
            "--no-datasum" => opts.datacsum = false,
            "--no-xattr" => opts.copy_xattrs = false,
            "-L" => {
                i += 1;
                opts.label = Some(args.get(i).unwrap_or_else(|| usage(&args[0])).clone());
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

    match run(&device, do_rollback, &opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} failed: {:#}", if do_rollback { "rollback" } else { "conversion" }, e);
            if do_rollback {
                eprintln!("hint: the saved image subvolume must be unmodified");
            } else {
                eprintln!("hint: before the final superblock step the original filesystem is intact");
            }
            std::process::exit(exit_code::for_report(&e));
        }
    }
}

fn run(device: &str, do_rollback: bool, opts: &ConvertOptions) -> anyhow::Result<i32> {
    if do_rollback {
        rollback(device).with_context(|| format!("rolling back {}", device))?;
        println!("rollback complete on {}", device);
        return Ok(exit_code::SUCCESS);
    }

    let summary = convert(device, opts).with_context(|| format!("converting {}", device))?;
    if summary.warnings > 0 {
        println!("conversion finished with {} warnings", summary.warnings);
        return Ok(exit_code::WARNINGS);
    }
    println!("conversion finished on {}", device);
    Ok(exit_code::SUCCESS)
}

/// Ctrl-C translates into the cancellation token; the pipeline stops at
/// the next transaction boundary.
fn install_cancel_handler(cancel: CancelToken) {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;
        static TOKEN: OnceLock<CancelToken> = OnceLock::new();
        let _ = TOKEN.set(cancel);

        extern "C" fn on_signal(_sig: libc::c_int) {
            if let Some(token) = TOKEN.get() {
                token.cancel();
            }
        }
        unsafe {
            libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        }
    }
    #[cfg(not(unix))]
    let _ = cancel;
}
