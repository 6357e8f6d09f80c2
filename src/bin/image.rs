//! image front-end
//!
//! Dumps filesystem metadata into a compact stream, or restores such a
//! stream onto a device.

use anyhow::Context;
use btrfs_toolbox::image::{
    dump_image, restore_image, DumpOptions, DumpVersion, RestoreImageOptions, SanitizeMode,
};
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
    eprintln!("image-toolbox v{}", VERSION);
    eprintln!();
    eprintln!("Usage: {} [options] <source> <target>", program);
    eprintln!();
    eprintln!("Dump a device into an image file, or with -r restore an");
    eprintln!("image file onto a device.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -r              restore instead of dump");
    eprintln!("  -c <level>      zlib compression level 1-9 (default: off)");
    eprintln!("  -s              sanitise names (random)");
    eprintln!("  -ss             sanitise names, keep directory hashes");
    eprintln!("  -d              include data extents (v1 format)");
    eprintln!("  --v0            write the legacy v0 format");
    std::process::exit(exit_code::USAGE);
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = DumpOptions::default();
    let mut do_restore = false;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-r" => do_restore = true,
            "-c" => {
                i += 1;
                opts.compress_level = args
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .filter(|l| (1..=9).contains(l))
                    .unwrap_or_else(|| usage(&args[0]));
            }
            "-s" => opts.sanitize = SanitizeMode::Random,
            "-ss" => opts.sanitize = SanitizeMode::Collision,
            "-d" => opts.dump_data = true,
            "--v0" => opts.version = DumpVersion::V0,
            arg if arg.starts_with('-') => usage(&args[0]),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    if positional.len() != 2 {
        usage(&args[0]);
    }

    if let Err(e) = run(&positional[0], &positional[1], do_restore, &opts) {
        eprintln!("{} failed: {:#}", if do_restore { "restore" } else { "dump" }, e);
        std::process::exit(exit_code::for_report(&e));
    }
}

fn run(source: &str, target: &str, do_restore: bool, opts: &DumpOptions) -> anyhow::Result<()> {
    if do_restore {
        let file = std::fs::File::open(source)
            .with_context(|| format!("opening image {}", source))?;
        let restore_opts = RestoreImageOptions {
            cancel: opts.cancel.clone(),
        };
        restore_image(std::io::BufReader::new(file), target, &restore_opts)
            .with_context(|| format!("restoring onto {}", target))?;
        println!("image restored onto {}", target);
        return Ok(());
    }

    let out = std::fs::File::create(target)
        .with_context(|| format!("creating {}", target))?;
    let stats = dump_image(source, std::io::BufWriter::new(out), opts)
        .with_context(|| format!("dumping {}", source))?;
    println!(
        "dumped {} tree blocks in {} clusters ({} bytes)",
        stats.blocks, stats.clusters, stats.bytes_out
    );
    Ok(())
}
