//! swftrace - Flash Player tag tracer
//!
//! Entry point that handles CLI argument parsing, build identification and
//! the tracing session.
//!
//! Status lines (`[+]`, `[-]`, `[*]`, `[!]`) go to stderr. While tracing,
//! stdout carries only the tag trace, so it can be piped on its own.

use std::path::{Path, PathBuf};

use clap::Parser;
use colored::Colorize;

use swftrace::signature::{ProbeName, ResolvedBreakpoints, TargetImage, CATALOG};
use swftrace::tracer::ProbeSelection;

/// swftrace: trace the SWF tags a Flash Player build parses
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Flash Player executable to trace
    #[arg(required_unless_present = "list_builds")]
    target: Option<PathBuf>,

    /// Dump information about parsed tags
    #[arg(long, default_value_t = false)]
    tags: bool,

    /// Dump information about ActionScript 2 code
    #[arg(long, default_value_t = false)]
    as2: bool,

    /// Identify the build and print its breakpoint offsets without running it
    #[arg(long, default_value_t = false)]
    identify: bool,

    /// List the builds this tool recognizes
    #[arg(long, default_value_t = false)]
    list_builds: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    if args.list_builds {
        list_builds();
        return Ok(());
    }

    let Some(target) = args.target.as_deref() else {
        anyhow::bail!("no target executable given");
    };

    // 3. Fingerprint the build
    let image = TargetImage::load(target)?;
    log::info!("Target: {} ({})", target.display(), image.format());

    let Some(resolved) = image.resolve() else {
        eprintln!(
            "{} Could not determine version of the Flash Player executable",
            "[-]".red()
        );
        return Ok(());
    };
    drop(image);

    eprintln!("{} Identified {}", "[+]".green(), resolved.build.bold());

    if args.identify {
        print_offsets(&resolved);
        return Ok(());
    }

    // 4. Trace
    let selection = ProbeSelection::from_flags(args.tags, args.as2);
    if selection.is_empty() {
        eprintln!(
            "{} No probes enabled (use --tags and/or --as2); running untraced",
            "[!]".yellow()
        );
    }

    trace(target, resolved, selection)
}

#[cfg(any(
    all(target_os = "windows", any(target_arch = "x86", target_arch = "x86_64")),
    all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))
))]
fn trace(target: &Path, resolved: ResolvedBreakpoints, selection: ProbeSelection) -> anyhow::Result<()> {
    use std::io;

    use swftrace::debug::PlatformEngine;
    use swftrace::tracer::Tracer;

    let mut tracer = Tracer::new(PlatformEngine::new(), target, resolved, selection);
    let summary = tracer.run(&mut io::stdout().lock())?;

    eprintln!(
        "{} Process exited with code {} ({} tags, {} anomalies)",
        "[*]".cyan(),
        summary.exit_code,
        summary.tags_emitted,
        summary.anomalies
    );
    Ok(())
}

#[cfg(not(any(
    all(target_os = "windows", any(target_arch = "x86", target_arch = "x86_64")),
    all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))
)))]
fn trace(_target: &Path, _resolved: ResolvedBreakpoints, _selection: ProbeSelection) -> anyhow::Result<()> {
    anyhow::bail!("no debugging backend for this platform")
}

fn list_builds() {
    println!("{}", "Known builds".bold().cyan());
    for build in CATALOG {
        println!("  {}", build.name.green());
        for (probe, point) in build.probes {
            println!(
                "    {:<16} file {:#08x} [{}] -> base + {:#08x}",
                probe,
                point.file_offset,
                hex::encode_upper(point.pattern),
                point.memory_offset
            );
        }
    }
}

fn print_offsets(resolved: &ResolvedBreakpoints) {
    println!("{}", resolved.build);
    for probe in ProbeName::ALL {
        if let Some(offset) = resolved.offset(probe) {
            println!("  {:<16} base + {:#08x}", probe, offset);
        }
    }
}
