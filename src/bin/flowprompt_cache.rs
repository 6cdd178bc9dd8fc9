//! flowprompt-cache: maintenance tool for on-disk prompt caches
//!
//! Usage:
//!   flowprompt-cache stats [--dir <path>]                 Count live, expired and corrupt records
//!   flowprompt-cache purge [--dir <path>]                 Delete expired and corrupt records
//!   flowprompt-cache clear [--dir <path>]                 Delete every record
//!   flowprompt-cache show <fingerprint> [--dir <path>]    Print one record

use flowprompt::cache::{unix_now, CacheBackend, FileCache, Fingerprint, DEFAULT_DIRECTORY, ENV_DIR};
use std::path::PathBuf;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "stats" => cmd_stats(&args[2..]),
        "purge" => cmd_purge(&args[2..]),
        "clear" => cmd_clear(&args[2..]),
        "show" => cmd_show(&args[2..]),
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"flowprompt-cache: prompt cache maintenance

USAGE:
    flowprompt-cache <COMMAND> [OPTIONS]

COMMANDS:
    stats [--dir <path>]                Count live, expired and corrupt records
    purge [--dir <path>]                Delete expired and corrupt records
    clear [--dir <path>]                Delete every record
    show <fingerprint> [--dir <path>]   Print one record as JSON
    version                             Show version information
    help                                Show this help message

ENVIRONMENT:
    {ENV_DIR}             Cache directory (default: {DEFAULT_DIRECTORY})
    RUST_LOG                            Log filter, e.g. flowprompt=debug"#
    );
}

fn cmd_version() {
    println!("flowprompt-cache {}", env!("CARGO_PKG_VERSION"));
}

fn resolve_cache_dir(args: &[String]) -> PathBuf {
    for (i, arg) in args.iter().enumerate() {
        if arg == "--dir" {
            if let Some(path) = args.get(i + 1) {
                return PathBuf::from(path);
            }
        }
    }
    if let Ok(dir) = std::env::var(ENV_DIR) {
        return PathBuf::from(dir);
    }
    PathBuf::from(DEFAULT_DIRECTORY)
}

/// First argument that is neither a flag nor a flag's value.
fn positional(args: &[String]) -> Option<&str> {
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if arg == "--dir" {
            skip = true;
            continue;
        }
        return Some(arg.as_str());
    }
    None
}

fn open(args: &[String]) -> flowprompt::Result<FileCache> {
    FileCache::new(resolve_cache_dir(args))
}

fn cmd_stats(args: &[String]) -> flowprompt::Result<()> {
    let cache = open(args)?;
    let report = cache.scan()?;
    println!("directory: {}", cache.directory().display());
    println!("  live:    {}", report.live);
    println!("  expired: {}", report.expired);
    println!("  corrupt: {}", report.corrupt);
    println!("  size:    {} bytes", report.total_bytes);
    Ok(())
}

fn cmd_purge(args: &[String]) -> flowprompt::Result<()> {
    let cache = open(args)?;
    let removed = cache.purge_expired()?;
    println!("removed {} record(s) from {}", removed, cache.directory().display());
    Ok(())
}

fn cmd_clear(args: &[String]) -> flowprompt::Result<()> {
    let cache = open(args)?;
    cache.clear()?;
    println!("cleared {}", cache.directory().display());
    Ok(())
}

fn cmd_show(args: &[String]) -> flowprompt::Result<()> {
    let Some(fingerprint) = positional(args) else {
        eprintln!("Usage: flowprompt-cache show <fingerprint> [--dir <path>]");
        std::process::exit(1);
    };
    let cache = open(args)?;
    let key = Fingerprint::from(fingerprint);
    match cache.peek(&key)? {
        Some(entry) => {
            let now = unix_now();
            let record = serde_json::json!({
                "fingerprint": key.as_str(),
                "path": cache.path_for(&key).display().to_string(),
                "expired": entry.is_expired(now),
                "age_secs": entry.age(now).as_secs(),
                "remaining_ttl_secs": entry.remaining_ttl(now).map(|d| d.as_secs()),
                "entry": entry,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&record).unwrap_or_else(|_| record.to_string())
            );
        }
        None => println!("no record for {}", key),
    }
    Ok(())
}
