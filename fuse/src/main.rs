//! Mount entry point: parse the command line, run the database preflight,
//! then hand control to the FUSE event loop until unmount.

mod freespace;
mod fs;

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use fuse_mt::FuseMT;
use log::info;

use pgblockfs_core::pg;
use pgblockfs_core::types::{FsConfig, DEFAULT_BLOCK_SIZE, MAX_DB_CONNECTIONS};

use crate::fs::PgBlockFs;

/// Mount a PostgreSQL database as a POSIX filesystem.
///
/// The database must have been prepared with `schema.sql`. All file data
/// and metadata live in the database; unmounting loses nothing.
#[derive(Parser, Debug)]
#[command(name = "pgblockfs", version)]
struct Cli {
    /// PostgreSQL connection string, e.g. "host=localhost dbname=fs user=fs"
    conninfo: String,

    /// Directory to mount the filesystem on
    mountpoint: PathBuf,

    /// Mount options: `ro`, `blocksize=<bytes>`; anything unrecognized is
    /// forwarded to FUSE
    #[arg(short = 'o', value_name = "OPT[,OPT...]", value_delimiter = ',')]
    options: Vec<String>,

    /// Use a single dispatch thread and a single database connection
    #[arg(short = 's', long)]
    single_threaded: bool,

    /// Log every filesystem operation
    #[arg(short, long)]
    verbose: bool,
}

struct MountOptions {
    block_size: u64,
    read_only: bool,
    fuse_passthrough: Vec<String>,
}

fn parse_mount_options(options: &[String]) -> anyhow::Result<MountOptions> {
    let mut parsed = MountOptions {
        block_size: DEFAULT_BLOCK_SIZE,
        read_only: false,
        fuse_passthrough: Vec::new(),
    };
    for option in options {
        if option == "ro" {
            parsed.read_only = true;
        } else if let Some(value) = option.strip_prefix("blocksize=") {
            parsed.block_size = value
                .parse()
                .with_context(|| format!("invalid blocksize '{}'", value))?;
            if parsed.block_size == 0 {
                bail!("blocksize must not be zero");
            }
        } else {
            parsed.fuse_passthrough.push(option.clone());
        }
    }
    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = parse_mount_options(&cli.options)?;

    let default_level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // Check the server before going anywhere near the kernel: timestamps
    // must be 64-bit integers and the block size must match the schema
    // installer's.
    let block_size = pg::preflight(&cli.conninfo, options.block_size)
        .context("database preflight failed")?;
    info!(
        "preflight ok: block size {} bytes{}",
        block_size,
        if options.read_only { ", read-only" } else { "" }
    );

    let cfg = FsConfig::new(block_size, options.read_only);
    let connections = if cli.single_threaded {
        1
    } else {
        MAX_DB_CONNECTIONS
    };
    let filesystem = PgBlockFs::new(&cli.conninfo, &cli.mountpoint, cfg, connections);

    let mut fuse_args: Vec<OsString> =
        vec![OsString::from("-o"), OsString::from("fsname=pgblockfs")];
    if options.read_only {
        fuse_args.push(OsString::from("-o"));
        fuse_args.push(OsString::from("ro"));
    }
    for option in &options.fuse_passthrough {
        fuse_args.push(OsString::from("-o"));
        fuse_args.push(OsString::from(option));
    }
    let fuse_arg_refs: Vec<&OsStr> = fuse_args.iter().map(|a| a.as_os_str()).collect();

    fuse_mt::mount(
        FuseMT::new(filesystem, connections),
        &cli.mountpoint,
        &fuse_arg_refs,
    )
    .with_context(|| format!("mounting on '{}'", cli.mountpoint.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_without_options() {
        let parsed = parse_mount_options(&[]).unwrap();
        assert_eq!(parsed.block_size, DEFAULT_BLOCK_SIZE);
        assert!(!parsed.read_only);
        assert!(parsed.fuse_passthrough.is_empty());
    }

    #[test]
    fn recognizes_ro_and_blocksize() {
        let parsed = parse_mount_options(&opts(&["ro", "blocksize=16384"])).unwrap();
        assert!(parsed.read_only);
        assert_eq!(parsed.block_size, 16384);
    }

    #[test]
    fn forwards_unknown_options_to_fuse() {
        let parsed = parse_mount_options(&opts(&["ro", "allow_other", "noatime"])).unwrap();
        assert_eq!(parsed.fuse_passthrough, vec!["allow_other", "noatime"]);
    }

    #[test]
    fn rejects_bad_blocksize() {
        assert!(parse_mount_options(&opts(&["blocksize=banana"])).is_err());
        assert!(parse_mount_options(&opts(&["blocksize=0"])).is_err());
    }

    #[test]
    fn cli_parses_the_pgfuse_invocation_shape() {
        let cli = Cli::try_parse_from([
            "pgblockfs",
            "-v",
            "-o",
            "ro,blocksize=8192",
            "dbname=fs user=fs",
            "/mnt/pg",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.conninfo, "dbname=fs user=fs");
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt/pg"));
        assert_eq!(cli.options, vec!["ro", "blocksize=8192"]);
    }
}
