// Command-line front end for treedelta.
//
// Tree commands (`create`, `apply`, `info`, `hash`) drive the delta
// pipeline; `diff` and `patch` expose the single-file bsdiff container.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};

use crate::archive::{ArchiveError, ArchiveHeader, ArchiveReader, CompressionMode};
use crate::bsdiff;
use crate::command::CommandFlags;
use crate::delta::{self, ApplyOptions, CreateOptions};
use crate::fsops;
use crate::tree::{self, MajorVersion};

const BUF_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Binary delta archives between directory trees.
#[derive(Parser, Debug)]
#[command(
    name = "treedelta",
    version,
    about = "Binary delta archives between directory trees",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Overwrite existing outputs (archive, patch, output file or destination tree).
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (errors only).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output stats as JSON.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create a delta archive turning BEFORE into AFTER.
    Create(CreateArgs),
    /// Rebuild the after tree from BEFORE and an archive.
    Apply(ApplyArgs),
    /// Describe an archive, or the build when no archive is given.
    Info(InfoArgs),
    /// Print the tree hash of a directory.
    Hash(HashArgs),
    /// Write a single-file bsdiff patch.
    Diff(DiffArgs),
    /// Apply a single-file bsdiff patch.
    Patch(PatchArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    None,
    Lzma,
    Zlib,
    Zstd,
}

impl From<CompressionArg> for CompressionMode {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => CompressionMode::None,
            CompressionArg::Lzma => CompressionMode::Lzma,
            CompressionArg::Zlib => CompressionMode::Zlib,
            CompressionArg::Zstd => CompressionMode::Zstd,
        }
    }
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Tree the archive applies to.
    #[arg(value_hint = ValueHint::DirPath)]
    before: PathBuf,

    /// Tree the archive rebuilds.
    #[arg(value_hint = ValueHint::DirPath)]
    after: PathBuf,

    /// Archive to write.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: PathBuf,

    /// Body compression.
    #[arg(long, short = 'c', value_enum, default_value_t = CompressionArg::Zlib)]
    compression: CompressionArg,

    /// Compression level (default depends on the compression).
    #[arg(long, short = 'l', value_parser = clap::value_parser!(u8).range(0..=22))]
    level: Option<u8>,

    /// Archive format version.
    #[arg(long = "format-version", value_parser = clap::value_parser!(u16).range(2..=3), default_value_t = MajorVersion::LATEST.as_u16())]
    format_version: u16,

    /// Fall back to a full copy when a diff exceeds this fraction of the new file.
    #[arg(long = "diff-threshold", value_parser = parse_threshold, default_value_t = 0.8)]
    diff_threshold: f64,

    /// Do not record the creation time.
    #[arg(long = "no-timestamp")]
    no_timestamp: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Tree the archive applies to.
    #[arg(value_hint = ValueHint::DirPath)]
    before: PathBuf,

    /// Archive to apply.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: PathBuf,

    /// Destination of the rebuilt tree (must not exist).
    #[arg(value_hint = ValueHint::DirPath)]
    dest: PathBuf,

    /// Skip checking BEFORE against the archive.
    #[arg(long = "no-verify")]
    no_verify: bool,

    /// Report progress on stderr.
    #[arg(long)]
    progress: bool,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Archive to describe.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct HashArgs {
    /// Directory to fingerprint.
    #[arg(value_hint = ValueHint::DirPath)]
    dir: PathBuf,

    /// Hash version.
    #[arg(long = "format-version", value_parser = clap::value_parser!(u16).range(2..=3), default_value_t = MajorVersion::LATEST.as_u16())]
    format_version: u16,
}

#[derive(Args, Debug)]
struct DiffArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    old: PathBuf,

    #[arg(value_hint = ValueHint::FilePath)]
    new: PathBuf,

    /// Patch file to write.
    #[arg(value_hint = ValueHint::FilePath)]
    patch: PathBuf,
}

#[derive(Args, Debug)]
struct PatchArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    old: PathBuf,

    /// Patch file to apply.
    #[arg(value_hint = ValueHint::FilePath)]
    patch: PathBuf,

    /// Output file.
    #[arg(value_hint = ValueHint::FilePath)]
    new: PathBuf,
}

fn parse_threshold(s: &str) -> Result<f64, String> {
    let v: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid threshold '{s}': {e}"))?;
    if v.is_finite() && v >= 0.0 {
        Ok(v)
    } else {
        Err(format!("threshold must be a non-negative number: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Global options
// ---------------------------------------------------------------------------

struct Options {
    force: bool,
    quiet: bool,
    verbose: u8,
    json_output: bool,
}

impl Options {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            force: cli.force,
            quiet: cli.quiet,
            verbose: cli.verbose.min(2),
            json_output: cli.json_output,
        }
    }

    fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            _ => "debug",
        }
    }

    /// Refuse to clobber `path` unless `--force` was given.
    fn check_output(&self, path: &Path) -> Result<(), i32> {
        if !fsops::exists_no_follow(path) {
            return Ok(());
        }
        if !self.force {
            eprintln!("treedelta: output exists, use -f to overwrite: {}", path.display());
            return Err(1);
        }
        fsops::remove_path(path).map_err(|e| fail(path.display(), e))
    }
}

fn fail(context: impl fmt::Display, e: impl fmt::Display) -> i32 {
    eprintln!("treedelta: {context}: {e}");
    1
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn major_version(v: u16) -> MajorVersion {
    MajorVersion::from_u16(v).unwrap_or(MajorVersion::LATEST)
}

// ---------------------------------------------------------------------------
// Create / apply
// ---------------------------------------------------------------------------

fn cmd_create(opts: &Options, args: &CreateArgs) -> i32 {
    if let Err(code) = opts.check_output(&args.archive) {
        return code;
    }
    let compression = CompressionMode::from(args.compression);
    let options = CreateOptions {
        compression,
        level: args.level.unwrap_or(compression.default_level()),
        major_version: major_version(args.format_version),
        diff_threshold: args.diff_threshold,
        timestamp: !args.no_timestamp,
    };

    let stats = match delta::create_delta(&args.before, &args.after, &args.archive, &options) {
        Ok(stats) => stats,
        Err(e) => return fail("create", e),
    };

    if opts.json_output {
        print_json(&serde_json::json!({
            "command": "create",
            "before_hash": stats.before_hash.to_hex(),
            "after_hash": stats.after_hash.to_hex(),
            "before_size": stats.before_size,
            "after_size": stats.after_size,
            "archive_size": stats.archive_size,
            "compression": compression.name(),
            "level": options.level,
            "commands": stats.commands,
            "deleted": stats.deleted,
            "extracted": stats.extracted,
            "cloned": stats.cloned,
            "diffed": stats.diffed,
            "chmod": stats.chmod,
        }));
    } else if !opts.quiet {
        eprintln!(
            "treedelta: {} commands ({} extract, {} clone, {} diff, {} delete), archive {} bytes",
            stats.commands, stats.extracted, stats.cloned, stats.diffed, stats.deleted, stats.archive_size
        );
    }
    0
}

fn cmd_apply(opts: &Options, args: &ApplyArgs) -> i32 {
    if let Err(code) = opts.check_output(&args.dest) {
        return code;
    }
    let options = ApplyOptions {
        verify_before: !args.no_verify,
    };

    let show_progress = args.progress && !opts.quiet;
    let mut last_percent = None;
    let mut report = |fraction: f64| {
        let percent = (fraction * 100.0) as u32;
        if show_progress && last_percent != Some(percent) {
            last_percent = Some(percent);
            eprint!("\rtreedelta: applying {percent:3}%");
        }
    };

    let result = delta::apply_delta(&args.before, &args.archive, &args.dest, &options, &mut report);
    if show_progress {
        eprintln!();
    }
    let stats = match result {
        Ok(stats) => stats,
        Err(e) => return fail("apply", e),
    };

    if opts.json_output {
        print_json(&serde_json::json!({
            "command": "apply",
            "version": format!("{}.{}", stats.major, stats.minor),
            "after_hash": stats.after_hash.to_hex(),
            "commands": stats.commands,
            "deleted": stats.deleted,
            "extracted": stats.extracted,
            "cloned": stats.cloned,
            "patched": stats.patched,
            "chmod": stats.chmod,
            "bytes_written": stats.bytes_written,
        }));
    } else if !opts.quiet {
        eprintln!(
            "treedelta: applied {} commands, wrote {} bytes",
            stats.commands, stats.bytes_written
        );
    }
    0
}

// ---------------------------------------------------------------------------
// Info / hash
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    println!("treedelta version {version}");
    for mode in CompressionMode::ALL {
        let available = mode.is_available() as u8;
        println!("COMPRESSION_{}={available}", mode.name().to_uppercase());
    }
    println!("PARALLEL={}", cfg!(feature = "parallel") as u8);
    println!("FORMAT_VERSION={}", MajorVersion::LATEST);
    0
}

#[derive(Default)]
struct CommandCounts {
    delete: usize,
    extract: usize,
    clone: usize,
    diff: usize,
    chmod: usize,
    content_bytes: u64,
}

fn count_commands(archive: &Path) -> Result<(ArchiveHeader, usize, CommandCounts), ArchiveError> {
    let reader = ArchiveReader::open(archive)?;
    let header = reader.header().clone();
    let paths = reader.path_table().len();
    let mut counts = CommandCounts::default();
    reader.for_each_command(|item| -> Result<_, ArchiveError> {
        let flags = item.flags();
        counts.delete += flags.contains(CommandFlags::DELETE) as usize;
        counts.extract += flags.contains(CommandFlags::EXTRACT) as usize;
        counts.clone += flags.contains(CommandFlags::CLONE) as usize;
        counts.diff += flags.contains(CommandFlags::BINARY_DIFF) as usize;
        counts.chmod += flags.contains(CommandFlags::MODIFY_PERMISSIONS) as usize;
        counts.content_bytes += item.content_len().unwrap_or(0);
        Ok(ControlFlow::Continue(()))
    })?;
    Ok((header, paths, counts))
}

fn format_created(created: Option<u64>) -> String {
    created
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn cmd_info(opts: &Options, args: &InfoArgs) -> i32 {
    let Some(archive) = &args.archive else {
        return cmd_config();
    };
    let (header, paths, counts) = match count_commands(archive) {
        Ok(r) => r,
        Err(e) => return fail(archive.display(), e),
    };

    if opts.json_output {
        print_json(&serde_json::json!({
            "command": "info",
            "version": format!("{}.{}", header.major, header.minor),
            "compression": header.compression.name(),
            "level": header.level,
            "before_hash": header.before_hash.to_hex(),
            "after_hash": header.after_hash.to_hex(),
            "created": header.created,
            "paths": paths,
            "delete": counts.delete,
            "extract": counts.extract,
            "clone": counts.clone,
            "diff": counts.diff,
            "chmod": counts.chmod,
            "content_bytes": counts.content_bytes,
        }));
        return 0;
    }

    println!("Format version:    {}.{}", header.major, header.minor);
    println!("Compression:       {} (level {})", header.compression, header.level);
    println!("Before tree:       {}", header.before_hash);
    println!("After tree:        {}", header.after_hash);
    println!("Created:           {}", format_created(header.created));
    println!("Paths:             {paths}");
    println!(
        "Commands:          {} delete, {} extract, {} clone, {} diff, {} chmod",
        counts.delete, counts.extract, counts.clone, counts.diff, counts.chmod
    );
    println!("Content bytes:     {}", counts.content_bytes);
    0
}

fn cmd_hash(opts: &Options, args: &HashArgs) -> i32 {
    let version = major_version(args.format_version);
    let hash = match tree::hash_tree(&args.dir, version) {
        Ok(h) => h,
        Err(e) => return fail(args.dir.display(), e),
    };
    if opts.json_output {
        print_json(&serde_json::json!({
            "command": "hash",
            "path": args.dir.display().to_string(),
            "version": version.as_u16(),
            "hash": hash.to_hex(),
        }));
    } else {
        println!("{hash}  {}", args.dir.display());
    }
    0
}

// ---------------------------------------------------------------------------
// Single-file diff / patch
// ---------------------------------------------------------------------------

fn cmd_diff(opts: &Options, args: &DiffArgs) -> i32 {
    let old = match fs::read(&args.old) {
        Ok(data) => data,
        Err(e) => return fail(args.old.display(), e),
    };
    let new = match fs::read(&args.new) {
        Ok(data) => data,
        Err(e) => return fail(args.new.display(), e),
    };
    if let Err(code) = opts.check_output(&args.patch) {
        return code;
    }

    let record = bsdiff::diff(&old, &new);
    let written = File::create(&args.patch).and_then(|f| {
        let mut w = BufWriter::with_capacity(BUF_SIZE, f);
        bsdiff::format::write_patch(&mut w, &record)?;
        w.flush()?;
        w.get_ref().metadata().map(|m| m.len())
    });
    let patch_size = match written {
        Ok(n) => n,
        Err(e) => return fail(args.patch.display(), e),
    };

    if opts.json_output {
        print_json(&serde_json::json!({
            "command": "diff",
            "old_size": old.len(),
            "new_size": new.len(),
            "patch_size": patch_size,
            "triples": record.controls.len(),
        }));
    } else if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "treedelta: diff: old {} bytes, new {} bytes, patch {patch_size} bytes",
            old.len(),
            new.len()
        );
    }
    0
}

fn cmd_patch(opts: &Options, args: &PatchArgs) -> i32 {
    let old = match fs::read(&args.old) {
        Ok(data) => data,
        Err(e) => return fail(args.old.display(), e),
    };
    let patch_data = match fs::read(&args.patch) {
        Ok(data) => data,
        Err(e) => return fail(args.patch.display(), e),
    };
    let new = match bsdiff::format::apply_patch(&old, &patch_data) {
        Ok(data) => data,
        Err(e) => return fail(args.patch.display(), e),
    };
    if let Err(code) = opts.check_output(&args.new) {
        return code;
    }
    if let Err(e) = fs::write(&args.new, &new) {
        return fail(args.new.display(), e);
    }

    if opts.json_output {
        print_json(&serde_json::json!({
            "command": "patch",
            "old_size": old.len(),
            "patch_size": patch_data.len(),
            "new_size": new.len(),
        }));
    } else if opts.verbose > 0 && !opts.quiet {
        eprintln!("treedelta: patch: wrote {} bytes", new.len());
    }
    0
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = Options::from_cli(&cli);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(opts.log_filter()))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let exit_code = match &cli.command {
        Cmd::Create(args) => cmd_create(&opts, args),
        Cmd::Apply(args) => cmd_apply(&opts, args),
        Cmd::Info(args) => cmd_info(&opts, args),
        Cmd::Hash(args) => cmd_hash(&opts, args),
        Cmd::Diff(args) => cmd_diff(&opts, args),
        Cmd::Patch(args) => cmd_patch(&opts, args),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv: Vec<String> = std::iter::once("treedelta".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        Cli::try_parse_from(argv).expect("cli parse failed")
    }

    #[test]
    fn create_defaults() {
        let cli = parse(&["create", "v1", "v2", "out.tdlt"]);
        let Cmd::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.before, PathBuf::from("v1"));
        assert_eq!(args.after, PathBuf::from("v2"));
        assert_eq!(args.archive, PathBuf::from("out.tdlt"));
        assert_eq!(args.compression, CompressionArg::Zlib);
        assert_eq!(args.level, None);
        assert_eq!(args.format_version, 3);
        assert_eq!(args.diff_threshold, 0.8);
        assert!(!args.no_timestamp);
    }

    #[test]
    fn create_tuning_flags() {
        let cli = parse(&[
            "create",
            "--compression",
            "zstd",
            "--level",
            "19",
            "--format-version",
            "2",
            "--diff-threshold",
            "0.5",
            "--no-timestamp",
            "a",
            "b",
            "c",
        ]);
        let Cmd::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(CompressionMode::from(args.compression), CompressionMode::Zstd);
        assert_eq!(args.level, Some(19));
        assert_eq!(major_version(args.format_version), MajorVersion::V2);
        assert_eq!(args.diff_threshold, 0.5);
        assert!(args.no_timestamp);
    }

    #[test]
    fn out_of_range_values_rejected() {
        let argv = |extra: &[&str]| {
            let mut v = vec!["treedelta", "create"];
            v.extend_from_slice(extra);
            v.extend_from_slice(&["a", "b", "c"]);
            Cli::try_parse_from(v)
        };
        assert!(argv(&["--format-version", "4"]).is_err());
        assert!(argv(&["--level", "23"]).is_err());
        assert!(argv(&["--diff-threshold", "-1"]).is_err());
        assert!(argv(&["--compression", "bzip2"]).is_err());
    }

    #[test]
    fn apply_and_global_flags() {
        let cli = parse(&["-vv", "--json", "apply", "--no-verify", "old", "d.tdlt", "new"]);
        let opts = Options::from_cli(&cli);
        assert_eq!(opts.verbose, 2);
        assert!(opts.json_output);
        assert_eq!(opts.log_filter(), "debug");
        let Cmd::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert!(args.no_verify);
        assert_eq!(args.dest, PathBuf::from("new"));
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["treedelta", "-q", "-v", "info"]).is_err());
        let opts = Options::from_cli(&parse(&["-q", "info"]));
        assert_eq!(opts.log_filter(), "error");
    }

    #[test]
    fn info_archive_is_optional() {
        let Cmd::Info(args) = parse(&["info"]).command else {
            panic!("expected info");
        };
        assert!(args.archive.is_none());
    }

    #[test]
    fn created_timestamp_rendering() {
        assert_eq!(format_created(Some(0)), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_created(None), "unknown");
        assert_eq!(format_created(Some(u64::MAX)), "unknown");
    }
}
