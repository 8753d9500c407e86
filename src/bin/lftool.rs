//! Offline index maintenance: build, query and inspect `.lft` files
//! without a running daemon.

use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use lft_index::fs_buf::{self, FsBuf, RecordKind};
use lft_index::walk::{self, WalkOptions, WalkSummary};

#[derive(Parser)]
#[command(name = "lftool", about = "Filesystem name-index maintenance tool")]
struct Cli {
    /// Log verbosity: 0 warnings, 1 debug, 2 trace.
    #[arg(long, default_value_t = 0)]
    log_level: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Walk a directory and write its index file.
    Build {
        dir: PathBuf,
        output: PathBuf,
        #[arg(long)]
        include_hidden: bool,
    },
    /// Search an index file for a keyword.
    Search {
        index: PathBuf,
        keyword: String,
        #[arg(long)]
        regex: bool,
        /// Restrict the search to this subtree of the indexed root.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print header information of an index file.
    Stat { index: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let directive = match cli.log_level {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lftool: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), fs_buf::Error> {
    match command {
        Command::Build { dir, output, include_hidden } => build(&dir, &output, include_hidden),
        Command::Search { index, keyword, regex, path } => {
            search(&index, &keyword, regex, path.as_deref())
        }
        Command::Stat { index } => stat(&index),
    }
}

fn build(dir: &Path, output: &Path, include_hidden: bool) -> Result<(), fs_buf::Error> {
    let mut buf = FsBuf::new(fs_buf::DEFAULT_CAPACITY, dir.as_os_str().as_bytes())?;
    let mut progress = |summary: &WalkSummary, _: &Path, _: &Path| {
        let seen = summary.files + summary.dirs;
        if seen > 0 && seen % 100_000 == 0 {
            eprintln!("... {} files, {} directories", summary.files, summary.dirs);
        }
        ControlFlow::Continue(())
    };
    let summary = match walk::build_fs_tree(&mut buf, WalkOptions { include_hidden }, &mut progress)
    {
        Ok(summary) => summary,
        Err(walk::Error::Cancelled) => unreachable!("no cancellation source"),
        Err(walk::Error::Io(err)) => return Err(fs_buf::Error::Io(err)),
        Err(walk::Error::Buf(err)) => return Err(err),
    };
    buf.save(output)?;
    println!(
        "indexed {} files and {} directories into {}",
        summary.files,
        summary.dirs,
        output.display()
    );
    Ok(())
}

fn search(index: &Path, keyword: &str, regex: bool, path: Option<&Path>) -> Result<(), fs_buf::Error> {
    let buf = FsBuf::load(index)?;
    let query = match path {
        Some(path) => path.as_os_str().as_bytes().to_vec(),
        None => buf.root_path().to_vec(),
    };
    let Some(range) = buf.path_range(&query)? else {
        return Ok(());
    };
    let compiled = if regex {
        match regex::bytes::RegexBuilder::new(keyword)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
        {
            Ok(compiled) => Some(compiled),
            Err(err) => {
                eprintln!("lftool: invalid regular expression: {err}");
                return Ok(());
            }
        }
    } else {
        None
    };
    let needle = keyword.as_bytes().to_ascii_lowercase();
    let mut cursor = range.start;
    loop {
        let offsets = buf.search_files(
            &mut cursor,
            range.end,
            100,
            |name| match &compiled {
                Some(regex) => regex.is_match(name),
                None => {
                    needle.is_empty()
                        || name
                            .windows(needle.len())
                            .any(|window| window.eq_ignore_ascii_case(&needle))
                }
            },
            |_| false,
        )?;
        for offset in offsets {
            let path = buf.path_by_offset(offset)?;
            println!("{}", String::from_utf8_lossy(&path));
        }
        if cursor >= range.end {
            break;
        }
    }
    Ok(())
}

fn stat(index: &Path) -> Result<(), fs_buf::Error> {
    let buf = FsBuf::load(index)?;
    let mut files = 0u64;
    let mut dirs = 0u64;
    let mut off = buf.first_name();
    while off < buf.tail() {
        let record = buf.record(off)?;
        match record.kind {
            RecordKind::File => files += 1,
            RecordKind::Directory => dirs += 1,
            RecordKind::EndOfChildren => {}
        }
        off += record.encoded_len();
    }
    println!("root: {}", String::from_utf8_lossy(buf.root_path()));
    println!("tail: {} bytes (capacity {})", buf.tail(), buf.capacity());
    println!("entries: {files} files, {dirs} directories");
    Ok(())
}
