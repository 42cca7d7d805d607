use clap::{ArgAction, Parser, Subcommand};
use datpak::archive::{ArchiveError, ArchiveOptions, ArchiveStore, Summary};
use datpak::codec::{CodecId, DEFAULT_LEVEL};
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datpak", version, about = "Pack, inspect and unpack .dat asset archives")]
struct Cli {
    /// Log more (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Codec the archive is written with: zlib (default), zstd, lz4, none
    #[arg(long, global = true, env = "DATPAK_CODEC", default_value = "zlib")]
    codec: CodecId,
    /// Compression level (zlib 0-9, zstd 1-19; ignored for lz4/none)
    #[arg(long, global = true, env = "DATPAK_LEVEL", default_value_t = DEFAULT_LEVEL)]
    level: i32,
    /// Flush archive writes to stable storage after every change
    #[arg(long, global = true)]
    sync: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert or update files; each entry is named by its path as given
    Pack {
        archive: PathBuf,
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Extract entries (all of them when no name is given)
    Unpack {
        archive: PathBuf,
        names: Vec<String>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Remove entries; their data blocks become reusable
    Remove {
        archive: PathBuf,
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },
    /// List entries with sizes and compression ratios
    List {
        archive: PathBuf,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show header fields and block usage
    Info {
        archive: PathBuf,
    },
    /// Decode every entry and check block ownership
    Verify {
        archive: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    let options = ArchiveOptions { codec: cli.codec, level: cli.level, sync: cli.sync };

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { archive, files } => {
            let mut store = ArchiveStore::open_with(&archive, options)?;
            for path in &files {
                let id = store.insert_file(path)?;
                if let Some(e) = store.entry(id) {
                    println!("  packed  {:<40} {:>9} => {:>9}", e.name, e.size_original, e.size_compressed);
                }
            }
            println!("Updated: {}", archive.display());
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { archive, names, output_dir } => {
            let store = ArchiveStore::open_with(&archive, options)?;
            if names.is_empty() {
                let n = store.extract_all(&output_dir)?;
                println!("Unpacked {n} entries to: {}", output_dir.display());
            }
            for name in &names {
                let target = store.extract_to(name, &output_dir)?;
                println!("  extracted  {}", target.display());
            }
        }

        // ── Remove ───────────────────────────────────────────────────────────
        Commands::Remove { archive, names } => {
            let mut store = ArchiveStore::open_with(&archive, options)?;
            let mut missing = Vec::new();
            for name in &names {
                match store.remove(name)? {
                    Some(_) => println!("  removed  {name}"),
                    None    => missing.push(name.as_str()),
                }
            }
            if !missing.is_empty() {
                return Err(CliError::Failed(format!("not found: {}", missing.join(", "))));
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { archive, json } => {
            let store = ArchiveStore::open_with(&archive, options)?;
            let summary = store.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_listing(&archive, &summary);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { archive } => {
            let store = ArchiveStore::open_with(&archive, options)?;
            let h = store.header();
            let map = store.block_map();

            println!("── .dat Archive ─────────────────────────────────────────");
            println!("  Path              {}", archive.display());
            println!("  Codec             {}", store.codec_name());
            println!("  Format version    {:#06x}", h.version);
            println!("  Directory slots   {}", h.entry_count);
            println!("  Live entries      {}", store.directory().live_count());
            println!("  Directory offset  {} B", h.directory_offset);
            println!("  Directory blocks  {}", h.directory_block_count);
            println!("  Directory size    {} B compressed", h.directory_compressed_size);
            println!("  Blocks            {} ({} used, {} free)",
                     map.block_count(), map.occupied_blocks(), map.free_blocks());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { archive } => {
            let store = ArchiveStore::open_with(&archive, options)?;
            let report = store.verify()?;
            for f in &report.failures {
                println!("  FAIL  {:5}  {}: {}", f.id + 1, f.name, f.reason);
            }
            if !report.is_ok() {
                return Err(CliError::Failed(format!(
                    "{} of {} entries failed verification",
                    report.failures.len(),
                    report.checked
                )));
            }
            println!("{} entries OK", report.checked);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_listing(archive: &std::path::Path, summary: &Summary) {
    println!("DATAFILE: {}", archive.display());
    println!("Files:    {} ({} slots)", summary.count(), summary.slots);
    println!();
    if summary.is_empty() {
        return;
    }
    println!("Index  Orig Size  Comp Size  Ratio  Name");
    println!("-----  ---------  ---------  -----  ----------------");
    for e in &summary.entries {
        println!("{:5}  {:9}  {:9}   {:2}%   {}",
                 e.id + 1, e.size_original, e.size_compressed, e.ratio, e.name);
    }
    println!("-----  ---------  ---------  -----");
    println!("TOTAL  {:9}  {:9}   {:2}%", summary.total_original, summary.total_compressed, summary.ratio);
}
