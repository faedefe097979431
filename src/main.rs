use clap::{ArgAction, Parser, Subcommand};
use compressfs::block::Block;
use compressfs::codec::CompressionMethod;
use compressfs::config::EngineConfig;
use compressfs::engine::CompressedFile;
use compressfs::header::{self, FileHeader, HEADER_REGION, INDEX_PREFIX_SIZE, MAGIC};
use compressfs::offline::{Converter, Direction, Outcome};
use compressfs::sniff::NoSniffer;
use serde::Serialize;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "compressfs", about = "Transparent block-compression storage tools")]
struct Cli {
    /// JSON engine configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress files or directory trees in place
    Compress {
        /// Method: zstd (default), lz4, brotli, lzma, xor, none
        #[arg(short, long, value_parser = parse_method)]
        method: Option<CompressionMethod>,
        /// Compression level (zstd 1-22; brotli 0-11; ignored for lz4/lzma)
        #[arg(short, long)]
        level: Option<i32>,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Turn managed files back into plain files in place
    Decompress {
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Show header and block index of a raw file
    Inspect {
        path: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Rewrite a managed file without shadowed data
    Defrag {
        path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None       => EngineConfig::default(),
    };

    match cli.command {

        // ── Compress ─────────────────────────────────────────────────────────
        Commands::Compress { method, level, paths } => {
            if let Some(method) = method {
                config.method = method;
            }
            if let Some(level) = level {
                config.level = level;
            }
            config.validate()?;
            convert(Arc::new(config), Direction::Compress, &paths)?;
        }

        // ── Decompress ───────────────────────────────────────────────────────
        Commands::Decompress { paths } => {
            convert(Arc::new(config), Direction::Decompress, &paths)?;
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { path, json } => {
            let report = inspect(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_inspection(&report);
            }
        }

        // ── Defrag ───────────────────────────────────────────────────────────
        Commands::Defrag { path } => {
            let mut file = CompressedFile::new(&path, Arc::new(config), Arc::new(NoSniffer))?;
            if !file.is_compressed() {
                println!("{} is not a managed file", path.display());
                return Ok(());
            }
            file.open()?;
            let before = file.raw_size();
            let defragmented = file.defragment();
            file.release()?;
            defragmented?;
            println!("Defragmented {}: data {} B → {} B", path.display(), before, file.raw_size());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn parse_method(s: &str) -> Result<CompressionMethod, String> {
    CompressionMethod::from_name(s).ok_or_else(|| {
        let known: Vec<&str> = CompressionMethod::ALL.iter().map(|m| m.name()).collect();
        format!("unknown method '{s}' (expected one of: {})", known.join(", "))
    })
}

fn convert(
    config:    Arc<EngineConfig>,
    direction: Direction,
    paths:     &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let converter = Converter::new(config, direction);
    let mut failed = 0usize;
    for root in paths {
        for report in converter.convert_tree(root)? {
            match report.outcome {
                Ok(Outcome::Converted { from, to }) => {
                    println!("  converted {}  {} → {} B", report.path.display(), from, to);
                }
                Ok(Outcome::Skipped(reason)) => {
                    println!("  skipped   {}  ({:?})", report.path.display(), reason);
                }
                Err(e) => {
                    eprintln!("  failed    {}  {}", report.path.display(), e);
                    failed += 1;
                }
            }
        }
    }
    if failed > 0 {
        return Err(format!("{failed} file(s) failed").into());
    }
    Ok(())
}

#[derive(Serialize)]
struct Inspection {
    path:          PathBuf,
    raw_size:      u64,
    header:        Option<FileHeader>,
    stored_bytes:  u64,
    visible_bytes: u64,
    max_level:     u32,
    blocks:        Vec<Block>,
}

/// Read header and index straight from disk; the file is not modified.
fn inspect(path: &Path) -> Result<Inspection, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let raw_size = file.metadata()?.len();
    let mut report = Inspection {
        path:          path.to_path_buf(),
        raw_size,
        header:        None,
        stored_bytes:  0,
        visible_bytes: 0,
        max_level:     0,
        blocks:        Vec::new(),
    };
    if raw_size < HEADER_REGION {
        return Ok(report);
    }
    let mut region = [0u8; HEADER_REGION as usize];
    file.read_exact_at(&mut region, 0)?;
    let Ok(h) = FileHeader::read(&region[..]) else {
        return Ok(report);
    };
    report.header = Some(h);
    if h.index_offset == 0 {
        return Ok(report);
    }

    let mut prefix = [0u8; INDEX_PREFIX_SIZE as usize];
    file.read_exact_at(&mut prefix, h.index_offset)?;
    let (raw_len, stored_len) = header::decode_index_prefix(&prefix);
    let mut stored = vec![0u8; stored_len as usize];
    file.read_exact_at(&mut stored, h.index_offset + INDEX_PREFIX_SIZE)?;
    let map = header::decode_index(&stored, raw_len, h.index_method)?;

    report.stored_bytes  = map.stored_bytes();
    report.visible_bytes = map.visible_bytes(h.logical_size);
    report.max_level     = map.max_level();
    report.blocks        = map.iter().copied().collect();
    Ok(report)
}

fn print_inspection(r: &Inspection) {
    println!("── compressfs file ──────────────────────────────────────");
    println!("  Path           {}", r.path.display());
    println!("  Raw size       {} B", r.raw_size);
    let Some(h) = &r.header else {
        println!("  Managed        no (magic {} not found)", hex::encode(MAGIC));
        return;
    };
    println!("  Managed        yes");
    println!("  Logical size   {} B", h.logical_size);
    println!("  Index offset   {}", h.index_offset);
    println!("  Index method   {}", h.index_method);
    println!("  Blocks         {}", r.blocks.len());
    println!("  Stored bytes   {} B", r.stored_bytes);
    println!("  Visible bytes  {} B", r.visible_bytes);
    println!("  Next level     {}", r.max_level);
    for b in &r.blocks {
        println!("    {b}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_parsed_by_clap() {
        let cli = Cli::try_parse_from(["compressfs", "compress", "-m", "lz4", "f"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Compress { method: Some(CompressionMethod::Lz4), .. }
        ));
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(Cli::try_parse_from(["compressfs", "compress", "-m", "gzip", "f"]).is_err());
    }
}
