use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use rusty_probe::fs::fields::hexdump;
use rusty_probe::fs::xfs::registry::{self, StructureKind};
use rusty_probe::fs::xfs::scan::{ScanHit, ScanOptions};
use rusty_probe::fs::xfs::XfsDecoder;
use rusty_probe::partition::PartitionTable;
use rusty_probe::DecodeMode;

#[derive(Parser)]
#[command(name = "rusty-probe", version = env!("APP_VERSION"))]
#[command(about = "Inspect XFS metadata and MBR partition chains in raw disk images", long_about = None)]
struct Cli {
    /// Report structural mismatches as warnings and keep going
    #[arg(short, long, global = true)]
    force: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print machine-readable JSON where the command supports it
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the MBR partition table, including logical partitions
    Mbr {
        /// Raw disk image
        image: PathBuf,
    },
    /// Show the primary XFS superblock
    XfsInfo {
        /// XFS filesystem image
        image: PathBuf,
    },
    /// Show the headers and tree roots of one allocation group
    XfsAg {
        image: PathBuf,
        agno: u32,
    },
    /// Decode one filesystem block
    XfsBlock {
        image: PathBuf,
        block: u64,
        /// Decode a single sector of the block instead of the whole block
        #[arg(long)]
        sector: Option<u32>,
        /// Structure type to decode as (see xfs-types); detected by magic if omitted
        #[arg(long = "as")]
        kind: Option<String>,
    },
    /// Decode one inode by number
    XfsInode {
        image: PathBuf,
        ino: u64,
    },
    /// Scan every block for known structure magics
    XfsScan {
        image: PathBuf,
        /// Byte alignment of candidate positions (default: sector size)
        #[arg(long)]
        stride: Option<u32>,
    },
    /// Write the used blocks of the filesystem to an Android sparse image
    XfsExport {
        image: PathBuf,
        /// Destination sparse image, created or truncated
        dest: PathBuf,
    },
    /// List the structure types known to xfs-block --as
    XfsTypes,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn open_image(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn open_xfs(path: &Path, mode: DecodeMode) -> Result<XfsDecoder<BufReader<File>>> {
    XfsDecoder::detect(open_image(path)?, mode)
        .with_context(|| format!("{} is not a readable XFS filesystem", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mode = if cli.force {
        DecodeMode::BEST_EFFORT
    } else {
        DecodeMode::STRICT
    };

    match cli.command {
        Commands::Mbr { image } => {
            let mut reader = open_image(&image)?;
            let table = PartitionTable::detect(&mut reader, mode)
                .with_context(|| format!("cannot read partition table of {}", image.display()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else {
                let name = image
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| image.display().to_string());
                print!("{}", table.format_as_fdisk_table(&name));
            }
        }
        Commands::XfsInfo { image } => {
            let dec = open_xfs(&image, mode)?;
            print!("{}", dec.superblock().render());
        }
        Commands::XfsAg { image, agno } => {
            let dec = open_xfs(&image, mode)?;
            let Some(ag) = dec.allocation_group(agno) else {
                bail!(
                    "AG {agno} out of range: filesystem has {} AGs",
                    dec.allocation_groups().len()
                );
            };
            print!("{}", ag.render(dec.superblock().is_v5()));
        }
        Commands::XfsBlock {
            image,
            block,
            sector,
            kind,
        } => {
            let mut dec = open_xfs(&image, mode)?;
            let buf = dec
                .read_block(block, sector)
                .with_context(|| format!("cannot read block {block}"))?;
            let kind = match kind {
                Some(name) => StructureKind::by_name(&name).with_context(|| {
                    format!("unknown structure type '{name}', see xfs-types")
                })?,
                None => match XfsDecoder::<BufReader<File>>::identify(&buf) {
                    Some(kind) => kind,
                    None => {
                        println!("no known magic in block {block}");
                        print!("{}", hexdump(&buf, 0));
                        return Ok(());
                    }
                },
            };
            print!("{}", dec.decode_and_print(kind, &buf));
        }
        Commands::XfsInode { image, ino } => {
            let mut dec = open_xfs(&image, mode)?;
            let inode = dec
                .fetch_inode(ino)
                .with_context(|| format!("cannot decode inode {ino}"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&inode)?);
            } else {
                print!("{}", inode.render());
            }
        }
        Commands::XfsScan { image, stride } => {
            let mut dec = open_xfs(&image, mode)?;
            for hit in dec.scan(ScanOptions { stride })? {
                let hit = hit.context("scan aborted")?;
                if cli.json {
                    println!("{}", serde_json::to_string(&hit)?);
                    continue;
                }
                match hit {
                    ScanHit::Structure { block, offset, kind } => {
                        println!("block {block} +{offset}: {}", kind.name())
                    }
                    ScanHit::LogRange {
                        first_block,
                        last_block,
                    } => println!("blocks {first_block}-{last_block}: log"),
                }
            }
        }
        Commands::XfsExport { image, dest } => {
            let mut dec = open_xfs(&image, mode)?;
            let used = dec
                .export_sparse(&dest)
                .with_context(|| format!("export to {} failed", dest.display()))?;
            println!(
                "wrote {used} used blocks of {} to {}",
                dec.superblock().dblocks,
                dest.display()
            );
        }
        Commands::XfsTypes => print!("{}", registry::describe_all()),
    }

    Ok(())
}

