use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, LevelFilter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use romkit_core::archive::lz11;
use romkit_core::integrity::verify;
use romkit_core::{
    compute_checksum, is_recognized, repack, Archive, FlatImage, FlatLayout, ImageIdentity,
    RecordFormat, RepackPlan, SchemaStore,
};

#[derive(Debug, Parser)]
#[command(name = "romkit", version, about = "Cartridge image layout and archive tool")]
struct Args {
    /// Log debug output to stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Match an image against a schema and verify its checksum.
    Identify {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        image: PathBuf,
    },
    /// Print the CRC-32 of a file.
    Crc { file: PathBuf },
    /// Inspect GARC archives.
    #[command(subcommand)]
    Garc(GarcCommand),
    /// Repack a pointer table without changes and report whether the
    /// image was already in canonical layout.
    RepackCheck {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        variant: String,
        #[arg(long)]
        prefix: String,
        #[arg(long)]
        count: usize,
        #[arg(long, value_enum, default_value_t = Format::EvosMoves)]
        format: Format,
    },
}

#[derive(Debug, Subcommand)]
enum GarcCommand {
    /// List slots and sub-blob sizes.
    List { file: PathBuf },
    /// Write one sub-blob to a file.
    Extract {
        file: PathBuf,
        #[arg(long)]
        slot: usize,
        #[arg(long, default_value_t = 0)]
        index: usize,
        #[arg(long)]
        decompress: bool,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    EvosMoves,
    Moves,
    Trainers,
}

impl Format {
    fn record_format(self) -> RecordFormat {
        match self {
            Format::EvosMoves => RecordFormat::EVOS_MOVES,
            Format::Moves => RecordFormat::MOVES,
            Format::Trainers => RecordFormat::TRAINERS,
        }
    }
}

fn setup_logging(verbose: bool) -> Result<(), fern::InitError> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn read_file(path: &Path) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {:?}: {}", path, e);
            std::process::exit(1);
        }
    }
}

fn load_schema(path: &Path) -> SchemaStore {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read {:?}: {}", path, e);
            std::process::exit(1);
        }
    };
    match SchemaStore::from_json_str(&text) {
        Ok(store) => {
            for diagnostic in store.diagnostics() {
                eprintln!("Warning: {diagnostic}");
            }
            store
        }
        Err(e) => {
            eprintln!("Failed to parse schema {:?}: {}", path, e);
            std::process::exit(1);
        }
    }
}

fn identify(schema: &Path, image: &Path) -> romkit_core::Result<()> {
    let store = load_schema(schema);
    let bytes = read_file(image);
    let identity = ImageIdentity::from_game_boy_header(&bytes)?;
    println!(
        "signature '{}' version {} region {} header checksum {:04X}",
        identity.signature,
        identity.version,
        identity.region,
        identity.header_checksum.unwrap_or(0)
    );

    match is_recognized(&identity, &store) {
        Some(entry) => {
            println!("variant: {}", entry.name);
            let result = verify(entry, None, &bytes);
            println!("checksum: {:?} (trusted: {})", result, result.is_trusted());
        }
        None => {
            println!("variant: unknown");
            println!("checksum: {:08X}", compute_checksum(&bytes));
        }
    }
    Ok(())
}

fn garc_list(file: &Path) -> romkit_core::Result<()> {
    let archive = Archive::open(read_file(file))?;
    println!("{:?}, {} slots", archive.version(), archive.slot_count());
    for slot in 0..archive.slot_count() {
        let sizes = (0..archive.subblob_count(slot))
            .map(|i| {
                let blob = archive.get_subblob(slot, i)?;
                let tag = if lz11::is_lz11(blob) { " lz11" } else { "" };
                Ok(format!("{:#X}{}", blob.len(), tag))
            })
            .collect::<romkit_core::Result<Vec<_>>>()?;
        println!("{slot:5}: {}", sizes.join(", "));
    }
    Ok(())
}

fn garc_extract(file: &Path, slot: usize, index: usize, decompress: bool, out: &Path) -> romkit_core::Result<()> {
    let archive = Archive::open(read_file(file))?;
    let bytes = if decompress {
        archive.decompressed_subblob(slot, index)?
    } else {
        archive.get_subblob(slot, index)?
    };
    std::fs::write(out, bytes)?;
    println!("wrote {} bytes to {:?}", bytes.len(), out);
    Ok(())
}

fn repack_check(
    schema: &Path,
    image: &Path,
    variant: &str,
    prefix: &str,
    count: usize,
    format: Format,
) -> romkit_core::Result<()> {
    let store = load_schema(schema);
    let Some(entry) = store.variant(variant) else {
        eprintln!("Schema has no variant named '{variant}'");
        std::process::exit(1);
    };
    let Some(plan) = RepackPlan::from_schema(entry, prefix, count, format.record_format()) else {
        eprintln!("Variant '{variant}' declares no {prefix}TableOffset");
        std::process::exit(1);
    };

    let original = read_file(image);
    let mut flat = FlatImage::new(original.clone(), FlatLayout::GAME_BOY)?;
    let report = repack(&mut flat, &plan, &BTreeMap::new())?;
    debug!("repack report: {:?}", report);

    let changed = flat
        .as_bytes()
        .iter()
        .zip(&original)
        .filter(|(a, b)| a != b)
        .count();
    println!(
        "region {:#X}..{:#X}: {:#X} bytes packed, {:#X} free",
        report.region_start,
        report.region_end,
        report.packed_len,
        report.free_bytes()
    );
    if changed == 0 {
        println!("layout is canonical");
    } else {
        println!("layout differs from canonical in {changed} bytes");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(args.verbose) {
        eprintln!("Failed to initialise logging: {e}");
    }

    let result = match args.command {
        Command::Identify { schema, image } => identify(&schema, &image),
        Command::Crc { file } => {
            println!("{:08X}", compute_checksum(&read_file(&file)));
            Ok(())
        }
        Command::Garc(GarcCommand::List { file }) => garc_list(&file),
        Command::Garc(GarcCommand::Extract {
            file,
            slot,
            index,
            decompress,
            out,
        }) => garc_extract(&file, slot, index, decompress, &out),
        Command::RepackCheck {
            schema,
            image,
            variant,
            prefix,
            count,
            format,
        } => repack_check(&schema, &image, &variant, &prefix, count, format),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
