mod config;
#[cfg(feature = "ble")]
mod device;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use amiitag_lib::catalog::{Catalog, artwork_path};
use amiitag_lib::keys::{KEY_FILE_SIZE, sha256_hex};
use amiitag_lib::signature::{UidSignaturePair, UidSignatureTable};
use amiitag_lib::{FigureId, KeySet, PatchEngine, TagImage, Uid};

use config::{CliConfig, parse_digest};

/// Inspect, decrypt and re-key NTAG215 figure dumps.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML file with key, catalog and signature table locations.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Master key file (160 bytes).
    #[arg(short, long, global = true)]
    keys: Option<PathBuf>,
    /// Expected SHA-256 of the key file, hex.
    #[arg(long, global = true)]
    keys_sha256: Option<String>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what a dump contains.
    Info {
        file: PathBuf,
        /// Catalog JSON for figure names.
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Directory holding figure artwork.
        #[arg(long)]
        artwork: Option<PathBuf>,
    },
    /// Write the decrypted dump.
    Decrypt { input: PathBuf, output: PathBuf },
    /// Move a figure onto another uid.
    Patch {
        input: PathBuf,
        output: PathBuf,
        /// Target uid, 18 hex digits.
        #[arg(long)]
        uid: String,
        /// The input is already decrypted.
        #[arg(long)]
        plain: bool,
    },
    /// Build a fresh figure from its id.
    Synthesize {
        /// Figure id, 16 hex digits.
        figure_id: String,
        output: PathBuf,
        /// Uid to use instead of a random one.
        #[arg(long)]
        uid: Option<String>,
    },
    /// Move a figure onto a genuine uid from a signature table.
    Randomize {
        input: PathBuf,
        output: PathBuf,
        /// Signature table; a random uid is used without one.
        #[arg(long)]
        signatures: Option<PathBuf>,
    },
    /// Add the uid and signature of full dumps to a signature table.
    Collect {
        table: PathBuf,
        #[arg(required = true)]
        dumps: Vec<PathBuf>,
    },
    /// Check a key file and print its digest.
    Keys,
    /// Look up figures in the catalog.
    Catalog {
        /// Figure id, or a 4-digit character id with `--character`.
        id: String,
        #[arg(long)]
        character: bool,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// List the catalogued figures found in a directory of dumps.
    Index {
        dir: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Talk to a puck over Bluetooth.
    #[cfg(feature = "ble")]
    Device {
        /// Puck name, when several are in range.
        #[arg(long)]
        name: Option<String>,
        #[command(subcommand)]
        command: device::DeviceCommand,
    },
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

/// Resolved settings: flags first, then the config file.
struct Settings {
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    session: amiitag_lib::SessionConfig,
    keys: Option<PathBuf>,
    keys_sha256: Option<String>,
    catalog: Option<PathBuf>,
    signatures: Option<PathBuf>,
}

impl Settings {
    fn new(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => CliConfig::load(path)?,
            None => CliConfig::default(),
        };
        Ok(Self {
            session: file.session,
            keys: cli.keys.clone().or(file.keys.path),
            keys_sha256: cli.keys_sha256.clone().or(file.keys.sha256),
            catalog: file.catalog,
            signatures: file.signatures,
        })
    }

    fn load_keys(&self) -> Result<KeySet> {
        let Some(path) = &self.keys else {
            bail!("No key file given; pass --keys or set [keys] path in the config");
        };
        let digest = self.keys_sha256.as_deref().map(parse_digest).transpose()?;
        if digest.is_none() {
            warn!("No key digest configured, only checking the file structure");
        }
        KeySet::from_file(path, digest.as_ref()).with_context(|| format!("Failed to load keys from {:?}", path))
    }

    /// Keys when configured; their absence is not an error.
    fn optional_keys(&self) -> Result<Option<KeySet>> {
        match self.keys {
            Some(_) => self.load_keys().map(Some),
            None => Ok(None),
        }
    }

    fn load_catalog(&self, flag: Option<&PathBuf>) -> Result<Option<Catalog>> {
        match flag.or(self.catalog.as_ref()) {
            Some(path) => Catalog::from_file(path)
                .map(Some)
                .with_context(|| format!("Failed to load catalog {:?}", path)),
            None => Ok(None),
        }
    }

    fn require_catalog(&self, flag: Option<&PathBuf>) -> Result<Catalog> {
        self.load_catalog(flag)?
            .context("No catalog given; pass --catalog or set catalog in the config")
    }
}

fn read_image(path: &Path) -> Result<TagImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    TagImage::load(&bytes).with_context(|| format!("{:?} is not a tag dump", path))
}

fn write_image(path: &Path, image: &TagImage) -> Result<()> {
    std::fs::write(path, image.to_file_bytes()).with_context(|| format!("Failed to write {:?}", path))?;
    info!("Wrote {} bytes to {:?}", image.size_class().len(), path);
    Ok(())
}

fn parse_uid(hex: &str) -> Result<Uid> {
    Uid::from_hex(hex).with_context(|| format!("{hex} is not a valid uid"))
}

fn parse_figure_id(hex: &str) -> Result<FigureId> {
    FigureId::from_hex(hex).with_context(|| format!("{hex} is not a valid figure id"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(&cli).await {
        error!("{:?}", e);
        drop(guard);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let settings = Settings::new(cli)?;
    let engine = PatchEngine::new();

    match &cli.command {
        Command::Info { file, catalog, artwork } => {
            let image = read_image(file)?;
            let catalog = settings.load_catalog(catalog.as_ref())?;
            let keys = settings.optional_keys()?;
            show_info(&engine, &image, keys.as_ref(), catalog.as_ref(), artwork.as_deref())
        }
        Command::Decrypt { input, output } => {
            let image = read_image(input)?;
            let plain = engine
                .decrypt(&image, Some(&settings.load_keys()?))
                .with_context(|| format!("Failed to decrypt {:?}", input))?;
            write_image(output, plain.as_image())
        }
        Command::Patch {
            input,
            output,
            uid,
            plain,
        } => {
            let uid = parse_uid(uid)?;
            let image = read_image(input)?;
            let patched = engine
                .patch(&image, uid.as_bytes(), Some(&settings.load_keys()?), *plain)
                .with_context(|| format!("Failed to patch {:?}", input))?;
            info!("Patched {} onto {}", image.figure_id(), uid);
            write_image(output, &patched)
        }
        Command::Synthesize { figure_id, output, uid } => {
            let figure_id = parse_figure_id(figure_id)?;
            let uid = uid.as_deref().map(parse_uid).transpose()?;
            let image = engine.synthesize(figure_id, uid, Some(&settings.load_keys()?))?;
            info!("Synthesized {} on {}", figure_id, image.uid()?);
            write_image(output, &image)
        }
        Command::Randomize {
            input,
            output,
            signatures,
        } => {
            let table = match signatures.as_ref().or(settings.signatures.as_ref()) {
                Some(path) => {
                    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
                    UidSignatureTable::from_bytes(&bytes)
                }
                None => UidSignatureTable::new(),
            };
            info!("Signature table holds {} pairs", table.len());
            let image = read_image(input)?;
            let patched = engine.randomize_uid(&image, Some(&settings.load_keys()?), &table)?;
            info!("Moved {} onto {}", image.figure_id(), patched.uid()?);
            write_image(output, &patched)
        }
        Command::Collect { table, dumps } => collect_signatures(table, dumps),
        Command::Keys => {
            let path = settings.keys.as_ref().context("No key file given")?;
            let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
            println!("File:    {}", path.display());
            println!("Size:    {} bytes (expected {})", bytes.len(), KEY_FILE_SIZE);
            println!("SHA-256: {}", sha256_hex(&bytes));
            let keys = settings.load_keys()?;
            println!("Data key: {}", keys.data.name());
            println!("Tag key:  {}", keys.tag.name());
            Ok(())
        }
        Command::Catalog { id, character, catalog } => {
            let catalog = settings.require_catalog(catalog.as_ref())?;
            if *character {
                for (figure_id, entry) in catalog.figures_for_character(id) {
                    println!("{}  {}", figure_id, entry.name);
                }
                return Ok(());
            }
            let figure_id = parse_figure_id(id)?;
            let entry = catalog.figure(&figure_id).context("Figure is not in the catalog")?;
            println!("Name:         {}", entry.name);
            print_opt("Character:", catalog.character_name(&figure_id));
            print_opt("Game series:", catalog.game_series_name(&figure_id));
            print_opt("Series:", catalog.amiibo_series_name(&figure_id));
            print_opt("Type:", catalog.type_name(&figure_id));
            let mut releases: Vec<_> = entry.release.iter().collect();
            releases.sort();
            for (region, date) in releases {
                println!("Release {:<5} {}", format!("{region}:"), date.as_deref().unwrap_or("-"));
            }
            Ok(())
        }
        Command::Index { dir, catalog } => {
            let catalog = settings.require_catalog(catalog.as_ref())?;
            let index = catalog.index_dumps(dir)?;
            for (figure_id, path) in &index {
                let name = catalog.figure_name(figure_id).unwrap_or("?");
                println!("{}  {:<40} {}", figure_id, name, path.display());
            }
            info!("{} of {} catalogued figures found", index.len(), catalog.len());
            Ok(())
        }
        #[cfg(feature = "ble")]
        Command::Device { name, command } => {
            let keys = settings.optional_keys()?;
            let catalog = settings.load_catalog(None)?;
            device::run(command, name.as_deref(), &settings.session, keys.as_ref(), catalog.as_ref()).await
        }
    }
}

fn print_opt(label: &str, value: Option<&str>) {
    if let Some(value) = value {
        println!("{label:<13} {value}");
    }
}

fn show_info(
    engine: &PatchEngine,
    image: &TagImage,
    keys: Option<&KeySet>,
    catalog: Option<&Catalog>,
    artwork: Option<&Path>,
) -> Result<()> {
    let figure_id = image.figure_id();
    println!("Size:          {} bytes", image.size_class().len());
    match image.uid() {
        Ok(uid) => println!("UID:           {}", uid),
        Err(_) => println!("UID:           {} (bad check bytes)", hex::encode(image.uid_bytes())),
    }
    println!("Figure:        {}", figure_id);
    println!("Write counter: {}", image.write_counter());
    println!("Locked:        {}", image.is_locked());
    if !image.is_plausible() {
        warn!("Dump does not look like a figure");
    }
    if image.signature().is_some_and(|s| s.iter().any(|&b| b != 0)) {
        println!("Signature:     present");
    }

    let decrypted = match keys {
        Some(keys) => match engine.decrypt(image, Some(keys)) {
            Ok(plain) => Some(plain),
            Err(e) => {
                warn!("Could not decrypt: {}", e);
                None
            }
        },
        None => None,
    };
    if let Some(plain) = &decrypted {
        println!("Nickname:      {}", plain.nickname());
        println!("Modified:      {} times", plain.modified_counter());
        match plain.known_app() {
            Some(app) => println!("App:           {}", app),
            None if plain.has_app_data() => println!("App:           {:08x}", plain.app_id()),
            None => println!("App:           none"),
        }
    }

    if let Some(catalog) = catalog {
        println!("Name:          {}", catalog.display_name(image, decrypted.as_ref()));
        print_opt("Game series:", catalog.game_series_name(&figure_id));
    }
    if let Some(path) = artwork.and_then(|dir| artwork_path(dir, &figure_id)) {
        println!("Artwork:       {}", path.display());
    }
    Ok(())
}

fn collect_signatures(table_path: &Path, dumps: &[PathBuf]) -> Result<()> {
    let mut table = match std::fs::read(table_path) {
        Ok(bytes) => UidSignatureTable::from_bytes(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => UidSignatureTable::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", table_path)),
    };
    let before = table.len();
    for path in dumps {
        let image = read_image(path)?;
        match UidSignaturePair::from_image(&image) {
            Some(pair) if pair.signature.iter().any(|&b| b != 0) => {
                if !table.insert(pair) {
                    info!("{} is already in the table", pair.uid);
                }
            }
            _ => warn!("{:?} carries no usable signature", path),
        }
    }
    std::fs::write(table_path, table.to_bytes()).with_context(|| format!("Failed to write {:?}", table_path))?;
    info!("Added {} pairs, table now holds {}", table.len() - before, table.len());
    Ok(())
}
