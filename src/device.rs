//! Commands that talk to pucks over Bluetooth.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use amiitag_lib::catalog::Catalog;
use amiitag_lib::device::TransferProgress;
use amiitag_lib::registry::DeviceRegistry;
use amiitag_lib::transport::{BleChannel, TransportChannel};
use amiitag_lib::{DeviceSession, KeySet, SessionConfig, TagImage};

#[derive(Subcommand, Debug)]
pub enum DeviceCommand {
    /// List pucks in range.
    Scan,
    /// List the slots of a puck.
    Slots,
    /// Save the image in a slot to a file.
    Download { slot: u8, output: PathBuf },
    /// Upload a dump into a slot.
    Upload {
        slot: u8,
        input: PathBuf,
        /// Make the slot active afterwards.
        #[arg(long)]
        activate: bool,
    },
    /// Blank a slot.
    Clear { slot: u8 },
    /// Rename the puck.
    Rename { name: String },
}

/// Scan and register every puck found.
async fn discover(config: &SessionConfig, scan_time: Duration) -> Result<DeviceRegistry<BleChannel>> {
    let adapter = BleChannel::default_adapter().await?;
    let mut registry = DeviceRegistry::new();
    for (i, channel) in BleChannel::scan(&adapter, scan_time).await?.into_iter().enumerate() {
        let name = channel.peer_name().unwrap_or_else(|| format!("Puck {}", i + 1));
        if registry.insert(name.clone(), DeviceSession::new(channel, config.clone())).is_some() {
            warn!("Two pucks advertise as {}", name);
        }
    }
    Ok(registry)
}

fn pick(registry: &DeviceRegistry<BleChannel>, name: Option<&str>) -> Result<Arc<DeviceSession<BleChannel>>> {
    let names = registry.names();
    let name = match name {
        Some(name) => name.to_string(),
        None => match names.as_slice() {
            [only] => only.clone(),
            [] => bail!("No puck found"),
            _ => bail!("Several pucks found, pick one with --device: {}", names.join(", ")),
        },
    };
    registry.get(&name).with_context(|| format!("No puck named {name}"))
}

fn log_progress(p: TransferProgress) {
    debug!("Slot {}: {}/{} bytes", p.slot, p.done, p.total);
}

pub async fn run(
    command: &DeviceCommand,
    device: Option<&str>,
    config: &SessionConfig,
    keys: Option<&KeySet>,
    catalog: Option<&Catalog>,
) -> Result<()> {
    let registry = discover(config, Duration::from_secs(3)).await?;

    if let DeviceCommand::Scan = command {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    let session = pick(&registry, device)?;
    let info = session.connect(keys).await.context("Handshake failed")?;
    info!(
        "{}: protocol {}, packet size {}",
        session.display_name().await,
        info.version,
        info.packet_size
    );

    let result = execute(command, &session, catalog).await;

    registry.disconnect_all().await;
    result
}

async fn execute(
    command: &DeviceCommand,
    session: &DeviceSession<BleChannel>,
    catalog: Option<&Catalog>,
) -> Result<()> {
    match command {
        DeviceCommand::Scan => {}
        DeviceCommand::Slots => {
            let (summary, slots) = session.read_all_slot_info(|_| {}).await?;
            for slot in slots {
                let marker = if slot.slot == summary.current { "*" } else { " " };
                let name = match catalog {
                    _ if slot.is_empty() => "(empty)".to_string(),
                    Some(catalog) => catalog.display_name(&slot.image, None),
                    None => slot.display_id(),
                };
                println!("{marker}{:>3}  {}", slot.slot, name);
            }
        }
        DeviceCommand::Download { slot, output } => {
            let image = session.read_image(*slot).await?;
            std::fs::write(output, image.to_file_bytes()).with_context(|| format!("Failed to write {:?}", output))?;
            info!("Saved slot {} to {:?}", slot, output);
        }
        DeviceCommand::Upload { slot, input, activate } => {
            let bytes = std::fs::read(input).with_context(|| format!("Failed to read {:?}", input))?;
            let image = TagImage::load(&bytes)?;
            let written = session.write_image(*slot, &image, log_progress).await?;
            info!("Slot {} now holds {}", written.slot, written.display_id());
            if *activate {
                session.change_slot(Some(*slot)).await?;
            }
        }
        DeviceCommand::Clear { slot } => {
            let uid = session.clear_slot(*slot).await?;
            info!("Cleared slot {}, new uid {}", slot, uid);
        }
        DeviceCommand::Rename { name } => {
            session.set_name(name).await?;
            info!("Renamed to {}", name);
        }
    }
    Ok(())
}
