use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};

use divepull::{
    atomics, ble, cochran, diverite, eonsteel, mares_icon, mares_puck, oceanic, seac, shearwater,
    summarize, suunto, template, Context, Device, DiveData, Event, Family,
};

#[derive(Parser)]
#[command(name = "divepull")]
#[command(about = "Download and decode dive logs from recreational dive computers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for supported BLE dive computers
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Connect to the first found device and enumerate its GATT services
        #[arg(short, long)]
        enumerate: bool,
    },

    /// Connect and print device identity (model, firmware, serial)
    Info {
        /// Device family
        #[arg(short, long)]
        family: Family,

        /// BLE device address. If omitted, connects to the first device found.
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Download dive logs from the device
    Download {
        /// Device family
        #[arg(short, long)]
        family: Family,

        /// BLE device address. If omitted, connects to the first device found.
        #[arg(short, long)]
        address: Option<String>,

        /// Fingerprint of the newest dive already downloaded, as hex
        #[arg(long)]
        fingerprint: Option<String>,

        /// Filename template for raw blobs (%t timestamp, %f fingerprint,
        /// %n counter, %% literal percent)
        #[arg(long, default_value = "dive-%n-%t-%f.bin")]
        template: String,

        /// Directory for raw blobs
        #[arg(long)]
        raw_dir: Option<PathBuf>,

        /// Output file for the parsed summary
        #[arg(short, long, default_value = "dives.json")]
        output: PathBuf,
    },

    /// Parse a previously downloaded raw dive blob (offline)
    Parse {
        /// Device family
        #[arg(short, long)]
        family: Family,

        /// Raw dive blob
        #[arg(short, long)]
        input: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "dives.json")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scan { timeout, enumerate } => cmd_scan(timeout, enumerate),
        Commands::Info { family, address } => cmd_info(family, address),
        Commands::Download {
            family,
            address,
            fingerprint,
            template,
            raw_dir,
            output,
        } => cmd_download(family, address, fingerprint, template, raw_dir, output),
        Commands::Parse {
            family,
            input,
            output,
        } => cmd_parse(family, input, output),
    };

    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        // Library errors map one-to-one onto exit codes.
        let code = err
            .downcast_ref::<divepull::Error>()
            .map(divepull::Error::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

// ── Scan ──

fn cmd_scan(timeout_secs: u64, enumerate: bool) -> Result<()> {
    let adapter = ble::default_adapter().context("No BLE adapter")?;
    eprintln!("Scanning for dive computers ({timeout_secs}s)...");
    let devices = ble::scan(&adapter, Duration::from_secs(timeout_secs))?;

    if devices.is_empty() {
        eprintln!("No dive computers found. Make sure the device is in Bluetooth mode.");
        return Ok(());
    }
    for (i, dev) in devices.iter().enumerate() {
        println!(
            "  [{}] {} - {} (RSSI: {})",
            i,
            dev.name,
            dev.address,
            dev.rssi
                .map(|r| format!("{r} dBm"))
                .unwrap_or_else(|| "?".into())
        );
    }

    if enumerate {
        let dev = &devices[0];
        eprintln!("\nConnecting to {}...", dev.name);
        let services = ble::enumerate_gatt(&dev.peripheral)?;

        println!("\nGATT Profile for {}:", dev.name);
        for svc in &services {
            println!("  Service: {}", svc.uuid);
            for c in &svc.characteristics {
                println!("    Characteristic: {} [{}]", c.uuid, c.properties);
            }
        }
    }

    Ok(())
}

// ── Info ──

fn connect(address: Option<&str>) -> Result<ble::BleTransport> {
    let adapter = ble::default_adapter().context("No BLE adapter")?;
    eprintln!("Scanning for dive computers...");
    let devices = ble::scan(&adapter, Duration::from_secs(10))?;
    if devices.is_empty() {
        anyhow::bail!("No dive computers found");
    }

    let device = if let Some(addr) = address {
        let addr_upper = addr.to_uppercase();
        devices
            .into_iter()
            .find(|d| d.address.to_uppercase() == addr_upper)
            .with_context(|| format!("Device with address {addr} not found"))?
    } else {
        eprintln!("Connecting to first device: {}", devices[0].name);
        devices.into_iter().next().unwrap()
    };

    Ok(ble::BleTransport::connect(&device.peripheral, None, None)?)
}

fn open_device<'a>(
    family: Family,
    port: ble::BleTransport,
    ctx: &'a Context,
) -> Result<Box<dyn Device + 'a>> {
    Ok(divepull::open_family(family, port, ctx)?)
}

fn cmd_info(family: Family, address: Option<String>) -> Result<()> {
    let ctx = Context::new();
    ctx.set_event_sink(|event| {
        if let Event::DeviceInfo {
            model,
            firmware,
            serial,
        } = event
        {
            println!("Device Info:");
            println!("  Model:    {model:#06x}");
            println!("  Firmware: {firmware}");
            println!("  Serial:   {serial}");
        }
    });

    let port = connect(address.as_deref())?;
    let mut device = open_device(family, port, &ctx)?;
    // Stop at the first dive: identification happens before any download.
    device.foreach(&mut |_, _| false)?;
    Ok(())
}

// ── Download ──

fn cmd_download(
    family: Family,
    address: Option<String>,
    fingerprint: Option<String>,
    template_str: String,
    raw_dir: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let ctx = Context::new();
    ctx.set_event_sink(|event| match event {
        Event::Waiting => eprintln!("Waiting for device..."),
        Event::Progress { current, maximum } => {
            eprint!("\rDownloading... {current}/{maximum}");
        }
        Event::DeviceInfo {
            model,
            firmware,
            serial,
        } => {
            eprintln!("Connected: model {model:#06x}, firmware {firmware}, serial {serial}");
        }
        _ => {}
    });

    let watermark = match fingerprint {
        Some(hex) => divepull::codec::hex2bin(hex.as_bytes())
            .context("Invalid --fingerprint hex string")?,
        None => Vec::new(),
    };

    let port = connect(address.as_deref())?;
    let mut device = open_device(family, port, &ctx)?;
    device.set_fingerprint(&watermark);

    let mut blobs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    device.foreach(&mut |blob, fp| {
        blobs.push((blob.to_vec(), fp.to_vec()));
        true
    })?;
    eprintln!();
    eprintln!("Downloaded {} dive(s)", blobs.len());

    let mut dives = Vec::new();
    for (counter, (blob, fp)) in blobs.iter().enumerate() {
        let number = blobs.len() as u32 - counter as u32; // newest has the highest number
        match parse_summary(family, blob, number) {
            Ok(summary) => {
                if let Some(ref dir) = raw_dir {
                    std::fs::create_dir_all(dir)?;
                    let name =
                        template::expand(&template_str, &summary.datetime, fp, counter as u32);
                    std::fs::write(dir.join(name), blob)?;
                }
                eprintln!(
                    "  Dive #{}: {} | {:.1}m | {}s | {} samples",
                    summary.number,
                    summary.datetime.format("%Y-%m-%d %H:%M"),
                    summary.max_depth_m,
                    summary.duration_seconds,
                    summary.samples.len(),
                );
                dives.push(summary);
            }
            Err(e) => {
                eprintln!("  Dive {counter}: parse error: {e}");
            }
        }
    }

    dives.sort_by_key(|d| d.number);
    let data = DiveData { dives };
    let json = serde_json::to_string_pretty(&data)?;
    std::fs::write(&output, &json)?;
    eprintln!("Dive data saved to {} ({} dives)", output.display(), data.dives.len());
    Ok(())
}

// ── Parse (offline) ──

fn cmd_parse(family: Family, input: PathBuf, output: PathBuf) -> Result<()> {
    let blob = std::fs::read(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let summary = parse_summary(family, &blob, 1)?;

    eprintln!(
        "  Dive #{}: {} | {:.1}m | {}s | {} samples",
        summary.number,
        summary.datetime.format("%Y-%m-%d %H:%M"),
        summary.max_depth_m,
        summary.duration_seconds,
        summary.samples.len(),
    );

    let data = DiveData {
        dives: vec![summary],
    };
    let json = serde_json::to_string_pretty(&data)?;
    std::fs::write(&output, &json)?;
    eprintln!("Dive data saved to {}", output.display());
    Ok(())
}

/// Build the family's parser over the blob and flatten it.
fn parse_summary(
    family: Family,
    blob: &[u8],
    number: u32,
) -> Result<divepull::DiveSummary> {
    let summary = match family {
        Family::Suunto => summarize(&mut suunto::SuuntoParser::new(blob)?, number)?,
        Family::SuuntoEonSteel => summarize(&mut eonsteel::EonSteelParser::new(blob)?, number)?,
        Family::MaresIconHd => summarize(&mut mares_icon::MaresIconParser::new(blob)?, number)?,
        Family::MaresPuck => summarize(&mut mares_puck::MaresPuckParser::new(blob)?, number)?,
        Family::AtomicsCobalt => summarize(&mut atomics::CobaltParser::new(blob)?, number)?,
        Family::Oceanic => summarize(
            &mut oceanic::OceanicParser::new(blob, oceanic::OceanicModel::Atom2)?,
            number,
        )?,
        Family::Shearwater => summarize(&mut shearwater::ShearwaterParser::new(blob)?, number)?,
        Family::CochranCommander => summarize(&mut cochran::CochranParser::new(blob)?, number)?,
        Family::DiveriteNitekq => summarize(&mut diverite::NitekqParser::new(blob)?, number)?,
        Family::SeacScreen => summarize(&mut seac::SeacParser::new(blob)?, number)?,
    };
    Ok(summary)
}
