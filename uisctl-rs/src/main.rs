/* uisctl CLI: clap-driven client that talks to uisd over its control socket to list
 * devices, inspect their report trees, watch item values live, send output reports,
 * and exercise dev-hook test devices. */
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use uisctl::client::{TYPE_FEATURE, TYPE_INPUT, TYPE_OUTPUT};
use uisctl::{EventPort, UisClient, UisDevice, UisRoster};

/// uisctl — inspect and drive devices exposed by the uisd input service.
#[derive(Parser)]
#[command(name = "uisctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices.
    List,

    /// Show a device's report and item tree.
    Info {
        /// Device id (from `uisctl list`) or name.
        device: String,
    },

    /// Subscribe to an item and print its value changes.
    Watch {
        /// Device id or name.
        device: String,
        /// Usage page of the item (decimal or 0x-prefixed hex).
        page: String,
        /// Usage id of the item (decimal or 0x-prefixed hex).
        id: String,
        /// Stop after this many events (0 = run until interrupted).
        #[arg(long, default_value_t = 0)]
        count: u32,
    },

    /// Send values on an output or feature report.
    Send {
        /// Device id or name.
        device: String,
        /// index=value pairs, e.g. `0=1.0 2=0.5`.
        values: Vec<String>,
        /// Report type: "output" or "feature".
        #[arg(long, default_value = "output")]
        kind: String,
        /// Report index within the chosen type.
        #[arg(long, default_value_t = 0)]
        report: i32,
    },

    /// Dev-hooks test commands (requires a daemon built with dev-hooks).
    #[command(subcommand)]
    Test(TestCmd),
}

#[derive(Subcommand)]
enum TestCmd {
    /// Inject a synthetic device from a JSON spec.
    Load {
        /// Inline JSON spec; an empty spec makes a minimal gamepad.
        #[arg(default_value = "")]
        spec: String,
    },
    /// Remove all injected test devices.
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = UisClient::connect()?;

    match cli.command {
        Commands::List => cmd_list(client),
        Commands::Info { device } => {
            let device = resolve_device(&client, &device)?;
            cmd_info(&device)
        }
        Commands::Watch {
            device,
            page,
            id,
            count,
        } => {
            let device = resolve_device(&client, &device)?;
            cmd_watch(&client, &device, &page, &id, count)
        }
        Commands::Send {
            device,
            values,
            kind,
            report,
        } => {
            let device = resolve_device(&client, &device)?;
            cmd_send(&device, &kind, report, &values)
        }
        Commands::Test(TestCmd::Load { spec }) => {
            let id = client.load_test_device(&spec)?;
            println!("Loaded test device {id}");
            Ok(())
        }
        Commands::Test(TestCmd::Reset) => {
            client.reset_test_devices()?;
            println!("Test devices removed");
            Ok(())
        }
    }
}

/* Resolve a device specifier: a numeric service id first, a device name otherwise. */
fn resolve_device(client: &Arc<UisClient>, spec: &str) -> Result<UisDevice> {
    if let Ok(id) = spec.parse::<i32>() {
        return UisDevice::open(Arc::clone(client), id)
            .with_context(|| format!("No device with id {id}"));
    }
    UisRoster::find_by_name(Arc::clone(client), spec)?
        .with_context(|| format!("No device named '{spec}'"))
}

fn cmd_list(client: Arc<UisClient>) -> Result<()> {
    let mut roster = UisRoster::new(client);
    let mut any = false;
    while let Some(device) = roster.next_device()? {
        any = true;
        println!(
            "{:4}  {:30}  usage {:04x}:{:04x}  {}i/{}o/{}f  {}",
            device.device(),
            device.name(),
            device.usage_page(),
            device.usage_id(),
            device.count_reports(TYPE_INPUT),
            device.count_reports(TYPE_OUTPUT),
            device.count_reports(TYPE_FEATURE),
            device.path(),
        );
    }
    if !any {
        println!("No devices");
    }
    Ok(())
}

fn cmd_info(device: &UisDevice) -> Result<()> {
    println!("Device {}: {}", device.device(), device.name());
    println!("  Path:  {}", device.path());
    println!(
        "  Usage: {:04x}:{:04x}",
        device.usage_page(),
        device.usage_id()
    );

    for (kind, label) in [
        (TYPE_INPUT, "input"),
        (TYPE_OUTPUT, "output"),
        (TYPE_FEATURE, "feature"),
    ] {
        for index in 0..device.count_reports(kind) {
            let report = device.report_at(kind, index)?;
            println!("  {} report {} ({} items):", label, index, report.count_items());
            for item in 0..report.count_items() {
                let item = report.item_at(item)?;
                println!(
                    "    item usage {:04x}:{:04x}{}  value {}",
                    item.usage_page(),
                    item.usage_id(),
                    if item.is_relative() { " (relative)" } else { "" },
                    item.value(),
                );
            }
        }
    }
    Ok(())
}

fn cmd_watch(
    client: &Arc<UisClient>,
    device: &UisDevice,
    page: &str,
    id: &str,
    count: u32,
) -> Result<()> {
    let page = parse_u16(page).context("Bad usage page")?;
    let id = parse_u16(id).context("Bad usage id")?;

    let mut item = device
        .find_item(page, id)?
        .with_context(|| format!("No input item with usage {page:#06x}:{id:#06x}"))?;

    let port = EventPort::bind(client.config())?;
    port.set_timeout(None)?;
    item.set_target(&port, 1)?;
    println!(
        "Watching {} usage {:04x}:{:04x}, starting value {}",
        device.name(),
        page,
        id,
        item.value()
    );

    let mut seen = 0u32;
    while count == 0 || seen < count {
        let event = port.recv()?;
        println!("value {}", event.value);
        seen += 1;
    }

    item.clear_target()?;
    Ok(())
}

fn cmd_send(device: &UisDevice, kind: &str, index: i32, values: &[String]) -> Result<()> {
    let kind = match kind {
        "output" => TYPE_OUTPUT,
        "feature" => TYPE_FEATURE,
        other => bail!("Unknown report type '{other}' (expected output or feature)"),
    };
    if values.is_empty() {
        bail!("Nothing to send; pass index=value pairs");
    }

    let mut report = device.report_at(kind, index)?;
    for pair in values {
        let (item, value) = pair
            .split_once('=')
            .with_context(|| format!("Bad value '{pair}' (expected index=value)"))?;
        let item: i32 = item.parse().with_context(|| format!("Bad index in '{pair}'"))?;
        let value: f32 = value.parse().with_context(|| format!("Bad value in '{pair}'"))?;
        report.set_item_value(item, value)?;
    }
    report.send()?;
    println!("Sent");
    Ok(())
}

fn parse_u16(text: &str) -> Result<u16> {
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.with_context(|| format!("Cannot parse '{text}'"))
}
