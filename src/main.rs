mod backends;
mod error;
mod params;
mod parse;
mod plan;
mod shaper;
mod status;
mod topology;

use anyhow::{Result, anyhow};
use clap::Parser;

use crate::backends::TcCommandBackend;
use crate::shaper::{Shaper, ShaperConfig};

/// fairshaper - bound upload/download bandwidth with low-latency fair queueing
#[derive(Parser, Debug)]
#[command(name = "fairshaper")]
#[command(version)]
#[command(about = "Bound upload/download bandwidth on a Linux interface with HTB + FQ-CoDel", long_about = None)]
struct Args {
    /// Network interface to configure (auto-detected when omitted)
    #[arg(short = 'a', long, value_name = "IFACE")]
    interface: Option<String>,

    /// Upload limit, e.g. "30", "2.5m", "800k" (plain numbers are mbit/s)
    #[arg(short, long, value_name = "RATE")]
    upload: Option<String>,

    /// Download limit, same format as --upload
    #[arg(short, long, value_name = "RATE")]
    download: Option<String>,

    /// Redirect (ifb) interface for download shaping; without it downloads
    /// are policed instead
    #[arg(short = 'r', long, value_name = "IFACE")]
    redirect: Option<String>,

    /// Marked egress classes: "mark:rate[:ceil[:prio]],..."
    #[arg(long, value_name = "SPEC")]
    classes: Option<String>,

    /// Remove all shaping from the interface and exit
    #[arg(short, long)]
    clear: bool,

    /// Print inspection output as JSON
    #[arg(long)]
    json: bool,
}

/// Pick the primary network interface: prefer one that is up, not loopback,
/// and carries an IPv4 address.
fn detect_interface() -> Result<String> {
    let interfaces = pnet_datalink::interfaces();

    if let Some(iface) = interfaces.iter().find(|iface| {
        iface.is_up() && !iface.is_loopback() && iface.ips.iter().any(|ip| ip.is_ipv4())
    }) {
        log::debug!("auto-detected interface {}", iface.name);
        return Ok(iface.name.clone());
    }

    // Fallback: anything with an address at all, even IPv6-only.
    if let Some(iface) = interfaces
        .into_iter()
        .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
    {
        log::warn!("no IPv4 interface found, using {}", iface.name);
        return Ok(iface.name);
    }

    Err(anyhow!("no suitable network interface found; use --interface"))
}

fn run(args: &Args) -> Result<()> {
    let interface = match &args.interface {
        Some(name) => name.clone(),
        None => detect_interface()?,
    };

    let cfg = ShaperConfig {
        interface,
        upload: args.upload.as_deref().map(parse::parse_rate).transpose()?,
        download: args.download.as_deref().map(parse::parse_rate).transpose()?,
        redirect: args.redirect.clone(),
        classes: args
            .classes
            .as_deref()
            .map(parse::parse_classes)
            .transpose()?
            .unwrap_or_default(),
        clear: args.clear,
    };

    let backend = TcCommandBackend::new();
    if let Some(status) = Shaper::new(&backend).run(&cfg)? {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print!("{status}");
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    // Single error boundary: anything fatal lands here, once.
    if let Err(err) = run(&args) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
