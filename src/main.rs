use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use athena_rs::ble::{AthenaClient, ClientConfig};
use athena_rs::codec::{scan_buffer, PacketKind};
use athena_rs::protocol::{Command, Preset, EEG_CHANNEL_NAMES, OPTICAL_CHANNEL_NAMES};
use athena_rs::types::DeviceEvent;

#[derive(Parser)]
#[command(name = "athena", version, about = "Stream or inspect Muse S Athena sensor data")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Connect to the first headset found and print readings.
    Stream {
        /// Stream preset sent during the handshake.
        #[arg(long, default_value = "p1045")]
        preset: Preset,
        /// Advertised-name prefix to match.
        #[arg(long, default_value = "Muse")]
        prefix: String,
        /// Seconds to scan before giving up.
        #[arg(long, default_value_t = 15)]
        scan_timeout: u64,
    },
    /// List nearby headsets.
    Devices {
        #[arg(long, default_value = "Muse")]
        prefix: String,
        #[arg(long, default_value_t = 10)]
        scan_timeout: u64,
    },
    /// Decode captured notifications, one hex-encoded notification per line.
    Scan { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=athena_rs=debug shows every skipped tag.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Cmd::Stream {
            preset,
            prefix,
            scan_timeout,
        } => {
            let config = ClientConfig {
                preset,
                name_prefix: prefix,
                scan_timeout_secs: scan_timeout,
                ..ClientConfig::default()
            };
            stream(config).await
        }
        Cmd::Devices {
            prefix,
            scan_timeout,
        } => {
            let config = ClientConfig {
                name_prefix: prefix,
                scan_timeout_secs: scan_timeout,
                ..ClientConfig::default()
            };
            for d in AthenaClient::new(config).scan_all().await? {
                println!("{}  {}", d.name, d.id);
            }
            Ok(())
        }
        Cmd::Scan { file } => scan(&file),
    }
}

// ── Offline scan ──────────────────────────────────────────────────────────────

fn scan(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut totals = std::collections::BTreeMap::<PacketKind, usize>::new();
    let mut lines = 0usize;

    for (n, line) in io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        let hex_str: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if hex_str.is_empty() || hex_str.starts_with('#') {
            continue;
        }
        let bytes = hex::decode(&hex_str).with_context(|| format!("line {}: bad hex", n + 1))?;
        let summary = scan_buffer(&bytes);
        lines += 1;

        let counts: Vec<String> = summary
            .counts
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect();
        println!(
            "#{:<5} len={:<4} entries={:<3} {}",
            n + 1,
            bytes.len(),
            summary.entries.len(),
            counts.join(" ")
        );
        for (kind, count) in summary.counts {
            *totals.entry(kind).or_default() += count;
        }
    }

    println!("── {lines} notification(s) ──");
    for (kind, count) in totals {
        println!("{kind:>12}: {count}");
    }
    Ok(())
}

// ── Live streaming ────────────────────────────────────────────────────────────

async fn stream(config: ClientConfig) -> Result<()> {
    let client = AthenaClient::new(config);

    info!("Connecting to Muse headset …");
    let (mut streams, handle) = client.connect().await?;
    let handle = Arc::new(handle);

    handle.start().await?;
    info!("Streaming started. Type a command + Enter:");
    info!("  q  – quit");
    info!("  p  – pause streaming");
    info!("  r  – resume streaming");
    info!("  i  – request device info");
    info!(
        "  <name> – send a named command ({})",
        Command::names().collect::<Vec<_>>().join(", ")
    );

    // Stdin is read on an OS thread so no StdinLock is held across awaits.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) if line_tx.send(l.trim().to_owned()).is_ok() => {}
                _ => break,
            }
        }
    });

    let handle_cmd = Arc::clone(&handle);
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let res = match line.as_str() {
                "" => continue,
                "q" => {
                    info!("Quit requested.");
                    handle_cmd.stop().await.ok();
                    handle_cmd.disconnect().await.ok();
                    std::process::exit(0);
                }
                "p" => handle_cmd.pause().await,
                "r" => handle_cmd.resume().await,
                "i" => handle_cmd.request_device_info().await,
                name => handle_cmd.command(name).await,
            };
            if let Err(e) = res {
                error!("Command '{line}' failed: {e}");
            }
        }
    });

    let r = &mut streams.readings;
    loop {
        tokio::select! {
            Some(ev) = streams.events.recv() => match ev {
                DeviceEvent::Connected(name) => info!("✅  Connected to: {name}"),
                DeviceEvent::Control(resp) => println!("[CONTROL] {}", resp.raw),
                DeviceEvent::Disconnected => {
                    info!("❌  Disconnected from device.");
                    break;
                }
            },
            Some(e) = r.eeg.recv() => {
                let name = EEG_CHANNEL_NAMES.get(e.electrode).copied().unwrap_or("?");
                println!(
                    "[EEG]   ch={name:5} idx={:3}  ts={:.0} ms  samples={:+8.3} {:+8.3} µV",
                    e.index, e.timestamp, e.samples[0], e.samples[1]
                );
            }
            Some(s) = r.imu.recv() => {
                println!(
                    "[IMU]   idx={:3}  ts={:.0} ms  acc=({:+.4},{:+.4},{:+.4}) g  gyro=({:+.3},{:+.3},{:+.3}) °/s",
                    s.index, s.timestamp, s.accel.x, s.accel.y, s.accel.z, s.gyro.x, s.gyro.y, s.gyro.z
                );
            }
            Some(o) = r.optical.recv() => {
                let values: Vec<String> = OPTICAL_CHANNEL_NAMES
                    .iter()
                    .zip(o.samples)
                    .map(|(name, v)| format!("{name}={v:.5}"))
                    .collect();
                println!(
                    "[OPT]   s={} idx={:3}  ts={:.0} ms  {}",
                    o.channel, o.index, o.timestamp, values.join(" ")
                );
            }
            Some(p) = r.power.recv() => {
                println!("[POWER] ts={:.0} ms  raw={:?}", p.timestamp, p.values);
            }
            else => break,
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
