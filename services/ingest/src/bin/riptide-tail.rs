//! riptide-tail: follow the bus and print records.
//!
//! Inspection tool: attaches an ephemeral consumer to the stream and
//! prints each record's subject, fingerprint identity, and payload.
//! Validates that what is on the wire decodes cleanly, which makes it
//! the first thing to reach for when a downstream table looks wrong.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;

use bus::BusClient;
use config::PipelineConfig;

#[derive(Parser)]
#[command(name = "riptide-tail", about = "Follow and print bus records")]
struct Args {
    /// Pipeline configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Subject filter, e.g. `trade-data.>` or
    /// `orderbook-data.binance_spot.>`. Repeatable; empty means all.
    #[arg(long, short = 's')]
    subject: Vec<String>,

    /// Print raw payloads instead of decoded summaries.
    #[arg(long)]
    raw: bool,

    /// Stop after this many records.
    #[arg(long, short = 'n')]
    limit: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config =
        PipelineConfig::load(args.config.as_deref()).context("configuration rejected")?;

    let bus = BusClient::connect(&config.bus)
        .await
        .context("bus connection failed")?;
    let consumer = bus
        .ephemeral_consumer(args.subject.clone())
        .await
        .context("consumer setup failed")?;
    let mut messages = consumer
        .messages()
        .await
        .map_err(|e| anyhow::anyhow!("message stream: {e}"))?;

    eprintln!(
        "tailing stream {} (filters: {})",
        config.bus.stream,
        if args.subject.is_empty() {
            "all".to_string()
        } else {
            args.subject.join(", ")
        }
    );

    let mut seen = 0u64;
    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                eprintln!("stream error: {e}");
                break;
            }
        };

        if args.raw {
            println!(
                "{} {}",
                message.subject,
                String::from_utf8_lossy(&message.payload)
            );
        } else {
            match codec::decode_record(&message.payload) {
                Ok(record) => println!(
                    "{} {} {}",
                    message.subject,
                    codec::fingerprint(&record),
                    types::time::format_millis(record.timestamp()),
                ),
                Err(e) => println!("{} <undecodable: {e}>", message.subject),
            }
        }
        let _ = message.ack().await;

        seen += 1;
        if args.limit.is_some_and(|limit| seen >= limit) {
            break;
        }
    }
    Ok(())
}
