//! Spatial audio relay mixer

use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;

use spatial_relay::{App, MixerConfig, RunOptions};

/// Mixes participant audio into a spatialized stereo frame for every listener
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Address to send mixes from, overriding the configuration
    #[clap(short, long)]
    bind: Option<SocketAddr>,

    /// Mix this many synthetic tone sessions instead of serving clients
    #[clap(long, default_value_t = 0)]
    demo_sources: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
        debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("Starting spatial relay mixer");

    let config = MixerConfig::load(args.config.as_deref())?;
    let app = App::new(config)?;

    let stop = app.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, finishing the current frame"),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
        stop.stop();
    });

    let frames = app
        .run(RunOptions {
            bind: args.bind,
            demo_sources: args.demo_sources,
        })
        .await?;

    info!("Mixed {} frames, exiting", frames);
    Ok(())
}
