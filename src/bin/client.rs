use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use rcping::bench::{Bench, BenchReport};
use rcping::BenchConfig;

/// RDMA CM point-to-point latency benchmark client.
#[derive(Parser, Debug)]
#[command(name = "rcping-client", about = "RDMA CM point-to-point latency benchmark client")]
struct Args {
    /// Server address to connect to.
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Server port number.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Number of sends to post (1 = single timed round trip).
    #[arg(short = 'n', long)]
    iters: Option<usize>,

    /// Message length in bytes.
    #[arg(short = 'm', long)]
    msg_len: Option<usize>,

    /// TOML configuration file; flags override its values.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<BenchConfig> {
        let mut cfg = match &self.config {
            Some(path) => BenchConfig::load_toml(path)?,
            None => BenchConfig::default(),
        };
        if let Some(server) = self.server {
            cfg.server = server;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(iters) = self.iters {
            cfg.iters = iters;
        }
        if let Some(msg_len) = self.msg_len {
            cfg.msg_len = msg_len;
        }
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cfg = Args::parse().into_config()?;

    println!("rcping-client: start");
    match Bench::new(cfg).run()? {
        BenchReport::PingPong(report) => {
            println!("{:.3} microseconds", report.micros());
            if !report.payload_ok {
                println!(
                    "rcping-client: payload mismatch ({} bytes echoed)",
                    report.bytes
                );
            }
        }
        BenchReport::PostLoop(report) => {
            println!(
                "{:.3} microseconds per send ({} sends, {} batches)",
                report.micros_per_post(),
                report.iters,
                report.batches
            );
        }
    }
    println!("rcping-client: end");
    Ok(())
}
