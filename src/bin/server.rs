use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use rcping::bench::EchoServer;
use rcping::BenchConfig;

/// RDMA CM point-to-point latency benchmark server.
#[derive(Parser, Debug)]
#[command(name = "rcping-server", about = "RDMA CM point-to-point latency benchmark server")]
struct Args {
    /// Address to bind; the wildcard address when omitted.
    #[arg(short = 's', long)]
    bind: Option<String>,

    /// Port to listen on.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Number of messages to consume; must match the client.
    #[arg(short = 'n', long)]
    iters: Option<usize>,

    /// Message length in bytes.
    #[arg(short = 'm', long)]
    msg_len: Option<usize>,

    /// TOML configuration file; flags override its values.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => BenchConfig::load_toml(path)?,
        None => BenchConfig::default(),
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(iters) = args.iters {
        cfg.iters = iters;
    }
    if let Some(msg_len) = args.msg_len {
        cfg.msg_len = msg_len;
    }

    println!("rcping-server: listening on port {}", cfg.port);
    EchoServer::new(args.bind, cfg).run()?;
    println!("rcping-server: end");
    Ok(())
}
