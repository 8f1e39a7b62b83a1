use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use meshgate::config::Config;
use meshgate::proxy::gateway::Gateway;
use meshgate::registry::MessageRegistry;
use meshgate::{signal, telemetry};

#[derive(Parser, Debug)]
#[command(version, about = "Dual-protocol gateway fronting gRPC backends")]
struct Args {
	/// Gateway configuration file (JSON)
	#[arg(short, long, value_name = "file")]
	file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	let raw = tokio::fs::read_to_string(&args.file)
		.await
		.with_context(|| format!("reading {}", args.file.display()))?;
	let cfg: Config = serde_json::from_str(&raw).context("parsing gateway config")?;

	// The standalone binary proxies schema-agnostically; embedders register
	// generated message types here to enable HTTP transcoding.
	let registry = MessageRegistry::default();

	let gateway = Gateway::new(cfg, registry)?;
	let stop = signal::StopSignal::install();
	gateway.bind().await?.serve(stop).await
}
