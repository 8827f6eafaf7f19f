use std::path::PathBuf;

use clap::Parser;
use glassgate::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glassgate", about = "MITM forward HTTP/HTTPS proxy", version)]
struct Args {
	/// Path to a YAML configuration file. Defaults are used when absent.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Listener port, overriding the config file.
	#[arg(short, long)]
	port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let mut cfg = match &args.config {
		Some(path) => Config::from_file(path)?,
		None => Config::default(),
	};
	if let Some(port) = args.port {
		cfg.port = port;
	}

	let server = Server::builder(cfg).bind().await?;
	info!(addr = %server.local_addr(), "glassgate started");

	let handle = server.shutdown_handle();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received; shutting down");
			handle.shutdown();
		}
	});

	server.run().await
}
