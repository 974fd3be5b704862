use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use routex::api::{App, build_router};
use routex::config;

#[derive(Parser, Debug)]
#[command(version, about = "Routing reverse proxy for LLM APIs", long_about = None)]
struct Args {
	/// Override the listen port (defaults to PORT or the config file)
	#[arg(short, long)]
	port: Option<u16>,

	/// Override the data directory
	#[arg(long)]
	data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let mut config = config::load()?;
	if let Some(port) = args.port {
		config.port = port;
	}
	if let Some(data_dir) = args.data_dir {
		config.data_dir = data_dir;
	}

	let addr = format!("{}:{}", config.host, config.port);
	let app = App::build(config)?;
	app.spawn_background();
	app.refresh_channel_gauges();

	let router = build_router(app.clone());
	let listener = tokio::net::TcpListener::bind(&addr).await?;
	info!(addr = %addr, "routex listening");

	let shutdown_app = app.clone();
	axum::serve(listener, router)
		.with_graceful_shutdown(async move {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received");
		})
		.await?;

	shutdown_app.shutdown();
	Ok(())
}
