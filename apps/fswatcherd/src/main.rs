use fswatcher::{
	ipc::{IpcServer, WatcherClient},
	SystemMountTable, WatcherConfig, WatcherCoordinator,
};

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::{fs, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fswatcherd", about = "Local file-system change-notification service", version)]
struct Args {
	/// Configuration file, defaults to <config dir>/fswatcher/config.toml
	#[arg(long, env = "FSWATCHER_CONFIG", global = true)]
	config: Option<PathBuf>,

	/// Watcher socket, overrides the configuration
	#[arg(long, env = "FSWATCHER_SOCKET", global = true)]
	socket: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the watcher (default)
	Serve,

	/// Watch paths through a running watcher and print every notification as a JSON line
	Watch {
		/// Also receive filtered file-system-wide changes and mount events
		#[arg(long)]
		global: bool,

		paths: Vec<PathBuf>,
	},

	/// Print the sessions and live watches of a running watcher
	Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();

	let mut config =
		WatcherConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
	if let Some(socket) = args.socket {
		config.socket_path = socket;
	}

	match args.command.unwrap_or(Command::Serve) {
		Command::Serve => serve(config, args.config).await,
		Command::Watch { global, paths } => watch(&config, global, paths).await,
		Command::Status => status(&config).await,
	}
}

async fn serve(config: WatcherConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
	let coordinator = WatcherCoordinator::new(config.build_filter(&SystemMountTable));
	coordinator.start_mount_monitor(Arc::new(SystemMountTable), config.mount_poll_interval());

	let reloader = tokio::spawn(reload_on_hangup(coordinator.clone(), config_path));

	info!(socket = %config.socket_path.display(), "Starting watcher");

	let res = IpcServer::new(config.socket_path.clone(), coordinator.clone())
		.run(shutdown_signal())
		.await
		.context("Watcher socket failed");

	reloader.abort();
	coordinator.shutdown().await;

	res
}

/// Rebuilds the global path filter from the configuration on every SIGHUP.
async fn reload_on_hangup(coordinator: WatcherCoordinator, config_path: Option<PathBuf>) {
	use tokio::signal::unix::{signal, SignalKind};

	let mut hangups = match signal(SignalKind::hangup()) {
		Ok(hangups) => hangups,
		Err(e) => {
			warn!(?e, "Failed to install SIGHUP handler, filter reload disabled;");
			return;
		}
	};

	while hangups.recv().await.is_some() {
		match WatcherConfig::load(config_path.as_deref()) {
			Ok(config) => coordinator.reload_filter(config.build_filter(&SystemMountTable)),
			Err(e) => error!(?e, "Failed to reload configuration, keeping the current filter;"),
		}
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!(?e, "Failed to listen for Ctrl+C;");
			std::future::pending::<()>().await;
		}
	};

	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(e) => {
				error!(?e, "Failed to install SIGTERM handler;");
				std::future::pending::<()>().await;
			}
		}
	};

	tokio::select! {
		() = ctrl_c => info!("Received Ctrl+C, shutting down gracefully..."),
		() = terminate => info!("Received SIGTERM, shutting down gracefully..."),
	}
}

async fn watch(config: &WatcherConfig, global: bool, paths: Vec<PathBuf>) -> anyhow::Result<()> {
	anyhow::ensure!(global || !paths.is_empty(), "Nothing to watch, pass paths or --global");

	let (client, notifications) = WatcherClient::connect(&config.socket_path, global)
		.await
		.with_context(|| {
			format!(
				"Failed to connect to watcher at '{}'",
				config.socket_path.display()
			)
		})?;

	for path in paths {
		// The watcher resolves paths against its own working directory
		let path = fs::canonicalize(&path)
			.await
			.with_context(|| format!("Can't watch '{}'", path.display()))?;

		client.add_watch(path).await?;
	}

	let mut shutdown = std::pin::pin!(shutdown_signal());

	loop {
		tokio::select! {
			notification = notifications.recv() => {
				let Ok(notification) = notification else {
					warn!("Watcher closed the connection");
					break;
				};

				println!("{}", serde_json::to_string(&notification)?);
			}

			() = &mut shutdown => break,
		}
	}

	client.unregister().await?;

	Ok(())
}

async fn status(config: &WatcherConfig) -> anyhow::Result<()> {
	let (client, _notifications) = WatcherClient::connect(&config.socket_path, false)
		.await
		.with_context(|| {
			format!(
				"Failed to connect to watcher at '{}'",
				config.socket_path.display()
			)
		})?;

	let status = client.status().await?;

	// Our own session is part of the count
	println!("sessions: {}", status.sessions.saturating_sub(1));
	for watch in &status.watches {
		println!(
			"{:>4} {:<9} {:>8}ms idle  {}{}",
			watch.listeners,
			serde_json::to_value(watch.state)?
				.as_str()
				.unwrap_or_default(),
			watch.idle_ms,
			watch.path.display(),
			if watch.is_dir { "/" } else { "" },
		);
	}

	client.unregister().await?;

	Ok(())
}
