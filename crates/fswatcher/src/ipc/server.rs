use std::{
	future::Future,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_channel as chan;
use tokio::{
	fs,
	io::BufReader,
	net::{UnixListener, UnixStream},
	task::JoinSet,
};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use super::protocol::{read_frame, write_frame, Request, Response, MAX_REQUEST_LEN};
use crate::{
	coordinator::WatcherCoordinator,
	error::{FileIOError, Unreachable},
	record::{ChangeInfo, Notification},
	session::{FsWatcherClient, SessionHandle},
	Error, Result,
};

/// Frames queued for one connection before its client counts as unreachable
const FRAME_QUEUE_LEN: usize = 1024;

/// Client capability of one connection, queues notification frames for its writer.
struct ConnectionClient(chan::Sender<Response>);

impl ConnectionClient {
	fn deliver(&self, notification: Notification) -> Result<(), Unreachable> {
		match self.0.try_send(Response::Notification(notification)) {
			Ok(()) => Ok(()),
			Err(chan::TrySendError::Full(_)) => {
				// A peer that stopped reading gets no more frames, its writer winds down
				warn!("Client is not reading its notifications, closing its queue;");
				self.0.close();
				Err(Unreachable)
			}
			Err(chan::TrySendError::Closed(_)) => Err(Unreachable),
		}
	}
}

impl FsWatcherClient for ConnectionClient {
	fn watched_path_did_change(&self, info: ChangeInfo) -> Result<(), Unreachable> {
		self.deliver(Notification::WatchedPathDidChange(info))
	}

	fn global_watched_path_did_change(&self, info: ChangeInfo) -> Result<(), Unreachable> {
		self.deliver(Notification::GlobalWatchedPathDidChange(info))
	}
}

/// Accepts local clients on a Unix domain socket, one session per connection.
pub struct IpcServer {
	socket_path: PathBuf,
	coordinator: WatcherCoordinator,
}

impl IpcServer {
	#[must_use]
	pub const fn new(socket_path: PathBuf, coordinator: WatcherCoordinator) -> Self {
		Self {
			socket_path,
			coordinator,
		}
	}

	#[must_use]
	pub fn socket_path(&self) -> &Path {
		&self.socket_path
	}

	/// Binds the socket, replacing a stale socket file left by a previous run.
	pub async fn bind(&self) -> Result<UnixListener> {
		match fs::remove_file(&self.socket_path).await {
			Ok(()) => debug!(socket = %self.socket_path.display(), "Removed stale socket file"),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => {
				return Err(FileIOError::with_context(
					&self.socket_path,
					e,
					"removing stale socket file",
				)
				.into())
			}
		}

		if let Some(parent) = self.socket_path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::with_context(parent, e, "creating socket directory"))?;
		}

		UnixListener::bind(&self.socket_path).map_err(|e| {
			FileIOError::with_context(&self.socket_path, e, "binding watcher socket").into()
		})
	}

	/// Serves connections until `shutdown` resolves. Open connections are dropped on exit.
	#[instrument(skip_all, fields(socket = %self.socket_path.display()))]
	pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
		let listener = self.bind().await?;
		info!("Watcher listening");

		self.serve(listener, shutdown).await
	}

	/// Like [`Self::run`] on an already bound listener.
	pub async fn serve(self, listener: UnixListener, shutdown: impl Future<Output = ()>) -> Result<()> {
		let mut shutdown = std::pin::pin!(shutdown);
		let mut connections = JoinSet::new();

		loop {
			tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok((stream, _addr)) => {
						connections.spawn(
							handle_connection(stream, self.coordinator.clone()).in_current_span(),
						);
					}
					Err(e) => {
						// Running out of descriptors must not bring the watcher down
						error!(?e, "Failed to accept connection;");
					}
				},

				Some(joined) = connections.join_next(), if !connections.is_empty() => {
					if let Err(e) = joined {
						if e.is_panic() {
							error!(?e, "Connection handler panicked;");
						}
					}
				}

				() = &mut shutdown => {
					info!("Shutdown signal received, closing watcher socket");
					break;
				}
			}
		}

		connections.shutdown().await;

		if let Err(e) = fs::remove_file(&self.socket_path).await {
			warn!(?e, "Failed to remove socket file;");
		}

		Ok(())
	}
}

#[instrument(skip_all)]
async fn handle_connection(stream: UnixStream, coordinator: WatcherCoordinator) {
	let (reader, mut writer) = stream.into_split();
	let (frames_tx, frames_rx) = chan::bounded::<Response>(FRAME_QUEUE_LEN);

	let writer_task = tokio::spawn(
		async move {
			while let Ok(frame) = frames_rx.recv().await {
				match write_frame(&mut writer, &frame).await {
					Ok(()) => {}
					// Nothing was written, the stream is still in sync
					Err(Error::Serialization(e)) => {
						warn!(?e, ?frame, "Dropping frame that can't be encoded;");

						if !matches!(frame, Response::Notification(_)) {
							let reply = Response::Error {
								message: format!("reply could not be encoded: {e}"),
							};
							if let Err(e) = write_frame(&mut writer, &reply).await {
								debug!(?e, "Connection closed while writing;");
								break;
							}
						}
					}
					Err(e) => {
						debug!(?e, "Connection closed while writing;");
						break;
					}
				}
			}
		}
		.in_current_span(),
	);

	let mut reader = BufReader::new(reader);
	let mut line = String::new();
	let mut session = None;

	loop {
		let request = match read_frame::<_, Request>(&mut reader, &mut line, MAX_REQUEST_LEN).await {
			Ok(Some(request)) => request,
			Ok(None) => {
				trace!("Client hung up");
				break;
			}
			Err(Error::Serialization(e)) => {
				warn!(?e, "Malformed request;");
				let _ = frames_tx.try_send(Response::Error {
					message: e.to_string(),
				});
				continue;
			}
			Err(Error::Protocol(message)) => {
				warn!(%message, "Refusing oversized request, closing connection;");
				let _ = frames_tx.try_send(Response::Error { message });
				break;
			}
			Err(e) => {
				debug!(?e, "Connection failed while reading;");
				break;
			}
		};

		handle_request(request, &mut session, &coordinator, &frames_tx).await;
	}

	if let Some(handle) = session {
		coordinator.unregister_client(handle).await;
	}

	frames_tx.close();
	if let Err(e) = writer_task.await {
		error!(?e, "Failed to join connection writer;");
	}
}

async fn handle_request(
	request: Request,
	session: &mut Option<SessionHandle>,
	coordinator: &WatcherCoordinator,
	frames_tx: &chan::Sender<Response>,
) {
	match request {
		Request::Register { is_global } => {
			if let Some(handle) = session {
				let _ = frames_tx.try_send(Response::Error {
					message: format!("connection is already registered as session {handle}"),
				});
				return;
			}

			let client = Arc::new(ConnectionClient(frames_tx.clone()));
			let handle = coordinator.register_client(client, is_global).await;
			*session = Some(handle);

			let _ = frames_tx.try_send(Response::Registered { session: handle });
		}

		Request::Unregister { session: requested } => {
			if owns(*session, requested) {
				coordinator.unregister_client(requested).await;
				*session = None;
			}
		}

		Request::AddWatch {
			session: requested,
			path,
		} => {
			if owns(*session, requested) {
				match coordinator.add_watch(requested, &path).await {
					Ok(()) => {}
					Err(e) if e.is_watch_rejection() => {
						info!(%e, "Watch request rejected");
					}
					Err(e) => warn!(?e, path = %path.display(), "Dropped add-watch request;"),
				}
			}
		}

		Request::RemoveWatch {
			session: requested,
			path,
		} => {
			if owns(*session, requested) {
				if let Err(e) = coordinator.remove_watch(requested, &path).await {
					warn!(?e, path = %path.display(), "Dropped remove-watch request;");
				}
			}
		}

		Request::Status => {
			let _ = frames_tx.try_send(Response::Status(coordinator.status().await));
		}
	}
}

fn owns(session: Option<SessionHandle>, requested: SessionHandle) -> bool {
	let owned = session == Some(requested);
	if !owned {
		warn!(%requested, ?session, "Ignoring request for a session this connection does not own");
	}

	owned
}
