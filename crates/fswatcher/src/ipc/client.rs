use std::path::{Path, PathBuf};

use async_channel as chan;
use tokio::{
	io::BufReader,
	net::{unix::OwnedWriteHalf, UnixStream},
	sync::Mutex,
	task::JoinHandle,
};
use tracing::{debug, trace, warn, Instrument};

use super::protocol::{read_frame, write_frame, Request, Response};
use crate::{
	coordinator::CoordinatorStatus, error::FileIOError, record::Notification,
	session::SessionHandle, Error, Result,
};

/// One client session over the watcher socket.
///
/// Dropping the client closes the connection, which the watcher treats as unregistration.
#[derive(Debug)]
pub struct WatcherClient {
	session: SessionHandle,
	/// Held across a request and its reply, so replies never interleave
	writer: Mutex<OwnedWriteHalf>,
	replies_rx: chan::Receiver<Response>,
	reader: JoinHandle<()>,
}

impl WatcherClient {
	/// Connects and registers, returning the client and the stream of its notifications.
	pub async fn connect(
		socket_path: impl AsRef<Path>,
		is_global: bool,
	) -> Result<(Self, chan::Receiver<Notification>)> {
		let socket_path = socket_path.as_ref();

		let stream = UnixStream::connect(socket_path).await.map_err(|e| {
			FileIOError::with_context(socket_path, e, "connecting to watcher socket")
		})?;
		let (reader, mut writer) = stream.into_split();

		let (notifications_tx, notifications_rx) = chan::unbounded();
		let (replies_tx, replies_rx) = chan::unbounded();

		let reader = tokio::spawn(
			route_frames(BufReader::new(reader), notifications_tx, replies_tx).in_current_span(),
		);

		write_frame(&mut writer, &Request::Register { is_global }).await?;

		let session = match replies_rx.recv().await {
			Ok(Response::Registered { session }) => session,
			Ok(other) => {
				reader.abort();
				return Err(Error::Protocol(format!("expected registration, got {other:?}")));
			}
			Err(_) => {
				reader.abort();
				return Err(Error::Protocol("watcher closed the connection".into()));
			}
		};

		debug!(%session, is_global, "Registered with watcher");

		Ok((
			Self {
				session,
				writer: Mutex::new(writer),
				replies_rx,
				reader,
			},
			notifications_rx,
		))
	}

	#[must_use]
	pub const fn session(&self) -> SessionHandle {
		self.session
	}

	pub async fn add_watch(&self, path: impl Into<PathBuf>) -> Result<()> {
		self.send(&Request::AddWatch {
			session: self.session,
			path: path.into(),
		})
		.await
	}

	pub async fn remove_watch(&self, path: impl Into<PathBuf>) -> Result<()> {
		self.send(&Request::RemoveWatch {
			session: self.session,
			path: path.into(),
		})
		.await
	}

	pub async fn status(&self) -> Result<CoordinatorStatus> {
		let mut writer = self.writer.lock().await;
		write_frame(&mut *writer, &Request::Status).await?;

		match self.replies_rx.recv().await {
			Ok(Response::Status(status)) => Ok(status),
			Ok(Response::Error { message }) => Err(Error::Protocol(message)),
			Ok(other) => Err(Error::Protocol(format!("expected status, got {other:?}"))),
			Err(_) => Err(Error::Protocol("watcher closed the connection".into())),
		}
	}

	/// Releases every watch of this session and closes the connection.
	pub async fn unregister(self) -> Result<()> {
		self.send(&Request::Unregister {
			session: self.session,
		})
		.await
	}

	async fn send(&self, request: &Request) -> Result<()> {
		write_frame(&mut *self.writer.lock().await, request).await
	}
}

impl Drop for WatcherClient {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

async fn route_frames(
	mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
	notifications_tx: chan::Sender<Notification>,
	replies_tx: chan::Sender<Response>,
) {
	let mut line = String::new();

	loop {
		match read_frame::<_, Response>(&mut reader, &mut line, u64::MAX).await {
			Ok(Some(Response::Notification(notification))) => {
				if notifications_tx.send(notification).await.is_err() {
					trace!("Notification receiver dropped");
				}
			}
			Ok(Some(reply)) => {
				if replies_tx.send(reply).await.is_err() {
					break;
				}
			}
			Ok(None) => {
				debug!("Watcher closed the connection");
				break;
			}
			Err(e) => {
				warn!(?e, "Failed to read from watcher;");
				break;
			}
		}
	}
}
