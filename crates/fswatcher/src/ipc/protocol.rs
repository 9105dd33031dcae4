use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
	coordinator::CoordinatorStatus, record::Notification, session::SessionHandle, Error, Result,
};

/// Longest request line the watcher accepts
pub(crate) const MAX_REQUEST_LEN: u64 = 64 * 1024;

/// Client to watcher frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
	Register { is_global: bool },
	Unregister { session: SessionHandle },
	AddWatch { session: SessionHandle, path: PathBuf },
	RemoveWatch { session: SessionHandle, path: PathBuf },
	Status,
}

/// Watcher to client frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
	Registered { session: SessionHandle },
	Notification(Notification),
	Status(CoordinatorStatus),
	Error { message: String },
}

/// Writes `frame` as one JSON line.
pub(crate) async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let mut line = serde_json::to_vec(frame)?;
	line.push(b'\n');

	writer.write_all(&line).await?;
	writer.flush().await?;

	Ok(())
}

/// Reads the next JSON line of at most `max_len` bytes, `None` on end of stream.
/// Blank lines are skipped.
pub(crate) async fn read_frame<R, T>(
	reader: &mut R,
	line: &mut String,
	max_len: u64,
) -> Result<Option<T>>
where
	R: AsyncBufRead + Unpin,
	T: DeserializeOwned,
{
	loop {
		line.clear();

		let mut limited = (&mut *reader).take(max_len.saturating_add(1));
		if limited.read_line(line).await? == 0 {
			return Ok(None);
		}

		if limited.limit() == 0 && !line.ends_with('\n') {
			return Err(Error::Protocol(format!("frame longer than {max_len} bytes")));
		}

		let trimmed = line.trim();
		if !trimmed.is_empty() {
			return Ok(Some(serde_json::from_str(trimmed)?));
		}
	}
}
