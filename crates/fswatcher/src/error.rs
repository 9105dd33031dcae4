use std::{fmt, io, path::Path};

use thiserror::Error;

use crate::session::SessionHandle;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("path does not exist or is not watchable: <path='{}'>", .0.display())]
	InvalidPath(Box<Path>),
	#[error("failed to open path for monitoring: <path='{}'>: {reason}", .path.display())]
	OpenFailed { path: Box<Path>, reason: String },
	#[error("kernel event subscription limit reached: <path='{}'>", .0.display())]
	SubscriptionExhausted(Box<Path>),
	#[error("failed to read the mount table: {0}")]
	TransientMountReadFailure(#[source] io::Error),
	#[error("client is unreachable <session='{0}'>")]
	ClientUnreachable(SessionHandle),
	#[error("unknown client session <session='{0}'>")]
	UnknownSession(SessionHandle),
	#[error("unexpected reply from watcher: {0}")]
	Protocol(String),

	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl Error {
	/// Whether the error means the watch request was rejected without touching existing watches.
	#[must_use]
	pub const fn is_watch_rejection(&self) -> bool {
		matches!(
			self,
			Self::InvalidPath(_) | Self::OpenFailed { .. } | Self::SubscriptionExhausted(_)
		)
	}
}

/// Returned by a client capability when the peer behind it is gone.
#[derive(Debug, Clone, Copy, Error)]
#[error("client peer disconnected")]
pub struct Unreachable;

/// File I/O error carrying the path it happened on
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
	pub maybe_context: Option<&'static str>,
}

impl FileIOError {
	pub fn new(path: impl AsRef<Path>, source: io::Error) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}

	pub fn with_context(path: impl AsRef<Path>, source: io::Error, context: &'static str) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context),
		}
	}
}

impl fmt::Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "file I/O error")?;
		if let Some(context) = self.maybe_context {
			write!(f, " ({context})")?;
		}
		write!(f, ": {}; path: '{}'", self.source, self.path.display())
	}
}
