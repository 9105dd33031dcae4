//! One task per watched path.
//!
//! A [`WatchedPath`] owns a single backend subscription and the task blocked on it. The task
//! turns wakes into [`ChangeInfo`] records and hands them to the coordinator through a weak
//! [`EventSink`], so workers never keep the coordinator alive.

use std::{
	collections::BTreeSet,
	fmt,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU8, Ordering},
		Arc, Weak,
	},
	time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{fs, io, spawn, task::JoinHandle, time::Instant};
use tracing::{debug, error, instrument, trace, warn, Instrument};

use crate::{
	backend::{Backend, Closer, EventMask, Subscription},
	error::{Error, FileIOError},
	record::{ChangeInfo, ChangeKind, MountEvent},
	Result,
};

/// Generation tag of a worker, unique for the lifetime of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl From<u64> for WatchId {
	fn from(id: u64) -> Self {
		Self(id)
	}
}

impl fmt::Display for WatchId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Where workers and the mount monitor deliver what they observe.
#[async_trait]
pub(crate) trait EventSink: Send + Sync + 'static {
	async fn dispatch_change(&self, origin: WatchId, info: ChangeInfo);

	async fn dispatch_mount_event(&self, event: MountEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
	Starting = 0,
	Watching = 1,
	Reaping = 2,
	Stopped = 3,
}

impl WorkerState {
	const fn from_u8(value: u8) -> Self {
		match value {
			0 => Self::Starting,
			1 => Self::Watching,
			2 => Self::Reaping,
			_ => Self::Stopped,
		}
	}
}

/// Snapshot of one live watch, as reported by [`crate::WatcherCoordinator::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
	pub path: PathBuf,
	pub is_dir: bool,
	pub listeners: usize,
	pub state: WorkerState,
	/// Time since the worker last woke up
	pub idle_ms: u64,
}

#[derive(Debug)]
struct Shared {
	state: AtomicU8,
	last_activity: Mutex<Instant>,
}

impl Shared {
	fn new() -> Self {
		Self {
			state: AtomicU8::new(WorkerState::Starting as u8),
			last_activity: Mutex::new(Instant::now()),
		}
	}

	fn state(&self) -> WorkerState {
		WorkerState::from_u8(self.state.load(Ordering::Acquire))
	}

	fn set_state(&self, state: WorkerState) {
		self.state.store(state as u8, Ordering::Release);
	}

	/// Moves forward only, a worker never goes back to watching once reaping started.
	fn advance(&self, state: WorkerState) {
		self.state.fetch_max(state as u8, Ordering::AcqRel);
	}

	fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	fn idle_for(&self) -> Duration {
		self.last_activity.lock().elapsed()
	}
}

/// Sorted names of a directory's entries
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct DirectorySnapshot(Vec<String>);

impl DirectorySnapshot {
	pub(crate) async fn read(path: impl AsRef<Path>) -> Result<Self, FileIOError> {
		let path = path.as_ref();

		let mut read_dir = fs::read_dir(path)
			.await
			.map_err(|e| FileIOError::with_context(path, e, "reading directory"))?;

		let mut names = Vec::new();
		while let Some(entry) = read_dir
			.next_entry()
			.await
			.map_err(|e| FileIOError::with_context(path, e, "reading directory entry"))?
		{
			names.push(
				entry
					.file_name()
					.into_string()
					.unwrap_or_else(|name| name.to_string_lossy().into_owned()),
			);
		}

		names.sort_unstable();

		Ok(Self(names))
	}

	/// Names only in `newer` and names only in `self`, in that order.
	pub(crate) fn diff(&self, newer: &Self) -> (BTreeSet<String>, BTreeSet<String>) {
		let missing_from = |haystack: &Self, needles: &Self| {
			needles
				.0
				.iter()
				.filter(|name| haystack.0.binary_search(name).is_err())
				.cloned()
				.collect::<BTreeSet<_>>()
		};

		(missing_from(self, newer), missing_from(newer, self))
	}

	#[cfg(test)]
	pub(crate) fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
		let mut names = names.into_iter().map(Into::into).collect::<Vec<_>>();
		names.sort_unstable();
		Self(names)
	}
}

enum Target {
	File,
	Directory(DirectorySnapshot),
}

/// A live watch: the subscription, the task waiting on it and the global listener count.
pub(crate) struct WatchedPath {
	id: WatchId,
	path: PathBuf,
	is_dir: bool,
	listeners: usize,
	shared: Arc<Shared>,
	closer: Closer,
	handle: Option<JoinHandle<()>>,
}

impl WatchedPath {
	/// Opens the subscription, takes the initial directory snapshot and spawns the worker.
	///
	/// `path` must already be canonical. The returned watch starts with zero listeners.
	#[instrument(skip(backend, sink), fields(path = %path.display(), %id), err)]
	pub(crate) async fn start(
		id: WatchId,
		path: PathBuf,
		backend: &dyn Backend,
		sink: Weak<dyn EventSink>,
	) -> Result<Self> {
		let metadata = fs::metadata(&path).await.map_err(|e| {
			if e.kind() == io::ErrorKind::NotFound {
				Error::InvalidPath(path.as_path().into())
			} else {
				Error::OpenFailed {
					path: path.as_path().into(),
					reason: e.to_string(),
				}
			}
		})?;

		// Subscribing before listing, so an entry created in between shows up in one of them
		let subscription = backend.open(&path)?;

		let target = if metadata.is_dir() {
			match DirectorySnapshot::read(&path).await {
				Ok(snapshot) => Target::Directory(snapshot),
				Err(e) => {
					subscription.close();
					return Err(Error::OpenFailed {
						path: path.as_path().into(),
						reason: e.to_string(),
					});
				}
			}
		} else {
			Target::File
		};

		let shared = Arc::new(Shared::new());
		let closer = subscription.closer();

		let handle = spawn(
			run(
				id,
				path.clone(),
				target,
				subscription,
				Arc::clone(&shared),
				sink,
			)
			.in_current_span(),
		);

		debug!("Started watching path");

		Ok(Self {
			id,
			path,
			is_dir: metadata.is_dir(),
			listeners: 0,
			shared,
			closer,
			handle: Some(handle),
		})
	}

	pub(crate) const fn id(&self) -> WatchId {
		self.id
	}

	pub(crate) fn path(&self) -> &Path {
		&self.path
	}

	pub(crate) const fn listeners(&self) -> usize {
		self.listeners
	}

	pub(crate) fn add_listener(&mut self) -> usize {
		self.listeners += 1;
		self.listeners
	}

	/// Drops `count` listeners at once, as when a session holding several requests goes away.
	pub(crate) fn remove_listeners(&mut self, count: usize) -> usize {
		self.listeners = self.listeners.saturating_sub(count);
		self.listeners
	}

	/// Wakes the worker as if its volume went away.
	pub(crate) fn revoke(&self) {
		if self.closer.signal(EventMask::REVOKE) {
			trace!(path = %self.path.display(), "Revoked watched path");
		}
	}

	pub(crate) fn status(&self) -> WatchStatus {
		WatchStatus {
			path: self.path.clone(),
			is_dir: self.is_dir,
			listeners: self.listeners,
			state: self.shared.state(),
			idle_ms: u64::try_from(self.shared.idle_for().as_millis()).unwrap_or(u64::MAX),
		}
	}

	/// Cancels the pending wait, closes the subscription and joins the worker.
	pub(crate) async fn stop(mut self) {
		self.shared.advance(WorkerState::Reaping);
		self.closer.close();

		if let Some(handle) = self.handle.take() {
			if let Err(e) = handle.await {
				error!(?e, path = %self.path.display(), "Failed to join watched path worker;");
			}
		}

		self.shared.set_state(WorkerState::Stopped);
		debug!(path = %self.path.display(), id = %self.id, "Stopped watching path");
	}
}

impl Drop for WatchedPath {
	fn drop(&mut self) {
		// Without a join the task still observes the closed subscription and exits on its own
		self.closer.close();
	}
}

impl fmt::Debug for WatchedPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WatchedPath")
			.field("id", &self.id)
			.field("path", &self.path)
			.field("is_dir", &self.is_dir)
			.field("listeners", &self.listeners)
			.field("state", &self.shared.state())
			.finish_non_exhaustive()
	}
}

#[instrument(name = "watched_path", skip_all, fields(path = %path.display(), %id))]
async fn run(
	id: WatchId,
	path: PathBuf,
	mut target: Target,
	subscription: Subscription,
	shared: Arc<Shared>,
	sink: Weak<dyn EventSink>,
) {
	shared.advance(WorkerState::Watching);

	while let Some(mask) = subscription.wait().await {
		shared.touch();
		trace!(?mask, "Worker woke up");

		let Some(info) = observe(&path, &mut target, mask).await else {
			continue;
		};

		let gone = info.kind == ChangeKind::Removed;
		if gone {
			// Stopping ourselves, the coordinator only drops the entry
			subscription.close();
		}

		let Some(sink) = sink.upgrade() else {
			debug!("Coordinator is gone, stopping worker");
			break;
		};

		sink.dispatch_change(id, info).await;

		if gone {
			break;
		}
	}

	subscription.close();
	shared.set_state(WorkerState::Stopped);
	trace!("Worker exited");
}

/// Turns one (coalesced) wake into at most one change record.
async fn observe(path: &Path, target: &mut Target, mask: EventMask) -> Option<ChangeInfo> {
	if mask.is_gone() {
		debug!(?mask, "Watched path is gone");
		return Some(ChangeInfo::removed(path));
	}

	match target {
		Target::File => (mask.is_content_change() || mask.is_metadata_change())
			.then(|| ChangeInfo::changed(path)),

		Target::Directory(snapshot) => {
			if !mask.is_content_change() {
				return mask.is_metadata_change().then(|| ChangeInfo::changed(path));
			}

			let newer = match DirectorySnapshot::read(path).await {
				Ok(newer) => newer,
				Err(e) if e.source.kind() == io::ErrorKind::NotFound => {
					debug!("Watched directory vanished while relisting");
					return Some(ChangeInfo::removed(path));
				}
				Err(e) => {
					warn!(?e, "Failed to relist watched directory;");
					return None;
				}
			};

			let (added, removed) = snapshot.diff(&newer);
			*snapshot = newer;

			if added.is_empty() && removed.is_empty() {
				trace!("Directory entries unchanged");
				return None;
			}

			Some(ChangeInfo::entries_changed(path, added, removed))
		}
	}
}
