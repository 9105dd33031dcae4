//! The watcher coordinator.
//!
//! Owns the client registry, the path to [`WatchedPath`] map, the admission filter and the
//! mount monitor. Watches are reference counted on two levels: each session counts its own
//! requests for a path, and each watched path counts the requests of every session. Both
//! levels move together, so a path's listener count is always the sum of its session counts
//! and the watch lives exactly as long as that sum is positive.
//!
//! All structural changes happen under one async mutex. Delivery to clients and joining
//! stopped workers always happen after it is released.

use std::{
	collections::{HashMap, HashSet},
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
	time::Duration,
};

use async_trait::async_trait;
use futures_concurrency::future::Join;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, instrument, trace};

use crate::{
	backend::{Backend, NotifyBackend},
	error::Unreachable,
	filter::PathFilterTree,
	mount::{MountMonitor, MountTable},
	record::{ChangeInfo, ChangeKind, MountEvent},
	session::{ClientRegistry, FsWatcherClient, SessionHandle},
	worker::{EventSink, WatchId, WatchStatus, WatchedPath},
	Error, Result,
};

/// What [`WatcherCoordinator::status`] reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
	pub sessions: usize,
	/// Sorted by path
	pub watches: Vec<WatchStatus>,
}

#[derive(Debug, Default)]
struct State {
	registry: ClientRegistry,
	watches: HashMap<PathBuf, WatchedPath>,
}

impl State {
	/// Releases `count` listeners of `path`, handing back the watch once nobody listens.
	fn release(&mut self, path: &Path, count: usize) -> Option<WatchedPath> {
		let watched = self.watches.get_mut(path)?;

		if watched.remove_listeners(count) > 0 {
			return None;
		}

		self.watches.remove(path)
	}

	/// Counts one more request of `handle` for `path` if the path is already watched.
	///
	/// Returns `false` when nothing watches the path yet.
	fn attach(&mut self, handle: SessionHandle, path: &Path) -> Result<bool> {
		if self.registry.get(handle).is_none() {
			return Err(Error::UnknownSession(handle));
		}

		let Some(watched) = self.watches.get_mut(path) else {
			return Ok(false);
		};
		let listeners = watched.add_listener();

		let session_count = self
			.registry
			.get_mut(handle)
			.map_or(0, |session| session.add_path(path));

		debug!(%handle, listeners, session_count, "Added watch");

		Ok(true)
	}

	/// `None` if the session was already gone.
	fn drop_session(&mut self, handle: SessionHandle) -> Option<Vec<WatchedPath>> {
		let session = self.registry.unregister(handle)?;

		Some(
			session
				.into_paths()
				.into_iter()
				.filter_map(|(path, count)| self.release(&path, count))
				.collect(),
		)
	}
}

struct Inner {
	state: Mutex<State>,
	/// Sessions whose client failed a delivery, torn down on the next client-facing call
	unreachable: parking_lot::Mutex<HashSet<SessionHandle>>,
	backend: Arc<dyn Backend>,
	filter: RwLock<Arc<PathFilterTree>>,
	next_watch_id: AtomicU64,
	mount_monitor: parking_lot::Mutex<Option<MountMonitor>>,
}

/// Central orchestrator, cheap to clone and share between request handlers.
#[derive(Clone)]
pub struct WatcherCoordinator {
	inner: Arc<Inner>,
}

impl WatcherCoordinator {
	/// A coordinator on top of the host's native change-notification facility.
	#[must_use]
	pub fn new(filter: PathFilterTree) -> Self {
		Self::with_backend(Arc::new(NotifyBackend), filter)
	}

	#[must_use]
	pub fn with_backend(backend: Arc<dyn Backend>, filter: PathFilterTree) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(State::default()),
				unreachable: parking_lot::Mutex::new(HashSet::new()),
				backend,
				filter: RwLock::new(Arc::new(filter)),
				next_watch_id: AtomicU64::new(1),
				mount_monitor: parking_lot::Mutex::new(None),
			}),
		}
	}

	#[instrument(skip(self, client))]
	pub async fn register_client(
		&self,
		client: Arc<dyn FsWatcherClient>,
		is_global: bool,
	) -> SessionHandle {
		let (handle, purged) = {
			let mut state = self.inner.state.lock().await;
			let purged = self.inner.purge_unreachable(&mut state);
			(state.registry.register(client, is_global), purged)
		};

		stop_all(purged).await;

		debug!(%handle, "Registered client");

		handle
	}

	/// Releases every path the session held. Calling it again for the same handle is a no-op.
	#[instrument(skip(self))]
	pub async fn unregister_client(&self, handle: SessionHandle) {
		let to_stop = {
			let mut state = self.inner.state.lock().await;
			let mut to_stop = self.inner.purge_unreachable(&mut state);

			match state.drop_session(handle) {
				Some(released) => {
					debug!(released = released.len(), "Unregistered client");
					to_stop.extend(released);
				}
				None => trace!("Client was already unregistered"),
			}

			to_stop
		};

		stop_all(to_stop).await;
	}

	/// Starts watching `path` for `handle`, reusing the path's worker if one is running.
	///
	/// Opening and listing a new path happen without holding the coordinator lock. On error
	/// nothing changes, in particular no other watch is affected.
	#[instrument(skip(self, path), fields(path = %path.as_ref().display()), err)]
	pub async fn add_watch(&self, handle: SessionHandle, path: impl AsRef<Path>) -> Result<()> {
		let path = fs::canonicalize(path.as_ref())
			.await
			.map_err(|_| Error::InvalidPath(path.as_ref().into()))?;

		let (purged, attached) = {
			let mut state = self.inner.state.lock().await;
			let purged = self.inner.purge_unreachable(&mut state);
			(purged, state.attach(handle, &path))
		};

		stop_all(purged).await;

		if attached? {
			return Ok(());
		}

		let id = WatchId::from(self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed));
		let started = WatchedPath::start(id, path.clone(), &*self.inner.backend, self.inner.sink())
			.await?;

		let (unused, res) = {
			let mut state = self.inner.state.lock().await;

			if state.registry.get(handle).is_none() {
				(Some(started), Err(Error::UnknownSession(handle)))
			} else {
				// Another request may have started the same path while we were unlocked
				let unused = if state.watches.contains_key(&path) {
					Some(started)
				} else {
					state.watches.insert(path.clone(), started);
					None
				};

				(unused, state.attach(handle, &path).map(|_| ()))
			}
		};

		if let Some(unused) = unused {
			trace!(id = %unused.id(), "Discarding worker started by a concurrent request");
			unused.stop().await;
		}

		res
	}

	/// Drops one request of `handle` for `path`. Removing a path the session never watched
	/// (or no longer watches) changes nothing.
	#[instrument(skip(self, path), fields(path = %path.as_ref().display()), err)]
	pub async fn remove_watch(&self, handle: SessionHandle, path: impl AsRef<Path>) -> Result<()> {
		let path = canonical_or_lexical(path.as_ref()).await;

		let (to_stop, res) = {
			let mut state = self.inner.state.lock().await;
			let mut to_stop = self.inner.purge_unreachable(&mut state);

			let removed = state
				.registry
				.get_mut(handle)
				.map(|session| session.remove_path(&path));

			let res = match removed {
				Some(true) => {
					to_stop.extend(state.release(&path, 1));
					Ok(())
				}
				Some(false) => {
					trace!("Session was not watching path");
					Ok(())
				}
				None => Err(Error::UnknownSession(handle)),
			};

			(to_stop, res)
		};

		stop_all(to_stop).await;

		res
	}

	/// Fans a change record out to the sessions watching `info.path` and, if the filter admits
	/// the path, to every global session.
	pub async fn dispatch_change(&self, info: ChangeInfo) {
		self.inner.dispatch(None, info).await;
	}

	/// Delivers a mount event to global sessions only, and revokes every watch on the volume
	/// when it was unmounted.
	pub async fn dispatch_mount_event(&self, event: MountEvent) {
		self.inner.mount_event(event).await;
	}

	/// Replaces the admission filter, fan-outs already running keep the one they started with.
	pub fn reload_filter(&self, filter: PathFilterTree) {
		*self.inner.filter.write() = Arc::new(filter);
		info!("Reloaded global path filter");
	}

	/// Starts polling `table`, replacing any monitor started before.
	pub fn start_mount_monitor(&self, table: Arc<dyn MountTable>, interval: Duration) {
		let monitor = MountMonitor::spawn(table, interval, self.inner.sink());

		if self.inner.mount_monitor.lock().replace(monitor).is_some() {
			debug!("Replaced running mount monitor");
		}
	}

	pub async fn status(&self) -> CoordinatorStatus {
		let (status, purged) = {
			let mut state = self.inner.state.lock().await;
			let purged = self.inner.purge_unreachable(&mut state);

			let mut watches = state
				.watches
				.values()
				.map(WatchedPath::status)
				.collect::<Vec<_>>();
			watches.sort_by(|a, b| a.path.cmp(&b.path));

			(
				CoordinatorStatus {
					sessions: state.registry.len(),
					watches,
				},
				purged,
			)
		};

		stop_all(purged).await;

		status
	}

	/// Current listener count of `path`, zero when it is not watched.
	pub async fn listeners(&self, path: impl AsRef<Path>) -> usize {
		self.inner
			.state
			.lock()
			.await
			.watches
			.get(path.as_ref())
			.map_or(0, WatchedPath::listeners)
	}

	/// Stops the mount monitor, drops every session and reaps every worker.
	pub async fn shutdown(&self) {
		let monitor = self.inner.mount_monitor.lock().take();
		if let Some(monitor) = monitor {
			monitor.stop().await;
		}

		let watches = {
			let mut state = self.inner.state.lock().await;
			state.registry.clear();
			self.inner.unreachable.lock().clear();
			state.watches.drain().map(|(_, watched)| watched).collect()
		};

		stop_all(watches).await;

		info!("Watcher coordinator shut down");
	}
}

impl Inner {
	fn sink(self: &Arc<Self>) -> Weak<dyn EventSink> {
		Arc::<Self>::downgrade(self)
	}

	/// Tears down every session that failed a delivery since the last call.
	fn purge_unreachable(&self, state: &mut State) -> Vec<WatchedPath> {
		let handles = self.unreachable.lock().drain().collect::<Vec<_>>();

		handles
			.into_iter()
			.filter_map(|handle| {
				let released = state.drop_session(handle)?;
				debug!(%handle, released = released.len(), "Dropped unreachable client session");
				Some(released)
			})
			.flatten()
			.collect()
	}

	fn mark_unreachable(&self, failed: Vec<SessionHandle>) {
		if failed.is_empty() {
			return;
		}

		for handle in &failed {
			debug!(e = %Error::ClientUnreachable(*handle), "Client unreachable, dropping its session lazily;");
		}

		self.unreachable.lock().extend(failed);
	}

	async fn dispatch(&self, origin: Option<WatchId>, info: ChangeInfo) {
		let filter = Arc::clone(&*self.filter.read());

		let targets = {
			let mut state = self.state.lock().await;

			if let Some(origin) = origin {
				match state.watches.get(&info.path) {
					Some(watched) if watched.id() == origin => {}
					_ => {
						trace!(%origin, path = %info.path.display(), "Dropping record of a retired worker");
						return;
					}
				}
			}

			let mut targets = state
				.registry
				.watching(&info.path)
				.map(|(handle, client)| (handle, client, false))
				.collect::<Vec<_>>();

			if filter.admits(&info.path) {
				targets.extend(
					state
						.registry
						.global()
						.map(|(handle, client)| (handle, client, true)),
				);
			}

			if origin.is_some() && info.kind == ChangeKind::Removed {
				// The worker already stopped itself, dropping the entry only detaches it
				state.watches.remove(&info.path);
				let released = state.registry.forget_path(&info.path);
				debug!(path = %info.path.display(), released, "Reaped removed path");
			}

			targets
		};

		let failed = targets
			.into_iter()
			.filter_map(|(handle, client, global)| {
				let delivered = if global {
					client.global_watched_path_did_change(info.clone())
				} else {
					client.watched_path_did_change(info.clone())
				};

				delivered.err().map(|Unreachable| handle)
			})
			.collect();

		self.mark_unreachable(failed);
	}

	async fn mount_event(&self, event: MountEvent) {
		let targets = {
			let state = self.state.lock().await;

			if let MountEvent::Unmounted(mount_point) = &event {
				state
					.watches
					.values()
					.filter(|watched| watched.path().starts_with(mount_point))
					.for_each(WatchedPath::revoke);
			}

			state.registry.global().collect::<Vec<_>>()
		};

		let info = ChangeInfo::from(event);

		let failed = targets
			.into_iter()
			.filter_map(|(handle, client)| {
				client
					.global_watched_path_did_change(info.clone())
					.err()
					.map(|Unreachable| handle)
			})
			.collect();

		self.mark_unreachable(failed);
	}
}

#[async_trait]
impl EventSink for Inner {
	async fn dispatch_change(&self, origin: WatchId, info: ChangeInfo) {
		self.dispatch(Some(origin), info).await;
	}

	async fn dispatch_mount_event(&self, event: MountEvent) {
		self.mount_event(event).await;
	}
}

impl std::fmt::Debug for WatcherCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WatcherCoordinator").finish_non_exhaustive()
	}
}

async fn stop_all(watches: Vec<WatchedPath>) {
	if watches.is_empty() {
		return;
	}

	watches
		.into_iter()
		.map(WatchedPath::stop)
		.collect::<Vec<_>>()
		.join()
		.await;
}

/// Paths that no longer exist can still be removed by the name they were added with.
async fn canonical_or_lexical(path: &Path) -> PathBuf {
	match fs::canonicalize(path).await {
		Ok(canonical) => canonical,
		Err(e) => {
			trace!(?e, path = %path.display(), "Falling back to lexical path normalization");
			path.components().collect()
		}
	}
}
