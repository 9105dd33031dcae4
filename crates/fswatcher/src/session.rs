//! Connected clients and the paths each of them is interested in.

use std::{
	collections::HashMap,
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_channel as chan;
use serde::{Deserialize, Serialize};

use crate::{
	error::Unreachable,
	record::{ChangeInfo, Notification},
};

/// Opaque identifier of one registered client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(u64);

impl From<u64> for SessionHandle {
	fn from(id: u64) -> Self {
		Self(id)
	}
}

impl fmt::Display for SessionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// What a client process exposes to the watcher. Both calls are one-way and must not block.
pub trait FsWatcherClient: Send + Sync + 'static {
	fn watched_path_did_change(&self, info: ChangeInfo) -> Result<(), Unreachable>;

	fn global_watched_path_did_change(&self, info: ChangeInfo) -> Result<(), Unreachable>;
}

/// Client capability backed by a channel, the receiving end gets every call as a [`Notification`].
#[derive(Debug, Clone)]
pub struct ChannelClient(chan::Sender<Notification>);

impl ChannelClient {
	#[must_use]
	pub fn new() -> (Self, chan::Receiver<Notification>) {
		let (tx, rx) = chan::unbounded();
		(Self(tx), rx)
	}

	fn deliver(&self, notification: Notification) -> Result<(), Unreachable> {
		self.0.try_send(notification).map_err(|_| Unreachable)
	}
}

impl FsWatcherClient for ChannelClient {
	fn watched_path_did_change(&self, info: ChangeInfo) -> Result<(), Unreachable> {
		self.deliver(Notification::WatchedPathDidChange(info))
	}

	fn global_watched_path_did_change(&self, info: ChangeInfo) -> Result<(), Unreachable> {
		self.deliver(Notification::GlobalWatchedPathDidChange(info))
	}
}

pub(crate) struct ClientSession {
	client: Arc<dyn FsWatcherClient>,
	/// Multiset of requested paths, a path is only present while its count is positive
	paths: HashMap<PathBuf, usize>,
	is_global: bool,
}

impl ClientSession {
	fn new(client: Arc<dyn FsWatcherClient>, is_global: bool) -> Self {
		Self {
			client,
			paths: HashMap::new(),
			is_global,
		}
	}

	pub(crate) const fn is_global(&self) -> bool {
		self.is_global
	}

	pub(crate) fn client(&self) -> Arc<dyn FsWatcherClient> {
		Arc::clone(&self.client)
	}

	#[cfg(test)]
	pub(crate) fn count(&self, path: &Path) -> usize {
		self.paths.get(path).copied().unwrap_or(0)
	}

	pub(crate) fn is_watching(&self, path: &Path) -> bool {
		self.paths.contains_key(path)
	}

	/// Returns the new count for `path`.
	pub(crate) fn add_path(&mut self, path: &Path) -> usize {
		let count = self.paths.entry(path.to_path_buf()).or_insert(0);
		*count += 1;
		*count
	}

	/// Decrements `path`, never below zero. Returns whether anything was decremented.
	pub(crate) fn remove_path(&mut self, path: &Path) -> bool {
		let Some(count) = self.paths.get_mut(path) else {
			return false;
		};

		*count -= 1;
		if *count == 0 {
			self.paths.remove(path);
		}

		true
	}

	/// Drops every request for `path` at once, returning how many there were.
	pub(crate) fn forget_path(&mut self, path: &Path) -> usize {
		self.paths.remove(path).unwrap_or(0)
	}

	pub(crate) fn into_paths(self) -> HashMap<PathBuf, usize> {
		self.paths
	}
}

impl fmt::Debug for ClientSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientSession")
			.field("paths", &self.paths)
			.field("is_global", &self.is_global)
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
	sessions: HashMap<SessionHandle, ClientSession>,
	next_handle: u64,
}

impl ClientRegistry {
	pub(crate) fn register(
		&mut self,
		client: Arc<dyn FsWatcherClient>,
		is_global: bool,
	) -> SessionHandle {
		self.next_handle += 1;
		let handle = SessionHandle(self.next_handle);

		self.sessions
			.insert(handle, ClientSession::new(client, is_global));

		handle
	}

	pub(crate) fn unregister(&mut self, handle: SessionHandle) -> Option<ClientSession> {
		self.sessions.remove(&handle)
	}

	pub(crate) fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut ClientSession> {
		self.sessions.get_mut(&handle)
	}

	pub(crate) fn get(&self, handle: SessionHandle) -> Option<&ClientSession> {
		self.sessions.get(&handle)
	}

	/// Sessions holding at least one request for exactly `path`
	pub(crate) fn watching<'a>(
		&'a self,
		path: &'a Path,
	) -> impl Iterator<Item = (SessionHandle, Arc<dyn FsWatcherClient>)> + 'a {
		self.sessions
			.iter()
			.filter(move |(_, session)| session.is_watching(path))
			.map(|(handle, session)| (*handle, session.client()))
	}

	pub(crate) fn global(&self) -> impl Iterator<Item = (SessionHandle, Arc<dyn FsWatcherClient>)> + '_ {
		self.sessions
			.iter()
			.filter(|(_, session)| session.is_global())
			.map(|(handle, session)| (*handle, session.client()))
	}

	/// Clears `path` from every session, returning the total count removed.
	pub(crate) fn forget_path(&mut self, path: &Path) -> usize {
		self.sessions
			.values_mut()
			.map(|session| session.forget_path(path))
			.sum()
	}

	/// Sum of every session's count for `path`
	#[cfg(test)]
	pub(crate) fn total_count(&self, path: &Path) -> usize {
		self.sessions.values().map(|session| session.count(path)).sum()
	}

	pub(crate) fn len(&self) -> usize {
		self.sessions.len()
	}

	/// Drops every session, handles keep counting up from where they were.
	pub(crate) fn clear(&mut self) {
		self.sessions.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client() -> Arc<dyn FsWatcherClient> {
		Arc::new(ChannelClient::new().0)
	}

	#[test]
	fn per_session_counts_are_a_multiset() {
		let mut registry = ClientRegistry::default();
		let handle = registry.register(client(), false);
		let session = registry.get_mut(handle).unwrap();
		let path = Path::new("/tmp/d");

		assert_eq!(session.add_path(path), 1);
		assert_eq!(session.add_path(path), 2);
		assert!(session.remove_path(path));
		assert!(session.is_watching(path));
		assert!(session.remove_path(path));
		assert!(!session.is_watching(path));

		// floor-clamped at zero
		assert!(!session.remove_path(path));
		assert_eq!(session.count(path), 0);
	}

	#[test]
	fn watching_and_global_queries() {
		let mut registry = ClientRegistry::default();
		let a = registry.register(client(), false);
		let b = registry.register(client(), true);
		let path = Path::new("/tmp/d");

		registry.get_mut(a).unwrap().add_path(path);
		registry.get_mut(b).unwrap().add_path(path);
		registry.get_mut(b).unwrap().add_path(path);

		let mut watching = registry.watching(path).map(|(h, _)| h).collect::<Vec<_>>();
		watching.sort();
		assert_eq!(watching, vec![a, b]);
		assert_eq!(registry.global().map(|(h, _)| h).collect::<Vec<_>>(), vec![b]);
		assert_eq!(registry.total_count(path), 3);

		assert_eq!(registry.forget_path(path), 3);
		assert_eq!(registry.watching(path).count(), 0);
	}

	#[test]
	fn handles_are_never_reused() {
		let mut registry = ClientRegistry::default();
		let first = registry.register(client(), false);
		assert!(registry.unregister(first).is_some());
		assert!(registry.unregister(first).is_none());

		let second = registry.register(client(), false);
		assert_ne!(first, second);
		assert_eq!(registry.len(), 1);
	}

	#[test]
	fn channel_client_reports_disconnect() {
		let (client, rx) = ChannelClient::new();
		assert!(client
			.watched_path_did_change(ChangeInfo::changed("/a"))
			.is_ok());
		assert_eq!(
			rx.try_recv().unwrap(),
			Notification::WatchedPathDidChange(ChangeInfo::changed("/a"))
		);

		drop(rx);
		assert!(client
			.global_watched_path_did_change(ChangeInfo::changed("/a"))
			.is_err());
	}
}
