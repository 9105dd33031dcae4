//! In-memory backend driven by tests.

use std::{
	collections::{HashMap, HashSet},
	path::{Path, PathBuf},
};

use async_channel as chan;
use parking_lot::Mutex;

use super::{Backend, EventMask, Subscription};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct ManualBackend {
	opened: Mutex<HashMap<PathBuf, Vec<chan::Sender<EventMask>>>>,
	exhausted: Mutex<HashSet<PathBuf>>,
}

impl ManualBackend {
	/// Wakes every live subscription of `path`.
	pub(crate) fn fire(&self, path: impl AsRef<Path>, mask: EventMask) {
		if let Some(senders) = self.opened.lock().get(path.as_ref()) {
			for sender in senders {
				let _ = sender.try_send(mask);
			}
		}
	}

	pub(crate) fn live_subscriptions(&self, path: impl AsRef<Path>) -> usize {
		self.opened
			.lock()
			.get(path.as_ref())
			.map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
	}

	pub(crate) fn total_opened(&self, path: impl AsRef<Path>) -> usize {
		self.opened.lock().get(path.as_ref()).map_or(0, Vec::len)
	}

	/// Makes every following `open` of `path` fail as if the host ran out of watches.
	pub(crate) fn exhaust(&self, path: impl Into<PathBuf>) {
		self.exhausted.lock().insert(path.into());
	}
}

impl Backend for ManualBackend {
	fn open(&self, path: &Path) -> Result<Subscription> {
		if self.exhausted.lock().contains(path) {
			return Err(Error::SubscriptionExhausted(path.into()));
		}

		if !path.exists() {
			return Err(Error::InvalidPath(path.into()));
		}

		let (events_tx, events_rx) = chan::unbounded();
		self.opened
			.lock()
			.entry(path.to_path_buf())
			.or_default()
			.push(events_tx.clone());

		Ok(Subscription::new(events_tx, events_rx, ()))
	}
}
