//! Kernel change-notification capability.
//!
//! A [`Backend`] opens one [`Subscription`] per watched path. The subscription's wait is the
//! only place a worker blocks, and closing the subscription (through any [`Closer`]) is what
//! unblocks it.

use std::{path::Path, sync::Arc};

use async_channel as chan;
use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::trace;

use crate::Result;

mod native;

#[cfg(test)]
pub(crate) mod manual;

pub use native::NotifyBackend;

bitflags! {
	/// Structural events a subscription reports, OR-ed together when several arrive at once.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct EventMask: u32 {
		/// Content written, or an entry added/removed/renamed in a watched directory
		const WRITE  = 1 << 0;
		/// Watched file grew
		const EXTEND = 1 << 1;
		const ATTRIB = 1 << 2;
		const LINK   = 1 << 3;
		/// Watched node itself was deleted
		const DELETE = 1 << 4;
		/// Watched node itself was renamed
		const RENAME = 1 << 5;
		/// Underlying volume was unmounted or access was revoked
		const REVOKE = 1 << 6;
	}
}

impl EventMask {
	/// The watched node is no longer reachable at its path.
	#[must_use]
	pub const fn is_gone(self) -> bool {
		self.intersects(Self::DELETE.union(Self::RENAME).union(Self::REVOKE))
	}

	#[must_use]
	pub const fn is_content_change(self) -> bool {
		self.intersects(Self::WRITE.union(Self::EXTEND))
	}

	#[must_use]
	pub const fn is_metadata_change(self) -> bool {
		self.intersects(Self::ATTRIB.union(Self::LINK))
	}
}

/// Per-target kernel event primitive.
pub trait Backend: Send + Sync + 'static {
	/// Subscribe to structural events of `path`, which must already exist and be canonical.
	fn open(&self, path: &Path) -> Result<Subscription>;
}

type Guard = Box<dyn Send>;

/// One open kernel subscription
#[derive(Debug)]
pub struct Subscription {
	events_rx: chan::Receiver<EventMask>,
	closer: Closer,
}

impl Subscription {
	/// `guard` keeps the kernel resources alive and is dropped on close.
	pub fn new(
		events_tx: chan::Sender<EventMask>,
		events_rx: chan::Receiver<EventMask>,
		guard: impl Send + 'static,
	) -> Self {
		Self {
			events_rx,
			closer: Closer {
				events_tx,
				guard: Arc::new(Mutex::new(Some(Box::new(guard)))),
			},
		}
	}

	/// Suspends until the next wake, coalescing everything already queued into one mask.
	///
	/// Returns `None` once the subscription is closed.
	pub async fn wait(&self) -> Option<EventMask> {
		let mut mask = self.events_rx.recv().await.ok()?;

		if self.closer.is_closed() {
			return None;
		}

		while let Ok(more) = self.events_rx.try_recv() {
			mask |= more;
		}

		Some(mask)
	}

	#[must_use]
	pub fn closer(&self) -> Closer {
		self.closer.clone()
	}

	pub fn close(&self) {
		self.closer.close();
	}
}

/// Handle that can cancel a blocked [`Subscription::wait`] from another task
#[derive(Clone)]
pub struct Closer {
	events_tx: chan::Sender<EventMask>,
	guard: Arc<Mutex<Option<Guard>>>,
}

impl Closer {
	/// Closes the event channel, waking any pending wait, then releases the kernel resources.
	/// Idempotent.
	pub fn close(&self) {
		if self.events_tx.close() {
			trace!("Subscription closed");
		}

		drop(self.guard.lock().take());
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.events_tx.is_closed()
	}

	/// Injects a synthetic wake, e.g. a revoke learned from the mount monitor.
	pub fn signal(&self, mask: EventMask) -> bool {
		self.events_tx.try_send(mask).is_ok()
	}
}

impl std::fmt::Debug for Closer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Closer")
			.field("is_closed", &self.is_closed())
			.finish_non_exhaustive()
	}
}
