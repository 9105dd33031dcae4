//! Default backend on top of `notify`'s recommended watcher for the host
//! (inotify on Linux, kqueue on the BSDs, FSEvents on macOS, ReadDirectoryChangesW on Windows).
//!
//! Each subscription owns its own watcher instance, so every watched path gets its own kernel
//! handle, mirroring one subscription per worker.

use std::path::Path;

use async_channel as chan;
use notify::{
	event::{AccessKind, AccessMode, DataChange, ModifyKind},
	Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tracing::{error, trace, warn};

use super::{Backend, EventMask, Subscription};
use crate::{Error, Result};

const EMFILE: i32 = 24;
const ENOSPC: i32 = 28;

#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyBackend;

impl Backend for NotifyBackend {
	fn open(&self, path: &Path) -> Result<Subscription> {
		let (events_tx, events_rx) = chan::unbounded();

		let mut watcher = RecommendedWatcher::new(
			{
				let events_tx = events_tx.clone();
				let watched = path.to_path_buf();
				move |result: notify::Result<Event>| {
					let mask = match result {
						Ok(event) => classify(&watched, &event),
						Err(e) => {
							warn!(?e, watched = %watched.display(), "Kernel watcher reported an error;");
							if watched.exists() {
								EventMask::empty()
							} else {
								EventMask::REVOKE
							}
						}
					};

					if mask.is_empty() || events_tx.is_closed() {
						return;
					}

					// Never blocks, the channel is unbounded
					if events_tx.send_blocking(mask).is_err() {
						trace!(watched = %watched.display(), "Dropping event for a closed subscription");
					}
				}
			},
			Config::default(),
		)
		.map_err(|e| map_notify_error(path, e))?;

		watcher
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(|e| map_notify_error(path, e))?;

		Ok(Subscription::new(events_tx, events_rx, watcher))
	}
}

/// Reduces one `notify` event to the structural mask of the watched node.
///
/// Events on a child of a watched directory only matter when they add, remove or rename an
/// entry; content changes inside children do not touch the directory's entry list.
pub(super) fn classify(watched: &Path, event: &Event) -> EventMask {
	let on_self = event.paths.is_empty() || event.paths.iter().any(|path| path == watched);

	if !on_self {
		return match event.kind {
			EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
				EventMask::WRITE
			}
			_ => EventMask::empty(),
		};
	}

	match event.kind {
		EventKind::Remove(_) => EventMask::DELETE,
		EventKind::Modify(ModifyKind::Name(_)) => EventMask::RENAME,
		EventKind::Modify(ModifyKind::Data(DataChange::Size)) => EventMask::WRITE | EventMask::EXTEND,
		EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
			EventMask::WRITE
		}
		EventKind::Access(AccessKind::Close(AccessMode::Write)) => EventMask::WRITE,
		EventKind::Modify(ModifyKind::Metadata(_)) => {
			// inotify folds link-count changes into IN_ATTRIB
			EventMask::ATTRIB | EventMask::LINK
		}
		EventKind::Create(_) => EventMask::WRITE,
		EventKind::Access(_) => EventMask::empty(),
		EventKind::Any | EventKind::Other => {
			if watched.exists() {
				EventMask::ATTRIB
			} else {
				EventMask::REVOKE
			}
		}
	}
}

fn map_notify_error(path: &Path, e: notify::Error) -> Error {
	let path: Box<Path> = path.into();

	match e.kind {
		notify::ErrorKind::MaxFilesWatch => Error::SubscriptionExhausted(path),
		notify::ErrorKind::PathNotFound => Error::InvalidPath(path),
		notify::ErrorKind::Io(io_err) => {
			// inotify reports instance and watch limits as EMFILE and ENOSPC
			if cfg!(unix) && matches!(io_err.raw_os_error(), Some(EMFILE | ENOSPC)) {
				return Error::SubscriptionExhausted(path);
			}

			if io_err.kind() == std::io::ErrorKind::NotFound {
				Error::InvalidPath(path)
			} else {
				Error::OpenFailed {
					path,
					reason: io_err.to_string(),
				}
			}
		}
		other => {
			error!(?other, path = %path.display(), "Unexpected watcher error;");
			Error::OpenFailed {
				path,
				reason: format!("{other:?}"),
			}
		}
	}
}
