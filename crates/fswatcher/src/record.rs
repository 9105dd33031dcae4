//! Change records delivered to clients.

use std::{collections::BTreeSet, path::PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	/// Contents or metadata of the watched node changed
	Changed,
	/// The watched node was deleted, renamed away or lost its volume
	Removed,
	Mounted,
	Unmounted,
}

/// Payload of both client entry points.
///
/// For mount events `path` is the mount point and both entry sets are empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
	pub path: PathBuf,
	pub kind: ChangeKind,
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub added: BTreeSet<String>,
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub removed: BTreeSet<String>,
}

impl ChangeInfo {
	fn bare(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
		Self {
			path: path.into(),
			kind,
			added: BTreeSet::new(),
			removed: BTreeSet::new(),
		}
	}

	#[must_use]
	pub fn changed(path: impl Into<PathBuf>) -> Self {
		Self::bare(path, ChangeKind::Changed)
	}

	#[must_use]
	pub fn entries_changed(
		path: impl Into<PathBuf>,
		added: BTreeSet<String>,
		removed: BTreeSet<String>,
	) -> Self {
		Self {
			path: path.into(),
			kind: ChangeKind::Changed,
			added,
			removed,
		}
	}

	#[must_use]
	pub fn removed(path: impl Into<PathBuf>) -> Self {
		Self::bare(path, ChangeKind::Removed)
	}

	#[must_use]
	pub const fn is_mount_event(&self) -> bool {
		matches!(self.kind, ChangeKind::Mounted | ChangeKind::Unmounted)
	}
}

/// A volume appearing or disappearing, synthesized by the mount monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MountEvent {
	Mounted(PathBuf),
	Unmounted(PathBuf),
}

impl MountEvent {
	#[must_use]
	pub fn mount_point(&self) -> &std::path::Path {
		match self {
			Self::Mounted(path) | Self::Unmounted(path) => path,
		}
	}
}

impl From<MountEvent> for ChangeInfo {
	fn from(event: MountEvent) -> Self {
		match event {
			MountEvent::Mounted(path) => Self::bare(path, ChangeKind::Mounted),
			MountEvent::Unmounted(path) => Self::bare(path, ChangeKind::Unmounted),
		}
	}
}

/// One call on the client capability, as it travels over a channel or the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry_point", content = "info", rename_all = "snake_case")]
pub enum Notification {
	WatchedPathDidChange(ChangeInfo),
	GlobalWatchedPathDidChange(ChangeInfo),
}

impl Notification {
	#[must_use]
	pub const fn info(&self) -> &ChangeInfo {
		match self {
			Self::WatchedPathDidChange(info) | Self::GlobalWatchedPathDidChange(info) => info,
		}
	}

	#[must_use]
	pub fn into_info(self) -> ChangeInfo {
		match self {
			Self::WatchedPathDidChange(info) | Self::GlobalWatchedPathDidChange(info) => info,
		}
	}

	#[must_use]
	pub const fn is_global(&self) -> bool {
		matches!(self, Self::GlobalWatchedPathDidChange(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mount_events_become_records() {
		let info = ChangeInfo::from(MountEvent::Unmounted("/mnt/x".into()));
		assert_eq!(info.kind, ChangeKind::Unmounted);
		assert_eq!(info.path, PathBuf::from("/mnt/x"));
		assert!(info.is_mount_event());
		assert!(info.added.is_empty() && info.removed.is_empty());
	}

	#[test]
	fn empty_entry_sets_are_omitted_on_the_wire() {
		let json = serde_json::to_value(Notification::WatchedPathDidChange(ChangeInfo::removed(
			"/tmp/d",
		)))
		.unwrap();

		assert_eq!(json["entry_point"], "watched_path_did_change");
		assert_eq!(json["info"]["kind"], "removed");
		assert!(json["info"].get("added").is_none());
	}
}
