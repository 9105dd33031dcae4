//! Mount-point monitor.
//!
//! Polls the host mount table on a fixed interval and turns the difference between two
//! consecutive snapshots into [`MountEvent`]s for global watchers.

use std::{
	collections::BTreeSet,
	path::{Path, PathBuf},
	pin::pin,
	sync::{Arc, Weak},
	time::Duration,
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use tokio::{
	spawn,
	task::{spawn_blocking, JoinHandle},
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{record::MountEvent, worker::EventSink, Error, Result};

/// Source of the currently mounted volumes.
pub trait MountTable: Send + Sync + 'static {
	/// May block, it is always called from a blocking-capable thread.
	fn mount_points(&self) -> Result<MountSnapshot>;
}

/// Ordered set of mount points, replaced wholesale on every poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MountSnapshot(BTreeSet<PathBuf>);

impl MountSnapshot {
	#[must_use]
	pub fn contains(&self, path: impl AsRef<Path>) -> bool {
		self.0.contains(path.as_ref())
	}

	pub fn iter(&self) -> impl Iterator<Item = &Path> {
		self.0.iter().map(PathBuf::as_path)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Events that take `self` to `newer`: every new mount point, then every vanished one.
	#[must_use]
	pub fn diff(&self, newer: &Self) -> Vec<MountEvent> {
		newer
			.0
			.difference(&self.0)
			.cloned()
			.map(MountEvent::Mounted)
			.chain(self.0.difference(&newer.0).cloned().map(MountEvent::Unmounted))
			.collect()
	}
}

impl<P: Into<PathBuf>> FromIterator<P> for MountSnapshot {
	fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
		Self(iter.into_iter().map(Into::into).collect())
	}
}

impl IntoIterator for MountSnapshot {
	type Item = PathBuf;
	type IntoIter = std::collections::btree_set::IntoIter<PathBuf>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

/// Pseudo and memory-backed file systems, which never hold user volumes
const VIRTUAL_FILESYSTEMS: &[&str] = &[
	"autofs",
	"binfmt_misc",
	"bpf",
	"cgroup",
	"cgroup2",
	"configfs",
	"debugfs",
	"devfs",
	"devpts",
	"devtmpfs",
	"fusectl",
	"hugetlbfs",
	"mqueue",
	"proc",
	"pstore",
	"ramfs",
	"securityfs",
	"sysfs",
	"tmpfs",
	"tracefs",
];

fn is_virtual_filesystem(fs: &str) -> bool {
	VIRTUAL_FILESYSTEMS.contains(&fs.to_lowercase().as_str())
}

/// The host's mount table: `/proc/self/mounts` on Linux, the system disk list elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMountTable;

#[cfg(target_os = "linux")]
impl MountTable for SystemMountTable {
	fn mount_points(&self) -> Result<MountSnapshot> {
		std::fs::read_to_string("/proc/self/mounts")
			.map(|contents| parse_proc_mounts(&contents))
			.map_err(Error::TransientMountReadFailure)
	}
}

#[cfg(not(target_os = "linux"))]
impl MountTable for SystemMountTable {
	fn mount_points(&self) -> Result<MountSnapshot> {
		let disks = sysinfo::Disks::new_with_refreshed_list();

		Ok(disks
			.list()
			.iter()
			.filter(|disk| !is_virtual_filesystem(&disk.file_system().to_string_lossy()))
			.map(|disk| disk.mount_point().to_path_buf())
			.collect())
	}
}

/// Parses the `fstab`-like format of `/proc/<pid>/mounts`, skipping virtual file systems.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_mounts(contents: &str) -> MountSnapshot {
	contents
		.lines()
		.filter_map(|line| {
			let mut fields = line.split_ascii_whitespace();
			let (_device, mount_point, fs_type) = (fields.next()?, fields.next()?, fields.next()?);

			(!is_virtual_filesystem(fs_type)).then(|| unescape_mount_point(mount_point))
		})
		.collect()
}

/// The kernel escapes space, tab, newline and backslash as three-digit octal sequences.
fn unescape_mount_point(raw: &str) -> PathBuf {
	let bytes = raw.as_bytes();
	let mut unescaped = Vec::with_capacity(bytes.len());

	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'\\' && i + 3 < bytes.len() {
			if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 4])
				.ok()
				.and_then(|octal| u8::from_str_radix(octal, 8).ok())
			{
				unescaped.push(byte);
				i += 4;
				continue;
			}
		}

		unescaped.push(bytes[i]);
		i += 1;
	}

	#[cfg(unix)]
	{
		use std::os::unix::ffi::OsStringExt;
		PathBuf::from(std::ffi::OsString::from_vec(unescaped))
	}

	#[cfg(not(unix))]
	{
		PathBuf::from(String::from_utf8_lossy(&unescaped).into_owned())
	}
}

async fn read_mount_table(table: &Arc<dyn MountTable>) -> Result<MountSnapshot> {
	let table = Arc::clone(table);

	spawn_blocking(move || table.mount_points())
		.await
		.map_err(|e| Error::TransientMountReadFailure(std::io::Error::other(e)))?
}

/// The periodic polling task
#[derive(Debug)]
pub(crate) struct MountMonitor {
	handle: Option<JoinHandle<()>>,
	stop_tx: chan::Sender<()>,
}

impl MountMonitor {
	#[instrument(name = "mount_monitor", skip_all, fields(?interval))]
	pub(crate) fn spawn(
		table: Arc<dyn MountTable>,
		interval: Duration,
		sink: Weak<dyn EventSink>,
	) -> Self {
		let (stop_tx, stop_rx) = chan::bounded(1);

		let handle = spawn(poll(table, interval, sink, stop_rx).in_current_span());

		Self {
			handle: Some(handle),
			stop_tx,
		}
	}

	pub(crate) async fn stop(mut self) {
		if self.stop_tx.send(()).await.is_err() {
			trace!("Mount monitor already exited");
		}

		if let Some(handle) = self.handle.take() {
			if let Err(e) = handle.await {
				error!(?e, "Failed to join mount monitor task;");
			}
		}
	}
}

impl Drop for MountMonitor {
	fn drop(&mut self) {
		if self.handle.is_some() {
			let _ = self.stop_tx.try_send(());
		}
	}
}

async fn poll(
	table: Arc<dyn MountTable>,
	period: Duration,
	sink: Weak<dyn EventSink>,
	stop_rx: chan::Receiver<()>,
) {
	enum StreamMessage {
		Tick,
		Stop,
	}

	let mut ticker = interval_at(Instant::now(), period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let mut msg_stream = pin!((
		IntervalStream::new(ticker).map(|_| StreamMessage::Tick),
		stop_rx.map(|()| StreamMessage::Stop),
	)
		.merge());

	let mut previous: Option<MountSnapshot> = None;

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Tick => {
				let current = match read_mount_table(&table).await {
					Ok(current) => current,
					Err(e) => {
						warn!(?e, "Skipping mount poll cycle;");
						continue;
					}
				};

				let Some(previous_snapshot) = previous.as_ref() else {
					debug!(mounts = current.len(), "Took initial mount snapshot");
					previous = Some(current);
					continue;
				};

				let events = previous_snapshot.diff(&current);
				previous = Some(current);

				if events.is_empty() {
					continue;
				}

				let Some(sink) = sink.upgrade() else {
					debug!("Coordinator is gone, stopping mount monitor");
					break;
				};

				for event in events {
					info!(?event, "Mount table changed");
					sink.dispatch_mount_event(event).await;
				}
			}

			StreamMessage::Stop => {
				debug!("Stopping mount monitor");
				break;
			}
		}
	}
}
