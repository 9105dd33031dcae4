#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_channel as chan;
use fswatcher::{MountSnapshot, MountTable, Notification, Result};
use parking_lot::Mutex;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(500);

pub async fn next_notification(rx: &chan::Receiver<Notification>) -> Notification {
	timeout(WAIT, rx.recv())
		.await
		.expect("no notification in time")
		.expect("notification channel closed")
}

pub async fn assert_quiet(rx: &chan::Receiver<Notification>) {
	if let Ok(Ok(unexpected)) = timeout(QUIET, rx.recv()).await {
		panic!("unexpected notification: {unexpected:?}");
	}
}

/// Mount table whose contents the test changes at will
#[derive(Debug, Default, Clone)]
pub struct FakeMountTable(Arc<Mutex<Vec<PathBuf>>>);

impl FakeMountTable {
	pub fn new<P: Into<PathBuf>>(mounts: impl IntoIterator<Item = P>) -> Self {
		Self(Arc::new(Mutex::new(mounts.into_iter().map(Into::into).collect())))
	}

	pub fn unmount(&self, mount_point: impl Into<PathBuf>) {
		let mount_point = mount_point.into();
		self.0.lock().retain(|path| *path != mount_point);
	}

	pub fn mount(&self, mount_point: impl Into<PathBuf>) {
		self.0.lock().push(mount_point.into());
	}
}

impl MountTable for FakeMountTable {
	fn mount_points(&self) -> Result<MountSnapshot> {
		Ok(self.0.lock().iter().cloned().collect())
	}
}
