#![cfg(unix)]

use fswatcher::{
	ipc::{IpcServer, WatcherClient},
	ChangeInfo, ChangeKind, ChannelClient, FsWatcherClient, MountEvent, MountTable, Notification,
	PathFilterTree, WatcherCoordinator, WorkerState,
};

use std::{collections::BTreeSet, fs, path::PathBuf, sync::Arc, time::Duration};

use tempfile::tempdir;
use tokio::{sync::oneshot, time::sleep};
use tracing_test::traced_test;

mod common;

use common::{assert_quiet, next_notification, FakeMountTable, WAIT};

fn everything() -> PathFilterTree {
	PathFilterTree::new(["/"], Vec::<PathBuf>::new(), Vec::<String>::new())
}

fn client() -> (Arc<dyn FsWatcherClient>, async_channel::Receiver<Notification>) {
	let (client, rx) = ChannelClient::new();
	(Arc::new(client), rx)
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn new_entry_is_reported_exactly_once() {
	let dir = tempdir().unwrap();
	let d = dir.path().canonicalize().unwrap().join("d");
	fs::create_dir(&d).unwrap();

	let coordinator = WatcherCoordinator::new(everything());
	let (a_client, a_rx) = client();
	let a = coordinator.register_client(a_client, false).await;
	coordinator.add_watch(a, &d).await.unwrap();

	fs::write(d.join("f"), b"some content").unwrap();

	assert_eq!(
		next_notification(&a_rx).await,
		Notification::WatchedPathDidChange(ChangeInfo::entries_changed(
			&d,
			BTreeSet::from(["f".to_string()]),
			BTreeSet::new(),
		))
	);
	assert_quiet(&a_rx).await;

	coordinator.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn deleted_directory_is_reported_and_released() {
	let dir = tempdir().unwrap();
	let d = dir.path().canonicalize().unwrap().join("d");
	fs::create_dir(&d).unwrap();

	let coordinator = WatcherCoordinator::new(everything());
	let (a_client, a_rx) = client();
	let a = coordinator.register_client(a_client, false).await;
	coordinator.add_watch(a, &d).await.unwrap();

	fs::remove_dir(&d).unwrap();

	// Metadata wakes may come first, the removal is the last record for the path
	let removed = loop {
		let notification = next_notification(&a_rx).await;
		if notification.info().kind == ChangeKind::Removed {
			break notification;
		}
	};
	assert_eq!(removed.info().path, d);
	assert_quiet(&a_rx).await;
	assert_eq!(coordinator.listeners(&d).await, 0);

	// The session no longer holds the path
	coordinator.remove_watch(a, &d).await.unwrap();
	assert!(coordinator.status().await.watches.is_empty());

	coordinator.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn file_write_is_a_generic_change() {
	let dir = tempdir().unwrap();
	let file = dir.path().canonicalize().unwrap().join("notes.txt");
	fs::write(&file, b"").unwrap();

	let coordinator = WatcherCoordinator::new(everything());
	let (a_client, a_rx) = client();
	let a = coordinator.register_client(a_client, false).await;
	coordinator.add_watch(a, &file).await.unwrap();

	let status = coordinator.status().await;
	assert_eq!(status.watches.len(), 1);
	assert!(!status.watches[0].is_dir);
	assert_ne!(status.watches[0].state, WorkerState::Stopped);

	fs::write(&file, b"more").unwrap();

	let notification = next_notification(&a_rx).await;
	assert_eq!(
		notification,
		Notification::WatchedPathDidChange(ChangeInfo::changed(&file))
	);

	coordinator.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn unmount_reaches_global_clients_only() {
	let dir = tempdir().unwrap();
	let unrelated = dir.path().canonicalize().unwrap();

	let table = FakeMountTable::new(["/", "/home", "/mnt/x"]);
	let coordinator = WatcherCoordinator::new(everything());

	let (a_client, a_rx) = client();
	let a = coordinator.register_client(a_client, false).await;
	coordinator.add_watch(a, &unrelated).await.unwrap();

	let (b_client, b_rx) = client();
	coordinator.register_client(b_client, true).await;

	coordinator.start_mount_monitor(Arc::new(table.clone()), Duration::from_millis(20));

	// Let the monitor take its baseline first
	sleep(Duration::from_millis(100)).await;
	table.unmount("/mnt/x");

	let notification = next_notification(&b_rx).await;
	assert!(notification.is_global());
	assert_eq!(notification.info().kind, ChangeKind::Unmounted);
	assert_eq!(notification.info().path, PathBuf::from("/mnt/x"));

	assert_quiet(&a_rx).await;
	assert!(logs_contain("Mount table changed"));

	coordinator.shutdown().await;
}

#[tokio::test]
async fn mount_is_reported_after_baseline() {
	let table = FakeMountTable::new(["/", "/home"]);
	assert_eq!(table.mount_points().unwrap().len(), 2);

	let coordinator = WatcherCoordinator::new(everything());
	let (b_client, b_rx) = client();
	coordinator.register_client(b_client, true).await;

	coordinator.start_mount_monitor(Arc::new(table.clone()), Duration::from_millis(20));
	sleep(Duration::from_millis(100)).await;
	table.mount("/mnt/usb");

	let notification = next_notification(&b_rx).await;
	assert_eq!(notification.info().kind, ChangeKind::Mounted);
	assert_eq!(notification.info().path, PathBuf::from("/mnt/usb"));
	assert_quiet(&b_rx).await;

	coordinator.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn ipc_round_trip_and_disconnect_cleanup() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let d = root.join("d");
	fs::create_dir(&d).unwrap();
	let socket = root.join("run").join("fswatcher.sock");

	let coordinator = WatcherCoordinator::new(PathFilterTree::new(
		[&root],
		Vec::<PathBuf>::new(),
		Vec::<String>::new(),
	));
	let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
	let server = tokio::spawn(IpcServer::new(socket.clone(), coordinator.clone()).run(async {
		let _ = shutdown_rx.await;
	}));

	let started = tokio::time::Instant::now();
	while !socket.exists() {
		assert!(started.elapsed() < WAIT, "watcher socket never appeared");
		sleep(Duration::from_millis(10)).await;
	}

	let (a, a_rx) = WatcherClient::connect(&socket, false).await.unwrap();
	let (global, global_rx) = WatcherClient::connect(&socket, true).await.unwrap();
	assert_ne!(a.session(), global.session());

	a.add_watch(&d).await.unwrap();
	a.add_watch(&d).await.unwrap();

	let status = a.status().await.unwrap();
	assert_eq!(status.sessions, 2);
	assert_eq!(status.watches.len(), 1);
	assert_eq!(status.watches[0].path, d);
	assert_eq!(status.watches[0].listeners, 2);

	fs::write(d.join("f"), b"").unwrap();

	let expected = ChangeInfo::entries_changed(
		&d,
		BTreeSet::from(["f".to_string()]),
		BTreeSet::new(),
	);
	assert_eq!(
		next_notification(&a_rx).await,
		Notification::WatchedPathDidChange(expected.clone())
	);
	assert_eq!(
		next_notification(&global_rx).await,
		Notification::GlobalWatchedPathDidChange(expected)
	);

	// Hanging up releases both of A's requests
	drop(a);

	let started = tokio::time::Instant::now();
	loop {
		let status = global.status().await.unwrap();
		if status.sessions == 1 && status.watches.is_empty() {
			break;
		}

		assert!(started.elapsed() < WAIT, "disconnect was not processed: {status:?}");
		sleep(Duration::from_millis(20)).await;
	}

	global.unregister().await.unwrap();

	shutdown_tx.send(()).unwrap();
	server.await.unwrap().unwrap();
	assert!(!socket.exists());

	coordinator.shutdown().await;
}

#[tokio::test]
async fn requests_for_foreign_sessions_are_ignored() {
	use fswatcher::ipc::{Request, Response};
	use tokio::{
		io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
		net::UnixStream,
	};

	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	let socket = root.join("fswatcher.sock");

	let coordinator = WatcherCoordinator::new(everything());
	let server = IpcServer::new(socket.clone(), coordinator.clone());
	let listener = server.bind().await.unwrap();
	let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
	let server = tokio::spawn(server.serve(listener, async {
		let _ = shutdown_rx.await;
	}));

	let (owner, _owner_rx) = WatcherClient::connect(&socket, false).await.unwrap();

	let stream = UnixStream::connect(&socket).await.unwrap();
	let (reader, mut writer) = stream.into_split();
	let mut reader = BufReader::new(reader);

	for request in [
		Request::Register { is_global: false },
		Request::AddWatch {
			session: owner.session(),
			path: root.clone(),
		},
		Request::Status,
	] {
		let mut line = serde_json::to_string(&request).unwrap();
		line.push('\n');
		writer.write_all(line.as_bytes()).await.unwrap();
	}
	writer.write_all(b"not json\n").await.unwrap();

	let mut frames = Vec::new();
	for _ in 0..3 {
		let mut line = String::new();
		reader.read_line(&mut line).await.unwrap();
		frames.push(serde_json::from_str::<Response>(&line).unwrap());
	}

	assert!(matches!(frames[0], Response::Registered { .. }));
	match &frames[1] {
		Response::Status(status) => assert!(status.watches.is_empty()),
		other => panic!("expected status, got {other:?}"),
	}
	assert!(matches!(frames[2], Response::Error { .. }));

	shutdown_tx.send(()).unwrap();
	server.await.unwrap().unwrap();
	coordinator.shutdown().await;
}

#[tokio::test]
async fn unencodable_record_does_not_cut_the_connection() {
	use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

	let dir = tempdir().unwrap();
	let socket = dir.path().canonicalize().unwrap().join("fswatcher.sock");

	let coordinator = WatcherCoordinator::new(everything());
	let server = IpcServer::new(socket.clone(), coordinator.clone());
	let listener = server.bind().await.unwrap();
	let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
	let server = tokio::spawn(server.serve(listener, async {
		let _ = shutdown_rx.await;
	}));

	let (global, global_rx) = WatcherClient::connect(&socket, true).await.unwrap();

	// Mount points come from the kernel as raw bytes, JSON can't carry this one
	let latin1 = PathBuf::from(OsStr::from_bytes(b"/media/caf\xe9"));
	coordinator
		.dispatch_mount_event(MountEvent::Mounted(latin1))
		.await;
	coordinator
		.dispatch_mount_event(MountEvent::Mounted("/media/ok".into()))
		.await;

	let notification = next_notification(&global_rx).await;
	assert_eq!(notification.info().kind, ChangeKind::Mounted);
	assert_eq!(notification.info().path, PathBuf::from("/media/ok"));
	assert_eq!(global.status().await.unwrap().sessions, 1);

	global.unregister().await.unwrap();

	shutdown_tx.send(()).unwrap();
	server.await.unwrap().unwrap();
	coordinator.shutdown().await;
}
