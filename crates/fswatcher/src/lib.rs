//! Local file-system change-notification service.
//!
//! Clients register with a [`WatcherCoordinator`] and ask it to watch paths. Every distinct
//! path gets one worker task with its own kernel subscription, shared by every client that asked
//! for it and torn down once the last one lets go. Global clients additionally receive every
//! change whose path passes the [`PathFilterTree`], plus volume mount and unmount events from
//! the mount monitor.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
mod coordinator;
mod error;
mod filter;
#[cfg(unix)]
pub mod ipc;
mod mount;
mod record;
mod session;
mod worker;

pub use config::{ConfigError, WatcherConfig};
pub use coordinator::{CoordinatorStatus, WatcherCoordinator};
pub use error::{Error, FileIOError, Result, Unreachable};
pub use filter::PathFilterTree;
pub use mount::{MountSnapshot, MountTable, SystemMountTable};
pub use record::{ChangeInfo, ChangeKind, MountEvent, Notification};
pub use session::{ChannelClient, FsWatcherClient, SessionHandle};
pub use worker::{WatchStatus, WorkerState};
