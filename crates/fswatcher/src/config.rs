//! Startup configuration: a TOML file under the user's config directory, overridden by
//! `FSWATCHER_*` environment variables.

use std::{
	env,
	ffi::OsString,
	fs, io,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{error::FileIOError, filter::PathFilterTree, mount::MountTable};

pub const SOCKET_ENV: &str = "FSWATCHER_SOCKET";
pub const INCLUDE_PATHS_ENV: &str = "FSWATCHER_INCLUDE_PATHS";
pub const EXCLUDE_PATHS_ENV: &str = "FSWATCHER_EXCLUDE_PATHS";
pub const EXCLUDED_SUFFIXES_ENV: &str = "FSWATCHER_EXCLUDED_SUFFIXES";
pub const MOUNT_POLL_ENV: &str = "FSWATCHER_MOUNT_POLL_MS";

const SOCKET_FILE_NAME: &str = "fswatcher.sock";
const DEFAULT_MOUNT_POLL_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {0}")]
	Read(#[from] FileIOError),
	#[error("failed to parse config file <path='{}'>: {source}", .path.display())]
	Parse {
		path: Box<Path>,
		#[source]
		source: toml::de::Error,
	},
	#[error("invalid value for {var}: {reason}")]
	InvalidEnv { var: &'static str, reason: String },
	#[error("mount poll interval must be positive")]
	ZeroPollInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
	pub socket_path: PathBuf,
	/// Empty means every currently mounted volume
	pub include_paths: Vec<PathBuf>,
	pub exclude_paths: Vec<PathBuf>,
	pub excluded_suffixes: Vec<String>,
	pub mount_poll_interval_ms: u64,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			socket_path: default_socket_path(),
			include_paths: Vec::new(),
			exclude_paths: Vec::new(),
			excluded_suffixes: Vec::new(),
			mount_poll_interval_ms: DEFAULT_MOUNT_POLL_INTERVAL_MS,
		}
	}
}

/// `$XDG_RUNTIME_DIR/fswatcher.sock`, or the cache or temp directory when there is no runtime dir.
#[must_use]
pub fn default_socket_path() -> PathBuf {
	dirs::runtime_dir()
		.or_else(dirs::cache_dir)
		.unwrap_or_else(env::temp_dir)
		.join(SOCKET_FILE_NAME)
}

impl WatcherConfig {
	/// `<config dir>/fswatcher/config.toml`
	#[must_use]
	pub fn default_path() -> Option<PathBuf> {
		dirs::config_dir().map(|dir| dir.join("fswatcher").join("config.toml"))
	}

	/// Reads `path` (or the default file, which may be missing) and applies the process
	/// environment on top.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) => Self::from_file(path)?,
			None => match Self::default_path() {
				Some(path) => Self::from_file(&path).or_else(|e| match e {
					ConfigError::Read(FileIOError { ref source, .. })
						if source.kind() == io::ErrorKind::NotFound =>
					{
						debug!(path = %path.display(), "No config file, using defaults");
						Ok(Self::default())
					}
					e => Err(e),
				})?,
				None => Self::default(),
			},
		};

		config.apply_env(|var| env::var_os(var))?;
		config.validate()?;

		Ok(config)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		let contents = fs::read_to_string(path)
			.map_err(|e| FileIOError::with_context(path, e, "reading config file"))?;

		toml::from_str(&contents).map_err(|source| ConfigError::Parse {
			path: path.into(),
			source,
		})
	}

	/// Overrides fields from `lookup`, which is the process environment outside of tests.
	pub fn apply_env(
		&mut self,
		lookup: impl Fn(&'static str) -> Option<OsString>,
	) -> Result<(), ConfigError> {
		if let Some(socket) = lookup(SOCKET_ENV).filter(|value| !value.is_empty()) {
			self.socket_path = socket.into();
		}

		if let Some(paths) = lookup(INCLUDE_PATHS_ENV) {
			self.include_paths = env::split_paths(&paths)
				.filter(|path| !path.as_os_str().is_empty())
				.collect();
		}

		if let Some(paths) = lookup(EXCLUDE_PATHS_ENV) {
			self.exclude_paths = env::split_paths(&paths)
				.filter(|path| !path.as_os_str().is_empty())
				.collect();
		}

		if let Some(suffixes) = lookup(EXCLUDED_SUFFIXES_ENV) {
			self.excluded_suffixes = utf8(EXCLUDED_SUFFIXES_ENV, suffixes)?
				.split(',')
				.map(str::trim)
				.filter(|suffix| !suffix.is_empty())
				.map(ToOwned::to_owned)
				.collect();
		}

		if let Some(interval) = lookup(MOUNT_POLL_ENV) {
			self.mount_poll_interval_ms = utf8(MOUNT_POLL_ENV, interval)?
				.trim()
				.parse()
				.map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
					var: MOUNT_POLL_ENV,
					reason: e.to_string(),
				})?;
		}

		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.mount_poll_interval_ms == 0 {
			return Err(ConfigError::ZeroPollInterval);
		}

		Ok(())
	}

	#[must_use]
	pub const fn mount_poll_interval(&self) -> Duration {
		Duration::from_millis(self.mount_poll_interval_ms)
	}

	/// Builds the admission filter, taking the include roots from `mounts` when none are set.
	pub fn build_filter(&self, mounts: &dyn MountTable) -> PathFilterTree {
		let include_paths = if self.include_paths.is_empty() {
			match mounts.mount_points() {
				Ok(snapshot) if !snapshot.is_empty() => snapshot.into_iter().collect(),
				Ok(_) => vec![PathBuf::from("/")],
				Err(e) => {
					warn!(?e, "Failed to read mounted volumes, including the whole file system;");
					vec![PathBuf::from("/")]
				}
			}
		} else {
			self.include_paths.clone()
		};

		debug!(
			include = include_paths.len(),
			exclude = self.exclude_paths.len(),
			suffixes = self.excluded_suffixes.len(),
			"Building global path filter"
		);

		PathFilterTree::new(include_paths, &self.exclude_paths, &self.excluded_suffixes)
	}
}

fn utf8(var: &'static str, value: OsString) -> Result<String, ConfigError> {
	value.into_string().map_err(|value| ConfigError::InvalidEnv {
		var,
		reason: format!("not valid UTF-8: {}", value.to_string_lossy()),
	})
}
