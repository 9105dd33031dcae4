//! Local IPC channel: newline-delimited JSON over a Unix domain socket.
//!
//! Every connection hosts exactly one client session. `unregister`, `add_watch` and
//! `remove_watch` are fire-and-forget; the watcher logs failures and never answers them.
//! Closing the connection releases every watch of its session.

mod client;
mod protocol;
mod server;

pub use client::WatcherClient;
pub use protocol::{Request, Response};
pub use server::IpcServer;
