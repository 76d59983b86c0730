// RustyNet - cross-platform asynchronous TCP server engine
//
// Core library: the async I/O provider layer, the session/networking stack,
// keyed dispatch, and the WAL-backed DB task queue, plus the game/DB server
// roles built on top of them.

pub mod common;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod net;
pub mod runtime;
pub mod server;
pub mod signal;

pub use error::{NetError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
