// # Server Roles
//
// The two binaries' application layers. These exercise the engine: the game
// server fronts clients and keeps a link to the DB server; the DB server
// persists what the game servers report.

mod db_server;
mod game;
mod latency;

pub use db_server::{DbServer, DbServerConfig};
pub use game::{DbLinkConfig, GameServer, GameServerConfig};
pub use latency::{LatencySnapshot, LatencyTracker};
