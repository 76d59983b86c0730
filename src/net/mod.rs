// # Network Layer
//
// Session-centric networking over the async I/O provider:
//
// - `packet`: length-prefixed wire framing and the application packet codecs
// - `session`: per-connection state, ordered write queue, stream reassembly
// - `pool`: pre-allocated session slots with shared-reference leases
// - `manager`: connection-id registry with snapshot-based bulk operations
// - `event`: typed channels and the multi-subscriber event bus
// - `engine`: listener, accept loop, completion workers and logic offload

pub mod engine;
pub mod event;
pub mod manager;
pub mod packet;
pub mod pool;
pub mod session;

pub use engine::{EngineConfig, EngineStats, NetworkEngine};
pub use event::{Channel, NetworkEvent, NetworkEventBus, NetworkEventData};
pub use manager::SessionManager;
pub use packet::{PacketHeader, HEADER_SIZE};
pub use pool::{SessionPool, SessionRef};
pub use session::{Session, SessionHandler, SessionState};
