//! The gateway connection core: one session per shard, and the supervisor
//! that starts them.

pub mod heartbeat;
pub mod limiter;
pub mod payload;
pub mod session;
pub mod shard;
pub mod supervisor;
pub mod transport;

pub use limiter::{IdentifyLimiter, LocalIdentifyLimiter};
pub use payload::{GatewayPayload, Opcode};
pub use shard::{SessionState, ShardHandle};
pub use supervisor::{ReadyNotifier, ShardRegistry, ShardSupervisor};
pub use transport::{Connector, Transport, WebSocketConnector};
