pub mod identity;
pub mod memory;
pub mod types;

pub use identity::{verify, Identity, SignError};
pub use memory::{CallCounts, MemoryGrid, MemoryNodeClient, NodeBehavior};
pub use types::{CapacityDirectory, ChainClient, GridClients, NodeClient, NodePool};
