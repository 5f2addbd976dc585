//! Node execution records and their store.

mod node;
mod store;

pub use node::{ChainState, NodeExecution};
pub use store::{InMemoryNodeExecutionStore, NodeExecutionStore, NodeOps};
