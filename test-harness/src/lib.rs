//! Test-only collaborators for engine integration tests: an in-process
//! RESP2 mock store (plus a mock sentinel) and a recording `Node`
//! implementation.

pub mod node;
pub mod store;

pub use node::{ClientEnvelope, MessageKind, TestNode, TestNodeEvents};
pub use store::{MockSentinel, MockStore};
