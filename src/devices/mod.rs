//! Device nodes, claims and the device tree.
//!
//! Devices are exposed as trees of [`node::Node`]s. Leaves carry values and may
//! be readable, polled or writable; writable leaves are guarded by a
//! [`claim::Claimable`] so that at most one agent drives them at a time.

pub mod claim;
pub mod executor;
pub mod node;
pub mod simulated;
pub mod tree;
pub mod value;

pub use claim::{Claim, ClaimMarker, ClaimState, ClaimSymbol, Claimable};
pub use executor::{DevicesExecutor, DevicesInstruction};
pub use node::{ConnectionState, Node, NodeDriver, NodeKind, NodeState};
pub use tree::{DeviceTree, NodePath};
pub use value::NodeValue;
