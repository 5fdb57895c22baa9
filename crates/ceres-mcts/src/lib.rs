//! Parallel PUCT search core.
//!
//! The tree lives in a fixed-capacity [`node::NodeStore`]; worker threads run
//! gather → evaluate → backup cycles against it. Chess itself and the neural
//! network are capabilities ([`position::PositionOps`],
//! [`backend::BatchedEvaluator`]) supplied by the embedding engine.

pub mod backend;
pub mod config;
pub mod node;
pub mod policy;
pub mod position;
pub mod search;
pub mod transposition;
pub mod tree;

mod backup;
mod gather;
mod select;

#[cfg(test)]
pub(crate) mod test_util;

pub use backend::{
    BatchedEvaluator, EvalBatch, EvalError, EvalOutput, InputEncoding, LeafValues, PolicyLease,
    UniformEvaluator,
};
pub use config::{BestMoveSelection, SearchConfig};
pub use node::{ChildSlot, NodeIdx, NodeRecord, NodeStats, NodeStore, RowIdx};
pub use policy::{CompressedPolicy, PRIOR_ONE};
pub use position::{EncodedMove, PositionHash, PositionOps, TerminalStatus};
pub use search::{
    search, RootMove, SearchLimit, SearchResult, SearchStatus, SearchTelemetry,
};
pub use transposition::TranspositionIndex;
pub use tree::{NodeSnapshot, SearchTree, TreeSnapshot};
