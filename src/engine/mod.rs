// Containers, tokens and the sequencer
pub mod container;
#[cfg(feature = "python")]
pub mod controller; // numpy-facing span report
pub mod field;
pub mod loader;
pub mod sequencer;
#[cfg(test)]
pub(crate) mod testing;
pub mod token;

pub use container::{Container, ExecutionType, OperationType};
pub use field::{Element, Field, FieldPartition, FieldUid, HaloUpdateOptions, MultiXpuData, TransferMode};
pub use loader::{ComputeFn, Execution, Loader, LoadingLambda, LoadingMode};
pub use sequencer::{ExecutionGraph, GraphNode, NodeRole, Occ, Sequencer, SequencerOptions};
pub use token::{AccessType, ComputePattern, StencilSemantic, Token};
