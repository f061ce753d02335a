// Domain decomposition and classification
pub mod backend;
pub mod classifier;
pub mod data_view;
pub mod decomposition;
pub mod grid;
pub mod index;
pub mod stencil;

pub use backend::{Backend, DataSet, SetIdx};
pub use classifier::{ByDirection, ByDomain, ByPartition, SpanClassifier, SpanLayout};
pub use data_view::DataView;
pub use decomposition::ZDecomposition;
pub use grid::{BlockGrid, BlockGridConfig, DecompositionPolicy};
pub use index::Index3d;
pub use stencil::Stencil;
