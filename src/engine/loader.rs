//! Dual-mode loader handed to a container's loading lambda.
//!
//! The same lambda serves both purposes:
//! - in [`LoadingMode::Parse`] every `load` call is recorded as a [`Token`]
//!   and the returned compute closure is dropped unused;
//! - in [`LoadingMode::Execute`] each `load` resolves to a partition handle
//!   and the returned closure runs over the launch span.
//!
//! ```ignore
//! let axpy = Container::device("axpy", &grid, move |l: &mut Loader| {
//!     let x = l.read(&x);
//!     let y = l.write(&y);
//!     Box::new(move |idx| y.write(idx, 0, a * x.read(idx, 0) + y.read(idx, 0)))
//! });
//! ```

use std::fmt;
use std::sync::Arc;

use crate::domain::{DataView, Index3d, SetIdx};
use crate::engine::field::{Element, Field, FieldPartition, MultiXpuData};
use crate::engine::token::{merge_into, AccessType, ComputePattern, StencilSemantic, Token};

/// Per-voxel kernel body produced by a loading lambda.
pub type ComputeFn = Box<dyn Fn(Index3d) + Send + Sync>;

/// Declares accesses through a [`Loader`] and returns the kernel body.
pub type LoadingLambda = Arc<dyn Fn(&mut Loader) -> ComputeFn + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingMode {
    /// Record declarations, compute nothing.
    Parse,
    /// Bind partition handles for a real launch.
    Execute,
}

/// Where the kernel body runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Execution {
    #[default]
    Device,
    Host,
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Execution::Device => "device",
            Execution::Host => "host",
        })
    }
}

pub struct Loader {
    mode: LoadingMode,
    execution: Execution,
    set_idx: SetIdx,
    data_view: DataView,
    tokens: Vec<Token>,
}

impl Loader {
    /// Parsing loader: partition 0, standard view.
    pub fn parser(execution: Execution) -> Self {
        Self {
            mode: LoadingMode::Parse,
            execution,
            set_idx: SetIdx(0),
            data_view: DataView::Standard,
            tokens: Vec::new(),
        }
    }

    pub fn executor(execution: Execution, set_idx: SetIdx, data_view: DataView) -> Self {
        Self {
            mode: LoadingMode::Execute,
            execution,
            set_idx,
            data_view,
            tokens: Vec::new(),
        }
    }

    /// General declaration. Repeated declarations of one field merge.
    pub fn load<T: Element>(
        &mut self,
        field: &Field<T>,
        access: AccessType,
        pattern: ComputePattern,
        semantic: StencilSemantic,
    ) -> FieldPartition<T> {
        self.declare(field.as_data(), access, pattern, semantic);
        field.partition(self.set_idx)
    }

    pub fn read<T: Element>(&mut self, field: &Field<T>) -> FieldPartition<T> {
        self.load(field, AccessType::Read, ComputePattern::Map, StencilSemantic::Standard)
    }

    /// Read neighbours of `field`; on several devices this needs a halo update.
    pub fn read_stencil<T: Element>(&mut self, field: &Field<T>, semantic: StencilSemantic) -> FieldPartition<T> {
        self.load(field, AccessType::Read, ComputePattern::Stencil, semantic)
    }

    pub fn write<T: Element>(&mut self, field: &Field<T>) -> FieldPartition<T> {
        self.load(field, AccessType::Write, ComputePattern::Map, StencilSemantic::Standard)
    }

    pub fn reduce<T: Element>(&mut self, field: &Field<T>) -> FieldPartition<T> {
        self.load(field, AccessType::Write, ComputePattern::Reduce, StencilSemantic::Standard)
    }

    /// Declaration for data that is not a [`Field`].
    pub fn declare(
        &mut self,
        data: Arc<dyn MultiXpuData>,
        access: AccessType,
        pattern: ComputePattern,
        semantic: StencilSemantic,
    ) {
        if self.mode == LoadingMode::Parse {
            merge_into(&mut self.tokens, &[Token::new(data, access, pattern, semantic)]);
        }
    }

    pub fn mode(&self) -> LoadingMode {
        self.mode
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    pub fn set_idx(&self) -> SetIdx {
        self.set_idx
    }

    pub fn data_view(&self) -> DataView {
        self.data_view
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }
}
