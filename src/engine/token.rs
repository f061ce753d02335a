//! Field access declarations recorded while parsing a container.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::engine::field::{FieldUid, MultiXpuData};
use crate::error::GridError;

/// How a container touches a field. Ordered `None < Read < Write`, and
/// `Write` also covers read-modify-write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessType {
    #[default]
    None,
    Read,
    Write,
}

impl AccessType {
    pub const ALL: [AccessType; 3] = [AccessType::None, AccessType::Read, AccessType::Write];

    /// Least upper bound on the `None < Read < Write` chain.
    pub fn merge(self, other: AccessType) -> AccessType {
        self.max(other)
    }

    pub fn from_int(v: i32) -> AccessType {
        match v {
            1 => AccessType::Read,
            2 => AccessType::Write,
            _ => AccessType::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessType::None => "NONE",
            AccessType::Read => "READ",
            AccessType::Write => "WRITE",
        }
    }
}

/// Shape of the computation a field participates in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ComputePattern {
    #[default]
    Map,
    /// Reads neighbours, so may need data owned by another partition.
    Stencil,
    Reduce,
}

impl ComputePattern {
    pub const ALL: [ComputePattern; 3] = [ComputePattern::Map, ComputePattern::Stencil, ComputePattern::Reduce];

    /// Stencil dominates, then reduce, then map.
    pub fn merge(self, other: ComputePattern) -> ComputePattern {
        use ComputePattern::*;
        match (self, other) {
            (Stencil, _) | (_, Stencil) => Stencil,
            (Reduce, _) | (_, Reduce) => Reduce,
            _ => Map,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComputePattern::Map => "MAP",
            ComputePattern::Stencil => "STENCIL",
            ComputePattern::Reduce => "REDUCE",
        }
    }
}

/// Halo semantic of a stencil access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StencilSemantic {
    /// Plain neighbour exchange on a grid.
    #[default]
    Standard,
    /// Lattice streaming: only populations moving toward a neighbour travel.
    Streaming,
}

impl StencilSemantic {
    pub const ALL: [StencilSemantic; 2] = [StencilSemantic::Standard, StencilSemantic::Streaming];

    pub fn as_str(self) -> &'static str {
        match self {
            StencilSemantic::Standard => "standard",
            StencilSemantic::Streaming => "streaming",
        }
    }
}

macro_rules! impl_str_conversions {
    ($ty:ty, $label:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = GridError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$ty>::ALL
                    .into_iter()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| GridError::Configuration(format!(concat!("unknown ", $label, " `{}`"), s)))
            }
        }
    };
}

impl_str_conversions!(AccessType, "access type");
impl_str_conversions!(ComputePattern, "compute pattern");
impl_str_conversions!(StencilSemantic, "stencil semantic");

/// One recorded field access.
#[derive(Clone)]
pub struct Token {
    data: Arc<dyn MultiXpuData>,
    access: AccessType,
    pattern: ComputePattern,
    semantic: StencilSemantic,
}

impl Token {
    pub fn new(
        data: Arc<dyn MultiXpuData>,
        access: AccessType,
        pattern: ComputePattern,
        semantic: StencilSemantic,
    ) -> Self {
        Self {
            data,
            access,
            pattern,
            semantic,
        }
    }

    pub fn uid(&self) -> FieldUid {
        self.data.uid()
    }

    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn access(&self) -> AccessType {
        self.access
    }

    pub fn pattern(&self) -> ComputePattern {
        self.pattern
    }

    pub fn semantic(&self) -> StencilSemantic {
        self.semantic
    }

    /// The field behind this token, used to build halo transfers.
    pub fn data(&self) -> &Arc<dyn MultiXpuData> {
        &self.data
    }

    pub fn merge_access(&mut self, access: AccessType) {
        self.access = self.access.merge(access);
    }

    /// Fold another declaration of the same field into this one.
    pub fn merge(&mut self, other: &Token) {
        debug_assert_eq!(self.uid(), other.uid());
        self.merge_access(other.access);
        if other.pattern == ComputePattern::Stencil {
            if self.pattern != ComputePattern::Stencil {
                self.semantic = other.semantic;
            } else if self.semantic != other.semantic {
                tracing::warn!(
                    field = %self.name(),
                    kept = %self.semantic,
                    dropped = %other.semantic,
                    "conflicting stencil semantics declared, keeping the first"
                );
            }
        }
        self.pattern = self.pattern.merge(other.pattern);
    }

    /// Reads neighbours of its own field.
    pub fn is_stencil_read(&self) -> bool {
        self.pattern == ComputePattern::Stencil && self.access >= AccessType::Read
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("uid", &self.uid())
            .field("name", &self.name())
            .field("access", &self.access)
            .field("pattern", &self.pattern)
            .field("semantic", &self.semantic)
            .finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name(), self.access, self.pattern)
    }
}

/// Append `incoming` into `tokens`, one entry per field. A token for a field
/// already present merges into it; new fields keep their relative order.
pub fn merge_into(tokens: &mut Vec<Token>, incoming: &[Token]) {
    for token in incoming {
        match tokens.iter_mut().find(|t| t.uid() == token.uid()) {
            Some(existing) => existing.merge(token),
            None => tokens.push(token.clone()),
        }
    }
}

/// Merge two token lists by field identity; `first`'s entries come first.
pub fn merge_token_lists(first: &[Token], second: &[Token]) -> Vec<Token> {
    let mut merged = Vec::with_capacity(first.len() + second.len());
    merge_into(&mut merged, first);
    merge_into(&mut merged, second);
    merged
}
