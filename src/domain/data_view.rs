use std::fmt;
use std::str::FromStr;

use crate::error::GridError;

/// Subset of a partition touched by one launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DataView {
    /// Every owned element.
    #[default]
    Standard,
    /// Elements that need no data from other partitions.
    Internal,
    /// Elements adjacent to another partition.
    Boundary,
}

impl DataView {
    pub const ALL: [DataView; 3] = [DataView::Standard, DataView::Internal, DataView::Boundary];

    pub fn as_str(self) -> &'static str {
        match self {
            DataView::Standard => "standard",
            DataView::Internal => "internal",
            DataView::Boundary => "boundary",
        }
    }
}

impl fmt::Display for DataView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataView {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataView::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GridError::Configuration(format!("unknown data view `{s}`")))
    }
}
