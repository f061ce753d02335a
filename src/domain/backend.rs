// Device set and per-device fork-join execution
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{GridError, Result};

/// Partition (device) ordinal in `[0, device_count)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetIdx(pub usize);

impl fmt::Display for SetIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One value per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSet<T> {
    items: Vec<T>,
}

impl<T> DataSet<T> {
    pub fn from_vec(items: Vec<T>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, set_idx: SetIdx) -> Option<&T> {
        self.items.get(set_idx.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SetIdx, &T)> {
        self.items.iter().enumerate().map(|(i, v)| (SetIdx(i), v))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T> Index<SetIdx> for DataSet<T> {
    type Output = T;
    fn index(&self, set_idx: SetIdx) -> &T {
        &self.items[set_idx.0]
    }
}

impl<T> IndexMut<SetIdx> for DataSet<T> {
    fn index_mut(&mut self, set_idx: SetIdx) -> &mut T {
        &mut self.items[set_idx.0]
    }
}

/// The device set. Each partition gets one worker in a dedicated pool so
/// per-device tasks really run side by side.
#[derive(Clone)]
pub struct Backend {
    device_count: usize,
    pool: Arc<ThreadPool>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("device_count", &self.device_count)
            .finish()
    }
}

impl Backend {
    pub fn new(device_count: usize) -> Result<Self> {
        if device_count == 0 {
            return Err(GridError::Configuration(
                "a backend needs at least one device".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(device_count)
            .thread_name(|i| format!("xgrid-dev-{i}"))
            .build()
            .map_err(|e| GridError::Initialization(format!("device thread pool: {e}")))?;
        tracing::debug!(device_count, "backend created");
        Ok(Self {
            device_count,
            pool: Arc::new(pool),
        })
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn set_indices(&self) -> impl Iterator<Item = SetIdx> {
        (0..self.device_count).map(SetIdx)
    }

    pub fn check(&self, set_idx: SetIdx) -> Result<()> {
        if set_idx.0 < self.device_count {
            Ok(())
        } else {
            Err(GridError::PartitionOutOfRange {
                set_idx: set_idx.0,
                device_count: self.device_count,
            })
        }
    }

    pub fn new_dataset<T>(&self, mut f: impl FnMut(SetIdx) -> T) -> DataSet<T> {
        DataSet::from_vec(self.set_indices().map(&mut f).collect())
    }

    /// Run `f` once per partition in parallel and join. Every task runs to
    /// completion; the first error in partition order is returned.
    pub fn par_for_each<F>(&self, f: F) -> Result<()>
    where
        F: Fn(SetIdx) -> Result<()> + Sync,
    {
        self.par_map(f).map(|_| ())
    }

    /// Parallel per-partition construction of a [`DataSet`].
    pub fn par_map<T, F>(&self, f: F) -> Result<DataSet<T>>
    where
        T: Send,
        F: Fn(SetIdx) -> Result<T> + Sync,
    {
        let results: Vec<Result<T>> = self.pool.install(|| {
            (0..self.device_count)
                .into_par_iter()
                .map(|i| f(SetIdx(i)))
                .collect()
        });
        results.into_iter().collect::<Result<Vec<T>>>().map(DataSet::from_vec)
    }

    /// Parallel map over arbitrary work items on the device pool.
    pub fn par_run<I, F>(&self, items: &[I], f: F) -> Result<()>
    where
        I: Sync,
        F: Fn(&I) -> Result<()> + Sync,
    {
        let results: Vec<Result<()>> = self.pool.install(|| items.par_iter().map(&f).collect());
        results.into_iter().collect()
    }

    /// Devices in this reference backend complete work synchronously.
    pub fn sync(&self) {
        tracing::trace!(device_count = self.device_count, "backend sync");
    }
}
