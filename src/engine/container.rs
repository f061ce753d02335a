//! Schedulable units of work.
//!
//! A [`Container`] is one of a closed set of variants (device kernel, host
//! kernel, halo transfer, device-then-host composite) sharing one operation
//! table: `parse`, `run`, `run_partition`, `host_container`,
//! `device_container`. Tokens are extracted once and cached until
//! [`Container::reset_tokens`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::{Backend, BlockGrid, DataView, SetIdx};
use crate::engine::field::{HaloUpdateOptions, MultiXpuData, TransferMode};
use crate::engine::loader::{ComputeFn, Execution, Loader, LoadingLambda};
use crate::engine::token::{merge_token_lists, StencilSemantic, Token};
use crate::error::{GridError, Result};

static NEXT_CONTAINER_UID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionType {
    Device,
    Host,
    DeviceManaged,
    DeviceThenHostManaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Compute,
    Communication,
    Graph,
    Synchronization,
    Anchor,
}

impl ExecutionType {
    pub const ALL: [ExecutionType; 4] = [
        ExecutionType::Device,
        ExecutionType::Host,
        ExecutionType::DeviceManaged,
        ExecutionType::DeviceThenHostManaged,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionType::Device => "device",
            ExecutionType::Host => "host",
            ExecutionType::DeviceManaged => "deviceManaged",
            ExecutionType::DeviceThenHostManaged => "deviceThenHostManaged",
        }
    }
}

impl OperationType {
    pub const ALL: [OperationType; 5] = [
        OperationType::Compute,
        OperationType::Graph,
        OperationType::Communication,
        OperationType::Synchronization,
        OperationType::Anchor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Compute => "compute",
            OperationType::Communication => "communication",
            OperationType::Graph => "graph",
            OperationType::Synchronization => "synchronization",
            OperationType::Anchor => "anchor",
        }
    }
}

macro_rules! impl_names {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = GridError;

            fn from_str(s: &str) -> Result<Self> {
                <$ty>::ALL
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| GridError::Configuration(format!("unknown option `{s}`")))
            }
        }
    };
}

impl_names!(ExecutionType);
impl_names!(OperationType);

struct KernelLaunch {
    grid: BlockGrid,
    lambda: LoadingLambda,
}

struct DataTransfer {
    backend: Backend,
    data: Arc<dyn MultiXpuData>,
    mode: TransferMode,
    semantic: StencilSemantic,
}

enum Variant {
    Device(KernelLaunch),
    Host(KernelLaunch),
    DataTransfer(DataTransfer),
    DeviceThenHost { device: Container, host: Container },
}

struct ContainerInner {
    uid: u64,
    name: String,
    variant: Variant,
    tokens: Mutex<Option<Arc<[Token]>>>,
}

/// Shared handle to a unit of work.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("uid", &self.inner.uid)
            .field("name", &self.inner.name)
            .field("execution", &self.execution_type())
            .field("operation", &self.operation_type())
            .finish()
    }
}

impl Container {
    fn from_variant(name: String, variant: Variant) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                uid: NEXT_CONTAINER_UID.fetch_add(1, Ordering::Relaxed),
                name,
                variant,
                tokens: Mutex::new(None),
            }),
        }
    }

    /// Kernel launched once per device, in parallel, over the selected view.
    pub fn device<F>(name: impl Into<String>, grid: &BlockGrid, lambda: F) -> Container
    where
        F: Fn(&mut Loader) -> ComputeFn + Send + Sync + 'static,
    {
        Self::from_variant(
            name.into(),
            Variant::Device(KernelLaunch {
                grid: grid.clone(),
                lambda: Arc::new(lambda),
            }),
        )
    }

    /// Same kernel shape, executed partition after partition on the calling thread.
    pub fn host<F>(name: impl Into<String>, grid: &BlockGrid, lambda: F) -> Container
    where
        F: Fn(&mut Loader) -> ComputeFn + Send + Sync + 'static,
    {
        Self::from_variant(
            name.into(),
            Variant::Host(KernelLaunch {
                grid: grid.clone(),
                lambda: Arc::new(lambda),
            }),
        )
    }

    /// Halo update of one multi-device object.
    pub fn halo_update(
        backend: &Backend,
        data: Arc<dyn MultiXpuData>,
        mode: TransferMode,
        semantic: StencilSemantic,
    ) -> Container {
        let name = format!("halo_{}", data.name());
        Self::from_variant(
            name,
            Variant::DataTransfer(DataTransfer {
                backend: backend.clone(),
                data,
                mode,
                semantic,
            }),
        )
    }

    /// Composite running `device` then `host`.
    ///
    /// # Errors
    /// [`GridError::Initialization`] if a child is missing or has the wrong
    /// execution type.
    pub fn device_then_host(
        name: impl Into<String>,
        device: Option<Container>,
        host: Option<Container>,
    ) -> Result<Container> {
        let name = name.into();
        let device = device.ok_or_else(|| {
            GridError::Initialization(format!("`{name}`: device sub-container is missing"))
        })?;
        let host = host.ok_or_else(|| {
            GridError::Initialization(format!("`{name}`: host sub-container is missing"))
        })?;
        if device.execution_type() != ExecutionType::Device || host.execution_type() != ExecutionType::Host {
            return Err(GridError::Initialization(format!(
                "`{name}`: expected device and host children, got {} and {}",
                device.execution_type(),
                host.execution_type()
            )));
        }
        Ok(Self::from_variant(name, Variant::DeviceThenHost { device, host }))
    }

    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn execution_type(&self) -> ExecutionType {
        match &self.inner.variant {
            Variant::Device(_) => ExecutionType::Device,
            Variant::Host(_) => ExecutionType::Host,
            Variant::DataTransfer(_) => ExecutionType::DeviceManaged,
            Variant::DeviceThenHost { .. } => ExecutionType::DeviceThenHostManaged,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        match &self.inner.variant {
            Variant::DataTransfer(_) => OperationType::Communication,
            _ => OperationType::Compute,
        }
    }

    /// Whether `run` accepts a view other than [`DataView::Standard`].
    pub fn supports_data_view_split(&self) -> bool {
        matches!(self.inner.variant, Variant::Device(_))
    }

    pub fn device_count(&self) -> usize {
        match &self.inner.variant {
            Variant::Device(k) | Variant::Host(k) => k.grid.device_count(),
            Variant::DataTransfer(t) => t.backend.device_count(),
            Variant::DeviceThenHost { device, .. } => device.device_count(),
        }
    }

    /// Extract the field accesses, without running any kernel body. Cached.
    pub fn parse(&self) -> Arc<[Token]> {
        if let Some(tokens) = self.inner.tokens.lock().as_ref() {
            return Arc::clone(tokens);
        }
        // Children lock their own caches, so ours is not held while parsing.
        let tokens: Arc<[Token]> = match &self.inner.variant {
            Variant::Device(k) => Self::parse_kernel(k, Execution::Device).into(),
            Variant::Host(k) => Self::parse_kernel(k, Execution::Host).into(),
            Variant::DataTransfer(_) => Arc::from(Vec::new()),
            Variant::DeviceThenHost { device, host } => {
                merge_token_lists(&device.parse(), &host.parse()).into()
            }
        };
        tracing::debug!(
            container = %self.inner.name,
            tokens = tokens.len(),
            "container parsed"
        );
        let mut cache = self.inner.tokens.lock();
        Arc::clone(cache.get_or_insert(tokens))
    }

    fn parse_kernel(k: &KernelLaunch, execution: Execution) -> Vec<Token> {
        let mut parser = Loader::parser(execution);
        let _body: ComputeFn = (k.lambda)(&mut parser);
        parser.into_tokens()
    }

    /// Cached tokens, if parsed.
    pub fn tokens(&self) -> Option<Arc<[Token]>> {
        self.inner.tokens.lock().clone()
    }

    /// Drop the cached tokens of this container only.
    pub fn reset_tokens(&self) {
        *self.inner.tokens.lock() = None;
    }

    /// Run on every partition and return once all of them completed.
    pub fn run(&self, stream_idx: usize, data_view: DataView) -> Result<()> {
        let _span = tracing::trace_span!("run", container = %self.inner.name, %data_view).entered();
        match &self.inner.variant {
            Variant::Device(k) => k
                .grid
                .backend()
                .par_for_each(|s| self.run_partition(s, stream_idx, data_view)),
            Variant::Host(k) => k
                .grid
                .backend()
                .set_indices()
                .try_for_each(|s| self.run_partition(s, stream_idx, data_view)),
            Variant::DataTransfer(t) => t.backend.par_for_each(|s| self.run_partition(s, stream_idx, data_view)),
            Variant::DeviceThenHost { device, host } => {
                self.require_standard(data_view)?;
                device.run(stream_idx, DataView::Standard)?;
                host.run(stream_idx, DataView::Standard)
            }
        }
    }

    /// Run the work of a single partition.
    pub fn run_partition(&self, set_idx: SetIdx, stream_idx: usize, data_view: DataView) -> Result<()> {
        match &self.inner.variant {
            Variant::Device(k) => Self::launch(k, Execution::Device, set_idx, data_view),
            Variant::Host(k) => Self::launch(k, Execution::Host, set_idx, data_view),
            Variant::DataTransfer(t) => {
                t.backend.check(set_idx)?;
                let options = HaloUpdateOptions {
                    mode: t.mode,
                    semantic: t.semantic,
                    stream_idx,
                };
                t.data.halo_update(set_idx, &options)
            }
            Variant::DeviceThenHost { device, host } => {
                self.require_standard(data_view)?;
                device.run_partition(set_idx, stream_idx, DataView::Standard)?;
                host.run_partition(set_idx, stream_idx, DataView::Standard)
            }
        }
    }

    fn launch(k: &KernelLaunch, execution: Execution, set_idx: SetIdx, data_view: DataView) -> Result<()> {
        k.grid.backend().check(set_idx)?;
        let mut loader = Loader::executor(execution, set_idx, data_view);
        let compute = (k.lambda)(&mut loader);
        k.grid.for_each_voxel(set_idx, data_view, |voxel| compute(voxel));
        Ok(())
    }

    fn require_standard(&self, data_view: DataView) -> Result<()> {
        if data_view == DataView::Standard {
            Ok(())
        } else {
            Err(GridError::usage(
                self.name(),
                format!("a device-then-host container can not run the {data_view} view"),
            ))
        }
    }

    /// Host child of a composite. Shared, not transferred.
    pub fn host_container(&self) -> Result<Container> {
        match &self.inner.variant {
            Variant::DeviceThenHost { host, .. } => Ok(host.clone()),
            _ => Err(GridError::usage(self.name(), "host_container is only defined on composites")),
        }
    }

    /// Device child of a composite. Shared, not transferred.
    pub fn device_container(&self) -> Result<Container> {
        match &self.inner.variant {
            Variant::DeviceThenHost { device, .. } => Ok(device.clone()),
            _ => Err(GridError::usage(self.name(), "device_container is only defined on composites")),
        }
    }

    /// Object refreshed by a transfer container.
    pub fn transfer_target(&self) -> Option<&Arc<dyn MultiXpuData>> {
        match &self.inner.variant {
            Variant::DataTransfer(t) => Some(&t.data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockGridConfig, Index3d, Stencil};
    use crate::engine::field::Field;
    use crate::engine::testing::FakeData;
    use crate::engine::token::AccessType;
    use std::sync::atomic::AtomicUsize;

    fn grid(devices: usize) -> BlockGrid {
        let cfg = BlockGridConfig::new(Index3d::new(4, 4, 8), Index3d::splat(2), Stencil::s7_laplace());
        BlockGrid::new(Backend::new(devices).unwrap(), cfg, |_| true, |_| false).unwrap()
    }

    fn axpy(g: &BlockGrid, a: f64, x: &Field<f64>, y: &Field<f64>) -> Container {
        let (x, y) = (x.clone(), y.clone());
        Container::device("axpy", g, move |l: &mut Loader| {
            let x = l.read(&x);
            let y = l.write(&y);
            Box::new(move |idx| y.write(idx, 0, a * x.read(idx, 0) + y.read(idx, 0)))
        })
    }

    #[test]
    fn parse_is_cached_until_reset() {
        let g = grid(1);
        let f = Field::new(&g, "f", 1, 0i32).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = {
            let (f, calls) = (f.clone(), calls.clone());
            Container::device("count", &g, move |l: &mut Loader| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = l.write(&f);
                Box::new(|_| {})
            })
        };
        assert!(c.tokens().is_none());
        let first = c.parse();
        let second = c.parse();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        c.reset_tokens();
        assert_eq!(c.parse().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Parsing never ran the body.
        assert_eq!(f.read(Index3d::default(), 0), Some(0));
    }

    #[test]
    fn run_fans_out_over_every_partition() {
        let g = grid(2);
        let x = Field::new(&g, "x", 1, 2.0).unwrap();
        let y = Field::new(&g, "y", 1, 1.0).unwrap();
        axpy(&g, 3.0, &x, &y).run(0, DataView::Standard).unwrap();
        assert!(y.to_ndarray().iter().all(|v| *v == 7.0));
    }

    #[test]
    fn internal_view_skips_boundary_blocks() {
        let g = grid(2);
        let x = Field::new(&g, "x", 1, 1.0).unwrap();
        let y = Field::new(&g, "y", 1, 0.0).unwrap();
        axpy(&g, 1.0, &x, &y).run(0, DataView::Internal).unwrap();
        // Partition 0 owns voxel z [0, 4): blocks z=0 internal, z=1 boundary-up.
        assert_eq!(y.read(Index3d::new(0, 0, 1), 0), Some(1.0));
        assert_eq!(y.read(Index3d::new(0, 0, 2), 0), Some(0.0));
        assert_eq!(y.read(Index3d::new(0, 0, 5), 0), Some(0.0));
        assert_eq!(y.read(Index3d::new(0, 0, 7), 0), Some(1.0));
    }

    #[test]
    fn run_partition_only_touches_that_partition() {
        let g = grid(2);
        let x = Field::new(&g, "x", 1, 1.0).unwrap();
        let y = Field::new(&g, "y", 1, 0.0).unwrap();
        let c = axpy(&g, 1.0, &x, &y);
        c.run_partition(SetIdx(1), 0, DataView::Standard).unwrap();
        assert_eq!(y.read(Index3d::new(0, 0, 0), 0), Some(0.0));
        assert_eq!(y.read(Index3d::new(0, 0, 6), 0), Some(1.0));
        assert!(c.run_partition(SetIdx(2), 0, DataView::Standard).is_err());
    }

    fn composite(g: &BlockGrid, a: &Field<i32>, b: &Field<i32>, c: &Field<i32>) -> Container {
        let dev = {
            let (a, b) = (a.clone(), b.clone());
            Container::device("dev", g, move |l: &mut Loader| {
                let a = l.read(&a);
                let b = l.write(&b);
                Box::new(move |idx| b.write(idx, 0, a.read(idx, 0) + 1))
            })
        };
        let host = {
            let (b, c) = (b.clone(), c.clone());
            Container::host("host", g, move |l: &mut Loader| {
                let b = l.read(&b);
                let c = l.write(&c);
                Box::new(move |idx| c.write(idx, 0, b.read(idx, 0) * 10))
            })
        };
        Container::device_then_host("dth", Some(dev), Some(host)).unwrap()
    }

    #[test]
    fn composite_merges_child_tokens() {
        let g = grid(1);
        let (a, b, c) = (
            Field::new(&g, "A", 1, 1).unwrap(),
            Field::new(&g, "B", 1, 0).unwrap(),
            Field::new(&g, "C", 1, 0).unwrap(),
        );
        let dth = composite(&g, &a, &b, &c);
        let toks = dth.parse();
        let summary: Vec<_> = toks.iter().map(|t| (t.uid(), t.access())).collect();
        assert_eq!(
            summary,
            vec![
                (a.uid(), AccessType::Read),
                (b.uid(), AccessType::Write),
                (c.uid(), AccessType::Write),
            ]
        );
        // Children keep their own lists.
        assert_eq!(dth.host_container().unwrap().parse()[0].access(), AccessType::Read);
        assert_eq!(dth.execution_type(), ExecutionType::DeviceThenHostManaged);
    }

    #[test]
    fn composite_runs_device_before_host() {
        let g = grid(2);
        let (a, b, c) = (
            Field::new(&g, "A", 1, 1).unwrap(),
            Field::new(&g, "B", 1, 0).unwrap(),
            Field::new(&g, "C", 1, 0).unwrap(),
        );
        let dth = composite(&g, &a, &b, &c);
        dth.run(0, DataView::Standard).unwrap();
        assert!(c.to_ndarray().iter().all(|v| *v == 20));
        assert!(matches!(dth.run(0, DataView::Boundary), Err(GridError::Usage { .. })));
        assert!(matches!(
            dth.run_partition(SetIdx(0), 0, DataView::Internal),
            Err(GridError::Usage { .. })
        ));
    }

    #[test]
    fn composite_only_accessors_and_construction_errors() {
        let g = grid(1);
        let plain = Container::device("k", &g, |_: &mut Loader| -> ComputeFn { Box::new(|_| {}) });
        assert!(matches!(plain.host_container(), Err(GridError::Usage { .. })));
        assert!(matches!(plain.device_container(), Err(GridError::Usage { .. })));
        assert!(matches!(
            Container::device_then_host("x", Some(plain.clone()), None),
            Err(GridError::Initialization(_))
        ));
        assert!(matches!(
            Container::device_then_host("x", Some(plain.clone()), Some(plain)),
            Err(GridError::Initialization(_))
        ));
    }

    #[test]
    fn transfer_container_has_no_tokens_and_runs_everywhere() {
        let bk = Backend::new(3).unwrap();
        let data = FakeData::with_devices("f", 3);
        let c = Container::halo_update(&bk, data.clone(), TransferMode::Get, StencilSemantic::Standard);
        assert!(c.parse().is_empty());
        assert_eq!(c.operation_type(), OperationType::Communication);
        assert_eq!(c.execution_type(), ExecutionType::DeviceManaged);
        c.run(0, DataView::Standard).unwrap();
        assert_eq!(data.update_count(), 3);
        assert_eq!(c.transfer_target().map(|d| d.uid()), Some(data.uid()));
    }

    #[test]
    fn type_names_round_trip() {
        for t in ExecutionType::ALL {
            assert_eq!(t.to_string().parse::<ExecutionType>().unwrap(), t);
        }
        for t in OperationType::ALL {
            assert_eq!(t.to_string().parse::<OperationType>().unwrap(), t);
        }
    }
}
