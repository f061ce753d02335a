// Test doubles shared by the engine unit tests
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::domain::SetIdx;
use crate::engine::field::{FieldUid, HaloUpdateOptions, MultiXpuData};
use crate::error::Result;

/// Multi-device data that only counts halo updates.
pub(crate) struct FakeData {
    uid: FieldUid,
    name: String,
    devices: usize,
    pub(crate) updates: AtomicUsize,
}

impl FakeData {
    pub(crate) fn arc(name: &str) -> Arc<FakeData> {
        Self::with_devices(name, 1)
    }

    pub(crate) fn with_devices(name: &str, devices: usize) -> Arc<FakeData> {
        Arc::new(FakeData {
            uid: FieldUid::fresh(),
            name: name.to_string(),
            devices,
            updates: AtomicUsize::new(0),
        })
    }

    pub(crate) fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl MultiXpuData for FakeData {
    fn uid(&self) -> FieldUid {
        self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn device_count(&self) -> usize {
        self.devices
    }

    fn halo_update(&self, _set_idx: SetIdx, _options: &HaloUpdateOptions) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
