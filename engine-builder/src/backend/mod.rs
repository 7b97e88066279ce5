//! Compilation backends turning a [`Network`] and a [`BuilderConfig`] into a serialized engine.

mod logger;
mod plan;
mod table;
mod tract;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    calibration::{Device, Int8Calibrator},
    network::{DataType, Network},
};
pub use logger::{BackendLogger, Severity};
pub use plan::{EnginePlan, PLAN_FORMAT_VERSION, PLAN_MAGIC};
pub use table::{CALIBRATION_TABLE_HEADER, CalibrationTable};
pub use tract::TractBackend;

/// Default limit on the scratch memory a backend may use while building: 8 GiB.
pub const DEFAULT_WORKSPACE_SIZE: u64 = 8 << 30;

/// Precision requested for an engine build.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, derive_more::Display,
)]
pub enum Precision {
    #[display("fp32")]
    Fp32,
    #[default]
    #[display("fp16")]
    Fp16,
    #[display("int8")]
    Int8,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
pub enum BuilderFlag {
    #[display("FP16")]
    Fp16,
    #[display("INT8")]
    Int8,
    /// Layer precision overrides are constraints rather than hints.
    #[display("STRICT_TYPES")]
    StrictTypes,
}

/// What the target hardware runs natively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub fast_fp16: bool,
    pub fast_int8: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            fast_fp16: true,
            fast_int8: true,
        }
    }
}

/// Configuration consumed by a single [`BuildBackend::build_serialized_network`] call.
pub struct BuilderConfig {
    pub workspace_size: u64,
    pub flags: BTreeSet<BuilderFlag>,
    pub layer_precisions: BTreeMap<String, DataType>,
    pub int8_calibrator: Option<Box<dyn Int8Calibrator>>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            workspace_size: DEFAULT_WORKSPACE_SIZE,
            flags: BTreeSet::new(),
            layer_precisions: BTreeMap::new(),
            int8_calibrator: None,
        }
    }
}

impl BuilderConfig {
    pub fn set_flag(&mut self, flag: BuilderFlag) {
        self.flags.insert(flag);
    }

    pub fn has_flag(&self, flag: BuilderFlag) -> bool {
        self.flags.contains(&flag)
    }
}

impl std::fmt::Debug for BuilderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderConfig")
            .field("workspace_size", &self.workspace_size)
            .field("flags", &self.flags)
            .field("layer_precisions", &self.layer_precisions)
            .field("int8_calibrator", &self.int8_calibrator.is_some())
            .finish()
    }
}

pub trait BuildBackend {
    fn name(&self) -> &str;
    fn capabilities(&self) -> BackendCapabilities;
    /// Device on which calibration batches must be staged.
    fn device(&self) -> Arc<dyn Device>;
    /// Builds and serializes an engine. `Ok(None)` means the backend could not build one, the
    /// reason having been reported through its own logger.
    fn build_serialized_network(
        &self,
        network: &Network,
        config: BuilderConfig,
    ) -> anyhow::Result<Option<Vec<u8>>>;
}
