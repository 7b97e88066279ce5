//! Serialized engine produced by the [`super::TractBackend`].

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};

use super::{BuilderFlag, CalibrationTable};
use crate::network::{DataType, TensorDesc};

pub const PLAN_MAGIC: [u8; 4] = *b"TRPL";
pub const PLAN_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnginePlan {
    pub format_version: u32,
    pub backend: String,
    /// Uppercase hex SHA-256 of the graph the engine was built from.
    pub model_hash: String,
    pub flags: BTreeSet<BuilderFlag>,
    pub workspace_size: u64,
    pub layer_precisions: BTreeMap<String, DataType>,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    pub calibration: Option<CalibrationTable>,
    /// Number of batches measured to produce `calibration`, zero when it came from a cache.
    pub calibration_batches: usize,
    pub graph: Vec<u8>,
}

impl EnginePlan {
    pub fn model_hash(graph: &[u8]) -> String {
        let hash = <sha2::Sha256 as sha2::Digest>::digest(graph);
        format!("{hash:X}")
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut bytes = PLAN_MAGIC.to_vec();
        rmp_serde::encode::write_named(&mut bytes, self).context("encoding engine plan")?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(
            bytes.len() >= PLAN_MAGIC.len() && bytes[..PLAN_MAGIC.len()] == PLAN_MAGIC,
            "not an engine plan"
        );
        let plan: Self =
            rmp_serde::from_slice(&bytes[PLAN_MAGIC.len()..]).context("decoding engine plan")?;
        ensure!(
            plan.format_version == PLAN_FORMAT_VERSION,
            "unsupported engine plan version {}",
            plan.format_version
        );
        Ok(plan)
    }
}
