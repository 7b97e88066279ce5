//! Per tensor INT8 scales measured during calibration, in the text format stored in the
//! calibration cache.

use std::collections::BTreeMap;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

pub const CALIBRATION_TABLE_HEADER: &str = "TRACT-ABSMAX-1";

/// Largest magnitude of the symmetric INT8 domain.
const QUANTIZED_MAX: f32 = 127.0;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    scales: BTreeMap<String, f32>,
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widens the range of `name` so it covers every value in `values`.
    pub fn observe(&mut self, name: &str, values: impl IntoIterator<Item = f32>) {
        let abs_max = values
            .into_iter()
            .filter(|v| v.is_finite())
            .fold(0f32, |acc, v| acc.max(v.abs()));
        let scale = abs_max / QUANTIZED_MAX;
        self.scales
            .entry(name.to_string())
            .and_modify(|s| *s = s.max(scale))
            .or_insert(scale);
    }

    pub fn scale(&self, name: &str) -> Option<f32> {
        self.scales.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    /// One header line, then one `name: <f32 bits as hex>` line per tensor.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{CALIBRATION_TABLE_HEADER}\n");
        for (name, scale) in &self.scales {
            out.push_str(&format!("{name}: {}\n", hex::encode(scale.to_be_bytes())));
        }
        out.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let text = std::str::from_utf8(bytes).context("calibration table is not utf-8")?;
        let mut lines = text.lines();
        match lines.next() {
            Some(header) if header.trim() == CALIBRATION_TABLE_HEADER => {}
            other => bail!("unexpected calibration table header {other:?}"),
        }
        let mut scales = BTreeMap::new();
        for line in lines.filter(|l| !l.trim().is_empty()) {
            // tensor names may contain ':' so split on the last one
            let (name, bits) = line
                .rsplit_once(':')
                .with_context(|| format!("malformed calibration table line '{line}'"))?;
            let bits: [u8; 4] = hex::decode(bits.trim())
                .ok()
                .and_then(|b| b.try_into().ok())
                .with_context(|| format!("malformed scale in line '{line}'"))?;
            scales.insert(name.trim().to_string(), f32::from_be_bytes(bits));
        }
        Ok(Self { scales })
    }
}
