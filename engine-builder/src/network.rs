//! In-memory network definition produced by a [`crate::GraphParser`].

use std::{fmt, io::Write, path::Path};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::BuildError;

/// Element type of a tensor, numbered after the ONNX `TensorProto.DataType` codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum DataType {
    #[display("FLOAT")]
    Float,
    #[display("UINT8")]
    UInt8,
    #[display("INT8")]
    Int8,
    #[display("INT32")]
    Int32,
    #[display("INT64")]
    Int64,
    #[display("BOOL")]
    Bool,
    #[display("HALF")]
    Half,
    #[display("DOUBLE")]
    Double,
}

impl DataType {
    pub const ONNX_FLOAT: i32 = 1;
    pub const ONNX_DOUBLE: i32 = 11;
    pub const ONNX_FLOAT16: i32 = 10;

    pub fn from_onnx(code: i32) -> Option<Self> {
        match code {
            1 => Some(DataType::Float),
            2 => Some(DataType::UInt8),
            3 => Some(DataType::Int8),
            6 => Some(DataType::Int32),
            7 => Some(DataType::Int64),
            9 => Some(DataType::Bool),
            10 => Some(DataType::Half),
            11 => Some(DataType::Double),
            _ => None,
        }
    }

    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 | DataType::Bool => 1,
            DataType::Half => 2,
            DataType::Float | DataType::Int32 => 4,
            DataType::Int64 | DataType::Double => 8,
        }
    }
}

/// A tensor dimension; `None` when the graph leaves it symbolic.
pub type Dim = Option<usize>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    /// `None` when the graph does not declare a rank.
    pub shape: Option<Vec<Dim>>,
    pub dtype: DataType,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, shape: Vec<Dim>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape: Some(shape),
            dtype,
        }
    }

    pub fn unranked(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape: None,
            dtype,
        }
    }

    /// Shorthand for a tensor whose dimensions are all known.
    pub fn fixed(name: impl Into<String>, shape: &[usize], dtype: DataType) -> Self {
        Self::new(name, shape.iter().copied().map(Some).collect(), dtype)
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        self.shape.as_deref()
    }

    /// The shape with its leading dimension set to `batch_size`, if every other dimension is
    /// resolved.
    pub fn batched_shape(&self, batch_size: usize) -> Option<Vec<usize>> {
        let dims = self.dims()?;
        if dims.is_empty() {
            return None;
        }
        std::iter::once(Some(batch_size))
            .chain(dims.iter().skip(1).copied())
            .collect()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(dims) = self.dims() else {
            return write!(f, "'{}' with unknown shape and dtype {}", self.name, self.dtype);
        };
        let dims = dims
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
            .join(", ");
        write!(f, "'{}' with shape [{}] and dtype {}", self.name, dims, self.dtype)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub op_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct Network {
    name: String,
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
    layers: Vec<Layer>,
    // serialized graph the network was parsed from, if any
    source: Option<Vec<u8>>,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: TensorDesc) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: TensorDesc) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_layer(mut self, name: impl Into<String>, op_type: impl Into<String>) -> Self {
        self.layers.push(Layer {
            name: name.into(),
            op_type: op_type.into(),
        });
        self
    }

    pub fn with_source(mut self, source: Vec<u8>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[TensorDesc] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        &self.outputs
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn source(&self) -> Option<&[u8]> {
        self.source.as_deref()
    }

    /// Batch size shared by all inputs, `None` while the leading dimension is symbolic.
    ///
    /// Every resolved leading dimension must be positive and all of them must agree. Inputs of
    /// unknown rank do not constrain the batch size.
    pub fn batch_size(&self) -> Result<Option<usize>, BuildError> {
        let mut batch_size = None;
        for input in &self.inputs {
            let Some(dims) = input.dims() else {
                continue;
            };
            let Some(leading) = dims.first() else {
                return Err(BuildError::InvalidNetwork(format!(
                    "input '{}' is a scalar and has no batch dimension",
                    input.name
                )));
            };
            let Some(leading) = *leading else {
                continue;
            };
            if leading == 0 {
                return Err(BuildError::InvalidNetwork(format!(
                    "input '{}' has a zero batch dimension",
                    input.name
                )));
            }
            match batch_size {
                Some(size) if size != leading => {
                    return Err(BuildError::InvalidNetwork(format!(
                        "input '{}' has batch dimension {} but previous inputs have {}",
                        input.name, leading, size
                    )));
                }
                _ => batch_size = Some(leading),
            }
        }
        Ok(batch_size)
    }

    /// Writes one `op_type<TAB>name` line per layer.
    pub fn write_layer_info(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        for layer in &self.layers {
            writeln!(file, "{}\t{}", layer.op_type, layer.name)?;
        }
        file.flush()
    }
}
