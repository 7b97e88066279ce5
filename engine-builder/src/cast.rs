//! Rewrites an ONNX graph so it only carries float32 tensors where it used double or half:
//! graph outputs, `Cast` targets, `Constant` values and initializers.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail, ensure};
use memmap2::Mmap;
use prost_tract_compat::Message;
use tracing::info;
use tract_onnx::{
    pb::{ModelProto, TensorProto, type_proto},
    prelude::f16,
};

use crate::network::DataType;

/// One tensor whose element type was changed.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display("{target}: {from} -> {to}")]
pub struct Rewrite {
    /// `node:attribute` for node attributes, the tensor name otherwise.
    pub target: String,
    pub from: i32,
    pub to: i32,
}

/// Every rewrite done on a model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CastReport {
    pub outputs: Vec<Rewrite>,
    pub casts: Vec<Rewrite>,
    pub constants: Vec<Rewrite>,
    pub initializers: Vec<Rewrite>,
}

impl CastReport {
    pub fn len(&self) -> usize {
        self.outputs.len() + self.casts.len() + self.constants.len() + self.initializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rewrite> {
        self.outputs
            .iter()
            .chain(&self.casts)
            .chain(&self.constants)
            .chain(&self.initializers)
    }
}

/// `<dir>/<stem>_.onnx` next to `input`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}_.onnx"))
}

pub fn cast_model_to_fp32(model: &mut ModelProto) -> anyhow::Result<CastReport> {
    let graph = model.graph.as_mut().context("model does not contain a graph")?;
    let mut report = CastReport::default();

    for output in &mut graph.output {
        if let Some(type_proto::Value::TensorType(tensor)) =
            output.r#type.as_mut().and_then(|t| t.value.as_mut())
        {
            if tensor.elem_type != DataType::ONNX_FLOAT {
                report.outputs.push(Rewrite {
                    target: output.name.clone(),
                    from: tensor.elem_type,
                    to: DataType::ONNX_FLOAT,
                });
                tensor.elem_type = DataType::ONNX_FLOAT;
            }
        }
    }

    for node in &mut graph.node {
        match node.op_type.as_str() {
            "Cast" => {
                for attr in node.attribute.iter_mut().filter(|a| a.name == "to") {
                    if attr.i == DataType::ONNX_DOUBLE as i64 {
                        report.casts.push(Rewrite {
                            target: format!("{}:{}", node.name, attr.name),
                            from: DataType::ONNX_DOUBLE,
                            to: DataType::ONNX_FLOAT,
                        });
                        attr.i = DataType::ONNX_FLOAT as i64;
                    }
                }
            }
            "Constant" => {
                for attr in &mut node.attribute {
                    let Some(tensor) = attr.t.as_mut() else {
                        continue;
                    };
                    if tensor.data_type == DataType::ONNX_DOUBLE {
                        tensor_to_fp32(tensor)
                            .with_context(|| format!("casting constant {}", node.name))?;
                        report.constants.push(Rewrite {
                            target: format!("{}:{}", node.name, attr.name),
                            from: DataType::ONNX_DOUBLE,
                            to: DataType::ONNX_FLOAT,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    for initializer in &mut graph.initializer {
        let from = initializer.data_type;
        if from == DataType::ONNX_DOUBLE || from == DataType::ONNX_FLOAT16 {
            tensor_to_fp32(initializer)
                .with_context(|| format!("casting initializer {}", initializer.name))?;
            report.initializers.push(Rewrite {
                target: initializer.name.clone(),
                from,
                to: DataType::ONNX_FLOAT,
            });
        }
    }

    Ok(report)
}

/// Converts a double or half tensor in place, storing the result as raw little endian floats.
fn tensor_to_fp32(tensor: &mut TensorProto) -> anyhow::Result<()> {
    let values: Vec<f32> = match tensor.data_type {
        DataType::ONNX_DOUBLE if !tensor.raw_data.is_empty() => tensor
            .raw_data
            .chunks_exact(8)
            .map(|c| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(c);
                f64::from_le_bytes(bytes) as f32
            })
            .collect(),
        DataType::ONNX_DOUBLE => tensor.double_data.iter().map(|v| *v as f32).collect(),
        DataType::ONNX_FLOAT16 if !tensor.raw_data.is_empty() => tensor
            .raw_data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        // half values are stored as their bits in int32_data
        DataType::ONNX_FLOAT16 => tensor
            .int32_data
            .iter()
            .map(|v| f16::from_bits(*v as u16).to_f32())
            .collect(),
        other => bail!("cannot convert tensor of type {other} to float"),
    };
    let expected = tensor.dims.iter().product::<i64>();
    ensure!(
        values.len() as i64 == expected,
        "tensor {} holds {} values but its dims {:?} need {}",
        tensor.name,
        values.len(),
        tensor.dims,
        expected
    );
    tensor.data_type = DataType::ONNX_FLOAT;
    tensor.raw_data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    tensor.double_data.clear();
    tensor.int32_data.clear();
    tensor.float_data.clear();
    Ok(())
}

/// Loads `input`, casts it and writes the result to `output`.
pub fn cast_file(input: &Path, output: &Path) -> anyhow::Result<CastReport> {
    let file = std::fs::File::open(input)
        .with_context(|| format!("opening model file {}", input.display()))?;
    let mapped = unsafe { Mmap::map(&file) }.context("mmap-ing model file")?;
    let mut model = ModelProto::decode(&*mapped).context("decoding ModelProto")?;
    drop(mapped);

    let report = cast_model_to_fp32(&mut model)?;
    for rewrite in report.iter() {
        info!("{rewrite}");
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, model.encode_to_vec())
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        "Wrote {} with {} rewrites",
        output.display(),
        report.len()
    );
    Ok(report)
}
