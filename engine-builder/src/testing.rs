//! Small ONNX graphs, image folders and batch sources shared by the tests.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use image::{Rgb, RgbImage};
use prost_tract_compat::Message;
use tract_onnx::pb::{
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto,
    TypeProto, ValueInfoProto, tensor_proto, tensor_shape_proto, type_proto,
};

use crate::{
    batcher::{Batch, BatchDescriptor, BatchSource},
    network::{DataType, Dim},
};

pub fn value_info(name: &str, dims: &[Dim], elem_type: i32) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| tensor_shape_proto::Dimension {
            value: Some(match d {
                Some(v) => tensor_shape_proto::dimension::Value::DimValue(*v as i64),
                None => tensor_shape_proto::dimension::Value::DimParam("batch".to_string()),
            }),
            ..Default::default()
        })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type,
                shape: Some(TensorShapeProto {
                    dim,
                    ..Default::default()
                }),
                ..Default::default()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn node(name: &str, op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        name: name.to_string(),
        op_type: op_type.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Builder over a [`ModelProto`] with a single graph.
#[derive(Clone, Debug)]
pub struct OnnxGraph {
    model: ModelProto,
}

impl OnnxGraph {
    pub fn new(name: &str) -> Self {
        Self {
            model: ModelProto {
                ir_version: 7,
                opset_import: vec![OperatorSetIdProto {
                    domain: String::new(),
                    version: 13,
                    ..Default::default()
                }],
                graph: Some(GraphProto {
                    name: name.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    /// `y = Relu(input)`, `None` dimensions being symbolic.
    pub fn relu(input: &str, dims: &[Dim]) -> Self {
        Self::new("relu")
            .with_input(value_info(input, dims, tensor_proto::DataType::Float as i32))
            .with_output(value_info("y", dims, tensor_proto::DataType::Float as i32))
            .with_node(node("relu", "Relu", &[input], &["y"]))
    }

    fn graph(&mut self) -> &mut GraphProto {
        self.model.graph.get_or_insert_with(Default::default)
    }

    pub fn with_input(mut self, input: ValueInfoProto) -> Self {
        self.graph().input.push(input);
        self
    }

    pub fn with_output(mut self, output: ValueInfoProto) -> Self {
        self.graph().output.push(output);
        self
    }

    pub fn with_node(mut self, node: NodeProto) -> Self {
        self.graph().node.push(node);
        self
    }

    pub fn with_initializer(mut self, tensor: TensorProto) -> Self {
        self.graph().initializer.push(tensor);
        self
    }

    pub fn with_untyped_input(self, name: &str) -> Self {
        self.with_input(ValueInfoProto {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Overwrites the element type of the first input.
    pub fn with_input_dtype(mut self, elem_type: i32) -> Self {
        if let Some(Some(type_proto::Value::TensorType(tensor))) = self
            .graph()
            .input
            .first_mut()
            .and_then(|i| i.r#type.as_mut())
            .map(|t| t.value.as_mut())
        {
            tensor.elem_type = elem_type;
        }
        self
    }

    /// Drops the shape of the first input, leaving its rank unknown.
    pub fn without_input_shape(mut self) -> Self {
        if let Some(Some(type_proto::Value::TensorType(tensor))) = self
            .graph()
            .input
            .first_mut()
            .and_then(|i| i.r#type.as_mut())
            .map(|t| t.value.as_mut())
        {
            tensor.shape = None;
        }
        self
    }

    /// Renames the first node.
    pub fn with_node_name(mut self, name: &str) -> Self {
        if let Some(node) = self.graph().node.first_mut() {
            node.name = name.to_string();
        }
        self
    }

    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    pub fn encode(&self) -> Vec<u8> {
        self.model.encode_to_vec()
    }
}

/// Two `[1, 3, 4, 4]` float inputs `a` and `b`, one output `sum`.
pub fn add_graph() -> Vec<u8> {
    let dims = [Some(1), Some(3), Some(4), Some(4)];
    let float = tensor_proto::DataType::Float as i32;
    OnnxGraph::new("add")
        .with_input(value_info("a", &dims, float))
        .with_input(value_info("b", &dims, float))
        .with_output(value_info("sum", &dims, float))
        .with_node(node("add", "Add", &["a", "b"], &["sum"]))
        .encode()
}

/// `y = Relu(x)` over a `[1, 3, 4, 4]` float input.
pub fn relu_graph() -> Vec<u8> {
    OnnxGraph::relu("x", &[Some(1), Some(3), Some(4), Some(4)]).encode()
}

/// Writes `count` distinct `width x height` PNG images into `dir`.
pub fn write_images(dir: &Path, count: usize, width: u32, height: u32) -> anyhow::Result<()> {
    for i in 0..count {
        let shade = (i * 37 % 256) as u8;
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([shade, (x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8])
        });
        image.save(dir.join(format!("image_{i:05}.png")))?;
    }
    Ok(())
}

/// In-memory float batches, each inner vector holding a whole batch.
pub struct VecBatchSource {
    descriptor: BatchDescriptor,
    batches: Vec<Vec<f32>>,
    next: usize,
}

impl VecBatchSource {
    pub fn new(shape: Vec<usize>, batches: Vec<Vec<f32>>) -> Self {
        let descriptor = BatchDescriptor::new(shape, DataType::Float)
            .expect("test batch shape must be valid");
        assert!(batches.iter().all(|b| b.len() == descriptor.element_count()));
        Self {
            descriptor,
            batches,
            next: 0,
        }
    }
}

impl BatchSource for VecBatchSource {
    fn descriptor(&self) -> &BatchDescriptor {
        &self.descriptor
    }

    fn image_index(&self) -> usize {
        self.next * self.descriptor.batch_size()
    }

    fn num_images(&self) -> usize {
        self.batches.len() * self.descriptor.batch_size()
    }

    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>> {
        let Some(values) = self.batches.get(self.next) else {
            return Ok(None);
        };
        let data = self.descriptor.encode(values);
        self.next += 1;
        Ok(Some(Batch {
            data,
            images: vec![],
        }))
    }
}

/// Log output recorded by [`capture_logs`].
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a thread-local subscriber recording every event of INFO and above.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, CapturedLogs) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs)
}
