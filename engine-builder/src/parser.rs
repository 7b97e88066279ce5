//! Graph parsing: turns a serialized model into a [`Network`].

use std::collections::HashSet;

use itertools::Itertools;
use prost_tract_compat::Message;
use tracing::debug;
use tract_onnx::{
    pb::{ModelProto, ValueInfoProto, tensor_shape_proto::dimension, type_proto},
    prelude::Framework,
};

use crate::network::{DataType, Network, TensorDesc};

/// Every message reported while parsing a graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, derive_more::From)]
pub struct ParseErrors(pub Vec<String>);

impl ParseErrors {
    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn into_messages(self) -> Vec<String> {
        self.0
    }
}

impl std::fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl std::error::Error for ParseErrors {}

pub trait GraphParser {
    /// Parses a serialized graph. On failure, all the problems found are reported, not only the
    /// first one.
    fn parse(&self, graph: &[u8]) -> Result<Network, ParseErrors>;
}

/// ONNX parser backed by `tract-onnx`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OnnxParser;

impl GraphParser for OnnxParser {
    fn parse(&self, graph: &[u8]) -> Result<Network, ParseErrors> {
        let proto = ModelProto::decode(graph)
            .map_err(|e| ParseErrors(vec![format!("decoding ModelProto: {e}")]))?;
        let Some(graph_proto) = proto.graph.as_ref() else {
            return Err(ParseErrors(vec!["model does not contain a graph".to_string()]));
        };

        let mut errors = vec![];
        let initializers: HashSet<&str> = graph_proto
            .initializer
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        // older opsets list initializers among the graph inputs
        let inputs = graph_proto
            .input
            .iter()
            .filter(|input| !initializers.contains(input.name.as_str()))
            .filter_map(|input| tensor_desc(input).map_err(|e| errors.push(e)).ok())
            .collect_vec();
        let outputs = graph_proto
            .output
            .iter()
            .filter_map(|output| tensor_desc(output).map_err(|e| errors.push(e)).ok())
            .collect_vec();
        if inputs.is_empty() {
            errors.push("graph has no inputs".to_string());
        }
        if outputs.is_empty() {
            errors.push("graph has no outputs".to_string());
        }

        // tract panics on untyped or unknown element types, so it only sees well-formed I/O
        if errors.is_empty() {
            if let Err(e) = tract_onnx::onnx().model_for_proto_model(&proto) {
                errors.extend(e.chain().map(|cause| cause.to_string()));
            }
        }
        if !errors.is_empty() {
            return Err(ParseErrors(errors));
        }

        let mut network = Network::new(graph_proto.name.clone());
        for input in inputs {
            network = network.with_input(input);
        }
        for output in outputs {
            network = network.with_output(output);
        }
        for (i, node) in graph_proto.node.iter().enumerate() {
            let name = if node.name.is_empty() {
                format!("{}_{}", node.op_type, i)
            } else {
                node.name.clone()
            };
            network = network.with_layer(name, node.op_type.clone());
        }
        debug!(
            "parsed graph '{}' with {} layers",
            network.name(),
            network.layers().len()
        );
        Ok(network.with_source(graph.to_vec()))
    }
}

fn tensor_desc(info: &ValueInfoProto) -> Result<TensorDesc, String> {
    let Some(type_proto::Value::TensorType(tensor)) =
        info.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        return Err(format!("'{}' is not typed as a tensor", info.name));
    };
    let dtype = DataType::from_onnx(tensor.elem_type).ok_or_else(|| {
        format!(
            "'{}' has unsupported element type {}",
            info.name, tensor.elem_type
        )
    })?;
    let Some(shape) = tensor.shape.as_ref() else {
        return Ok(TensorDesc::unranked(info.name.clone(), dtype));
    };
    let dims = shape
        .dim
        .iter()
        .map(|dim| match dim.value {
            Some(dimension::Value::DimValue(v)) if v >= 0 => Some(v as usize),
            _ => None,
        })
        .collect_vec();
    Ok(TensorDesc::new(info.name.clone(), dims, dtype))
}
