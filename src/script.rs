//! The declarative script schema.
//!
//! A script declares pipelines, buffers, dispatch passes and a flow graph as
//! data. Parsing is plain `serde_json`; structural rules the schema cannot
//! express (an iterable node needs a `count`, a pollable node needs its flag
//! fields) are checked by [`Script::validate`].

use serde::Deserialize;
use thiserror::Error;

use crate::node::CompareOp;

/// Node type tag for iterate-N-times nodes.
pub const NODE_ITERABLE: u8 = 0b01;
/// Node type tag for poll-until-condition nodes.
pub const NODE_POLLABLE: u8 = 0b11;

/// Reserved node name for one-time initialization nodes. They are driven to
/// completion once, right after loading, and removed from the flow.
pub const INIT_NODE: &str = "__INIT__";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to parse script: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("node `{0}` has unknown type tag {1:#04b}")]
    UnknownNodeType(String, u8),
    #[error("iterable node `{0}` is missing `count`")]
    MissingCount(String),
    #[error("pollable node `{0}` is missing `{1}`")]
    MissingFlagField(String, &'static str),
    #[error("pass `{0}` declares neither `groupCounts` nor `computeScale`")]
    MissingDispatchSize(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub pipelines: Vec<PipelineDecl>,
    #[serde(default)]
    pub storages: Vec<BufferDecl>,
    #[serde(default)]
    pub uniforms: Vec<BufferDecl>,
    #[serde(default)]
    pub passes: Vec<PassDecl>,
    #[serde(default)]
    pub flow: Vec<NodeDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDecl {
    pub name: String,
    /// Path to the WGSL source, relative to the script file.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferDecl {
    pub name: String,
    pub layout: LayoutSpec,
    pub resource: ResourceSpec,
}

/// A type list: either a single type name or an ordered list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LayoutSpec {
    Single(String),
    List(Vec<String>),
}

impl LayoutSpec {
    pub fn type_names(&self) -> &[String] {
        match self {
            Self::Single(name) => std::slice::from_ref(name),
            Self::List(names) => names,
        }
    }
}

/// Buffer contents: literal scalars, or a record count for a zeroed buffer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    Values(Vec<f64>),
    Zeroed { length: u64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassDecl {
    pub name: String,
    pub shader: String,
    /// Explicit 3-D workgroup counts.
    pub group_counts: Option<[u32; 3]>,
    /// Logical work-item extents, translated to group counts from the
    /// device's maximum work-group invocation limit.
    pub compute_scale: Option<[u32; 3]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDecl {
    pub node_name: String,
    #[serde(rename = "type")]
    pub node_type: u8,
    pub passes: Vec<String>,
    pub count: Option<u64>,
    pub flag_buffer: Option<String>,
    pub operation: Option<CompareOp>,
    pub flag_index: Option<u64>,
    pub flag: Option<f32>,
}

impl Script {
    pub fn from_str(source: &str) -> Result<Self, ScriptError> {
        let script: Self = serde_json::from_str(source)?;
        script.validate()?;
        Ok(script)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, ScriptError> {
        let script: Self = serde_json::from_reader(reader)?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<(), ScriptError> {
        for pass in &self.passes {
            if pass.group_counts.is_none() && pass.compute_scale.is_none() {
                return Err(ScriptError::MissingDispatchSize(pass.name.clone()));
            }
        }
        for node in &self.flow {
            let name = &node.node_name;
            match node.node_type {
                NODE_ITERABLE => {
                    if node.count.is_none() {
                        return Err(ScriptError::MissingCount(name.clone()));
                    }
                }
                NODE_POLLABLE => {
                    let missing = if node.flag_buffer.is_none() {
                        Some("flagBuffer")
                    } else if node.operation.is_none() {
                        Some("operation")
                    } else if node.flag_index.is_none() {
                        Some("flagIndex")
                    } else if node.flag.is_none() {
                        Some("flag")
                    } else {
                        None
                    };
                    if let Some(field) = missing {
                        return Err(ScriptError::MissingFlagField(name.clone(), field));
                    }
                }
                tag => return Err(ScriptError::UnknownNodeType(name.clone(), tag)),
            }
        }
        Ok(())
    }
}
