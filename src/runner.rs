//! Flow-graph scheduler.
//!
//! Loading a script populates the registry, builds the binding tables once,
//! and turns the declared flow into an ordered node list. Nodes then execute
//! strictly in declaration order: a scheduler cycle records every pass of a
//! node into one batch, submits it, waits, and advances the node's state.
//!
//! Two operating modes: [`Runner::run`] drives every node to completion;
//! [`Runner::step`] drives each pending node exactly one cycle and prunes
//! completed ones, for callers that own the tick loop themselves.

use std::{fs, path::Path, sync::Arc};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    block::{Block, LayoutError, ValueType},
    context::Context,
    node::{CommandNode, ComputePass, FlagSource},
    registry::{BindError, ReadError, Registry},
    script::{
        BufferDecl, INIT_NODE, NODE_ITERABLE, NODE_POLLABLE, ResourceSpec, Script, ScriptError,
    },
    submit::{SubmitError, SubmitPool},
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to read `{path}`")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("layout of buffer `{name}` is invalid: {source}")]
    Layout { name: String, source: LayoutError },
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("flow node `{node}` references unknown pass `{pass}`")]
    UnknownPass { node: String, pass: String },
    #[error("pollable node `{node}` flag index {index} is out of range for buffer `{buffer}`")]
    FlagOutOfRange {
        node: String,
        buffer: String,
        index: u64,
    },
}

pub struct Runner {
    registry: Registry,
    pool: SubmitPool,
    nodes: Vec<CommandNode>,
}

impl Runner {
    /// Loads a script file and resolves shader paths relative to it.
    pub fn load_file(context: Context, path: impl AsRef<Path>) -> Result<Self, RunError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| RunError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let script = Script::from_str(&source)?;
        let base_dir = path.parent().unwrap_or(Path::new("."));
        Self::load(context, &script, base_dir)
    }

    /// Declares every buffer and pipeline of `script`, binds all descriptors,
    /// builds the flow-node list and runs initialization nodes to completion.
    pub fn load(context: Context, script: &Script, base_dir: &Path) -> Result<Self, RunError> {
        let mut registry = Registry::new(context.clone());
        let pool = SubmitPool::new(context.device.clone(), context.queue.clone());

        for decl in &script.storages {
            let block = pack_decl(decl)?;
            registry.declare_storage(&decl.name, &block)?;
        }
        for decl in &script.uniforms {
            let block = pack_decl(decl)?;
            registry.declare_uniform(&decl.name, &block)?;
        }

        for pipeline in &script.pipelines {
            let path = base_dir.join(&pipeline.path);
            let source = fs::read_to_string(&path).map_err(|source| RunError::Io {
                path: path.display().to_string(),
                source,
            })?;
            registry.declare_pipeline(&pipeline.name, &source)?;
        }

        // the one-shot batched binding pass
        registry.bind_all()?;

        let mut passes: HashMap<&str, Arc<ComputePass>> = HashMap::default();
        for decl in &script.passes {
            // fail early on passes that name a pipeline never declared
            registry.pipeline(&decl.shader)?;
            let group_counts = match (decl.group_counts, decl.compute_scale) {
                (Some(counts), _) => counts,
                (None, Some(scale)) => context.group_counts(scale),
                (None, None) => return Err(ScriptError::MissingDispatchSize(decl.name.clone()).into()),
            };
            passes.insert(
                &decl.name,
                Arc::new(ComputePass {
                    pipeline: decl.shader.clone(),
                    group_counts,
                }),
            );
        }

        let mut nodes = Vec::with_capacity(script.flow.len());
        for decl in &script.flow {
            let name = &decl.node_name;
            let node_passes = decl
                .passes
                .iter()
                .map(|pass| {
                    passes.get(pass.as_str()).cloned().ok_or_else(|| {
                        RunError::UnknownPass {
                            node: name.clone(),
                            pass: pass.clone(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            match decl.node_type {
                NODE_ITERABLE => {
                    let Some(count) = decl.count else {
                        return Err(ScriptError::MissingCount(name.clone()).into());
                    };
                    nodes.push(CommandNode::iterate(name, node_passes, count));
                }
                NODE_POLLABLE => {
                    let (Some(buffer), Some(op), Some(index), Some(threshold)) = (
                        decl.flag_buffer.clone(),
                        decl.operation,
                        decl.flag_index,
                        decl.flag,
                    ) else {
                        return Err(ScriptError::MissingFlagField(name.clone(), "flag").into());
                    };
                    let flag_buffer = registry.buffer(&buffer)?;

                    // the flag slot must lie inside the buffer, on either
                    // readback path, before any copy is ever recorded
                    let in_range = index
                        .checked_mul(4)
                        .and_then(|offset| offset.checked_add(4))
                        .is_some_and(|end| end <= flag_buffer.size);
                    if !in_range {
                        return Err(RunError::FlagOutOfRange {
                            node: name.clone(),
                            buffer,
                            index,
                        });
                    }

                    // Discrete devices cannot map the flag buffer, so the
                    // node copies the flag into a dedicated staging buffer
                    // each cycle before the host reads it.
                    let staging = if context.unified {
                        None
                    } else {
                        let staging = format!("{buffer}-flag-staging");
                        if registry.buffer(&staging).is_err() {
                            registry.declare_staging(&staging, 4)?;
                        }
                        Some(staging)
                    };
                    let source = FlagSource {
                        buffer,
                        index,
                        staging,
                    };
                    nodes.push(CommandNode::poll(name, node_passes, op, threshold, source));
                }
                tag => return Err(ScriptError::UnknownNodeType(name.clone(), tag).into()),
            }
        }

        let mut runner = Self {
            registry,
            pool,
            nodes,
        };
        runner.run_init_nodes()?;
        Ok(runner)
    }

    /// Initialization nodes run to completion exactly once, right after
    /// loading, and leave the flow before the main loop or step mode begins.
    /// They can be non-unique; declaration order is preserved.
    fn run_init_nodes(&mut self) -> Result<(), RunError> {
        let nodes = std::mem::take(&mut self.nodes);
        let (init, rest): (Vec<_>, Vec<_>) = nodes.into_iter().partition(|n| n.name == INIT_NODE);
        self.nodes = rest;
        for mut node in init {
            log::info!("running initialization node");
            while !node.is_complete() {
                self.execute_node(&mut node)?;
            }
        }
        Ok(())
    }

    /// One scheduler cycle for one node: record all passes into a batch,
    /// submit, wait, then advance the node's completion state.
    fn execute_node(&mut self, node: &mut CommandNode) -> Result<(), RunError> {
        self.pool.begin_batch();
        let mut recorder = self.pool.begin();
        for pass in &node.passes {
            let pipeline = self.registry.pipeline(&pass.pipeline)?;
            self.pool.dispatch(&mut recorder, pipeline, pass.group_counts);
        }

        // pollable post-process: stage the flag for host readback
        if let Some(source) = node.flag_source() {
            if let Some(staging) = &source.staging {
                let src = self.registry.buffer(&source.buffer)?;
                let dst = self.registry.buffer(staging)?;
                self.pool
                    .copy(&mut recorder, &src.buffer, source.index * 4, &dst.buffer, 0, 4);
            }
        }

        self.pool.end(recorder);
        self.pool.submit_batch()?;

        let value = match node.flag_source() {
            Some(source) => {
                let (buffer, offset) = source.read_location();
                Some(self.registry.read_flag(buffer, offset)?.as_f32())
            }
            None => None,
        };
        node.observe(value);
        Ok(())
    }

    /// Drives every node to completion, strictly in declaration order.
    /// On failure the node list is left intact, the failed node first.
    pub fn run(&mut self) -> Result<(), RunError> {
        while !self.nodes.is_empty() {
            let mut node = self.nodes.remove(0);
            let start = self.pool.batches();
            while !node.is_complete() {
                if let Err(err) = self.execute_node(&mut node) {
                    self.nodes.insert(0, node);
                    return Err(err);
                }
            }
            log::info!(
                "node `{}` complete after {} batches",
                node.name,
                self.pool.batches() - start
            );
        }
        Ok(())
    }

    /// Drives every pending node exactly one cycle, pruning completed ones.
    /// Returns whether any node remains. On failure the node list is left
    /// intact.
    pub fn step(&mut self) -> Result<bool, RunError> {
        let mut nodes = std::mem::take(&mut self.nodes);
        for index in 0..nodes.len() {
            if let Err(err) = self.execute_node(&mut nodes[index]) {
                self.nodes = nodes;
                return Err(err);
            }
        }
        nodes.retain(|node| {
            let complete = node.is_complete();
            if complete {
                log::info!("node `{}` complete, pruned from flow", node.name);
            }
            !complete
        });
        self.nodes = nodes;
        Ok(!self.nodes.is_empty())
    }

    /// Number of nodes still pending.
    pub fn pending(&self) -> usize {
        self.nodes.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn pack_decl(decl: &BufferDecl) -> Result<Block, RunError> {
    let layout = |source: LayoutError| RunError::Layout {
        name: decl.name.clone(),
        source,
    };
    let types = decl
        .layout
        .type_names()
        .iter()
        .map(|name| ValueType::parse(name))
        .collect::<Result<Vec<_>, _>>()
        .map_err(layout)?;
    match &decl.resource {
        ResourceSpec::Values(values) => Block::from_values(&types, values).map_err(layout),
        ResourceSpec::Zeroed { length } => Block::zeroed(&types, *length).map_err(layout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;

    fn context() -> Option<Context> {
        futures::executor::block_on(ContextBuilder::new().build()).ok()
    }

    #[test]
    fn failed_run_keeps_pending_nodes() {
        let Some(context) = context() else { return };

        // a pipeline lookup failure aborts the very first cycle
        let pass = Arc::new(ComputePass {
            pipeline: "missing".into(),
            group_counts: [1, 1, 1],
        });
        let node = CommandNode::iterate("broken", vec![pass], 1);
        let mut runner = Runner {
            registry: Registry::new(context.clone()),
            pool: SubmitPool::new(context.device.clone(), context.queue.clone()),
            nodes: vec![node],
        };

        assert!(runner.run().is_err());
        assert_eq!(runner.pending(), 1);
        assert!(runner.step().is_err());
        assert_eq!(runner.pending(), 1);
    }
}
