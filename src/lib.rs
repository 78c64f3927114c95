//! `sluice` is a script-driven GPGPU compute runtime: it reads a declarative
//! description of buffers, compute shaders, dispatch passes and a control-flow
//! graph, and executes that graph on a GPU compute queue.
//!
//! ## Key Components
//! 1. **Block layout packing** ([`block`]): heterogeneous typed data packed
//!    into correctly aligned, GPU-ready byte blocks.
//! 2. **Binding registry** ([`registry`]): named buffers and an indirection
//!    table that wires every buffer into every pipeline referencing it by
//!    name, established once per run.
//! 3. **Submission pool** ([`submit`]): batched command submission with one
//!    fence wait per scheduler step.
//! 4. **Flow scheduler** ([`runner`], [`node`]): iterate-N-times and
//!    poll-until-condition nodes driven strictly in declaration order.
//!
//! Everything runs on a single submission thread; the only concurrency is
//! between that thread and the GPU queue itself, and the only suspension
//! point is the fence wait after each submitted batch.

pub mod block;
pub mod context;
pub mod node;
pub mod registry;
pub mod runner;
pub mod script;
pub mod shader;
pub mod submit;

pub use block::{Block, ValueType};
pub use context::{Context, ContextBuilder};
pub use node::{CommandNode, CompareOp, ComputePass, Flag};
pub use registry::Registry;
pub use runner::{RunError, Runner};
pub use script::Script;
pub use submit::SubmitPool;
