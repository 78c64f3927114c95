//! Buffer and descriptor binding registry.
//!
//! All named GPU buffers live here, together with the indirection table that
//! lets a buffer be declared once and wired into every pipeline that
//! references it by name. Declaration uploads data through a staging buffer;
//! [`Registry::bind_all`] then resolves every pipeline's reflected bindings
//! in one batched pass, so dispatching never rebinds by name again.

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    block::Block,
    context::Context,
    node::Flag,
    shader::{self, BindingInfo, ResourceKind, ShaderError},
};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("buffer `{0}` is already declared")]
    DuplicateBuffer(String),
    #[error("pipeline `{0}` is already declared")]
    DuplicatePipeline(String),
    #[error("unknown pipeline `{0}`")]
    UnknownPipeline(String),
    #[error("pipeline `{pipeline}` references undeclared buffer `{buffer}`")]
    UnresolvedBinding { pipeline: String, buffer: String },
    #[error(
        "pipeline `{pipeline}` binds buffer `{buffer}` as {expected}, but it was declared as {actual}"
    )]
    KindMismatch {
        pipeline: String,
        buffer: String,
        expected: ResourceKind,
        actual: BufferClass,
    },
    #[error("device wait failed during upload of buffer `{name}`")]
    Upload {
        name: String,
        source: wgpu::PollError,
    },
    #[error(transparent)]
    Shader(#[from] ShaderError),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),
    #[error("buffer `{0}` is not host-visible")]
    NotHostVisible(String),
    #[error("flag offset {offset} is out of range for buffer `{name}`")]
    OutOfRange { name: String, offset: u64 },
    #[error("failed to map buffer for readback: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("device poll failed during readback: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("readback channel closed")]
    Channel(#[from] flume::RecvError),
}

/// Usage class of a declared buffer.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferClass {
    #[display("storage")]
    Storage,
    #[display("uniform")]
    Uniform,
    #[display("staging")]
    Staging,
}

/// Logical descriptor pool a buffer's slot lives in.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolKind {
    #[display("storage")]
    Storage,
    #[display("uniform")]
    Uniform,
}

/// A buffer's slot in the shared indirection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub pool: PoolKind,
    pub index: u32,
}

/// A named GPU buffer.
#[derive(Debug)]
pub struct Buffer {
    pub name: String,
    pub class: BufferClass,
    pub size: u64,
    pub buffer: wgpu::Buffer,
    host_visible: bool,
}

/// A compute pipeline plus its reflected interface and, once bound, its
/// per-set bind groups.
#[derive(Debug)]
pub struct Pipeline {
    pub name: String,
    pub pipeline: wgpu::ComputePipeline,
    pub entry_point: String,
    pub bindings: Vec<BindingInfo>,
    /// `(set, bind group)` pairs in ascending set order; empty until
    /// [`Registry::bind_all`] runs.
    pub bind_groups: Vec<(u32, wgpu::BindGroup)>,
}

pub struct Registry {
    context: Context,
    buffers: HashMap<String, Buffer>,
    pipelines: HashMap<String, Pipeline>,
    /// Indirection table: buffer name to its logical pool slot.
    slots: HashMap<String, Slot>,
    storage_slots: u32,
    uniform_slots: u32,
}

impl Registry {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            buffers: HashMap::default(),
            pipelines: HashMap::default(),
            slots: HashMap::default(),
            storage_slots: 0,
            uniform_slots: 0,
        }
    }

    /// Declares a device-local storage buffer seeded from `block`.
    pub fn declare_storage(&mut self, name: &str, block: &Block) -> Result<(), BindError> {
        self.declare_device_buffer(name, block, BufferClass::Storage)
    }

    /// Declares a device-local uniform buffer seeded from `block`.
    pub fn declare_uniform(&mut self, name: &str, block: &Block) -> Result<(), BindError> {
        self.declare_device_buffer(name, block, BufferClass::Uniform)
    }

    /// Declares a host-visible staging buffer, used for flag readback on
    /// discrete devices. Staging buffers take no indirection slot.
    pub fn declare_staging(&mut self, name: &str, size: u64) -> Result<(), BindError> {
        if self.buffers.contains_key(name) {
            return Err(BindError::DuplicateBuffer(name.into()));
        }
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.buffers.insert(
            name.into(),
            Buffer {
                name: name.into(),
                class: BufferClass::Staging,
                size,
                buffer,
                host_visible: true,
            },
        );
        Ok(())
    }

    fn declare_device_buffer(
        &mut self,
        name: &str,
        block: &Block,
        class: BufferClass,
    ) -> Result<(), BindError> {
        if self.buffers.contains_key(name) {
            return Err(BindError::DuplicateBuffer(name.into()));
        }

        let device = &self.context.device;
        let size = block.size() as u64;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size,
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        staging
            .slice(..)
            .get_mapped_range_mut()
            .copy_from_slice(block.bytes());
        staging.unmap();

        let mut usage = match class {
            BufferClass::Storage => wgpu::BufferUsages::STORAGE,
            BufferClass::Uniform => wgpu::BufferUsages::UNIFORM,
            BufferClass::Staging => unreachable!(),
        } | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let host_visible = self.context.unified;
        if host_visible {
            usage |= wgpu::BufferUsages::MAP_READ;
        }

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size,
            usage,
            mapped_at_creation: false,
        });

        // one-shot upload copy, waited so the staging buffer can be dropped
        let mut encoder = device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&staging, 0, &buffer, 0, size);
        let index = self.context.queue.submit(Some(encoder.finish()));
        device
            .poll(wgpu::PollType::WaitForSubmissionIndex(index))
            .map_err(|source| BindError::Upload {
                name: name.into(),
                source,
            })?;

        let slot = match class {
            BufferClass::Storage => {
                let index = self.storage_slots;
                self.storage_slots += 1;
                Slot {
                    pool: PoolKind::Storage,
                    index,
                }
            }
            BufferClass::Uniform => {
                let index = self.uniform_slots;
                self.uniform_slots += 1;
                Slot {
                    pool: PoolKind::Uniform,
                    index,
                }
            }
            BufferClass::Staging => unreachable!(),
        };
        log::debug!("declared {class} buffer `{name}` ({size} bytes, {} slot {})", slot.pool, slot.index);

        self.slots.insert(name.into(), slot);
        self.buffers.insert(
            name.into(),
            Buffer {
                name: name.into(),
                class,
                size,
                buffer,
                host_visible,
            },
        );
        Ok(())
    }

    /// Compiles, validates and reflects one WGSL shader, creating its compute
    /// pipeline. Descriptor contents are resolved later by [`Self::bind_all`].
    pub fn declare_pipeline(&mut self, name: &str, source: &str) -> Result<(), BindError> {
        if self.pipelines.contains_key(name) {
            return Err(BindError::DuplicatePipeline(name.into()));
        }

        let compiled = shader::compile(name, source)?;
        let device = &self.context.device;
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: None,
            module: &module,
            entry_point: Some(&compiled.entry_point),
            compilation_options: Default::default(),
            cache: None,
        });

        log::debug!(
            "declared pipeline `{name}` (entry `{}`, {} bindings)",
            compiled.entry_point,
            compiled.bindings.len()
        );
        self.pipelines.insert(
            name.into(),
            Pipeline {
                name: name.into(),
                pipeline,
                entry_point: compiled.entry_point,
                bindings: compiled.bindings,
                bind_groups: Vec::new(),
            },
        );
        Ok(())
    }

    /// Resolves every pipeline's reflected bindings against the declared
    /// buffers and builds all bind groups in one batched pass. Runs once per
    /// script load, after all declarations.
    pub fn bind_all(&mut self) -> Result<(), BindError> {
        let Self {
            context,
            buffers,
            pipelines,
            slots,
            ..
        } = self;

        for pipeline in pipelines.values_mut() {
            let sets = pipeline
                .bindings
                .iter()
                .map(|binding| (binding.set, binding))
                .into_group_map();

            let mut bind_groups = Vec::with_capacity(sets.len());
            for (set, bindings) in sets.into_iter().sorted_by_key(|(set, _)| *set) {
                let mut entries = Vec::with_capacity(bindings.len());
                for info in bindings.into_iter().sorted_by_key(|info| info.binding) {
                    let buffer =
                        buffers
                            .get(&info.name)
                            .ok_or_else(|| BindError::UnresolvedBinding {
                                pipeline: pipeline.name.clone(),
                                buffer: info.name.clone(),
                            })?;
                    let compatible = matches!(
                        (info.kind, buffer.class),
                        (ResourceKind::Storage, BufferClass::Storage)
                            | (ResourceKind::Uniform, BufferClass::Uniform)
                    );
                    if !compatible {
                        return Err(BindError::KindMismatch {
                            pipeline: pipeline.name.clone(),
                            buffer: info.name.clone(),
                            expected: info.kind,
                            actual: buffer.class,
                        });
                    }
                    let slot = &slots[&info.name];
                    log::debug!(
                        "bind `{}` ({} slot {}) -> `{}` set {} binding {}",
                        info.name,
                        slot.pool,
                        slot.index,
                        pipeline.name,
                        set,
                        info.binding
                    );
                    entries.push(wgpu::BindGroupEntry {
                        binding: info.binding,
                        resource: buffer.buffer.as_entire_binding(),
                    });
                }

                let layout = pipeline.pipeline.get_bind_group_layout(set);
                let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&pipeline.name),
                    layout: &layout,
                    entries: &entries,
                });
                bind_groups.push((set, bind_group));
            }
            pipeline.bind_groups = bind_groups;
        }
        Ok(())
    }

    pub fn buffer(&self, name: &str) -> Result<&Buffer, ReadError> {
        self.buffers
            .get(name)
            .ok_or_else(|| ReadError::UnknownBuffer(name.into()))
    }

    pub fn pipeline(&self, name: &str) -> Result<&Pipeline, BindError> {
        self.pipelines
            .get(name)
            .ok_or_else(|| BindError::UnknownPipeline(name.into()))
    }

    /// Buffer names in declaration-slot order, storages before uniforms.
    pub fn buffer_names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .sorted_by_key(|(_, slot)| (slot.pool, slot.index))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Reads a whole buffer back through an implicit staging copy.
    pub fn read_back(&self, name: &str) -> Result<Vec<u8>, ReadError> {
        let buffer = self.buffer(name)?;
        let (sender, receiver) = readback_channel();
        wgpu::util::DownloadBuffer::read_buffer(
            &self.context.device,
            &self.context.queue,
            &buffer.buffer.slice(..),
            move |result| {
                let _ = sender.send(result.map(|data| data.to_vec()));
            },
        );
        self.context.device.poll(wgpu::PollType::Wait)?;
        Ok(receiver.recv()??)
    }

    /// Reads 4 bytes at `offset` from a host-visible buffer.
    pub fn read_flag(&self, name: &str, offset: u64) -> Result<Flag, ReadError> {
        let buffer = self.buffer(name)?;
        if !buffer.host_visible {
            return Err(ReadError::NotHostVisible(name.into()));
        }
        if offset + 4 > buffer.size {
            return Err(ReadError::OutOfRange {
                name: name.into(),
                offset,
            });
        }

        let slice = buffer.buffer.slice(..);
        let (sender, receiver) = readback_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.context.device.poll(wgpu::PollType::Wait)?;
        receiver.recv()??;

        let mut bytes = [0u8; 4];
        {
            let data = slice.get_mapped_range();
            let offset = offset as usize;
            bytes.copy_from_slice(&data[offset..offset + 4]);
        }
        buffer.buffer.unmap();
        Ok(Flag(bytes))
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Channel carrying one map or download result back to the caller.
///
/// The callback fires synchronously on the thread inside `device.poll`,
/// before `recv` ever runs, so the channel must buffer that one result; a
/// rendezvous channel would block the send and `poll` would never return.
fn readback_channel<T>() -> (flume::Sender<T>, flume::Receiver<T>) {
    flume::bounded(1)
}

#[cfg(test)]
mod tests {
    use super::readback_channel;

    #[test]
    fn readback_channel_holds_result_until_received() {
        // same single-threaded sequence as a readback: the callback sends
        // while nothing is receiving yet, then the caller collects.
        let (sender, receiver) = readback_channel();
        sender.send([0u8, 0, 0x80, 0x3f]).unwrap();
        assert_eq!(receiver.recv().unwrap(), 1.0f32.to_le_bytes());
    }
}
