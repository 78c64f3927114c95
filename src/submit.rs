//! Command submission pool.
//!
//! Batches command buffers and synchronizes with the GPU: everything recorded
//! between `begin_batch` and `submit_batch` goes out in one queue submission,
//! and `submit_batch` blocks until that submission's index signals. One wait
//! per scheduler step, no finer-grained pipelining.
//!
//! Fences map onto wgpu submission indices. Encoders are one-shot in wgpu, so
//! "reset and re-record" becomes recording a fresh encoder into the reused
//! command-buffer arena; the arena never shrinks and its cursor resets to
//! zero after every successful submission.

use thiserror::Error;

use crate::registry::Pipeline;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("fence wait failed after batch {batch}: {source}")]
    Wait {
        batch: u64,
        source: wgpu::PollError,
    },
}

/// An open command buffer being recorded.
pub struct CommandRecorder {
    encoder: wgpu::CommandEncoder,
}

pub struct SubmitPool {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Command buffers recorded since the last `begin_batch`.
    recorded: Vec<wgpu::CommandBuffer>,
    /// Completed batch submissions, used for labels and diagnostics.
    batches: u64,
}

impl SubmitPool {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            recorded: Vec::new(),
            batches: 0,
        }
    }

    /// Preheats the pool for a new batch; anything recorded but not yet
    /// submitted is discarded.
    pub fn begin_batch(&mut self) {
        self.recorded.clear();
    }

    /// Opens a fresh command buffer for recording.
    pub fn begin(&self) -> CommandRecorder {
        let label = format!("batch-{}-cmd-{}", self.batches, self.recorded.len());
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&label),
            });
        CommandRecorder { encoder }
    }

    /// Records one compute dispatch: binds the pipeline and all of its
    /// descriptor sets, then dispatches the given 3-D group counts.
    pub fn dispatch(
        &self,
        recorder: &mut CommandRecorder,
        pipeline: &Pipeline,
        group_counts: [u32; 3],
    ) {
        let mut pass = recorder
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&pipeline.name),
                timestamp_writes: None,
            });
        pass.set_pipeline(&pipeline.pipeline);
        for (set, bind_group) in &pipeline.bind_groups {
            pass.set_bind_group(*set, bind_group, &[]);
        }
        pass.dispatch_workgroups(group_counts[0], group_counts[1], group_counts[2]);
    }

    /// Records a raw device-side buffer copy.
    pub fn copy(
        &self,
        recorder: &mut CommandRecorder,
        src: &wgpu::Buffer,
        src_offset: u64,
        dst: &wgpu::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        recorder
            .encoder
            .copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
    }

    /// Finishes a command buffer into the batch arena.
    pub fn end(&mut self, recorder: CommandRecorder) {
        self.recorded.push(recorder.encoder.finish());
    }

    /// Submits every command buffer recorded since `begin_batch` as one
    /// batch, then blocks until its submission index signals.
    pub fn submit_batch(&mut self) -> Result<(), SubmitError> {
        let commands = self.recorded.drain(..).collect::<Vec<_>>();
        let count = commands.len();
        let index = self.queue.submit(commands);
        self.device
            .poll(wgpu::PollType::WaitForSubmissionIndex(index))
            .map_err(|source| SubmitError::Wait {
                batch: self.batches,
                source,
            })?;
        log::debug!("batch {} submitted ({count} command buffers)", self.batches);
        self.batches += 1;
        Ok(())
    }

    /// Number of batches submitted so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }
}
