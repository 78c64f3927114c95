//! Compute device bootstrap.
//!
//! One logical device, one compute queue. On unified-memory adapters the
//! `MAPPABLE_PRIMARY_BUFFERS` feature is requested so device buffers can be
//! read by the host without a staging copy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to request adapter")]
    RequestAdapter(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Handle to the compute device and its queue, plus the device traits the
/// runtime branches on.
#[derive(Debug, Clone)]
pub struct Context {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// True for discrete GPUs, where device-local memory is not host-visible.
    pub discrete: bool,
    /// True when device buffers can be mapped and read directly by the host.
    pub unified: bool,
    /// Maximum work-group invocation count granted by the device.
    pub max_invocations: u32,
}

pub struct ContextBuilder {
    pub instance: wgpu::Instance,
    pub power_preference: wgpu::PowerPreference,
    pub limits: wgpu::Limits,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            instance: wgpu::Instance::new(&wgpu::InstanceDescriptor::default()),
            power_preference: wgpu::PowerPreference::HighPerformance,
            limits: Default::default(),
        }
    }

    pub fn power_preference(mut self, power_preference: wgpu::PowerPreference) -> Self {
        self.power_preference = power_preference;
        self
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub async fn build(self) -> Result<Context, ContextError> {
        let Self {
            instance,
            power_preference,
            limits,
        } = self;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                ..Default::default()
            })
            .await?;

        let info = adapter.get_info();
        let discrete = info.device_type == wgpu::DeviceType::DiscreteGpu;
        let mappable = adapter
            .features()
            .contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS);
        let unified = !discrete && mappable;

        let mut features = wgpu::Features::empty();
        if unified {
            features |= wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let max_invocations = device.limits().max_compute_invocations_per_workgroup;
        log::info!(
            "using adapter `{}` ({:?}, {})",
            info.name,
            info.device_type,
            if unified { "unified memory" } else { "staged readback" }
        );

        Ok(Context {
            device,
            queue,
            discrete,
            unified,
            max_invocations,
        })
    }
}

impl Context {
    /// Translates logical work-item extents into 3-D workgroup counts.
    ///
    /// The group width and height derive from the square root of the device's
    /// maximum work-group invocation limit; depth is fixed at 1. Counts round
    /// up so the scale is always covered.
    pub fn group_counts(&self, scale: [u32; 3]) -> [u32; 3] {
        scale_to_groups(self.max_invocations, scale)
    }
}

/// See [`Context::group_counts`].
pub fn scale_to_groups(max_invocations: u32, scale: [u32; 3]) -> [u32; 3] {
    let width = f64::from(max_invocations).sqrt();
    let x = (f64::from(scale[0]) / width).ceil() as u32;
    let y = (f64::from(scale[1]) / width).ceil() as u32;
    let z = scale[2];
    [x, y, z]
}

#[cfg(test)]
mod tests {
    use super::scale_to_groups;

    #[test]
    fn scale_covers_work_items() {
        // 1024 invocations give a 32x32 group footprint.
        assert_eq!(scale_to_groups(1024, [512, 512, 1]), [16, 16, 1]);
        assert_eq!(scale_to_groups(1024, [500, 33, 1]), [16, 2, 1]);
        // partial groups round up, depth passes through
        assert_eq!(scale_to_groups(256, [1, 1, 4]), [1, 1, 4]);
        assert_eq!(scale_to_groups(256, [17, 16, 1]), [2, 1, 1]);
    }
}
