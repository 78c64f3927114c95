//! Shader front-end: WGSL parsing, validation and binding reflection.
//!
//! Reflection recovers, for every resource global, the `(set, binding)` pair,
//! the resource kind and a stable name the binding registry can resolve
//! against declared buffers.

use derive_more::Display;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("failed to parse shader `{name}`: {source}")]
    Parse {
        name: String,
        source: naga::front::wgsl::ParseError,
    },
    #[error("shader `{name}` failed validation: {source}")]
    Validate {
        name: String,
        source: naga::WithSpan<naga::valid::ValidationError>,
    },
    #[error("shader `{0}` has no compute entry point")]
    MissingEntryPoint(String),
    #[error("shader `{name}` has an unsupported resource in set {set}, binding {binding}")]
    UnsupportedResource { name: String, set: u32, binding: u32 },
    #[error("no usable resource name reflected for set {set}, binding {binding} of shader `{name}`")]
    MissingResourceName { name: String, set: u32, binding: u32 },
}

/// The resource class of a reflected binding.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    #[display("storage")]
    Storage,
    #[display("uniform")]
    Uniform,
}

/// One reflected shader binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub kind: ResourceKind,
}

/// A compiled shader: the validated module plus its reflected interface.
#[derive(Debug)]
pub struct CompiledShader {
    pub module: naga::Module,
    pub entry_point: String,
    pub bindings: Vec<BindingInfo>,
}

/// Parses, validates and reflects one WGSL compute shader.
pub fn compile(name: &str, source: &str) -> Result<CompiledShader, ShaderError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|source| ShaderError::Parse {
        name: name.into(),
        source,
    })?;

    Validator::new(ValidationFlags::all(), Capabilities::default())
        .validate(&module)
        .map_err(|source| ShaderError::Validate {
            name: name.into(),
            source,
        })?;

    let entry_point = module
        .entry_points
        .iter()
        .find(|entry| entry.stage == naga::ShaderStage::Compute)
        .map(|entry| entry.name.clone())
        .ok_or_else(|| ShaderError::MissingEntryPoint(name.into()))?;

    let mut bindings = Vec::new();
    for (_, global) in module.global_variables.iter() {
        let Some(ref resource) = global.binding else {
            continue;
        };
        let (set, binding) = (resource.group, resource.binding);
        let kind = match global.space {
            naga::AddressSpace::Storage { .. } => ResourceKind::Storage,
            naga::AddressSpace::Uniform => ResourceKind::Uniform,
            _ => {
                return Err(ShaderError::UnsupportedResource {
                    name: name.into(),
                    set,
                    binding,
                });
            }
        };
        let resource_name = global
            .name
            .clone()
            .or_else(|| first_member_name(&module, global.ty))
            .ok_or(ShaderError::MissingResourceName {
                name: name.into(),
                set,
                binding,
            })?;
        bindings.push(BindingInfo {
            set,
            binding,
            name: resource_name,
            kind,
        });
    }

    Ok(CompiledShader {
        module,
        entry_point,
        bindings,
    })
}

/// Fallback naming: the first member of the bound struct type.
fn first_member_name(module: &naga::Module, ty: naga::Handle<naga::Type>) -> Option<String> {
    match &module.types[ty].inner {
        naga::TypeInner::Struct { members, .. } => {
            members.first().and_then(|member| member.name.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WGSL: &str = r#"
        struct Params { dt: f32, steps: u32 }

        @group(0) @binding(0) var<storage, read_write> pos: array<f32>;
        @group(0) @binding(1) var<uniform> params: Params;
        @group(1) @binding(0) var<storage, read> vel: array<vec2<f32>>;

        @compute @workgroup_size(64)
        fn main(@builtin(global_invocation_id) id: vec3<u32>) {
            if (id.x < arrayLength(&pos)) {
                pos[id.x] = pos[id.x] + params.dt;
            }
        }
    "#;

    #[test]
    fn reflects_bindings_and_entry_point() {
        let shader = compile("advect", WGSL).unwrap();
        assert_eq!(shader.entry_point, "main");
        assert_eq!(shader.bindings.len(), 3);

        let pos = shader.bindings.iter().find(|b| b.name == "pos").unwrap();
        assert_eq!((pos.set, pos.binding), (0, 0));
        assert_eq!(pos.kind, ResourceKind::Storage);

        let params = shader.bindings.iter().find(|b| b.name == "params").unwrap();
        assert_eq!((params.set, params.binding), (0, 1));
        assert_eq!(params.kind, ResourceKind::Uniform);

        let vel = shader.bindings.iter().find(|b| b.name == "vel").unwrap();
        assert_eq!((vel.set, vel.binding), (1, 0));
    }

    #[test]
    fn rejects_shader_without_compute_entry() {
        let source = r#"
            @vertex
            fn vs() -> @builtin(position) vec4<f32> {
                return vec4<f32>(0.0);
            }
        "#;
        assert!(matches!(
            compile("vs-only", source),
            Err(ShaderError::MissingEntryPoint(_))
        ));
    }

    #[test]
    fn rejects_invalid_source() {
        assert!(matches!(
            compile("broken", "fn {"),
            Err(ShaderError::Parse { .. })
        ));
    }
}
