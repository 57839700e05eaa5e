pub mod batch;
pub mod batch_renderer;
pub mod callback;
pub mod collector;
pub mod constant_buffer;
pub mod custom_view;
pub mod device;
pub mod diagnostics;
pub mod draw_queue;
pub mod error;
pub mod geometry;
pub mod internal;
pub mod light_accumulator;
pub mod material;
pub mod pipeline_cache;
pub mod pipeline_factory;
pub mod pipeline_state;
pub mod scene_light;
pub mod scene_pass;
pub mod shader_params;
pub mod shadow_atlas;
pub mod sorting;

pub use batch::{BaseSceneBatch, IntermediateSceneBatch};
pub use batch_renderer::{BatchRenderFlags, CameraUniform, SceneBatchRenderContext, SceneBatchRenderer};
pub use callback::SceneBatchCollectorCallback;
pub use collector::SceneBatchCollector;
pub use constant_buffer::{ConstantBuffer, ConstantBufferLayout, ConstantBufferRange, ConstantBufferRing};
pub use custom_view::CustomView;
pub use device::{
    BufferId, ClearFlags, DeviceCall, DrawCall, GpuObject, RecordingDevice, RenderDevice, SamplerId,
    TextureId,
};
pub use diagnostics::{FrameDiagnostics, FrameStats};
pub use draw_queue::{DrawCommand, DrawCommandQueue};
pub use error::{ConstantBufferError, PipelineStateError};
pub use geometry::Geometry;
pub use internal::WorkQueue;
pub use light_accumulator::{MAX_PIXEL_LIGHTS, MAX_VERTEX_LIGHTS, NO_LIGHT};
pub use material::{BlendMode, CullMode, Material, MaterialQuality, Pass, Technique};
pub use pipeline_factory::{DefaultSceneCallback, PermissiveShaderCompiler, ShaderCompiler};
pub use pipeline_state::PipelineState;
pub use scene_light::SceneLight;
pub use scene_pass::{ScenePass, ScenePassId};
pub use shader_params::{ShaderParameterGroup, ShaderParameterValue, TextureUnit};
pub use shadow_atlas::{ShadowMap, ShadowMapAllocator};
pub use sorting::{BatchSortOrder, SortedBatches};
