use thiserror::Error;

use super::pipeline_state::ShaderStage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineStateError {
    #[error("pass '{pass}' has no {stage:?} shader")]
    MissingShader { pass: String, stage: ShaderStage },
    #[error("{stage:?} shader '{name}' failed to compile with defines '{defines}': {reason}")]
    Compilation {
        stage: ShaderStage,
        name: String,
        defines: String,
        reason: String,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConstantBufferError {
    #[error("constant buffer size must be greater than zero")]
    ZeroSize,
    #[error("failed to allocate a GPU buffer of {size} bytes")]
    AllocationFailed { size: u32 },
    #[error("write of {len} bytes at offset {offset} exceeds buffer size {buffer_size}")]
    OutOfRange { offset: u32, len: u32, buffer_size: u32 },
    #[error("block of {size} bytes does not fit in a {page_size}-byte page")]
    BlockTooLarge { size: u32, page_size: u32 },
}
