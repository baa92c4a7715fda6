use petrel_platform::{DmaError, PciError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NvmeError>;

#[derive(Debug, Error)]
pub enum NvmeError {
    #[error("failed to map controller registers: {0}")]
    BarMap(#[from] PciError),

    #[error("controller did not become ready within {timeout_ms} ms")]
    EnableTimeout { timeout_ms: u64 },

    #[error("no completion within {timeout_ms} ms")]
    CompletionTimeout { timeout_ms: u64 },

    #[error("command failed: sc={sc:#04x} sct={sct:#x}")]
    CommandFailed { sc: u8, sct: u8 },

    #[error("dma allocation failed: {0}")]
    Dma(#[from] DmaError),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
