use std::io;

use thiserror::Error;

use crate::nt::NTSTATUS;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("handle table did not fit after {attempts} attempts (last requirement {last_required} bytes)")]
    RetryExhausted { attempts: u32, last_required: usize },

    #[error("handle table needs {required} bytes, limit is {limit}")]
    BufferTooLarge { required: usize, limit: usize },

    #[error("NtQuerySystemInformation failed with status {status:#010x}")]
    KernelStatus { status: NTSTATUS },

    #[error("handle table declares {count} entries but the buffer holds {capacity}")]
    MalformedTable { count: usize, capacity: usize },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("CreateProcess failed for `{command_line}` (error {code})")]
    Os { code: u32, command_line: String },

    #[error("cannot determine working directory: {0}")]
    WorkingDirectory(#[source] io::Error),

    #[error("{0} contains an interior NUL")]
    InteriorNul(&'static str),
}

impl LaunchError {
    /// Platform error code for OS failures, zero otherwise.
    pub fn code(&self) -> u32 {
        match self {
            LaunchError::Os { code, .. } => *code,
            _ => 0,
        }
    }
}
