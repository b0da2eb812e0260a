//! HandleProbe - handle inheritance diagnostics for Windows
//!
//! Lists the kernel handles owned by the current process (type and name
//! included) and launches child processes with an explicit inherit/do-not-
//! inherit decision, so leaked listening sockets and other inherited handles
//! can be spotted and avoided.

#![allow(non_snake_case)]

pub mod config;
pub mod error;
pub mod handle_table;
pub mod kernel;
pub mod launcher;
pub mod nt;
pub mod object_name;
#[cfg(windows)]
pub mod syscalls;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ProbeConfig;
pub use error::{LaunchError, ProbeError};
pub use handle_table::{EnumerateOptions, HandleDescriptor, HandleTableEnumerator, RawHandleEntry, TableFormat};
pub use kernel::{round_up_64k, KernelIntrospection};
pub use launcher::{build_command_line, ChildIds, LaunchRequest, Launcher, ProcessSpawner};
pub use nt::nt_success;
pub use object_name::{AccessMaskDenylist, ObjectNameResolver};

#[cfg(windows)]
pub use launcher::{launch, Win32Spawner};
#[cfg(windows)]
pub use syscalls::NtKernel;

/// Enumerates the calling process's handles against the live kernel.
#[cfg(windows)]
pub fn list_own_handles(config: &ProbeConfig) -> Result<Vec<HandleDescriptor>, ProbeError> {
    HandleTableEnumerator::new(NtKernel, config.denylist.clone(), config.enumerate_options())
        .enumerate_own_handles()
}
