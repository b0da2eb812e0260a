//! Process launch with explicit control over handle inheritance.
//!
//! Every OS handle that a launch touches (process, thread and any redirected
//! standard streams) is owned by a guard that closes it on every exit path,
//! including a failed or panicking creation call.

use std::env;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::LaunchError;
use crate::nt::{INVALID_HANDLE_VALUE, NULL_HANDLE};

pub type RawHandle = isize;

#[inline]
pub const fn is_live_handle(handle: RawHandle) -> bool {
    handle != NULL_HANDLE && handle != INVALID_HANDLE_VALUE
}

/// Closes the handle in `slot` if it is live and nulls the slot, so a second
/// release of the same slot does nothing.
pub fn release_handle<F: FnMut(RawHandle)>(slot: &mut RawHandle, close: &mut F) {
    let handle = core::mem::replace(slot, NULL_HANDLE);
    if is_live_handle(handle) {
        close(handle);
    }
}

/// Redirected standard streams. Ownership passes to the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdStreams {
    pub input: RawHandle,
    pub output: RawHandle,
    pub error: RawHandle,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHandles {
    pub process: RawHandle,
    pub thread: RawHandle,
    pub std_input: RawHandle,
    pub std_output: RawHandle,
    pub std_error: RawHandle,
}

impl LaunchHandles {
    pub fn has_std_streams(&self) -> bool {
        is_live_handle(self.std_input) || is_live_handle(self.std_output) || is_live_handle(self.std_error)
    }

    pub fn live_count(&self) -> usize {
        [
            self.process,
            self.thread,
            self.std_input,
            self.std_output,
            self.std_error,
        ]
        .into_iter()
        .filter(|&h| is_live_handle(h))
        .count()
    }

    pub fn release_all<F: FnMut(RawHandle)>(&mut self, mut close: F) {
        for slot in [
            &mut self.std_error,
            &mut self.std_input,
            &mut self.std_output,
            &mut self.thread,
            &mut self.process,
        ] {
            release_handle(slot, &mut close);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildIds {
    pub process_id: u32,
    pub thread_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnParams<'a> {
    pub command_line: &'a str,
    pub working_directory: &'a Path,
    pub inherit_handles: bool,
}

/// OS seam for process creation.
pub trait ProcessSpawner {
    /// Creates the process. Any handle the OS hands back must be stored in
    /// `handles` before returning, on failure as well. Errors carry the
    /// platform error code.
    fn spawn(&self, params: &SpawnParams<'_>, handles: &mut LaunchHandles) -> Result<ChildIds, u32>;

    fn close(&self, handle: RawHandle);
}

struct HandleGuard<'s, S: ProcessSpawner + ?Sized> {
    spawner: &'s S,
    handles: LaunchHandles,
}

impl<S: ProcessSpawner + ?Sized> Drop for HandleGuard<'_, S> {
    fn drop(&mut self) {
        let spawner = self.spawner;
        self.handles.release_all(|h| spawner.close(h));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub executable: &'a str,
    pub arguments: &'a str,
    pub working_directory: Option<&'a Path>,
    pub inherit_handles: bool,
    pub std_streams: Option<StdStreams>,
}

impl<'a> LaunchRequest<'a> {
    pub fn new(executable: &'a str) -> Self {
        Self {
            executable,
            arguments: "",
            working_directory: None,
            inherit_handles: false,
            std_streams: None,
        }
    }

    pub fn arguments(mut self, arguments: &'a str) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn working_directory(mut self, dir: &'a Path) -> Self {
        self.working_directory = Some(dir);
        self
    }

    pub fn inherit_handles(mut self, inherit: bool) -> Self {
        self.inherit_handles = inherit;
        self
    }

    /// Hands redirected standard streams to the child.
    ///
    /// `CreateProcessW` only honours `STARTF_USESTDHANDLES` for non-console
    /// handles when handles are inherited, so with `inherit_handles(false)`
    /// the child keeps its default streams. The handles are still closed.
    pub fn std_streams(mut self, streams: StdStreams) -> Self {
        self.std_streams = Some(streams);
        self
    }

    /// Streams were supplied but inheritance is off, so the redirection
    /// will not reach the child.
    pub fn redirects_without_inheritance(&self) -> bool {
        self.std_streams.is_some() && !self.inherit_handles
    }
}

/// Quotes the executable token unless it already is quoted, then appends the
/// raw argument string.
///
/// Arguments are passed through untouched; only the executable path is
/// protected against embedded spaces.
pub fn build_command_line(executable: &str, arguments: &str) -> String {
    let file_name = executable.trim();
    let quoted = file_name.len() >= 2 && file_name.starts_with('"') && file_name.ends_with('"');

    let mut command_line = String::with_capacity(file_name.len() + arguments.len() + 3);
    if !quoted {
        command_line.push('"');
    }
    command_line.push_str(file_name);
    if !quoted {
        command_line.push('"');
    }
    if !arguments.is_empty() {
        command_line.push(' ');
        command_line.push_str(arguments);
    }
    command_line
}

pub struct Launcher<S> {
    spawner: S,
}

impl<S: ProcessSpawner> Launcher<S> {
    pub fn new(spawner: S) -> Self {
        Self { spawner }
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Starts one child and releases every handle the launch produced before
    /// returning. No handle to the child outlives this call.
    pub fn launch(&self, request: &LaunchRequest<'_>) -> Result<ChildIds, LaunchError> {
        let mut guard = HandleGuard {
            spawner: &self.spawner,
            handles: LaunchHandles::default(),
        };
        if let Some(streams) = request.std_streams {
            guard.handles.std_input = streams.input;
            guard.handles.std_output = streams.output;
            guard.handles.std_error = streams.error;
        }

        let command_line = build_command_line(request.executable, request.arguments);
        if command_line.contains('\0') {
            return Err(LaunchError::InteriorNul("command line"));
        }

        let working_directory: PathBuf = match request.working_directory {
            Some(dir) => dir.to_path_buf(),
            None => env::current_dir().map_err(LaunchError::WorkingDirectory)?,
        };
        if working_directory.as_os_str().to_string_lossy().contains('\0') {
            return Err(LaunchError::InteriorNul("working directory"));
        }

        if request.redirects_without_inheritance() {
            log::warn!(
                "standard streams for `{}` are ignored without handle inheritance",
                command_line
            );
        }
        log::debug!(
            "launching `{}` in {} (inherit handles: {})",
            command_line,
            working_directory.display(),
            request.inherit_handles
        );

        let params = SpawnParams {
            command_line: &command_line,
            working_directory: &working_directory,
            inherit_handles: request.inherit_handles,
        };
        match self.spawner.spawn(&params, &mut guard.handles) {
            Ok(ids) => {
                log::info!(
                    "started pid {} (tid {}), inherit handles: {}",
                    ids.process_id,
                    ids.thread_id,
                    request.inherit_handles
                );
                Ok(ids)
            }
            Err(code) => {
                log::warn!("CreateProcess failed with error {} for `{}`", code, command_line);
                Err(LaunchError::Os { code, command_line })
            }
        }
    }
}

#[cfg(windows)]
pub use win32::Win32Spawner;

/// Launches through `CreateProcessW`.
#[cfg(windows)]
pub fn launch(
    executable: &str,
    arguments: &str,
    working_directory: Option<&Path>,
    inherit_handles: bool,
) -> Result<ChildIds, LaunchError> {
    let mut request = LaunchRequest::new(executable)
        .arguments(arguments)
        .inherit_handles(inherit_handles);
    request.working_directory = working_directory;
    Launcher::new(Win32Spawner).launch(&request)
}

#[cfg(windows)]
mod win32 {
    use core::{mem, ptr};
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;

    use winapi::shared::minwindef::BOOL;
    use winapi::shared::ntdef::HANDLE;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{CreateProcessW, PROCESS_INFORMATION, STARTUPINFOW};
    use winapi::um::winbase::STARTF_USESTDHANDLES;

    use super::{ChildIds, LaunchHandles, ProcessSpawner, RawHandle, SpawnParams};

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Win32Spawner;

    fn to_wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(core::iter::once(0)).collect()
    }

    impl ProcessSpawner for Win32Spawner {
        fn spawn(&self, params: &SpawnParams<'_>, handles: &mut LaunchHandles) -> Result<ChildIds, u32> {
            // CreateProcessW may write into the command line buffer.
            let mut command_line = to_wide(OsStr::new(params.command_line));
            let working_directory = to_wide(params.working_directory.as_os_str());

            let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
            startup.cb = mem::size_of::<STARTUPINFOW>() as u32;
            if handles.has_std_streams() {
                startup.dwFlags |= STARTF_USESTDHANDLES;
                startup.hStdInput = handles.std_input as HANDLE;
                startup.hStdOutput = handles.std_output as HANDLE;
                startup.hStdError = handles.std_error as HANDLE;
            }

            let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
            let ok = unsafe {
                CreateProcessW(
                    ptr::null(),
                    command_line.as_mut_ptr(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    params.inherit_handles as BOOL,
                    0,
                    ptr::null_mut(),
                    working_directory.as_ptr(),
                    &mut startup,
                    &mut info,
                )
            };
            let code = if ok == 0 { unsafe { GetLastError() } } else { 0 };

            handles.process = info.hProcess as RawHandle;
            handles.thread = info.hThread as RawHandle;

            if ok == 0 {
                return Err(code);
            }
            Ok(ChildIds {
                process_id: info.dwProcessId,
                thread_id: info.dwThreadId,
            })
        }

        fn close(&self, handle: RawHandle) {
            unsafe {
                CloseHandle(handle as HANDLE);
            }
        }
    }
}
