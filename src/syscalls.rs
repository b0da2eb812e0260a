//! `ntdll` bindings for the live kernel.

use winapi::shared::ntdef::{HANDLE, NTSTATUS, PVOID};
use winapi::um::processthreadsapi::GetCurrentProcessId;

use crate::kernel::KernelIntrospection;

#[inline(never)]
pub unsafe fn nt_query_system_information(
    info_class: u32,
    info_buffer: PVOID,
    info_length: u32,
    return_length: *mut u32,
) -> NTSTATUS {
    ntapi::ntexapi::NtQuerySystemInformation(info_class, info_buffer, info_length, return_length)
}

#[inline(never)]
pub unsafe fn nt_query_object(
    handle: HANDLE,
    info_class: u32,
    info_buffer: PVOID,
    info_length: u32,
    return_length: *mut u32,
) -> NTSTATUS {
    ntapi::ntobapi::NtQueryObject(handle, info_class, info_buffer, info_length, return_length)
}

fn raw_buffer(buffer: &mut [u8]) -> (PVOID, u32) {
    if buffer.is_empty() {
        (core::ptr::null_mut(), 0)
    } else {
        let len = u32::try_from(buffer.len()).unwrap_or(u32::MAX);
        (buffer.as_mut_ptr() as PVOID, len)
    }
}

/// The running kernel, queried through `ntdll`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NtKernel;

impl KernelIntrospection for NtKernel {
    fn current_process_id(&self) -> u32 {
        unsafe { GetCurrentProcessId() }
    }

    fn query_system_information(&self, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32) {
        let (ptr, len) = raw_buffer(buffer);
        let mut return_length: u32 = 0;
        let status = unsafe { nt_query_system_information(info_class, ptr, len, &mut return_length) };
        (status, return_length)
    }

    fn query_object(&self, handle: usize, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32) {
        let (ptr, len) = raw_buffer(buffer);
        let mut return_length: u32 = 0;
        let status = unsafe {
            nt_query_object(handle as HANDLE, info_class, ptr, len, &mut return_length)
        };
        (status, return_length)
    }
}
