#![allow(non_camel_case_types)]

//! NT status codes and information-class selectors used by the probe.
//!
//! Kept free of `winapi` types so the decode and retry logic builds and tests
//! on any host.

pub type NTSTATUS = i32;

pub const STATUS_SUCCESS: NTSTATUS = 0x0000_0000;
pub const STATUS_BUFFER_OVERFLOW: NTSTATUS = 0x8000_0005u32 as i32;
pub const STATUS_UNSUCCESSFUL: NTSTATUS = 0xC000_0001u32 as i32;
pub const STATUS_INFO_LENGTH_MISMATCH: NTSTATUS = 0xC000_0004u32 as i32;
pub const STATUS_INVALID_HANDLE: NTSTATUS = 0xC000_0008u32 as i32;
pub const STATUS_ACCESS_DENIED: NTSTATUS = 0xC000_0022u32 as i32;
pub const STATUS_BUFFER_TOO_SMALL: NTSTATUS = 0xC000_0023u32 as i32;

pub const SYSTEM_HANDLE_INFORMATION_CLASS: u32 = 16;
pub const SYSTEM_EXTENDED_HANDLE_INFORMATION_CLASS: u32 = 64;

#[inline]
pub const fn nt_success(status: NTSTATUS) -> bool {
    status >= 0
}

/// Sizing statuses: the kernel wants a bigger buffer and told us how big.
#[inline]
pub const fn needs_larger_buffer(status: NTSTATUS) -> bool {
    status == STATUS_INFO_LENGTH_MISMATCH
        || status == STATUS_BUFFER_TOO_SMALL
        || status == STATUS_BUFFER_OVERFLOW
}

/// Selector for the per-object query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectInfoClass {
    Name = 1,
    Type = 2,
}

impl ObjectInfoClass {
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

pub const INVALID_HANDLE_VALUE: isize = -1;
pub const NULL_HANDLE: isize = 0;

pub const ERROR_FILE_NOT_FOUND: u32 = 2;
