//! Kernel introspection probe.
//!
//! Wraps the two undocumented queries behind [`KernelIntrospection`] and owns
//! the grow-and-retry protocol: when the kernel answers "length mismatch" the
//! reported requirement is rounded up to the next 64KB boundary and the query
//! is reissued against a fresh buffer.

use core::mem;

use crate::error::ProbeError;
use crate::nt::{needs_larger_buffer, nt_success, NTSTATUS, STATUS_UNSUCCESSFUL};

pub const GROW_GRANULARITY: usize = 0x1_0000;
pub const DEFAULT_INITIAL_BUFFER: usize = 0x1_0000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
pub const DEFAULT_MAX_BUFFER: usize = 256 * 1024 * 1024;

/// Largest per-object answer we are willing to allocate for.
pub const MAX_OBJECT_INFO_LEN: usize = 0x1_0000;

/// Black-box access to the host kernel's introspection calls.
///
/// Implementations only promise the status/buffer/length protocol: on a
/// sizing status the returned length is the required buffer size, on success
/// it is the number of bytes written.
pub trait KernelIntrospection {
    fn current_process_id(&self) -> u32;

    fn query_system_information(&self, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32);

    fn query_object(&self, handle: usize, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32);

    /// Width of pointers and `ULONG_PTR` fields in kernel answers.
    fn pointer_width(&self) -> usize {
        mem::size_of::<usize>()
    }
}

impl<K: KernelIntrospection + ?Sized> KernelIntrospection for &K {
    fn current_process_id(&self) -> u32 {
        (**self).current_process_id()
    }

    fn query_system_information(&self, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32) {
        (**self).query_system_information(info_class, buffer)
    }

    fn query_object(&self, handle: usize, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32) {
        (**self).query_object(handle, info_class, buffer)
    }

    fn pointer_width(&self) -> usize {
        (**self).pointer_width()
    }
}

/// Zeroed, 8-byte aligned byte arena handed to the kernel.
///
/// Backed by `u64` words so every header field the kernel writes is naturally
/// aligned. Dropping the buffer is the one and only release.
pub struct KernelBuffer {
    words: Vec<u64>,
    len: usize,
}

impl KernelBuffer {
    pub fn zeroed(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(mem::size_of::<u64>())];
        Self { words, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialised bytes and u8 has no
        // alignment requirement.
        unsafe { core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; the mutable borrow of `self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    /// Address of the first byte, for resolving self-referencing pointers.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.words.as_ptr() as usize
    }
}

impl core::fmt::Debug for KernelBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelBuffer").field("len", &self.len).finish()
    }
}

#[derive(Debug)]
pub struct ProbeResult {
    pub status: NTSTATUS,
    pub buffer: KernelBuffer,
    pub return_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowLimits {
    pub initial_len: usize,
    pub max_attempts: u32,
    pub max_len: usize,
}

impl Default for GrowLimits {
    fn default() -> Self {
        Self {
            initial_len: DEFAULT_INITIAL_BUFFER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_len: DEFAULT_MAX_BUFFER,
        }
    }
}

/// Rounds `len` up to the next 64KB boundary, saturating at the largest
/// 64KB multiple that fits in `usize`.
#[inline]
pub const fn round_up_64k(len: usize) -> usize {
    match checked_round_up_64k(len) {
        Some(rounded) => rounded,
        None => usize::MAX & !(GROW_GRANULARITY - 1),
    }
}

#[inline]
pub const fn checked_round_up_64k(len: usize) -> Option<usize> {
    match len.checked_add(GROW_GRANULARITY - 1) {
        Some(padded) => Some(padded & !(GROW_GRANULARITY - 1)),
        None => None,
    }
}

/// Next buffer size after a sizing status. Always a 64KB multiple and always
/// strictly larger than the buffer that just failed; `None` when no such
/// size fits in `usize`.
#[inline]
pub fn next_buffer_len(current: usize, required: usize) -> Option<usize> {
    checked_round_up_64k(required.max(current.checked_add(1)?))
}

/// One system-information query against a fresh buffer of `len` bytes.
pub fn query_system<K: KernelIntrospection + ?Sized>(
    kernel: &K,
    info_class: u32,
    len: usize,
) -> ProbeResult {
    let mut buffer = KernelBuffer::zeroed(len);
    let (status, return_length) = kernel.query_system_information(info_class, buffer.as_bytes_mut());
    ProbeResult {
        status,
        buffer,
        return_length,
    }
}

/// Probe-and-grow loop for a system-information class.
///
/// Each failed attempt drops its buffer before the next one is allocated.
pub fn query_system_grow<K: KernelIntrospection + ?Sized>(
    kernel: &K,
    info_class: u32,
    limits: GrowLimits,
) -> Result<KernelBuffer, ProbeError> {
    let mut len = limits.initial_len.max(1);
    let mut last_required = 0usize;

    for attempt in 1..=limits.max_attempts {
        let ProbeResult {
            status,
            buffer,
            return_length,
        } = query_system(kernel, info_class, len);

        if nt_success(status) {
            log::debug!(
                "system info class {} fit in {} bytes after {} attempt(s), {} used",
                info_class,
                buffer.len(),
                attempt,
                return_length
            );
            return Ok(buffer);
        }

        if !needs_larger_buffer(status) {
            return Err(ProbeError::KernelStatus { status });
        }

        last_required = return_length as usize;
        let next = next_buffer_len(buffer.len(), last_required);
        drop(buffer);

        let next = match next {
            Some(next) if next <= limits.max_len => next,
            _ => {
                return Err(ProbeError::BufferTooLarge {
                    required: next.unwrap_or(last_required),
                    limit: limits.max_len,
                })
            }
        };

        log::trace!(
            "length mismatch on attempt {}: kernel wants {} bytes, retrying with {}",
            attempt,
            last_required,
            next
        );
        len = next;
    }

    Err(ProbeError::RetryExhausted {
        attempts: limits.max_attempts,
        last_required,
    })
}

/// Sizes and runs a per-object query: a zero-length probe for the required
/// length, then the real query into an exactly sized buffer.
///
/// Returns the terminal status and the buffer when one was allocated.
pub fn query_object_sized<K: KernelIntrospection + ?Sized>(
    kernel: &K,
    handle: usize,
    info_class: u32,
    max_len: usize,
) -> (NTSTATUS, Option<KernelBuffer>) {
    let (probe_status, required) = kernel.query_object(handle, info_class, &mut []);
    let required = required as usize;

    if required == 0 {
        let status = if nt_success(probe_status) {
            STATUS_UNSUCCESSFUL
        } else {
            probe_status
        };
        return (status, None);
    }
    if required > max_len {
        log::trace!(
            "object {:#x} class {} wants {} bytes, over the {} cap",
            handle,
            info_class,
            required,
            max_len
        );
        return (STATUS_UNSUCCESSFUL, None);
    }

    let mut buffer = KernelBuffer::zeroed(required);
    let (status, _written) = kernel.query_object(handle, info_class, buffer.as_bytes_mut());
    (status, Some(buffer))
}

#[inline]
pub fn read_u8(bytes: &[u8], offset: usize) -> Option<u8> {
    bytes.get(offset).copied()
}

#[inline]
pub fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let b = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

#[inline]
pub fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let b = bytes.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

/// Reads a pointer-sized field of the given width.
#[inline]
pub fn read_word(bytes: &[u8], offset: usize, width: usize) -> Option<u64> {
    match width {
        4 => read_u32(bytes, offset).map(u64::from),
        8 => read_u64(bytes, offset),
        _ => None,
    }
}
