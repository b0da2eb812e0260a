//! Per-object type and name resolution.

use std::collections::BTreeSet;

use crate::kernel::{query_object_sized, read_u16, read_word, KernelIntrospection, MAX_OBJECT_INFO_LEN};
use crate::nt::{nt_success, ObjectInfoClass};

/// Access masks whose handles make `NtQueryObject` block forever.
///
/// `0x0012_0189` is the synchronous named-pipe read access that the name
/// query waits on indefinitely.
pub const DEFAULT_DENIED_ACCESS_MASKS: &[u32] = &[0x0012_0189];

/// Immutable set of access masks that are never queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMaskDenylist {
    masks: BTreeSet<u32>,
}

impl AccessMaskDenylist {
    /// Returns a copy extended with `extra`.
    pub fn extended<I: IntoIterator<Item = u32>>(&self, extra: I) -> Self {
        let mut masks = self.masks.clone();
        masks.extend(extra);
        Self { masks }
    }

    #[inline]
    pub fn contains(&self, access_mask: u32) -> bool {
        self.masks.contains(&access_mask)
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

impl Default for AccessMaskDenylist {
    fn default() -> Self {
        DEFAULT_DENIED_ACCESS_MASKS.iter().copied().collect()
    }
}

impl FromIterator<u32> for AccessMaskDenylist {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            masks: iter.into_iter().collect(),
        }
    }
}

/// Resolves handles to their object type and name.
///
/// Resolution never fails: an empty string means the kernel would not say.
pub struct ObjectNameResolver<K> {
    kernel: K,
    denylist: AccessMaskDenylist,
}

impl<K: KernelIntrospection> ObjectNameResolver<K> {
    pub fn new(kernel: K, denylist: AccessMaskDenylist) -> Self {
        Self { kernel, denylist }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    #[inline]
    pub fn is_denylisted(&self, access_mask: u32) -> bool {
        self.denylist.contains(access_mask)
    }

    /// Queries one information kind for `handle`. The caller checks the
    /// denylist first; this function will issue the query regardless.
    pub fn resolve(&self, handle: usize, info_class: ObjectInfoClass) -> String {
        let (status, buffer) =
            query_object_sized(&self.kernel, handle, info_class.raw(), MAX_OBJECT_INFO_LEN);

        let buffer = match buffer {
            Some(buffer) if nt_success(status) => buffer,
            _ => {
                log::trace!(
                    "handle {:#x}: {:?} query failed with {:#010x}",
                    handle,
                    info_class,
                    status
                );
                return String::new();
            }
        };

        decode_unicode_string(
            buffer.as_bytes(),
            buffer.base_address(),
            self.kernel.pointer_width(),
        )
        .unwrap_or_else(|| {
            log::trace!("handle {:#x}: {:?} answer did not decode", handle, info_class);
            String::new()
        })
    }
}

/// Decodes the `UNICODE_STRING` at the start of an object-information answer.
///
/// The string's buffer pointer refers into the same allocation, so it is
/// translated back to an offset using `base_address`. Pointers that leave the
/// buffer yield `None`.
pub fn decode_unicode_string(bytes: &[u8], base_address: usize, pointer_width: usize) -> Option<String> {
    let byte_len = read_u16(bytes, 0)? as usize;
    if byte_len == 0 {
        return Some(String::new());
    }

    let ptr = usize::try_from(read_word(bytes, pointer_width, pointer_width)?).ok()?;
    let offset = ptr.checked_sub(base_address)?;
    let raw = bytes.get(offset..offset.checked_add(byte_len)?)?;

    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}
