//! System handle-table enumeration, filtered to the calling process.

use serde::Serialize;

use crate::error::ProbeError;
use crate::kernel::{query_system_grow, read_u16, read_u32, read_u8, read_word, GrowLimits, KernelIntrospection};
use crate::nt::{ObjectInfoClass, SYSTEM_EXTENDED_HANDLE_INFORMATION_CLASS, SYSTEM_HANDLE_INFORMATION_CLASS};
use crate::object_name::{AccessMaskDenylist, ObjectNameResolver};

/// Which handle-table information class to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TableFormat {
    /// `SystemHandleInformation`: 16-bit pids and handle values.
    Legacy,
    /// `SystemExtendedHandleInformation`: full-width pids and handle values.
    #[default]
    Extended,
}

impl TableFormat {
    pub const fn info_class(self) -> u32 {
        match self {
            TableFormat::Legacy => SYSTEM_HANDLE_INFORMATION_CLASS,
            TableFormat::Extended => SYSTEM_EXTENDED_HANDLE_INFORMATION_CLASS,
        }
    }
}

/// One decoded element of the kernel handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHandleEntry {
    pub owner_pid: u64,
    pub object_type: u16,
    pub flags: u32,
    pub handle_value: usize,
    pub object: u64,
    pub access_mask: u32,
}

/// Byte layout of a handle table answer for a given format and pointer width.
///
/// Legacy entry: `u16 pid, u16 backtrace, u8 type, u8 flags, u16 handle,
/// PVOID object, u32 access`, padded to pointer alignment.
/// Extended entry: `PVOID object, ULONG_PTR pid, ULONG_PTR handle, u32 access,
/// u16 backtrace, u16 type, u32 attributes, u32 reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub format: TableFormat,
    pub pointer_width: usize,
}

impl TableLayout {
    pub const fn new(format: TableFormat, pointer_width: usize) -> Self {
        Self {
            format,
            pointer_width,
        }
    }

    /// Bytes before the first entry.
    pub const fn header_len(&self) -> usize {
        match self.format {
            TableFormat::Legacy => self.pointer_width,
            TableFormat::Extended => 2 * self.pointer_width,
        }
    }

    pub const fn entry_len(&self) -> usize {
        let w = self.pointer_width;
        match self.format {
            TableFormat::Legacy => (8 + w + 4 + (w - 1)) & !(w - 1),
            TableFormat::Extended => 3 * w + 16,
        }
    }

    fn read_count(&self, bytes: &[u8]) -> Option<u64> {
        match self.format {
            TableFormat::Legacy => read_u32(bytes, 0).map(u64::from),
            TableFormat::Extended => read_word(bytes, 0, self.pointer_width),
        }
    }

    /// Decodes a single entry from a slice of exactly `entry_len()` bytes.
    pub fn decode_entry(&self, raw: &[u8]) -> Option<RawHandleEntry> {
        let w = self.pointer_width;
        match self.format {
            TableFormat::Legacy => Some(RawHandleEntry {
                owner_pid: u64::from(read_u16(raw, 0)?),
                object_type: u16::from(read_u8(raw, 4)?),
                flags: u32::from(read_u8(raw, 5)?),
                handle_value: usize::from(read_u16(raw, 6)?),
                object: read_word(raw, 8, w)?,
                access_mask: read_u32(raw, 8 + w)?,
            }),
            TableFormat::Extended => Some(RawHandleEntry {
                object: read_word(raw, 0, w)?,
                owner_pid: read_word(raw, w, w)?,
                handle_value: usize::try_from(read_word(raw, 2 * w, w)?).ok()?,
                access_mask: read_u32(raw, 3 * w)?,
                object_type: read_u16(raw, 3 * w + 6)?,
                flags: read_u32(raw, 3 * w + 8)?,
            }),
        }
    }

    /// Iterates the entries of a successful table answer.
    ///
    /// Fails when the declared count does not fit the buffer rather than
    /// returning a truncated table.
    pub fn entries<'b>(
        &self,
        bytes: &'b [u8],
    ) -> Result<impl Iterator<Item = RawHandleEntry> + 'b, ProbeError> {
        let header = self.header_len();
        let entry_len = self.entry_len();
        let capacity = bytes.len().saturating_sub(header) / entry_len;
        if bytes.len() < header {
            return Err(ProbeError::MalformedTable { count: 0, capacity });
        }

        let count = self
            .read_count(bytes)
            .ok_or(ProbeError::MalformedTable { count: 0, capacity })?;
        let count = usize::try_from(count)
            .ok()
            .filter(|&c| c <= capacity)
            .ok_or(ProbeError::MalformedTable {
                count: count as usize,
                capacity,
            })?;

        let layout = *self;
        let table = &bytes[header..header + count * entry_len];
        Ok(table
            .chunks_exact(entry_len)
            .filter_map(move |raw| layout.decode_entry(raw)))
    }
}

/// A handle owned by this process with its resolved type and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleDescriptor {
    pub handle: usize,
    pub owner_pid: u32,
    pub object_type_code: u16,
    pub access_mask: u32,
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
}

impl HandleDescriptor {
    pub fn is_resolved(&self) -> bool {
        !self.type_name.is_empty() || !self.name.is_empty()
    }

    /// AFD endpoints: how sockets show up in the handle table.
    pub fn is_socket(&self) -> bool {
        const AFD_PREFIX: &str = "\\Device\\Afd";
        self.type_name == "File"
            && self
                .name
                .get(..AFD_PREFIX.len())
                .is_some_and(|p| p.eq_ignore_ascii_case(AFD_PREFIX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumerateOptions {
    pub format: TableFormat,
    pub limits: GrowLimits,
    /// Emit denylisted handles with empty type and name instead of dropping them.
    pub report_denylisted: bool,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        Self {
            format: TableFormat::default(),
            limits: GrowLimits::default(),
            report_denylisted: true,
        }
    }
}

pub struct HandleTableEnumerator<K> {
    resolver: ObjectNameResolver<K>,
    options: EnumerateOptions,
}

impl<K: KernelIntrospection> HandleTableEnumerator<K> {
    pub fn new(kernel: K, denylist: AccessMaskDenylist, options: EnumerateOptions) -> Self {
        Self {
            resolver: ObjectNameResolver::new(kernel, denylist),
            options,
        }
    }

    pub fn resolver(&self) -> &ObjectNameResolver<K> {
        &self.resolver
    }

    /// Every handle owned by the calling process, in kernel table order.
    pub fn enumerate_own_handles(&self) -> Result<Vec<HandleDescriptor>, ProbeError> {
        let pid = self.resolver.kernel().current_process_id();
        self.enumerate_for_process(pid)
    }

    // Handle values are only meaningful inside their owner, so `pid` must be
    // the caller's own id whenever resolution is going to run.
    fn enumerate_for_process(&self, pid: u32) -> Result<Vec<HandleDescriptor>, ProbeError> {
        let kernel = self.resolver.kernel();
        let layout = TableLayout::new(self.options.format, kernel.pointer_width());

        if self.options.format == TableFormat::Legacy && pid > u32::from(u16::MAX) {
            log::warn!(
                "pid {} does not fit the legacy handle table; no entries will match",
                pid
            );
        }

        let buffer = query_system_grow(kernel, self.options.format.info_class(), self.options.limits)?;

        let mut descriptors = Vec::new();
        let mut skipped_denied = 0usize;
        for entry in layout.entries(buffer.as_bytes())? {
            if entry.owner_pid != u64::from(pid) {
                continue;
            }

            let (type_name, name) = if self.resolver.is_denylisted(entry.access_mask) {
                skipped_denied += 1;
                if !self.options.report_denylisted {
                    continue;
                }
                (String::new(), String::new())
            } else {
                (
                    self.resolver.resolve(entry.handle_value, ObjectInfoClass::Type),
                    self.resolver.resolve(entry.handle_value, ObjectInfoClass::Name),
                )
            };

            descriptors.push(HandleDescriptor {
                handle: entry.handle_value,
                owner_pid: pid,
                object_type_code: entry.object_type,
                access_mask: entry.access_mask,
                type_name,
                name,
            });
        }

        log::debug!(
            "pid {}: {} handle(s), {} with denylisted access masks",
            pid,
            descriptors.len(),
            skipped_denied
        );
        Ok(descriptors)
    }
}
