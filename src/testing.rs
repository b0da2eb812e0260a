//! In-memory stand-in for the kernel introspection calls.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use crate::handle_table::{RawHandleEntry, TableFormat, TableLayout};
use crate::kernel::KernelIntrospection;
use crate::nt::{
    NTSTATUS, STATUS_INFO_LENGTH_MISMATCH, STATUS_INVALID_HANDLE, STATUS_SUCCESS,
};

struct FakeObject {
    type_name: String,
    name: Option<String>,
    status: Option<NTSTATUS>,
}

pub(crate) struct FakeKernel {
    pid: u32,
    pointer_width: usize,
    table: Vec<u8>,
    growth: RefCell<VecDeque<usize>>,
    system_status: Option<NTSTATUS>,
    objects: HashMap<usize, FakeObject>,
    system_queries: RefCell<Vec<(u32, usize)>>,
    object_queries: RefCell<Vec<(usize, u32, usize)>>,
}

impl FakeKernel {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            pointer_width: core::mem::size_of::<usize>(),
            table: Vec::new(),
            growth: RefCell::new(VecDeque::new()),
            system_status: None,
            objects: HashMap::new(),
            system_queries: RefCell::new(Vec::new()),
            object_queries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn with_pointer_width(mut self, width: usize) -> Self {
        self.pointer_width = width;
        self
    }

    pub(crate) fn with_table_bytes(mut self, table: Vec<u8>) -> Self {
        self.table = table;
        self
    }

    pub(crate) fn with_table(self, layout: TableLayout, entries: &[RawHandleEntry]) -> Self {
        self.with_table_bytes(encode_table(layout, entries))
    }

    /// Requirements reported by successive table queries before the real
    /// table is served, as if the table grew between calls.
    pub(crate) fn with_growth<I: IntoIterator<Item = usize>>(self, required: I) -> Self {
        self.growth.borrow_mut().extend(required);
        self
    }

    pub(crate) fn with_system_status(mut self, status: NTSTATUS) -> Self {
        self.system_status = Some(status);
        self
    }

    pub(crate) fn with_object(mut self, handle: usize, type_name: &str, name: Option<&str>) -> Self {
        self.objects.insert(
            handle,
            FakeObject {
                type_name: type_name.to_string(),
                name: name.map(str::to_string),
                status: None,
            },
        );
        self
    }

    pub(crate) fn with_object_status(mut self, handle: usize, status: NTSTATUS) -> Self {
        if let Some(object) = self.objects.get_mut(&handle) {
            object.status = Some(status);
        }
        self
    }

    pub(crate) fn system_buffer_lens(&self) -> Vec<usize> {
        self.system_queries.borrow().iter().map(|q| q.1).collect()
    }

    pub(crate) fn system_classes(&self) -> Vec<u32> {
        self.system_queries.borrow().iter().map(|q| q.0).collect()
    }

    /// `(handle, info class, buffer length)` for every object query.
    pub(crate) fn object_queries(&self) -> Vec<(usize, u32, usize)> {
        self.object_queries.borrow().clone()
    }
}

impl KernelIntrospection for FakeKernel {
    fn current_process_id(&self) -> u32 {
        self.pid
    }

    fn query_system_information(&self, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32) {
        self.system_queries.borrow_mut().push((info_class, buffer.len()));

        if let Some(status) = self.system_status {
            return (status, 0);
        }

        let required = match self.growth.borrow_mut().pop_front() {
            Some(grown) => grown.max(self.table.len()),
            None => self.table.len(),
        };
        if buffer.len() < required {
            return (STATUS_INFO_LENGTH_MISMATCH, required as u32);
        }

        buffer[..self.table.len()].copy_from_slice(&self.table);
        (STATUS_SUCCESS, self.table.len() as u32)
    }

    fn query_object(&self, handle: usize, info_class: u32, buffer: &mut [u8]) -> (NTSTATUS, u32) {
        self.object_queries
            .borrow_mut()
            .push((handle, info_class, buffer.len()));

        let Some(object) = self.objects.get(&handle) else {
            return (STATUS_INVALID_HANDLE, 0);
        };
        if let Some(status) = object.status {
            return (status, 0);
        }

        let text = if info_class == 2 {
            object.type_name.as_str()
        } else {
            object.name.as_deref().unwrap_or("")
        };
        let base = buffer.as_ptr() as usize;
        let answer = encode_unicode_answer(text, base, self.pointer_width);
        if buffer.len() < answer.len() {
            return (STATUS_INFO_LENGTH_MISMATCH, answer.len() as u32);
        }

        buffer[..answer.len()].copy_from_slice(&answer);
        (STATUS_SUCCESS, answer.len() as u32)
    }

    fn pointer_width(&self) -> usize {
        self.pointer_width
    }
}

fn put_word(out: &mut [u8], offset: usize, width: usize, value: u64) {
    match width {
        4 => out[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes()),
        _ => out[offset..offset + 8].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Serialises entries the way the kernel lays out a handle table answer.
pub(crate) fn encode_table(layout: TableLayout, entries: &[RawHandleEntry]) -> Vec<u8> {
    let w = layout.pointer_width;
    let entry_len = layout.entry_len();
    let mut out = vec![0u8; layout.header_len() + entries.len() * entry_len];

    match layout.format {
        TableFormat::Legacy => out[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes()),
        TableFormat::Extended => put_word(&mut out, 0, w, entries.len() as u64),
    }

    for (i, e) in entries.iter().enumerate() {
        let at = layout.header_len() + i * entry_len;
        let raw = &mut out[at..at + entry_len];
        match layout.format {
            TableFormat::Legacy => {
                raw[0..2].copy_from_slice(&(e.owner_pid as u16).to_le_bytes());
                raw[4] = e.object_type as u8;
                raw[5] = e.flags as u8;
                raw[6..8].copy_from_slice(&(e.handle_value as u16).to_le_bytes());
                put_word(raw, 8, w, e.object);
                raw[8 + w..12 + w].copy_from_slice(&e.access_mask.to_le_bytes());
            }
            TableFormat::Extended => {
                put_word(raw, 0, w, e.object);
                put_word(raw, w, w, e.owner_pid);
                put_word(raw, 2 * w, w, e.handle_value as u64);
                raw[3 * w..3 * w + 4].copy_from_slice(&e.access_mask.to_le_bytes());
                raw[3 * w + 6..3 * w + 8].copy_from_slice(&e.object_type.to_le_bytes());
                raw[3 * w + 8..3 * w + 12].copy_from_slice(&e.flags.to_le_bytes());
            }
        }
    }
    out
}

/// An object-information answer: `UNICODE_STRING` header whose buffer
/// pointer targets the NUL-terminated text placed right after it.
pub(crate) fn encode_unicode_answer(text: &str, base_address: usize, width: usize) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let header = 2 * width;
    let byte_len = units.len() * 2;
    let mut out = vec![0u8; header + byte_len + 2];

    out[0..2].copy_from_slice(&(byte_len as u16).to_le_bytes());
    out[2..4].copy_from_slice(&((byte_len + 2) as u16).to_le_bytes());
    put_word(&mut out, width, width, (base_address + header) as u64);
    for (i, unit) in units.iter().enumerate() {
        out[header + 2 * i..header + 2 * i + 2].copy_from_slice(&unit.to_le_bytes());
    }
    out
}
