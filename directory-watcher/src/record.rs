//! Raw change record layout.
//!
//! A completed read fills a buffer with variable-length records chained by
//! byte offsets:
//!
//! ```text
//! 0   u32  next_entry_offset   (0 = last record)
//! 4   u32  action              (1..=5, see ChangeAction)
//! 8   u32  name_length         (bytes)
//! 12  [u8] name                (UTF-16LE, relative to the watched directory)
//! ```
//!
//! Records start on 4-byte boundaries. A rename arrives as a `RenamedFrom`
//! record directly followed by a `RenamedTo` record; when the pair is split
//! across two reads the first half is carried to the front of the buffer and
//! the next read lands right behind it.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::event::{ChangeAction, ChangeRecord, FileChange};

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 12;

/// Smallest possible record: a header and one UTF-16 unit, padded.
const MIN_RECORD_LEN: usize = 16;

/// Aligned size of a record carrying `name_len` bytes of name.
pub fn record_len(name_len: usize) -> usize {
    (HEADER_LEN + name_len).next_multiple_of(4)
}

fn read_u32(buffer: &[u8], offset: usize) -> Option<u32> {
    let bytes = buffer.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Unpadded extent of the record at `offset`, if header and name are both
/// inside `buffer`.
fn record_extent(buffer: &[u8], offset: usize) -> Option<usize> {
    let name_len = read_u32(buffer, offset.checked_add(8)?)? as usize;
    let end = offset.checked_add(HEADER_LEN)?.checked_add(name_len)?;
    (end <= buffer.len()).then_some(HEADER_LEN + name_len)
}

/// Cursor over the records of one filled buffer.
#[derive(Debug, Clone)]
pub struct RecordDecoder<'a> {
    buffer: &'a [u8],
    current: Option<usize>,
}

impl<'a> RecordDecoder<'a> {
    /// Start at the first record of `filled`, the bytes a read produced.
    pub fn new(filled: &'a [u8]) -> Self {
        let current = record_extent(filled, 0).map(|_| 0);
        Self {
            buffer: filled,
            current,
        }
    }

    /// Whether the cursor points at a record.
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Byte offset of the current record.
    pub fn offset(&self) -> Option<usize> {
        self.current
    }

    /// Raw action code of the current record, 0 when there is none.
    pub fn raw_action(&self) -> u32 {
        self.current
            .and_then(|offset| read_u32(self.buffer, offset + 4))
            .unwrap_or(0)
    }

    /// Action of the current record.
    pub fn action(&self) -> Option<ChangeAction> {
        ChangeAction::from_code(self.raw_action())
    }

    /// Name of the current record relative to the watched directory.
    pub fn file_name(&self) -> Option<String> {
        let offset = self.current?;
        let extent = record_extent(self.buffer, offset)?;
        let name = &self.buffer[offset + HEADER_LEN..offset + extent];
        let units: Vec<u16> = name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// Name of the current record joined onto `root`.
    pub fn file_name_with_root(&self, root: &Path) -> Option<PathBuf> {
        self.file_name().map(|name| root.join(name))
    }

    /// The current record in decoded form.
    pub fn record(&self, root: &Path) -> Option<ChangeRecord> {
        let action = self.action()?;
        let relative_name = self.file_name()?;
        Some(ChangeRecord {
            action,
            absolute_path: root.join(&relative_name),
            relative_name,
        })
    }

    /// Move to the next record. Returns `false` at the end of the chain, or
    /// when the chain points somewhere the next record cannot be.
    pub fn advance(&mut self) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        let Some(next_entry_offset) = read_u32(self.buffer, current) else {
            return false;
        };
        if next_entry_offset == 0 {
            return false;
        }

        let next_entry_offset = next_entry_offset as usize;
        let extent = record_extent(self.buffer, current).unwrap_or(HEADER_LEN);
        let next = current.checked_add(next_entry_offset);
        match next {
            Some(next)
                if next_entry_offset >= extent && record_extent(self.buffer, next).is_some() =>
            {
                self.current = Some(next);
                true
            }
            _ => {
                warn!(
                    "Change record at offset {current} points to {next_entry_offset} bytes ahead, outside the {} filled bytes; dropping the rest",
                    self.buffer.len()
                );
                false
            }
        }
    }
}

/// Move the record at `offset` to the start of `buffer` and end the chain
/// there. Returns the record's aligned size, which is where the next read
/// must land.
pub fn carry_record_to_front(buffer: &mut [u8], filled: usize, offset: usize) -> Option<usize> {
    let filled = filled.min(buffer.len());
    let extent = record_extent(&buffer[..filled], offset)?;
    let size = extent.next_multiple_of(4);
    if size > buffer.len() {
        return None;
    }
    if offset != 0 {
        buffer.copy_within(offset..offset + extent, 0);
    }
    write_u32(buffer, 0, 0);
    Some(size)
}

/// Chain a carried record to the records a follow-up read wrote behind it.
pub fn link_carried_record(buffer: &mut [u8], carried_len: usize, read_len: usize) {
    if carried_len == 0 || read_len == 0 || buffer.len() < HEADER_LEN {
        return;
    }
    write_u32(buffer, 0, carried_len as u32);
}

/// Appends whole records to a buffer.
#[derive(Debug)]
pub struct RecordWriter<'a> {
    buffer: &'a mut [u8],
    len: usize,
    last: Option<usize>,
}

impl<'a> RecordWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            len: 0,
            last: None,
        }
    }

    /// Append a record. Returns `false`, writing nothing, if it does not fit.
    pub fn push(&mut self, action: ChangeAction, name: &[u16]) -> bool {
        let name_len = name.len() * 2;
        let start = self.len;
        let size = record_len(name_len);
        if start + size > self.buffer.len() {
            return false;
        }

        write_u32(self.buffer, start, 0);
        write_u32(self.buffer, start + 4, action.code());
        write_u32(self.buffer, start + 8, name_len as u32);
        let name_start = start + HEADER_LEN;
        for (i, unit) in name.iter().enumerate() {
            let at = name_start + i * 2;
            self.buffer[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        self.buffer[name_start + name_len..start + size].fill(0);

        if let Some(previous) = self.last {
            write_u32(self.buffer, previous, (start - previous) as u32);
        }
        self.last = Some(start);
        self.len = start + size;
        true
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still free in the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.len
    }
}

/// Decode `buffer[..filled]`, pair renames and hand each change to
/// `deliver`.
///
/// `carried` says the first record was carried over from the previous read.
/// Returns the length of a `RenamedFrom` record moved to the front of the
/// buffer to wait for its partner, or 0.
pub fn drain_records<F>(
    buffer: &mut [u8],
    filled: usize,
    carried: bool,
    root: &Path,
    mut deliver: F,
) -> usize
where
    F: FnMut(FileChange) -> ControlFlow<()>,
{
    let filled = filled.min(buffer.len());
    let mut orphan: Option<(usize, PathBuf)> = None;

    {
        let mut decoder = RecordDecoder::new(&buffer[..filled]);
        if !decoder.is_valid() {
            return 0;
        }

        loop {
            let Some(record) = decoder.record(root) else {
                warn!("Skipping change record with unknown action {}", decoder.raw_action());
                if !decoder.advance() {
                    break;
                }
                continue;
            };

            let change = match record.action {
                ChangeAction::Added | ChangeAction::RenamedTo => FileChange::Added(record.absolute_path),
                ChangeAction::Removed => FileChange::Removed(record.absolute_path),
                ChangeAction::Modified => FileChange::Modified(record.absolute_path),
                ChangeAction::RenamedFrom => {
                    let offset = decoder.offset().unwrap_or_default();
                    if !decoder.advance() {
                        orphan = Some((offset, record.absolute_path));
                        break;
                    }
                    match decoder.record(root) {
                        Some(next) if next.action == ChangeAction::RenamedTo => FileChange::Renamed {
                            from: record.absolute_path,
                            to: next.absolute_path,
                        },
                        _ => {
                            // The partner never came; the current record is
                            // handled on the next pass.
                            if deliver(FileChange::Removed(record.absolute_path)).is_break() {
                                return 0;
                            }
                            continue;
                        }
                    }
                }
            };

            if deliver(change).is_break() {
                return 0;
            }
            if !decoder.advance() {
                break;
            }
        }
    }

    let Some((offset, old_path)) = orphan else {
        return 0;
    };
    if !(carried && offset == 0) {
        if let Some(carry) = carry_record_to_front(buffer, filled, offset) {
            if carry + MIN_RECORD_LEN <= buffer.len() {
                debug!("Carrying rename of {} over to the next read", old_path.display());
                return carry;
            }
        }
    }
    let _ = deliver(FileChange::Removed(old_path));
    0
}
