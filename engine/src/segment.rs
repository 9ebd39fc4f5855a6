//! Durable segment files backing boxes.
//!
//! One box is one append-structured file:
//!
//! ```text
//! header:  magic "SBX1" | format_version u32 | name_len u16 | name
//!          | table_len u16 | table_len x (id_len u16 | type_id | fingerprint u32)
//! records: op u8 (1 = put, 2 = delete)
//!          | key_len u16 | key
//!          | id_len u16 | type_id
//!          | fingerprint u32
//!          | payload_len u32 | payload
//!          | crc32 u32 (over op through payload)
//! ```
//!
//! All integers are little-endian. Appends are fsynced before the write is
//! acknowledged, so an acknowledged record survives a crash. A torn record
//! at the tail of the file can only belong to a write that was never
//! acknowledged; it is dropped on open. Damage anywhere before the tail is
//! real corruption and is reported, never repaired silently.

use crate::{error::Result, BoxName, Error, Fingerprint, Key, TypeId};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_MAGIC: &[u8; 4] = b"SBX1";
pub(crate) const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Record operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordOp {
    Put = 1,
    Delete = 2,
}

impl RecordOp {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordOp::Put),
            2 => Some(RecordOp::Delete),
            _ => None,
        }
    }
}

/// A record parsed back out of a segment.
#[derive(Debug, Clone)]
pub(crate) struct StoredRecord {
    pub op: RecordOp,
    pub key: Key,
    pub type_id: TypeId,
    pub fingerprint: Fingerprint,
    pub payload: Vec<u8>,
    /// Byte offset of the record within the segment
    pub offset: u64,
    /// Total encoded length of the record
    pub len: u64,
}

/// An open segment file: header state plus an append handle.
#[derive(Debug)]
pub(crate) struct Segment {
    path: PathBuf,
    file: File,
    name: BoxName,
    /// Per-type fingerprint table, header entries plus types seen in records
    table: HashMap<TypeId, Fingerprint>,
    /// Logical end of the segment (tail-truncated on open if needed)
    end: u64,
}

enum ParseIssue {
    /// Ran out of bytes mid-record; only valid at the tail
    Truncated,
    /// Record bytes are complete but the checksum does not match
    BadCrc(u64),
    /// The record starts with an unknown op tag
    BadTag(u64),
}

impl Segment {
    /// Create a fresh segment with an empty table.
    pub fn create(path: &Path, name: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let header = encode_header(name, &HashMap::new());
        file.write_all(&header)?;
        file.sync_data()?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            name: name.to_string(),
            table: HashMap::new(),
            end: header.len() as u64,
        })
    }

    /// Open an existing segment, replaying all records.
    ///
    /// Returns the segment and its records in append order. A torn tail
    /// record is dropped (the write was never acknowledged); anything else
    /// that fails to parse is [`Error::CorruptSegment`].
    pub fn open(path: &Path, name: &str) -> Result<(Self, Vec<StoredRecord>)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let corrupt = |reason: &str| Error::CorruptSegment {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let (mut table, mut pos) = decode_header(&data, name)?;
        let mut records = Vec::new();

        loop {
            match parse_record(&data, pos) {
                Ok(None) => break,
                Ok(Some(record)) => {
                    pos = record.offset + record.len;
                    if record.op == RecordOp::Put {
                        table.insert(record.type_id.clone(), record.fingerprint);
                    }
                    records.push(record);
                }
                Err(ParseIssue::Truncated) => {
                    // Crash mid-append: the write was never acknowledged,
                    // so dropping the tail loses nothing committed.
                    tracing::warn!(
                        box_name = name,
                        offset = pos,
                        "dropping torn record at segment tail"
                    );
                    file.set_len(pos)?;
                    file.sync_data()?;
                    break;
                }
                Err(ParseIssue::BadCrc(offset)) => {
                    tracing::error!(box_name = name, offset, "segment checksum mismatch");
                    return Err(corrupt(&format!("checksum mismatch at offset {offset}")));
                }
                Err(ParseIssue::BadTag(offset)) => {
                    tracing::error!(box_name = name, offset, "unknown record tag");
                    return Err(corrupt(&format!("unknown record tag at offset {offset}")));
                }
            }
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                name: name.to_string(),
                table,
                end: pos,
            },
            records,
        ))
    }

    /// Append one record and fsync before returning.
    pub fn append(
        &mut self,
        op: RecordOp,
        key: &str,
        type_id: &str,
        fingerprint: Fingerprint,
        payload: &[u8],
    ) -> Result<(u64, u64)> {
        let buf = encode_record(op, key, type_id, fingerprint, payload);
        let offset = self.end;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        self.end = offset + buf.len() as u64;
        if op == RecordOp::Put {
            self.table.insert(type_id.to_string(), fingerprint);
        }

        Ok((offset, buf.len() as u64))
    }

    /// Truncate back to a fresh header with an empty table.
    pub fn reset(&mut self) -> Result<()> {
        let header = encode_header(&self.name, &HashMap::new());
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;

        self.table.clear();
        self.end = header.len() as u64;
        Ok(())
    }

    /// Rewrite the segment with only the given live records (compaction).
    ///
    /// Writes a temporary file, fsyncs it, and renames it over the old
    /// segment so a crash leaves either the old or the new file intact.
    /// Returns the new `(offset, len)` for each key, in input order.
    pub fn rewrite(
        &mut self,
        live: &[(Key, TypeId, Fingerprint, Vec<u8>)],
    ) -> Result<Vec<(Key, u64, u64)>> {
        let mut table = HashMap::new();
        for (_, type_id, fingerprint, _) in live {
            table.insert(type_id.clone(), *fingerprint);
        }

        let tmp_path = self.path.with_extension("sbx.tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let header = encode_header(&self.name, &table);
        tmp.write_all(&header)?;

        let mut offsets = Vec::with_capacity(live.len());
        let mut pos = header.len() as u64;
        for (key, type_id, fingerprint, payload) in live {
            let buf = encode_record(RecordOp::Put, key, type_id, *fingerprint, payload);
            tmp.write_all(&buf)?;
            offsets.push((key.clone(), pos, buf.len() as u64));
            pos += buf.len() as u64;
        }
        tmp.sync_data()?;

        std::fs::rename(&tmp_path, &self.path)?;

        self.file = tmp;
        self.table = table;
        self.end = pos;
        Ok(offsets)
    }

    pub fn table(&self) -> &HashMap<TypeId, Fingerprint> {
        &self.table
    }

    pub fn end(&self) -> u64 {
        self.end
    }
}

fn encode_header(name: &str, table: &HashMap<TypeId, Fingerprint>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(SEGMENT_MAGIC);
    buf.extend_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());

    // Sorted for a deterministic header
    let mut entries: Vec<_> = table.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (type_id, fingerprint) in entries {
        buf.extend_from_slice(&(type_id.len() as u16).to_le_bytes());
        buf.extend_from_slice(type_id.as_bytes());
        buf.extend_from_slice(&fingerprint.to_le_bytes());
    }

    buf
}

/// Parse and validate the header, returning the fingerprint table and the
/// offset of the first record.
fn decode_header(data: &[u8], name: &str) -> Result<(HashMap<TypeId, Fingerprint>, u64)> {
    let corrupt = |reason: &str| Error::CorruptSegment {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut cursor = Cursor::new(data);

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(|_| corrupt("file too short"))?;
    if &magic != SEGMENT_MAGIC {
        return Err(corrupt("bad magic"));
    }

    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| corrupt("truncated header"))?;
    if version > SEGMENT_FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {version}")));
    }

    let stored_name = read_string(&mut cursor).ok_or_else(|| corrupt("truncated header"))?;
    if stored_name != name {
        return Err(corrupt(&format!(
            "box name mismatch: segment holds '{stored_name}'"
        )));
    }

    let table_len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| corrupt("truncated header"))?;
    let mut table = HashMap::new();
    for _ in 0..table_len {
        let type_id = read_string(&mut cursor).ok_or_else(|| corrupt("truncated table"))?;
        let fingerprint = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt("truncated table"))?;
        table.insert(type_id, fingerprint);
    }

    Ok((table, cursor.position()))
}

fn encode_record(
    op: RecordOp,
    key: &str,
    type_id: &str,
    fingerprint: Fingerprint,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(17 + key.len() + type_id.len() + payload.len());
    buf.push(op as u8);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&(type_id.len() as u16).to_le_bytes());
    buf.extend_from_slice(type_id.as_bytes());
    buf.extend_from_slice(&fingerprint.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Parse one record starting at `pos`. `Ok(None)` is a clean end of file.
fn parse_record(data: &[u8], pos: u64) -> std::result::Result<Option<StoredRecord>, ParseIssue> {
    let start = pos as usize;
    if start == data.len() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&data[start..]);

    // Records are appended with a single write, so even a torn tail starts
    // with a valid tag byte; an unknown tag means real damage.
    let tag = cursor.read_u8().map_err(|_| ParseIssue::Truncated)?;
    let op = RecordOp::from_tag(tag).ok_or(ParseIssue::BadTag(pos))?;
    let key = read_string(&mut cursor).ok_or(ParseIssue::Truncated)?;
    let type_id = read_string(&mut cursor).ok_or(ParseIssue::Truncated)?;
    let fingerprint = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ParseIssue::Truncated)?;
    let payload_len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ParseIssue::Truncated)? as usize;

    let body_end = cursor.position() as usize + payload_len;
    if data.len() - start < body_end + 4 {
        return Err(ParseIssue::Truncated);
    }

    let payload = data[start + cursor.position() as usize..start + body_end].to_vec();
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&data[start + body_end..start + body_end + 4]);
    let stored_crc = u32::from_le_bytes(crc_bytes);
    let crc = crc32fast::hash(&data[start..start + body_end]);
    if crc != stored_crc {
        return Err(ParseIssue::BadCrc(pos));
    }

    let len = (body_end + 4) as u64;
    Ok(Some(StoredRecord {
        op,
        key,
        type_id,
        fingerprint,
        payload,
        offset: pos,
        len,
    }))
}

fn read_string<T: AsRef<[u8]>>(cursor: &mut Cursor<T>) -> Option<String> {
    let len = cursor.read_u16::<LittleEndian>().ok()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).ok()?;
    String::from_utf8(bytes).ok()
}
