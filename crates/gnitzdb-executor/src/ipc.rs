//! Shared-memory IPC wire format: a 56-byte header, an error string, a
//! 64-byte-aligned fixed-stride primary arena, and a 64-byte-aligned
//! blob arena, all backed by one sealed `memfd` passed to peers over
//! `SCM_RIGHTS` [spec §6 "IPC protocol"].
//!
//! Grounded on `gnitz/server/ipc.py`/`ipc_ffi.py`: same magic, same
//! header layout, same status/yield-reason codes, same `memfd_create`
//! + `SCM_RIGHTS` FD-passing mechanism. This crate reads the memfd's
//! contents with a plain `pread`-style `File` rather than `mmap`ing it
//! — the FD-passing (the part that actually saves a copy across the
//! process boundary) is preserved; only the local read of one already-
//! local buffer is simplified. Noted as a divergence in `DESIGN.md`.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use gnitzdb_core::{align_up, Column, FieldType, PayloadRowBuilder, PayloadSlot, TableSchema, ZSetBatch, SHORT_STRING_THRESHOLD};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::unistd::ftruncate;

use crate::error::{ExecutorError, Result};

/// "GNITZIPC" little-endian.
pub const MAGIC_IPC: u64 = 0x474E_4954_5A49_5043;
pub const HEADER_SIZE: usize = 56;
pub const ALIGNMENT: usize = 64;

pub const STATUS_OK: u32 = 0;
pub const STATUS_ERROR: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_STATUS: usize = 8;
const OFF_ERR_LEN: usize = 12;
const OFF_PRIMARY_SZ: usize = 16;
const OFF_BLOB_SZ: usize = 24;
const OFF_COUNT: usize = 32;
const OFF_TARGET_ID: usize = 40;
const OFF_CLIENT_ID: usize = 48;

/// A decoded IPC header, plus the byte ranges of the sections that
/// follow it in the segment.
#[derive(Debug, Clone, Copy)]
pub struct IpcHeader {
    pub status: u32,
    pub err_len: u32,
    pub primary_size: u64,
    pub blob_size: u64,
    pub row_count: u64,
    pub target_id: u64,
    pub client_id: u64,
}

impl IpcHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[OFF_MAGIC..], MAGIC_IPC);
        LittleEndian::write_u32(&mut buf[OFF_STATUS..], self.status);
        LittleEndian::write_u32(&mut buf[OFF_ERR_LEN..], self.err_len);
        LittleEndian::write_u64(&mut buf[OFF_PRIMARY_SZ..], self.primary_size);
        LittleEndian::write_u64(&mut buf[OFF_BLOB_SZ..], self.blob_size);
        LittleEndian::write_u64(&mut buf[OFF_COUNT..], self.row_count);
        LittleEndian::write_u64(&mut buf[OFF_TARGET_ID..], self.target_id);
        LittleEndian::write_u64(&mut buf[OFF_CLIENT_ID..], self.client_id);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let magic = LittleEndian::read_u64(&buf[OFF_MAGIC..]);
        if magic != MAGIC_IPC {
            return Err(ExecutorError::BadMagic { expected: MAGIC_IPC, got: magic });
        }
        Ok(IpcHeader {
            status: LittleEndian::read_u32(&buf[OFF_STATUS..]),
            err_len: LittleEndian::read_u32(&buf[OFF_ERR_LEN..]),
            primary_size: LittleEndian::read_u64(&buf[OFF_PRIMARY_SZ..]),
            blob_size: LittleEndian::read_u64(&buf[OFF_BLOB_SZ..]),
            row_count: LittleEndian::read_u64(&buf[OFF_COUNT..]),
            target_id: LittleEndian::read_u64(&buf[OFF_TARGET_ID..]),
            client_id: LittleEndian::read_u64(&buf[OFF_CLIENT_ID..]),
        })
    }
}

/// A received IPC segment: the memfd (kept open so its pages stay
/// live), the decoded header, and — on success with rows — the
/// reconstructed batch.
pub struct IpcPayload {
    pub fd: OwnedFd,
    pub header: IpcHeader,
    pub error: String,
    pub batch: Option<ZSetBatch>,
}

/// Byte offset of the null bitmap within a row, right after pk+weight.
/// One `u64` of null bits is enough for up to [`gnitzdb_core::MAX_COLUMNS`]
/// columns, PK bit included (and always clear, since the PK is never null).
const NULL_BITMAP_WIDTH: usize = 8;

fn row_width(schema: &TableSchema) -> usize {
    let pk_width = if schema.pk_is_u128() { 16 } else { 8 };
    pk_width + 8 + NULL_BITMAP_WIDTH + schema.stride()
}

/// Encode one batch into (primary arena, blob arena) using a row-major,
/// fixed-stride layout: each row is `pk | weight | null bitmap | payload`,
/// with strings inlined up to [`SHORT_STRING_THRESHOLD`] and overflowing
/// into the blob arena by offset — the same string cell shape
/// `TableShardWriter` uses, just packed per-row instead of per-column.
fn encode_batch(schema: &Arc<TableSchema>, batch: &ZSetBatch) -> (Vec<u8>, Vec<u8>) {
    let width = row_width(schema);
    let pk_width = if schema.pk_is_u128() { 16 } else { 8 };
    let mut primary = vec![0u8; width * batch.len()];
    let mut blob = Vec::new();

    for (i, (pk, weight, row)) in batch.iter().enumerate() {
        let base = i * width;
        LittleEndian::write_u64(&mut primary[base..base + 8], pk.0);
        if pk_width == 16 {
            LittleEndian::write_u64(&mut primary[base + 8..base + 16], pk.1);
        }
        LittleEndian::write_i64(&mut primary[base + pk_width..base + pk_width + 8], weight);
        let null_bitmap_base = base + pk_width + 8;
        let payload_base = null_bitmap_base + NULL_BITMAP_WIDTH;

        let mut nulls: u64 = 0;
        for (col, column) in schema.payload_columns() {
            let offset = payload_base + schema.column_offset(col);
            if row.is_null(col) {
                nulls |= 1 << col;
                continue;
            }
            match schema.payload_slot(col) {
                PayloadSlot::Int(_) => {
                    let bits = row.get_int_signed(col).to_le_bytes();
                    let width = column.field_type.size();
                    primary[offset..offset + width].copy_from_slice(&bits[..width]);
                }
                PayloadSlot::Float(_) => {
                    if column.field_type == FieldType::F32 {
                        LittleEndian::write_f32(&mut primary[offset..offset + 4], row.get_float(col) as f32);
                    } else {
                        LittleEndian::write_f64(&mut primary[offset..offset + 8], row.get_float(col));
                    }
                }
                PayloadSlot::U128(_) => {
                    let (lo, hi) = row.get_u128_parts(col);
                    LittleEndian::write_u64(&mut primary[offset..offset + 8], lo);
                    LittleEndian::write_u64(&mut primary[offset + 8..offset + 16], hi);
                }
                PayloadSlot::Str(_) => {
                    let s = row.get_str(col);
                    let cell = &mut primary[offset..offset + 16];
                    LittleEndian::write_u32(&mut cell[0..4], s.len() as u32);
                    let prefix_len = s.len().min(4);
                    cell[4..4 + prefix_len].copy_from_slice(&s.as_bytes()[..prefix_len]);
                    if s.len() <= SHORT_STRING_THRESHOLD {
                        let tail = &s.as_bytes()[prefix_len..];
                        cell[8..8 + tail.len()].copy_from_slice(tail);
                    } else {
                        let blob_off = blob.len() as u64;
                        blob.extend_from_slice(s.as_bytes());
                        LittleEndian::write_u64(&mut cell[8..16], blob_off);
                    }
                }
            }
        }
        LittleEndian::write_u64(&mut primary[null_bitmap_base..null_bitmap_base + NULL_BITMAP_WIDTH], nulls);
    }
    (primary, blob)
}

/// Inverse of [`encode_batch`]: reconstruct a [`ZSetBatch`] from its
/// primary/blob arenas and row count, given the schema used to write it.
fn decode_batch(schema: &Arc<TableSchema>, primary: &[u8], blob: &[u8], row_count: u64) -> ZSetBatch {
    let width = row_width(schema);
    let pk_width = if schema.pk_is_u128() { 16 } else { 8 };
    let mut batch = ZSetBatch::with_capacity(schema.clone(), row_count as usize);

    for i in 0..row_count as usize {
        let base = i * width;
        let pk_lo = LittleEndian::read_u64(&primary[base..base + 8]);
        let pk_hi = if pk_width == 16 { LittleEndian::read_u64(&primary[base + 8..base + 16]) } else { 0 };
        let weight = LittleEndian::read_i64(&primary[base + pk_width..base + pk_width + 8]);
        let null_bitmap_base = base + pk_width + 8;
        let nulls = LittleEndian::read_u64(&primary[null_bitmap_base..null_bitmap_base + NULL_BITMAP_WIDTH]);
        let payload_base = null_bitmap_base + NULL_BITMAP_WIDTH;

        let mut builder = PayloadRowBuilder::new(schema.clone());
        for (col, column) in schema.payload_columns() {
            if nulls & (1 << col) != 0 {
                builder.append_null(col);
                continue;
            }
            let offset = payload_base + schema.column_offset(col);
            decode_cell(&mut builder, column, &primary[offset..], blob);
        }
        batch.append(pk_lo, pk_hi, weight, Arc::new(builder.finish()));
    }
    batch
}

fn decode_cell(builder: &mut PayloadRowBuilder, column: &Column, cell: &[u8], blob: &[u8]) {
    match column.field_type {
        FieldType::String => {
            let len = LittleEndian::read_u32(&cell[0..4]) as usize;
            let prefix_len = len.min(4);
            let mut bytes = vec![0u8; len];
            bytes[..prefix_len].copy_from_slice(&cell[4..4 + prefix_len]);
            if len <= SHORT_STRING_THRESHOLD {
                let tail_len = len - prefix_len;
                bytes[prefix_len..].copy_from_slice(&cell[8..8 + tail_len]);
            } else {
                let off = LittleEndian::read_u64(&cell[8..16]) as usize;
                bytes[prefix_len..].copy_from_slice(&blob[off + prefix_len..off + len]);
            }
            builder.append_string(std::str::from_utf8(&bytes).unwrap_or(""));
        }
        FieldType::U128 => {
            let lo = LittleEndian::read_u64(&cell[0..8]);
            let hi = LittleEndian::read_u64(&cell[8..16]);
            builder.append_u128(lo, hi);
        }
        FieldType::F32 => builder.append_float(LittleEndian::read_f32(&cell[0..4]) as f64),
        FieldType::F64 => builder.append_float(LittleEndian::read_f64(&cell[0..8])),
        _ => {
            let width = column.field_type.size();
            let mut bits = [0u8; 8];
            bits[..width].copy_from_slice(&cell[..width]);
            builder.append_int(i64::from_le_bytes(bits));
        }
    }
}

/// Serialize one reply (a batch, or an error) into a fresh sealed
/// `memfd`, ready to be passed to one or more peers via [`send_fd`].
pub fn serialize_to_memfd(
    schema: Option<&Arc<TableSchema>>,
    batch: Option<&ZSetBatch>,
    status: u32,
    error_msg: &str,
    target_id: u64,
    client_id: u64,
) -> Result<OwnedFd> {
    let (primary, blob) = match (schema, batch) {
        (Some(schema), Some(batch)) => encode_batch(schema, batch),
        _ => (Vec::new(), Vec::new()),
    };
    let row_count = batch.map(|b| b.len()).unwrap_or(0) as u64;

    let err_bytes = error_msg.as_bytes();
    let err_off = HEADER_SIZE;
    let primary_off = align_up(err_off + err_bytes.len(), ALIGNMENT);
    let blob_off = align_up(primary_off + primary.len(), ALIGNMENT);
    let total = align_up(blob_off + blob.len(), ALIGNMENT);

    let header = IpcHeader {
        status,
        err_len: err_bytes.len() as u32,
        primary_size: primary.len() as u64,
        blob_size: blob.len() as u64,
        row_count,
        target_id,
        client_id,
    };

    let fd = memfd_create("gnitz_ipc", MemFdCreateFlag::empty())?;
    ftruncate(&fd, total as i64)?;

    let mut file = std::fs::File::from(fd);
    file.write_all(&header.encode())?;
    file.write_all(err_bytes)?;
    file.seek(SeekFrom::Start(primary_off as u64))?;
    file.write_all(&primary)?;
    file.seek(SeekFrom::Start(blob_off as u64))?;
    file.write_all(&blob)?;
    file.sync_data()?;

    Ok(OwnedFd::from(file))
}

/// Read back everything [`serialize_to_memfd`] wrote. The header names
/// `target_id`, which is usually what's needed to look up the schema
/// the body was encoded with — so the schema is resolved lazily via
/// `resolve_schema`, called only once the header (and thus
/// `target_id`) is known, and only if the header reports any rows.
pub fn read_payload(fd: OwnedFd, resolve_schema: impl FnOnce(&IpcHeader) -> Option<Arc<TableSchema>>) -> Result<IpcPayload> {
    let mut file = std::fs::File::from(fd);
    let mut head_buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut head_buf)?;
    let header = IpcHeader::decode(&head_buf)?;

    let mut err_buf = vec![0u8; header.err_len as usize];
    file.read_exact(&mut err_buf)?;
    let error = String::from_utf8_lossy(&err_buf).into_owned();

    let err_off = HEADER_SIZE;
    let primary_off = align_up(err_off + header.err_len as usize, ALIGNMENT);
    let blob_off = align_up(primary_off + header.primary_size as usize, ALIGNMENT);

    let batch = if header.row_count > 0 {
        let schema = resolve_schema(&header)
            .ok_or_else(|| ExecutorError::Transport("payload has rows but its schema could not be resolved".into()))?;
        let mut primary = vec![0u8; header.primary_size as usize];
        file.seek(SeekFrom::Start(primary_off as u64))?;
        file.read_exact(&mut primary)?;
        let mut blob = vec![0u8; header.blob_size as usize];
        file.seek(SeekFrom::Start(blob_off as u64))?;
        file.read_exact(&mut blob)?;
        Some(decode_batch(&schema, &primary, &blob, header.row_count))
    } else {
        None
    };

    Ok(IpcPayload { fd: OwnedFd::from(file), header, error, batch })
}

/// Send `fd` to the peer on `sock` via `SCM_RIGHTS`, over a dummy
/// 1-byte payload [spec §6 "one FD via SCM_RIGHTS"].
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()> {
    let dummy = [b'G'];
    let iov = [std::io::IoSlice::new(&dummy)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None)?;
    Ok(())
}

/// Receive one FD sent via [`send_fd`], if any arrived with this message.
pub fn recv_fd(sock: BorrowedFd<'_>) -> Result<Option<OwnedFd>> {
    let mut dummy = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut dummy)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                // Safety: the kernel just handed us a fresh, uniquely
                // owned descriptor via SCM_RIGHTS.
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
    }
    Ok(None)
}
