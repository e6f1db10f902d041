//! Wire format shared by clients, workers and the manager.
//!
//! Every message is a fixed 28-byte header followed by an opaque entity
//! whose layout is chosen per operation. Encoding is raw binary in native
//! byte order; the channel never crosses a host boundary.

use crate::engine::{EngineOptions, RangeOptions, StorageLayout};
use crate::errors::{IpcError, Result};

/// Packed header size: five `u32` fields plus one `u64`.
pub const MSG_HEADER_SIZE: usize = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Op {
    Dummy = 0,
    Open,
    Close,
    Count,
    Put,
    Get,
    Del,
    Load,
    ReadBatch,
    DelCursor,
    RangeQuery,
    ClearRangeQuery,
    Launch,
    Terminate,
}

impl Op {
    pub fn from_u32(value: u32) -> Option<Op> {
        Some(match value {
            0 => Op::Dummy,
            1 => Op::Open,
            2 => Op::Close,
            3 => Op::Count,
            4 => Op::Put,
            5 => Op::Get,
            6 => Op::Del,
            7 => Op::Load,
            8 => Op::ReadBatch,
            9 => Op::DelCursor,
            10 => Op::RangeQuery,
            11 => Op::ClearRangeQuery,
            12 => Op::Launch,
            13 => Op::Terminate,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Dummy = 0,
    Success,
    Failure,
    Exception,
}

impl Status {
    pub fn from_u32(value: u32) -> Option<Status> {
        Some(match value {
            0 => Status::Dummy,
            1 => Status::Success,
            2 => Status::Failure,
            3 => Status::Exception,
            _ => return None,
        })
    }
}

/// Fixed-size message header.
///
/// `rps_id` names the response slot the requester holds; it is only
/// meaningful on request/response paths. `ety_size` is the exact entity
/// byte length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub op: Op,
    pub db_id: u32,
    pub rel_id: u32,
    pub status: Status,
    pub rps_id: u32,
    pub ety_size: u64,
}

impl Header {
    pub fn request(op: Op, rel_id: u32, db_id: u32) -> Header {
        Header {
            op,
            db_id,
            rel_id,
            status: Status::Dummy,
            rps_id: 0,
            ety_size: 0,
        }
    }

    pub fn response(status: Status, rps_id: u32) -> Header {
        Header {
            op: Op::Dummy,
            db_id: 0,
            rel_id: 0,
            status,
            rps_id,
            ety_size: 0,
        }
    }

    pub fn encode(&self, buf: &mut [u8; MSG_HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&(self.op as u32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.db_id.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.rel_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&(self.status as u32).to_ne_bytes());
        buf[16..20].copy_from_slice(&self.rps_id.to_ne_bytes());
        buf[20..28].copy_from_slice(&self.ety_size.to_ne_bytes());
    }

    pub fn decode(buf: &[u8; MSG_HEADER_SIZE]) -> Result<Header> {
        let word = |at: usize| u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());
        let op = Op::from_u32(word(0))
            .ok_or_else(|| IpcError::protocol(format!("unknown operation {}", word(0))))?;
        let status = Status::from_u32(word(12))
            .ok_or_else(|| IpcError::protocol(format!("unknown status {}", word(12))))?;
        Ok(Header {
            op,
            db_id: word(4),
            rel_id: word(8),
            status,
            rps_id: word(16),
            ety_size: u64::from_ne_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// Sequential writer over an entity area.
pub struct EntityWriter<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl<'a> EntityWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> EntityWriter<'a> {
        EntityWriter { buf, off: 0 }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf[self.off..self.off + bytes.len()].copy_from_slice(bytes);
        self.off += bytes.len();
    }

    pub fn push_u8(&mut self, value: u8) {
        self.push(&[value]);
    }

    pub fn push_u32(&mut self, value: u32) {
        self.push(&value.to_ne_bytes());
    }

    pub fn push_i32(&mut self, value: i32) {
        self.push(&value.to_ne_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.push(&value.to_ne_bytes());
    }

    pub fn written(&self) -> usize {
        self.off
    }
}

/// Sequential reader over an entity area. Underruns are protocol errors,
/// never panics: entity sizes come from the peer.
pub struct EntityReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> EntityReader<'a> {
    pub fn new(buf: &'a [u8]) -> EntityReader<'a> {
        EntityReader { buf, off: 0 }
    }

    pub fn pop(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.off + len > self.buf.len() {
            return Err(IpcError::protocol(format!(
                "entity underrun: need {} bytes at offset {}, have {}",
                len,
                self.off,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.off..self.off + len];
        self.off += len;
        Ok(slice)
    }

    pub fn pop_u8(&mut self) -> Result<u8> {
        Ok(self.pop(1)?[0])
    }

    pub fn pop_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.pop(4)?.try_into().unwrap()))
    }

    pub fn pop_i32(&mut self) -> Result<i32> {
        Ok(i32::from_ne_bytes(self.pop(4)?.try_into().unwrap()))
    }

    pub fn pop_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.pop(8)?.try_into().unwrap()))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.off
    }
}

/// An encodable message entity. Implementations write themselves straight
/// into the shared-memory area; `size` must match what `write` produces.
pub trait Entity {
    fn size(&self) -> u64;
    fn write(&self, w: &mut EntityWriter<'_>);
}

/// The empty entity, for header-only messages.
impl Entity for () {
    fn size(&self) -> u64 {
        0
    }

    fn write(&self, _w: &mut EntityWriter<'_>) {}
}

/// Raw bytes, used for keys and returned values.
impl Entity for &[u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        w.push(self);
    }
}

/// A bare 64-bit integer, used for `Count` replies.
impl Entity for u64 {
    fn size(&self) -> u64 {
        8
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        w.push_u64(*self);
    }
}

const ENGINE_OPTIONS_SIZE: u64 = 10;

fn write_engine_options(opts: &EngineOptions, w: &mut EntityWriter<'_>) {
    w.push_u8(opts.create_if_missing as u8);
    w.push_u8(opts.read_only as u8);
    w.push_u64(opts.cache_capacity);
}

fn read_engine_options(r: &mut EntityReader<'_>) -> Result<EngineOptions> {
    Ok(EngineOptions {
        create_if_missing: r.pop_u8()? != 0,
        read_only: r.pop_u8()? != 0,
        cache_capacity: r.pop_u64()?,
    })
}

/// `Open` arguments: engine options, layout selection, store path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenArgs {
    pub opts: EngineOptions,
    pub layout: StorageLayout,
    pub path: std::path::PathBuf,
}

impl OpenArgs {
    pub fn decode(r: &mut EntityReader<'_>) -> Result<OpenArgs> {
        let opts = read_engine_options(r)?;
        let column = r.pop_u8()? != 0;
        let attr_count = r.pop_i32()?;
        let layout = if column {
            StorageLayout::Column { attr_count }
        } else {
            StorageLayout::Row
        };
        let path = String::from_utf8(r.pop(r.remaining())?.to_vec())
            .map_err(|_| IpcError::protocol("store path is not utf-8"))?;
        Ok(OpenArgs {
            opts,
            layout,
            path: path.into(),
        })
    }
}

impl Entity for OpenArgs {
    fn size(&self) -> u64 {
        use std::os::unix::ffi::OsStrExt;
        ENGINE_OPTIONS_SIZE + 1 + 4 + self.path.as_os_str().as_bytes().len() as u64
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        use std::os::unix::ffi::OsStrExt;
        write_engine_options(&self.opts, w);
        match self.layout {
            StorageLayout::Row => {
                w.push_u8(0);
                w.push_i32(0);
            }
            StorageLayout::Column { attr_count } => {
                w.push_u8(1);
                w.push_i32(attr_count);
            }
        }
        w.push(self.path.as_os_str().as_bytes());
    }
}

/// `Put` / `Load` arguments. The value length is implied by the entity
/// size, matching the header-is-exact invariant.
#[derive(Clone, Copy, Debug)]
pub struct PutArgs<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
}

impl PutArgs<'_> {
    pub fn decode<'b>(r: &mut EntityReader<'b>) -> Result<(&'b [u8], &'b [u8])> {
        let key_len = r.pop_u64()? as usize;
        let key = r.pop(key_len)?;
        let val = r.pop(r.remaining())?;
        Ok((key, val))
    }
}

impl Entity for PutArgs<'_> {
    fn size(&self) -> u64 {
        8 + self.key.len() as u64 + self.val.len() as u64
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        w.push_u64(self.key.len() as u64);
        w.push(self.key);
        w.push(self.val);
    }
}

/// Identifies one client-owned cursor on the worker: the requesting
/// process plus a client-allocated monotonically increasing id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CursorIdent {
    pub pid: u32,
    pub cursor_id: u64,
}

impl CursorIdent {
    pub fn decode(r: &mut EntityReader<'_>) -> Result<CursorIdent> {
        Ok(CursorIdent {
            pid: r.pop_u32()?,
            cursor_id: r.pop_u64()?,
        })
    }
}

impl Entity for CursorIdent {
    fn size(&self) -> u64 {
        12
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        w.push_u32(self.pid);
        w.push_u64(self.cursor_id);
    }
}

/// `RangeQuery` arguments. The options block travels only on the first
/// call for a cursor; later calls resume the worker-side session.
#[derive(Clone, Debug)]
pub struct RangeArgs {
    pub ident: CursorIdent,
    pub opts: Option<RangeOptions>,
}

impl RangeArgs {
    pub fn decode(r: &mut EntityReader<'_>) -> Result<RangeArgs> {
        let ident = CursorIdent::decode(r)?;
        if r.remaining() == 0 {
            return Ok(RangeArgs { ident, opts: None });
        }
        let start_len = r.pop_u64()? as usize;
        let start = r.pop(start_len)?.to_vec();
        let limit_len = r.pop_u64()? as usize;
        let limit = r.pop(limit_len)?.to_vec();
        let batch_capacity = r.pop_u64()?;
        let attr_count = r.pop_i32()?;
        if attr_count < 0 {
            return Err(IpcError::protocol(format!(
                "negative attribute count {}",
                attr_count
            )));
        }
        let mut attrs = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            attrs.push(r.pop_i32()?);
        }
        Ok(RangeArgs {
            ident,
            opts: Some(RangeOptions {
                start,
                limit,
                batch_capacity,
                attrs,
            }),
        })
    }
}

impl Entity for RangeArgs {
    fn size(&self) -> u64 {
        let mut size = self.ident.size();
        if let Some(opts) = &self.opts {
            size += 8 + opts.start.len() as u64;
            size += 8 + opts.limit.len() as u64;
            size += 8;
            size += 4 + 4 * opts.attrs.len() as u64;
        }
        size
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        self.ident.write(w);
        if let Some(opts) = &self.opts {
            w.push_u64(opts.start.len() as u64);
            w.push(&opts.start);
            w.push_u64(opts.limit.len() as u64);
            w.push(&opts.limit);
            w.push_u64(opts.batch_capacity);
            w.push_i32(opts.attrs.len() as i32);
            for attr in &opts.attrs {
                w.push_i32(*attr);
            }
        }
    }
}

/// Inline reply for `ReadBatch` and `RangeQuery`: whether more data
/// remains and how many bytes the bulk segment carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchState {
    pub next: bool,
    pub size: u64,
}

impl BatchState {
    pub fn decode(r: &mut EntityReader<'_>) -> Result<BatchState> {
        Ok(BatchState {
            next: r.pop_u8()? != 0,
            size: r.pop_u64()?,
        })
    }
}

impl Entity for BatchState {
    fn size(&self) -> u64 {
        9
    }

    fn write(&self, w: &mut EntityWriter<'_>) {
        w.push_u8(self.next as u8);
        w.push_u64(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<E: Entity>(entity: &E) -> Vec<u8> {
        let mut buf = vec![0u8; entity.size() as usize];
        let mut w = EntityWriter::new(&mut buf);
        entity.write(&mut w);
        assert_eq!(w.written() as u64, entity.size());
        buf
    }

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            op: Op::RangeQuery,
            db_id: 7,
            rel_id: 16394,
            status: Status::Success,
            rps_id: 3,
            ety_size: 12345,
        };
        let mut buf = [0u8; MSG_HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(Header::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn header_rejects_unknown_op() {
        let mut buf = [0u8; MSG_HEADER_SIZE];
        buf[0..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn op_codes_are_stable() {
        assert_eq!(Op::from_u32(0), Some(Op::Dummy));
        assert_eq!(Op::from_u32(7), Some(Op::Load));
        assert_eq!(Op::from_u32(13), Some(Op::Terminate));
        assert_eq!(Op::from_u32(14), None);
        for code in 0..14 {
            assert_eq!(Op::from_u32(code).unwrap() as u32, code);
        }
    }

    #[test]
    fn open_args_roundtrip() {
        for layout in [StorageLayout::Row, StorageLayout::Column { attr_count: 5 }] {
            let args = OpenArgs {
                opts: EngineOptions {
                    create_if_missing: true,
                    read_only: false,
                    cache_capacity: 1 << 20,
                },
                layout,
                path: "/data/t16394".into(),
            };
            let buf = roundtrip(&args);
            let decoded = OpenArgs::decode(&mut EntityReader::new(&buf)).unwrap();
            assert_eq!(decoded, args);
        }
    }

    #[test]
    fn put_args_roundtrip() {
        let args = PutArgs {
            key: b"alpha",
            val: b"beta",
        };
        let buf = roundtrip(&args);
        let (key, val) = PutArgs::decode(&mut EntityReader::new(&buf)).unwrap();
        assert_eq!(key, b"alpha");
        assert_eq!(val, b"beta");
    }

    #[test]
    fn put_args_allow_empty_value() {
        let args = PutArgs {
            key: b"k",
            val: b"",
        };
        let buf = roundtrip(&args);
        let (key, val) = PutArgs::decode(&mut EntityReader::new(&buf)).unwrap();
        assert_eq!(key, b"k");
        assert!(val.is_empty());
    }

    #[test]
    fn cursor_ident_roundtrip() {
        let ident = CursorIdent {
            pid: 4242,
            cursor_id: u64::MAX - 1,
        };
        let buf = roundtrip(&ident);
        assert_eq!(
            CursorIdent::decode(&mut EntityReader::new(&buf)).unwrap(),
            ident
        );
    }

    #[test]
    fn range_args_roundtrip_with_and_without_options() {
        let ident = CursorIdent {
            pid: 1,
            cursor_id: 2,
        };

        let bare = RangeArgs { ident, opts: None };
        let buf = roundtrip(&bare);
        let decoded = RangeArgs::decode(&mut EntityReader::new(&buf)).unwrap();
        assert!(decoded.opts.is_none());

        let full = RangeArgs {
            ident,
            opts: Some(RangeOptions {
                start: b"k1".to_vec(),
                limit: b"k5".to_vec(),
                batch_capacity: 4096,
                attrs: vec![1, 3, 5],
            }),
        };
        let buf = roundtrip(&full);
        let decoded = RangeArgs::decode(&mut EntityReader::new(&buf)).unwrap();
        assert_eq!(decoded.opts, full.opts);
        assert_eq!(decoded.ident, ident);
    }

    #[test]
    fn batch_state_roundtrip() {
        let state = BatchState {
            next: true,
            size: 81920,
        };
        let buf = roundtrip(&state);
        assert_eq!(
            BatchState::decode(&mut EntityReader::new(&buf)).unwrap(),
            state
        );
    }

    #[test]
    fn reader_reports_underrun() {
        let mut r = EntityReader::new(&[1, 2, 3]);
        assert!(r.pop_u64().is_err());
    }
}
