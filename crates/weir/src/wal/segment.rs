//! Segment file layout: a fixed 32-byte header followed by a stream of
//! CRC32C-checked frames, one NormalizedRecord per frame. Sealed segments
//! end with a zero-length sentinel frame for fast tail detection; a missing
//! sentinel simply means the segment was active when the process stopped.

use crate::validate::NormalizedRecord;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

pub const MAGIC: u32 = 0x4C47_5354;
pub const VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 32;
pub const FRAME_OVERHEAD: u64 = 8;
/// CRC of the zero-length sentinel frame appended at rotation.
pub const SEAL_SENTINEL_CRC: u32 = 0xFFFF_FFFF;
/// No legitimate frame can exceed this: the admission path caps whole
/// batches at 1 MiB. Larger lengths are corruption, not big records.
pub const MAX_FRAME_LEN: u32 = 16 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub token_hash: u64,
    pub created_unix_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("segment header is truncated")]
    Truncated,
    #[error("bad segment magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported segment version {0}")]
    BadVersion(u32),
    #[error("segment token hash {found:#018x} does not match expected {expect:#018x}")]
    TokenMismatch { expect: u64, found: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
}

pub fn encode_header(header: Header) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&VERSION.to_be_bytes());
    buf[8..16].copy_from_slice(&header.token_hash.to_be_bytes());
    buf[16..24].copy_from_slice(&header.created_unix_ms.to_be_bytes());
    // buf[24..32] is reserved and zero.
    buf
}

pub fn decode_header(buf: &[u8]) -> Result<Header, HeaderError> {
    if buf.len() < HEADER_LEN as usize {
        return Err(HeaderError::Truncated);
    }
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(HeaderError::BadMagic(magic));
    }
    let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(HeaderError::BadVersion(version));
    }
    Ok(Header {
        token_hash: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        created_unix_ms: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
    })
}

/// Append one `len | crc32c | payload` frame to `buf`.
pub fn append_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(payload).to_be_bytes());
    buf.extend_from_slice(payload);
}

pub fn seal_frame() -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[4..8].copy_from_slice(&SEAL_SENTINEL_CRC.to_be_bytes());
    buf
}

/// Streaming reader over a segment's frames. Replay stops cleanly at the
/// sealed sentinel, at a torn tail (truncated frame), or at the first
/// corrupt frame; `saw_corruption` distinguishes the last case.
pub struct SegmentReader {
    reader: BufReader<tokio::fs::File>,
    pub header: Header,
    offset: u64,
    done: bool,
    corrupt: bool,
}

impl SegmentReader {
    /// Open a segment and validate its header. `expect_token_hash` guards
    /// against a segment file placed in the wrong tenant directory.
    pub async fn open(path: &Path, expect_token_hash: Option<u64>) -> Result<Self, OpenError> {
        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| HeaderError::Truncated)?;
        let header = decode_header(&buf)?;
        if let Some(expect) = expect_token_hash {
            if header.token_hash != expect {
                return Err(HeaderError::TokenMismatch {
                    expect,
                    found: header.token_hash,
                }
                .into());
            }
        }

        Ok(Self {
            reader,
            header,
            offset: HEADER_LEN,
            done: false,
            corrupt: false,
        })
    }

    /// Resume reading from a frame boundary previously returned by `next`.
    pub async fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        self.reader.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        Ok(())
    }

    /// Byte offset of the next unread frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether replay stopped because of a corrupt frame, as opposed to a
    /// clean end or a torn tail.
    pub fn saw_corruption(&self) -> bool {
        self.corrupt
    }

    /// Yield the next record and the offset just past its frame.
    pub async fn next(&mut self) -> Option<(NormalizedRecord, u64)> {
        if self.done {
            return None;
        }

        let mut head = [0u8; FRAME_OVERHEAD as usize];
        match read_fully(&mut self.reader, &mut head).await {
            ReadFully::Done => (),
            // Clean EOF at a frame boundary: an unsealed (active-at-crash)
            // segment simply ends here.
            ReadFully::Eof | ReadFully::Short => {
                self.done = true;
                return None;
            }
        }
        let len = u32::from_be_bytes(head[0..4].try_into().unwrap());
        let crc = u32::from_be_bytes(head[4..8].try_into().unwrap());

        if len == 0 && crc == SEAL_SENTINEL_CRC {
            self.done = true;
            return None;
        }
        if len == 0 || len > MAX_FRAME_LEN {
            self.done = true;
            self.corrupt = true;
            return None;
        }

        let mut payload = vec![0u8; len as usize];
        match read_fully(&mut self.reader, &mut payload).await {
            ReadFully::Done => (),
            // The length prefix promised more bytes than the file holds:
            // a torn tail, discarded without counting corruption.
            ReadFully::Eof | ReadFully::Short => {
                self.done = true;
                return None;
            }
        }

        if crc32c::crc32c(&payload) != crc {
            self.done = true;
            self.corrupt = true;
            return None;
        }
        let record: NormalizedRecord = match serde_json::from_slice(&payload) {
            Ok(record) => record,
            Err(_) => {
                self.done = true;
                self.corrupt = true;
                return None;
            }
        };

        self.offset += FRAME_OVERHEAD + len as u64;
        Some((record, self.offset))
    }
}

enum ReadFully {
    Done,
    Eof,
    Short,
}

async fn read_fully(
    reader: &mut BufReader<tokio::fs::File>,
    buf: &mut [u8],
) -> ReadFully {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return ReadFully::Eof,
            Ok(0) => return ReadFully::Short,
            Ok(n) => filled += n,
            Err(_) => return ReadFully::Short,
        }
    }
    ReadFully::Done
}
