//! Streaming CAR block indexer
//!
//! Walks a CAR byte stream section by section and reports where every block
//! lives: the section's absolute offset and length, and the block payload's
//! offset and length. Block payloads are skipped rather than buffered, so
//! memory stays flat no matter how big the CAR (or its blocks) get.
//!
//! Both CARv1 and CARv2 inputs are accepted. For CARv2 the indexer seeks
//! forward to the inner CARv1 payload, and offsets stay relative to the
//! start of the *whole* stream.

use futures::Stream;
use ipld_core::cid::Cid;
use multihash::Multihash;
use serde::Deserialize;
use std::convert::Infallible;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::varint::{encode_varint, read_varint};

/// Headers bigger than this are not going to be real CAR headers
pub const MAX_HEADER_LEN: u64 = 32 * 1024 * 1024;

/// Length of the CARv2 fixed header that follows the pragma
const V2_HEADER_LEN: usize = 40;

/// sha2-256 multihash code, the only hash a CIDv0 can carry
const SHA2_256: u64 = 0x12;

/// Largest digest a `Multihash<64>` can hold
const MAX_DIGEST_LEN: u64 = 64;

/// Errors that can happen while reading CAR framing
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error while reading CAR: {0}")]
    Io(#[from] io::Error),
    #[error("CAR ended unexpectedly inside the section at offset {offset}")]
    Truncated { offset: u64 },
    #[error("CAR header is {0} bytes, which is more than allowed")]
    HeaderTooLarge(u64),
    #[error("CAR stream is empty")]
    MissingHeader,
    #[error("Failed to decode CAR header: {0}")]
    BadHeader(#[from] serde_ipld_dagcbor::DecodeError<Infallible>),
    #[error("CARv1 header has no roots")]
    MissingRoots,
    #[error("Unsupported CAR version {0}")]
    UnsupportedVersion(u64),
    #[error("Invalid CARv2 header: {0}")]
    BadV2Header(String),
    #[error("Invalid CAR section (zero length) at offset {offset}")]
    ZeroLengthSection { offset: u64 },
    #[error("CAR section at offset {offset} is shorter than its CID")]
    SectionTooShort { offset: u64 },
    #[error("Invalid CID in section at offset {offset}: {source}")]
    BadCid {
        offset: u64,
        source: ipld_core::cid::Error,
    },
    #[error("Multihash digest of {size} bytes in section at offset {offset} is too large")]
    DigestTooLarge { offset: u64, size: u64 },
}

#[derive(Debug, Deserialize)]
struct Header {
    version: u64,
    #[serde(default)]
    roots: Option<Vec<Cid>>,
}

/// Where a single block lives inside a CAR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    pub cid: Cid,
    /// absolute offset of the section (its length varint) in the input
    pub offset: u64,
    /// whole section length: varint + CID + block
    pub length: u64,
    /// absolute offset of the block payload
    pub block_offset: u64,
    pub block_length: u64,
}

impl BlockIndex {
    /// The block's content hash
    pub fn multihash(&self) -> &Multihash<64> {
        self.cid.hash()
    }
}

/// Incremental CAR indexer over an async byte stream
pub struct CarIndexer<R> {
    reader: BufReader<R>,
    version: u64,
    roots: Vec<Cid>,
    /// bytes consumed from the start of the input
    position: u64,
    /// for CARv2, where the inner payload ends
    data_end: Option<u64>,
}

impl<R: AsyncRead + Unpin> CarIndexer<R> {
    /// Read the CAR header(s) and position the indexer at the first section
    pub async fn init(reader: R) -> Result<Self, IndexError> {
        let mut me = Self {
            reader: BufReader::new(reader),
            version: 1,
            roots: Vec::new(),
            position: 0,
            data_end: None,
        };

        let header = me.read_header().await?;
        match header.version {
            1 => {
                me.roots = header.roots.ok_or(IndexError::MissingRoots)?;
            }
            2 => {
                me.version = 2;
                me.enter_v2_payload().await?;
            }
            v => return Err(IndexError::UnsupportedVersion(v)),
        }

        log::debug!(
            "car v{} with {} root(s), first section at {}",
            me.version,
            me.roots.len(),
            me.position
        );
        Ok(me)
    }

    /// CAR format version of the input (1 or 2)
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Index the next block, or `None` once the payload is exhausted
    pub async fn next_block(&mut self) -> Result<Option<BlockIndex>, IndexError> {
        if let Some(end) = self.data_end {
            if self.position >= end {
                log::trace!("reached end of carv2 payload at {end}");
                return Ok(None);
            }
        }

        let offset = self.position;
        let Some((section_len, varint_len)) = read_varint(&mut self.reader)
            .await
            .map_err(|e| eof_to_truncated(e, offset))?
        else {
            if self.data_end.is_some() {
                // the v2 header promised more payload than we got
                return Err(IndexError::Truncated { offset });
            }
            return Ok(None);
        };
        if section_len == 0 {
            return Err(IndexError::ZeroLengthSection { offset });
        }
        self.position += varint_len as u64;

        let (cid, cid_len) = self.read_cid(offset).await?;
        let block_length = section_len
            .checked_sub(cid_len)
            .ok_or(IndexError::SectionTooShort { offset })?;
        let block_offset = self.position;

        self.skip(block_length, offset).await?;

        Ok(Some(BlockIndex {
            cid,
            offset,
            length: varint_len as u64 + section_len,
            block_offset,
            block_length,
        }))
    }

    /// Convert to a futures::stream of block indexes
    pub fn stream(self) -> impl Stream<Item = Result<BlockIndex, IndexError>> {
        futures::stream::try_unfold(self, |mut this| async move {
            let maybe_block = this.next_block().await?;
            Ok(maybe_block.map(|b| (b, this)))
        })
    }

    async fn read_header(&mut self) -> Result<Header, IndexError> {
        let Some((len, varint_len)) = read_varint(&mut self.reader)
            .await
            .map_err(|e| eof_to_truncated(e, self.position))?
        else {
            return Err(IndexError::MissingHeader);
        };
        if len > MAX_HEADER_LEN {
            return Err(IndexError::HeaderTooLarge(len));
        }
        let mut buf = vec![0; len as usize];
        self.reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| eof_to_truncated(e, self.position))?;
        self.position += varint_len as u64 + len;
        Ok(serde_ipld_dagcbor::from_slice(&buf)?)
    }

    /// Consume the CARv2 fixed header, skip to the data payload and read
    /// the inner CARv1 header
    async fn enter_v2_payload(&mut self) -> Result<(), IndexError> {
        let mut fixed = [0u8; V2_HEADER_LEN];
        self.reader
            .read_exact(&mut fixed)
            .await
            .map_err(|e| eof_to_truncated(e, self.position))?;
        self.position += V2_HEADER_LEN as u64;

        // 16 bytes of characteristics come first; nothing here needs them
        let data_offset = le_u64(&fixed[16..24]);
        let data_size = le_u64(&fixed[24..32]);

        if data_offset < self.position {
            return Err(IndexError::BadV2Header(format!(
                "data offset {data_offset} points inside the header"
            )));
        }
        let data_end = data_offset.checked_add(data_size).ok_or_else(|| {
            IndexError::BadV2Header(format!("data size {data_size} overflows"))
        })?;

        let offset = self.position;
        self.skip(data_offset - self.position, offset).await?;

        let inner = self.read_header().await?;
        if inner.version != 1 {
            return Err(IndexError::BadV2Header(format!(
                "inner payload is CAR version {}",
                inner.version
            )));
        }
        self.roots = inner.roots.ok_or(IndexError::MissingRoots)?;
        self.data_end = Some(data_end);
        Ok(())
    }

    /// Read a CID off the stream, returning it with its encoded length
    async fn read_cid(&mut self, offset: u64) -> Result<(Cid, u64), IndexError> {
        let mut raw = Vec::with_capacity(40);
        let mut len = 0;

        let first = self.expect_varint(offset, &mut len).await?;
        let size = if first == SHA2_256 {
            // CIDv0 is a bare sha2-256 multihash
            let size = self.expect_varint(offset, &mut len).await?;
            encode_varint(first, &mut raw);
            encode_varint(size, &mut raw);
            size
        } else {
            let codec = self.expect_varint(offset, &mut len).await?;
            let code = self.expect_varint(offset, &mut len).await?;
            let size = self.expect_varint(offset, &mut len).await?;
            for v in [first, codec, code, size] {
                encode_varint(v, &mut raw);
            }
            size
        };
        if size > MAX_DIGEST_LEN {
            return Err(IndexError::DigestTooLarge { offset, size });
        }

        let start = raw.len();
        raw.resize(start + size as usize, 0);
        self.reader
            .read_exact(&mut raw[start..])
            .await
            .map_err(|e| eof_to_truncated(e, offset))?;
        len += size;
        self.position += len;

        let cid = Cid::try_from(raw.as_slice())
            .map_err(|source| IndexError::BadCid { offset, source })?;
        Ok((cid, len))
    }

    async fn expect_varint(&mut self, offset: u64, len: &mut u64) -> Result<u64, IndexError> {
        let (value, n) = read_varint(&mut self.reader)
            .await
            .map_err(|e| eof_to_truncated(e, offset))?
            .ok_or(IndexError::Truncated { offset })?;
        *len += n as u64;
        Ok(value)
    }

    /// Discard `n` bytes without buffering them
    async fn skip(&mut self, n: u64, offset: u64) -> Result<(), IndexError> {
        let copied = tokio::io::copy(&mut (&mut self.reader).take(n), &mut tokio::io::sink()).await?;
        self.position += copied;
        if copied < n {
            return Err(IndexError::Truncated { offset });
        }
        Ok(())
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn eof_to_truncated(e: io::Error, offset: u64) -> IndexError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        IndexError::Truncated { offset }
    } else {
        IndexError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_input_has_no_header() {
        let res = CarIndexer::init(&[][..]).await;
        assert!(matches!(res, Err(IndexError::MissingHeader)));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        // claims a 10 byte header, delivers 2
        let res = CarIndexer::init(&[0x0a, 0xa2, 0x65][..]).await;
        assert!(matches!(res, Err(IndexError::Truncated { offset: 0 })));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected_before_reading() {
        let mut bytes = Vec::new();
        encode_varint(MAX_HEADER_LEN + 1, &mut bytes);
        let res = CarIndexer::init(bytes.as_slice()).await;
        assert!(matches!(res, Err(IndexError::HeaderTooLarge(_))));
    }

    #[tokio::test]
    async fn test_garbage_header() {
        let res = CarIndexer::init(&[0x03, 0xff, 0xff, 0xff][..]).await;
        assert!(matches!(res, Err(IndexError::BadHeader(_))));
    }

    #[test]
    fn test_le_u64() {
        assert_eq!(le_u64(&[0x33, 0, 0, 0, 0, 0, 0, 0]), 51);
        assert_eq!(le_u64(&[0, 1, 0, 0, 0, 0, 0, 0]), 256);
    }
}
