/*!
Sorted multihash index for CAR files

This is the CAR `MultihashIndexSorted` index (multicodec `0x0401`). Entries
are grouped by multihash code, then by digest width, and sorted by digest
within each group, so a lookup is a binary search:

```text
varint  0x0401
i32 LE  number of code buckets            (ascending by code)
  u64 LE  multihash code
  i32 LE  number of width groups          (ascending by width)
    u32 LE  width = digest length + 8
    u64 LE  byte length of the entries
    [digest ++ u64 LE section offset]...  (ascending by digest)
```

Writing is a session: [`MultihashIndexSortedWriter::create`] hands back an
[`IndexWriter`] to push [`BlockIndex`]es into and a lazy output stream of
encoded bytes. Nothing is emitted until the writer is closed, since the
sort needs every entry, but the output stream is what pulls entries off
the writer's channel, so the two sides have to be driven together.
*/

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use multihash::Multihash;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;

use crate::car::BlockIndex;
use crate::varint::{decode_varint, encode_varint};

/// Multicodec of the multihash-index-sorted format
pub const MULTIHASH_INDEX_SORTED_CODEC: u64 = 0x0401;

/// How many index entries can be in flight between writer and output
pub const DEFAULT_CAPACITY: usize = 256;

/// Bytes taken by the offset that follows every digest
const OFFSET_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The output side went away, so nothing can consume more entries
    #[error("index output was dropped before the writer was closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("index ended unexpectedly at byte {0}")]
    Truncated(usize),
    #[error("not a multihash-index-sorted index (codec {0:#x})")]
    WrongCodec(u64),
    #[error("bad varint in index: {0}")]
    Varint(#[from] std::io::Error),
    #[error("invalid width {width} for multihash code {code:#x}")]
    BadWidth { code: u64, width: u32 },
    #[error("width group of {len} bytes does not divide into width {width}")]
    RaggedGroup { width: u32, len: u64 },
    #[error("negative count {0} in index")]
    NegativeCount(i32),
    #[error("digest of {0} bytes does not fit a multihash")]
    DigestTooLarge(usize),
}

/// Entry point for writing an index
pub struct MultihashIndexSortedWriter;

impl MultihashIndexSortedWriter {
    /// Open a writer session with the default in-flight capacity
    pub fn create() -> (IndexWriter, impl Stream<Item = Bytes> + Send + 'static) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Open a writer session that lets at most `capacity` entries queue up
    /// before [`IndexWriter::put`] has to wait for the output side
    pub fn with_capacity(
        capacity: usize,
    ) -> (IndexWriter, impl Stream<Item = Bytes> + Send + 'static) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (IndexWriter { tx }, output(rx))
    }
}

/// The input side of an index session
///
/// Closing consumes the writer, so it can only ever happen once. Dropping
/// it closes too.
pub struct IndexWriter {
    tx: mpsc::Sender<Entry>,
}

impl IndexWriter {
    /// Add a block to the index
    ///
    /// Waits while the in-flight queue is full.
    pub async fn put(&self, block: &BlockIndex) -> Result<(), EncodeError> {
        let entry = Entry::from(block);
        self.tx.send(entry).await.map_err(|_| EncodeError::Closed)
    }

    /// Signal that no more blocks are coming, letting the output finish
    pub fn close(self) {
        log::trace!("index writer closed");
        drop(self.tx);
    }
}

#[derive(Debug)]
struct Entry {
    code: u64,
    digest: Vec<u8>,
    offset: u64,
}

impl From<&BlockIndex> for Entry {
    fn from(block: &BlockIndex) -> Self {
        let mh = block.multihash();
        Self {
            code: mh.code(),
            digest: mh.digest().to_vec(),
            offset: block.offset,
        }
    }
}

/// code -> width -> (digest, offset)
type Buckets = BTreeMap<u64, BTreeMap<u32, Vec<(Vec<u8>, u64)>>>;

enum OutputState {
    Collecting(mpsc::Receiver<Entry>),
    Emitting(VecDeque<Bytes>),
}

fn output(rx: mpsc::Receiver<Entry>) -> impl Stream<Item = Bytes> + Send + 'static {
    futures::stream::unfold(OutputState::Collecting(rx), |state| async move {
        let mut chunks = match state {
            OutputState::Collecting(mut rx) => {
                let mut buckets = Buckets::new();
                let mut n = 0usize;
                while let Some(entry) = rx.recv().await {
                    let width = (entry.digest.len() + OFFSET_LEN) as u32;
                    buckets
                        .entry(entry.code)
                        .or_default()
                        .entry(width)
                        .or_default()
                        .push((entry.digest, entry.offset));
                    n += 1;
                }
                log::debug!("encoding sorted index of {n} entries");
                encode(buckets)
            }
            OutputState::Emitting(chunks) => chunks,
        };
        let chunk = chunks.pop_front()?;
        Some((chunk, OutputState::Emitting(chunks)))
    })
}

/// Serialize the buckets, one chunk for the preamble and one per group
fn encode(buckets: Buckets) -> VecDeque<Bytes> {
    let mut chunks = VecDeque::new();

    let mut preamble = Vec::with_capacity(8);
    encode_varint(MULTIHASH_INDEX_SORTED_CODEC, &mut preamble);
    preamble.extend_from_slice(&(buckets.len() as i32).to_le_bytes());
    chunks.push_back(Bytes::from(preamble));

    for (code, widths) in buckets {
        let mut head = BytesMut::with_capacity(12);
        head.put_u64_le(code);
        head.put_i32_le(widths.len() as i32);
        chunks.push_back(head.freeze());

        for (width, mut entries) in widths {
            // stable: equal digests keep their arrival order
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let len = entries.len() * width as usize;
            let mut group = BytesMut::with_capacity(12 + len);
            group.put_u32_le(width);
            group.put_u64_le(len as u64);
            for (digest, offset) in entries {
                group.put_slice(&digest);
                group.put_u64_le(offset);
            }
            chunks.push_back(group.freeze());
        }
    }
    chunks
}

/// One decoded index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub code: u64,
    pub digest: Vec<u8>,
    /// offset of the block's CAR section
    pub offset: u64,
}

/// A decoded multihash-index-sorted index
///
/// Entries are kept in file order, which is sorted by (code, digest width,
/// digest).
#[derive(Debug, Clone, Default)]
pub struct MultihashIndexSorted {
    entries: Vec<IndexEntry>,
}

impl MultihashIndexSorted {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut pos = 0;
        let codec = decode_varint(bytes, &mut pos)?;
        if codec != MULTIHASH_INDEX_SORTED_CODEC {
            return Err(DecodeError::WrongCodec(codec));
        }

        let mut entries = Vec::new();
        let codes = count(take::<4>(bytes, &mut pos)?)?;
        for _ in 0..codes {
            let code = u64::from_le_bytes(take::<8>(bytes, &mut pos)?);
            let widths = count(take::<4>(bytes, &mut pos)?)?;
            for _ in 0..widths {
                let width = u32::from_le_bytes(take::<4>(bytes, &mut pos)?);
                let len = u64::from_le_bytes(take::<8>(bytes, &mut pos)?);
                if (width as usize) <= OFFSET_LEN {
                    return Err(DecodeError::BadWidth { code, width });
                }
                let digest_len = width as usize - OFFSET_LEN;
                if digest_len > 64 {
                    return Err(DecodeError::DigestTooLarge(digest_len));
                }
                if len % width as u64 != 0 {
                    return Err(DecodeError::RaggedGroup { width, len });
                }
                let group_end = pos
                    .checked_add(len as usize)
                    .filter(|end| *end <= bytes.len())
                    .ok_or(DecodeError::Truncated(bytes.len()))?;
                for record in bytes[pos..group_end].chunks_exact(width as usize) {
                    let (digest, offset) = record.split_at(digest_len);
                    let mut buf = [0u8; OFFSET_LEN];
                    buf.copy_from_slice(offset);
                    entries.push(IndexEntry {
                        code,
                        digest: digest.to_vec(),
                        offset: u64::from_le_bytes(buf),
                    });
                }
                pos = group_end;
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Section offset of the block with this multihash, if indexed
    pub fn find(&self, mh: &Multihash<64>) -> Option<u64> {
        let key = (mh.code(), mh.digest().len(), mh.digest());
        self.entries
            .binary_search_by(|e| (e.code, e.digest.len(), e.digest.as_slice()).cmp(&key))
            .ok()
            .map(|i| self.entries[i].offset)
    }
}

fn take<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N], DecodeError> {
    let end = *pos + N;
    let slice = bytes.get(*pos..end).ok_or(DecodeError::Truncated(*pos))?;
    let mut buf = [0u8; N];
    buf.copy_from_slice(slice);
    *pos = end;
    Ok(buf)
}

fn count(raw: [u8; 4]) -> Result<usize, DecodeError> {
    let n = i32::from_le_bytes(raw);
    usize::try_from(n).map_err(|_| DecodeError::NegativeCount(n))
}
