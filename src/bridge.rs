//! Pump block indexes into the index writer while draining its output
//!
//! The producer (CAR blocks -> writer) and the drainer (writer output ->
//! bytes) run as two futures joined on the same task. They only meet at the
//! writer's bounded channel: the producer parks when it's full, the drainer
//! parks when it's empty. Neither side needs the other to finish first, so
//! nothing of unbounded size has to be buffered between them.
//!
//! The producer never lets an error escape while the drainer is still
//! running. It always closes the writer (so the output terminates) and hands
//! back its result, which is only looked at once the output is fully
//! drained.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;

use crate::car::{BlockIndex, CarIndexer, IndexError};
use crate::mhindex::{EncodeError, IndexWriter, MultihashIndexSortedWriter};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to index CAR: {0}")]
    Index(#[from] IndexError),
    #[error("Failed to write index: {0}")]
    Encode(#[from] EncodeError),
}

/// A fully assembled index
#[derive(Debug, Clone)]
pub struct Bridged {
    /// how many blocks went into the index
    pub blocks: usize,
    pub index: Bytes,
}

/// Build the sorted multihash index for a CAR byte stream
pub async fn index_car<R: AsyncRead + Unpin>(reader: R) -> Result<Bridged, BridgeError> {
    let (writer, output) = MultihashIndexSortedWriter::create();
    // header parsing happens inside the stream, so it fails on the producer side too
    let records = futures::stream::once(CarIndexer::init(reader))
        .map_ok(CarIndexer::stream)
        .try_flatten();
    bridge(records, writer, output).await
}

/// Feed `records` into `writer` while collecting `output`
///
/// Records reach the writer in exactly the order `records` yields them. If
/// the record stream fails, whatever the writer flushed is still drained,
/// but the result is the producer's error.
pub async fn bridge<S, O>(records: S, writer: IndexWriter, output: O) -> Result<Bridged, BridgeError>
where
    S: Stream<Item = Result<BlockIndex, IndexError>>,
    O: Stream<Item = Bytes>,
{
    let produce = async move {
        let result = pump(records, &writer).await;
        // on every exit path, exactly once
        writer.close();
        result
    };

    let drain = output.fold(BytesMut::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        acc
    });

    let (produced, index) = tokio::join!(produce, drain);
    let blocks = produced.inspect_err(|e| {
        log::debug!("producer failed, discarding {} drained bytes: {e}", index.len());
    })?;

    Ok(Bridged {
        blocks,
        index: index.freeze(),
    })
}

async fn pump<S>(records: S, writer: &IndexWriter) -> Result<usize, BridgeError>
where
    S: Stream<Item = Result<BlockIndex, IndexError>>,
{
    let mut records = std::pin::pin!(records);
    let mut n = 0;
    while let Some(block) = records.try_next().await? {
        log::trace!("block {} at {}", block.cid, block.offset);
        writer.put(&block).await?;
        n += 1;
    }
    Ok(n)
}
