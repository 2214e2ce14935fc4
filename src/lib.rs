//! Sorted multihash indexes for CAR files landing in object storage
//!
//! Notifications come in as an [`Envelope`], get flattened into
//! [`StorageCreatedEvent`]s, and each CAR is streamed through
//! [`bridge::index_car`] and written back next to itself as `<key>.idx`.
//!
//! ```no_run
//! # use car_idx::{Envelope, Handler, MemoryStore, RetryConfig};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! store.insert("b", "root.car", std::fs::read("root.car")?);
//!
//! let envelope = Envelope::from_slice(&std::fs::read("event.json")?)?;
//! let handler = Handler::new(store.clone(), RetryConfig::default());
//! for indexed in handler.handle(&envelope).await? {
//!     println!("{} -> {}", indexed.key, indexed.index_key);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod car;
pub mod event;
pub mod handler;
pub mod mhindex;
pub mod retry;
pub mod s3;
pub mod store;
pub mod varint;

pub use bridge::{Bridged, index_car};
pub use car::{BlockIndex, CarIndexer};
pub use event::{Envelope, StorageCreatedEvent};
pub use handler::{Handler, HandlerError, IndexedObject, index_key};
pub use mhindex::{MultihashIndexSorted, MultihashIndexSortedWriter};
pub use retry::RetryConfig;
pub use s3::{S3Config, S3StoreFactory};
pub use store::{FsStore, MemoryStore, ObjectStore, StoreFactory};
