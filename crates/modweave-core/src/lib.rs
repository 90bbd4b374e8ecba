pub mod client;
pub mod config;
pub mod discovery;
pub mod hash;
pub mod inbox;
pub mod lock;
pub mod logging;
pub mod model;
pub mod query;
pub mod router;
pub mod store;

pub use client::Client;
pub use config::{ContentRoot, Settings};
pub use discovery::{discover, DiscoveryError, DiscoveryReport, ScanMode};
pub use hash::ContentHash;
pub use inbox::{Inbox, InboxError, InboxRequest, Request};
pub use lock::{LockError, WriterLock};
pub use model::{FileRecord, Fingerprint, ItemStatus, Priority, QueueItem};
pub use query::{LoadOrderQuery, QueryError};
pub use router::{Envelope, Router, RoutingConfig, RoutingError, Step};
pub use store::{EnqueueOutcome, Recorded, Store, StoreError, StoreWriter};
