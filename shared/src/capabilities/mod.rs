//! Host-facing seams: local persistence, the remote API and connectivity.
//!
//! Shells supply concrete implementations; the engine and fetcher only see
//! the traits.

pub mod connectivity;
pub mod http;
pub mod kv;

pub use self::connectivity::Connectivity;
pub use self::http::{HttpError, OverlayApi, PreferenceApi, ValidatedUrl};
pub use self::kv::{FileKv, KeyNamespace, KvError, KvKey, LocalPersistence, MemoryKv, StorageErrorCode};

#[cfg(feature = "rest")]
pub use self::http::RestClient;

