// lib.rs
//
// Compact store for categorical allele profiles (cgMLST style): encoding,
// an on-disk matrix with an index, a directory lock, and a blocked
// near-neighbor scan.

pub mod config;
pub mod distance;
pub mod encoding;
pub mod error;
pub mod index;
pub mod lock;
pub mod matrix;
pub mod ops;
pub mod source;
pub mod store;

pub use config::{CompareOptions, LockOptions};
pub use distance::{compare, compare_to_vec, profile_distance, MatchRecord, ProfileDistance};
pub use encoding::{build_mappings, decode_row, encode_row, EncodedRow, LocusMapping, MISSING_CODE};
pub use error::{ProfileStoreError, Result};
pub use index::StoreIndex;
pub use lock::{release_lock, StoreLock};
pub use matrix::{ElementWidth, ProfileBlockAccessor};
pub use source::{collect_inputs, InMemorySource, ProfileSource, RawProfile, TsvProfileSource};
pub use store::{ProfileStore, StagedAppend};
