//! sprync-core: core sync engine
//!
//! Manifests, diffs, the archive codec, path safety, exclude patterns,
//! and the driver↔agent wire protocol. Everything here is pure with
//! respect to the network; only the filesystem is touched.

pub mod archive;
pub mod diff;
pub mod exclude;
pub mod hash;
pub mod manifest;
pub mod paths;
pub mod protocol;

pub use diff::{compute_diff, DiffResult};
pub use exclude::ExcludeMatcher;
pub use hash::ContentHash;
pub use manifest::{to_manifest, walk_local, Manifest, ManifestEntry};
pub use protocol::{Request, Response, MAX_LINE};
