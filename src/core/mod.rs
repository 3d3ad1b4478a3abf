pub mod copy;
pub mod hasher;
pub mod manifest;
pub mod models;
pub mod offload;
pub mod orchestrator;
pub mod progress;
pub mod scan;
pub mod verifier;

pub use hasher::{ContentHasher, hash_file, hash_file_async};
pub use manifest::{Manifest, ManifestEntry};
pub use models::{
    CopyFailure, DestinationReport, FileMismatch, MismatchReason, OffloadRequest, OffloadResult,
    OffloadState, Outcome, SkippedEntry, VerifyResult,
};
pub use offload::{OffloadOptions, generate_manifest, offload};
pub use orchestrator::Orchestrator;
pub use progress::{OffloadProgress, ProgressTracker};
pub use verifier::{VerifyOptions, verify, verify_with_manifest};
