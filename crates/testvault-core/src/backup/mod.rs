//! Backup generations: archiving, retention and selective restore.
//!
//! A generation is one immutable `tar.gz` artifact holding a manifest, a
//! snapshot of the store and the blob tree. Artifacts are written under a
//! `.partial` name and renamed into place, so listings never show an
//! incomplete generation.

pub mod archiver;
pub mod error;
pub mod generation;
pub mod leases;
pub mod restore;
pub mod retention;

pub use archiver::{read_manifest, BackupArchiver, Manifest, FORMAT_VERSION, MANIFEST_NAME};
pub use error::BackupError;
pub use generation::{
    format_size, generation_name, list_generations, parse_generation_name, BackupGeneration,
};
pub use leases::{GenerationLease, GenerationLeases};
pub use restore::{
    BlobFailure, CandidateRecord, RecordRef, RejectedRecord, RestoreCoordinator, RestoreResult,
    RestoreSource, StagedUpload,
};
pub use retention::{PruneReport, RetentionPruner};
