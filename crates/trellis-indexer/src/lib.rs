//! Source extraction and incremental graph updates

pub mod coordinator;
pub mod extractor;
pub mod languages;
pub mod rename;
pub mod scan;
pub mod secrets;


pub use coordinator::{ChangeKind, FailedPath, FileChange, PathStatus, UpdateCoordinator, UpdateError, UpdateReport};
pub use extractor::{ExtractionError, ExtractionResult, Extractor, RawEdge, RawNode};
pub use languages::ExtractorRegistry;
pub use rename::{LineSimilarity, RenameDetector, SimilarityScorer};
pub use scan::{PathFilter, index_directory};
pub use secrets::{MaskedSource, SecretMasker};
