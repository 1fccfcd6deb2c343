mod failure;
mod finding;
mod result;
mod status;
pub mod timestamp;

pub use failure::FailureReport;
pub use finding::Findings;
pub use result::{CanonicalResult, END_MARKER, RecordIdentity, truncate_bytes};
pub use status::Status;
pub use timestamp::TimeFormat;
