pub mod controller;
pub mod extractor;
pub mod fetcher;
pub mod finalizer;
pub mod fingerprint;
pub mod pool;
pub mod response;
pub mod task;
pub mod validator;

// Re-export the submission surface
pub use controller::ScrapeController;
pub use finalizer::CallerStatus;
pub use response::{ErrorResponse, SubmissionResponse, SubmitError};
pub use task::TargetOutcome;
pub use validator::{ScrapeRequest, ValidationError, ValidationIssue};
