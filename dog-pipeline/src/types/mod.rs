pub mod events;
pub mod ids;
pub mod payload;
pub mod record;

pub use events::{EventKind, NewEvent, Phase, StreamEvent};
pub use ids::{Fingerprint, JobId, LeaseToken};
pub use payload::{BatchApiCall, DocumentGeneration, FactLearning, JobPayload, RejectionAnalysis};
pub use record::{JobHandle, JobOutcome, JobRecord, JobStatus, JobStatusView, LeasedJob};
