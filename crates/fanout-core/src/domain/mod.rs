//! Domain model (ids, status, tasks, operations, comparison payloads).

pub mod comparison;
pub mod ids;
pub mod operation;
pub mod provider;
pub mod status;
pub mod task;

pub use comparison::{CallerToken, ComparisonReport, ComparisonRequest, StudentPayload};
pub use ids::{OperationId, TaskId};
pub use operation::{Operation, OperationSummary, OperationType, TaskCounts};
pub use provider::{ProviderConfig, ProviderId, ProviderResponse};
pub use status::Status;
pub use task::AsyncTask;
