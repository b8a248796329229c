pub mod completion;
pub mod definition;
pub mod error;
pub mod executor;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod types;

pub use completion::{CompletionEvent, CompletionHandler, StartOptions};
pub use definition::{StepInput, WorkflowArgs, WorkflowDefinition};
pub use error::WorkflowError;
pub use manager::{RecoveryReport, WorkflowManager};
pub use pool::{PoolConfig, WorkPools};
pub use retry::RetryPolicy;
