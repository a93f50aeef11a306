pub mod context;
pub mod dag;
pub mod events;
pub mod executor;
pub mod router;
pub mod types;

pub use context::ExecutionContext;
pub use dag::NodeDag;
pub use events::{EventBroadcaster, EventType, ExecutionEvent};
pub use executor::WorkflowExecutor;
pub use router::PhaseRouter;
pub use types::{
    ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, NodeSpec, ResponseInfo,
    UrlQueueItem, Workflow, WorkflowPhase,
};
