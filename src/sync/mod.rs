pub mod completion;
pub mod engine;
pub mod event;
pub mod tag;

pub use completion::{
    CompletionStamp, FlushStamp, FlushStampTracker, TASK_COUNT_NOT_READY, TASK_COUNT_NOT_RESIDENT,
    TASK_COUNT_NOT_USED, TaskCount,
};
pub use engine::{ContextId, ContextRegistry, EngineContext, EngineKind};
pub use event::{
    CallbackTarget, Event, EventCallback, PendingCommand, WaitStatus, aggregated_task_level,
    wait_for_events,
};
pub use tag::{CompletionTag, PollOutcome, TagWriter};
