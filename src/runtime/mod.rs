//! Runtime system
//!
//! Jobs, async tasks and their fragments, continuation frames, status
//! records and cancellation, and the executors that run them.

pub mod context;
pub mod current;
pub mod executor;
pub mod group;
pub mod heap;
pub mod job;
pub mod status;
pub mod task;

pub use context::{
    AsyncContext, AsyncContextFlags, AsyncContextKind, ContextFrame, ContextRef,
    FutureAsyncContext, FutureClosureAsyncContext, YieldingAsyncContext,
};
pub use executor::{
    global_executor, set_global_executor, Executor, ExecutorError, ExecutorRef, ManualExecutor,
    WorkerPool,
};
pub use group::{TaskGroup, TaskGroupQueue};
pub use heap::{HeapMetadata, HeapObject};
pub use job::{Job, JobFlags, JobKind, JobPriority, JobRef, TaskContinuationFunction};
pub use status::{ActiveTaskStatus, AtomicTaskStatus, TaskStatusRecord, TaskStatusRecordKind};
pub use task::{
    AsyncTask, FutureStatus, ResultType, SpawnError, TaskBuilder, TaskLocalInheritance, TaskRef,
};
