pub mod dispatcher;
pub mod hooks;
pub mod job;
pub mod lifecycle;
pub mod registry;
pub mod router;

pub use dispatcher::Dispatcher;
pub use hooks::{BroadcastHooks, JobEvent, JobHooks, Statistics, TracingHooks};
pub use job::{Job, JobStatus, JobType, Step, Topic};
pub use lifecycle::LifecycleController;
pub use registry::{JobRegistry, SharedRegistry};
pub use router::{Placement, TopicRouter};
