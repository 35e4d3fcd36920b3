pub mod context;
pub mod error;
pub mod exec;
pub mod msg;
pub mod output;
pub mod pubfiles;
pub mod search;
pub mod skill;

pub use context::{PlanOutputRecord, TaskContext, TaskResult};
pub use error::TaskError;
