pub mod supervisor;
pub mod webhook;
pub mod worker;

pub use supervisor::{CancelOutcome, EnqueueOutcome, Supervisor};
pub use webhook::WebhookDeliverer;
pub use worker::WorkerDeps;
