pub mod budget;
pub mod error;
pub mod gateway;

pub use budget::CallBudget;
pub use error::LlmError;
pub use gateway::{ChatMessage, LlmGateway, LlmReply};
