pub mod consolidate;
pub mod keeper;

pub use consolidate::apply_consolidation_gates;
pub use keeper::{KnowledgeError, KnowledgeKeeper};
