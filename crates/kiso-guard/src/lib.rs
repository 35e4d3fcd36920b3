pub mod denylist;
pub mod fence;
pub mod sanitize;

pub use denylist::check_command;
pub use fence::{fence, unfence};
pub use sanitize::{sanitize, REDACTED};
