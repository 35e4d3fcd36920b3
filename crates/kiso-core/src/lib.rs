pub mod audit;
pub mod config;
pub mod error;
pub mod secrets;
pub mod skills;
pub mod types;

pub use config::{ConfigHandle, KisoConfig};
pub use error::{KisoError, Result};
pub use secrets::DeploySecrets;
pub use skills::SkillManifest;
