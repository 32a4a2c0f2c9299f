pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{BridgeSection, BuddyConfig, ImportSection, ImportSettings};
pub use error::{BuddyError, Result};
pub use events::{BridgeEvent, EventBus};
pub use types::*;
