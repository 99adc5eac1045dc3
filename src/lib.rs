pub mod core;
pub mod features;
pub mod scraping;
pub mod tools;

// --- Primary core exports ---
pub use core::error::{HarvestError, HarvestResult};
pub use core::types;
pub use core::types::*;
pub use core::AppState;

pub use features::retention;
pub use scraping::{browser_manager, enumerate, harvest, sanitize};
pub use tools::{batch_harvest, export, extract, reconcile};
