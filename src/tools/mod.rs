pub mod batch_harvest;
pub mod export;
pub mod extract;
pub mod pacing;
pub mod reconcile;
