pub mod contracts;
pub mod crypto;
pub mod types;

pub use types::{PriceSample, ProcessedEvent, SubscriptionInfo};
