pub mod channels;
pub mod hub;

pub use channels::{Channel, RiskStreamUpdate, VenueEvent};
pub use hub::{StreamHub, StreamMessage, Subscription};
