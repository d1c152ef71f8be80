//! Event aggregation and emission.

pub mod aggregator;
pub mod blocks;
pub mod manager;
pub mod stream;
pub mod types;

pub use manager::EventManager;
pub use stream::{EventStream, EventSubscription};
pub use types::{ReadEvent, StreamEvent, WriteEvent};
