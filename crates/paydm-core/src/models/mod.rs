pub mod dm;

pub use dm::{DmEvent, PendingRequest};
