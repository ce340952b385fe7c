//! Chain synchronization: historical backfill and live tailing.

mod historical;
mod live;

pub use historical::HistoricalFetcher;
pub use live::{LiveFollower, LiveUpdate};
