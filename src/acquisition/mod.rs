//! Record acquisition
//!
//! Everything that produces `CycleRecord`s for the publisher: the recorded
//! dataset loader, the looping replay source and the live feed sources.

pub mod dataset;
pub mod live;
pub mod replay;
pub mod source;

pub use dataset::{Dataset, DatasetError, DatasetOptions};
pub use live::{LiveFeedClient, LiveFeedError, LiveTcpSource, StdinSource};
pub use replay::{Pacer, ReplayCursor, ReplaySource};
pub use source::{RecordEvent, RecordSource};
