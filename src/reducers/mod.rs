//! Reducers: consumers that turn the record stream into durable output.
//!
//! Both reducers follow the same split: the subscription read path only
//! appends under a short mutex, and a periodic task swaps the state out and
//! does the slow part (sink I/O, statistics) outside the lock.

pub mod summary;
pub mod timeseries;

pub use summary::{SummaryBoard, SummaryReducer, WindowAccumulator};
pub use timeseries::{
    decompose, FlushOutcome, RetryPolicy, TimeSeriesReducer, TimeSeriesSnapshot, TimeSeriesStats,
};
