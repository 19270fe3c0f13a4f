//! phasecast: three-phase power metrology fan-out
//!
//! One publisher streams per-cycle three-phase measurements to any number
//! of independent subscribers over a brokerless TCP fan-out.
//!
//! ## Architecture
//!
//! - **Publisher**: replays a recorded dataset (paced, looping) or relays a
//!   live feed into the fan-out endpoint
//! - **Subscriber runtime**: handshake, reconnection and decoding on the
//!   consumer side
//! - **Time-series reducer**: batches rows into an append-only sink
//! - **Summary reducer**: tumbling-window means per device
//! - **Lifecycle**: supervision, shutdown and readiness probing

pub mod acquisition;
pub mod api;
pub mod backoff;
pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod publisher;
pub mod reducers;
pub mod storage;
pub mod subscriber;
pub mod transport;
pub mod types;
pub mod wire;

// Re-export configuration
pub use config::PhasecastConfig;

// Re-export commonly used types
pub use types::{CycleRecord, PhaseLabel, PhaseReading, RowLayout, SummaryStat, TimeSeriesRow};

// Re-export the component entry points
pub use publisher::{Publisher, PublisherOptions, PublisherStatus};
pub use reducers::{SummaryBoard, SummaryReducer, TimeSeriesReducer};
pub use subscriber::{run_subscription, RecordReducer, Subscription, SubscriptionOptions};
pub use wire::Endpoint;
