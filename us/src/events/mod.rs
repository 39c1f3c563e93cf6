//! Event Bus for job lifecycle notifications
//!
//! Every transition the scheduler makes emits a typed [`JobEvent`] to each
//! subscriber's own unbounded queue, so every subscriber sees every event
//! emitted after it subscribed. Consumers (CLI output, the JSONL logger, user code
//! forwarding to a push transport) subscribe to the bus.
//!
//! ```text
//!   submit / dispatch / finish / cancel / progress
//!                      │
//!                      ▼
//!   ┌──────────────────────────────────────────┐
//!   │                EVENT BUS                 │
//!   │   (one unbounded mpsc per subscriber)    │
//!   └──────────────────────────────────────────┘
//!          │                │               │
//!          ▼                ▼               ▼
//!     CLI printer     EventLogger      user listeners
//!                      (.jsonl)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut rx = scheduler.events().subscribe();
//! while let Some(event) = rx.recv().await {
//!     println!("{} {} {}", event.job_id, event.event_type(), event.status);
//! }
//! ```
//!
//! Ordering holds per job; events of different jobs may interleave freely.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use logger::{EventLogger, read_events, spawn_event_logger};
pub use types::{EventKind, JobEvent};
