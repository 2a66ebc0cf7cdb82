//! # Polling File Transport
//!
//! This crate turns files reachable through a virtual file system into
//! messages for a processing engine. Each configured entry is polled on an
//! interval; eligible files are claimed, built into messages, dispatched, and
//! then moved or deleted according to the entry's policy.
//!
//! ## Features
//!
//! - **Retrying Resolution**: Unreachable locations are retried a bounded number of times
//! - **Advisory Locking**: Claims keep cooperating consumers off the same file
//! - **Pluggable Builders**: Media types map to message builders through a lookup table
//! - **Move or Delete**: Processed files are disposed of per outcome, optionally timestamped
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Polling File Transport                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  PollScheduler ──► Scanner ──► LockCoordinator                  │
//! │                       │                                         │
//! │                       ├──► BuilderSelector ──► MessageBuilder   │
//! │                       │                                         │
//! │                       ├──► MessageEngine                        │
//! │                       │                                         │
//! │                       └──► PostProcessor                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod builder;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod outcome;
pub mod post;
pub mod scanner;
pub mod scheduler;

pub use builder::{
    BinaryBuilder, BuilderSelector, ContentType, ManagedSource, Message, MessageBody,
    MessageBuilder, MessageSource, PlainTextBuilder, XmlBuilder,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{Action, EntryConfig, PollEntry, PollState, TransportConfig};
pub use dispatch::{ChannelEngine, DispatchRequest, MessageEngine, ReplyTo, TransportHeaders};
pub use error::{BuildError, EngineError, PollError, Result};
pub use lock::LockCoordinator;
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use outcome::{BatchOutcome, Outcome};
pub use post::{Disposal, PostProcessor};
pub use scanner::Scanner;
pub use scheduler::{EntryStatus, PollScheduler};
