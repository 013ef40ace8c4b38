//! Buffered page-view and browser analytics.
//!
//! Requests are reduced to dimension tuples and either counted in a shared
//! buffer ([`queue::writer::QueueWriter`]) or merged straight into per-day
//! aggregate rows ([`recorder::EventRecorder`]). A periodic
//! [`queue::flush::FlushCoordinator`] drains the buffer into the
//! [`store::AggregateStore`].

pub mod agent;
pub mod clock;
pub mod config;
pub mod event;
pub mod export;
pub mod policy;
pub mod queue;
pub mod recorder;
pub mod report;
pub mod store;
