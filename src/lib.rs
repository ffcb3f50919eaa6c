//! Offline-first support for the Field Smart Link farm app: response caching,
//! a replayable mutation queue and a persisted notification center.

pub mod app;
pub mod config;
pub mod interceptor;
pub mod logging;
pub mod notifications;
pub mod storage;
pub mod sync;
