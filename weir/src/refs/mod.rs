//! Reference `Source`/`Sink`/`Processor` implementations.
//!
//! None of these are part of the engine's required feature set (see §6 of
//! the design notes): concrete broker/store drivers are explicitly out of
//! scope. They exist so the crate is runnable end to end without a live
//! broker or store, and so the engine's own integration tests have
//! something concrete to drive.
pub mod channel;
pub mod file;
pub mod processors;
