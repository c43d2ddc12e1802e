//! Client-side helpers, used by the cli binary and the integration tests.

pub mod client;

pub use client::Client;
