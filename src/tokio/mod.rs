//! Async variants on top of tokio
pub mod discovery;
pub mod protocol;
