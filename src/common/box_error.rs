//! error type shared by every thread in the crate.
//!
//! The Send + Sync bounds let a thread body hand its error back through a JoinHandle.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // so ? works on anything
        + std::marker::Send
        + std::marker::Sync,
>;
