//! Serial link plumbing: framing, reconnect backoff, and supervision.

pub mod backoff;
pub mod framing;
pub mod supervisor;

pub use backoff::BackoffPolicy;
pub use framing::LineFramer;
pub use supervisor::{
    IdentifyOptions, LinkOptions, LinkPhase, NativeOpener, PortOpener, SerialSupervisor,
};
