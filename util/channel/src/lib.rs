//! Reexports `crossbeam_channel` to uniform the dependency version.

pub use crossbeam_channel::{
    after, bounded, select, tick, unbounded, Receiver, RecvError, RecvTimeoutError, SendError,
    Sender, TryRecvError, TrySendError,
};

/// The capacity used for service shutdown signal channels.
pub const SIGNAL_CHANNEL_SIZE: usize = 1;

/// The capacity used for service request channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 32;
