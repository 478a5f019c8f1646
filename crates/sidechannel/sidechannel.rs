//! Side channels to in-guest agents.
//!
//! Every running VM on a node gets one monitor child process; each child
//! opens the VM's side-channel Unix sockets, speaks the framed packet
//! protocol to the agent inside the guest, and executes dequeued agent
//! operations. The parent daemon reconciles children against what the
//! hypervisor says is actually running.

pub mod agent;
pub mod hypervisor;
pub mod monitor;
pub mod protocol;
pub mod supervisor;

use thiserror::Error;

use sunfish_eventlog::EventError;
use sunfish_objects::ObjectError;
use sunfish_store::error::StoreError;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The agent went silent; the channel was torn down and the reconciler
    /// will build a fresh one.
    #[error("connection idle")]
    Idle,

    #[error("channel closed by peer")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad packet: {0}")]
    BadPacket(String),

    #[error("put failed: {0}")]
    Put(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Event(#[from] EventError),
}

impl ChannelError {
    /// Errors recovered locally by dropping the channel, as opposed to ones
    /// that should surface.
    pub fn drops_channel(&self) -> bool {
        matches!(
            self,
            ChannelError::Idle
                | ChannelError::Closed
                | ChannelError::Io(_)
                | ChannelError::BadPacket(_)
        )
    }
}
