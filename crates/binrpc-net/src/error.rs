//! Reactor-layer errors

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("readiness multiplexer creation failed: {0}")]
    PollerCreate(#[source] io::Error),

    #[error("wakeup eventfd creation failed: {0}")]
    WakeupCreate(#[source] io::Error),

    #[error("timerfd creation failed: {0}")]
    TimerFdCreate(#[source] io::Error),

    #[error("registration of fd {fd} failed: {source}")]
    Register { fd: i32, source: io::Error },

    #[error("deregistration of fd {fd} failed: {source}")]
    Deregister { fd: i32, source: io::Error },

    #[error("io thread spawn failed: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("io thread exited before publishing its loop handle")]
    ThreadStart,
}
