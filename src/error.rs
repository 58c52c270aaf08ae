// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Broker-level error type. Syscall-level code below this layer stays on
// `io::Result`; everything that crosses a component boundary is folded
// into `BrokerError`.

use std::io;

use thiserror::Error;

/// Errors surfaced by the broker control plane.
///
/// The scheduler never synthesises errors of its own; workers report theirs
/// through `RESULT{status: ERROR}` and keep running, and the client surfaces
/// whatever it received unchanged.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The requested region has a zero-length axis. Raised client-side
    /// before any I/O.
    #[error("requested region is empty")]
    EmptyShape,

    /// Creating the named shared buffer failed.
    #[error("shared buffer creation failed: {0}")]
    ShmCreate(#[source] io::Error),

    /// Attaching an existing shared buffer by name failed.
    #[error("shared buffer attach failed: {0}")]
    ShmAttach(#[source] io::Error),

    /// No matching `RESULT` arrived within the client's window.
    #[error("timed out waiting for result")]
    Timeout,

    /// The worker reported a failure; the message is forwarded verbatim.
    #[error("worker error: {0}")]
    Worker(String),

    /// Socket-level failure. Fatal to the affected endpoint.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A wire record failed to decode.
    #[error("wire decode error: {0}")]
    Wire(#[from] prost::DecodeError),

    /// A decoded record violates the protocol (bad arity, unknown tag,
    /// inconsistent sizes).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying volume store failed to produce the region.
    #[error("volume read failed: {0}")]
    Volume(String),
}
