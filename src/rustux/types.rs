// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common type aliases used throughout the IPC layer

/// Error code type (negative values indicate errors)
pub type Status = i32;

/// Result type for kernel operations
pub type Result<T = ()> = core::result::Result<T, Status>;

/// Name of a right inside a capability space (0 is never a valid name)
pub type PortName = u32;

/// Null port name
pub const PORT_NAME_NULL: PortName = 0;

/// Capability space identifier
pub type SpaceId = u64;

/// Kernel port identifier
pub type PortId = u64;

/// Port set identifier
pub type PsetId = u64;

/// Thread ID type
pub type ThreadId = u64;

/// Scheduling priority (0 means "no push")
pub type Priority = u8;

/// Event filter registration identifier
pub type KnoteId = u64;

/// Make-send count carried by no-senders notifications
pub type MakeSendCount = u64;

/// Message sequence number
pub type SeqNo = u64;

/// Common status codes
pub mod status {
    use super::Status;

    pub const OK: Status = 0;
    pub const ERR_INVALID_ARGS: Status = -2;
    pub const ERR_BAD_STATE: Status = -4;
    pub const ERR_NO_MEMORY: Status = -6;
    pub const ERR_NOT_FOUND: Status = -8;
    pub const ERR_ALREADY_EXISTS: Status = -9;
    pub const ERR_INTERNAL: Status = -12;
}

/// Common error values
pub mod err {
    use super::Status;

    pub const RX_OK: Status = super::status::OK;
    pub const RX_ERR_INVALID_ARGS: Status = super::status::ERR_INVALID_ARGS;
    pub const RX_ERR_BAD_STATE: Status = super::status::ERR_BAD_STATE;
    pub const RX_ERR_NO_MEMORY: Status = super::status::ERR_NO_MEMORY;
    pub const RX_ERR_NOT_FOUND: Status = super::status::ERR_NOT_FOUND;
    pub const RX_ERR_ALREADY_EXISTS: Status = super::status::ERR_ALREADY_EXISTS;
    pub const RX_ERR_INTERNAL: Status = super::status::ERR_INTERNAL;
    pub const RX_ERR_SHOULD_WAIT: Status = -18;
    pub const RX_ERR_WRONG_TYPE: Status = -19;

    /// Fixed-size table cannot take another entry
    pub const RX_ERR_NO_SPACE: Status = -23;

    /// Object was destroyed underneath the caller
    pub const RX_ERR_TERMINATED: Status = -24;

    /// Nobody was waiting to be notified (informational)
    pub const RX_ERR_NOT_WAITING: Status = -25;

    /// Port is not a member of the port set
    pub const RX_ERR_NOT_IN_SET: Status = -26;
}

/// Get a printable name for a status code
pub const fn status_name(status: Status) -> &'static str {
    use err::*;

    match status {
        RX_OK => "RX_OK",
        RX_ERR_INVALID_ARGS => "RX_ERR_INVALID_ARGS",
        RX_ERR_BAD_STATE => "RX_ERR_BAD_STATE",
        RX_ERR_NO_MEMORY => "RX_ERR_NO_MEMORY",
        RX_ERR_NOT_FOUND => "RX_ERR_NOT_FOUND",
        RX_ERR_ALREADY_EXISTS => "RX_ERR_ALREADY_EXISTS",
        RX_ERR_INTERNAL => "RX_ERR_INTERNAL",
        RX_ERR_SHOULD_WAIT => "RX_ERR_SHOULD_WAIT",
        RX_ERR_WRONG_TYPE => "RX_ERR_WRONG_TYPE",
        RX_ERR_NO_SPACE => "RX_ERR_NO_SPACE",
        RX_ERR_TERMINATED => "RX_ERR_TERMINATED",
        RX_ERR_NOT_WAITING => "RX_ERR_NOT_WAITING",
        RX_ERR_NOT_IN_SET => "RX_ERR_NOT_IN_SET",
        _ => "RX_ERR_UNKNOWN",
    }
}
