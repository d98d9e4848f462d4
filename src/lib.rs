// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux IPC Object Model
//!
//! Ports, port sets and the priority-inheritance linkage that ties them
//! to turnstiles. The crate is linked into the kernel image; the message
//! transport, the capability space, the notifier and the event filter are
//! collaborators reached through the interfaces in [`kernel::ipc`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Common types
pub mod rustux;

// Kernel modules
pub mod kernel;

pub use kernel::ipc::{
    Circularity, Ipc, IpcConfig, Notifier, EventFilter, Port, PortSet, ReceiveRight, Rejected,
    SendOnceRight, SendRight, Space,
};
pub use rustux::types::{Result, Status};
