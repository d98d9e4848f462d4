// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Microkernel - IPC Kernel Modules
//!
//! This module contains the kernel side of the IPC object model.

// Re-export commonly used types
pub use crate::rustux::types::*;

pub mod cmdline;
pub mod debug;
pub mod ipc;
