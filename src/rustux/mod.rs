// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux common types

pub mod types;

// Re-export common types
pub use types::*;
pub use types::err::*;
