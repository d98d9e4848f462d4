// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Event Filter Interface
//!
//! Ports and port sets can be monitored by an event-filter registration
//! (a knote). A thread waiting on the registration's queue is represented
//! by a turnstile the filter owns; blocked senders push on it.

use crate::kernel::ipc::port::Port;
use crate::kernel::ipc::turnstile::Turnstile;
use crate::rustux::types::*;
use alloc::sync::Arc;

/// Event filter collaborator
pub trait EventFilter: Send + Sync {
    /// Turnstile that stands in for whoever services `knote`
    fn kqueue_turnstile_of(&self, knote: KnoteId) -> Option<Arc<Turnstile>>;

    /// Stash a special reply port on `knote`
    ///
    /// Returns the stashed turnstile, or None when the registration has
    /// nothing stashed and the knote's own turnstile should be used.
    fn stash(&self, knote: KnoteId, srp: &Arc<Port>) -> Option<Arc<Turnstile>>;
}

/// Filter for kernels built without event-filter support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEventFilter;

impl EventFilter for NoEventFilter {
    fn kqueue_turnstile_of(&self, _knote: KnoteId) -> Option<Arc<Turnstile>> {
        None
    }

    fn stash(&self, _knote: KnoteId, _srp: &Arc<Port>) -> Option<Arc<Turnstile>> {
        None
    }
}
