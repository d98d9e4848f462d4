// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IPC Notifications
//!
//! Kernel-generated notification messages. Every notification consumes
//! the send-once right it is delivered through. The port layer only ever
//! calls a [`Notifier`] with no port lock held.

use crate::kernel::ipc::rights::{ReceiveRight, SendOnceRight};
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::Ipc;
use crate::rustux::types::*;

use crate::log_trace_if;

const LOCAL_TRACE: bool = false;

/// Notification sink
pub trait Notifier: Send + Sync {
    /// A name the requester held died
    fn dead_name(&self, notify: SendOnceRight, name: PortName);

    /// The last send right of a port went away
    fn no_senders(&self, notify: SendOnceRight, mscount: MakeSendCount);

    /// A port with a backup lost its receiver; the receive right moves to
    /// the backup's owner
    fn port_destroyed(&self, notify: SendOnceRight, right: ReceiveRight);

    /// A send to `name` would no longer block
    fn send_possible(&self, notify: SendOnceRight, name: PortName);
}

impl Ipc {
    pub(crate) fn notify_dead_name(&self, notify: SendOnceRight, name: PortName) {
        log_trace_if!(LOCAL_TRACE, "notify: dead-name {:#x}", name);
        IpcStats::bump(&self.stats.dead_names_sent);
        self.notifier.dead_name(notify, name);
    }

    pub(crate) fn notify_no_senders(&self, notify: SendOnceRight, mscount: MakeSendCount) {
        log_trace_if!(LOCAL_TRACE, "notify: no-senders mscount {}", mscount);
        IpcStats::bump(&self.stats.no_senders_sent);
        self.notifier.no_senders(notify, mscount);
    }

    pub(crate) fn notify_port_destroyed(&self, notify: SendOnceRight, right: ReceiveRight) {
        log_trace_if!(LOCAL_TRACE, "notify: port-destroyed port {}", right.port().id());
        IpcStats::bump(&self.stats.port_destroyed_sent);
        self.notifier.port_destroyed(notify, right);
    }

    pub(crate) fn notify_send_possible(&self, notify: SendOnceRight, name: PortName) {
        log_trace_if!(LOCAL_TRACE, "notify: send-possible {:#x}", name);
        IpcStats::bump(&self.stats.send_possible_sent);
        self.notifier.send_possible(notify, name);
    }
}
