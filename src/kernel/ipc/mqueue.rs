// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Port Message Queues
//!
//! The bookkeeping side of a port's message queue: queued messages, the
//! queue limit that makes senders block, the receive sequence number and
//! the validity bit that blocked threads check after waking. Copying
//! message bodies and blocking threads belong to the transport.
//!
//! A message queue is always protected by its port's lock.

use crate::kernel::ipc::port::Port;
use crate::kernel::ipc::{Ipc, Rejected};
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::log_trace_if;

const LOCAL_TRACE: bool = false;

/// Queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message bytes
    pub data: Vec<u8>,
}

impl Message {
    /// Create a new message
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Get message data size
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Message queue state
#[derive(Debug)]
pub struct MessageQueue {
    /// Pending messages (FIFO)
    messages: VecDeque<Message>,

    /// Senders block once this many messages are queued
    qlimit: usize,

    /// Sequence number of the next message received
    seqno: SeqNo,

    /// Cleared when the owning port dies
    valid: bool,

    /// Broadcast wake generation
    wakeups: u64,
}

impl MessageQueue {
    /// Initialize an empty queue
    pub fn init(qlimit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            qlimit,
            seqno: 0,
            valid: true,
            wakeups: 0,
        }
    }

    /// Queue a message
    ///
    /// Hands the message back when the queue is full or invalid.
    pub fn enqueue(&mut self, msg: Message) -> core::result::Result<(), Message> {
        if !self.valid || self.is_full() {
            return Err(msg);
        }
        self.messages.push_back(msg);
        Ok(())
    }

    /// Take the oldest message
    pub fn dequeue(&mut self) -> Option<Message> {
        let msg = self.messages.pop_front()?;
        self.seqno += 1;
        Some(msg)
    }

    /// Check whether a sender would block
    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.qlimit
    }

    /// Get the number of queued messages
    pub fn msgcount(&self) -> usize {
        self.messages.len()
    }

    /// Get the queue limit
    pub fn qlimit(&self) -> usize {
        self.qlimit
    }

    /// Set the queue limit
    pub fn set_qlimit(&mut self, qlimit: usize) {
        self.qlimit = qlimit;
    }

    /// Get the receive sequence number
    pub fn seqno(&self) -> SeqNo {
        self.seqno
    }

    /// Reset the receive sequence number
    pub fn reset_seqno(&mut self) {
        self.seqno = 0;
    }

    /// Check whether the queue still belongs to a live port
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Get the broadcast wake generation
    pub fn wakeups(&self) -> u64 {
        self.wakeups
    }

    /// Wake every thread waiting on the queue so it re-checks its state
    pub fn changed(&mut self) {
        self.wakeups += 1;
    }

    /// Invalidate the queue and wake all waiters
    ///
    /// Returns true if queued messages must be reaped by the caller.
    pub fn mark_invalid(&mut self) -> bool {
        self.valid = false;
        self.changed();
        !self.messages.is_empty()
    }

    /// Release the queue storage, handing back anything still queued
    pub fn destroy(&mut self) -> VecDeque<Message> {
        core::mem::take(&mut self.messages)
    }
}

impl Ipc {
    /// Queue a message on a port
    ///
    /// Sets the port belongs to are woken. The message comes back with
    /// `RX_ERR_SHOULD_WAIT` when the queue is full.
    pub fn port_enqueue(&self, port: &Arc<Port>, msg: Message) -> core::result::Result<(), Rejected<Message>> {
        let sets = {
            let mut guard = port.lock();
            if !guard.is_active() {
                return Err(Rejected::new(RX_ERR_TERMINATED, msg));
            }
            if let Err(msg) = guard.mqueue.enqueue(msg) {
                return Err(Rejected::new(RX_ERR_SHOULD_WAIT, msg));
            }
            guard.mqueue.changed();
            guard.psets.clone()
        };

        for pset in &sets {
            pset.wake();
        }
        Ok(())
    }

    /// Take the oldest message off a port
    ///
    /// Draining a full queue delivers armed send-possible notifications.
    pub fn port_dequeue(&self, port: &Arc<Port>) -> Option<Message> {
        let (msg, drained) = {
            let mut guard = port.lock();
            let was_full = guard.mqueue.is_full();
            let msg = guard.mqueue.dequeue();
            let drained = msg.is_some() && was_full && guard.sprequests;
            (msg, drained)
        };

        if drained {
            let _ = self.send_possible_notify(port);
        }
        msg
    }

    /// Change a port's queue limit
    pub fn port_set_qlimit(&self, port: &Arc<Port>, qlimit: usize) -> Result {
        if qlimit == 0 || qlimit > self.config.qlimit_max {
            return Err(RX_ERR_INVALID_ARGS);
        }

        let drained = {
            let mut guard = port.lock();
            if !guard.is_active() {
                return Err(RX_ERR_TERMINATED);
            }
            let was_full = guard.mqueue.is_full();
            guard.mqueue.set_qlimit(qlimit);
            guard.mqueue.changed();
            was_full && !guard.mqueue.is_full() && guard.sprequests
        };

        log_trace_if!(LOCAL_TRACE, "port {}: qlimit {}", port.id(), qlimit);
        if drained {
            let _ = self.send_possible_notify(port);
        }
        Ok(())
    }

    /// Park a preallocated message buffer on a port
    pub fn port_preallocate_message(
        &self,
        port: &Arc<Port>,
        msg: Message,
    ) -> core::result::Result<(), Rejected<Message>> {
        let mut guard = port.lock();
        if !guard.is_active() {
            return Err(Rejected::new(RX_ERR_TERMINATED, msg));
        }
        if guard.premsg.is_some() {
            return Err(Rejected::new(RX_ERR_ALREADY_EXISTS, msg));
        }
        guard.premsg = Some(msg);
        Ok(())
    }

    /// Take back a port's preallocated message buffer
    pub fn port_take_preallocated(&self, port: &Arc<Port>) -> Option<Message> {
        port.lock().premsg.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ipc::testing::*;
    use alloc::vec;

    #[test]
    fn test_mqueue_limit_and_seqno() {
        let mut mq = MessageQueue::init(2);
        assert!(mq.enqueue(Message::new(vec![1])).is_ok());
        assert!(mq.enqueue(Message::new(vec![2])).is_ok());
        assert!(mq.is_full());
        let back = mq.enqueue(Message::new(vec![3])).unwrap_err();
        assert_eq!(back.data, vec![3]);

        assert_eq!(mq.dequeue().unwrap().data, vec![1]);
        assert_eq!(mq.seqno(), 1);
        assert!(!mq.is_full());
    }

    #[test]
    fn test_mqueue_invalidate() {
        let mut mq = MessageQueue::init(4);
        assert!(!mq.mark_invalid());
        assert_eq!(mq.wakeups(), 1);
        assert!(mq.enqueue(Message::new(vec![0])).is_err());

        let mut mq = MessageQueue::init(4);
        mq.enqueue(Message::new(vec![9])).unwrap();
        assert!(mq.mark_invalid());
        assert_eq!(mq.destroy().len(), 1);
        assert_eq!(mq.msgcount(), 0);
    }

    #[test]
    fn test_port_enqueue_full_hands_back() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let port = alloc_port(&ipc, &space);
        ipc.port_set_qlimit(&port, 1).unwrap();

        ipc.port_enqueue(&port, Message::new(vec![1])).unwrap();
        let err = ipc.port_enqueue(&port, Message::new(vec![2])).unwrap_err();
        assert_eq!(err.status, RX_ERR_SHOULD_WAIT);
        assert_eq!(err.returned.data, vec![2]);

        assert_eq!(ipc.port_dequeue(&port).map(|m| m.data), Some(vec![1]));
        assert_eq!(port.info().seqno, 1);
        assert!(ipc.port_dequeue(&port).is_none());
    }

    #[test]
    fn test_port_set_qlimit_bounds() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let port = alloc_port(&ipc, &space);

        assert_eq!(ipc.port_set_qlimit(&port, 0), Err(RX_ERR_INVALID_ARGS));
        assert_eq!(
            ipc.port_set_qlimit(&port, ipc.config().qlimit_max + 1),
            Err(RX_ERR_INVALID_ARGS)
        );
        assert_eq!(ipc.port_set_qlimit(&port, 3), Ok(()));
        assert_eq!(port.info().qlimit, 3);
    }

    #[test]
    fn test_raising_qlimit_delivers_send_possible() {
        let (ipc, notes) = new_ipc();
        let space = TestSpace::new(1);
        let port = alloc_port(&ipc, &space);
        let notify = alloc_port(&ipc, &space);
        ipc.port_set_qlimit(&port, 1).unwrap();
        ipc.port_enqueue(&port, Message::new(vec![1])).unwrap();

        let index = ipc
            .request_register(
                &port,
                0x70,
                notify.make_sonce(),
                crate::kernel::ipc::request::RequestFlags::SEND_POSSIBLE,
            )
            .unwrap();
        assert_eq!(ipc.request_sparm(&port, 0x70, index, false), Ok(true));
        assert!(notes.is_empty());

        ipc.port_set_qlimit(&port, 2).unwrap();
        assert_eq!(notes.take().len(), 1);
    }

    #[test]
    fn test_preallocated_message() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let port = alloc_port(&ipc, &space);

        ipc.port_preallocate_message(&port, Message::new(vec![0; 8])).unwrap();
        let err = ipc
            .port_preallocate_message(&port, Message::new(vec![1]))
            .unwrap_err();
        assert_eq!(err.status, RX_ERR_ALREADY_EXISTS);
        assert_eq!(ipc.port_take_preallocated(&port).map(|m| m.size()), Some(8));
        assert!(ipc.port_take_preallocated(&port).is_none());
    }
}
