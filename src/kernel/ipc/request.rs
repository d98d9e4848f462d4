// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Port Request Tables
//!
//! Dead-name and send-possible requests registered on a port. The table
//! is an array with an embedded free list: slot 0 is the header holding
//! the free-list head and the table's size class, every other slot is
//! either free (linked to the next free slot) or a live request.
//!
//! Request indices are handed out to the requester and stay valid across
//! growth: a grown table keeps every live entry at its old index.
//!
//! # Growth
//!
//! The bigger table is allocated with the port unlocked. After relocking,
//! the port's table is compared by identity and size class with the one
//! seen before unlocking; if another thread grew it in the meantime the
//! new table is thrown away and the caller simply retries its allocation.

use crate::kernel::ipc::port::Port;
use crate::kernel::ipc::rights::SendOnceRight;
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::{Ipc, Rejected};
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{log_debug, log_trace_if};

const LOCAL_TRACE: bool = false;

/// Index of a request inside its port's table (0 is never valid)
pub type RequestIndex = u32;

/// Null request index
pub const REQUEST_INDEX_NULL: RequestIndex = 0;

bitflags! {
    /// Request entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        /// Notify when the port dies
        const DEAD_NAME = 1 << 0;

        /// Entry may be armed for send-possible
        const SEND_POSSIBLE = 1 << 1;

        /// Send-possible is armed
        const SP_ARMED = 1 << 2;

        /// Armed send-possible waits for the next full → not-full transition
        const SP_DELAYED = 1 << 3;
    }
}

/// Next table ID counter
static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// A live request
#[derive(Debug)]
pub(crate) struct RequestEntry {
    pub(crate) name: PortName,

    /// None once a send-possible notification consumed it
    pub(crate) soright: Option<SendOnceRight>,

    pub(crate) flags: RequestFlags,
}

#[derive(Debug)]
enum RequestSlot {
    Header {
        free: RequestIndex,
        size_class: usize,
    },
    Free {
        next: RequestIndex,
    },
    Live(RequestEntry),
}

/// Request table
#[derive(Debug)]
pub(crate) struct RequestTable {
    /// Identity used to revalidate after an unlocked allocation
    id: u64,

    slots: Vec<RequestSlot>,
}

impl RequestTable {
    /// Allocate an uninitialized table for `usable` requests
    fn allocate(usable: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(usable + 1)
            .map_err(|_| RX_ERR_NO_MEMORY)?;
        Ok(Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            slots,
        })
    }

    /// Fill a freshly allocated table from `old`
    ///
    /// Live entries keep their indices. The new slots are chained onto the
    /// old free list.
    fn fill_from(&mut self, old: Option<Box<RequestTable>>, size_class: usize, usable: usize) {
        let mut free = REQUEST_INDEX_NULL;
        self.slots.push(RequestSlot::Header { free, size_class });

        if let Some(old) = old {
            let old = *old;
            free = old.free_head();
            self.slots.extend(old.slots.into_iter().skip(1));
        }

        for index in self.slots.len()..=usable {
            self.slots.push(RequestSlot::Free { next: free });
            free = index as RequestIndex;
        }
        self.set_free_head(free);
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn size_class(&self) -> usize {
        match self.slots.first() {
            Some(RequestSlot::Header { size_class, .. }) => *size_class,
            _ => 0,
        }
    }

    /// Number of slots requests can occupy
    pub(crate) fn usable(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    /// Physical length, header included
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, RequestSlot::Live(_)))
            .count()
    }

    fn free_head(&self) -> RequestIndex {
        match self.slots.first() {
            Some(RequestSlot::Header { free, .. }) => *free,
            _ => REQUEST_INDEX_NULL,
        }
    }

    fn set_free_head(&mut self, head: RequestIndex) {
        if let Some(RequestSlot::Header { free, .. }) = self.slots.first_mut() {
            *free = head;
        }
    }

    /// Pop a free slot for `entry`
    ///
    /// Hands the entry back when the table is full.
    pub(crate) fn alloc(&mut self, entry: RequestEntry) -> core::result::Result<RequestIndex, RequestEntry> {
        let index = self.free_head();
        if index == REQUEST_INDEX_NULL {
            return Err(entry);
        }
        let next = match self.slots.get(index as usize) {
            Some(RequestSlot::Free { next }) => *next,
            _ => return Err(entry),
        };
        self.slots[index as usize] = RequestSlot::Live(entry);
        self.set_free_head(next);
        Ok(index)
    }

    pub(crate) fn get(&self, index: RequestIndex) -> Option<&RequestEntry> {
        if index == REQUEST_INDEX_NULL {
            return None;
        }
        match self.slots.get(index as usize) {
            Some(RequestSlot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, index: RequestIndex) -> Option<&mut RequestEntry> {
        if index == REQUEST_INDEX_NULL {
            return None;
        }
        match self.slots.get_mut(index as usize) {
            Some(RequestSlot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Return a live slot to the free list
    pub(crate) fn free(&mut self, index: RequestIndex) -> Option<RequestEntry> {
        self.get(index)?;
        let next = self.free_head();
        let slot = core::mem::replace(&mut self.slots[index as usize], RequestSlot::Free { next });
        self.set_free_head(index);
        match slot {
            RequestSlot::Live(entry) => Some(entry),
            _ => None,
        }
    }

    /// Consume the table, yielding every live entry
    pub(crate) fn into_live_entries(self) -> impl Iterator<Item = RequestEntry> {
        self.slots.into_iter().filter_map(|slot| match slot {
            RequestSlot::Live(entry) => Some(entry),
            _ => None,
        })
    }
}

/// A grown table waiting to be installed
struct GrowPlan {
    /// Identity and size class of the table seen before unlocking
    seen: Option<(u64, usize)>,

    size_class: usize,
    usable: usize,
    table: RequestTable,
}

fn validate_request_flags(flags: RequestFlags) -> Result {
    let kinds = RequestFlags::DEAD_NAME | RequestFlags::SEND_POSSIBLE;
    if !kinds.contains(flags) || flags.is_empty() {
        return Err(RX_ERR_INVALID_ARGS);
    }
    Ok(())
}

impl Ipc {
    /// Register a request in a free slot
    ///
    /// Fails with `RX_ERR_NO_SPACE` when the port has no table or the table
    /// is full; the caller grows and retries. The right comes back on every
    /// failure.
    pub fn request_alloc(
        &self,
        port: &Arc<Port>,
        name: PortName,
        soright: SendOnceRight,
        flags: RequestFlags,
    ) -> core::result::Result<RequestIndex, Rejected<SendOnceRight>> {
        if name == PORT_NAME_NULL {
            return Err(Rejected::new(RX_ERR_INVALID_ARGS, soright));
        }
        if let Err(status) = validate_request_flags(flags) {
            return Err(Rejected::new(status, soright));
        }

        let mut guard = port.lock();
        if !guard.is_active() {
            return Err(Rejected::new(RX_ERR_TERMINATED, soright));
        }
        let table = match guard.requests.as_mut() {
            Some(table) => table,
            None => return Err(Rejected::new(RX_ERR_NO_SPACE, soright)),
        };

        let entry = RequestEntry {
            name,
            soright: Some(soright),
            flags,
        };
        match table.alloc(entry) {
            Ok(index) => {
                log_trace_if!(LOCAL_TRACE, "port {}: request {:#x} at {}", port.id(), name, index);
                Ok(index)
            }
            Err(entry) => match entry.soright {
                Some(soright) => Err(Rejected::new(RX_ERR_NO_SPACE, soright)),
                None => Err(Rejected::new(RX_ERR_NO_SPACE, SendOnceRight::dead())),
            },
        }
    }

    /// Replace the port's request table with the next size class
    ///
    /// Returns success without installing anything if another thread grew
    /// the table first.
    pub fn request_grow(&self, port: &Arc<Port>) -> Result {
        let plan = self.request_grow_prepare(port)?;
        self.request_grow_install(port, plan)
    }

    /// Allocate the next table with the port unlocked
    fn request_grow_prepare(&self, port: &Arc<Port>) -> Result<GrowPlan> {
        let (seen, size_class) = {
            let guard = port.lock();
            if !guard.is_active() {
                return Err(RX_ERR_TERMINATED);
            }
            match guard.requests.as_ref() {
                Some(table) => (Some((table.id(), table.size_class())), table.size_class() + 1),
                None => (None, 0),
            }
        };

        let usable = match self.config.request_size_class(size_class) {
            Some(usable) => usable,
            None => {
                log_debug!("port {}: request table at its size limit", port.id());
                return Err(RX_ERR_NO_SPACE);
            }
        };

        Ok(GrowPlan {
            seen,
            size_class,
            usable,
            table: RequestTable::allocate(usable)?,
        })
    }

    /// Install a prepared table unless the port's table changed meanwhile
    fn request_grow_install(&self, port: &Arc<Port>, plan: GrowPlan) -> Result {
        let GrowPlan {
            seen,
            size_class,
            usable,
            mut table,
        } = plan;

        let mut guard = port.lock();
        if !guard.is_active() {
            return Err(RX_ERR_TERMINATED);
        }
        let current = guard.requests.as_ref().map(|t| (t.id(), t.size_class()));
        if current != seen {
            drop(guard);
            IpcStats::bump(&self.stats.grow_races_lost);
            log_trace_if!(LOCAL_TRACE, "port {}: lost request grow race", port.id());
            return Ok(());
        }

        let old = guard.requests.take();
        table.fill_from(old, size_class, usable);
        guard.requests = Some(Box::new(table));
        drop(guard);

        IpcStats::bump(&self.stats.request_grows);
        log_trace_if!(LOCAL_TRACE, "port {}: request table grown to {}", port.id(), usable);
        Ok(())
    }

    /// Register a request, growing the table as needed
    pub fn request_register(
        &self,
        port: &Arc<Port>,
        name: PortName,
        soright: SendOnceRight,
        flags: RequestFlags,
    ) -> core::result::Result<RequestIndex, Rejected<SendOnceRight>> {
        let mut soright = soright;
        loop {
            match self.request_alloc(port, name, soright, flags) {
                Ok(index) => return Ok(index),
                Err(rejected) if rejected.status == RX_ERR_NO_SPACE => {
                    if let Err(status) = self.request_grow(port) {
                        return Err(Rejected::new(status, rejected.returned));
                    }
                    soright = rejected.returned;
                }
                Err(rejected) => return Err(rejected),
            }
        }
    }

    /// Cancel a request
    ///
    /// Returns the registered right (None if it was already consumed, or
    /// the slot does not hold `name`) and frees the slot.
    pub fn request_cancel(
        &self,
        port: &Arc<Port>,
        name: PortName,
        index: RequestIndex,
    ) -> Option<SendOnceRight> {
        let mut guard = port.lock();
        let table = guard.requests.as_mut()?;
        match table.get(index) {
            Some(entry) if entry.name == name => {}
            _ => {
                log_debug!("port {}: cancel of stale request {:#x}/{}", port.id(), name, index);
                return None;
            }
        }
        table.free(index).and_then(|entry| entry.soright)
    }

    /// Get the flags of a request (empty if there is none)
    pub fn request_type(&self, port: &Arc<Port>, name: PortName, index: RequestIndex) -> RequestFlags {
        let guard = port.lock();
        guard
            .requests
            .as_ref()
            .and_then(|table| table.get(index))
            .filter(|entry| entry.name == name && entry.soright.is_some())
            .map_or(RequestFlags::empty(), |entry| entry.flags)
    }

    /// Arm a send-possible request
    ///
    /// Arming again replaces the previous arming's delayed flag. A
    /// non-delayed arm on a port whose queue is not full fires at once.
    /// Returns false if the entry cannot carry a send-possible
    /// notification.
    pub fn request_sparm(
        &self,
        port: &Arc<Port>,
        name: PortName,
        index: RequestIndex,
        delayed: bool,
    ) -> Result<bool> {
        let mut guard = port.lock();
        if !guard.is_active() {
            return Err(RX_ERR_TERMINATED);
        }
        let full = guard.mqueue.is_full();
        let fire = {
            let entry = match guard.requests.as_mut().and_then(|t| t.get_mut(index)) {
                Some(entry) if entry.name == name => entry,
                _ => return Ok(false),
            };
            if !entry.flags.contains(RequestFlags::SEND_POSSIBLE) || entry.soright.is_none() {
                return Ok(false);
            }

            if !delayed && !full {
                entry.flags.remove(RequestFlags::SP_ARMED | RequestFlags::SP_DELAYED);
                entry.soright.take()
            } else {
                entry.flags.insert(RequestFlags::SP_ARMED);
                entry.flags.set(RequestFlags::SP_DELAYED, delayed);
                None
            }
        };
        if fire.is_none() {
            guard.sprequests = true;
        }
        drop(guard);

        if let Some(soright) = fire {
            self.notify_send_possible(soright, name);
        }
        Ok(true)
    }

    /// Deliver every armed send-possible notification
    ///
    /// Each notification is sent with the port unlocked; the walk then
    /// relocks, revalidates and continues from the next index, never past
    /// the table length seen on entry. Returns the number delivered, or
    /// `RX_ERR_NOT_WAITING` if nothing was armed.
    pub fn send_possible_notify(&self, port: &Arc<Port>) -> Result<usize> {
        {
            let mut guard = port.lock();
            if !guard.is_active() || !guard.sprequests {
                return Err(RX_ERR_NOT_WAITING);
            }
            guard.sprequests = false;
        }

        let mut fired = 0;
        let mut index: usize = 0;
        let mut size: usize = 0;
        loop {
            let found = {
                let mut guard = port.lock();
                if !guard.is_active() {
                    break;
                }
                let table = match guard.requests.as_mut() {
                    Some(table) => table,
                    None => break,
                };
                if size == 0 {
                    size = table.len();
                }

                let mut found = None;
                while found.is_none() {
                    index += 1;
                    if index >= size {
                        break;
                    }
                    if let Some(entry) = table.get_mut(index as RequestIndex) {
                        if entry.flags.contains(RequestFlags::SP_ARMED) {
                            let name = entry.name;
                            entry.flags.remove(RequestFlags::SP_ARMED | RequestFlags::SP_DELAYED);
                            found = entry.soright.take().map(|so| (so, name));
                        }
                    }
                }
                found
            };

            match found {
                Some((soright, name)) => {
                    self.notify_send_possible(soright, name);
                    fired += 1;
                }
                None => break,
            }
        }

        if fired == 0 {
            Err(RX_ERR_NOT_WAITING)
        } else {
            Ok(fired)
        }
    }

    /// Send dead-name notifications for a dead port's table
    pub(crate) fn request_dead_names(&self, table: Box<RequestTable>) {
        for entry in (*table).into_live_entries() {
            if let Some(soright) = entry.soright {
                self.notify_dead_name(soright, entry.name);
            }
        }
    }
}
