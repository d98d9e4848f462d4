// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Capability Space Interface
//!
//! A space maps names to rights. The port layer only asks a space for
//! fresh names and looks names up; entries are inserted and removed by
//! the space's owner. Lookups run a callback under the space lock so the
//! entry cannot change while the port is validated.

use crate::kernel::ipc::port::{Port, PortFlags};
use crate::kernel::ipc::pset::PortSet;
use crate::kernel::ipc::rights::ReceiveRight;
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::Ipc;
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::sync::Arc;
use bitflags::bitflags;

use crate::log_trace_if;

const LOCAL_TRACE: bool = false;

bitflags! {
    /// Rights an entry holds
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryRights: u8 {
        const SEND = 1 << 0;
        const RECEIVE = 1 << 1;
        const SEND_ONCE = 1 << 2;
        const DEAD_NAME = 1 << 3;
        const PORT_SET = 1 << 4;
    }
}

/// Object named by an entry
#[derive(Debug, Clone)]
pub enum SpaceObject {
    Port(Arc<Port>),
    PortSet(Arc<PortSet>),
}

/// Space entry
#[derive(Debug, Clone)]
pub struct SpaceEntry {
    pub object: SpaceObject,
    pub rights: EntryRights,
}

/// Capability space collaborator
pub trait Space: Send + Sync {
    /// Get the space ID
    fn id(&self) -> SpaceId;

    /// Reserve a fresh name
    fn alloc_name(&self) -> Result<PortName>;

    /// Run `f` on the entry for `name` with the space locked
    fn lookup(&self, name: PortName, f: &mut dyn FnMut(Option<&SpaceEntry>));
}

impl Ipc {
    /// Allocate a port with its receive right named in `space`
    pub fn port_alloc(&self, space: &dyn Space, flags: PortFlags) -> Result<(PortName, ReceiveRight)> {
        let name = space.alloc_name()?;
        if name == PORT_NAME_NULL {
            return Err(RX_ERR_INVALID_ARGS);
        }

        let port = Port::new(flags, space.id(), name, self.config.qlimit_default);
        IpcStats::bump(&self.stats.ports_allocated);
        log_trace_if!(
            LOCAL_TRACE,
            "port {}: allocated as {:#x} in space {}",
            port.id(),
            name,
            space.id()
        );
        Ok((name, ReceiveRight::new(port)))
    }

    /// Allocate a port set named in `space`
    pub fn pset_alloc(&self, space: &dyn Space) -> Result<(PortName, Arc<PortSet>)> {
        let name = space.alloc_name()?;
        if name == PORT_NAME_NULL {
            return Err(RX_ERR_INVALID_ARGS);
        }

        let pset = PortSet::new(space.id(), name);
        IpcStats::bump(&self.stats.psets_allocated);
        log_trace_if!(LOCAL_TRACE, "pset {}: allocated as {:#x}", pset.id(), name);
        Ok((name, pset))
    }

    /// Resolve `name` to a live port whose receive right the space holds
    pub fn port_translate_receive(&self, space: &dyn Space, name: PortName) -> Result<Arc<Port>> {
        let mut result = Err(RX_ERR_NOT_FOUND);
        space.lookup(name, &mut |entry: Option<&SpaceEntry>| {
            result = match entry {
                None => Err(RX_ERR_NOT_FOUND),
                Some(SpaceEntry {
                    object: SpaceObject::Port(port),
                    rights,
                }) if rights.contains(EntryRights::RECEIVE) => {
                    if port.lock().is_active() {
                        Ok(port.clone())
                    } else {
                        Err(RX_ERR_TERMINATED)
                    }
                }
                Some(_) => Err(RX_ERR_WRONG_TYPE),
            };
        });
        result
    }

    /// Resolve `name` to a live port set
    pub fn pset_translate(&self, space: &dyn Space, name: PortName) -> Result<Arc<PortSet>> {
        let mut result = Err(RX_ERR_NOT_FOUND);
        space.lookup(name, &mut |entry: Option<&SpaceEntry>| {
            result = match entry {
                None => Err(RX_ERR_NOT_FOUND),
                Some(SpaceEntry {
                    object: SpaceObject::PortSet(pset),
                    ..
                }) => {
                    if pset.is_active() {
                        Ok(pset.clone())
                    } else {
                        Err(RX_ERR_TERMINATED)
                    }
                }
                Some(_) => Err(RX_ERR_WRONG_TYPE),
            };
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ipc::testing::*;

    #[test]
    fn test_port_alloc_names_and_counts() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(7);
        let (a, ra) = ipc.port_alloc(&space, PortFlags::empty()).unwrap();
        let (b, rb) = ipc.port_alloc(&space, PortFlags::SPECIAL_REPLY).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, PORT_NAME_NULL);
        assert!(rb.port().is_special_reply());
        assert_eq!(
            ra.port().binding(),
            crate::kernel::ipc::port::BindingKind::Receiver { space: 7, name: a }
        );
        assert_eq!(ipc.stats().ports_allocated, 2);
    }

    #[test]
    fn test_port_alloc_rejects_null_name() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        space.force_next_name(PORT_NAME_NULL);
        assert_eq!(ipc.port_alloc(&space, PortFlags::empty()).err(), Some(RX_ERR_INVALID_ARGS));
    }

    #[test]
    fn test_translate_receive() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (name, rcv) = ipc.port_alloc(&space, PortFlags::empty()).unwrap();
        let port = rcv.port().clone();
        space.insert_port(name, &port, EntryRights::RECEIVE);

        let send_name = 0x900;
        space.insert_port(send_name, &port, EntryRights::SEND);

        assert_eq!(ipc.port_translate_receive(&space, name).map(|p| p.id()), Ok(port.id()));
        assert_eq!(ipc.port_translate_receive(&space, 0x777).err(), Some(RX_ERR_NOT_FOUND));
        assert_eq!(ipc.port_translate_receive(&space, send_name).err(), Some(RX_ERR_WRONG_TYPE));

        ipc.port_destroy(rcv);
        assert_eq!(ipc.port_translate_receive(&space, name).err(), Some(RX_ERR_TERMINATED));
    }

    #[test]
    fn test_pset_translate() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (name, pset) = ipc.pset_alloc(&space).unwrap();
        space.insert(
            name,
            SpaceEntry {
                object: SpaceObject::PortSet(pset.clone()),
                rights: EntryRights::PORT_SET,
            },
        );
        assert_eq!(ipc.pset_translate(&space, name).map(|s| s.id()), Ok(pset.id()));

        ipc.pset_destroy(&pset);
        assert_eq!(ipc.pset_translate(&space, name).err(), Some(RX_ERR_TERMINATED));
    }
}
