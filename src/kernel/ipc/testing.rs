// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Recording collaborators for the IPC unit tests

use crate::kernel::ipc::filter::EventFilter;
use crate::kernel::ipc::notify::Notifier;
use crate::kernel::ipc::port::{Port, PortFlags};
use crate::kernel::ipc::rights::{ReceiveRight, SendOnceRight};
use crate::kernel::ipc::space::{EntryRights, Space, SpaceEntry, SpaceObject};
use crate::kernel::ipc::turnstile::Turnstile;
use crate::kernel::ipc::{Ipc, IpcConfig};
use crate::rustux::types::*;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Kind of a recorded notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    DeadName,
    NoSenders,
    PortDestroyed,
    SendPossible,
}

/// A delivered notification
#[derive(Debug)]
pub struct Note {
    pub kind: NoteKind,
    pub name: PortName,
    pub mscount: MakeSendCount,

    /// Port the send-once right pointed at
    pub target: Option<PortId>,

    /// Receive right carried by a port-destroyed notification
    pub right: Option<ReceiveRight>,
}

/// Notifier that keeps everything it is handed
#[derive(Default)]
pub struct RecordingNotifier {
    notes: Mutex<Vec<Note>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Note> {
        core::mem::take(&mut *self.notes.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.notes.lock().is_empty()
    }

    fn record(&self, kind: NoteKind, notify: &SendOnceRight, name: PortName, mscount: MakeSendCount) -> Note {
        Note {
            kind,
            name,
            mscount,
            target: notify.port_id(),
            right: None,
        }
    }
}

impl Notifier for RecordingNotifier {
    fn dead_name(&self, notify: SendOnceRight, name: PortName) {
        let note = self.record(NoteKind::DeadName, &notify, name, 0);
        self.notes.lock().push(note);
    }

    fn no_senders(&self, notify: SendOnceRight, mscount: MakeSendCount) {
        let note = self.record(NoteKind::NoSenders, &notify, 0, mscount);
        self.notes.lock().push(note);
    }

    fn port_destroyed(&self, notify: SendOnceRight, right: ReceiveRight) {
        let mut note = self.record(NoteKind::PortDestroyed, &notify, 0, 0);
        note.right = Some(right);
        self.notes.lock().push(note);
    }

    fn send_possible(&self, notify: SendOnceRight, name: PortName) {
        let note = self.record(NoteKind::SendPossible, &notify, name, 0);
        self.notes.lock().push(note);
    }
}

/// Event filter with scripted knote turnstiles
#[derive(Default)]
pub struct TestFilter {
    knotes: Mutex<BTreeMap<KnoteId, Arc<Turnstile>>>,
    stashed: Mutex<BTreeMap<KnoteId, Arc<Turnstile>>>,
}

impl TestFilter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_knote_turnstile(&self, knote: KnoteId, ts: Arc<Turnstile>) {
        self.knotes.lock().insert(knote, ts);
    }

    pub fn set_stash(&self, knote: KnoteId, ts: Arc<Turnstile>) {
        self.stashed.lock().insert(knote, ts);
    }
}

impl EventFilter for TestFilter {
    fn kqueue_turnstile_of(&self, knote: KnoteId) -> Option<Arc<Turnstile>> {
        self.knotes.lock().get(&knote).cloned()
    }

    fn stash(&self, knote: KnoteId, _srp: &Arc<Port>) -> Option<Arc<Turnstile>> {
        self.stashed.lock().get(&knote).cloned()
    }
}

/// Map-backed capability space
pub struct TestSpace {
    id: SpaceId,
    next_name: AtomicU32,
    forced: Mutex<Option<PortName>>,
    entries: Mutex<BTreeMap<PortName, SpaceEntry>>,
}

impl TestSpace {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            next_name: AtomicU32::new(0x101),
            forced: Mutex::new(None),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Make the next `alloc_name` return `name`
    pub fn force_next_name(&self, name: PortName) {
        *self.forced.lock() = Some(name);
    }

    pub fn insert(&self, name: PortName, entry: SpaceEntry) {
        self.entries.lock().insert(name, entry);
    }

    pub fn insert_port(&self, name: PortName, port: &Arc<Port>, rights: EntryRights) {
        self.insert(
            name,
            SpaceEntry {
                object: SpaceObject::Port(port.clone()),
                rights,
            },
        );
    }
}

impl Space for TestSpace {
    fn id(&self) -> SpaceId {
        self.id
    }

    fn alloc_name(&self) -> Result<PortName> {
        if let Some(name) = self.forced.lock().take() {
            return Ok(name);
        }
        Ok(self.next_name.fetch_add(1, Ordering::Relaxed))
    }

    fn lookup(&self, name: PortName, f: &mut dyn FnMut(Option<&SpaceEntry>)) {
        let entries = self.entries.lock();
        f(entries.get(&name));
    }
}

pub fn new_ipc_full(config: IpcConfig, filter: Arc<TestFilter>) -> (Ipc, Arc<RecordingNotifier>) {
    let notes = Arc::new(RecordingNotifier::default());
    let ipc = Ipc::new(config, notes.clone(), filter);
    (ipc, notes)
}

pub fn new_ipc() -> (Ipc, Arc<RecordingNotifier>) {
    new_ipc_full(IpcConfig::default(), TestFilter::new())
}

pub fn new_ipc_with(config: IpcConfig) -> (Ipc, Arc<RecordingNotifier>) {
    new_ipc_full(config, TestFilter::new())
}

pub fn new_ipc_with_filter(filter: Arc<TestFilter>) -> (Ipc, Arc<RecordingNotifier>) {
    new_ipc_full(IpcConfig::default(), filter)
}

/// Allocate a plain port and keep only the port reference
pub fn alloc_port(ipc: &Ipc, space: &TestSpace) -> Arc<Port> {
    let (_, rcv) = ipc
        .port_alloc(space, PortFlags::empty())
        .expect("port allocation");
    rcv.into_port()
}
