//! Refs and the arena that owns them.
//!
//! A ref is a domain object (a commit, a revision, a build, a browse target)
//! that declares a set of [`Hardpoint`]s. The engine owns every ref in a
//! [`RefStore`] and is the only writer of hardpoint slots; everyone else holds
//! copyable [`RefId`] handles.

mod browse;
mod build;
mod commit;
mod object;
mod repository;
mod revision;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

pub use browse::{BrowseRef, BrowseType, BrowseUriRef};
pub use build::{BuildPlanRef, BuildRef, BuildableRef};
pub use commit::{CommitRef, CommitSymbolRef};
pub use object::{ObjectKind, ObjectRef, ObjectSymbolRef, SymbolType};
pub use repository::RepositoryRef;
pub use revision::{RevisionRef, WorkingCopyStateRef};

use crate::core::{Hardpoint, Hash32, RefId, Value};
use crate::engine::TaskId;
use crate::error::{EngineError, SharedError};

/// A domain object that participates in hardpoint resolution.
pub trait Ref: Any + fmt::Debug {
    /// Short human readable type name, used in errors and logs.
    fn ref_type(&self) -> &'static str;

    /// Hardpoints declared by this ref type.
    fn hardpoints(&self) -> &'static [Hardpoint];

    /// Identity of this ref among refs of the same type. Refs that return the
    /// same identity are stored once, so independent callers share one
    /// resolution. `None` means every instance is distinct.
    fn identity(&self) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn Ref {
    pub fn downcast_ref<R: Ref>(&self) -> Option<&R> {
        self.as_any().downcast_ref::<R>()
    }

    pub fn is<R: Ref>(&self) -> bool {
        self.as_any().is::<R>()
    }
}

/// Resolution state of one hardpoint on one ref.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HardpointState<'a> {
    /// Nobody asked for this hardpoint yet.
    Unrequested,
    /// A task is computing it.
    Pending,
    /// Final value. It never changes again.
    Resolved(&'a Value),
}

pub(crate) enum Slot {
    Pending(Pending),
    Resolved(Value),
}

pub(crate) struct Pending {
    /// Tasks still contributing to this slot. More than one only for list
    /// hardpoints filled by several producers.
    pub(crate) tasks: Vec<TaskId>,
    pub(crate) partial: Value,
    /// Set when one of the contributing tasks failed. The slot goes back to
    /// unrequested once the others finish, and requests arriving meanwhile
    /// fail with this error.
    pub(crate) error: Option<SharedError>,
}

struct Entry {
    object: Box<dyn Ref>,
    slots: HashMap<&'static str, Slot>,
}

/// Arena of refs.
#[derive(Default)]
pub struct RefStore {
    entries: Vec<Entry>,
    identities: HashMap<Hash32, RefId>,
}

impl fmt::Debug for RefStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.object))
            .finish()
    }
}

impl RefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a ref and returns its handle. A ref whose identity matches one
    /// already stored is dropped and the existing handle is returned instead.
    pub fn insert<R: Ref>(&mut self, object: R) -> RefId {
        let identity = object
            .identity()
            .map(|identity| Hash32::hash_parts([object.ref_type(), identity.as_str()]));

        if let Some(hash) = identity
            && let Some(id) = self.identities.get(&hash)
        {
            return *id;
        }

        let id = RefId(self.entries.len() as u32);
        self.entries.push(Entry {
            object: Box::new(object),
            slots: HashMap::new(),
        });

        if let Some(hash) = identity {
            self.identities.insert(hash, id);
        }

        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: RefId) -> Result<&dyn Ref, EngineError> {
        self.entries
            .get(id.index())
            .map(|entry| entry.object.as_ref())
            .ok_or(EngineError::UnknownRef(id))
    }

    /// Typed access to a stored ref.
    pub fn downcast<R: Ref>(&self, id: RefId) -> Option<&R> {
        self.get(id).ok()?.downcast_ref::<R>()
    }

    /// Looks up the declaration of `key` on the ref's type.
    pub fn definition(&self, id: RefId, key: &str) -> Result<Hardpoint, EngineError> {
        let object = self.get(id)?;
        object
            .hardpoints()
            .iter()
            .find(|hardpoint| hardpoint.key == key)
            .copied()
            .ok_or_else(|| EngineError::UnknownHardpoint {
                id,
                ref_type: object.ref_type(),
                key: key.to_string(),
                declared: declared(object.hardpoints()),
            })
    }

    pub fn state(&self, id: RefId, key: &str) -> Result<HardpointState<'_>, EngineError> {
        let hardpoint = self.definition(id, key)?;
        Ok(match self.slot(id, hardpoint.key) {
            None => HardpointState::Unrequested,
            Some(Slot::Pending(_)) => HardpointState::Pending,
            Some(Slot::Resolved(value)) => HardpointState::Resolved(value),
        })
    }

    /// The resolved value of a hardpoint. Asking before the hardpoint was
    /// resolved is an error.
    pub fn hardpoint(&self, id: RefId, key: &str) -> Result<&Value, EngineError> {
        match self.state(id, key)? {
            HardpointState::Resolved(value) => Ok(value),
            HardpointState::Pending => Err(EngineError::StillPending {
                id,
                key: key.to_string(),
            }),
            HardpointState::Unrequested => Err(EngineError::NotRequested {
                id,
                key: key.to_string(),
            }),
        }
    }

    /// Attaches a final value to a slot that has none.
    pub(crate) fn attach(
        &mut self,
        id: RefId,
        key: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let hardpoint = self.definition(id, key)?;
        if let Some(Slot::Resolved(_)) = self.slot(id, hardpoint.key) {
            return Err(EngineError::AlreadyAttached {
                id,
                key: key.to_string(),
            });
        }
        self.set_slot(id, hardpoint.key, Slot::Resolved(value));
        Ok(())
    }

    pub(crate) fn slot(&self, id: RefId, key: &str) -> Option<&Slot> {
        self.entries.get(id.index())?.slots.get(key)
    }

    pub(crate) fn slot_mut(&mut self, id: RefId, key: &str) -> Option<&mut Slot> {
        self.entries.get_mut(id.index())?.slots.get_mut(key)
    }

    pub(crate) fn set_slot(&mut self, id: RefId, key: &'static str, slot: Slot) {
        if let Some(entry) = self.entries.get_mut(id.index()) {
            entry.slots.insert(key, slot);
        }
    }

    pub(crate) fn clear_slot(&mut self, id: RefId, key: &str) {
        if let Some(entry) = self.entries.get_mut(id.index()) {
            entry.slots.remove(key);
        }
    }
}

fn declared(hardpoints: &[Hardpoint]) -> String {
    if hardpoints.is_empty() {
        return "(none)".to_string();
    }

    hardpoints
        .iter()
        .map(|hardpoint| format!("\"{}\"", hardpoint.key))
        .collect::<Vec<_>>()
        .join(", ")
}
