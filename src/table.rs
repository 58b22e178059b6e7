//! Port table: which port in the managed range belongs to which instance
//!
//! The table itself is not synchronized. The supervisor keeps it behind a
//! single `RwLock` and performs every check-then-commit sequence
//! ([`PortTable::reserve`], [`PortTable::begin_removal`]) inside one write
//! guard, so two creates can never pick the same port.

use crate::error::SupervisorError;
use crate::instance::{Instance, InstanceState};
use crate::state::Snapshot;
use std::collections::BTreeMap;

/// An occupied port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub instance: Instance,
    pub state: InstanceState,
}

/// Ordered map of `[min, max)` to optional slots
#[derive(Debug)]
pub struct PortTable {
    min: u16,
    max: u16,
    slots: BTreeMap<u16, Option<Slot>>,
}

impl PortTable {
    /// Create a table with every port in `[min, max)` empty
    pub fn new(min: u16, max: u16) -> Self {
        let slots = (min..max).map(|port| (port, None)).collect();
        Self { min, max, slots }
    }

    /// Create a table from a snapshot, marking every persisted instance running
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, SupervisorError> {
        let mut table = Self::new(snapshot.range_min(), snapshot.range_max());
        for instance in &snapshot.state {
            table.occupy(instance.port, instance.clone(), InstanceState::Running)?;
        }
        Ok(table)
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.slots.contains_key(&port)
    }

    pub fn get(&self, port: u16) -> Option<&Slot> {
        self.slots.get(&port).and_then(Option::as_ref)
    }

    pub fn is_free(&self, port: u16) -> bool {
        matches!(self.slots.get(&port), Some(None))
    }

    pub fn free_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.is_none()).count()
    }

    /// Occupied slots in port order
    pub fn occupied(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values().filter_map(Option::as_ref)
    }

    /// Any occupied slot holding `name`, whatever its state
    pub fn lookup_by_name(&self, name: &str) -> Option<&Slot> {
        self.occupied().find(|slot| slot.instance.name == name)
    }

    /// The running instance called `name`
    pub fn running_by_name(&self, name: &str) -> Option<&Instance> {
        self.lookup_by_name(name)
            .filter(|slot| slot.state == InstanceState::Running)
            .map(|slot| &slot.instance)
    }

    /// Lowest free port in the range
    pub fn allocate_free_port(&self) -> Result<u16, SupervisorError> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.is_none())
            .map(|(port, _)| *port)
            .ok_or(SupervisorError::ResourceExhausted {
                min: self.min,
                max: self.max,
            })
    }

    /// Put `instance` on `port`. The port must be inside the range and empty.
    pub fn occupy(
        &mut self,
        port: u16,
        mut instance: Instance,
        state: InstanceState,
    ) -> Result<(), SupervisorError> {
        let (min, max) = (self.min, self.max);
        let entry = self.slots.get_mut(&port).ok_or_else(|| {
            SupervisorError::Validation(format!(
                "port {} is outside range {}..{}",
                port, min, max
            ))
        })?;
        if let Some(existing) = entry.as_ref() {
            return Err(SupervisorError::Validation(format!(
                "port {} is already used by '{}'",
                port, existing.instance.name
            )));
        }
        instance.port = port;
        *entry = Some(Slot { instance, state });
        Ok(())
    }

    /// Empty `port`, returning what was there
    pub fn release(&mut self, port: u16) -> Option<Slot> {
        self.slots.get_mut(&port).and_then(Option::take)
    }

    /// Check the name, pick the lowest free port and occupy it as provisioning.
    ///
    /// Returns the assigned port. A duplicate name is reported before an
    /// exhausted range; neither outcome changes the table.
    pub fn reserve(&mut self, instance: Instance) -> Result<u16, SupervisorError> {
        if self.lookup_by_name(&instance.name).is_some() {
            return Err(SupervisorError::Conflict(instance.name));
        }
        let port = self.allocate_free_port()?;
        self.occupy(port, instance, InstanceState::Provisioning)?;
        Ok(port)
    }

    /// Move the running instance `name` to terminating and return a copy of it
    pub fn begin_removal(&mut self, name: &str) -> Result<Instance, SupervisorError> {
        let slot = self
            .slots
            .values_mut()
            .filter_map(Option::as_mut)
            .find(|slot| slot.instance.name == name && slot.state == InstanceState::Running)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        slot.state = InstanceState::Terminating;
        Ok(slot.instance.clone())
    }

    /// Change the state of an occupied port; false if the port is empty
    pub fn set_state(&mut self, port: u16, state: InstanceState) -> bool {
        match self.slots.get_mut(&port).and_then(Option::as_mut) {
            Some(slot) => {
                slot.state = state;
                true
            }
            None => false,
        }
    }

    /// Durable view: running and terminating instances with the range bounds.
    /// Provisioning slots are never persisted.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            port_range: [self.min, self.max],
            state: self
                .occupied()
                .filter(|slot| slot.state != InstanceState::Provisioning)
                .map(|slot| slot.instance.clone())
                .collect(),
        }
    }
}
