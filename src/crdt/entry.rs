//! Per-element CRDT state.
//!
//! An entry is the product of independent LWW registers plus an absorbing
//! tombstone. Merging is a per-register join, so it is commutative,
//! associative and idempotent. Field registers may arrive before the origin
//! register (an update delivered ahead of its add); such entries stay
//! invisible until the origin lands.

use std::cmp::Ordering;

use super::clock::{Register, Stamp, TieBreak, merge_slot};
use super::element::{Element, ElementPatch};

/// Immutable creation metadata, written only by adds.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub created_by: String,
    pub created_at: i64,
}

impl TieBreak for Origin {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.created_by.cmp(&other.created_by))
    }
}

/// Deletion marker. `deleted_at` is the deleting replica's wall clock in ms,
/// used only for garbage collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tombstone {
    pub stamp: Stamp,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub origin: Option<Register<Origin>>,
    pub content: Option<Register<String>>,
    pub x: Option<Register<f64>>,
    pub y: Option<Register<f64>>,
    pub color: Option<Register<String>>,
    pub width: Option<Register<f64>>,
    pub height: Option<Register<f64>>,
    pub tombstone: Option<Tombstone>,
}

impl Entry {
    /// Entry state produced by a local add.
    #[must_use]
    pub fn from_element(element: &Element, stamp: Stamp) -> Self {
        let origin = Origin { created_by: element.created_by.clone(), created_at: element.created_at };
        Self {
            origin: Some(Register::new(origin, stamp)),
            content: Some(Register::new(element.content.clone(), stamp)),
            x: Some(Register::new(element.x, stamp)),
            y: Some(Register::new(element.y, stamp)),
            color: element.color.clone().map(|c| Register::new(c, stamp)),
            width: element.width.map(|w| Register::new(w, stamp)),
            height: element.height.map(|h| Register::new(h, stamp)),
            tombstone: None,
        }
    }

    /// Entry state produced by a local partial update.
    #[must_use]
    pub fn from_patch(patch: &ElementPatch, stamp: Stamp) -> Self {
        Self {
            origin: None,
            content: patch.content.clone().map(|c| Register::new(c, stamp)),
            x: patch.x.map(|x| Register::new(x, stamp)),
            y: patch.y.map(|y| Register::new(y, stamp)),
            color: patch.color.clone().map(|c| Register::new(c, stamp)),
            width: patch.width.map(|w| Register::new(w, stamp)),
            height: patch.height.map(|h| Register::new(h, stamp)),
            tombstone: None,
        }
    }

    #[must_use]
    pub fn tombstoned(stamp: Stamp, deleted_at: i64) -> Self {
        Self { tombstone: Some(Tombstone { stamp, deleted_at }), ..Self::default() }
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.origin.is_some() && self.tombstone.is_none()
    }

    /// Join `other` into `self`. Returns true when anything changed.
    pub fn merge(&mut self, other: &Entry) -> bool {
        let mut changed = false;

        if let Some(incoming) = other.tombstone {
            let replace = match self.tombstone {
                Some(current) => (incoming.stamp, incoming.deleted_at) > (current.stamp, current.deleted_at),
                None => true,
            };
            if replace {
                self.tombstone = Some(incoming);
                changed = true;
            }
        }

        // Tombstones absorb: a deleted entry keeps no field state.
        if self.tombstone.is_some() {
            let had_fields = self.has_fields();
            self.clear_fields();
            return changed || had_fields;
        }

        changed |= merge_slot(&mut self.origin, other.origin.as_ref());
        changed |= merge_slot(&mut self.content, other.content.as_ref());
        changed |= merge_slot(&mut self.x, other.x.as_ref());
        changed |= merge_slot(&mut self.y, other.y.as_ref());
        changed |= merge_slot(&mut self.color, other.color.as_ref());
        changed |= merge_slot(&mut self.width, other.width.as_ref());
        changed |= merge_slot(&mut self.height, other.height.as_ref());
        changed
    }

    /// Greatest stamp carried by this entry, for clock advancement.
    #[must_use]
    pub fn max_stamp(&self) -> Option<Stamp> {
        [
            self.origin.as_ref().map(|r| r.stamp),
            self.content.as_ref().map(|r| r.stamp),
            self.x.as_ref().map(|r| r.stamp),
            self.y.as_ref().map(|r| r.stamp),
            self.color.as_ref().map(|r| r.stamp),
            self.width.as_ref().map(|r| r.stamp),
            self.height.as_ref().map(|r| r.stamp),
            self.tombstone.map(|t| t.stamp),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Materialize the visible element, if any.
    #[must_use]
    pub fn to_element(&self, id: &str) -> Option<Element> {
        if self.tombstone.is_some() {
            return None;
        }
        let origin = self.origin.as_ref()?;
        Some(Element {
            id: id.to_owned(),
            content: self
                .content
                .as_ref()
                .map(|r| r.value.clone())
                .unwrap_or_default(),
            x: self.x.as_ref().map_or(0.0, |r| r.value),
            y: self.y.as_ref().map_or(0.0, |r| r.value),
            color: self.color.as_ref().map(|r| r.value.clone()),
            width: self.width.as_ref().map(|r| r.value),
            height: self.height.as_ref().map(|r| r.value),
            created_by: origin.value.created_by.clone(),
            created_at: origin.value.created_at,
        })
    }

    fn has_fields(&self) -> bool {
        self.origin.is_some()
            || self.content.is_some()
            || self.x.is_some()
            || self.y.is_some()
            || self.color.is_some()
            || self.width.is_some()
            || self.height.is_some()
    }

    fn clear_fields(&mut self) {
        self.origin = None;
        self.content = None;
        self.x = None;
        self.y = None;
        self.color = None;
        self.width = None;
        self.height = None;
    }
}
