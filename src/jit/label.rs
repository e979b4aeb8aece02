//! Branch-target bookkeeping keyed by bytecode offset.
//!
//! Every instruction boundary gets a label bound to the native position of its
//! template. Branches reference labels by the bytecode offset they target; a
//! reference to an offset that is not (yet) bound leaves the label pending.

use crate::bytecode::ByteOffset;
use std::collections::BTreeMap;

/// State of a single label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    /// Bound to a native code position.
    Bound(usize),
    /// Not bound yet; holds the code positions referencing it.
    Pending(Vec<usize>),
}

/// Sparse label map. Only offsets that are instruction boundaries or branch
/// targets have an entry.
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: BTreeMap<ByteOffset, Label>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `offset` to native position `pos`.
    ///
    /// Returns the code positions that referenced the label while it was
    /// pending, or `Err(previous)` if it was already bound.
    pub fn bind(&mut self, offset: ByteOffset, pos: usize) -> Result<Vec<usize>, usize> {
        match self.labels.insert(offset, Label::Bound(pos)) {
            None => Ok(Vec::new()),
            Some(Label::Pending(sites)) => Ok(sites),
            Some(Label::Bound(previous)) => {
                self.labels.insert(offset, Label::Bound(previous));
                Err(previous)
            }
        }
    }

    /// Record a reference to `offset` from code position `site`.
    ///
    /// Returns the bound position for backward references, `None` for
    /// forward ones.
    pub fn reference(&mut self, offset: ByteOffset, site: usize) -> Option<usize> {
        let label = self
            .labels
            .entry(offset)
            .or_insert_with(|| Label::Pending(Vec::new()));
        match label {
            Label::Bound(pos) => Some(*pos),
            Label::Pending(sites) => {
                sites.push(site);
                None
            }
        }
    }

    /// Native position of a bound label.
    pub fn resolve(&self, offset: ByteOffset) -> Option<usize> {
        match self.labels.get(&offset) {
            Some(Label::Bound(pos)) => Some(*pos),
            _ => None,
        }
    }

    pub fn get(&self, offset: ByteOffset) -> Option<&Label> {
        self.labels.get(&offset)
    }

    /// Labels still pending, in offset order.
    pub fn pending(&self) -> impl Iterator<Item = (ByteOffset, &[usize])> {
        self.labels.iter().filter_map(|(offset, label)| match label {
            Label::Pending(sites) => Some((*offset, sites.as_slice())),
            Label::Bound(_) => None,
        })
    }

    /// All bound labels, in offset order.
    pub fn bound(&self) -> impl Iterator<Item = (ByteOffset, usize)> + '_ {
        self.labels.iter().filter_map(|(offset, label)| match label {
            Label::Bound(pos) => Some((*offset, *pos)),
            Label::Pending(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
