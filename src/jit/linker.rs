//! Two-phase linking of a [`CodeBuffer`].
//!
//! [`link`] checks that every referenced label is bound and computes all
//! displacements, which fixes the final code size. [`LinkedCode::encode`] then
//! materializes the bytes into a destination buffer, normally the writable
//! executable region.

use super::codebuf::{CodeBuffer, RelocKind, Relocation};
use crate::bytecode::ByteOffset;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("branch target {target} is not an instruction boundary (referenced from code offsets {sites:?})")]
    UnresolvedLabel {
        target: ByteOffset,
        sites: Vec<usize>,
    },
    #[error("label for offset {offset} bound twice (first at code offset {first})")]
    DuplicateLabel { offset: ByteOffset, first: usize },
    #[error("displacement to offset {target} does not fit {kind:?} at code offset {site}")]
    DisplacementOutOfRange {
        target: ByteOffset,
        site: usize,
        kind: RelocKind,
    },
    #[error("destination holds {available} bytes, code needs {needed}")]
    DestinationTooSmall { needed: usize, available: usize },
}

/// A resolved displacement, ready to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub reloc: Relocation,
    /// Native position the displacement lands on.
    pub dest: usize,
    pub value: i64,
}

/// Output of the first link phase.
#[derive(Debug)]
pub struct LinkedCode<'a> {
    buf: &'a CodeBuffer,
    patches: Vec<Patch>,
}

/// Resolve every relocation in `buf`.
pub fn link(buf: &CodeBuffer) -> Result<LinkedCode<'_>, LinkError> {
    if let Some((target, sites)) = buf.labels().pending().next() {
        return Err(LinkError::UnresolvedLabel {
            target,
            sites: sites.to_vec(),
        });
    }

    let patches = buf
        .relocations()
        .iter()
        .map(|reloc| resolve(buf, *reloc))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LinkedCode { buf, patches })
}

fn resolve(buf: &CodeBuffer, reloc: Relocation) -> Result<Patch, LinkError> {
    let dest = buf
        .labels()
        .resolve(reloc.target)
        .ok_or_else(|| LinkError::UnresolvedLabel {
            target: reloc.target,
            sites: vec![reloc.site],
        })?;

    let value = match reloc.kind {
        RelocKind::Rel32 => {
            let rel = dest as i64 - (reloc.site + reloc.kind.width()) as i64;
            if i32::try_from(rel).is_err() {
                return Err(LinkError::DisplacementOutOfRange {
                    target: reloc.target,
                    site: reloc.site,
                    kind: reloc.kind,
                });
            }
            rel
        }
    };

    Ok(Patch { reloc, dest, value })
}

impl LinkedCode<'_> {
    /// Final code size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Write the final code into the start of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<(), LinkError> {
        let size = self.size();
        if dst.len() < size {
            return Err(LinkError::DestinationTooSmall {
                needed: size,
                available: dst.len(),
            });
        }

        dst[..size].copy_from_slice(self.buf.code());
        for patch in &self.patches {
            let site = patch.reloc.site;
            match patch.reloc.kind {
                RelocKind::Rel32 => {
                    dst[site..site + 4].copy_from_slice(&(patch.value as i32).to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Encode into a fresh vector.
    pub fn to_vec(&self) -> Result<Vec<u8>, LinkError> {
        let mut out = vec![0u8; self.size()];
        self.encode(&mut out)?;
        Ok(out)
    }
}
