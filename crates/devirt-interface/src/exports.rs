//! The export directory.
//!
//! Every devirtualizable method has an export entry recording where its
//! instruction stream starts and which cipher key decodes the first
//! instruction. Methods without an entry cannot be recovered.

use std::collections::{btree_map, BTreeMap, HashMap};

use crate::image::MethodSignature;

/// One exported (devirtualizable) function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmExport {
    /// Export id, as used by `CALL` bookkeeping.
    pub id: u32,
    /// Offset of the first instruction.
    pub entry_offset: u64,
    /// Cipher key decoding the first instruction.
    pub entry_key: u32,
    /// The method's signature.
    pub signature: MethodSignature,
}

/// All exports of one obfuscated binary, indexed by id and by entry offset.
#[derive(Debug, Clone, Default)]
pub struct ExportDirectory {
    exports: BTreeMap<u32, VmExport>,
    by_offset: HashMap<u64, u32>,
}

impl ExportDirectory {
    /// Builds a directory from parsed export entries. Later duplicates (by
    /// id or by entry offset) replace earlier ones.
    pub fn from_exports(exports: impl IntoIterator<Item = VmExport>) -> Self {
        let mut directory = Self::default();
        for export in exports {
            directory.by_offset.insert(export.entry_offset, export.id);
            directory.exports.insert(export.id, export);
        }
        directory
    }

    /// Looks up an export by id.
    pub fn get(&self, id: u32) -> Option<&VmExport> {
        self.exports.get(&id)
    }

    /// Looks up the export whose body starts at `offset`.
    pub fn by_entry_offset(&self, offset: u64) -> Option<&VmExport> {
        self.by_offset.get(&offset).and_then(|id| self.exports.get(id))
    }

    /// Iterates all exports in id order.
    pub fn iter(&self) -> impl Iterator<Item = &VmExport> {
        self.exports.values()
    }

    /// Number of exports.
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

impl<'a> IntoIterator for &'a ExportDirectory {
    type Item = &'a VmExport;
    type IntoIter = btree_map::Values<'a, u32, VmExport>;

    fn into_iter(self) -> Self::IntoIter {
        self.exports.values()
    }
}
