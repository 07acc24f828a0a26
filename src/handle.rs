//! Open-file handles and the per-session handle table.
//!
//! A [`Handle`] is owned by the caller and is not `Clone`: closing or
//! removing it consumes it, so the same fid cannot be closed twice. The
//! [`HandleTable`] lives inside the session worker and is the only place
//! fids and tags are allocated.

use std::collections::HashMap;

use crate::error::{NineError, Result};
use crate::id_pool::IdPool;
use crate::protocol::{Qid, NOTAG};

/// Fid of the attached root. Never handed out to handles.
pub const ROOT_FID: u32 = 0;

/// An open file on the server.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle {
    name: String,
    fid: u32,
    tag: u16,
    iounit: u32,
    qid: Qid,
}

impl Handle {
    pub(crate) fn new(name: String, fid: u32, tag: u16, iounit: u32, qid: Qid) -> Self {
        Self {
            name,
            fid,
            tag,
            iounit,
            qid,
        }
    }

    /// Path this handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Tag reserved for this handle's requests.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Largest read/write count the server accepts in one message.
    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    /// Qid returned by Topen/Tcreate.
    pub fn qid(&self) -> Qid {
        self.qid
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OpenEntry {
    pub(crate) name: String,
    pub(crate) tag: u16,
    pub(crate) iounit: u32,
}

/// Fid/tag allocation plus the set of currently open handles.
#[derive(Debug)]
pub(crate) struct HandleTable {
    fids: IdPool,
    tags: IdPool,
    open: HashMap<u32, OpenEntry>,
}

impl HandleTable {
    pub(crate) fn new(max_fids: u32) -> Self {
        Self {
            fids: IdPool::new(max_fids),
            // NOTAG itself is never allocated
            tags: IdPool::new(NOTAG as u32),
            open: HashMap::new(),
        }
    }

    /// Claim fid 0 for the attach.
    pub(crate) fn reserve_root(&mut self) -> Result<()> {
        if self.fids.reserve(ROOT_FID) {
            Ok(())
        } else {
            Err(NineError::Exhausted("fid"))
        }
    }

    pub(crate) fn alloc_fid(&mut self) -> Result<u32> {
        self.fids.alloc().ok_or(NineError::Exhausted("fid"))
    }

    pub(crate) fn alloc_tag(&mut self) -> Result<u16> {
        self.tags
            .alloc()
            .map(|tag| tag as u16)
            .ok_or(NineError::Exhausted("tag"))
    }

    pub(crate) fn release_fid(&mut self, fid: u32) {
        self.fids.release(fid);
    }

    pub(crate) fn release_tag(&mut self, tag: u16) {
        self.tags.release(tag as u32);
    }

    /// Record a fully opened handle.
    pub(crate) fn insert(&mut self, fid: u32, entry: OpenEntry) {
        self.open.insert(fid, entry);
    }

    /// Forget an open handle and return its fid and tag to the pools.
    pub(crate) fn remove(&mut self, fid: u32) -> Option<OpenEntry> {
        let entry = self.open.remove(&fid)?;
        self.release_tag(entry.tag);
        self.release_fid(fid);
        Some(entry)
    }

    pub(crate) fn get(&self, fid: u32) -> Option<&OpenEntry> {
        self.open.get(&fid)
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.len()
    }

    #[cfg(test)]
    pub(crate) fn fids_in_use(&self) -> usize {
        self.fids.in_use()
    }

    #[cfg(test)]
    pub(crate) fn tags_in_use(&self) -> usize {
        self.tags.in_use()
    }

    /// Drop every handle at session teardown.
    pub(crate) fn clear(&mut self) {
        let fids: Vec<u32> = self.open.keys().copied().collect();
        for fid in fids {
            self.remove(fid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, tag: u16) -> OpenEntry {
        OpenEntry {
            name: name.to_string(),
            tag,
            iounit: 8168,
        }
    }

    #[test]
    fn test_fids_start_after_root() {
        let mut table = HandleTable::new(16);
        table.reserve_root().unwrap();
        assert_eq!(table.alloc_fid().unwrap(), 1);
        assert_eq!(table.alloc_fid().unwrap(), 2);
        assert!(table.reserve_root().is_err());
    }

    #[test]
    fn test_remove_frees_fid_and_tag() {
        let mut table = HandleTable::new(16);
        table.reserve_root().unwrap();

        let fid = table.alloc_fid().unwrap();
        let tag = table.alloc_tag().unwrap();
        table.insert(fid, entry("a", tag));
        assert_eq!(table.open_count(), 1);
        assert_eq!(table.get(fid).unwrap().name, "a");

        let removed = table.remove(fid).unwrap();
        assert_eq!(removed.tag, tag);
        assert!(table.remove(fid).is_none());
        assert_eq!(table.alloc_fid().unwrap(), fid);
        assert_eq!(table.alloc_tag().unwrap(), tag);
    }

    #[test]
    fn test_fid_exhaustion() {
        let mut table = HandleTable::new(2);
        table.reserve_root().unwrap();
        assert_eq!(table.alloc_fid().unwrap(), 1);
        assert!(matches!(table.alloc_fid(), Err(NineError::Exhausted("fid"))));
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut table = HandleTable::new(8);
        table.reserve_root().unwrap();
        for name in ["a", "b", "c"] {
            let fid = table.alloc_fid().unwrap();
            let tag = table.alloc_tag().unwrap();
            table.insert(fid, entry(name, tag));
        }
        assert_eq!(table.fids_in_use(), 4);

        table.clear();
        assert_eq!(table.open_count(), 0);
        assert_eq!(table.fids_in_use(), 1);
        assert_eq!(table.tags_in_use(), 0);
    }

    #[test]
    fn test_handle_accessors() {
        let handle = Handle::new("usr/glenda".into(), 3, 4, 8168, Qid::default());
        assert_eq!(handle.name(), "usr/glenda");
        assert_eq!(handle.fid(), 3);
        assert_eq!(handle.tag(), 4);
        assert_eq!(handle.iounit(), 8168);
        assert_eq!(handle.qid(), Qid::default());
    }
}
