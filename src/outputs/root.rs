//! Read-only filesystem surface of the service node: one directory whose
//! children are the live output bases. A kernel bridge delegates its
//! attribute, lookup and readdir callbacks here; everything below the
//! per-base roots is handled by the prepopulated directories themselves.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use rfuse3::raw::reply::{DirectoryEntry, DirectoryEntryPlus, FileAttr};
use rfuse3::{Errno, FileType};

use crate::outputs::OutputServiceNode;
use crate::path::Component;
use crate::vfs::dir::directory_attr;
use crate::vfs::{EMPTY_DIRECTORY_LINK_COUNT, PrepopulatedDir};

/// Cache validity communicated to the kernel.
const ATTR_TTL: Duration = Duration::from_secs(1);

impl OutputServiceNode {
    /// The root is readable and searchable, nothing else.
    pub fn access(&self, mask: u32) -> Result<(), Errno> {
        if mask & !((libc::R_OK | libc::X_OK) as u32) != 0 {
            return Err(libc::EACCES.into());
        }
        Ok(())
    }

    /// Attributes of the service root. The link count mirrors the number of
    /// live output bases.
    pub fn getattr(&self) -> FileAttr {
        let bases = self.registry().len() as u32;
        directory_attr(self.ino(), EMPTY_DIRECTORY_LINK_COUNT + bases, 0o555)
    }

    /// Look up the output path root of one output base, with an attribute
    /// snapshot taken outside the registry lock.
    pub async fn lookup(
        &self,
        name: &Component,
    ) -> Result<(Arc<PrepopulatedDir>, FileAttr), Errno> {
        let Some(handle) = self.registry().lookup_by_base(name) else {
            return Err(libc::ENOENT.into());
        };
        let attr = handle.root.attr().await.map_err(|_| Errno::from(libc::EIO))?;
        Ok((handle.root.clone(), attr))
    }

    /// List the live output bases.
    pub fn readdir(&self) -> Vec<DirectoryEntry> {
        self.registry()
            .snapshot()
            .into_iter()
            .enumerate()
            .map(|(i, (name, handle))| DirectoryEntry {
                inode: handle.root_ino(),
                kind: FileType::Directory,
                name: OsString::from(name.as_str()),
                offset: i as i64 + 1,
            })
            .collect()
    }

    /// List the live output bases together with handles and attribute
    /// snapshots; attributes are computed after the registry snapshot is
    /// taken.
    pub async fn readdirplus(
        &self,
    ) -> Result<Vec<(Arc<PrepopulatedDir>, DirectoryEntryPlus)>, Errno> {
        let snapshot = self.registry().snapshot();
        let mut entries = Vec::with_capacity(snapshot.len());
        for (i, (name, handle)) in snapshot.into_iter().enumerate() {
            let attr = handle.root.attr().await.map_err(|_| Errno::from(libc::EIO))?;
            entries.push((
                handle.root.clone(),
                DirectoryEntryPlus {
                    inode: handle.root_ino(),
                    generation: 0,
                    kind: FileType::Directory,
                    name: OsString::from(name.as_str()),
                    offset: i as i64 + 1,
                    attr,
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                },
            ));
        }
        Ok(entries)
    }
}
