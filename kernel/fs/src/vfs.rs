//! Dentry tree and path lookup.
//!
//! The whole tree lives in memory: file content is owned by the dentry
//! (copied out of the initramfs image at boot). Each dentry carries its
//! [`NodeOps`] bundle by value; the default bundles implement RamFs
//! behaviour per node kind.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use norn_core::sync::SpinLock;

use crate::{FsError, NodeKind, path};

/// Per-node operation bundle.
#[derive(Clone, Copy)]
pub struct NodeOps {
    /// Reads at `offset` into `buf`, returning the number of bytes.
    pub read: fn(&Dentry, u64, &mut [u8]) -> Result<usize, FsError>,
    /// Returns node metadata.
    pub stat: fn(&Dentry) -> Stat,
}

/// Node metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Node kind.
    pub kind: NodeKind,
    /// Content size in bytes (0 for directories and devices).
    pub size: u64,
}

/// A directory entry.
pub struct Dentry {
    /// Entry name (single component).
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Operation bundle for this node.
    pub ops: NodeOps,
    /// File content; empty for directories and devices.
    pub content: Vec<u8>,
    /// Child entries; empty for non-directories.
    pub children: Vec<Arc<Dentry>>,
}

fn ram_file_read(dentry: &Dentry, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
    let offset = offset as usize;
    if offset >= dentry.content.len() {
        return Ok(0);
    }
    let n = buf.len().min(dentry.content.len() - offset);
    buf[..n].copy_from_slice(&dentry.content[offset..offset + n]);
    Ok(n)
}

fn dir_read(_dentry: &Dentry, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
    Err(FsError::InvalidArgument)
}

fn null_read(_dentry: &Dentry, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
    Ok(0)
}

fn default_stat(dentry: &Dentry) -> Stat {
    Stat {
        kind: dentry.kind,
        size: match dentry.kind {
            NodeKind::File => dentry.content.len() as u64,
            _ => 0,
        },
    }
}

/// Default operations of a RamFs file.
pub const RAM_FILE_OPS: NodeOps = NodeOps {
    read: ram_file_read,
    stat: default_stat,
};

/// Default operations of a directory.
pub const DIR_OPS: NodeOps = NodeOps {
    read: dir_read,
    stat: default_stat,
};

/// Operations of a null character device.
pub const NULL_DEV_OPS: NodeOps = NodeOps {
    read: null_read,
    stat: default_stat,
};

impl Dentry {
    /// Creates a file entry owning `content`.
    pub fn file(name: &str, content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: NodeKind::File,
            ops: RAM_FILE_OPS,
            content,
            children: Vec::new(),
        })
    }

    /// Creates a directory entry with the given children.
    pub fn dir(name: &str, children: Vec<Arc<Dentry>>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: NodeKind::Dir,
            ops: DIR_OPS,
            content: Vec::new(),
            children,
        })
    }

    /// Creates a character-device entry with explicit ops.
    pub fn chardev(name: &str, ops: NodeOps) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: NodeKind::CharDev,
            ops,
            content: Vec::new(),
            children: Vec::new(),
        })
    }

    /// Finds a direct child by name.
    pub fn child(&self, name: &str) -> Option<&Arc<Dentry>> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Resolves an absolute path against `root`.
pub fn lookup(root: &Arc<Dentry>, abs_path: &str) -> Result<Arc<Dentry>, FsError> {
    if !path::is_absolute(abs_path) {
        return Err(FsError::InvalidArgument);
    }
    let mut current = Arc::clone(root);
    for component in path::components(abs_path) {
        if current.kind != NodeKind::Dir {
            return Err(FsError::NotFound);
        }
        current = Arc::clone(current.child(component).ok_or(FsError::NotFound)?);
    }
    Ok(current)
}

// ---------------------------------------------------------------------------
// Global root
// ---------------------------------------------------------------------------

/// Global filesystem root, installed once after the initramfs is
/// unpacked.
static ROOT: SpinLock<Option<Arc<Dentry>>> = SpinLock::new(None);

/// Installs the filesystem root.
///
/// # Panics
///
/// Panics if called twice.
pub fn init(root: Arc<Dentry>) {
    let mut slot = ROOT.lock();
    assert!(slot.is_none(), "filesystem root already installed");
    *slot = Some(root);
}

/// Resolves an absolute path against the global root.
pub fn resolve(abs_path: &str) -> Result<Arc<Dentry>, FsError> {
    let slot = ROOT.lock();
    let root = slot.as_ref().ok_or(FsError::NotFound)?;
    lookup(root, abs_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Arc<Dentry> {
        Dentry::dir(
            "",
            vec![
                Dentry::dir(
                    "bin",
                    vec![Dentry::file("sh", b"#!ELF-ish".to_vec())],
                ),
                Dentry::dir(
                    "dev",
                    vec![Dentry::chardev("null", NULL_DEV_OPS)],
                ),
                Dentry::file("motd", b"welcome to norn\n".to_vec()),
            ],
        )
    }

    #[test]
    fn lookup_nested_path() {
        let root = sample_tree();
        let sh = lookup(&root, "/bin/sh").unwrap();
        assert_eq!(sh.name, "sh");
        assert_eq!(sh.kind, NodeKind::File);
    }

    #[test]
    fn lookup_root_itself() {
        let root = sample_tree();
        let r = lookup(&root, "/").unwrap();
        assert_eq!(r.kind, NodeKind::Dir);
    }

    #[test]
    fn lookup_missing_entry() {
        let root = sample_tree();
        assert!(matches!(lookup(&root, "/bin/bash"), Err(FsError::NotFound)));
    }

    #[test]
    fn lookup_through_file_fails() {
        let root = sample_tree();
        assert!(matches!(
            lookup(&root, "/motd/inner"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn relative_path_rejected() {
        let root = sample_tree();
        assert!(matches!(
            lookup(&root, "bin/sh"),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn file_read_with_offset() {
        let root = sample_tree();
        let motd = lookup(&root, "/motd").unwrap();
        let mut buf = [0u8; 7];
        let n = (motd.ops.read)(&motd, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"welcome");
        let n = (motd.ops.read)(&motd, 8, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"to norn");
        // Reads past the end return zero bytes.
        assert_eq!((motd.ops.read)(&motd, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn stat_reports_kind_and_size() {
        let root = sample_tree();
        let motd = lookup(&root, "/motd").unwrap();
        let st = (motd.ops.stat)(&motd);
        assert_eq!(st.kind, NodeKind::File);
        assert_eq!(st.size, 16);

        let null = lookup(&root, "/dev/null").unwrap();
        let st = (null.ops.stat)(&null);
        assert_eq!(st.kind, NodeKind::CharDev);
        assert_eq!(st.size, 0);
    }

    #[test]
    fn dir_read_is_invalid() {
        let root = sample_tree();
        let bin = lookup(&root, "/bin").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            (bin.ops.read)(&bin, 0, &mut buf),
            Err(FsError::InvalidArgument)
        );
    }
}
