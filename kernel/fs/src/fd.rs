//! Open files and the per-process descriptor table.

use alloc::sync::Arc;

use crate::vfs::{Dentry, Stat};
use crate::{FsError, NodeKind};

/// Number of descriptor slots per process.
pub const FD_TABLE_SIZE: usize = 64;

/// An open file: a dentry plus a cursor.
pub struct File {
    dentry: Arc<Dentry>,
    pos: u64,
}

impl File {
    /// Opens a dentry at position 0.
    pub fn open(dentry: Arc<Dentry>) -> Result<Self, FsError> {
        if dentry.kind == NodeKind::Dir {
            return Err(FsError::InvalidArgument);
        }
        Ok(Self { dentry, pos: 0 })
    }

    /// Reads from the cursor, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let n = (self.dentry.ops.read)(&self.dentry, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Node metadata.
    pub fn stat(&self) -> Stat {
        (self.dentry.ops.stat)(&self.dentry)
    }

    /// The underlying dentry.
    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }
}

/// A fixed-size descriptor table.
pub struct FdTable {
    slots: [Option<File>; FD_TABLE_SIZE],
}

impl FdTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: [const { None }; FD_TABLE_SIZE],
        }
    }

    /// Installs an open file in the lowest free slot.
    pub fn install(&mut self, file: File) -> Result<usize, FsError> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::DescriptorFull)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    /// Borrows the file behind `fd`.
    pub fn get_mut(&mut self, fd: usize) -> Result<&mut File, FsError> {
        self.slots
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadFileDescriptor)
    }

    /// Closes `fd`.
    pub fn close(&mut self, fd: usize) -> Result<(), FsError> {
        let slot = self.slots.get_mut(fd).ok_or(FsError::BadFileDescriptor)?;
        if slot.is_none() {
            return Err(FsError::BadFileDescriptor);
        }
        *slot = None;
        Ok(())
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Dentry;

    fn file_dentry() -> Arc<Dentry> {
        Dentry::file("data", b"0123456789".to_vec())
    }

    #[test]
    fn open_read_advances_cursor() {
        let mut f = File::open(file_dentry()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(f.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn open_directory_rejected() {
        let dir = Dentry::dir("d", vec![]);
        assert!(matches!(File::open(dir), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn stat_through_file() {
        let f = File::open(file_dentry()).unwrap();
        assert_eq!(f.stat().size, 10);
    }

    #[test]
    fn table_install_and_close() {
        let mut table = FdTable::new();
        let fd = table.install(File::open(file_dentry()).unwrap()).unwrap();
        assert_eq!(fd, 0);
        assert!(table.get_mut(fd).is_ok());
        table.close(fd).unwrap();
        assert!(matches!(table.get_mut(fd), Err(FsError::BadFileDescriptor)));
        // Closing twice fails.
        assert!(matches!(table.close(fd), Err(FsError::BadFileDescriptor)));
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut table = FdTable::new();
        let a = table.install(File::open(file_dentry()).unwrap()).unwrap();
        let b = table.install(File::open(file_dentry()).unwrap()).unwrap();
        assert_eq!((a, b), (0, 1));
        table.close(a).unwrap();
        let c = table.install(File::open(file_dentry()).unwrap()).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn table_exhaustion() {
        let mut table = FdTable::new();
        for _ in 0..FD_TABLE_SIZE {
            table.install(File::open(file_dentry()).unwrap()).unwrap();
        }
        assert!(matches!(
            table.install(File::open(file_dentry()).unwrap()),
            Err(FsError::DescriptorFull)
        ));
    }

    #[test]
    fn out_of_range_fd() {
        let mut table = FdTable::new();
        assert!(matches!(
            table.get_mut(FD_TABLE_SIZE + 5),
            Err(FsError::BadFileDescriptor)
        ));
    }
}
