//! # Filesystem seam
//!
//! The loader only streams executables; this is the slice of the VFS it needs.

/// Read-only access to files by path.
pub trait FileSystem {
    /// An open file.
    type Handle;

    /// Open the regular file at `path`. Directories and missing files yield `None`.
    fn open(&mut self, path: &str) -> Option<Self::Handle>;

    /// Read up to `buf.len()` bytes at the handle's cursor, returning how many
    /// were read.
    fn read(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> usize;

    /// Whether the cursor reached the end of the file.
    fn eof(&self, handle: &Self::Handle) -> bool;

    fn close(&mut self, handle: Self::Handle);
}
