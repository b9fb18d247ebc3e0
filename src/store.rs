//! Memory-mapped access to a compressed-codes file
//!
//! Once the encoder finishes, the codes file is read-only for the lifetime
//! of a search session. `CodeStore` maps it and hands out per-vector code
//! rows without copying; the OS page cache is the residency policy.
//!
//! # Safety
//!
//! Mapping a file is only sound while nobody truncates it. The codes file is
//! append-only during build and immutable afterwards, which is exactly the
//! window in which a store is opened.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::format::VecFileHeader;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}: file too small for codes header", path.display())]
    MissingHeader { path: std::path::PathBuf },

    #[error(
        "{}: truncated codes: header claims {expected} bytes, file has {actual}",
        path.display()
    )]
    Truncated {
        path: std::path::PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Index out of bounds: {index} >= {count}")]
    IndexOutOfBounds { index: usize, count: usize },
}

/// Read-only view of a compressed-codes file: `N` rows of `M` centroid
/// indices each.
pub struct CodeStore {
    mmap: Mmap,
    count: usize,
    n_chunks: usize,
}

impl CodeStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let header = VecFileHeader::from_bytes(&mmap).ok_or_else(|| StoreError::MissingHeader {
            path: path.to_path_buf(),
        })?;
        let count = header.npts as usize;
        let n_chunks = header.ndims as usize;

        let expected = VecFileHeader::SIZE + count * n_chunks;
        if mmap.len() < expected {
            return Err(StoreError::Truncated {
                path: path.to_path_buf(),
                expected,
                actual: mmap.len(),
            });
        }

        Ok(Self {
            mmap,
            count,
            n_chunks,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn num_chunks(&self) -> usize {
        self.n_chunks
    }

    /// Code row for one vector. Panics out of bounds; see [`Self::try_codes`].
    #[inline]
    pub fn codes(&self, index: usize) -> &[u8] {
        self.try_codes(index).expect("code access failed")
    }

    pub fn try_codes(&self, index: usize) -> Result<&[u8], StoreError> {
        if index >= self.count {
            return Err(StoreError::IndexOutOfBounds {
                index,
                count: self.count,
            });
        }
        let start = VecFileHeader::SIZE + index * self.n_chunks;
        Ok(&self.mmap[start..start + self.n_chunks])
    }

    /// Every code row, packed back to back (the layout `pq_dist_lookup`
    /// consumes directly).
    pub fn all_codes(&self) -> &[u8] {
        &self.mmap[VecFileHeader::SIZE..VecFileHeader::SIZE + self.count * self.n_chunks]
    }

    pub fn iter(&self) -> CodeIter<'_> {
        CodeIter {
            store: self,
            index: 0,
        }
    }
}

pub struct CodeIter<'a> {
    store: &'a CodeStore,
    index: usize,
}

impl<'a> Iterator for CodeIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.store.count {
            return None;
        }
        let row = self.store.codes(self.index);
        self.index += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.store.count - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for CodeIter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VecFileHeader;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_codes_file(path: &Path, count: u32, n_chunks: u32, codes: &[u8]) {
        let mut file = File::create(path).unwrap();
        let mut header = Vec::new();
        VecFileHeader {
            npts: count,
            ndims: n_chunks,
        }
        .write_to(&mut header)
        .unwrap();
        file.write_all(&header).unwrap();
        file.write_all(codes).unwrap();
    }

    #[test]
    fn open_and_read_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codes.bin");
        let codes: Vec<u8> = (0..12).collect();
        write_codes_file(&path, 3, 4, &codes);

        let store = CodeStore::open(&path).unwrap();
        assert_eq!(store.count(), 3);
        assert_eq!(store.num_chunks(), 4);
        assert_eq!(store.codes(0), &[0, 1, 2, 3]);
        assert_eq!(store.codes(2), &[8, 9, 10, 11]);
        assert_eq!(store.all_codes(), codes.as_slice());
        assert_eq!(store.iter().count(), 3);
    }

    #[test]
    fn out_of_bounds_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codes.bin");
        write_codes_file(&path, 2, 2, &[1, 2, 3, 4]);

        let store = CodeStore::open(&path).unwrap();
        assert!(matches!(
            store.try_codes(2),
            Err(StoreError::IndexOutOfBounds { index: 2, count: 2 })
        ));
    }

    #[test]
    fn truncated_codes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codes.bin");
        // Header claims 100 rows of 4 codes but no payload follows.
        write_codes_file(&path, 100, 4, &[]);

        assert!(matches!(
            CodeStore::open(&path),
            Err(StoreError::Truncated { .. })
        ));
    }
}
