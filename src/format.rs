//! Binary section format shared by the pivots, base-vector and code files
//!
//! Every on-disk matrix is framed as a *section*:
//!
//! ```text
//! Offset   Size        Type     Description
//! ─────────────────────────────────────────────
//! 0x00     8           u64 LE   rows
//! 0x08     8           u64 LE   cols
//! 0x10     rows*cols*  [T]      payload, row-major, Little Endian
//!          size_of::<T>()
//! ```
//!
//! A pivots file is a set of sections placed at explicit offsets, located by
//! an offset table that is itself a u64 section written at offset 0. The
//! first [`METADATA_SIZE`] bytes are reserved for that table. Base-vector and
//! compressed-code files use a bare `[u32 N][u32 dims]` prefix instead (see
//! [`VecFileHeader`]).
//!
//! Shape validation happens at every load: a section whose `(rows, cols)`
//! disagree with what the caller expects is a fatal error naming the file,
//! never a silently reinterpreted buffer.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Bytes reserved at the head of a pivots file for the offset table.
pub const METADATA_SIZE: u64 = 4096;

/// Size of the `[rows][cols]` section prefix.
pub const SECTION_HEADER_SIZE: u64 = 16;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "{}: bad shape for {section}: expected {expected_rows} x {expected_cols}, \
         file has {rows} x {cols}",
        path.display()
    )]
    ShapeMismatch {
        path: PathBuf,
        section: &'static str,
        expected_rows: u64,
        expected_cols: u64,
        rows: u64,
        cols: u64,
    },

    #[error(
        "{}: truncated section at offset {offset}: expected {expected} payload bytes",
        path.display()
    )]
    Truncated {
        path: PathBuf,
        offset: u64,
        expected: usize,
    },

    #[error(
        "{}: offset table holds {count} entries, expected 4 (or 5 for legacy files)",
        path.display()
    )]
    OffsetCount { path: PathBuf, count: u64 },
}

fn io_err(path: &Path, source: io::Error) -> FormatError {
    FormatError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a section of `T` starting at `offset`. Returns `(payload, rows, cols)`.
pub fn load_bin<T: Pod>(path: &Path, offset: u64) -> Result<(Vec<T>, u64, u64), FormatError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| io_err(path, e))?;

    let mut header = [0u8; SECTION_HEADER_SIZE as usize];
    file.read_exact(&mut header).map_err(|e| io_err(path, e))?;
    let rows = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let cols = u64::from_le_bytes(header[8..16].try_into().unwrap());

    let count = (rows as usize)
        .checked_mul(cols as usize)
        .expect("section element count overflows usize");
    let mut payload = vec![T::zeroed(); count];
    file.read_exact(bytemuck::cast_slice_mut(&mut payload))
        .map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FormatError::Truncated {
                    path: path.to_path_buf(),
                    offset,
                    expected: count * std::mem::size_of::<T>(),
                }
            } else {
                io_err(path, e)
            }
        })?;

    Ok((payload, rows, cols))
}

/// Write a section of `T` at `offset`, creating the file if needed.
///
/// Returns the number of bytes written (header plus payload) so callers can
/// accumulate section offsets.
pub fn save_bin<T: Pod>(
    path: &Path,
    data: &[T],
    rows: u64,
    cols: u64,
    offset: u64,
) -> Result<u64, FormatError> {
    debug_assert_eq!(data.len() as u64, rows * cols);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| io_err(path, e))?;

    file.write_all(&rows.to_le_bytes())
        .and_then(|_| file.write_all(&cols.to_le_bytes()))
        .and_then(|_| file.write_all(bytemuck::cast_slice(data)))
        .map_err(|e| io_err(path, e))?;

    Ok(SECTION_HEADER_SIZE + (data.len() * std::mem::size_of::<T>()) as u64)
}

/// Fail unless a loaded section has exactly the expected shape.
pub fn check_shape(
    path: &Path,
    section: &'static str,
    (rows, cols): (u64, u64),
    (expected_rows, expected_cols): (u64, u64),
) -> Result<(), FormatError> {
    if rows != expected_rows || cols != expected_cols {
        return Err(FormatError::ShapeMismatch {
            path: path.to_path_buf(),
            section,
            expected_rows,
            expected_cols,
            rows,
            cols,
        });
    }
    Ok(())
}

/// `[u32 count][u32 dims]` prefix of base-vector and compressed-code files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VecFileHeader {
    pub npts: u32,
    pub ndims: u32,
}

impl VecFileHeader {
    pub const SIZE: usize = 8;

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;
        Ok(Self::from_bytes(&buf).expect("8 bytes read"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            npts: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            ndims: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.npts.to_le_bytes())?;
        writer.write_all(&self.ndims.to_le_bytes())
    }
}

/// Path of the rotation matrix that rides alongside an OPQ pivots file.
pub fn rotation_path(pivots_path: &Path) -> PathBuf {
    let mut name = pivots_path.as_os_str().to_os_string();
    name.push("_rotation_matrix.bin");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn section_roundtrip_f32() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sec.bin");

        let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
        let written = save_bin(&path, &data, 3, 4, 0).unwrap();
        assert_eq!(written, 16 + 12 * 4);

        let (loaded, rows, cols) = load_bin::<f32>(&path, 0).unwrap();
        assert_eq!((rows, cols), (3, 4));
        assert_eq!(loaded, data);
    }

    #[test]
    fn sections_at_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multi.bin");

        let floats = vec![1.0f32, 2.0, 3.0];
        let ints = vec![7u32, 8, 9, 10];
        let first = save_bin(&path, &floats, 3, 1, METADATA_SIZE).unwrap();
        save_bin(&path, &ints, 4, 1, METADATA_SIZE + first).unwrap();
        let offsets = vec![METADATA_SIZE, METADATA_SIZE + first];
        save_bin(&path, &offsets, 2, 1, 0).unwrap();

        let (table, _, _) = load_bin::<u64>(&path, 0).unwrap();
        let (f, _, _) = load_bin::<f32>(&path, table[0]).unwrap();
        let (i, _, _) = load_bin::<u32>(&path, table[1]).unwrap();
        assert_eq!(f, floats);
        assert_eq!(i, ints);
    }

    #[test]
    fn truncated_section_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.bin");

        // Header claims 100 floats but only 2 follow.
        let mut file = File::create(&path).unwrap();
        file.write_all(&100u64.to_le_bytes()).unwrap();
        file.write_all(&1u64.to_le_bytes()).unwrap();
        file.write_all(&1.0f32.to_le_bytes()).unwrap();
        file.write_all(&2.0f32.to_le_bytes()).unwrap();
        drop(file);

        let err = load_bin::<f32>(&path, 0).unwrap_err();
        assert!(matches!(err, FormatError::Truncated { .. }));
    }

    #[test]
    fn shape_check_names_file_and_shapes() {
        let err = check_shape(Path::new("pivots.bin"), "pivots", (8, 8), (256, 8)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("pivots.bin"));
        assert!(msg.contains("256 x 8"));
        assert!(msg.contains("8 x 8"));
    }

    #[test]
    fn vec_header_roundtrip() {
        let header = VecFileHeader {
            npts: 1024,
            ndims: 96,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(VecFileHeader::from_bytes(&buf), Some(header));
    }

    #[test]
    fn rotation_sibling_name() {
        let p = rotation_path(Path::new("/idx/pq_pivots.bin"));
        assert_eq!(p, Path::new("/idx/pq_pivots.bin_rotation_matrix.bin"));
    }
}
