//! Streaming base-vector compression
//!
//! Streams a `[u32 N][u32 D]` base file through a trained codebook in blocks
//! of at most [`BLOCK_ROWS`] rows, so a billion-vector file never has to fit
//! in memory. Per block: widen the raw elements to f32, subtract the global
//! centroid, rotate if the codebook is OPQ, then assign every row's chunks
//! to their nearest centroids and append the resulting `u8` codes to the
//! output file.
//!
//! Blocks are written strictly in order; inside a block the gather and
//! assignment loops are row-parallel but land results at row offsets, so the
//! output order always matches the input order.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytemuck::Zeroable;
use nalgebra::DMatrix;
use rayon::prelude::*;
use thiserror::Error;

use crate::format::{FormatError, VecFileHeader};
use crate::pq::{ChunkedPqTable, PqError, NUM_CENTROIDS};
use crate::training;

/// Maximum rows processed per block.
pub const BLOCK_ROWS: usize = 5_000_000;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error(transparent)]
    Pq(#[from] PqError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "{}: base file has dimension {file_dim}, pivots were trained on {table_dim}",
        data_file.display()
    )]
    DimensionMismatch {
        data_file: PathBuf,
        file_dim: usize,
        table_dim: usize,
    },

    #[error(
        "{}: OPQ encoding requested but no rotation matrix sibling was found",
        pivots.display()
    )]
    MissingRotation { pivots: PathBuf },
}

fn io_err(path: &Path, source: io::Error) -> EncodeError {
    EncodeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Raw element types a base file may hold.
pub trait PqElement: bytemuck::Pod + Send + Sync {
    fn widen(self) -> f32;
}

impl PqElement for f32 {
    #[inline]
    fn widen(self) -> f32 {
        self
    }
}

impl PqElement for i8 {
    #[inline]
    fn widen(self) -> f32 {
        self as f32
    }
}

impl PqElement for u8 {
    #[inline]
    fn widen(self) -> f32 {
        self as f32
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    /// Rotate each block with the codebook's rotation matrix before
    /// assignment. Requires the pivots file to have an OPQ rotation sibling.
    pub use_opq: bool,

    /// Also write the reconstructed f32 vectors to a `<codes>_inflated.bin`
    /// sibling, framed like a base file.
    pub save_inflated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeSummary {
    pub num_points: u32,
    pub num_chunks: u32,
}

/// Path of the reconstruction side-channel next to a codes file.
fn inflated_path(codes_path: &Path) -> PathBuf {
    let mut name = codes_path.as_os_str().to_os_string();
    name.push("_inflated.bin");
    PathBuf::from(name)
}

/// Compress every vector of `data_file` into `codes_path` using the pivots
/// at `pivots_path`.
///
/// On success the codes file holds exactly `N x M` centroid indices in
/// row-major `(vector, chunk)` order behind a `[u32 N][u32 M]` header.
pub fn compress_base<T: PqElement>(
    data_file: &Path,
    pivots_path: &Path,
    codes_path: &Path,
    num_chunks: usize,
    options: &EncodeOptions,
) -> Result<EncodeSummary, EncodeError> {
    let table = ChunkedPqTable::load(pivots_path, num_chunks)?;
    let dim = table.num_dims();
    let n_chunks = table.num_chunks();

    let mut reader =
        BufReader::new(File::open(data_file).map_err(|e| io_err(data_file, e))?);
    let header = VecFileHeader::read_from(&mut reader).map_err(|e| io_err(data_file, e))?;
    let num_points = header.npts as usize;
    if header.ndims as usize != dim {
        return Err(EncodeError::DimensionMismatch {
            data_file: data_file.to_path_buf(),
            file_dim: header.ndims as usize,
            table_dim: dim,
        });
    }

    let rotation = if options.use_opq {
        let rot = table.rotation().ok_or_else(|| EncodeError::MissingRotation {
            pivots: pivots_path.to_path_buf(),
        })?;
        Some(DMatrix::from_row_slice(dim, dim, rot))
    } else {
        None
    };

    let mut codes_writer =
        BufWriter::new(File::create(codes_path).map_err(|e| io_err(codes_path, e))?);
    VecFileHeader {
        npts: header.npts,
        ndims: n_chunks as u32,
    }
    .write_to(&mut codes_writer)
    .map_err(|e| io_err(codes_path, e))?;

    let mut inflated_writer = if options.save_inflated {
        let path = inflated_path(codes_path);
        let mut writer = BufWriter::new(File::create(&path).map_err(|e| io_err(&path, e))?);
        VecFileHeader {
            npts: header.npts,
            ndims: header.ndims,
        }
        .write_to(&mut writer)
        .map_err(|e| io_err(&path, e))?;
        Some((path, writer))
    } else {
        None
    };

    let centroid = table.centroid();
    let chunk_offsets = table.chunk_offsets();
    let block_rows = num_points.min(BLOCK_ROWS);
    let mut raw = vec![T::zeroed(); block_rows * dim];
    let mut block = vec![0.0f32; block_rows * dim];

    let mut start_id = 0usize;
    while start_id < num_points {
        let cur = (num_points - start_id).min(block_rows);
        let raw_block = &mut raw[..cur * dim];
        reader
            .read_exact(bytemuck::cast_slice_mut(raw_block))
            .map_err(|e| io_err(data_file, e))?;
        tracing::debug!(start = start_id, end = start_id + cur, "encoding block");

        let block_f = &mut block[..cur * dim];
        block_f
            .par_chunks_mut(dim)
            .zip(raw_block.par_chunks(dim))
            .for_each(|(dst, src)| {
                for d in 0..dim {
                    dst[d] = src[d].widen() - centroid[d];
                }
            });

        if let Some(rot) = &rotation {
            let rotated = DMatrix::from_row_slice(cur, dim, block_f) * rot;
            block_f.copy_from_slice(&training::row_major(&rotated));
        }

        let mut block_codes = vec![0u8; cur * n_chunks];
        let mut block_inflated = inflated_writer
            .is_some()
            .then(|| vec![0.0f32; cur * dim]);

        for chunk in 0..n_chunks {
            let start = chunk_offsets[chunk] as usize;
            let end = chunk_offsets[chunk + 1] as usize;
            let width = end - start;
            if width == 0 {
                continue;
            }

            let mut cur_data = vec![0.0f32; cur * width];
            cur_data
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(j, dst)| {
                    dst.copy_from_slice(&block_f[j * dim + start..j * dim + end]);
                });

            let pivots = table.pivots();
            let mut cur_pivots = vec![0.0f32; NUM_CENTROIDS * width];
            for c in 0..NUM_CENTROIDS {
                cur_pivots[c * width..(c + 1) * width]
                    .copy_from_slice(&pivots[c * dim + start..c * dim + end]);
            }

            let mut closest = vec![0u32; cur];
            training::compute_closest_centers(
                &cur_data,
                width,
                &cur_pivots,
                NUM_CENTROIDS,
                &mut closest,
            );

            block_codes
                .par_chunks_mut(n_chunks)
                .zip(closest.par_iter())
                .for_each(|(row, &c)| {
                    row[chunk] = c as u8;
                });

            if let Some(inflated) = block_inflated.as_mut() {
                inflated
                    .par_chunks_mut(dim)
                    .zip(closest.par_iter())
                    .for_each(|(row, &c)| {
                        let c = c as usize;
                        for k in 0..width {
                            row[start + k] = cur_pivots[c * width + k] + centroid[start + k];
                        }
                    });
            }
        }

        codes_writer
            .write_all(&block_codes)
            .map_err(|e| io_err(codes_path, e))?;
        if let (Some((path, writer)), Some(inflated)) =
            (inflated_writer.as_mut(), block_inflated.as_ref())
        {
            writer
                .write_all(bytemuck::cast_slice(inflated))
                .map_err(|e| io_err(path, e))?;
        }

        start_id += cur;
    }

    codes_writer.flush().map_err(|e| io_err(codes_path, e))?;
    if let Some((path, writer)) = inflated_writer.as_mut() {
        writer.flush().map_err(|e| io_err(path, e))?;
    }

    tracing::info!(
        data_file = %data_file.display(),
        codes = %codes_path.display(),
        points = num_points,
        chunks = n_chunks,
        "compressed base file"
    );

    Ok(EncodeSummary {
        num_points: header.npts,
        num_chunks: n_chunks as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CodeStore;
    use crate::training::{generate_pq_pivots, TrainOutcome, TrainingConfig};
    use tempfile::tempdir;

    fn write_base_file<T: PqElement>(path: &Path, npts: u32, ndims: u32, values: &[T]) {
        let mut writer = BufWriter::new(File::create(path).unwrap());
        VecFileHeader { npts, ndims }.write_to(&mut writer).unwrap();
        writer.write_all(bytemuck::cast_slice(values)).unwrap();
        writer.flush().unwrap();
    }

    fn sin_vectors(n: usize, dim: usize) -> Vec<f32> {
        (0..n * dim)
            .map(|i| {
                let (row, col) = (i / dim, i % dim);
                ((row + col) as f32).sin()
            })
            .collect()
    }

    #[test]
    fn end_to_end_sin_data() {
        let n = 1024;
        let dim = 8;
        let chunks = 4;
        let vectors = sin_vectors(n, dim);

        let dir = tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let pivots = dir.path().join("pivots.bin");
        let codes = dir.path().join("codes.bin");
        write_base_file(&base, n as u32, dim as u32, &vectors);

        let config = TrainingConfig {
            num_chunks: chunks,
            ..TrainingConfig::default()
        };
        assert_eq!(
            generate_pq_pivots(&vectors, n, dim, &config, &pivots).unwrap(),
            TrainOutcome::Trained
        );

        let summary = compress_base::<f32>(
            &base,
            &pivots,
            &codes,
            chunks,
            &EncodeOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.num_points, n as u32);
        assert_eq!(summary.num_chunks, chunks as u32);

        // [u32 N][u32 M] + N·M bytes of codes.
        let file_len = std::fs::metadata(&codes).unwrap().len();
        assert_eq!(file_len, (2 * 4 + n * chunks) as u64);

        // Decoding the codes must land near the original data.
        let table = ChunkedPqTable::load(&pivots, chunks).unwrap();
        let store = CodeStore::open(&codes).unwrap();
        assert_eq!(store.count(), n);

        let mut reconstructed = vec![0.0f32; dim];
        let mut sq_err = 0.0f64;
        for i in 0..n {
            table.inflate_vector(store.codes(i), &mut reconstructed).unwrap();
            for d in 0..dim {
                let diff = (vectors[i * dim + d] - reconstructed[d]) as f64;
                sq_err += diff * diff;
            }
        }
        let mse = sq_err / (n * dim) as f64;
        assert!(mse < 1e-2, "mse {}", mse);
    }

    #[test]
    fn inflated_side_channel_matches_decoder() {
        let n = 300;
        let dim = 8;
        let chunks = 2;
        let vectors = sin_vectors(n, dim);

        let dir = tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let pivots = dir.path().join("pivots.bin");
        let codes = dir.path().join("codes.bin");
        write_base_file(&base, n as u32, dim as u32, &vectors);

        let config = TrainingConfig {
            num_chunks: chunks,
            ..TrainingConfig::default()
        };
        generate_pq_pivots(&vectors, n, dim, &config, &pivots).unwrap();
        compress_base::<f32>(
            &base,
            &pivots,
            &codes,
            chunks,
            &EncodeOptions {
                use_opq: false,
                save_inflated: true,
            },
        )
        .unwrap();

        let inflated = inflated_path(&codes);
        let bytes = std::fs::read(&inflated).unwrap();
        let header = VecFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.npts, n as u32);
        assert_eq!(header.ndims, dim as u32);
        let payload: &[f32] = bytemuck::cast_slice(&bytes[VecFileHeader::SIZE..]);
        assert_eq!(payload.len(), n * dim);

        let table = ChunkedPqTable::load(&pivots, chunks).unwrap();
        let store = CodeStore::open(&codes).unwrap();
        let mut reconstructed = vec![0.0f32; dim];
        for i in 0..n {
            table.inflate_vector(store.codes(i), &mut reconstructed).unwrap();
            for d in 0..dim {
                assert!((payload[i * dim + d] - reconstructed[d]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn widens_u8_elements() {
        let n = 400;
        let dim = 4;
        let chunks = 2;
        let raw: Vec<u8> = (0..n * dim).map(|i| (i % 251) as u8).collect();
        let as_f32: Vec<f32> = raw.iter().map(|&v| v as f32).collect();

        let dir = tempdir().unwrap();
        let base = dir.path().join("base_u8.bin");
        let pivots = dir.path().join("pivots.bin");
        let codes = dir.path().join("codes.bin");
        write_base_file(&base, n as u32, dim as u32, &raw);

        let config = TrainingConfig {
            num_chunks: chunks,
            ..TrainingConfig::default()
        };
        generate_pq_pivots(&as_f32, n, dim, &config, &pivots).unwrap();
        let summary = compress_base::<u8>(
            &base,
            &pivots,
            &codes,
            chunks,
            &EncodeOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.num_points, n as u32);

        let store = CodeStore::open(&codes).unwrap();
        assert_eq!(store.count(), n);
        assert_eq!(store.num_chunks(), chunks);
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let n = 300;
        let vectors = sin_vectors(n, 8);

        let dir = tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let pivots = dir.path().join("pivots.bin");
        let codes = dir.path().join("codes.bin");
        // Base file claims 6 dimensions; pivots are trained on 8.
        write_base_file(&base, n as u32, 6, &vectors[..n * 6].to_vec());

        let config = TrainingConfig {
            num_chunks: 4,
            ..TrainingConfig::default()
        };
        generate_pq_pivots(&vectors, n, 8, &config, &pivots).unwrap();

        let err = compress_base::<f32>(
            &base,
            &pivots,
            &codes,
            4,
            &EncodeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::DimensionMismatch {
                file_dim: 6,
                table_dim: 8,
                ..
            }
        ));
    }

    #[test]
    fn opq_without_rotation_is_rejected() {
        let n = 300;
        let dim = 8;
        let vectors = sin_vectors(n, dim);

        let dir = tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let pivots = dir.path().join("pivots.bin");
        let codes = dir.path().join("codes.bin");
        write_base_file(&base, n as u32, dim as u32, &vectors);

        let config = TrainingConfig {
            num_chunks: 4,
            ..TrainingConfig::default()
        };
        generate_pq_pivots(&vectors, n, dim, &config, &pivots).unwrap();

        let err = compress_base::<f32>(
            &base,
            &pivots,
            &codes,
            4,
            &EncodeOptions {
                use_opq: true,
                save_inflated: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::MissingRotation { .. }));
    }
}
