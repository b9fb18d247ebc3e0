//! Chunked product-quantization codebook and ADC distance tables
//!
//! A trained codebook holds, for each of `M` chunks of the coordinate space,
//! 256 centroid sub-vectors. Distances between a query and a compressed code
//! decompose into per-chunk table lookups:
//!
//! ```text
//! Query → preprocess (center, rotate) → chunk table [M × 256]
//!                                         ↓
//! distance(query, code) = Σ_m table[m*256 + code[m]]
//! ```
//!
//! Two pivot layouts are kept in memory. The row layout `tables[c*D + d]` is
//! what the file stores and what decoding walks; the transposed layout
//! `tables_tr[d*256 + c]` keeps all 256 centroids of one dimension adjacent,
//! which is what the table-building inner loop wants.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::format::{self, FormatError};

/// Number of centroids per chunk. Codes are `u8`, so this is fixed.
pub const NUM_CENTROIDS: usize = 256;

#[derive(Error, Debug)]
pub enum PqError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("{}: chunk offsets are not a monotone partition of 0..{dim}", path.display())]
    BadChunkOffsets { path: PathBuf, dim: usize },

    #[error("inner-product tables require an uncentered codebook (centroid must be all zeros)")]
    CentroidNotZero,

    #[error("inflate is undefined for rotated (OPQ) codebooks")]
    RotationActive,
}

/// In-memory PQ codebook: pivots, chunk partition, global centroid, and an
/// optional OPQ rotation. Immutable after [`ChunkedPqTable::load`].
#[derive(Debug)]
pub struct ChunkedPqTable {
    ndims: usize,
    n_chunks: usize,
    /// Row layout: `tables[c * ndims + d]`, all chunks concatenated.
    tables: Vec<f32>,
    /// Transposed layout: `tables_tr[d * 256 + c]`.
    tables_tr: Vec<f32>,
    centroid: Vec<f32>,
    chunk_offsets: Vec<u32>,
    /// Row-major `D × D` rotation (`R_T`), present only for OPQ codebooks.
    rotation: Option<Vec<f32>>,
    zero_centroid: bool,
}

impl ChunkedPqTable {
    /// Load a codebook from a pivots file written by the trainer.
    ///
    /// `num_chunks = 0` means "infer the chunk count from the file"; any
    /// other value is validated against it. The legacy 5-offset header is
    /// accepted (its chunk-offset pointer sits at index 3 instead of 2). If a
    /// `<path>_rotation_matrix.bin` sibling exists it is loaded and queries
    /// will be rotated during preprocessing.
    pub fn load(path: &Path, num_chunks: usize) -> Result<Self, PqError> {
        let (offsets, nr, _nc) = format::load_bin::<u64>(path, 0)?;
        if nr != 4 && nr != 5 {
            return Err(FormatError::OffsetCount {
                path: path.to_path_buf(),
                count: nr,
            }
            .into());
        }
        let legacy = nr == 5;

        let (tables, nr, nc) = format::load_bin::<f32>(path, offsets[0])?;
        format::check_shape(path, "pivots", (nr, nc), (NUM_CENTROIDS as u64, nc))?;
        let ndims = nc as usize;

        let (centroid, nr, nc) = format::load_bin::<f32>(path, offsets[1])?;
        format::check_shape(path, "centroid", (nr, nc), (ndims as u64, 1))?;

        let chunk_offsets_index = if legacy { 3 } else { 2 };
        let (chunk_offsets, nr, nc) =
            format::load_bin::<u32>(path, offsets[chunk_offsets_index])?;
        let expected_rows = if num_chunks == 0 {
            nr
        } else {
            num_chunks as u64 + 1
        };
        format::check_shape(path, "chunk offsets", (nr, nc), (expected_rows, 1))?;
        if nr < 2 {
            return Err(PqError::BadChunkOffsets {
                path: path.to_path_buf(),
                dim: ndims,
            });
        }
        let n_chunks = nr as usize - 1;

        let partition_ok = chunk_offsets.first() == Some(&0)
            && chunk_offsets.last() == Some(&(ndims as u32))
            && chunk_offsets.windows(2).all(|w| w[0] <= w[1]);
        if !partition_ok {
            return Err(PqError::BadChunkOffsets {
                path: path.to_path_buf(),
                dim: ndims,
            });
        }

        let rotmat_path = format::rotation_path(path);
        let rotation = if rotmat_path.exists() {
            let (rot, nr, nc) = format::load_bin::<f32>(&rotmat_path, 0)?;
            format::check_shape(&rotmat_path, "rotation", (nr, nc), (ndims as u64, ndims as u64))?;
            Some(rot)
        } else {
            None
        };

        let mut tables_tr = vec![0.0f32; NUM_CENTROIDS * ndims];
        for c in 0..NUM_CENTROIDS {
            for d in 0..ndims {
                tables_tr[d * NUM_CENTROIDS + c] = tables[c * ndims + d];
            }
        }

        let zero_centroid = centroid.iter().all(|&v| v == 0.0);

        tracing::info!(
            path = %path.display(),
            centroids = NUM_CENTROIDS,
            dims = ndims,
            chunks = n_chunks,
            rotated = rotation.is_some(),
            "loaded PQ pivots"
        );

        Ok(Self {
            ndims,
            n_chunks,
            tables,
            tables_tr,
            centroid,
            chunk_offsets,
            rotation,
            zero_centroid,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.n_chunks
    }

    pub fn num_dims(&self) -> usize {
        self.ndims
    }

    /// Row-layout pivot matrix, `256 × D`.
    pub fn pivots(&self) -> &[f32] {
        &self.tables
    }

    pub fn centroid(&self) -> &[f32] {
        &self.centroid
    }

    pub fn chunk_offsets(&self) -> &[u32] {
        &self.chunk_offsets
    }

    pub fn rotation(&self) -> Option<&[f32]> {
        self.rotation.as_deref()
    }

    /// True when the codebook was trained without centering (IP mode).
    pub fn has_zero_centroid(&self) -> bool {
        self.zero_centroid
    }

    /// Shift and rotate a query into codebook space, in place.
    ///
    /// The centroid is subtracted only when non-zero (zero-mean codebooks);
    /// inner-product codebooks carry an all-zero centroid and pass through.
    pub fn preprocess_query(&self, query: &mut [f32]) {
        debug_assert_eq!(query.len(), self.ndims);
        if !self.zero_centroid {
            for (q, &c) in query.iter_mut().zip(self.centroid.iter()) {
                *q -= c;
            }
        }
        if let Some(rot) = &self.rotation {
            let d = self.ndims;
            let mut rotated = vec![0.0f32; d];
            for (d1, &q) in query.iter().enumerate() {
                let row = &rot[d1 * d..(d1 + 1) * d];
                for (out, &r) in rotated.iter_mut().zip(row.iter()) {
                    *out += q * r;
                }
            }
            query.copy_from_slice(&rotated);
        }
    }

    /// Fill `dist_vec` (`M × 256`) with per-chunk squared L2 distances from a
    /// preprocessed query to every centroid.
    ///
    /// The per-dimension difference is squared in f64 and accumulated as f32.
    pub fn populate_chunk_distances(&self, query: &[f32], dist_vec: &mut [f32]) {
        debug_assert_eq!(query.len(), self.ndims);
        debug_assert_eq!(dist_vec.len(), NUM_CENTROIDS * self.n_chunks);
        dist_vec.fill(0.0);

        for chunk in 0..self.n_chunks {
            let chunk_dists =
                &mut dist_vec[NUM_CENTROIDS * chunk..NUM_CENTROIDS * (chunk + 1)];
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let j = j as usize;
                let centers_dim = &self.tables_tr[NUM_CENTROIDS * j..NUM_CENTROIDS * (j + 1)];
                let q = query[j] as f64;
                for (slot, &center) in chunk_dists.iter_mut().zip(centers_dim.iter()) {
                    let diff = center as f64 - q;
                    *slot += (diff * diff) as f32;
                }
            }
        }
    }

    /// Fill `dist_vec` (`M × 256`) with *negated* per-chunk inner products so
    /// the caller can minimise. Requires an uncentered codebook.
    pub fn populate_chunk_inner_products(
        &self,
        query: &[f32],
        dist_vec: &mut [f32],
    ) -> Result<(), PqError> {
        if !self.zero_centroid {
            return Err(PqError::CentroidNotZero);
        }
        debug_assert_eq!(query.len(), self.ndims);
        debug_assert_eq!(dist_vec.len(), NUM_CENTROIDS * self.n_chunks);
        dist_vec.fill(0.0);

        for chunk in 0..self.n_chunks {
            let chunk_dists =
                &mut dist_vec[NUM_CENTROIDS * chunk..NUM_CENTROIDS * (chunk + 1)];
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let j = j as usize;
                let centers_dim = &self.tables_tr[NUM_CENTROIDS * j..NUM_CENTROIDS * (j + 1)];
                let q = query[j] as f64;
                for (slot, &center) in chunk_dists.iter_mut().zip(centers_dim.iter()) {
                    *slot -= (center as f64 * q) as f32;
                }
            }
        }
        Ok(())
    }

    /// Squared L2 distance from a preprocessed query to one compressed code.
    pub fn l2_distance(&self, query: &[f32], code: &[u8]) -> f32 {
        debug_assert_eq!(code.len(), self.n_chunks);
        let mut res = 0.0f32;
        for chunk in 0..self.n_chunks {
            let center = code[chunk] as usize;
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let j = j as usize;
                let diff = self.tables_tr[NUM_CENTROIDS * j + center] - query[j];
                res += diff * diff;
            }
        }
        res
    }

    /// Negated inner product from a preprocessed query to one compressed
    /// code. Meaningful only for uncentered codebooks.
    pub fn inner_product(&self, query: &[f32], code: &[u8]) -> f32 {
        debug_assert!(self.zero_centroid);
        debug_assert_eq!(code.len(), self.n_chunks);
        let mut res = 0.0f32;
        for chunk in 0..self.n_chunks {
            let center = code[chunk] as usize;
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let j = j as usize;
                res += self.tables_tr[NUM_CENTROIDS * j + center] * query[j];
            }
        }
        -res
    }

    /// Reconstruct a full vector from a code by copying the selected centroid
    /// coordinates and re-adding the global centroid.
    pub fn inflate_vector(&self, code: &[u8], out: &mut [f32]) -> Result<(), PqError> {
        if self.rotation.is_some() {
            return Err(PqError::RotationActive);
        }
        debug_assert_eq!(code.len(), self.n_chunks);
        debug_assert_eq!(out.len(), self.ndims);
        for chunk in 0..self.n_chunks {
            let center = code[chunk] as usize;
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let j = j as usize;
                out[j] = self.tables_tr[NUM_CENTROIDS * j + center] + self.centroid[j];
            }
        }
        Ok(())
    }
}

/// Fold a precomputed `M × 256` chunk table over `n_pts` packed code rows.
///
/// Iteration is chunk-major: one 1 KiB table row stays hot while every
/// point is visited.
pub fn pq_dist_lookup(
    codes: &[u8],
    n_pts: usize,
    n_chunks: usize,
    chunk_dists: &[f32],
    dists_out: &mut [f32],
) {
    debug_assert_eq!(codes.len(), n_pts * n_chunks);
    debug_assert_eq!(chunk_dists.len(), n_chunks * NUM_CENTROIDS);
    debug_assert_eq!(dists_out.len(), n_pts);

    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(dists_out.as_ptr() as *const i8);
        _mm_prefetch::<_MM_HINT_T0>(codes.as_ptr() as *const i8);
    }

    dists_out.fill(0.0);
    for chunk in 0..n_chunks {
        let row = &chunk_dists[NUM_CENTROIDS * chunk..NUM_CENTROIDS * (chunk + 1)];

        #[cfg(target_arch = "x86_64")]
        if chunk + 1 < n_chunks {
            unsafe {
                use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
                _mm_prefetch::<_MM_HINT_T0>(
                    chunk_dists.as_ptr().add(NUM_CENTROIDS * (chunk + 1)) as *const i8,
                );
            }
        }

        for idx in 0..n_pts {
            // Codes are u8 so the row index is always in bounds.
            unsafe {
                let center = *codes.get_unchecked(n_chunks * idx + chunk) as usize;
                *dists_out.get_unchecked_mut(idx) += *row.get_unchecked(center);
            }
        }
    }
}

/// Gather the code rows for `ids` into a contiguous scratch buffer, in id
/// order. The search driver uses this between graph traversal and
/// [`pq_dist_lookup`].
pub fn aggregate_codes(ids: &[u32], all_codes: &[u8], n_chunks: usize, out: &mut [u8]) {
    debug_assert_eq!(out.len(), ids.len() * n_chunks);
    for (i, &id) in ids.iter().enumerate() {
        let src = &all_codes[id as usize * n_chunks..(id as usize + 1) * n_chunks];
        out[i * n_chunks..(i + 1) * n_chunks].copy_from_slice(src);
    }
}
