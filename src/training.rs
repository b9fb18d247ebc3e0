//! Pivot training for PQ and OPQ codebooks
//!
//! Given a training sample, the trainer partitions the coordinate space into
//! chunks of near-equal width, runs seeded k-means (k-means++ initialisation,
//! Lloyd refinement) inside each chunk, and persists the pivot bundle in the
//! sectioned format `ChunkedPqTable` loads.
//!
//! The OPQ variant wraps the same per-chunk k-means in an alternating
//! optimisation: rotate the sample, refit the pivots, quantise, then refresh
//! the rotation from the SVD of the cross-correlation between the original
//! and quantised data (`R_T ← U·Vᵀ`).
//!
//! Training is deterministic for a fixed sample and seed. Assignment loops
//! are row-parallel; the update and persistence steps are sequential.

use std::path::Path;

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use crate::format::{self, FormatError, METADATA_SIZE};
use crate::pq::NUM_CENTROIDS;
use crate::simd;

/// Outer alternating-optimisation rounds for OPQ.
pub const MAX_OPQ_ROUNDS: usize = 20;

/// Lloyd iterations per chunk inside each OPQ round (warm-started after the
/// first round).
const OPQ_LLOYD_ITERS: usize = 8;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("number of chunks {num_chunks} exceeds dimension {dim} (or is zero)")]
    BadChunkCount { num_chunks: usize, dim: usize },

    #[error("training sample holds {len} floats, expected {expected} ({num_train} x {dim})")]
    BadTrainingShape {
        len: usize,
        expected: usize,
        num_train: usize,
        dim: usize,
    },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("SVD failed to converge in OPQ round {round}")]
    SvdFailed { round: usize },
}

/// Result of a pivot-generation call. `AlreadyExists` is the idempotence
/// hit: a matching pivots file was found and left untouched. Callers treat
/// both variants as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Trained,
    AlreadyExists,
}

/// Configuration for pivot training.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of chunks `M` the coordinate space is partitioned into.
    pub num_chunks: usize,

    /// Maximum Lloyd iterations per chunk for plain PQ training.
    pub max_kmeans_reps: usize,

    /// Center the training sample before clustering (L2 indexes). Must be
    /// `false` for inner-product indexes: translation does not preserve
    /// inner products, and the all-zero centroid is what marks IP mode.
    pub make_zero_mean: bool,

    /// Base seed for k-means++ selection.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_chunks: 16,
            max_kmeans_reps: 12,
            make_zero_mean: true,
            seed: 42,
        }
    }
}

/// Train PQ pivots on `num_train x dim` samples and persist them.
///
/// The caller's buffer is never mutated; centering happens on a private
/// copy. If a pivots file with the same `(K, D)` shape already exists at
/// `pivots_path`, nothing is written and `AlreadyExists` is returned.
pub fn generate_pq_pivots(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    config: &TrainingConfig,
    pivots_path: &Path,
) -> Result<TrainOutcome, TrainingError> {
    validate_input(train_data, num_train, dim, config)?;
    if pivots_exist_with_shape(pivots_path, dim) {
        tracing::info!(path = %pivots_path.display(), "PQ pivot file exists, not generating again");
        return Ok(TrainOutcome::AlreadyExists);
    }

    let (centroid, centered) = center_training_data(train_data, num_train, dim, config.make_zero_mean);
    let chunk_offsets = partition_dims(dim, config.num_chunks);

    let mut full_pivots = vec![0.0f32; NUM_CENTROIDS * dim];
    for chunk in 0..config.num_chunks {
        let start = chunk_offsets[chunk] as usize;
        let end = chunk_offsets[chunk + 1] as usize;
        let width = end - start;
        if width == 0 {
            continue;
        }
        tracing::debug!(chunk, start, end, "training chunk");

        let cur_data = gather_chunk(&centered, num_train, dim, start, width);
        let mut cur_pivots = vec![0.0f32; NUM_CENTROIDS * width];
        let mut rng = StdRng::seed_from_u64(config.seed + chunk as u64);
        kmeanspp_selecting_pivots(&cur_data, num_train, width, &mut cur_pivots, &mut rng);

        let mut closest = vec![0u32; num_train];
        run_lloyds(
            &cur_data,
            num_train,
            width,
            &mut cur_pivots,
            config.max_kmeans_reps,
            &mut closest,
        );

        scatter_chunk_pivots(&mut full_pivots, &cur_pivots, dim, start, width);
    }

    persist_pivots(pivots_path, &full_pivots, &centroid, &chunk_offsets)?;
    Ok(TrainOutcome::Trained)
}

/// Train OPQ pivots: the PQ pipeline above wrapped in [`MAX_OPQ_ROUNDS`]
/// rotation/refit rounds. Persists the pivot bundle plus the learned
/// rotation in a `<path>_rotation_matrix.bin` sibling.
pub fn generate_opq_pivots(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    config: &TrainingConfig,
    pivots_path: &Path,
) -> Result<TrainOutcome, TrainingError> {
    validate_input(train_data, num_train, dim, config)?;
    if pivots_exist_with_shape(pivots_path, dim) {
        tracing::info!(path = %pivots_path.display(), "OPQ pivot file exists, not generating again");
        return Ok(TrainOutcome::AlreadyExists);
    }

    let (centroid, centered) = center_training_data(train_data, num_train, dim, config.make_zero_mean);
    let chunk_offsets = partition_dims(dim, config.num_chunks);

    let train_mat = DMatrix::from_row_slice(num_train, dim, &centered);
    let mut rotation = DMatrix::<f32>::identity(dim, dim);
    let mut full_pivots = vec![0.0f32; NUM_CENTROIDS * dim];
    let mut quantized = vec![0.0f32; num_train * dim];

    for round in 0..MAX_OPQ_ROUNDS {
        let rotated = &train_mat * &rotation;
        let rotated_rm = row_major(&rotated);

        for chunk in 0..config.num_chunks {
            let start = chunk_offsets[chunk] as usize;
            let end = chunk_offsets[chunk + 1] as usize;
            let width = end - start;
            if width == 0 {
                continue;
            }

            let cur_data = gather_chunk(&rotated_rm, num_train, dim, start, width);
            let mut cur_pivots = vec![0.0f32; NUM_CENTROIDS * width];
            if round == 0 {
                let mut rng = StdRng::seed_from_u64(config.seed + chunk as u64);
                kmeanspp_selecting_pivots(&cur_data, num_train, width, &mut cur_pivots, &mut rng);
            } else {
                // Warm start from the previous round's pivots.
                for c in 0..NUM_CENTROIDS {
                    cur_pivots[c * width..(c + 1) * width]
                        .copy_from_slice(&full_pivots[c * dim + start..c * dim + end]);
                }
            }

            let mut closest = vec![0u32; num_train];
            run_lloyds(
                &cur_data,
                num_train,
                width,
                &mut cur_pivots,
                OPQ_LLOYD_ITERS,
                &mut closest,
            );

            scatter_chunk_pivots(&mut full_pivots, &cur_pivots, dim, start, width);

            quantized
                .par_chunks_mut(dim)
                .enumerate()
                .for_each(|(j, row)| {
                    let c = closest[j] as usize;
                    row[start..end].copy_from_slice(&cur_pivots[c * width..(c + 1) * width]);
                });
        }

        // Refresh the rotation from the cross-correlation of the original
        // and quantised data: C = Xᵀ·X̂, then R_T = U·Vᵀ.
        let xhat = DMatrix::from_row_slice(num_train, dim, &quantized);
        let correlation = train_mat.transpose() * &xhat;
        let svd = correlation
            .try_svd(true, true, f32::EPSILON, 1_000)
            .ok_or(TrainingError::SvdFailed { round })?;
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Err(TrainingError::SvdFailed { round }),
        };
        rotation = u * v_t;
        tracing::debug!(round, "OPQ round complete");
    }

    persist_pivots(pivots_path, &full_pivots, &centroid, &chunk_offsets)?;

    let rotation_rm = row_major(&rotation);
    format::save_bin(
        &format::rotation_path(pivots_path),
        &rotation_rm,
        dim as u64,
        dim as u64,
        0,
    )?;
    Ok(TrainOutcome::Trained)
}

fn validate_input(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    config: &TrainingConfig,
) -> Result<(), TrainingError> {
    if config.num_chunks == 0 || config.num_chunks > dim {
        return Err(TrainingError::BadChunkCount {
            num_chunks: config.num_chunks,
            dim,
        });
    }
    if num_train == 0 || train_data.len() != num_train * dim {
        return Err(TrainingError::BadTrainingShape {
            len: train_data.len(),
            expected: num_train * dim,
            num_train,
            dim,
        });
    }
    Ok(())
}

fn pivots_exist_with_shape(path: &Path, dim: usize) -> bool {
    if !path.exists() {
        return false;
    }
    match format::load_bin::<f32>(path, METADATA_SIZE) {
        Ok((_, rows, cols)) => rows == NUM_CENTROIDS as u64 && cols == dim as u64,
        Err(_) => false,
    }
}

/// Column means (all zeros unless centering) and a private, possibly
/// centered, copy of the sample.
fn center_training_data(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    make_zero_mean: bool,
) -> (Vec<f32>, Vec<f32>) {
    let mut centroid = vec![0.0f32; dim];
    let mut centered = train_data.to_vec();
    if make_zero_mean {
        for row in train_data.chunks_exact(dim) {
            for (acc, &v) in centroid.iter_mut().zip(row.iter()) {
                *acc += v;
            }
        }
        for c in centroid.iter_mut() {
            *c /= num_train as f32;
        }
        for row in centered.chunks_exact_mut(dim) {
            for (v, &c) in row.iter_mut().zip(centroid.iter()) {
                *v -= c;
            }
        }
    }
    (centroid, centered)
}

/// Balanced dimension-to-chunk assignment: chunk widths differ by at most
/// one, with the wider chunks first.
///
/// The original greedy pass keyed bins by a load value that no code path
/// ever updated, so its arg-min reduces to "lowest-indexed chunk with
/// room" — which is what this implements directly. The instantaneous
/// capacity starts at `ceil(D/M)` and drops to `floor(D/M)` once enough
/// chunks have filled to the high mark.
fn partition_dims(dim: usize, num_chunks: usize) -> Vec<u32> {
    let low = dim / num_chunks;
    let high = dim.div_ceil(num_chunks);
    let max_num_high = dim - low * num_chunks;

    let mut sizes = vec![0usize; num_chunks];
    let mut num_high = 0usize;
    let mut cap = high;
    for _ in 0..dim {
        let bin = sizes
            .iter()
            .position(|&s| s < cap)
            .expect("capacity accounts for every dimension");
        sizes[bin] += 1;
        if sizes[bin] == high {
            num_high += 1;
            if num_high == max_num_high {
                cap = low;
            }
        }
    }

    let mut offsets = Vec::with_capacity(num_chunks + 1);
    offsets.push(0u32);
    for m in 0..num_chunks {
        offsets.push(offsets[m] + sizes[m] as u32);
    }
    offsets
}

/// Row-major copy of a (column-major) nalgebra matrix.
pub(crate) fn row_major(m: &DMatrix<f32>) -> Vec<f32> {
    m.transpose().as_slice().to_vec()
}

/// Copy one chunk's columns into a contiguous `num_train x width` buffer.
fn gather_chunk(data: &[f32], num_train: usize, dim: usize, start: usize, width: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; num_train * width];
    out.par_chunks_mut(width).enumerate().for_each(|(j, dst)| {
        dst.copy_from_slice(&data[j * dim + start..j * dim + start + width]);
    });
    out
}

fn scatter_chunk_pivots(
    full_pivots: &mut [f32],
    cur_pivots: &[f32],
    dim: usize,
    start: usize,
    width: usize,
) {
    for c in 0..NUM_CENTROIDS {
        full_pivots[c * dim + start..c * dim + start + width]
            .copy_from_slice(&cur_pivots[c * width..(c + 1) * width]);
    }
}

/// Nearest-centroid assignment for every row, row-parallel. Ties break to
/// the smallest centroid index.
pub(crate) fn compute_closest_centers(
    data: &[f32],
    dim: usize,
    pivots: &[f32],
    num_centers: usize,
    closest: &mut [u32],
) {
    data.par_chunks(dim)
        .zip(closest.par_iter_mut())
        .for_each(|(row, slot)| {
            let mut best = 0u32;
            let mut best_dist = f32::MAX;
            for c in 0..num_centers {
                let dist = simd::l2_distance_squared(row, &pivots[c * dim..(c + 1) * dim]);
                if dist < best_dist {
                    best_dist = dist;
                    best = c as u32;
                }
            }
            *slot = best;
        });
}

/// k-means++ seeding: the first pivot is a seeded uniform pick, each later
/// pivot is drawn with probability proportional to its squared distance
/// from the pivots chosen so far.
///
/// Samples smaller than the codebook fall back to cycling the rows so the
/// pivot matrix always holds [`NUM_CENTROIDS`] entries.
fn kmeanspp_selecting_pivots(
    data: &[f32],
    num_train: usize,
    dim: usize,
    pivots: &mut [f32],
    rng: &mut StdRng,
) {
    debug_assert_eq!(pivots.len(), NUM_CENTROIDS * dim);
    if num_train <= NUM_CENTROIDS {
        for c in 0..NUM_CENTROIDS {
            let src = (c % num_train) * dim;
            pivots[c * dim..(c + 1) * dim].copy_from_slice(&data[src..src + dim]);
        }
        return;
    }

    let first = rng.gen_range(0..num_train);
    pivots[0..dim].copy_from_slice(&data[first * dim..(first + 1) * dim]);

    let mut min_dists = vec![f32::MAX; num_train];
    let mut last_pivot = vec![0.0f32; dim];
    for c in 1..NUM_CENTROIDS {
        last_pivot.copy_from_slice(&pivots[(c - 1) * dim..c * dim]);
        min_dists
            .par_iter_mut()
            .zip(data.par_chunks(dim))
            .for_each(|(best, row)| {
                let d = simd::l2_distance_squared(row, &last_pivot);
                if d < *best {
                    *best = d;
                }
            });

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            // Every point coincides with a pivot already.
            rng.gen_range(0..num_train)
        } else {
            let threshold: f64 = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut pick = num_train - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    pick = i;
                    break;
                }
            }
            pick
        };
        pivots[c * dim..(c + 1) * dim].copy_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }
}

/// Lloyd refinement for up to `max_reps` iterations, stopping early once
/// assignments are stable. On return `closest` holds the assignment against
/// the final pivots.
fn run_lloyds(
    data: &[f32],
    num_train: usize,
    dim: usize,
    pivots: &mut [f32],
    max_reps: usize,
    closest: &mut [u32],
) {
    let num_centers = NUM_CENTROIDS;
    let mut prev: Option<Vec<u32>> = None;

    for rep in 0..max_reps {
        compute_closest_centers(data, dim, pivots, num_centers, closest);
        if prev.as_deref() == Some(&closest[..]) {
            tracing::debug!(rep, "k-means assignments stable");
            break;
        }
        prev = Some(closest.to_vec());

        let mut sums = vec![0.0f32; num_centers * dim];
        let mut counts = vec![0usize; num_centers];
        for (row, &c) in data.chunks_exact(dim).zip(closest.iter()) {
            let c = c as usize;
            counts[c] += 1;
            for (acc, &v) in sums[c * dim..(c + 1) * dim].iter_mut().zip(row.iter()) {
                *acc += v;
            }
        }
        for c in 0..num_centers {
            if counts[c] > 0 {
                let inv = 1.0 / counts[c] as f32;
                for v in sums[c * dim..(c + 1) * dim].iter_mut() {
                    *v *= inv;
                }
            } else {
                // Dead centroid: reseed deterministically from the sample.
                let src = (c % num_train) * dim;
                sums[c * dim..(c + 1) * dim].copy_from_slice(&data[src..src + dim]);
            }
        }
        pivots.copy_from_slice(&sums);
    }

    compute_closest_centers(data, dim, pivots, num_centers, closest);
}

fn persist_pivots(
    path: &Path,
    full_pivots: &[f32],
    centroid: &[f32],
    chunk_offsets: &[u32],
) -> Result<(), TrainingError> {
    let dim = centroid.len() as u64;
    let mut cumul = [0u64; 4];
    cumul[0] = METADATA_SIZE;
    cumul[1] = cumul[0]
        + format::save_bin(path, full_pivots, NUM_CENTROIDS as u64, dim, cumul[0])?;
    cumul[2] = cumul[1] + format::save_bin(path, centroid, dim, 1, cumul[1])?;
    cumul[3] = cumul[2]
        + format::save_bin(path, chunk_offsets, chunk_offsets.len() as u64, 1, cumul[2])?;
    format::save_bin(path, &cumul, cumul.len() as u64, 1, 0)?;

    tracing::info!(path = %path.display(), bytes = cumul[3], "saved pivot data");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pq::ChunkedPqTable;
    use tempfile::tempdir;

    fn sin_sample(num_train: usize, dim: usize) -> Vec<f32> {
        (0..num_train * dim)
            .map(|i| {
                let (row, col) = (i / dim, i % dim);
                ((row + col) as f32).sin()
            })
            .collect()
    }

    #[test]
    fn partition_is_balanced() {
        for (dim, chunks) in [(4, 2), (8, 4), (10, 4), (96, 16), (13, 5), (3, 3)] {
            let offsets = partition_dims(dim, chunks);
            assert_eq!(offsets.len(), chunks + 1);
            assert_eq!(offsets[0], 0);
            assert_eq!(*offsets.last().unwrap() as usize, dim);
            let low = (dim / chunks) as u32;
            let high = dim.div_ceil(chunks) as u32;
            let mut num_high = 0;
            for w in offsets.windows(2) {
                let width = w[1] - w[0];
                assert!(width == low || width == high, "dim {} chunks {}", dim, chunks);
                if width == high && high != low {
                    num_high += 1;
                }
            }
            assert_eq!(num_high as usize, dim - (dim / chunks) * chunks);
        }
    }

    #[test]
    fn partition_four_dims_two_chunks() {
        assert_eq!(partition_dims(4, 2), vec![0, 2, 4]);
    }

    #[test]
    fn identity_matrix_training_centers_at_quarter() {
        // 4 rows of I₄, M = 2, zero-mean on.
        let mut train = vec![0.0f32; 16];
        for i in 0..4 {
            train[i * 4 + i] = 1.0;
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("pivots.bin");
        let config = TrainingConfig {
            num_chunks: 2,
            max_kmeans_reps: 5,
            make_zero_mean: true,
            seed: 42,
        };
        let before = train.clone();
        let outcome = generate_pq_pivots(&train, 4, 4, &config, &path).unwrap();
        assert_eq!(outcome, TrainOutcome::Trained);
        assert_eq!(train, before, "caller buffer must not be mutated");

        let table = ChunkedPqTable::load(&path, 2).unwrap();
        assert_eq!(table.chunk_offsets(), &[0, 2, 4]);
        for &c in table.centroid() {
            assert!((c - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn second_call_hits_idempotence() {
        let train = sin_sample(600, 8);
        let dir = tempdir().unwrap();
        let path = dir.path().join("pivots.bin");
        let config = TrainingConfig {
            num_chunks: 4,
            ..TrainingConfig::default()
        };

        assert_eq!(
            generate_pq_pivots(&train, 600, 8, &config, &path).unwrap(),
            TrainOutcome::Trained
        );
        assert_eq!(
            generate_pq_pivots(&train, 600, 8, &config, &path).unwrap(),
            TrainOutcome::AlreadyExists
        );
    }

    #[test]
    fn too_many_chunks_is_an_error() {
        let train = vec![0.0f32; 32];
        let dir = tempdir().unwrap();
        let path = dir.path().join("pivots.bin");
        let config = TrainingConfig {
            num_chunks: 9,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            generate_pq_pivots(&train, 4, 8, &config, &path),
            Err(TrainingError::BadChunkCount { num_chunks: 9, dim: 8 })
        ));
    }

    #[test]
    fn kmeans_recovers_separated_clusters() {
        // Three tight clusters around (0,0), (5,5), (10,0); k-means must put
        // pivots into all of them.
        let mut rng = StdRng::seed_from_u64(9);
        let mut data = Vec::new();
        for (cx, cy) in [(0.0f32, 0.0f32), (5.0, 5.0), (10.0, 0.0)] {
            for _ in 0..200 {
                data.push(cx + rng.gen::<f32>() * 0.1);
                data.push(cy + rng.gen::<f32>() * 0.1);
            }
        }
        let n = 600;

        let mut pivots = vec![0.0f32; NUM_CENTROIDS * 2];
        let mut seed_rng = StdRng::seed_from_u64(13);
        kmeanspp_selecting_pivots(&data, n, 2, &mut pivots, &mut seed_rng);
        let mut closest = vec![0u32; n];
        run_lloyds(&data, n, 2, &mut pivots, 10, &mut closest);

        let distortion: f32 = data
            .chunks_exact(2)
            .zip(closest.iter())
            .map(|(row, &c)| {
                simd::l2_distance_squared(row, &pivots[c as usize * 2..(c as usize + 1) * 2])
            })
            .sum::<f32>()
            / n as f32;
        assert!(distortion < 0.01, "distortion {}", distortion);
    }

    #[test]
    fn lloyd_iterations_do_not_increase_distortion() {
        let dim = 4;
        let n = 2000;
        let data = sin_sample(n, dim);

        let distortion_after = |reps: usize| {
            let mut pivots = vec![0.0f32; NUM_CENTROIDS * dim];
            let mut rng = StdRng::seed_from_u64(77);
            kmeanspp_selecting_pivots(&data, n, dim, &mut pivots, &mut rng);
            let mut closest = vec![0u32; n];
            run_lloyds(&data, n, dim, &mut pivots, reps, &mut closest);
            data.chunks_exact(dim)
                .zip(closest.iter())
                .map(|(row, &c)| {
                    simd::l2_distance_squared(
                        row,
                        &pivots[c as usize * dim..(c as usize + 1) * dim],
                    )
                })
                .sum::<f32>()
        };

        let one = distortion_after(1);
        let many = distortion_after(10);
        assert!(many <= one + 1e-3, "1 rep: {}, 10 reps: {}", one, many);
    }

    #[test]
    fn opq_rotation_stays_orthogonal() {
        let mut rng = StdRng::seed_from_u64(23);
        let n = 400;
        let dim = 2;
        let data: Vec<f32> = (0..n * dim).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();

        let dir = tempdir().unwrap();
        let path = dir.path().join("opq_pivots.bin");
        let config = TrainingConfig {
            num_chunks: 1,
            make_zero_mean: true,
            ..TrainingConfig::default()
        };
        assert_eq!(
            generate_opq_pivots(&data, n, dim, &config, &path).unwrap(),
            TrainOutcome::Trained
        );

        let (rot, rows, cols) =
            format::load_bin::<f32>(&format::rotation_path(&path), 0).unwrap();
        assert_eq!((rows, cols), (dim as u64, dim as u64));

        // R_T · R_Tᵀ ≈ I
        for i in 0..dim {
            for j in 0..dim {
                let mut acc = 0.0f32;
                for k in 0..dim {
                    acc += rot[i * dim + k] * rot[j * dim + k];
                }
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((acc - want).abs() < 1e-5, "({}, {}): {}", i, j, acc);
            }
        }

        // The bundle loads like any PQ table, with rotation attached.
        let table = ChunkedPqTable::load(&path, 1).unwrap();
        assert!(table.rotation().is_some());
    }
}
