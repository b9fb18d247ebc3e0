//! Tessera – Product Quantization compression core for disk-resident ANN search
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Pivot Trainer (k-means++ · Lloyd · OPQ/SVD)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │   ChunkedPqTable (ADC tables · scalar distances · inflate)  │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Base Encoder (block stream) │  CodeStore (mmap zero-copy)  │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │       AlignedFileReader (O_DIRECT + Linux AIO batches)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Build time: a training sample goes through [`training::generate_pq_pivots`]
//! (or the OPQ variant) to produce a pivots file, then the full base file is
//! streamed through [`encode::compress_base`] to produce the compressed-codes
//! file. Query time: [`ChunkedPqTable`] preprocesses the query and builds a
//! per-chunk distance table; [`pq::pq_dist_lookup`] folds that table over code
//! rows fetched from a [`CodeStore`] or read from disk with the aligned reader.

pub mod encode;
pub mod format;
pub mod pq;
pub mod simd;
pub mod store;
pub mod training;

#[cfg(target_os = "linux")]
pub mod reader;

pub use encode::{compress_base, EncodeOptions};
pub use pq::{pq_dist_lookup, ChunkedPqTable, NUM_CENTROIDS};
pub use store::CodeStore;
pub use training::{generate_opq_pivots, generate_pq_pivots, TrainOutcome, TrainingConfig};

#[cfg(target_os = "linux")]
pub use reader::{AlignedBuf, AlignedFileReader, AlignedRead};
