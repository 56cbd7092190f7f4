//! Gaussian splat data pipeline: PLY decoding, canonical 32-byte rows,
//! streaming ingest into quantized GPU texture buffers, and a background
//! depth sorter with a request/response protocol for render targets.

pub mod common;
pub mod error;
mod ingest;
mod pack;
mod pipeline;
mod ply;
mod sort;
mod structures;

pub use error::SplatError;
pub use ingest::IngestEvent;
pub use pack::QuantizedStore;
pub use pipeline::{
    wait_for_textures, PipelineConfig, SplatPipeline, SplatTarget, TextureProbe,
};
pub use ply::decode as decode_ply;
pub use sort::{sort_splats, SortResult, Sorter};
pub use structures::{
    rows_from_bytes, rows_to_bytes, SortKey, SplatRow, TransformBatch, UploadRect, ROW_LENGTH,
};
