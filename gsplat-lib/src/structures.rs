use std::sync::atomic::{AtomicU64, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Byte length of one canonical splat row: position + scale + RGBA + quaternion.
pub const ROW_LENGTH: usize = 3 * 4 + 3 * 4 + 4 + 4;

/// The canonical 32-byte per-splat exchange format, shared by the native
/// binary stream and the PLY converter.
///
/// `scale` is linear (already exponentiated), `rotation` is a quaternion with
/// each component packed as `round(c * 128) + 128`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SplatRow {
    pub position: [f32; 3],
    pub scale: [f32; 3],
    pub color: [u8; 4],
    pub rotation: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<SplatRow>() == ROW_LENGTH);

/// Decodes every whole 32-byte row in `bytes`; a trailing partial row is ignored.
pub fn rows_from_bytes(bytes: &[u8]) -> Vec<SplatRow> {
    let mut rows = Vec::with_capacity(bytes.len() / ROW_LENGTH);
    for chunk in bytes.chunks_exact(ROW_LENGTH) {
        let mut raw = [0u8; ROW_LENGTH];
        raw.copy_from_slice(chunk);
        rows.push(zerocopy::transmute!(raw));
    }
    rows
}

pub fn rows_to_bytes(rows: &[SplatRow]) -> Vec<u8> {
    rows.as_bytes().to_vec()
}

/// One flattened 4x4 matrix per splat, produced by the packer and moved into
/// the sort worker. The upper-left 3x3 block holds the covariance basis,
/// elements 12-14 the center, and element 15 the visibility weight
/// `max(scale) * alpha / 255`.
#[derive(Debug, Default)]
pub struct TransformBatch {
    matrices: Vec<f32>,
}

impl TransformBatch {
    pub(crate) fn new(matrices: Vec<f32>) -> Self {
        debug_assert!(matrices.len() % 16 == 0);
        Self { matrices }
    }

    pub fn splat_count(&self) -> usize {
        self.matrices.len() / 16
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    pub fn matrices(&self) -> &[f32] {
        &self.matrices
    }

    pub fn into_matrices(self) -> Vec<f32> {
        self.matrices
    }
}

/// An axis-aligned sub-region of the 2D-tiled texture buffers, covering one
/// freshly packed run of splats. `splat_offset` is the index of the first
/// splat in the rectangle; the renderer uploads `width * height` splats worth
/// of texels starting there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub splat_offset: u32,
}

/// Identifies one rendered target so a shared sort worker can serve several
/// concurrently connected objects without cross-talk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortKey(u64);

impl SortKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        SortKey(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_roundtrip_preserves_layout() {
        let row = SplatRow {
            position: [1.0, 2.0, 3.0],
            scale: [0.5, 0.25, 0.125],
            color: [10, 20, 30, 255],
            rotation: [255, 0, 0, 0],
        };
        let bytes = rows_to_bytes(&[row]);
        assert_eq!(bytes.len(), ROW_LENGTH);
        assert_eq!(rows_from_bytes(&bytes), vec![row]);
    }

    #[test]
    fn partial_trailing_row_is_ignored() {
        let rows = vec![SplatRow::default(); 3];
        let mut bytes = rows_to_bytes(&rows);
        bytes.extend_from_slice(&[0xAB; 17]);
        assert_eq!(rows_from_bytes(&bytes).len(), 3);
    }

    #[test]
    fn sort_keys_are_unique() {
        let a = SortKey::next();
        let b = SortKey::next();
        assert_ne!(a, b);
    }
}
