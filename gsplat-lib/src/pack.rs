//! Packs canonical rows into the two GPU texture buffers and derives the
//! per-splat depth-sort transforms.

use glam::{Mat3, Mat4, Quat, Vec3, Vec4};

use crate::structures::{SplatRow, TransformBatch, UploadRect};

/// Quantization range for the covariance entries; the dequantization scale
/// stored per splat is `max|entry| / COV_SCALE`.
const COV_SCALE: f32 = 32767.0;

/// Per-source quantized storage, shaped for direct upload to two 2D textures.
///
/// `center_and_scale` is an RGBA float texture holding `(x, -y, z, pack_scale)`
/// per splat; `cov_and_color` is an RGBA32UI texture holding three packed int16
/// pairs (the six covariance entries) plus one RGBA8 color word. Both buffers
/// are allocated once from the vertex-count estimate and never reallocated;
/// growth only writes further into existing slots.
#[derive(Debug)]
pub struct QuantizedStore {
    center_and_scale: Vec<f32>,
    cov_and_color: Vec<u32>,
    texture_width: u32,
    texture_height: u32,
    loaded_vertex_count: u32,
}

impl QuantizedStore {
    pub fn new(estimated_vertex_count: usize, max_texture_size: u32) -> Self {
        let max_slots = max_texture_size as usize * max_texture_size as usize;
        if estimated_vertex_count > max_slots {
            log::warn!(
                "vertex count of splat was {} but has been limited to {} by texture restrictions",
                estimated_vertex_count,
                max_slots
            );
        }
        let count = estimated_vertex_count.min(max_slots).max(1) as u32;
        let texture_width = count.min(max_texture_size);
        let texture_height = (count - 1) / texture_width + 1;
        let elements = texture_width as usize * texture_height as usize * 4;

        Self {
            center_and_scale: vec![0.0; elements],
            cov_and_color: vec![0; elements],
            texture_width,
            texture_height,
            loaded_vertex_count: 0,
        }
    }

    pub fn texture_width(&self) -> u32 {
        self.texture_width
    }

    pub fn texture_height(&self) -> u32 {
        self.texture_height
    }

    /// Number of splat slots allocated in both buffers.
    pub fn capacity(&self) -> u32 {
        self.texture_width * self.texture_height
    }

    pub fn loaded_vertex_count(&self) -> u32 {
        self.loaded_vertex_count
    }

    pub fn center_and_scale(&self) -> &[f32] {
        &self.center_and_scale
    }

    pub fn cov_and_color(&self) -> &[u32] {
        &self.cov_and_color
    }

    /// Raw view of the float texture for upload APIs that take bytes.
    pub fn center_and_scale_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.center_and_scale)
    }

    pub fn cov_and_color_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cov_and_color)
    }

    /// Quantizes `rows` into the texture buffers and returns the depth-sort
    /// transforms plus the sub-regions the renderer must re-upload.
    ///
    /// Rows beyond the store's capacity are dropped with a warning; a push
    /// against a full store is a silent no-op.
    pub fn push_rows(&mut self, rows: &[SplatRow]) -> (TransformBatch, Vec<UploadRect>) {
        let capacity = self.capacity() as usize;
        let loaded = self.loaded_vertex_count as usize;
        let mut count = rows.len();
        if loaded + count > capacity {
            log::warn!(
                "vertex count limited to {} ({} splats dropped)",
                capacity,
                loaded + count - capacity
            );
            count = capacity - loaded;
        }
        if count == 0 {
            return (TransformBatch::default(), Vec::new());
        }

        let mut matrices = Vec::with_capacity(count * 16);
        for (i, row) in rows[..count].iter().enumerate() {
            // Undo the `c*128+128` packing; the X and W components are negated
            // and the quaternion conjugated to match the renderer's axis
            // conventions.
            let quat = Quat::from_xyzw(
                -((row.rotation[1] as f32) - 128.0) / 128.0,
                ((row.rotation[2] as f32) - 128.0) / 128.0,
                ((row.rotation[3] as f32) - 128.0) / 128.0,
                -((row.rotation[0] as f32) - 128.0) / 128.0,
            )
            .conjugate();
            let center = Vec3::new(row.position[0], row.position[1], -row.position[2]);
            let scale = Vec3::from(row.scale);

            // Covariance basis: m = R^T * S, cov = m * m^T = R^T S^2 R.
            let m = Mat3::from_quat(quat).transpose() * Mat3::from_diagonal(scale);
            let cov = m * m.transpose();
            let entries = [
                cov.x_axis.x,
                cov.x_axis.y,
                cov.x_axis.z,
                cov.y_axis.y,
                cov.y_axis.z,
                cov.z_axis.z,
            ];
            let mut max_value = 0.0f32;
            for e in entries {
                max_value = max_value.max(e.abs());
            }

            let dst = (loaded + i) * 4;
            self.center_and_scale[dst] = center.x;
            self.center_and_scale[dst + 1] = -center.y;
            self.center_and_scale[dst + 2] = center.z;
            self.center_and_scale[dst + 3] = max_value / COV_SCALE;

            let quantize = |e: f32| (e * COV_SCALE / max_value).round() as i16 as u16 as u32;
            self.cov_and_color[dst] = quantize(entries[0]) | (quantize(entries[1]) << 16);
            self.cov_and_color[dst + 1] = quantize(entries[2]) | (quantize(entries[3]) << 16);
            self.cov_and_color[dst + 2] = quantize(entries[4]) | (quantize(entries[5]) << 16);
            self.cov_and_color[dst + 3] = u32::from_le_bytes(row.color);

            // Element 15 carries the visibility weight so the sorter can drop
            // near-invisible splats.
            let weight = scale.x.max(scale.y).max(scale.z) * row.color[3] as f32 / 255.0;
            let mut mtx = Mat4::from_mat3(cov);
            mtx.w_axis = Vec4::new(center.x, center.y, center.z, weight);
            matrices.extend_from_slice(&mtx.to_cols_array());
        }

        let rects = self.upload_rects(loaded as u32, count as u32);
        self.loaded_vertex_count += count as u32;
        (TransformBatch::new(matrices), rects)
    }

    /// Splits a run of `count` newly written splats starting at slot `offset`
    /// into axis-aligned rectangles of the row-major tiling. Purely an
    /// addressing computation; no GPU calls happen here.
    fn upload_rects(&self, mut offset: u32, mut count: u32) -> Vec<UploadRect> {
        let row_width = self.texture_width;
        let mut rects = Vec::new();
        while count > 0 {
            let x = offset % row_width;
            let y = offset / row_width;
            let (width, height) = if x != 0 {
                (row_width.min(x + count) - x, 1)
            } else if count / row_width > 0 {
                (row_width, count / row_width)
            } else {
                (count % row_width, 1)
            };
            rects.push(UploadRect {
                x,
                y,
                width,
                height,
                splat_offset: offset,
            });
            offset += width * height;
            count -= width * height;
        }
        rects
    }
}
