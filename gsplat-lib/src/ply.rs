//! Converts PLY-format Gaussian splat files into canonical rows.
//!
//! The header is plain text terminated by `end_header\n` and enumerates named,
//! typed properties. Records are addressed through an offset/type table built
//! once per file; nothing about the record layout is assumed up front.

use foldhash::{HashMap, HashMapExt};
use memchr::memmem;

use crate::common::{clamp_u8, pack_quat_component, quat_norm, sigmoid, SH_C0};
use crate::error::SplatError;
use crate::structures::SplatRow;

/// The header must terminate within this window.
const HEADER_WINDOW: usize = 10 * 1024;
const HEADER_END: &[u8] = b"end_header\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropType {
    Double,
    Int,
    Uint,
    Float,
    Short,
    Ushort,
    Uchar,
    Other,
}

impl PropType {
    fn parse(name: &str) -> PropType {
        match name {
            "double" => PropType::Double,
            "int" => PropType::Int,
            "uint" => PropType::Uint,
            "float" => PropType::Float,
            "short" => PropType::Short,
            "ushort" => PropType::Ushort,
            "uchar" => PropType::Uchar,
            _ => PropType::Other,
        }
    }

    fn width(self) -> usize {
        match self {
            PropType::Double => 8,
            PropType::Int | PropType::Uint | PropType::Float => 4,
            PropType::Short | PropType::Ushort => 2,
            PropType::Uchar | PropType::Other => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Property {
    offset: usize,
    ty: PropType,
}

/// Name -> (byte offset, decoder type) table derived once per file.
struct PropertyTable {
    index: HashMap<String, Property>,
    row_stride: usize,
}

impl PropertyTable {
    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn get(&self, name: &str) -> Result<Property, SplatError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| SplatError::ParsePly(format!("property '{}' not found", name)))
    }
}

/// Reads one record field at `row`, little endian, widened to f64.
#[inline]
fn read_field(body: &[u8], stride: usize, row: usize, prop: Property) -> f64 {
    let at = row * stride + prop.offset;
    match prop.ty {
        PropType::Double => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&body[at..at + 8]);
            f64::from_le_bytes(b)
        }
        PropType::Int => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&body[at..at + 4]);
            i32::from_le_bytes(b) as f64
        }
        PropType::Uint => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&body[at..at + 4]);
            u32::from_le_bytes(b) as f64
        }
        PropType::Float => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&body[at..at + 4]);
            f32::from_le_bytes(b) as f64
        }
        PropType::Short => {
            let mut b = [0u8; 2];
            b.copy_from_slice(&body[at..at + 2]);
            i16::from_le_bytes(b) as f64
        }
        PropType::Ushort => {
            let mut b = [0u8; 2];
            b.copy_from_slice(&body[at..at + 2]);
            u16::from_le_bytes(b) as f64
        }
        PropType::Uchar => body[at] as f64,
        PropType::Other => body[at] as i8 as f64,
    }
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            Some(&buffer[start..start + pos])
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

fn parse_header(raw_data: &[u8]) -> Result<(usize, PropertyTable, usize), SplatError> {
    let window = &raw_data[..raw_data.len().min(HEADER_WINDOW)];
    let header_end = memmem::find(window, HEADER_END).ok_or_else(|| {
        SplatError::ParsePly("no 'end_header' marker within the first 10 KB".to_string())
    })?;
    let header = &raw_data[..header_end];

    let mut vertex_count: Option<usize> = None;
    let mut index = HashMap::new();
    let mut row_stride = 0;

    let mut offset = 0;
    while let Some(line) = next_line(header, &mut offset) {
        if let Some(rest) = line.strip_prefix(b"element vertex ") {
            let s = std::str::from_utf8(rest)
                .map_err(|e| SplatError::ParsePly(format!("UTF-8 error in vertex count: {}", e)))?;
            let n = s.trim().parse().map_err(|e| {
                SplatError::ParsePly(format!("invalid vertex count '{}': {}", s.trim(), e))
            })?;
            vertex_count = Some(n);
        } else if let Some(rest) = line.strip_prefix(b"property ") {
            let text = std::str::from_utf8(rest)
                .map_err(|e| SplatError::ParsePly(format!("UTF-8 error in property line: {}", e)))?;
            let mut parts = text.split_whitespace();
            let (Some(ty), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let ty = PropType::parse(ty);
            index.insert(
                name.to_string(),
                Property {
                    offset: row_stride,
                    ty,
                },
            );
            row_stride += ty.width();
        }
    }

    let vertex_count = vertex_count.ok_or_else(|| {
        SplatError::ParsePly("missing 'element vertex' declaration".to_string())
    })?;

    Ok((
        vertex_count,
        PropertyTable { index, row_stride },
        header_end + HEADER_END.len(),
    ))
}

/// Decodes a PLY splat buffer into canonical rows, ordered by descending
/// importance (`exp(scale_0) * exp(scale_1) * exp(scale_2) * sigmoid(opacity)`)
/// so that texture-space locality correlates with visual significance.
pub fn decode(raw_data: &[u8]) -> Result<Vec<SplatRow>, SplatError> {
    let (vertex_count, table, body_start) = parse_header(raw_data)?;
    if vertex_count == 0 {
        return Ok(Vec::new());
    }

    let body = &raw_data[body_start..];
    let stride = table.row_stride;
    let expected = vertex_count
        .checked_mul(stride)
        .ok_or_else(|| SplatError::ParsePly("overflow in byte calculation".to_string()))?;
    if body.len() < expected {
        return Err(SplatError::ParsePly(format!(
            "binary data is too short, need {} bytes, have {}",
            expected,
            body.len()
        )));
    }
    log::debug!(
        "ply header: {} vertices, {} properties, {} bytes per row",
        vertex_count,
        table.index.len(),
        stride
    );

    let px = table.get("x")?;
    let py = table.get("y")?;
    let pz = table.get("z")?;

    let has_scale = table.has("scale_0");
    let shape = if has_scale {
        Some((
            [table.get("scale_0")?, table.get("scale_1")?, table.get("scale_2")?],
            [
                table.get("rot_0")?,
                table.get("rot_1")?,
                table.get("rot_2")?,
                table.get("rot_3")?,
            ],
        ))
    } else {
        None
    };
    let dc = if table.has("f_dc_0") {
        Some([table.get("f_dc_0")?, table.get("f_dc_1")?, table.get("f_dc_2")?])
    } else {
        None
    };
    let rgb = if dc.is_none() {
        Some([table.get("red")?, table.get("green")?, table.get("blue")?])
    } else {
        None
    };
    let opacity = if table.has("opacity") {
        Some(table.get("opacity")?)
    } else {
        None
    };

    // Pre-sort by importance so the most significant splats land first in the
    // texture. This is a one-time preprocessing pass, unrelated to the
    // per-frame depth sort.
    let mut importance = vec![0.0f32; vertex_count];
    if let Some((scales, _)) = &shape {
        let op = opacity.ok_or_else(|| {
            SplatError::ParsePly("property 'opacity' not found".to_string())
        })?;
        for (row, slot) in importance.iter_mut().enumerate() {
            let size = (read_field(body, stride, row, scales[0]) as f32).exp()
                * (read_field(body, stride, row, scales[1]) as f32).exp()
                * (read_field(body, stride, row, scales[2]) as f32).exp();
            *slot = size * sigmoid(read_field(body, stride, row, op) as f32);
        }
    }
    let mut order: Vec<u32> = (0..vertex_count as u32).collect();
    order.sort_unstable_by(|&a, &b| importance[b as usize].total_cmp(&importance[a as usize]));

    let mut rows = Vec::with_capacity(vertex_count);
    for &src in &order {
        let row = src as usize;
        let mut out = SplatRow::default();

        if let Some((scales, rots)) = &shape {
            let r0 = read_field(body, stride, row, rots[0]) as f32;
            let r1 = read_field(body, stride, row, rots[1]) as f32;
            let r2 = read_field(body, stride, row, rots[2]) as f32;
            let r3 = read_field(body, stride, row, rots[3]) as f32;
            let qlen = quat_norm((r0, r1, r2, r3));
            out.rotation = [
                pack_quat_component(r0 / qlen),
                pack_quat_component(r1 / qlen),
                pack_quat_component(r2 / qlen),
                pack_quat_component(r3 / qlen),
            ];
            out.scale = [
                (read_field(body, stride, row, scales[0]) as f32).exp(),
                (read_field(body, stride, row, scales[1]) as f32).exp(),
                (read_field(body, stride, row, scales[2]) as f32).exp(),
            ];
        } else {
            out.scale = [0.01, 0.01, 0.01];
            out.rotation = [255, 0, 0, 0];
        }

        out.position = [
            read_field(body, stride, row, px) as f32,
            read_field(body, stride, row, py) as f32,
            read_field(body, stride, row, pz) as f32,
        ];

        if let Some(dc) = &dc {
            for (c, &prop) in out.color.iter_mut().zip(dc.iter()) {
                *c = clamp_u8((0.5 + SH_C0 * read_field(body, stride, row, prop) as f32) * 255.0);
            }
        } else if let Some(rgb) = &rgb {
            for (c, &prop) in out.color.iter_mut().zip(rgb.iter()) {
                *c = clamp_u8(read_field(body, stride, row, prop) as f32);
            }
        }
        out.color[3] = match opacity {
            Some(op) => clamp_u8(sigmoid(read_field(body, stride, row, op) as f32) * 255.0),
            None => 255,
        };

        rows.push(out);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ply(properties: &[(&str, &str)], vertices: &[Vec<f64>]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
        data.extend_from_slice(format!("element vertex {}\n", vertices.len()).as_bytes());
        for (ty, name) in properties {
            data.extend_from_slice(format!("property {} {}\n", ty, name).as_bytes());
        }
        data.extend_from_slice(HEADER_END);
        for vertex in vertices {
            for (value, (ty, _)) in vertex.iter().zip(properties.iter()) {
                match *ty {
                    "double" => data.extend_from_slice(&value.to_le_bytes()),
                    "float" => data.extend_from_slice(&(*value as f32).to_le_bytes()),
                    "int" => data.extend_from_slice(&(*value as i32).to_le_bytes()),
                    "uint" => data.extend_from_slice(&(*value as u32).to_le_bytes()),
                    "short" => data.extend_from_slice(&(*value as i16).to_le_bytes()),
                    "ushort" => data.extend_from_slice(&(*value as u16).to_le_bytes()),
                    _ => data.push(*value as u8),
                }
            }
        }
        data
    }

    const FULL_PROPS: &[(&str, &str)] = &[
        ("float", "x"),
        ("float", "y"),
        ("float", "z"),
        ("float", "scale_0"),
        ("float", "scale_1"),
        ("float", "scale_2"),
        ("float", "rot_0"),
        ("float", "rot_1"),
        ("float", "rot_2"),
        ("float", "rot_3"),
        ("float", "opacity"),
        ("float", "f_dc_0"),
        ("float", "f_dc_1"),
        ("float", "f_dc_2"),
    ];

    fn full_vertex(pos: [f64; 3], log_scale: f64, opacity: f64) -> Vec<f64> {
        vec![
            pos[0], pos[1], pos[2], log_scale, log_scale, log_scale, 1.0, 0.0, 0.0, 0.0, opacity,
            0.1, 0.2, 0.3,
        ]
    }

    #[test]
    fn decodes_full_property_set() {
        let data = build_ply(FULL_PROPS, &[full_vertex([1.0, 2.0, 3.0], -2.0, 4.0)]);
        let rows = decode(&data).expect("decode failed");
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.position, [1.0, 2.0, 3.0]);
        for s in row.scale {
            assert!((s - (-2.0f32).exp()).abs() < 1e-6);
        }
        // Identity-ish quaternion (1, 0, 0, 0) packs to (255, 128, 128, 128).
        assert_eq!(row.rotation, [255, 128, 128, 128]);
        assert_eq!(row.color[0], clamp_u8((0.5 + SH_C0 * 0.1) * 255.0));
        assert_eq!(row.color[3], clamp_u8(sigmoid(4.0) * 255.0));
    }

    #[test]
    fn row_count_matches_header_vertex_count() {
        let vertices: Vec<Vec<f64>> = (0..7)
            .map(|i| full_vertex([i as f64, 0.0, 0.0], -1.0, 1.0))
            .collect();
        let data = build_ply(FULL_PROPS, &vertices);
        assert_eq!(decode(&data).expect("decode failed").len(), 7);
    }

    #[test]
    fn missing_properties_use_documented_fallbacks() {
        let props = &[
            ("float", "x"),
            ("float", "y"),
            ("float", "z"),
            ("uchar", "red"),
            ("uchar", "green"),
            ("uchar", "blue"),
        ];
        let data = build_ply(props, &[vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]]);
        let rows = decode(&data).expect("fallback decode failed");
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.scale, [0.01, 0.01, 0.01]);
        assert_eq!(row.rotation, [255, 0, 0, 0]);
        assert_eq!(row.color, [10, 20, 30, 255]);
    }

    #[test]
    fn mixed_property_widths_are_addressed_by_offset() {
        let props = &[
            ("double", "x"),
            ("float", "y"),
            ("short", "z"),
            ("uchar", "red"),
            ("uchar", "green"),
            ("uchar", "blue"),
        ];
        let data = build_ply(props, &[vec![1.5, 2.5, -3.0, 255.0, 0.0, 0.0]]);
        let rows = decode(&data).expect("decode failed");
        assert_eq!(rows[0].position, [1.5, 2.5, -3.0]);
        assert_eq!(rows[0].color, [255, 0, 0, 255]);
    }

    #[test]
    fn reorders_rows_by_descending_importance() {
        let small = full_vertex([1.0, 0.0, 0.0], -4.0, 10.0);
        let large = full_vertex([2.0, 0.0, 0.0], 0.0, 10.0);
        let data = build_ply(FULL_PROPS, &[small, large]);
        let rows = decode(&data).expect("decode failed");
        assert_eq!(rows[0].position[0], 2.0);
        assert_eq!(rows[1].position[0], 1.0);
    }

    #[test]
    fn missing_end_header_is_an_error() {
        let data = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty float x\n";
        assert!(matches!(decode(data), Err(SplatError::ParsePly(_))));
    }

    #[test]
    fn missing_vertex_count_is_an_error() {
        let data = b"ply\nformat binary_little_endian 1.0\nproperty float x\nend_header\n";
        assert!(matches!(decode(data), Err(SplatError::ParsePly(_))));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut data = build_ply(FULL_PROPS, &[full_vertex([0.0; 3], -1.0, 1.0)]);
        data.truncate(data.len() - 8);
        assert!(matches!(decode(&data), Err(SplatError::ParsePly(_))));
    }

    #[test]
    fn zero_vertices_decodes_to_empty() {
        let data = build_ply(&[("float", "x")], &[]);
        assert!(decode(&data).expect("decode failed").is_empty());
    }
}
