//! Mesh decoding.
//!
//! Free layers and external meshes are served as Wavefront OBJ text. Only
//! geometry records are interpreted: `v` positions, `vt` texture
//! coordinates and `f` faces. Faces with more than three corners are split
//! into triangle fans. Every distinct `(position, uv)` pair becomes one
//! output vertex, so the result can be uploaded as a single interleaved
//! vertex buffer with a `u16` index buffer.

use std::collections::HashMap;

use glam::{Vec2, Vec3};

use crate::error::{DecodeError, DecodeResult};

/// An interleaved mesh vertex: position followed by texture coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeshVertex {
    /// Position in mesh-local coordinates.
    pub position: Vec3,
    /// Texture coordinates; zero when the mesh has none.
    pub uv: Vec2,
}

impl MeshVertex {
    /// Size of one vertex in the interleaved buffer.
    pub const STRIDE: usize = 5 * std::mem::size_of::<f32>();
}

/// A decoded triangle mesh.
#[derive(Debug, Clone, Default)]
pub struct DecodedMesh {
    /// Unique vertices.
    pub vertices: Vec<MeshVertex>,
    /// Triangle list indices into `vertices`.
    pub indices: Vec<u16>,
}

impl DecodedMesh {
    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of indices (three per triangle).
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Pack the vertices into a little-endian `f32` buffer laid out as
    /// `x y z u v` per vertex.
    #[must_use]
    pub fn vertex_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.vertices.len() * MeshVertex::STRIDE);
        for v in &self.vertices {
            for f in [v.position.x, v.position.y, v.position.z, v.uv.x, v.uv.y] {
                out.extend_from_slice(&f.to_le_bytes());
            }
        }
        out
    }
}

/// Decode an OBJ mesh.
///
/// # Errors
///
/// Returns an error for non-UTF-8 input, malformed numbers, out-of-range
/// references, degenerate faces, or meshes with more vertices than a `u16`
/// index buffer can address.
pub fn decode_mesh(data: &[u8]) -> DecodeResult<DecodedMesh> {
    let text = std::str::from_utf8(data).map_err(|e| DecodeError::InvalidFormat {
        context: "mesh",
        detail: format!("not utf-8: {e}"),
    })?;

    let mut positions: Vec<Vec3> = Vec::new();
    let mut uvs: Vec<Vec2> = Vec::new();
    let mut mesh = DecodedMesh::default();
    let mut unique: HashMap<(usize, Option<usize>), u16> = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(record) = tokens.next() else {
            continue;
        };

        match record {
            "v" => {
                let [x, y, z] = parse_floats::<3>(&mut tokens, "mesh position")?;
                positions.push(Vec3::new(x, y, z));
            }
            "vt" => {
                let [u, v] = parse_floats::<2>(&mut tokens, "mesh uv")?;
                uvs.push(Vec2::new(u, v));
            }
            "f" => {
                let mut corners = Vec::with_capacity(4);
                for token in tokens {
                    let (p, t) = parse_corner(token, positions.len(), uvs.len())?;
                    let index = match unique.get(&(p, t)) {
                        Some(&index) => index,
                        None => {
                            let index = u16::try_from(mesh.vertices.len()).map_err(|_| {
                                DecodeError::InvalidFormat {
                                    context: "mesh",
                                    detail: "too many vertices for 16-bit indices".to_string(),
                                }
                            })?;
                            mesh.vertices.push(MeshVertex {
                                position: positions[p],
                                uv: t.map_or(Vec2::ZERO, |t| uvs[t]),
                            });
                            unique.insert((p, t), index);
                            index
                        }
                    };
                    corners.push(index);
                }

                if corners.len() < 3 {
                    return Err(DecodeError::InvalidFormat {
                        context: "mesh face",
                        detail: format!("face with {} corners", corners.len()),
                    });
                }
                for i in 1..corners.len() - 1 {
                    mesh.indices
                        .extend_from_slice(&[corners[0], corners[i], corners[i + 1]]);
                }
            }
            // Normals, groups, materials and smoothing are irrelevant here.
            _ => {}
        }
    }

    Ok(mesh)
}

fn parse_floats<'a, const N: usize>(
    tokens: &mut impl Iterator<Item = &'a str>,
    context: &'static str,
) -> DecodeResult<[f32; N]> {
    let mut out = [0.0; N];
    for slot in &mut out {
        let token = tokens
            .next()
            .ok_or(DecodeError::UnexpectedEof { context })?;
        *slot = token.parse().map_err(|_| DecodeError::InvalidFormat {
            context,
            detail: format!("invalid number '{token}'"),
        })?;
    }
    Ok(out)
}

/// Parse a face corner (`p`, `p/t`, `p/t/n` or `p//n`) into zero-based
/// position and optional uv indices.
fn parse_corner(
    token: &str,
    position_count: usize,
    uv_count: usize,
) -> DecodeResult<(usize, Option<usize>)> {
    let mut parts = token.split('/');
    let position = resolve_index(parts.next().unwrap_or(""), position_count)?;
    let uv = match parts.next() {
        Some(t) if !t.is_empty() => Some(resolve_index(t, uv_count)?),
        _ => None,
    };
    Ok((position, uv))
}

/// Resolve a one-based (or negative, relative) OBJ reference.
fn resolve_index(token: &str, len: usize) -> DecodeResult<usize> {
    let raw: i64 = token.parse().map_err(|_| DecodeError::InvalidFormat {
        context: "mesh face",
        detail: format!("invalid index '{token}'"),
    })?;

    let resolved = match raw {
        0 => None,
        r if r > 0 => usize::try_from(r - 1).ok(),
        r => usize::try_from(-r).ok().and_then(|back| len.checked_sub(back)),
    };

    match resolved {
        Some(index) if index < len => Ok(index),
        _ => Err(DecodeError::IndexOutOfBounds {
            index: usize::try_from(raw.unsigned_abs()).unwrap_or(usize::MAX),
            len,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
# unit quad
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn test_quad_is_fanned_into_two_triangles() {
        let mesh = decode_mesh(QUAD.as_bytes()).unwrap();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.vertices[2].position, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(mesh.vertices[3].uv, Vec2::new(0.0, 1.0));
    }

    #[test]
    fn test_shared_corners_are_deduplicated() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 1 1 0\nf 1 2 3\nf 2 4 3\n";
        let mesh = decode_mesh(obj.as_bytes()).unwrap();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.index_count(), 6);
        assert_eq!(mesh.indices[3..], [1, 3, 2]);
    }

    #[test]
    fn test_negative_indices_are_relative() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n";
        let mesh = decode_mesh(obj.as_bytes()).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.vertices[0].uv, Vec2::ZERO);
    }

    #[test]
    fn test_normals_are_ignored() {
        let obj = "v 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nf 1//1 2//1 3//1\n";
        let mesh = decode_mesh(obj.as_bytes()).unwrap();
        assert_eq!(mesh.index_count(), 3);
    }

    #[test]
    fn test_out_of_range_reference() {
        let obj = "v 0 0 0\nf 1 2 3\n";
        assert!(matches!(
            decode_mesh(obj.as_bytes()),
            Err(DecodeError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_degenerate_face() {
        let obj = "v 0 0 0\nv 1 0 0\nf 1 2\n";
        assert!(matches!(
            decode_mesh(obj.as_bytes()),
            Err(DecodeError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_bad_number() {
        let obj = "v 0 zero 0\n";
        assert!(decode_mesh(obj.as_bytes()).is_err());
    }

    #[test]
    fn test_vertex_bytes_layout() {
        let mesh = decode_mesh(QUAD.as_bytes()).unwrap();
        let bytes = mesh.vertex_bytes();
        assert_eq!(bytes.len(), 4 * MeshVertex::STRIDE);
        // Second vertex x coordinate.
        let x = f32::from_le_bytes(bytes[20..24].try_into().unwrap());
        assert!((x - 1.0).abs() < f32::EPSILON);
    }
}
