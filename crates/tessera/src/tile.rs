//! Tile addressing and URL templating.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A quadtree tile: level of detail plus column/row at that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TileId {
    /// Level of detail (quadtree depth).
    pub lod: u32,
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

impl TileId {
    /// Create a new tile id.
    #[must_use]
    pub const fn new(lod: u32, x: u32, y: u32) -> Self {
        Self { lod, x, y }
    }

    /// The ancestor `depth` levels up. Saturates at the root.
    #[must_use]
    pub fn ancestor(self, depth: u32) -> Self {
        let depth = depth.min(self.lod);
        Self {
            lod: self.lod - depth,
            x: self.x.checked_shr(depth).unwrap_or(0),
            y: self.y.checked_shr(depth).unwrap_or(0),
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.lod, self.x, self.y)
    }
}

/// Inclusive range of levels of detail, serialized as `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct LodRange {
    pub min: u32,
    pub max: u32,
}

impl LodRange {
    #[must_use]
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}

impl From<[u32; 2]> for LodRange {
    fn from([min, max]: [u32; 2]) -> Self {
        Self { min, max }
    }
}

impl From<LodRange> for [u32; 2] {
    fn from(r: LodRange) -> Self {
        [r.min, r.max]
    }
}

/// Inclusive tile range at the minimum LOD of a layer, serialized as
/// `[[llx, lly], [urx, ury]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[[u32; 2]; 2]", into = "[[u32; 2]; 2]")]
pub struct TileRange {
    /// Lower-left corner (minimum column, minimum row).
    pub ll: [u32; 2],
    /// Upper-right corner (maximum column, maximum row).
    pub ur: [u32; 2],
}

impl TileRange {
    #[must_use]
    pub const fn new(ll: [u32; 2], ur: [u32; 2]) -> Self {
        Self { ll, ur }
    }

    /// Whether the column/row pair lies inside the range.
    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.ll[0] && x <= self.ur[0] && y >= self.ll[1] && y <= self.ur[1]
    }
}

impl From<[[u32; 2]; 2]> for TileRange {
    fn from([ll, ur]: [[u32; 2]; 2]) -> Self {
        Self { ll, ur }
    }
}

impl From<TileRange> for [[u32; 2]; 2] {
    fn from(r: TileRange) -> Self {
        [r.ll, r.ur]
    }
}

/// A tile visited by traversal, together with the root of the reference
/// frame subtree it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: TileId,
    pub subtree_root: TileId,
}

impl NodeInfo {
    /// A node in the global subtree (root at `0-0-0`).
    #[must_use]
    pub fn new(node_id: TileId) -> Self {
        Self {
            node_id,
            subtree_root: TileId::default(),
        }
    }

    /// The node's id relative to its subtree root.
    #[must_use]
    pub fn local(&self) -> TileId {
        let root = self.subtree_root;
        let dl = self.node_id.lod.saturating_sub(root.lod);
        let origin_x = root.x.checked_shl(dl).unwrap_or(0);
        let origin_y = root.y.checked_shl(dl).unwrap_or(0);
        TileId {
            lod: dl,
            x: self.node_id.x.wrapping_sub(origin_x),
            y: self.node_id.y.wrapping_sub(origin_y),
        }
    }
}

/// Substitution variables for a URL template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlVars {
    pub tile_id: TileId,
    pub local_id: TileId,
    pub sub_mesh: u32,
}

impl UrlVars {
    #[must_use]
    pub fn new(node: &NodeInfo, sub_mesh: u32) -> Self {
        Self {
            tile_id: node.node_id,
            local_id: node.local(),
            sub_mesh,
        }
    }

    /// Move both ids `depth` levels up the tree.
    #[must_use]
    pub fn ancestor(self, depth: u32) -> Self {
        Self {
            tile_id: self.tile_id.ancestor(depth),
            local_id: self.local_id.ancestor(depth),
            sub_mesh: self.sub_mesh,
        }
    }

    /// Align both ids to the start of their `block`-sized tile block.
    /// `block` must be a power of two.
    #[must_use]
    pub fn aligned(self, block: u32) -> Self {
        let mask = !(block - 1);
        let mut v = self;
        v.tile_id.x &= mask;
        v.tile_id.y &= mask;
        v.local_id.x &= mask;
        v.local_id.y &= mask;
        v
    }
}

/// A resource URL template.
///
/// Recognized tokens: `{lod}`, `{x}`, `{y}`, `{loclod}`, `{locx}`, `{locy}`
/// and `{sub}`. Unknown tokens are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expand the template for the given variables.
    #[must_use]
    pub fn expand(&self, vars: &UrlVars) -> String {
        let mut out = String::with_capacity(self.0.len() + 16);
        let mut rest = self.0.as_str();

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start..];
            let Some(end) = after.find('}') else {
                break;
            };
            let token = &after[1..end];
            let value = match token {
                "lod" => Some(vars.tile_id.lod),
                "x" => Some(vars.tile_id.x),
                "y" => Some(vars.tile_id.y),
                "loclod" => Some(vars.local_id.lod),
                "locx" => Some(vars.local_id.x),
                "locy" => Some(vars.local_id.y),
                "sub" => Some(vars.sub_mesh),
                _ => None,
            };
            match value {
                Some(v) => out.push_str(&v.to_string()),
                None => out.push_str(&after[..=end]),
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn vars(lod: u32, x: u32, y: u32) -> UrlVars {
        UrlVars::new(&NodeInfo::new(TileId::new(lod, x, y)), 0)
    }

    #[test]
    fn test_expand_all_tokens() {
        let node = NodeInfo {
            node_id: TileId::new(12, 2050, 1030),
            subtree_root: TileId::new(2, 2, 1),
        };
        let t = UrlTemplate::new("https://t/{lod}-{x}-{y}/{loclod}-{locx}-{locy}.{sub}.jpg");
        assert_eq!(
            t.expand(&UrlVars::new(&node, 3)),
            "https://t/12-2050-1030/10-2-6.3.jpg"
        );
    }

    #[test]
    fn test_unknown_tokens_are_kept() {
        let t = UrlTemplate::new("https://{alt(a,b)}/{lod}/{unclosed");
        assert_eq!(t.expand(&vars(3, 1, 2)), "https://{alt(a,b)}/3/{unclosed");
    }

    #[test]
    fn test_aligned_masks_to_block() {
        let v = vars(10, 600, 257).aligned(256);
        assert_eq!(v.tile_id, TileId::new(10, 512, 256));
    }

    #[test]
    fn test_ranges_deserialize_from_arrays() {
        let lod: LodRange = serde_json::from_str("[3, 18]").unwrap();
        assert_eq!(lod, LodRange::new(3, 18));
        let range: TileRange = serde_json::from_str("[[1, 2], [5, 6]]").unwrap();
        assert!(range.contains(1, 6));
        assert!(!range.contains(0, 2));
    }

    proptest! {
        #[test]
        fn test_ancestor_contains_descendant(lod in 0u32..24, x in 0u32..(1 << 20), y in 0u32..(1 << 20), depth in 0u32..24) {
            let tile = TileId::new(lod, x, y);
            let a = tile.ancestor(depth);
            let d = lod - a.lod;
            prop_assert_eq!(a.x, x >> d);
            prop_assert_eq!(a.y, y >> d);
        }

        #[test]
        fn test_local_of_global_root_is_identity(lod in 0u32..24, x in 0u32..(1 << 20), y in 0u32..(1 << 20)) {
            let tile = TileId::new(lod, x, y);
            prop_assert_eq!(NodeInfo::new(tile).local(), tile);
        }
    }
}
