//! Camera position and its JSON form.
//!
//! Positions serialize as a flat array:
//!
//! ```text
//! ["obj", x, y, "fix", z, yaw, pitch, roll, extent, fov]
//! ```
//!
//! `obj` positions describe the point looked at, `subj` positions the eye
//! itself. `fix` heights are absolute, `float` heights are relative to the
//! terrain.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether the position point is the look-at target or the eye.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionKind {
    #[default]
    #[serde(rename = "obj")]
    Objective,
    #[serde(rename = "subj")]
    Subjective,
}

/// How the height of the position point is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeightMode {
    #[default]
    #[serde(rename = "fix")]
    Fixed,
    #[serde(rename = "float")]
    Floating,
}

/// Camera position in the navigation SRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PositionRepr", into = "PositionRepr")]
pub struct Position {
    pub kind: PositionKind,
    pub point: [f64; 3],
    pub height_mode: HeightMode,
    /// Yaw, pitch and roll in degrees.
    pub orientation: [f64; 3],
    /// Vertical extent of the view in navigation units.
    pub vertical_extent: f64,
    /// Vertical field of view in degrees.
    pub vertical_fov: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            kind: PositionKind::Objective,
            point: [0.0; 3],
            height_mode: HeightMode::Fixed,
            orientation: [0.0, -90.0, 0.0],
            vertical_extent: 1000.0,
            vertical_fov: 55.0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PositionRepr(
    PositionKind,
    f64,
    f64,
    HeightMode,
    f64,
    f64,
    f64,
    f64,
    f64,
    f64,
);

impl TryFrom<PositionRepr> for Position {
    type Error = String;

    fn try_from(r: PositionRepr) -> std::result::Result<Self, Self::Error> {
        let position = Position {
            kind: r.0,
            point: [r.1, r.2, r.4],
            height_mode: r.3,
            orientation: [r.5, r.6, r.7],
            vertical_extent: r.8,
            vertical_fov: r.9,
        };
        if !(position.vertical_fov > 0.0 && position.vertical_fov < 180.0) {
            return Err(format!("field of view {} out of range", position.vertical_fov));
        }
        if !position.vertical_extent.is_finite() || position.vertical_extent <= 0.0 {
            return Err(format!("view extent {} out of range", position.vertical_extent));
        }
        Ok(position)
    }
}

impl From<Position> for PositionRepr {
    fn from(p: Position) -> Self {
        PositionRepr(
            p.kind,
            p.point[0],
            p.point[1],
            p.height_mode,
            p.point[2],
            p.orientation[0],
            p.orientation[1],
            p.orientation[2],
            p.vertical_extent,
            p.vertical_fov,
        )
    }
}

impl Position {
    /// Parse a position from its JSON array form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or out of range.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid position json: {e}")))
    }

    /// Serialize to the JSON array form.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_value(self).map_or_else(|_| String::new(), |v| v.to_string())
    }

    #[must_use]
    pub fn is_subjective(&self) -> bool {
        self.kind == PositionKind::Subjective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_array_form() {
        let p = Position::from_json(r#"["obj", 14.4, 50.0, "float", 0, 15, -60, 0, 5000, 45]"#)
            .unwrap();
        assert_eq!(p.kind, PositionKind::Objective);
        assert_eq!(p.height_mode, HeightMode::Floating);
        assert_eq!(p.point, [14.4, 50.0, 0.0]);
        assert_eq!(p.orientation, [15.0, -60.0, 0.0]);
        assert!((p.vertical_extent - 5000.0).abs() < f64::EPSILON);
        assert!((p.vertical_fov - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_round_trip_keeps_subjective() {
        let p = Position {
            kind: PositionKind::Subjective,
            point: [1.0, 2.0, 3.0],
            ..Position::default()
        };
        let json = p.to_json();
        assert!(json.starts_with(r#"["subj",1.0,2.0,"fix",3.0"#));
        assert_eq!(Position::from_json(&json).unwrap(), p);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        for bad in [
            "{",
            "[]",
            r#"["obj", 1, 2, "fix", 3]"#,
            r#"["side", 1, 2, "fix", 3, 0, 0, 0, 100, 45]"#,
            r#"["obj", 1, 2, "fix", 3, 0, 0, 0, 100, 200]"#,
            r#"["obj", 1, 2, "fix", 3, 0, 0, 0, -1, 45]"#,
        ] {
            let err = Position::from_json(bad).unwrap_err();
            assert!(matches!(err, Error::Config { .. }), "{bad}: {err}");
        }
    }
}
