//! Serde model of a `tileset.json` manifest.
//!
//! Only the fields the tree needs are modelled; unknown fields (extensions,
//! properties, extras) are ignored.

use serde::Deserialize;

use crate::bounds::BoundingVolume;
use crate::error::{Error, Result};

/// Top-level manifest document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Asset information.
    #[serde(default)]
    pub asset: Asset,
    /// Error of the whole tileset when nothing is rendered.
    #[serde(default)]
    pub geometric_error: Option<f64>,
    /// The root tile.
    pub root: Option<ManifestTile>,
}

/// `asset` block of a manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    /// 3D Tiles version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Application-specific version of the tileset.
    #[serde(default)]
    pub tileset_version: Option<String>,
}

/// Refinement strategy of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Refine {
    /// Children replace the parent when refined.
    Replace,
    /// Children are added on top of the parent.
    Add,
}

/// A tile as written in the manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestTile {
    /// Bounding volume of the tile.
    pub bounding_volume: Option<ManifestVolume>,
    /// Error if the tile is rendered and its children are not.
    pub geometric_error: Option<f64>,
    /// Refinement strategy; inherited from the parent when absent.
    #[serde(default)]
    pub refine: Option<Refine>,
    /// Optional loadable content.
    #[serde(default)]
    pub content: Option<ManifestContent>,
    /// Column-major 4x4 transform.
    #[serde(default)]
    pub transform: Option<Vec<f64>>,
    /// Child tiles in manifest order.
    #[serde(default)]
    pub children: Vec<ManifestTile>,
}

/// A bounding volume as written in the manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestVolume {
    /// Oriented box: center then three half-axes.
    #[serde(rename = "box", default)]
    pub obb: Option<Vec<f64>>,
    /// Sphere: center then radius.
    #[serde(default)]
    pub sphere: Option<Vec<f64>>,
    /// Region: west, south, east, north (radians), min and max height.
    #[serde(default)]
    pub region: Option<Vec<f64>>,
}

/// Content block of a manifest tile.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestContent {
    /// Content locator.
    #[serde(default)]
    pub uri: Option<String>,
    /// Legacy name of the content locator.
    #[serde(default)]
    pub url: Option<String>,
}

impl Manifest {
    /// Parse a manifest document.
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }
}

impl ManifestContent {
    /// The locator, preferring `uri` over the legacy `url`.
    #[must_use]
    pub fn locator(&self) -> Option<&str> {
        self.uri.as_deref().or(self.url.as_deref())
    }
}

impl ManifestVolume {
    /// Convert to a bounding volume in the tile's local frame.
    ///
    /// Regions are geographic and already absolute; the caller must not
    /// apply tile transforms to them.
    pub fn resolve(&self) -> Result<(BoundingVolume, bool)> {
        if let Some(values) = &self.obb {
            let array: &[f64; 12] = values.as_slice().try_into().map_err(|_| {
                Error::manifest(format!("box needs 12 numbers, got {}", values.len()))
            })?;
            return Ok((BoundingVolume::from_box_array(array), false));
        }
        if let Some(values) = &self.sphere {
            let array: &[f64; 4] = values.as_slice().try_into().map_err(|_| {
                Error::manifest(format!("sphere needs 4 numbers, got {}", values.len()))
            })?;
            return Ok((BoundingVolume::from_sphere_array(array), false));
        }
        if let Some(values) = &self.region {
            let array: &[f64; 6] = values.as_slice().try_into().map_err(|_| {
                Error::manifest(format!("region needs 6 numbers, got {}", values.len()))
            })?;
            return Ok((BoundingVolume::from_region_array(array), true));
        }
        Err(Error::manifest("bounding volume has no box, sphere or region"))
    }
}
