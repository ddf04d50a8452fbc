//! Immutable tile hierarchy built once from a manifest.
//!
//! Nodes live in an arena indexed by [`TileId`]. Ids are assigned in
//! pre-order with children in manifest order, so the root is always
//! `TileId(0)` and iterating ids ascending is a pre-order walk.

use std::fmt;

use glam::DMat4;

use crate::bounds::{Aabb, BoundingVolume};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestTile, Refine};

/// Index of a node in a [`TileTree`]. Defaults to the root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub u32);

impl TileId {
    /// The root node of every tree.
    pub const ROOT: TileId = TileId(0);

    /// Position of the node in arena-backed tables.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node of the tile hierarchy.
#[derive(Debug, Clone)]
pub struct TileNode {
    /// This node's id.
    pub id: TileId,
    /// Parent node, `None` for the root.
    pub parent: Option<TileId>,
    /// Children in manifest order.
    pub children: Vec<TileId>,
    /// World-space bounding volume.
    pub bounding_volume: BoundingVolume,
    /// Error contributed if this node is used unrefined.
    pub geometric_error: f64,
    /// Resolved content locator, if the node has loadable content.
    pub content: Option<String>,
    /// Distance from the root.
    pub depth: u32,
    /// Refinement strategy.
    pub refine: Refine,
}

impl TileNode {
    /// Whether the node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the node has loadable content.
    #[must_use]
    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
}

/// The tile hierarchy.
#[derive(Debug, Clone)]
pub struct TileTree {
    nodes: Vec<TileNode>,
    asset_version: Option<String>,
    geometric_error: Option<f64>,
}

impl TileTree {
    /// Build a tree from a manifest, leaving content locators as written.
    pub fn load(source: &str) -> Result<Self> {
        Self::load_with_base(source, "")
    }

    /// Build a tree from a manifest, resolving relative content locators
    /// against the location the manifest was read from.
    pub fn load_with_base(source: &str, manifest_uri: &str) -> Result<Self> {
        let manifest = Manifest::from_json(source)?;
        Self::from_manifest(manifest, manifest_uri)
    }

    /// Build a tree from an already parsed manifest.
    pub fn from_manifest(manifest: Manifest, manifest_uri: &str) -> Result<Self> {
        let root = manifest
            .root
            .ok_or_else(|| Error::manifest("manifest has no root tile"))?;

        let mut builder = Builder {
            nodes: Vec::new(),
            base: base_directory(manifest_uri),
        };
        builder.add(&root, None, DMat4::IDENTITY, Refine::Replace, 0)?;

        tracing::info!(
            nodes = builder.nodes.len(),
            version = manifest.asset.version.as_deref().unwrap_or("unknown"),
            "loaded tileset manifest"
        );

        Ok(Self {
            nodes: builder.nodes,
            asset_version: manifest.asset.version,
            geometric_error: manifest.geometric_error,
        })
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &TileNode {
        &self.nodes[0]
    }

    /// Look up a node.
    #[must_use]
    pub fn get(&self, id: TileId) -> Option<&TileNode> {
        self.nodes.get(id.index())
    }

    /// Whether the id names a node of this tree.
    #[must_use]
    pub fn contains(&self, id: TileId) -> bool {
        id.index() < self.nodes.len()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a tree has at least a root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children of a node, empty for unknown ids.
    #[must_use]
    pub fn children(&self, id: TileId) -> &[TileId] {
        self.get(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Parent of a node.
    #[must_use]
    pub fn parent(&self, id: TileId) -> Option<TileId> {
        self.get(id).and_then(|n| n.parent)
    }

    /// Whether a node has no children. Unknown ids count as leaves.
    #[must_use]
    pub fn is_leaf(&self, id: TileId) -> bool {
        self.children(id).is_empty()
    }

    /// Siblings of a node, excluding the node itself.
    pub fn siblings(&self, id: TileId) -> impl Iterator<Item = TileId> + '_ {
        self.parent(id)
            .map(|p| self.children(p))
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(move |&s| s != id)
    }

    /// Deepest depth in the tree.
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// `asset.version` of the manifest.
    #[must_use]
    pub fn asset_version(&self) -> Option<&str> {
        self.asset_version.as_deref()
    }

    /// Top-level geometric error of the manifest.
    #[must_use]
    pub fn geometric_error(&self) -> Option<f64> {
        self.geometric_error
    }

    /// Bounds of the whole tree.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        self.root().bounding_volume.aabb()
    }

    /// Lazy pre-order walk over every node. Each call starts a fresh walk.
    #[must_use]
    pub fn traverse(&self) -> Traverse<'_> {
        self.traverse_from(TileId::ROOT)
    }

    /// Lazy pre-order walk over the subtree rooted at `id`.
    #[must_use]
    pub fn traverse_from(&self, id: TileId) -> Traverse<'_> {
        let stack = if self.contains(id) { vec![id] } else { Vec::new() };
        Traverse { tree: self, stack }
    }
}

/// Pre-order iterator over a [`TileTree`].
pub struct Traverse<'a> {
    tree: &'a TileTree,
    stack: Vec<TileId>,
}

impl<'a> Iterator for Traverse<'a> {
    type Item = &'a TileNode;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = &self.tree.nodes[id.index()];
        self.stack.extend(node.children.iter().rev().copied());
        Some(node)
    }
}

struct Builder {
    nodes: Vec<TileNode>,
    base: String,
}

impl Builder {
    fn add(
        &mut self,
        tile: &ManifestTile,
        parent: Option<TileId>,
        parent_transform: DMat4,
        parent_refine: Refine,
        depth: u32,
    ) -> Result<TileId> {
        let id = TileId(
            u32::try_from(self.nodes.len())
                .map_err(|_| Error::manifest("too many tiles in manifest"))?,
        );

        let geometric_error = tile
            .geometric_error
            .ok_or_else(|| Error::manifest(format!("tile {id} has no geometricError")))?;
        if !geometric_error.is_finite() || geometric_error < 0.0 {
            return Err(Error::manifest(format!(
                "tile {id} has invalid geometricError {geometric_error}"
            )));
        }

        let transform = match &tile.transform {
            None => parent_transform,
            Some(values) => {
                let array: &[f64; 16] = values.as_slice().try_into().map_err(|_| {
                    Error::manifest(format!(
                        "tile {id} transform needs 16 numbers, got {}",
                        values.len()
                    ))
                })?;
                parent_transform * DMat4::from_cols_array(array)
            }
        };

        let (volume, absolute) = tile
            .bounding_volume
            .as_ref()
            .ok_or_else(|| Error::manifest(format!("tile {id} has no boundingVolume")))?
            .resolve()?;
        let bounding_volume = if absolute {
            volume
        } else {
            volume.transformed(&transform)
        };

        let content = tile
            .content
            .as_ref()
            .and_then(|c| c.locator())
            .map(|uri| resolve_uri(&self.base, uri));

        let refine = tile.refine.unwrap_or(parent_refine);

        self.nodes.push(TileNode {
            id,
            parent,
            children: Vec::with_capacity(tile.children.len()),
            bounding_volume,
            geometric_error,
            content,
            depth,
            refine,
        });

        for child in &tile.children {
            let child_id = self.add(child, Some(id), transform, refine, depth + 1)?;
            self.nodes[id.index()].children.push(child_id);
        }

        Ok(id)
    }
}

/// Directory part of a manifest location, including the trailing separator.
fn base_directory(manifest_uri: &str) -> String {
    manifest_uri
        .rfind('/')
        .map_or_else(String::new, |i| manifest_uri[..=i].to_string())
}

/// Resolve a content locator against a base directory.
pub(crate) fn resolve_uri(base: &str, uri: &str) -> String {
    if base.is_empty() || uri.contains("://") || uri.starts_with('/') {
        return uri.to_string();
    }

    let mut resolved = base.to_string();
    for segment in uri.split('/') {
        match segment {
            "." => {}
            ".." => {
                let trimmed = resolved.trim_end_matches('/');
                let keep = trimmed.rfind('/').map_or(0, |i| i + 1);
                // Never climb above the scheme and host of a URL.
                if !trimmed[..keep].ends_with("//") && keep > 0 {
                    resolved.truncate(keep);
                }
            }
            _ => {
                resolved.push_str(segment);
                resolved.push('/');
            }
        }
    }
    resolved.pop();
    resolved
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Root with two children at x = -10 and x = +10, each with two leaves.
    pub(crate) const TWO_LEVEL: &str = r#"{
        "asset": { "version": "1.0" },
        "geometricError": 200,
        "root": {
            "boundingVolume": { "box": [0,0,0, 20,0,0, 0,20,0, 0,0,20] },
            "geometricError": 100,
            "content": { "uri": "root.b3dm" },
            "children": [
                {
                    "boundingVolume": { "box": [-10,0,0, 10,0,0, 0,20,0, 0,0,20] },
                    "geometricError": 20,
                    "content": { "uri": "a/tile.b3dm" },
                    "children": [
                        { "boundingVolume": { "sphere": [-15,0,0, 5] }, "geometricError": 0, "content": { "uri": "a/0.b3dm" } },
                        { "boundingVolume": { "sphere": [-5,0,0, 5] }, "geometricError": 0, "content": { "uri": "a/1.b3dm" } }
                    ]
                },
                {
                    "boundingVolume": { "box": [10,0,0, 10,0,0, 0,20,0, 0,0,20] },
                    "geometricError": 20,
                    "content": { "uri": "b/tile.b3dm" },
                    "children": [
                        { "boundingVolume": { "sphere": [5,0,0, 5] }, "geometricError": 0, "content": { "uri": "b/0.b3dm" } },
                        { "boundingVolume": { "sphere": [15,0,0, 5] }, "geometricError": 0 }
                    ]
                }
            ]
        }
    }"#;

    #[test]
    fn test_load_assigns_preorder_ids() {
        let tree = TileTree::load(TWO_LEVEL).unwrap();
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.children(TileId::ROOT), &[TileId(1), TileId(4)]);
        assert_eq!(tree.children(TileId(1)), &[TileId(2), TileId(3)]);
        assert_eq!(tree.parent(TileId(5)), Some(TileId(4)));
        assert_eq!(tree.get(TileId(6)).unwrap().depth, 2);
        assert!(!tree.get(TileId(6)).unwrap().has_content());
        assert_eq!(tree.max_depth(), 2);
        assert_eq!(tree.asset_version(), Some("1.0"));
    }

    #[test]
    fn test_traverse_is_preorder_and_restartable() {
        let tree = TileTree::load(TWO_LEVEL).unwrap();
        let ids: Vec<u32> = tree.traverse().map(|n| n.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6]);

        // A second walk starts from scratch.
        assert_eq!(tree.traverse().count(), 7);

        let sub: Vec<u32> = tree.traverse_from(TileId(4)).map(|n| n.id.0).collect();
        assert_eq!(sub, vec![4, 5, 6]);
        assert_eq!(tree.traverse_from(TileId(99)).count(), 0);
    }

    #[test]
    fn test_siblings() {
        let tree = TileTree::load(TWO_LEVEL).unwrap();
        assert_eq!(tree.siblings(TileId(2)).collect::<Vec<_>>(), vec![TileId(3)]);
        assert_eq!(tree.siblings(TileId::ROOT).count(), 0);
        assert!(tree.is_leaf(TileId(2)));
        assert!(!tree.is_leaf(TileId(1)));
    }

    #[test]
    fn test_content_uris_resolve_against_manifest() {
        let tree = TileTree::load_with_base(TWO_LEVEL, "https://tiles.example/city/tileset.json")
            .unwrap();
        assert_eq!(
            tree.get(TileId(2)).unwrap().content.as_deref(),
            Some("https://tiles.example/city/a/0.b3dm")
        );
    }

    #[test]
    fn test_resolve_uri() {
        assert_eq!(resolve_uri("data/", "x.b3dm"), "data/x.b3dm");
        assert_eq!(resolve_uri("data/city/", "../x.b3dm"), "data/x.b3dm");
        assert_eq!(resolve_uri("data/", "./a/x.b3dm"), "data/a/x.b3dm");
        assert_eq!(resolve_uri("data/", "http://cdn/x.b3dm"), "http://cdn/x.b3dm");
        assert_eq!(resolve_uri("", "x.b3dm"), "x.b3dm");
        assert_eq!(resolve_uri("http://host/", "../x.b3dm"), "http://host/x.b3dm");
    }

    #[test]
    fn test_refine_is_inherited() {
        let tree = TileTree::load(
            r#"{ "root": {
                "boundingVolume": { "sphere": [0,0,0,1] }, "geometricError": 1, "refine": "ADD",
                "children": [ { "boundingVolume": { "sphere": [0,0,0,1] }, "geometricError": 0 } ]
            } }"#,
        )
        .unwrap();
        assert_eq!(tree.get(TileId(1)).unwrap().refine, Refine::Add);
    }

    #[test]
    fn test_transform_applies_to_children() {
        let tree = TileTree::load(
            r#"{ "root": {
                "boundingVolume": { "sphere": [0,0,0,1] }, "geometricError": 1,
                "transform": [1,0,0,0, 0,1,0,0, 0,0,1,0, 100,0,0,1],
                "children": [ { "boundingVolume": { "sphere": [1,0,0,1] }, "geometricError": 0 } ]
            } }"#,
        )
        .unwrap();
        let child = tree.get(TileId(1)).unwrap();
        assert!((child.bounding_volume.center().x - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_manifests() {
        let cases = [
            "not json",
            r#"{ "asset": {} }"#,
            r#"{ "root": { "geometricError": 1 } }"#,
            r#"{ "root": { "boundingVolume": { "sphere": [0,0,0,1] } } }"#,
            r#"{ "root": { "boundingVolume": { "sphere": [0,0,0,1] }, "geometricError": -1 } }"#,
            r#"{ "root": { "boundingVolume": { "box": [0,0,0] }, "geometricError": 1 } }"#,
            r#"{ "root": { "boundingVolume": { "sphere": [0,0,0,1] }, "geometricError": 1, "transform": [1,0,0] } }"#,
        ];
        for case in cases {
            assert!(
                matches!(TileTree::load(case), Err(Error::ManifestInvalid { .. })),
                "expected {case} to be rejected"
            );
        }
    }
}
