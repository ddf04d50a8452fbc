//! Parsing of raw tile payloads into structured content.
//!
//! [`TileContentParser`] understands the binary tile containers used by
//! 3D Tiles (`b3dm`, `i3dm`, `pnts`, `cmpt`), bare glTF binaries and nested
//! tileset JSON. It validates headers and extracts the feature and batch
//! table JSON; geometry stays as bytes for the renderer.

use serde_json::Value;

use crate::error::{Error, Result};

/// Turns a downloaded payload into content stored in the cache.
pub trait ContentParser: Send + Sync + 'static {
    /// The structured content type.
    type Content: Send + Sync + 'static;

    /// Parse the payload fetched from `uri`.
    fn parse(&self, uri: &str, bytes: Vec<u8>) -> Result<Self::Content>;

    /// Memory held by parsed content, reported in cache statistics.
    /// Parsers that cannot tell report 0.
    fn byte_size(&self, _content: &Self::Content) -> usize {
        0
    }
}

/// Kind of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    /// Batched 3D model.
    Batched3dModel,
    /// Instanced 3D model.
    Instanced3dModel,
    /// Point cloud.
    PointCloud,
    /// Composite of other tiles.
    Composite,
    /// Binary glTF.
    Glb,
    /// A nested tileset manifest.
    Tileset,
}

impl ContentFormat {
    /// Short name used in logs and metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentFormat::Batched3dModel => "b3dm",
            ContentFormat::Instanced3dModel => "i3dm",
            ContentFormat::PointCloud => "pnts",
            ContentFormat::Composite => "cmpt",
            ContentFormat::Glb => "glb",
            ContentFormat::Tileset => "json",
        }
    }
}

/// Parsed tile content.
#[derive(Debug, Clone, PartialEq)]
pub struct TileContent {
    /// Payload kind.
    pub format: ContentFormat,
    /// Total payload size in bytes.
    pub byte_length: usize,
    /// Feature table JSON, if present.
    pub feature_table: Option<Value>,
    /// Batch table JSON, if present.
    pub batch_table: Option<Value>,
    /// `BATCH_LENGTH`, `INSTANCES_LENGTH` or `POINTS_LENGTH` from the
    /// feature table.
    pub feature_count: Option<u64>,
    /// Inner tiles of a composite.
    pub inner: Vec<TileContent>,
    /// Body after the header and tables (glTF for models, point data for
    /// point clouds, the whole document for tilesets).
    pub body: Vec<u8>,
}

/// Default parser producing [`TileContent`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TileContentParser;

impl ContentParser for TileContentParser {
    type Content = TileContent;

    fn parse(&self, uri: &str, bytes: Vec<u8>) -> Result<TileContent> {
        let content = parse_content(&bytes)?;
        tracing::debug!(
            uri,
            format = content.format.as_str(),
            bytes = content.byte_length,
            "parsed tile content"
        );
        Ok(content)
    }

    fn byte_size(&self, content: &TileContent) -> usize {
        content.byte_length
    }
}

/// Parse a payload, dispatching on its magic bytes.
pub fn parse_content(bytes: &[u8]) -> Result<TileContent> {
    let magic = bytes.get(..4).ok_or_else(|| {
        Error::content("tile header", format!("payload is only {} bytes", bytes.len()))
    })?;

    match magic {
        b"b3dm" => parse_tables(bytes, ContentFormat::Batched3dModel, 28, "BATCH_LENGTH"),
        b"i3dm" => parse_tables(bytes, ContentFormat::Instanced3dModel, 32, "INSTANCES_LENGTH"),
        b"pnts" => parse_tables(bytes, ContentFormat::PointCloud, 28, "POINTS_LENGTH"),
        b"cmpt" => parse_composite(bytes),
        b"glTF" => {
            let byte_length = declared_length(bytes, "glb")?;
            if byte_length < GLB_HEADER_LENGTH {
                return Err(Error::content("glb", "byteLength shorter than the header"));
            }
            Ok(TileContent {
                format: ContentFormat::Glb,
                byte_length,
                feature_table: None,
                batch_table: None,
                feature_count: None,
                inner: Vec::new(),
                body: bytes[..byte_length].to_vec(),
            })
        }
        _ if bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') => {
            let document: Value = serde_json::from_slice(bytes)
                .map_err(|e| Error::content("nested tileset", e.to_string()))?;
            if document.get("root").is_none() {
                return Err(Error::content("nested tileset", "document has no root"));
            }
            Ok(TileContent {
                format: ContentFormat::Tileset,
                byte_length: bytes.len(),
                feature_table: None,
                batch_table: None,
                feature_count: None,
                inner: Vec::new(),
                body: bytes.to_vec(),
            })
        }
        _ => Err(Error::content(
            "tile header",
            format!("unknown magic {:?}", String::from_utf8_lossy(magic)),
        )),
    }
}

/// Size of the binary glTF header, the smallest tile a composite can hold.
const GLB_HEADER_LENGTH: usize = 12;
/// Size of the composite header before the first inner tile.
const CMPT_HEADER_LENGTH: usize = 16;

fn read_u32(bytes: &[u8], offset: usize, context: &'static str) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::content(context, format!("truncated at byte {offset}")))
}

/// Read the `byteLength` header field and check it against the buffer.
fn declared_length(bytes: &[u8], context: &'static str) -> Result<usize> {
    let version = read_u32(bytes, 4, context)?;
    if !(1..=2).contains(&version) {
        return Err(Error::content(context, format!("unsupported version {version}")));
    }
    let byte_length = read_u32(bytes, 8, context)? as usize;
    if byte_length > bytes.len() {
        return Err(Error::content(
            context,
            format!("header declares {byte_length} bytes, payload has {}", bytes.len()),
        ));
    }
    Ok(byte_length)
}

fn parse_tables(
    bytes: &[u8],
    format: ContentFormat,
    header_length: usize,
    count_key: &str,
) -> Result<TileContent> {
    let context = format.as_str();
    let byte_length = declared_length(bytes, "tile header")?;
    if byte_length < header_length {
        return Err(Error::content(context, "byteLength shorter than the header"));
    }

    let feature_json = read_u32(bytes, 12, context)? as usize;
    let feature_binary = read_u32(bytes, 16, context)? as usize;
    let batch_json = read_u32(bytes, 20, context)? as usize;
    let batch_binary = read_u32(bytes, 24, context)? as usize;

    let body_start = [feature_json, feature_binary, batch_json, batch_binary]
        .iter()
        .try_fold(header_length, |acc, &len| acc.checked_add(len))
        .filter(|&end| end <= byte_length)
        .ok_or_else(|| Error::content(context, "tables extend past byteLength"))?;

    let feature_table = json_table(bytes, header_length, feature_json, context)?;
    let batch_offset = header_length + feature_json + feature_binary;
    let batch_table = json_table(bytes, batch_offset, batch_json, context)?;
    let feature_count = feature_table
        .as_ref()
        .and_then(|t| t.get(count_key))
        .and_then(Value::as_u64);

    Ok(TileContent {
        format,
        byte_length,
        feature_table,
        batch_table,
        feature_count,
        inner: Vec::new(),
        body: bytes[body_start..byte_length].to_vec(),
    })
}

fn json_table(
    bytes: &[u8],
    offset: usize,
    length: usize,
    context: &'static str,
) -> Result<Option<Value>> {
    if length == 0 {
        return Ok(None);
    }
    let slice = &bytes[offset..offset + length];
    // Tables are padded with trailing spaces; serde_json accepts those.
    serde_json::from_slice(slice)
        .map(Some)
        .map_err(|e| Error::content(context, format!("table JSON: {e}")))
}

fn parse_composite(bytes: &[u8]) -> Result<TileContent> {
    let byte_length = declared_length(bytes, "cmpt")?;
    if byte_length < CMPT_HEADER_LENGTH {
        return Err(Error::content("cmpt", "byteLength shorter than the header"));
    }
    let tiles_length = read_u32(bytes, 12, "cmpt")? as usize;
    let capacity = (byte_length - CMPT_HEADER_LENGTH) / GLB_HEADER_LENGTH;
    if tiles_length > capacity {
        return Err(Error::content(
            "cmpt",
            format!("{tiles_length} inner tiles cannot fit in {byte_length} bytes"),
        ));
    }

    let mut inner = Vec::with_capacity(tiles_length);
    let mut offset = CMPT_HEADER_LENGTH;
    for _ in 0..tiles_length {
        let rest = bytes
            .get(offset..byte_length)
            .ok_or_else(|| Error::content("cmpt", "inner tile past byteLength"))?;
        let tile = parse_content(rest)?;
        if tile.byte_length == 0 {
            return Err(Error::content("cmpt", format!("empty inner tile at byte {offset}")));
        }
        offset += tile.byte_length;
        inner.push(tile);
    }

    Ok(TileContent {
        format: ContentFormat::Composite,
        byte_length,
        feature_table: None,
        batch_table: None,
        feature_count: Some(inner.iter().filter_map(|t| t.feature_count).sum()),
        inner,
        body: Vec::new(),
    })
}

/// Build a `b3dm`/`pnts`/`i3dm` payload around a body, for synthesizing
/// content in tests and fixtures.
#[must_use]
pub fn encode_tile(magic: &[u8; 4], feature_table: &Value, body: &[u8]) -> Vec<u8> {
    let header_length = if magic == b"i3dm" { 32 } else { 28 };
    let mut feature_json = serde_json::to_vec(feature_table).unwrap_or_default();
    while (header_length + feature_json.len()) % 8 != 0 {
        feature_json.push(b' ');
    }

    let byte_length = header_length + feature_json.len() + body.len();
    let mut out = Vec::with_capacity(byte_length);
    out.extend_from_slice(magic);
    for field in [1, byte_length, feature_json.len(), 0, 0, 0] {
        out.extend_from_slice(&u32::try_from(field).unwrap_or(u32::MAX).to_le_bytes());
    }
    if header_length == 32 {
        // gltfFormat: embedded binary glTF.
        out.extend_from_slice(&1u32.to_le_bytes());
    }
    out.extend_from_slice(&feature_json);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_b3dm() {
        let payload = encode_tile(b"b3dm", &json!({ "BATCH_LENGTH": 3 }), b"glTFbody");
        let content = parse_content(&payload).unwrap();
        assert_eq!(content.format, ContentFormat::Batched3dModel);
        assert_eq!(content.byte_length, payload.len());
        assert_eq!(content.feature_count, Some(3));
        assert!(content.batch_table.is_none());
        assert_eq!(content.body, b"glTFbody");
    }

    #[test]
    fn test_parse_i3dm_and_pnts() {
        let i3dm = encode_tile(b"i3dm", &json!({ "INSTANCES_LENGTH": 12 }), b"");
        assert_eq!(parse_content(&i3dm).unwrap().feature_count, Some(12));

        let pnts = encode_tile(b"pnts", &json!({ "POINTS_LENGTH": 1000 }), &[0; 16]);
        let content = parse_content(&pnts).unwrap();
        assert_eq!(content.format, ContentFormat::PointCloud);
        assert_eq!(content.feature_count, Some(1000));
        assert_eq!(content.body.len(), 16);
    }

    #[test]
    fn test_parse_composite() {
        let a = encode_tile(b"b3dm", &json!({ "BATCH_LENGTH": 2 }), b"");
        let b = encode_tile(b"pnts", &json!({ "POINTS_LENGTH": 5 }), b"");
        let byte_length = 16 + a.len() + b.len();

        let mut payload = b"cmpt".to_vec();
        for field in [1, byte_length, 2] {
            payload.extend_from_slice(&u32::try_from(field).unwrap().to_le_bytes());
        }
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&b);

        let content = parse_content(&payload).unwrap();
        assert_eq!(content.format, ContentFormat::Composite);
        assert_eq!(content.inner.len(), 2);
        assert_eq!(content.feature_count, Some(7));
    }

    fn composite(declared_tiles: u32, tiles: &[&[u8]]) -> Vec<u8> {
        let byte_length = 16 + tiles.iter().map(|t| t.len()).sum::<usize>();
        let mut payload = b"cmpt".to_vec();
        for field in [1, u32::try_from(byte_length).unwrap(), declared_tiles] {
            payload.extend_from_slice(&field.to_le_bytes());
        }
        for tile in tiles {
            payload.extend_from_slice(tile);
        }
        payload
    }

    #[test]
    fn test_composite_rejects_degenerate_inner_tiles() {
        // A glTF header that declares zero bytes would never advance.
        let mut empty_glb = b"glTF".to_vec();
        empty_glb.extend_from_slice(&2u32.to_le_bytes());
        empty_glb.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            parse_content(&empty_glb),
            Err(Error::ContentInvalid { context: "glb", .. })
        ));
        assert!(matches!(
            parse_content(&composite(5_000_000, &[&empty_glb])),
            Err(Error::ContentInvalid { context: "cmpt", .. })
        ));
        assert!(parse_content(&composite(u32::MAX, &[])).is_err());

        // More inner tiles declared than are present.
        let tile = encode_tile(b"pnts", &json!({ "POINTS_LENGTH": 1 }), b"");
        assert!(parse_content(&composite(2, &[&tile])).is_err());
        assert_eq!(parse_content(&composite(1, &[&tile])).unwrap().inner.len(), 1);
    }

    #[test]
    fn test_parse_nested_tileset() {
        let content = parse_content(br#" { "root": { "geometricError": 1 } }"#).unwrap();
        assert_eq!(content.format, ContentFormat::Tileset);
        assert!(parse_content(br#"{ "asset": {} }"#).is_err());
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        assert!(parse_content(b"").is_err());
        assert!(parse_content(b"xyzw0000").is_err());

        // Declared length longer than the payload.
        let mut payload = encode_tile(b"b3dm", &json!({}), b"");
        payload.truncate(payload.len() - 4);
        assert!(matches!(
            parse_content(&payload),
            Err(Error::ContentInvalid { .. })
        ));

        // Feature table that is not JSON.
        let mut payload = encode_tile(b"b3dm", &json!({ "BATCH_LENGTH": 0 }), b"");
        payload[28] = b'!';
        assert!(parse_content(&payload).is_err());
    }

    #[test]
    fn test_parser_trait() {
        let payload = encode_tile(b"b3dm", &json!({}), b"");
        let content = TileContentParser.parse("a.b3dm", payload.clone()).unwrap();
        assert_eq!(content.feature_count, None);
        assert_eq!(TileContentParser.byte_size(&content), payload.len());
    }
}
