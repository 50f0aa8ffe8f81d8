//! Tile descriptors, tile batches and invalidation regions.
//!
//! Wire form of a single tile:
//! ```text
//! tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840 [ver=N] [nviewid=V] [id=N] [wid=N]
//! ```
//! A batch (`tilecombine`) shares everything except position, version,
//! render id and image size, which become comma-separated lists:
//! ```text
//! tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0,0 tilewidth=3840 tileheight=3840
//! ```

use thiserror::Error;

use crate::protocol::{get_token, tokenize};

/// Errors raised while parsing tile fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TileParseError {
    #[error("missing tile field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for tile field `{field}`: `{value}`")]
    InvalidValue { field: &'static str, value: String },
    #[error("tile batch lists have different lengths")]
    MismatchedLists,
    #[error("tile batch is empty")]
    EmptyBatch,
    #[error("tiles in a batch must share part, size and view")]
    Heterogeneous,
}

fn invalid(field: &'static str, value: &str) -> TileParseError {
    TileParseError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

fn optional_int<T: std::str::FromStr>(
    tokens: &[&str],
    field: &'static str,
) -> Result<Option<T>, TileParseError> {
    match get_token(tokens, field) {
        Some(value) => value.parse().map(Some).map_err(|_| invalid(field, value)),
        None => Ok(None),
    }
}

fn required_int(tokens: &[&str], field: &'static str, min: i32) -> Result<i32, TileParseError> {
    let value: i32 =
        optional_int(tokens, field)?.ok_or(TileParseError::MissingField(field))?;
    if value < min {
        return Err(invalid(field, &value.to_string()));
    }
    Ok(value)
}

fn int_list<T: std::str::FromStr>(
    tokens: &[&str],
    field: &'static str,
) -> Result<Option<Vec<T>>, TileParseError> {
    let Some(raw) = get_token(tokens, field) else {
        return Ok(None);
    };
    raw.split(',')
        .map(|v| v.parse().map_err(|_| invalid(field, raw)))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

/// Identity of a tile in the cache: everything but version and wire bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub part: i32,
    pub view_id: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
}

/// One rectangular tile request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDesc {
    pub part: i32,
    /// Pixel size of the rendered bitmap
    pub width: i32,
    pub height: i32,
    /// Position and size in document coordinates (twips)
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
    /// Normalized view identity
    pub view_id: i32,
    /// Client-side document version the request was made against (-1 = unknown)
    pub version: i32,
    /// Render/cache sequence number; 0 when not assigned
    pub wire_id: u64,
    /// Optional client request id, echoed back
    pub request_id: Option<i32>,
    /// Byte length of the rendered image (replies only)
    pub img_size: Option<usize>,
}

impl TileDesc {
    pub fn new(
        part: i32,
        width: i32,
        height: i32,
        tile_pos_x: i32,
        tile_pos_y: i32,
        tile_width: i32,
        tile_height: i32,
    ) -> Self {
        Self {
            part,
            width,
            height,
            tile_pos_x,
            tile_pos_y,
            tile_width,
            tile_height,
            view_id: 0,
            version: -1,
            wire_id: 0,
            request_id: None,
            img_size: None,
        }
    }

    /// Parse a `tile` request or `tile:` reply line. The command word, if
    /// present, is ignored, as are unknown keys.
    pub fn parse(line: &str) -> Result<Self, TileParseError> {
        let tokens = tokenize(line);
        Self::parse_tokens(&tokens)
    }

    pub(crate) fn parse_tokens(tokens: &[&str]) -> Result<Self, TileParseError> {
        Ok(Self {
            part: required_int(tokens, "part", 0)?,
            width: required_int(tokens, "width", 1)?,
            height: required_int(tokens, "height", 1)?,
            tile_pos_x: required_int(tokens, "tileposx", 0)?,
            tile_pos_y: required_int(tokens, "tileposy", 0)?,
            tile_width: required_int(tokens, "tilewidth", 1)?,
            tile_height: required_int(tokens, "tileheight", 1)?,
            view_id: optional_int(tokens, "nviewid")?.unwrap_or(0),
            version: optional_int(tokens, "ver")?.unwrap_or(-1),
            wire_id: optional_int(tokens, "wid")?.unwrap_or(0),
            request_id: optional_int(tokens, "id")?,
            img_size: optional_int(tokens, "imgsize")?,
        })
    }

    pub fn key(&self) -> TileKey {
        TileKey {
            part: self.part,
            view_id: self.view_id,
            width: self.width,
            height: self.height,
            tile_pos_x: self.tile_pos_x,
            tile_pos_y: self.tile_pos_y,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
        }
    }

    /// Serialize as `<prefix> part=… … <suffix>`.
    ///
    /// `prefix` is the command word (`tile` towards the engine, `tile:` in
    /// replies); `suffix` is appended verbatim, e.g. `" renderid=cached"`.
    pub fn serialize(&self, prefix: &str, suffix: &str) -> String {
        let mut line = format!(
            "{prefix} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={} ver={} nviewid={}",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
            self.version,
            self.view_id,
        );
        if let Some(id) = self.request_id {
            line.push_str(&format!(" id={id}"));
        }
        if self.wire_id != 0 {
            line.push_str(&format!(" wid={}", self.wire_id));
        }
        if let Some(size) = self.img_size {
            line.push_str(&format!(" imgsize={size}"));
        }
        line.push_str(suffix);
        line
    }
}

/// A `tilecombine` request: tiles sharing part, pixel size, tile size and view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBatch {
    tiles: Vec<TileDesc>,
}

impl TileBatch {
    /// Group tiles into a batch. All tiles must agree on part, sizes and view.
    pub fn new(tiles: Vec<TileDesc>) -> Result<Self, TileParseError> {
        let first = tiles.first().ok_or(TileParseError::EmptyBatch)?;
        let shared = |t: &TileDesc| {
            (t.part, t.width, t.height, t.tile_width, t.tile_height, t.view_id)
        };
        let expected = shared(first);
        if tiles.iter().any(|t| shared(t) != expected) {
            return Err(TileParseError::Heterogeneous);
        }
        Ok(Self { tiles })
    }

    /// Parse a `tilecombine` request or `tilecombine:` reply line.
    pub fn parse(line: &str) -> Result<Self, TileParseError> {
        let tokens = tokenize(line);
        let part = required_int(&tokens, "part", 0)?;
        let width = required_int(&tokens, "width", 1)?;
        let height = required_int(&tokens, "height", 1)?;
        let tile_width = required_int(&tokens, "tilewidth", 1)?;
        let tile_height = required_int(&tokens, "tileheight", 1)?;
        let view_id = optional_int(&tokens, "nviewid")?.unwrap_or(0);
        let request_id = optional_int(&tokens, "id")?;

        let xs: Vec<i32> =
            int_list(&tokens, "tileposx")?.ok_or(TileParseError::MissingField("tileposx"))?;
        let ys: Vec<i32> =
            int_list(&tokens, "tileposy")?.ok_or(TileParseError::MissingField("tileposy"))?;
        let versions: Option<Vec<i32>> = int_list(&tokens, "ver")?;
        let wire_ids: Option<Vec<u64>> = int_list(&tokens, "wid")?;
        let img_sizes: Option<Vec<usize>> = int_list(&tokens, "imgsize")?;

        let count = xs.len();
        let same_len = |len: Option<usize>| len.map_or(true, |l| l == count);
        if ys.len() != count
            || !same_len(versions.as_ref().map(Vec::len))
            || !same_len(wire_ids.as_ref().map(Vec::len))
            || !same_len(img_sizes.as_ref().map(Vec::len))
        {
            return Err(TileParseError::MismatchedLists);
        }
        if xs.iter().chain(ys.iter()).any(|v| *v < 0) {
            return Err(invalid("tilepos", &format!("{xs:?} {ys:?}")));
        }

        let tiles = (0..count)
            .map(|i| TileDesc {
                part,
                width,
                height,
                tile_pos_x: xs[i],
                tile_pos_y: ys[i],
                tile_width,
                tile_height,
                view_id,
                version: versions.as_ref().map_or(-1, |v| v[i]),
                wire_id: wire_ids.as_ref().map_or(0, |w| w[i]),
                request_id,
                img_size: img_sizes.as_ref().map(|s| s[i]),
            })
            .collect();
        Self::new(tiles)
    }

    pub fn tiles(&self) -> &[TileDesc] {
        &self.tiles
    }

    pub fn into_tiles(self) -> Vec<TileDesc> {
        self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Serialize as `<prefix> part=… tileposx=a,b,… <suffix>`. Render ids and
    /// image sizes are listed only when every tile carries one.
    pub fn serialize(&self, prefix: &str, suffix: &str) -> String {
        let first = &self.tiles[0];
        let mut line = format!(
            "{prefix} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={} ver={} nviewid={}",
            first.part,
            first.width,
            first.height,
            join(self.tiles.iter().map(|t| t.tile_pos_x)),
            join(self.tiles.iter().map(|t| t.tile_pos_y)),
            first.tile_width,
            first.tile_height,
            join(self.tiles.iter().map(|t| t.version)),
            first.view_id,
        );
        if let Some(id) = first.request_id {
            line.push_str(&format!(" id={id}"));
        }
        if self.tiles.iter().all(|t| t.wire_id != 0) {
            line.push_str(&format!(" wid={}", join(self.tiles.iter().map(|t| t.wire_id))));
        }
        let sizes: Option<Vec<usize>> = self.tiles.iter().map(|t| t.img_size).collect();
        if let Some(sizes) = sizes {
            line.push_str(&format!(" imgsize={}", join(sizes.into_iter())));
        }
        line.push_str(suffix);
        line
    }
}

/// Region named by an engine `invalidatetiles:` message.
///
/// `part == -1` matches every part and `view_id == -1` every view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateRegion {
    pub part: i32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub view_id: i32,
}

impl InvalidateRegion {
    /// The whole document, every part and view.
    pub fn everything() -> Self {
        Self {
            part: -1,
            x: 0,
            y: 0,
            width: i32::MAX,
            height: i32::MAX,
            view_id: -1,
        }
    }

    /// Parse `invalidatetiles: EMPTY` or
    /// `invalidatetiles: part=P x=X y=Y width=W height=H [nviewid=V]`.
    pub fn parse(line: &str) -> Result<Self, TileParseError> {
        let tokens = tokenize(line);
        if tokens.get(1) == Some(&"EMPTY") {
            return Ok(Self::everything());
        }
        Ok(Self {
            part: required_int(&tokens, "part", -1)?,
            x: required_int(&tokens, "x", 0)?,
            y: required_int(&tokens, "y", 0)?,
            width: required_int(&tokens, "width", 0)?,
            height: required_int(&tokens, "height", 0)?,
            view_id: optional_int(&tokens, "nviewid")?.unwrap_or(-1),
        })
    }

    /// Whether the tile overlaps this region (half-open rectangles) and
    /// matches its part and view.
    pub fn covers(&self, key: &TileKey) -> bool {
        if self.part != -1 && key.part != self.part {
            return false;
        }
        if self.view_id != -1 && key.view_id != self.view_id {
            return false;
        }
        let (x, y) = (i64::from(self.x), i64::from(self.y));
        let (w, h) = (i64::from(self.width), i64::from(self.height));
        let (tx, ty) = (i64::from(key.tile_pos_x), i64::from(key.tile_pos_y));
        let (tw, th) = (i64::from(key.tile_width), i64::from(key.tile_height));
        tx < x + w && x < tx + tw && ty < y + h && y < ty + th
    }
}
