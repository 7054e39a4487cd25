use std::ops::Range;

/// Split of a flat buffer into fixed-size work tiles.
///
/// Each tile covers `tile_len` items starting at `index * tile_len`, extended
/// by `overlap` items into the next tile so that a match straddling a tile
/// boundary is still seen whole by exactly one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMap {
    total: usize,
    tile_len: usize,
    overlap: usize,
}

impl TileMap {
    /// Create a map covering `total` items. `tile_len` is clamped to 1.
    pub fn new(total: usize, tile_len: usize, overlap: usize) -> Self {
        Self {
            total,
            tile_len: tile_len.max(1),
            overlap,
        }
    }

    /// Number of tiles implied by this map.
    pub fn tile_count(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            (self.total - 1) / self.tile_len + 1
        }
    }

    /// Map a global index to `(tile, offset)` in its owning tile.
    pub fn map_global(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.total {
            return None;
        }
        Some((index / self.tile_len, index % self.tile_len))
    }

    /// Items owned by `tile` (no overlap).
    pub fn owned(&self, tile: usize) -> Range<usize> {
        let start = (tile * self.tile_len).min(self.total);
        let end = (start + self.tile_len).min(self.total);
        start..end
    }

    /// Items visible to `tile`: the owned range plus the overlap.
    pub fn visible(&self, tile: usize) -> Range<usize> {
        let owned = self.owned(tile);
        owned.start..(owned.end + self.overlap).min(self.total)
    }
}

/// Group line start offsets into tiles of whole lines, each roughly
/// `target_bytes` long. Returns byte ranges that never split a line.
pub fn line_tiles(data: &[u8], target_bytes: usize) -> Vec<Range<usize>> {
    let target = target_bytes.max(1);
    let mut tiles = Vec::new();
    let mut start = 0usize;
    while start < data.len() {
        let mut end = (start + target).min(data.len());
        if end < data.len() {
            end = match data[end - 1..].iter().position(|&b| b == b'\n') {
                Some(pos) => end + pos,
                None => data.len(),
            };
        }
        tiles.push(start..end);
        start = end;
    }
    tiles
}
