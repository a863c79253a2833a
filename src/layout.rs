//! Fragment layout - how a write region is divided into fragments

use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};

/// Upper bound on fragment size used to tile writes.
///
/// Tiles are cut along the outermost axis first: each tile spans complete
/// slabs of the inner axes whenever a single slab fits the bound, and only
/// when it does not is the next axis split as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilingPolicy {
    max_fragment_bytes: Option<u64>,
}

impl TilingPolicy {
    /// One fragment per write
    pub fn unbounded() -> Self {
        Self {
            max_fragment_bytes: None,
        }
    }

    /// Fragments no larger than `bytes`
    pub fn with_max_bytes(bytes: u64) -> Self {
        Self {
            max_fragment_bytes: Some(bytes),
        }
    }

    pub fn max_fragment_bytes(&self) -> Option<u64> {
        self.max_fragment_bytes
    }

    /// Split `region` into disjoint tiles that together cover it exactly.
    pub fn tile(&self, region: &Dataspace) -> Result<Vec<Dataspace>> {
        if region.is_empty() {
            return Ok(Vec::new());
        }
        let bound = match self.max_fragment_bytes {
            Some(bound) if region.byte_size() > bound => bound,
            _ => return Ok(vec![region.clone()]),
        };
        if region.rank() == 0 || (region.data_type().size_in_bytes() as u64) > bound {
            return Err(EsdmError::CapabilityMismatch(format!(
                "maximum fragment size of {} bytes cannot hold a single {} element",
                bound,
                region.data_type()
            )));
        }

        let mut tiles = Vec::new();
        tile_axis(region, 0, bound, &mut tiles)?;
        Ok(tiles)
    }
}

/// Bytes in one index step along `axis` (a full slab of the inner axes)
fn slab_bytes(region: &Dataspace, axis: usize) -> u64 {
    let inner: u64 = region.sizes()[axis + 1..].iter().product();
    inner * region.data_type().size_in_bytes() as u64
}

fn replace_axis(region: &Dataspace, axis: usize, offset: i64, size: u64) -> Result<Dataspace> {
    let mut sizes = region.sizes().to_vec();
    let mut offsets = region.offset().to_vec();
    sizes[axis] = size;
    offsets[axis] = offset;
    Dataspace::with_offset(region.data_type(), sizes, offsets)
}

fn tile_axis(region: &Dataspace, axis: usize, bound: u64, out: &mut Vec<Dataspace>) -> Result<()> {
    let slab = slab_bytes(region, axis);
    let extent = region.sizes()[axis];
    let origin = region.offset()[axis];

    if slab > bound {
        // A single slab is too big: take one index at a time and split deeper.
        for i in 0..extent {
            let row = replace_axis(region, axis, origin + i as i64, 1)?;
            tile_axis(&row, axis + 1, bound, out)?;
        }
        return Ok(());
    }

    let step = (bound / slab).max(1);
    let mut start = 0u64;
    while start < extent {
        let len = step.min(extent - start);
        out.push(replace_axis(region, axis, origin + start as i64, len)?);
        start += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataspace::uncovered;
    use crate::types::DataType;

    fn grid() -> Dataspace {
        Dataspace::new(&[10, 20], DataType::U64).unwrap()
    }

    fn assert_exact_cover(region: &Dataspace, tiles: &[Dataspace]) {
        assert!(uncovered(region, tiles).unwrap().is_empty());
        let total: u64 = tiles.iter().map(|t| t.element_count()).sum();
        assert_eq!(total, region.element_count());
    }

    #[test]
    fn test_unbounded_is_single_fragment() {
        let tiles = TilingPolicy::unbounded().tile(&grid()).unwrap();
        assert_eq!(tiles, vec![grid()]);

        let tiles = TilingPolicy::with_max_bytes(1 << 20).tile(&grid()).unwrap();
        assert_eq!(tiles.len(), 1);
    }

    #[test]
    fn test_outer_axis_first() {
        // 20 u64 per row = 160 bytes; 400 bytes fit two whole rows
        let tiles = TilingPolicy::with_max_bytes(400).tile(&grid()).unwrap();
        assert_eq!(tiles.len(), 5);
        for (i, tile) in tiles.iter().enumerate() {
            assert_eq!(tile.sizes(), &[2, 20]);
            assert_eq!(tile.offset(), &[2 * i as i64, 0]);
        }
        assert_exact_cover(&grid(), &tiles);
    }

    #[test]
    fn test_splits_inner_axis_when_slab_too_big() {
        // a row is 160 bytes; 100 bytes hold 12 elements
        let tiles = TilingPolicy::with_max_bytes(100).tile(&grid()).unwrap();
        assert_eq!(tiles.len(), 20);
        assert_eq!(tiles[0].sizes(), &[1, 12]);
        assert_eq!(tiles[1].sizes(), &[1, 8]);
        assert_eq!(tiles[1].offset(), &[0, 12]);
        assert!(tiles.iter().all(|t| t.byte_size() <= 100));
        assert_exact_cover(&grid(), &tiles);
    }

    #[test]
    fn test_respects_subspace_origin() {
        let sub = grid().subspace(&[4, 10], &[3, 5]).unwrap();
        let tiles = TilingPolicy::with_max_bytes(160).tile(&sub).unwrap();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[0].offset(), &[3, 5]);
        assert_eq!(tiles[1].offset(), &[5, 5]);
        assert_exact_cover(&sub, &tiles);
    }

    #[test]
    fn test_bound_below_element_width() {
        let err = TilingPolicy::with_max_bytes(4).tile(&grid()).unwrap_err();
        assert!(matches!(err, EsdmError::CapabilityMismatch(_)));
    }

    #[test]
    fn test_empty_region_has_no_tiles() {
        let empty = Dataspace::new(&[0, 20], DataType::U64).unwrap();
        assert!(TilingPolicy::with_max_bytes(8).tile(&empty).unwrap().is_empty());
    }
}
