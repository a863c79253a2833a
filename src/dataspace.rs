//! Dataspace geometry - typed N-dimensional regions and their arithmetic
//!
//! A [`Dataspace`] is a hyper-rectangle `[offset, offset + size)` per axis,
//! tagged with the element type stored in it. A dataset's declared shape is
//! a dataspace with a zero offset; subspaces carry absolute offsets in the
//! dataset's coordinate frame.

use crate::error::{EsdmError, Result};
use crate::types::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum supported rank
pub const MAX_DIMS: usize = 16;

/// Typed N-dimensional region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDataspace", into = "RawDataspace")]
pub struct Dataspace {
    data_type: DataType,
    sizes: Vec<u64>,
    offset: Vec<i64>,
}

/// Wire form; validated on the way back in
#[derive(Clone, Serialize, Deserialize)]
struct RawDataspace {
    #[serde(rename = "type")]
    data_type: DataType,
    sizes: Vec<u64>,
    offset: Vec<i64>,
}

impl TryFrom<RawDataspace> for Dataspace {
    type Error = EsdmError;

    fn try_from(raw: RawDataspace) -> Result<Self> {
        Dataspace::with_offset(raw.data_type, raw.sizes, raw.offset)
    }
}

impl From<Dataspace> for RawDataspace {
    fn from(space: Dataspace) -> Self {
        RawDataspace {
            data_type: space.data_type,
            sizes: space.sizes,
            offset: space.offset,
        }
    }
}

impl Dataspace {
    /// Create a dataspace rooted at the origin.
    ///
    /// `sizes` may only be absent for a rank-0 (scalar) dataspace.
    pub fn create(dim_count: usize, sizes: Option<&[u64]>, data_type: DataType) -> Result<Self> {
        if dim_count > MAX_DIMS {
            return Err(EsdmError::InvalidArgument(format!(
                "rank {} exceeds the maximum of {}",
                dim_count, MAX_DIMS
            )));
        }

        let sizes = match sizes {
            Some(sizes) => sizes,
            None if dim_count == 0 => &[],
            None => {
                return Err(EsdmError::InvalidArgument(
                    "sizes are required for a non-scalar dataspace".to_string(),
                ))
            }
        };

        if sizes.len() != dim_count {
            return Err(EsdmError::InvalidArgument(format!(
                "expected {} sizes, got {}",
                dim_count,
                sizes.len()
            )));
        }

        Self::with_offset(data_type, sizes.to_vec(), vec![0; dim_count])
    }

    /// Create an origin-rooted dataspace from its sizes
    pub fn new(sizes: &[u64], data_type: DataType) -> Result<Self> {
        Self::create(sizes.len(), Some(sizes), data_type)
    }

    /// Build a region from raw parts, validating rank, sign, and overflow.
    pub(crate) fn with_offset(data_type: DataType, sizes: Vec<u64>, offset: Vec<i64>) -> Result<Self> {
        if sizes.len() > MAX_DIMS {
            return Err(EsdmError::InvalidArgument(format!(
                "rank {} exceeds the maximum of {}",
                sizes.len(),
                MAX_DIMS
            )));
        }
        if sizes.len() != offset.len() {
            return Err(EsdmError::InvalidArgument(format!(
                "{} sizes but {} offsets",
                sizes.len(),
                offset.len()
            )));
        }

        let mut elements: u64 = 1;
        for (axis, (&size, &off)) in sizes.iter().zip(offset.iter()).enumerate() {
            if off < 0 {
                return Err(EsdmError::InvalidArgument(format!(
                    "negative offset {} on axis {}",
                    off, axis
                )));
            }
            let size_i64 = i64::try_from(size).map_err(|_| {
                EsdmError::InvalidArgument(format!("size {} on axis {} is too large", size, axis))
            })?;
            if off.checked_add(size_i64).is_none() {
                return Err(EsdmError::InvalidArgument(format!(
                    "offset + size overflows on axis {}",
                    axis
                )));
            }
            elements = elements.checked_mul(size).ok_or_else(|| {
                EsdmError::InvalidArgument("element count overflows u64".to_string())
            })?;
        }
        elements
            .checked_mul(data_type.size_in_bytes() as u64)
            .ok_or_else(|| EsdmError::InvalidArgument("byte size overflows u64".to_string()))?;

        Ok(Self {
            data_type,
            sizes,
            offset,
        })
    }

    /// Derive a region of `self`.
    ///
    /// `offset` is absolute; the region must lie inside `self` on every axis.
    pub fn subspace(&self, sizes: &[u64], offset: &[i64]) -> Result<Self> {
        if sizes.len() != self.rank() || offset.len() != self.rank() {
            return Err(EsdmError::InvalidArgument(format!(
                "subspace rank ({} sizes, {} offsets) does not match parent rank {}",
                sizes.len(),
                offset.len(),
                self.rank()
            )));
        }

        let sub = Self::with_offset(self.data_type, sizes.to_vec(), offset.to_vec())?;
        if !self.contains(&sub) {
            return Err(EsdmError::InvalidArgument(format!(
                "subspace {} is not contained in {}",
                sub, self
            )));
        }
        Ok(sub)
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[u64] {
        &self.sizes
    }

    pub fn offset(&self) -> &[i64] {
        &self.offset
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Exclusive upper bound on an axis
    pub fn end(&self, axis: usize) -> i64 {
        self.offset[axis] + self.sizes[axis] as i64
    }

    /// Number of elements (1 for a scalar, 0 if any axis is empty)
    pub fn element_count(&self) -> u64 {
        self.sizes.iter().product()
    }

    pub fn byte_size(&self) -> u64 {
        self.element_count() * self.data_type.size_in_bytes() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.element_count() == 0
    }

    /// Row-major strides in elements (last axis contiguous)
    pub fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1u64; self.rank()];
        for axis in (0..self.rank().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.sizes[axis + 1];
        }
        strides
    }

    /// Whether `other` lies entirely inside `self`
    pub fn contains(&self, other: &Dataspace) -> bool {
        other.rank() == self.rank()
            && (0..self.rank())
                .all(|axis| other.offset[axis] >= self.offset[axis] && other.end(axis) <= self.end(axis))
    }

    /// Whether the two regions share at least one element
    pub fn overlaps(&self, other: &Dataspace) -> bool {
        self.overlap(other).map(|o| !o.is_empty()).unwrap_or(false)
    }

    /// Per-axis intersection. Disjoint inputs give an empty region.
    pub fn overlap(&self, other: &Dataspace) -> Result<Dataspace> {
        self.check_compatible(other)?;

        let mut sizes = Vec::with_capacity(self.rank());
        let mut offset = Vec::with_capacity(self.rank());
        for axis in 0..self.rank() {
            let lo = self.offset[axis].max(other.offset[axis]);
            let hi = self.end(axis).min(other.end(axis));
            offset.push(lo);
            sizes.push(if hi > lo { (hi - lo) as u64 } else { 0 });
        }

        Ok(Dataspace {
            data_type: self.data_type,
            sizes,
            offset,
        })
    }

    /// The parts of `self` not covered by `other`, as disjoint boxes.
    pub fn difference(&self, other: &Dataspace) -> Result<Vec<Dataspace>> {
        let inter = self.overlap(other)?;
        if inter.is_empty() {
            return Ok(if self.is_empty() { Vec::new() } else { vec![self.clone()] });
        }

        let mut pieces = Vec::new();
        let mut rest = self.clone();
        for axis in 0..self.rank() {
            if rest.offset[axis] < inter.offset[axis] {
                let mut below = rest.clone();
                below.sizes[axis] = (inter.offset[axis] - rest.offset[axis]) as u64;
                pieces.push(below);
            }
            if inter.end(axis) < rest.end(axis) {
                let mut above = rest.clone();
                above.offset[axis] = inter.end(axis);
                above.sizes[axis] = (rest.end(axis) - inter.end(axis)) as u64;
                pieces.push(above);
            }
            rest.offset[axis] = inter.offset[axis];
            rest.sizes[axis] = inter.sizes[axis];
        }
        Ok(pieces)
    }

    /// Same rank and element type
    pub fn check_compatible(&self, other: &Dataspace) -> Result<()> {
        if self.rank() != other.rank() {
            return Err(EsdmError::InvalidArgument(format!(
                "rank mismatch: {} vs {}",
                self.rank(),
                other.rank()
            )));
        }
        if self.data_type != other.data_type {
            return Err(EsdmError::InvalidArgument(format!(
                "type mismatch: {} vs {}",
                self.data_type, other.data_type
            )));
        }
        Ok(())
    }

    /// Compact binary encoding, used to persist a fragment's region
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for Dataspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |parts: Vec<String>, sep: &str| parts.join(sep);
        write!(
            f,
            "{}[{}]@({})",
            self.data_type,
            join(self.sizes.iter().map(|s| s.to_string()).collect(), "x"),
            join(self.offset.iter().map(|o| o.to_string()).collect(), ",")
        )
    }
}

/// Parts of `query` left uncovered by the union of `regions`
pub fn uncovered<'a>(
    query: &Dataspace,
    regions: impl IntoIterator<Item = &'a Dataspace>,
) -> Result<Vec<Dataspace>> {
    let mut remaining = if query.is_empty() {
        Vec::new()
    } else {
        vec![query.clone()]
    };

    for region in regions {
        if remaining.is_empty() {
            break;
        }
        let mut next = Vec::with_capacity(remaining.len());
        for piece in &remaining {
            next.extend(piece.difference(region)?);
        }
        remaining = next;
    }

    Ok(remaining)
}
