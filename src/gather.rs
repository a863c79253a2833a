//! N-dimensional strided copy between buffers laid out as different regions
//!
//! Every buffer the engine handles is a dense row-major image of some
//! [`Dataspace`]: a caller's write buffer is an image of the write subspace,
//! a fragment payload is an image of the fragment's region, and a read
//! buffer is an image of the query subspace. Moving data between them is
//! always "copy this sub-box from one frame to another", which is what
//! [`copy_region`] does.

use crate::dataspace::Dataspace;
use crate::error::{EsdmError, Result};

/// Copy `region` out of `src` (an image of `src_space`) into `dst` (an image
/// of `dst_space`).
///
/// All three regions use absolute coordinates. `region` must be contained
/// in both frames and share their element type.
pub fn copy_region(
    src: &[u8],
    src_space: &Dataspace,
    dst: &mut [u8],
    dst_space: &Dataspace,
    region: &Dataspace,
) -> Result<()> {
    src_space.check_compatible(region)?;
    dst_space.check_compatible(region)?;
    if !src_space.contains(region) || !dst_space.contains(region) {
        return Err(EsdmError::InvalidArgument(format!(
            "copy region {} is outside source {} or destination {}",
            region, src_space, dst_space
        )));
    }
    if (src.len() as u64) < src_space.byte_size() {
        return Err(EsdmError::InvalidArgument(format!(
            "source buffer holds {} bytes, {} needs {}",
            src.len(),
            src_space,
            src_space.byte_size()
        )));
    }
    if (dst.len() as u64) < dst_space.byte_size() {
        return Err(EsdmError::InvalidArgument(format!(
            "destination buffer holds {} bytes, {} needs {}",
            dst.len(),
            dst_space,
            dst_space.byte_size()
        )));
    }
    if region.is_empty() {
        return Ok(());
    }

    let elem = region.data_type().size_in_bytes();
    let rank = region.rank();
    let sizes = region.sizes();

    // Fold trailing axes that span both frames completely into one run.
    let mut run: u64 = 1;
    let mut outer = rank;
    while outer > 0 {
        outer -= 1;
        run *= sizes[outer];
        if sizes[outer] != src_space.sizes()[outer] || sizes[outer] != dst_space.sizes()[outer] {
            break;
        }
    }
    let run_bytes = run as usize * elem;

    let src_strides = src_space.strides();
    let dst_strides = dst_space.strides();
    let mut src_base: u64 = 0;
    let mut dst_base: u64 = 0;
    for axis in 0..rank {
        let pos = region.offset()[axis];
        src_base += (pos - src_space.offset()[axis]) as u64 * src_strides[axis];
        dst_base += (pos - dst_space.offset()[axis]) as u64 * dst_strides[axis];
    }

    let mut index = vec![0u64; outer];
    loop {
        let mut s = src_base;
        let mut d = dst_base;
        for (axis, &i) in index.iter().enumerate() {
            s += i * src_strides[axis];
            d += i * dst_strides[axis];
        }
        let s = s as usize * elem;
        let d = d as usize * elem;
        dst[d..d + run_bytes].copy_from_slice(&src[s..s + run_bytes]);

        // Advance the odometer over the outer axes, last axis fastest.
        let mut axis = outer;
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < sizes[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

/// Extract `region` from `src` into a freshly allocated dense buffer
pub fn extract(src: &[u8], src_space: &Dataspace, region: &Dataspace) -> Result<Vec<u8>> {
    let mut out = vec![0u8; region.byte_size() as usize];
    copy_region(src, src_space, &mut out, region, region)?;
    Ok(out)
}
