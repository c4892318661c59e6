//! Deterministic mapping from a block index to its blob name.
//!
//! The layout keeps directory fan-out bounded at 256 entries per level while
//! preserving the property that alphabetical blob listing order equals
//! numeric block order, which the framing protocol and the download pool
//! both rely on.

/// Width, in bits, of the low segment that becomes the `file` path component.
const FILE_SEGMENT_BITS: u32 = 12;

/// Maps a block index to its canonical hierarchical blob name.
///
/// This is a pure function: given the same `index` it always returns the
/// same path, and it performs no I/O.
pub fn block_path(index: u64) -> String {
    let file = index & ((1 << FILE_SEGMENT_BITS) - 1);
    let shifted = index >> FILE_SEGMENT_BITS;

    // Number of significant bits in `shifted`; 0 when `shifted` is 0, which
    // is exactly the `r = 0` root used by every index in the first 4096.
    let r: u32 = u64::BITS - shifted.leading_zeros();

    let mut segments = vec![format!("{r:02X}")];

    if r > 1 {
        let top_bit = 1u64 << (r - 1);
        let remainder = shifted & !top_bit;
        let num_subs = ((r - 2) / 8) + 1;
        for i in (0..num_subs).rev() {
            let byte = (remainder >> (8 * i)) & 0xFF;
            segments.push(format!("{byte:02X}"));
        }
    }

    segments.push(format!("{file:03X}"));
    segments.join("/")
}
