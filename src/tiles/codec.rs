//! Lossless block codec for tile pixels
//!
//! Pixels are byte-shuffled (all first bytes of every pixel, then all second
//! bytes, ...) and deflated with zlib. Shuffling groups the slowly varying
//! channel planes together, which is what the deflater feeds on.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{Result, TileError};

/// Largest buffer accepted as a single block.
pub const MAX_BLOCK_SIZE: usize = 1 << 31;

/// zlib level used for tiles.
pub const COMPRESSION_LEVEL: u32 = 9;

pub fn ensure_block_capacity(len: usize) -> Result<()> {
    if len > MAX_BLOCK_SIZE {
        return Err(TileError::CapacityExceeded {
            len,
            limit: MAX_BLOCK_SIZE,
        });
    }
    Ok(())
}

/// Allocates a zeroed scratch buffer, reporting failure instead of aborting.
pub fn alloc_scratch(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| TileError::AllocationFailure { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Transposes `bytes` from pixel-interleaved to plane order. Trailing bytes
/// that do not fill a whole element are copied as is.
pub fn shuffle(bytes: &[u8], typesize: usize, out: &mut [u8]) {
    debug_assert_eq!(bytes.len(), out.len());
    if typesize <= 1 {
        out.copy_from_slice(bytes);
        return;
    }
    let n = bytes.len() / typesize;
    for (i, px) in bytes.chunks_exact(typesize).enumerate() {
        for (b, &v) in px.iter().enumerate() {
            out[b * n + i] = v;
        }
    }
    let tail = n * typesize;
    out[tail..].copy_from_slice(&bytes[tail..]);
}

/// Inverse of [`shuffle`].
pub fn unshuffle(bytes: &[u8], typesize: usize, out: &mut [u8]) {
    debug_assert_eq!(bytes.len(), out.len());
    if typesize <= 1 {
        out.copy_from_slice(bytes);
        return;
    }
    let n = bytes.len() / typesize;
    for (i, px) in out.chunks_exact_mut(typesize).enumerate() {
        for (b, v) in px.iter_mut().enumerate() {
            *v = bytes[b * n + i];
        }
    }
    let tail = n * typesize;
    out[tail..].copy_from_slice(&bytes[tail..]);
}

/// Shuffles and deflates one block.
pub fn compress(bytes: &[u8], typesize: usize) -> Result<Vec<u8>> {
    ensure_block_capacity(bytes.len())?;
    let mut shuffled = alloc_scratch(bytes.len())?;
    shuffle(bytes, typesize, &mut shuffled);

    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(bytes.len() / 4),
        Compression::new(COMPRESSION_LEVEL),
    );
    encoder.write_all(&shuffled)?;
    Ok(encoder.finish()?)
}

/// Inflates and unshuffles a block into `out`, whose length must be the
/// exact uncompressed size.
pub fn decompress_into(compressed: &[u8], typesize: usize, out: &mut [u8]) -> Result<()> {
    let mut shuffled = alloc_scratch(out.len())?;
    let mut decoder = ZlibDecoder::new(compressed);
    decoder.read_exact(&mut shuffled)?;

    let mut probe = [0u8; 1];
    if decoder.read(&mut probe)? != 0 {
        return Err(TileError::contract(format!(
            "compressed block inflates past {} bytes",
            out.len()
        )));
    }

    unshuffle(&shuffled, typesize, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn shuffle_groups_planes() {
        let px = [1, 2, 3, 4, 5, 6, 7];
        let mut out = [0; 7];
        shuffle(&px, 3, &mut out);
        assert_eq!(out, [1, 4, 2, 5, 3, 6, 7]);

        let mut back = [0; 7];
        unshuffle(&out, 3, &mut back);
        assert_eq!(back, px);
    }

    #[test]
    fn noisy_block_survives_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let data: Vec<u8> = (0..4 * 257 * 3).map(|_| rng.r#gen()).collect();
        let packed = compress(&data, 4).unwrap();

        let mut out = vec![0; data.len()];
        decompress_into(&packed, 4, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn flat_block_compresses_well() {
        let data = vec![0xEE; 3 * 256 * 256];
        let packed = compress(&data, 3).unwrap();
        assert!(packed.len() * 100 < data.len());
    }

    #[test]
    fn wrong_output_size_is_rejected() {
        let data = vec![9u8; 300];
        let packed = compress(&data, 3).unwrap();

        let mut short = vec![0; 299];
        assert!(matches!(
            decompress_into(&packed, 3, &mut short),
            Err(TileError::ContractViolation { .. })
        ));

        let mut long = vec![0; 301];
        assert!(matches!(
            decompress_into(&packed, 3, &mut long),
            Err(TileError::Codec(_))
        ));
    }

    #[test]
    fn oversize_block_is_refused() {
        assert!(ensure_block_capacity(MAX_BLOCK_SIZE).is_ok());
        assert!(matches!(
            ensure_block_capacity(MAX_BLOCK_SIZE + 1),
            Err(TileError::CapacityExceeded { len, limit })
                if len == MAX_BLOCK_SIZE + 1 && limit == MAX_BLOCK_SIZE
        ));
    }
}
