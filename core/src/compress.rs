use crate::{Error, Result};

pub const MIN_LEVEL: i32 = 1;
pub const MAX_LEVEL: i32 = 9;

fn check_level(level: i32) -> Result<()> {
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return Err(Error::Config(format!(
            "invalid compression level: {level}, must be between {MIN_LEVEL} and {MAX_LEVEL}"
        )));
    }
    Ok(())
}

/// Compress a payload with zstd at the given level (1-9).
///
/// The level travels with the bundle; decompression is parameter-free.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    check_level(level)?;
    Ok(zstd::bulk::compress(data, level)?)
}

/// Decompress a zstd payload.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::stream::decode_all(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        for level in [MIN_LEVEL, 6, MAX_LEVEL] {
            let packed = compress(&data, level).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn rejects_out_of_range_level() {
        assert!(compress(b"x", 0).is_err());
        assert!(compress(b"x", 10).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(decompress(b"definitely not zstd").is_err());
    }
}
