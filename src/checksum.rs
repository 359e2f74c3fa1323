//! CRC32 combination for parallel checksum accounting.
//!
//! Workers hash their own block with `crc32fast`; the control thread folds
//! the per-block values into the stream total with `crc32_combine` instead
//! of rescanning the concatenated bytes. The combination is the zlib/pigz
//! GF(2) matrix trick: appending `len2` bytes to a stream multiplies its
//! CRC register by x^(8*len2) modulo the CRC-32 generator, and that operator
//! is built by repeated squaring of the one-zero-bit matrix.

/// CRC-32 generator polynomial, reflected form (RFC 1952 / zlib).
const CRC32_POLY: u32 = 0xedb8_8320;

/// Multiply the GF(2) 32x32 matrix `mat` by the vector `vec`.
#[inline]
fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0u32;
    let mut row = 0usize;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[row];
        }
        vec >>= 1;
        row += 1;
    }
    sum
}

/// Square a GF(2) matrix: `square = mat * mat`.
#[inline]
fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// Combine two CRC32 values: `crc1` over `len1` bytes followed by `crc2`
/// over `len2` bytes yields the CRC32 of the concatenation. `len1` is not
/// needed by the algebra, only `len2`.
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32]; // operator for 2^k zero bits, k even
    let mut odd = [0u32; 32]; // operator for 2^k zero bits, k odd

    // Operator for one zero bit: the CRC shift register step.
    odd[0] = CRC32_POLY;
    let mut row = 1u32;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }

    // Square to get operators for two and four zero bits.
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    // Apply len2 zero *bytes* to crc1, one bit of len2 at a time.
    let mut crc1 = crc1;
    let mut len2 = len2;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

/// Running CRC32 + length accumulator for one stream.
///
/// Owned by the pipeline control thread and fed per-block values strictly in
/// flush order; never shared with workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamChecksum {
    crc: u32,
    len: u64,
}

impl StreamChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the CRC of the next `len` uncompressed bytes.
    pub fn push(&mut self, crc: u32, len: u64) {
        self.crc = if self.len == 0 {
            crc
        } else {
            crc32_combine(self.crc, crc, len)
        };
        self.len += len;
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn total_len(&self) -> u64 {
        self.len
    }

    /// Uncompressed length modulo 2^32, as recorded in the gzip trailer.
    pub fn isize(&self) -> u32 {
        self.len as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// xorshift64 is plenty for test data; keeps the dev-dependency list flat.
    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len).map(|_| xorshift(&mut state) as u8).collect()
    }

    #[test]
    fn combine_matches_single_pass_for_random_splits() {
        let data = random_bytes(100_000, 0x1234_5678);
        let reference = crc32fast::hash(&data);

        let mut state = 0xdead_beef_u64;
        for _ in 0..20 {
            let split = (xorshift(&mut state) as usize) % (data.len() + 1);
            let (a, b) = data.split_at(split);
            let combined = crc32_combine(crc32fast::hash(a), crc32fast::hash(b), b.len() as u64);
            assert_eq!(combined, reference, "split at {}", split);
        }
    }

    #[test]
    fn combine_with_empty_halves() {
        let data = b"some modest payload";
        let crc = crc32fast::hash(data);
        assert_eq!(crc32_combine(crc, crc32fast::hash(b""), 0), crc);
        assert_eq!(crc32_combine(crc32fast::hash(b""), crc, data.len() as u64), crc);
    }

    #[test]
    fn stream_checksum_accumulates_block_splits() {
        let data = random_bytes(300_000, 42);
        let reference = crc32fast::hash(&data);

        for block_size in [1usize, 7, 1024, 65_536, 131_072, 300_000] {
            let mut acc = StreamChecksum::new();
            for chunk in data.chunks(block_size) {
                acc.push(crc32fast::hash(chunk), chunk.len() as u64);
            }
            assert_eq!(acc.crc(), reference, "block size {}", block_size);
            assert_eq!(acc.total_len(), data.len() as u64);
        }
    }

    #[test]
    fn empty_stream_has_zero_crc_and_len() {
        let acc = StreamChecksum::new();
        assert_eq!(acc.crc(), 0);
        assert_eq!(acc.isize(), 0);
    }
}
