//! Chunked incremental reconstruction of missing data blocks.

use log::{debug, trace};

use crate::{error::Error, gf16::GfTables};

use super::matrix::RsMatrix;

/// Default chunk length; memory use is bounded by
/// `chunk × (missing + recovery blocks used)`.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// A data block that is still intact, with the base value it was encoded
/// under. `data` may be shorter than the block size; the tail is zeros.
pub(crate) struct PresentBlock<'a> {
    pub(crate) base: u16,
    pub(crate) data: &'a [u8],
}

/// One usable recovery block.
pub(crate) struct RecoveryBlock<'a> {
    pub(crate) exponent: u32,
    pub(crate) data: &'a [u8],
}

pub(crate) struct ChunkedRecoverer<'a> {
    gf: &'a GfTables,
    block_size: usize,
    chunk_size: usize,
}

impl<'a> ChunkedRecoverer<'a> {
    pub(crate) fn new(gf: &'a GfTables, block_size: usize, chunk_size: usize) -> Self {
        // Chunks hold whole 16-bit words and never exceed a block.
        let chunk_size = chunk_size.min(block_size).max(2) & !1;
        Self {
            gf,
            block_size,
            chunk_size,
        }
    }

    /// Solves for the missing blocks and returns them in `missing_bases`
    /// order, each exactly one block long.
    pub(crate) fn recover(
        &self,
        present: &[PresentBlock<'_>],
        missing_bases: &[u16],
        recovery: &[RecoveryBlock<'_>],
    ) -> Result<Vec<Vec<u8>>, Error> {
        let m = missing_bases.len();
        if m == 0 {
            return Ok(Vec::new());
        }
        if recovery.len() < m {
            return Err(Error::Par2InsufficientRecovery {
                needed: m,
                have: recovery.len(),
            });
        }
        let recovery = &recovery[..m];
        let exponents: Vec<u32> = recovery.iter().map(|r| r.exponent).collect();

        let matrix = RsMatrix::vandermonde(self.gf, missing_bases, &exponents);
        let inverse = matrix.inverted(self.gf)?;
        debug!(
            "recovery matrix {}x{} inverted, chunk size {}",
            m, m, self.chunk_size
        );

        let mut outputs = vec![vec![0u8; self.block_size]; m];
        let mut syndromes = vec![vec![0u8; self.chunk_size]; m];
        let mut padded = vec![0u8; self.chunk_size];

        let mut offset = 0usize;
        while offset < self.block_size {
            let chunk = self.chunk_size.min(self.block_size - offset);
            trace!("recovering chunk at {offset}, {chunk} bytes");

            // b_i = R_e_i ⊕ Σ_{k present} pow(base_k, e_i) · D_k
            for (i, rec) in recovery.iter().enumerate() {
                let syndrome = &mut syndromes[i][..chunk];
                syndrome.fill(0);
                copy_padded(syndrome, rec.data, offset);
                for block in present {
                    padded[..chunk].fill(0);
                    copy_padded(&mut padded[..chunk], block.data, offset);
                    let factor = self.gf.pow(block.base, rec.exponent);
                    self.gf.mul_acc(syndrome, &padded[..chunk], factor);
                }
            }

            // x_j ⊕= A⁻¹[j][i] · b_i
            for (j, output) in outputs.iter_mut().enumerate() {
                let slot = &mut output[offset..offset + chunk];
                for (i, syndrome) in syndromes.iter().enumerate() {
                    self.gf.mul_acc(slot, &syndrome[..chunk], inverse.at(j, i));
                }
            }

            offset += chunk;
        }

        Ok(outputs)
    }
}

/// Copies the in-range part of `src[offset..]` into `dst`; the rest stays
/// zero (blocks are zero-padded past the end of their file).
fn copy_padded(dst: &mut [u8], src: &[u8], offset: usize) {
    if offset >= src.len() {
        return;
    }
    let available = (src.len() - offset).min(dst.len());
    dst[..available].copy_from_slice(&src[offset..offset + available]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::par2::matrix::base_values;

    /// Builds recovery blocks exactly as the creator does, then knocks out
    /// data blocks and checks the recoverer restores them bit for bit.
    fn exercise(block_size: usize, chunk_size: usize, missing: &[usize]) {
        let gf = GfTables::new();
        let blocks: Vec<Vec<u8>> = (0..4u8)
            .map(|i| {
                (0..block_size)
                    .map(|j| i.wrapping_mul(37).wrapping_add(j as u8))
                    .collect()
            })
            .collect();
        let bases = base_values(&gf, blocks.len());

        // R_e = Σ_k pow(base_k, e) · D_k
        let mut recovery_data = Vec::new();
        for e in 0..missing.len() as u32 {
            let mut block = vec![0u8; block_size];
            for (k, data) in blocks.iter().enumerate() {
                gf.mul_acc(&mut block, data, gf.pow(bases[k], e));
            }
            recovery_data.push(block);
        }

        let present: Vec<PresentBlock<'_>> = (0..blocks.len())
            .filter(|k| !missing.contains(k))
            .map(|k| PresentBlock {
                base: bases[k],
                data: &blocks[k],
            })
            .collect();
        let missing_bases: Vec<u16> = missing.iter().map(|&k| bases[k]).collect();
        let recovery: Vec<RecoveryBlock<'_>> = recovery_data
            .iter()
            .enumerate()
            .map(|(e, data)| RecoveryBlock {
                exponent: e as u32,
                data,
            })
            .collect();

        let recoverer = ChunkedRecoverer::new(&gf, block_size, chunk_size);
        let outputs = recoverer
            .recover(&present, &missing_bases, &recovery)
            .unwrap();
        for (slot, &k) in missing.iter().enumerate() {
            assert_eq!(outputs[slot], blocks[k], "block {k}");
        }
    }

    #[test]
    fn recovers_single_missing_block() {
        exercise(256, DEFAULT_CHUNK_SIZE, &[2]);
    }

    #[test]
    fn recovers_two_missing_blocks() {
        exercise(1024, DEFAULT_CHUNK_SIZE, &[1, 2]);
    }

    #[test]
    fn chunked_and_whole_block_results_agree() {
        // a chunk smaller than the block forces several accumulation passes
        exercise(1024, 64, &[0, 3]);
    }

    #[test]
    fn too_few_recovery_blocks_is_an_error() {
        let gf = GfTables::new();
        let recoverer = ChunkedRecoverer::new(&gf, 16, 16);
        let err = recoverer
            .recover(&[], &[2, 4], &[])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Par2InsufficientRecovery { needed: 2, have: 0 }
        ));
    }
}
