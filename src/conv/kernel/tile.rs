//! Matrix tile unit
//!
//! Models a tile accelerator with four 16x16 f32 accumulator tiles arranged
//! as 2x2, fed by 16-row bf16 source tiles 32 elements deep:
//!
//! ```text
//! C[m][n] += sum over p < 16 of  A[m][2p] * B[p][2n] + A[m][2p + 1] * B[p][2n + 1]
//! ```
//!
//! `B` rows are pair-interleaved exactly like the vector kernels' panels with
//! 16 columns, so a tile is a 16-pair slice of a 16-wide panel.

use half::bf16;

/// Rows of one tile
pub const TILE_ROWS: usize = 16;
/// f32 columns of one accumulator tile
pub const TILE_COLS: usize = 16;
/// bf16 reduction elements per source tile row
pub const TILE_K: usize = 32;

type Tile = [[f32; TILE_COLS]; TILE_ROWS];

/// 2x2 accumulator tiles covering a 32x32 output block
#[derive(Clone, Debug)]
pub(crate) struct TileUnit {
    acc: [[Tile; 2]; 2],
}

impl Default for TileUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl TileUnit {
    /// Unit with zeroed tiles
    pub fn new() -> Self {
        Self {
            acc: [[[[0.0; TILE_COLS]; TILE_ROWS]; 2]; 2],
        }
    }

    /// Zero all four tiles
    pub fn zero(&mut self) {
        for row in self.acc.iter_mut() {
            for tile in row.iter_mut() {
                *tile = [[0.0; TILE_COLS]; TILE_ROWS];
            }
        }
    }

    /// Load the block from `src` (row stride `ld`), `rows x cols` valid
    pub fn load(&mut self, src: &[f32], ld: usize, rows: usize, cols: usize) {
        for r in 0..rows {
            let line = &src[r * ld..r * ld + cols];
            for (c, &v) in line.iter().enumerate() {
                self.acc[r / TILE_ROWS][c / TILE_COLS][r % TILE_ROWS][c % TILE_COLS] = v;
            }
        }
    }

    /// Store `rows x cols` of the block into `dst` (row stride `ld`)
    pub fn store(&self, dst: &mut [f32], ld: usize, rows: usize, cols: usize) {
        for r in 0..rows {
            let line = &mut dst[r * ld..r * ld + cols];
            for (c, v) in line.iter_mut().enumerate() {
                *v = self.acc[r / TILE_ROWS][c / TILE_COLS][r % TILE_ROWS][c % TILE_COLS];
            }
        }
    }

    /// One block row of the result, `cols` wide
    pub fn row(&self, r: usize, out: &mut [f32]) {
        for (c, v) in out.iter_mut().enumerate() {
            *v = self.acc[r / TILE_ROWS][c / TILE_COLS][r % TILE_ROWS][c % TILE_COLS];
        }
    }

    /// Pair dot product into tile `(ti, tj)`
    ///
    /// `a` holds `a_rows <= 16` rows of [`TILE_K`] elements at stride `lda`;
    /// missing rows contribute nothing. `b` holds 16 pair rows of
    /// `2 * TILE_COLS` elements.
    pub fn dpbf16ps(&mut self, ti: usize, tj: usize, a: &[bf16], lda: usize, a_rows: usize, b: &[bf16]) {
        debug_assert!(a_rows <= TILE_ROWS);
        debug_assert!(b.len() >= TILE_K / 2 * 2 * TILE_COLS);
        let tile = &mut self.acc[ti][tj];
        for (m, c_row) in tile.iter_mut().enumerate().take(a_rows) {
            let a_row = &a[m * lda..m * lda + TILE_K];
            for p in 0..TILE_K / 2 {
                let a0 = a_row[2 * p].to_f32();
                let a1 = a_row[2 * p + 1].to_f32();
                let b_row = &b[p * 2 * TILE_COLS..(p + 1) * 2 * TILE_COLS];
                for (n, c) in c_row.iter_mut().enumerate() {
                    *c = *c + a0 * b_row[2 * n].to_f32();
                    *c = *c + a1 * b_row[2 * n + 1].to_f32();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::bf16::round;

    #[test]
    fn test_pair_dot_matches_matmul() {
        // A: 3 x 32, B logical: 32 x 16
        let a: Vec<bf16> = (0..3 * TILE_K).map(|i| round((i % 5) as f32 - 2.0)).collect();
        let logical = |k: usize, n: usize| ((k + 2 * n) % 7) as f32 * 0.5;
        let mut b = vec![bf16::ZERO; TILE_K * TILE_COLS];
        for k in 0..TILE_K {
            for n in 0..TILE_COLS {
                b[(k / 2) * 2 * TILE_COLS + 2 * n + k % 2] = round(logical(k, n));
            }
        }

        let mut unit = TileUnit::new();
        unit.dpbf16ps(1, 0, &a, TILE_K, 3, &b);
        let mut out = vec![0.0f32; 32 * 32];
        unit.store(&mut out, 32, 32, 32);
        for m in 0..3 {
            for n in 0..TILE_COLS {
                let want: f32 = (0..TILE_K).map(|k| a[m * TILE_K + k].to_f32() * logical(k, n)).sum();
                assert_eq!(out[(16 + m) * 32 + n], want);
            }
        }
        assert!(out[..16 * 32].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_load_store_roundtrip_partial() {
        let src: Vec<f32> = (0..32 * 40).map(|v| v as f32).collect();
        let mut unit = TileUnit::new();
        unit.load(&src, 40, 20, 30);
        let mut dst = vec![-1.0f32; 32 * 32];
        unit.store(&mut dst, 32, 20, 30);
        assert_eq!(dst[19 * 32 + 29], src[19 * 40 + 29]);
        assert_eq!(dst[19 * 32 + 30], -1.0);
        let mut row = [0.0f32; 30];
        unit.row(5, &mut row);
        assert_eq!(row[17], src[5 * 40 + 17]);
    }
}
