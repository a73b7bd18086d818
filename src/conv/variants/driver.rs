//! Shared macro-kernel loop of the row-oriented GEMM variants
//!
//! A [`RowPass`] is one reduction pass over a set of accumulator rows and a
//! range of panel columns. Columns are walked in micro-tile steps with the
//! rows inner, so one weight panel stays in L1 while the rows stream past.

use half::bf16;

use crate::conv::alg::{MAX_MICRO_D, MAX_MICRO_M};
use crate::conv::kernel::{MicroArgs, MicroKernel};
use crate::conv::pack::panel_offset;
use crate::conv::postprocess::Term;

/// One reduction pass of a blocked GEMM
#[derive(Copy, Clone, Debug)]
pub(super) struct RowPass<'a> {
    /// Broadcast operand
    pub a: &'a [bf16],
    /// Offset of each row in `a`
    pub rows: &'a [usize],
    /// Segment offsets added to every row
    pub segments: &'a [usize],
    /// Elements per segment
    pub seg_len: usize,
    /// Panel-packed operand holding all `buf_k` reduction rows
    pub panels: &'a [bf16],
    /// Padded reduction length of `panels`
    pub buf_k: usize,
    /// First reduction row of this pass
    pub k_off: usize,
    /// First panel column (a multiple of `micro_d`)
    pub col: usize,
    /// Columns in this block
    pub cols: usize,
    /// Start from zero
    pub zero: bool,
    /// Whether finished values leave through `flush`
    pub term: Term,
}

/// Run `pass`
///
/// With `sum`, partial sums live there (row stride `ld`, columns local to
/// `pass.col`) across passes. Without it the pass must be the only one and
/// each micro-tile is finished from a local accumulator. On the last pass
/// `flush(row, col, values)` receives every finished row run, `col` being
/// relative to `pass.col`.
pub(super) fn run_pass<F>(kernel: &MicroKernel, pass: &RowPass<'_>, mut sum: Option<(&mut [f32], usize)>, flush: &mut F)
where
    F: FnMut(usize, usize, &[f32]),
{
    debug_assert!(sum.is_some() || (pass.zero && pass.term == Term::Last));
    let md = kernel.micro_d();
    let mm = kernel.micro_m().min(MAX_MICRO_M);
    let n_rows = pass.rows.len();
    let mut tile = [0.0f32; MAX_MICRO_M * MAX_MICRO_D];

    for jb in (0..pass.cols).step_by(md) {
        let cols = md.min(pass.cols - jb);
        let b = &pass.panels[panel_offset(pass.col + jb, pass.k_off, pass.buf_k, md)..];
        for r0 in (0..n_rows).step_by(mm) {
            let r1 = (r0 + mm).min(n_rows);
            let args = MicroArgs {
                a: pass.a,
                rows: &pass.rows[r0..r1],
                segments: pass.segments,
                seg_len: pass.seg_len,
                b,
                cols,
                zero: pass.zero,
            };
            match sum.as_mut() {
                Some((buf, ld)) => {
                    let ld = *ld;
                    kernel.run(&args, &mut buf[r0 * ld + jb..], ld);
                    if pass.term == Term::Last {
                        for r in r0..r1 {
                            flush(r, jb, &buf[r * ld + jb..r * ld + jb + cols]);
                        }
                    }
                }
                None => {
                    kernel.run(&args, &mut tile, md);
                    for r in r0..r1 {
                        let at = (r - r0) * md;
                        flush(r, jb, &tile[at..at + cols]);
                    }
                }
            }
        }
    }
}
