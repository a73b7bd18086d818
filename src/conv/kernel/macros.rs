//! Macros for generating x86 pair-dot micro-kernels
//!
//! AVX2 and AVX-512 kernels differ only in register width and intrinsic
//! names, so both are stamped out from one template per contract.

/// Multiply-accumulate, fused or as a separate multiply and add
macro_rules! mul_acc {
    ($fma:expr, $fmadd:ident, $mul:ident, $add:ident, $a:expr, $b:expr, $c:expr) => {
        if $fma {
            $fmadd($a, $b, $c)
        } else {
            $add($c, $mul($a, $b))
        }
    };
}

/// Generate a `[M x 2F]` pair-dot micro-kernel and its row-count dispatch
///
/// Produces:
/// - `gemm_2xm::<M, FMA>`: `M` rows held in `2 * M` accumulator registers
/// - `gemm`: selects the instantiation for a runtime row count, splitting
///   counts above the largest instantiated one
///
/// Weights are widened from packed pairs with one shift (even element) and
/// one mask (odd element); each source pair is split on the integer side and
/// broadcast.
macro_rules! define_pair_dot_kernel {
    (
        lanes = $f:expr,
        features = [$feat1:literal, $feat2:literal],
        rows = [$($m:literal),+],
        max_rows = $max_m:literal,
        loadu_ps = $loadu_ps:ident,
        storeu_ps = $storeu_ps:ident,
        setzero_ps = $setzero:ident,
        set1_ps = $set1_ps:ident,
        loadu_si = $loadu_si:ident,
        slli_epi32 = $slli:ident,
        and_si = $and_si:ident,
        set1_epi32 = $set1_epi32:ident,
        cast_ps = $cast_ps:ident,
        fmadd_ps = $fmadd:ident,
        mul_ps = $mul:ident,
        add_ps = $add:ident
    ) => {
        /// `acc[0..M][0..2F] (+)= A . B` for `M` rows
        ///
        /// Only the first `F` columns are computed and stored when
        /// `args.cols <= F`.
        ///
        /// # Safety
        /// - The CPU must support the enabled target features
        /// - `args.rows.len() == M` and `args` must satisfy
        ///   [`MicroArgs::in_bounds`](crate::conv::kernel::MicroArgs::in_bounds)
        ///   for `2 * F` columns
        /// - `acc` must be valid for `M` rows of stride `ldacc`, `2 * F` wide
        #[target_feature(enable = $feat1)]
        #[target_feature(enable = $feat2)]
        pub unsafe fn gemm_2xm<const M: usize, const FMA: bool>(
            args: &MicroArgs<'_>,
            acc: *mut f32,
            ldacc: usize,
        ) {
            const F: usize = $f;
            const DF: usize = 2 * F;
            unsafe {
                let two = args.cols > F;
                let mask = $set1_epi32(ODD_MASK as i32);

                let a = args.a.as_ptr();
                let mut rows = [a; M];
                for i in 0..M {
                    rows[i] = a.add(args.rows[i]);
                }

                let mut c0 = [$setzero(); M];
                let mut c1 = [$setzero(); M];
                if !args.zero {
                    for i in 0..M {
                        c0[i] = $loadu_ps(acc.add(i * ldacc));
                        if two {
                            c1[i] = $loadu_ps(acc.add(i * ldacc + F));
                        }
                    }
                }

                let mut b = args.b.as_ptr();
                for &seg in args.segments {
                    let mut k = 0;
                    while k < args.seg_len {
                        let w = $loadu_si(b as *const _);
                        let w00 = $cast_ps($slli::<16>(w));
                        let w01 = $cast_ps($and_si(w, mask));
                        if two {
                            let w = $loadu_si(b.add(DF) as *const _);
                            let w10 = $cast_ps($slli::<16>(w));
                            let w11 = $cast_ps($and_si(w, mask));
                            for i in 0..M {
                                let pair = (rows[i].add(seg + k) as *const u32).read_unaligned();
                                let s0 = $set1_ps(f32::from_bits(pair << 16));
                                let s1 = $set1_ps(f32::from_bits(pair & ODD_MASK));
                                c0[i] = mul_acc!(FMA, $fmadd, $mul, $add, s0, w00, c0[i]);
                                c0[i] = mul_acc!(FMA, $fmadd, $mul, $add, s1, w01, c0[i]);
                                c1[i] = mul_acc!(FMA, $fmadd, $mul, $add, s0, w10, c1[i]);
                                c1[i] = mul_acc!(FMA, $fmadd, $mul, $add, s1, w11, c1[i]);
                            }
                        } else {
                            for i in 0..M {
                                let pair = (rows[i].add(seg + k) as *const u32).read_unaligned();
                                let s0 = $set1_ps(f32::from_bits(pair << 16));
                                let s1 = $set1_ps(f32::from_bits(pair & ODD_MASK));
                                c0[i] = mul_acc!(FMA, $fmadd, $mul, $add, s0, w00, c0[i]);
                                c0[i] = mul_acc!(FMA, $fmadd, $mul, $add, s1, w01, c0[i]);
                            }
                        }
                        b = b.add(2 * DF);
                        k += 2;
                    }
                }

                for i in 0..M {
                    $storeu_ps(acc.add(i * ldacc), c0[i]);
                    if two {
                        $storeu_ps(acc.add(i * ldacc + F), c1[i]);
                    }
                }
            }
        }

        /// Dispatch on the row count of `args`
        ///
        /// # Safety
        /// Same as [`gemm_2xm`] with `M = args.rows.len()`.
        pub unsafe fn gemm(args: &MicroArgs<'_>, acc: *mut f32, ldacc: usize, fma: bool) {
            unsafe {
                match (args.rows.len(), fma) {
                    $(
                        ($m, true) => gemm_2xm::<$m, true>(args, acc, ldacc),
                        ($m, false) => gemm_2xm::<$m, false>(args, acc, ldacc),
                    )+
                    (0, _) => {}
                    (n, _) => {
                        gemm(&args.row_range(0, $max_m), acc, ldacc, fma);
                        gemm(&args.row_range($max_m, n), acc.add($max_m * ldacc), ldacc, fma);
                    }
                }
            }
        }
    };
}

/// Generate the depthwise channel-sum kernel
///
/// Produces:
/// - `channel_sum_v::<FMA>`: `F` channels per vector, one accumulator per
///   vector held across all taps, scalar tail for the last `len % F`
/// - `channel_sum`: selects the instantiation for the FMA policy
///
/// `$widen` loads `F` consecutive bf16 and returns them as f32 lanes.
macro_rules! define_channel_kernel {
    (
        lanes = $f:expr,
        features = [$feat1:literal, $feat2:literal],
        widen = $widen:ident,
        loadu_ps = $loadu_ps:ident,
        storeu_ps = $storeu_ps:ident,
        setzero_ps = $setzero:ident,
        fmadd_ps = $fmadd:ident,
        mul_ps = $mul:ident,
        add_ps = $add:ident
    ) => {
        /// `acc[j] = sum over taps of src[tap + j] * w[tap + j]`
        ///
        /// # Safety
        /// - The CPU must support the enabled target features
        /// - `args` must satisfy
        ///   [`ChannelArgs::in_bounds`](crate::conv::kernel::ChannelArgs::in_bounds)
        ///   for `acc.len()`
        #[target_feature(enable = $feat1)]
        #[target_feature(enable = $feat2)]
        pub unsafe fn channel_sum_v<const FMA: bool>(args: &ChannelArgs<'_>, acc: &mut [f32]) {
            const F: usize = $f;
            unsafe {
                let n = args.len;
                let full = n / F * F;
                let src = args.src.as_ptr().add(args.src_base);
                let w = args.weights.as_ptr().add(args.w_base);
                let out = acc.as_mut_ptr();

                let mut j = 0;
                while j < full {
                    let mut sum = $setzero();
                    for &(so, wo) in args.taps {
                        let s = $widen(src.add(so + j));
                        let k = $loadu_ps(w.add(wo + j));
                        sum = mul_acc!(FMA, $fmadd, $mul, $add, s, k, sum);
                    }
                    $storeu_ps(out.add(j), sum);
                    j += F;
                }
                for j in full..n {
                    let mut sum = 0.0f32;
                    for &(so, wo) in args.taps {
                        let s = (*src.add(so + j)).to_f32();
                        let k = *w.add(wo + j);
                        sum = if FMA { s.mul_add(k, sum) } else { sum + s * k };
                    }
                    *out.add(j) = sum;
                }
            }
        }

        /// Dispatch on the FMA policy
        ///
        /// # Safety
        /// Same as [`channel_sum_v`].
        pub unsafe fn channel_sum(args: &ChannelArgs<'_>, acc: &mut [f32], fma: bool) {
            unsafe {
                if fma {
                    channel_sum_v::<true>(args, acc)
                } else {
                    channel_sum_v::<false>(args, acc)
                }
            }
        }
    };
}

pub(crate) use define_channel_kernel;
pub(crate) use define_pair_dot_kernel;
pub(crate) use mul_acc;
