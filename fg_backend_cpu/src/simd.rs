//! Vectorized element-wise kernels (AVX2 on x86_64, NEON on aarch64).
//!
//! Each entry point takes equal-length `a`, `b` and `out` slices and falls
//! back to a scalar loop when no vector unit is available.

#[cfg(target_arch = "x86_64")]
fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2")
}

macro_rules! binary_kernel {
    ($name:ident, $op:tt, $avx:ident, $neon:ident, $avx_fn:ident, $neon_fn:ident) => {
        #[allow(unreachable_code)]
        pub fn $name(a: &[f32], b: &[f32], out: &mut [f32]) {
            debug_assert!(a.len() == b.len() && a.len() == out.len());

            #[cfg(target_arch = "x86_64")]
            {
                if has_avx2() {
                    // SAFETY: AVX2 support was checked at runtime.
                    unsafe { $avx(a, b, out) };
                    return;
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                // SAFETY: NEON is mandatory on aarch64.
                unsafe { $neon(a, b, out) };
                return;
            }

            for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
                *o = x $op y;
            }
        }

        #[cfg(target_arch = "x86_64")]
        #[target_feature(enable = "avx2")]
        unsafe fn $avx(a: &[f32], b: &[f32], out: &mut [f32]) {
            use std::arch::x86_64::*;

            let n = a.len();
            let vectorized = n - n % 8;
            for offset in (0..vectorized).step_by(8) {
                let va = _mm256_loadu_ps(a.as_ptr().add(offset));
                let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
                _mm256_storeu_ps(out.as_mut_ptr().add(offset), $avx_fn(va, vb));
            }
            for i in vectorized..n {
                out[i] = a[i] $op b[i];
            }
        }

        #[cfg(target_arch = "aarch64")]
        unsafe fn $neon(a: &[f32], b: &[f32], out: &mut [f32]) {
            use std::arch::aarch64::*;

            let n = a.len();
            let vectorized = n - n % 4;
            for offset in (0..vectorized).step_by(4) {
                let va = vld1q_f32(a.as_ptr().add(offset));
                let vb = vld1q_f32(b.as_ptr().add(offset));
                vst1q_f32(out.as_mut_ptr().add(offset), $neon_fn(va, vb));
            }
            for i in vectorized..n {
                out[i] = a[i] $op b[i];
            }
        }
    };
}

binary_kernel!(add_f32, +, add_f32_avx2, add_f32_neon, _mm256_add_ps, vaddq_f32);
binary_kernel!(mul_f32, *, mul_f32_avx2, mul_f32_neon, _mm256_mul_ps, vmulq_f32);
binary_kernel!(div_f32, /, div_f32_avx2, div_f32_neon, _mm256_div_ps, vdivq_f32);
