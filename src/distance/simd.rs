//! Pure Rust SIMD kernels for vector arithmetic
//!
//! Portable implementations on top of the `wide` crate. All kernels accept
//! slices of any length; the tail that does not fill a lane is handled in
//! scalar code.

use wide::{f32x4, f32x8};

/// Horizontal sum of an 8-lane accumulator
#[inline]
fn reduce8(sum8: f32x8) -> f32 {
    let lanes: [f32; 8] = sum8.into();
    lanes.iter().sum::<f32>()
}

/// Squared L2 distance (no sqrt)
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len();

    let mut sum8 = f32x8::splat(0.0);
    let mut i = 0;

    // Process 16 elements at a time (2 x f32x8)
    while i + 16 <= len {
        let a8_1 = f32x8::from(&a[i..i + 8]);
        let b8_1 = f32x8::from(&b[i..i + 8]);
        let diff1 = a8_1 - b8_1;
        sum8 = diff1.mul_add(diff1, sum8);

        let a8_2 = f32x8::from(&a[i + 8..i + 16]);
        let b8_2 = f32x8::from(&b[i + 8..i + 16]);
        let diff2 = a8_2 - b8_2;
        sum8 = diff2.mul_add(diff2, sum8);

        i += 16;
    }

    while i + 8 <= len {
        let a8 = f32x8::from(&a[i..i + 8]);
        let b8 = f32x8::from(&b[i..i + 8]);
        let diff = a8 - b8;
        sum8 = diff.mul_add(diff, sum8);
        i += 8;
    }

    let mut sum = reduce8(sum8);

    if i + 4 <= len {
        let a4 = f32x4::from(&a[i..i + 4]);
        let b4 = f32x4::from(&b[i..i + 4]);
        let diff = a4 - b4;
        let sum4: [f32; 4] = (diff * diff).into();
        sum += sum4.iter().sum::<f32>();
        i += 4;
    }

    while i < len {
        let diff = a[i] - b[i];
        sum += diff * diff;
        i += 1;
    }

    sum
}

/// Dot product
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len();

    let mut sum8 = f32x8::splat(0.0);
    let mut i = 0;

    while i + 16 <= len {
        let a8_1 = f32x8::from(&a[i..i + 8]);
        let b8_1 = f32x8::from(&b[i..i + 8]);
        sum8 = a8_1.mul_add(b8_1, sum8);

        let a8_2 = f32x8::from(&a[i + 8..i + 16]);
        let b8_2 = f32x8::from(&b[i + 8..i + 16]);
        sum8 = a8_2.mul_add(b8_2, sum8);

        i += 16;
    }

    while i + 8 <= len {
        let a8 = f32x8::from(&a[i..i + 8]);
        let b8 = f32x8::from(&b[i..i + 8]);
        sum8 = a8.mul_add(b8, sum8);
        i += 8;
    }

    let mut sum = reduce8(sum8);

    while i < len {
        sum += a[i] * b[i];
        i += 1;
    }

    sum
}

/// Squared L2 norm
#[inline]
pub fn norm_squared(v: &[f32]) -> f32 {
    let len = v.len();
    let mut sum8 = f32x8::splat(0.0);
    let mut i = 0;

    while i + 8 <= len {
        let v8 = f32x8::from(&v[i..i + 8]);
        sum8 = v8.mul_add(v8, sum8);
        i += 8;
    }

    let mut sum = reduce8(sum8);

    while i < len {
        sum += v[i] * v[i];
        i += 1;
    }

    sum
}

/// `dst += src`
#[inline]
pub fn add_assign(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    let len = dst.len();
    let mut i = 0;

    while i + 8 <= len {
        let d8 = f32x8::from(&dst[i..i + 8]);
        let s8 = f32x8::from(&src[i..i + 8]);
        let out: [f32; 8] = (d8 + s8).into();
        dst[i..i + 8].copy_from_slice(&out);
        i += 8;
    }

    while i < len {
        dst[i] += src[i];
        i += 1;
    }
}

/// `dst -= src`
#[inline]
pub fn sub_assign(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    let len = dst.len();
    let mut i = 0;

    while i + 8 <= len {
        let d8 = f32x8::from(&dst[i..i + 8]);
        let s8 = f32x8::from(&src[i..i + 8]);
        let out: [f32; 8] = (d8 - s8).into();
        dst[i..i + 8].copy_from_slice(&out);
        i += 8;
    }

    while i < len {
        dst[i] -= src[i];
        i += 1;
    }
}
