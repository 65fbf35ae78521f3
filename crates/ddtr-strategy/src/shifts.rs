// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Channel shift table

/// Cold-plasma dispersion constant (s MHz^2 pc^-1 cm^3)
pub const DISPERSION_CONSTANT: f64 = 4148.741601;

/// Per-channel delay, in samples per unit DM, relative to the top of the band
///
/// Channel `c` sits at `fch1 + c * foff`. The reference frequency is the
/// highest frequency in the band so every shift is non-negative.
pub fn dm_shifts_from_frequencies(fch1: f64, foff: f64, nchans: usize, tsamp: f32) -> Vec<f32> {
    if nchans == 0 {
        return Vec::new();
    }
    let last = fch1 + foff * (nchans - 1) as f64;
    let f_top = fch1.max(last);
    let tsamp = tsamp as f64;

    (0..nchans)
        .map(|c| {
            let f = fch1 + foff * c as f64;
            let delay = DISPERSION_CONSTANT * (1.0 / (f * f) - 1.0 / (f_top * f_top));
            (delay / tsamp) as f32
        })
        .collect()
}
