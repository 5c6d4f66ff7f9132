//! Built-in kernel registry
//!
//! Well-known kernel symbol names mapped to their default target loop ids.
//! Most kernels contain a single interesting loop (id 0); `latnrm` targets
//! its second loop. A user configuration entry for the same symbol
//! overrides the registry.

use std::collections::BTreeMap;

/// Kernel symbols targeted by default, with their loop ids.
pub fn default_kernels() -> BTreeMap<String, Vec<usize>> {
    let mut kernels = BTreeMap::new();

    let single_loop = [
        "_Z12ARENA_kerneliii",
        "_Z4spmviiPiS_S_",
        "_Z4spmvPiii",
        "adpcm_coder",
        "adpcm_decoder",
        "kernel_gemm",
        "kernel",
        "_Z6kerneli",
        "_Z6kernelPfPi",
        "_Z6kernelPfS_",
        "_Z6kernelPfS_S_",
        "_Z6kerneliPPiS_S_S_",
        "_Z6kernelPPii",
        "_Z6kernelP7RGBType",
        "_Z6kernelP7RGBTypePi",
        "_Z6kernelP7RGBTypeP4Vect",
        "fir",
        "spmv",
        "fft",
        "BF_encrypt",
        "susan_smoothing",
        "_Z9LUPSolve0PPdPiS_iS_",
        // LU decomposition family: init, solvers, determinant, invert.
        "_Z6kernelPPdidPi",
        "_Z6kernelPPdPiS_iS_",
        "_Z6kernelPPdPii",
        "_Z6kernelPPdPiiS0_",
        "_Z6kernelPiS_i",
        "_Z6kernelPfS_f",
        "_Z6kernelPiS_",
        "_Z6kernelPfS_ff",
        "_Z6kernelPiS_ii",
        "_Z6kernelPfS_if",
        "_Z6kernelPiS_S_",
    ];
    for name in single_loop {
        kernels.insert(name.to_string(), vec![0]);
    }

    kernels.insert("latnrm".to_string(), vec![1]);

    kernels
}
