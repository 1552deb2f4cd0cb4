//! Fixed quantization codebooks
//!
//! Every codebook is an ascending array of representative values in `[-1, 1]`
//! (or `[0, 1]` for the unsigned dynamic map) plus a [`CodebookKind`] tag.
//! Codebooks are built once per process and never mutated; the quantizer looks
//! them up by tag with [`Codebook::get`].
//!
//! Encoding picks the nearest entry to `value / scale`. When two entries are
//! equally near, the lower index wins, which also resolves repeated values
//! (FP4 carries both `-0.0` and `+0.0`) to the first occurrence.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::QuantError;

/// NormalFloat4 levels: quantiles of N(0, 1) normalised to `[-1, 1]`, with an
/// exact zero (QLoRA, arXiv:2305.14314).
pub const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.696_192_800_998_688,
    -0.525_073_051_452_637,
    -0.394_917_488_098_145,
    -0.284_441_381_692_887,
    -0.184_773_430_228_233,
    -0.091_050_036_251_545,
    0.0,
    0.079_580_299_556_255,
    0.160_930_201_411_247,
    0.246_112_301_945_686,
    0.337_915_241_718_292,
    0.440_709_829_330_444,
    0.562_617_003_917_694,
    0.722_956_836_223_602,
    1.0,
];

/// FP4 (E2M1) magnitudes `{0, 0.5, 1, 1.5, 2, 3, 4, 6}` divided by 6, both signs.
pub const FP4_LEVELS: [f32; 16] = [
    -1.0,
    -4.0 / 6.0,
    -3.0 / 6.0,
    -2.0 / 6.0,
    -1.5 / 6.0,
    -1.0 / 6.0,
    -0.5 / 6.0,
    -0.0,
    0.0,
    0.5 / 6.0,
    1.0 / 6.0,
    1.5 / 6.0,
    2.0 / 6.0,
    3.0 / 6.0,
    4.0 / 6.0,
    1.0,
];

/// Identifies one of the process-wide codebooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodebookKind {
    /// 4-bit NormalFloat
    #[serde(rename = "nf4")]
    Nf4,
    /// 4-bit floating point (E2M1)
    #[serde(rename = "fp4")]
    Fp4,
    /// 8-bit signed dynamic-tree map
    #[serde(rename = "dynamic8")]
    DynamicSigned8,
    /// 8-bit unsigned dynamic-tree map, for non-negative data
    #[serde(rename = "dynamic8-unsigned")]
    DynamicUnsigned8,
}

impl CodebookKind {
    /// All provisioned kinds
    pub const ALL: [CodebookKind; 4] = [
        CodebookKind::Nf4,
        CodebookKind::Fp4,
        CodebookKind::DynamicSigned8,
        CodebookKind::DynamicUnsigned8,
    ];

    /// Returns the width of one index in bits
    pub fn bits(&self) -> u8 {
        match self {
            CodebookKind::Nf4 | CodebookKind::Fp4 => 4,
            CodebookKind::DynamicSigned8 | CodebookKind::DynamicUnsigned8 => 8,
        }
    }

    /// Returns the number of codebook entries
    pub fn num_entries(&self) -> usize {
        1 << self.bits()
    }

    /// Returns whether the codebook can represent negative values
    pub fn is_signed(&self) -> bool {
        !matches!(self, CodebookKind::DynamicUnsigned8)
    }

    /// Returns the canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            CodebookKind::Nf4 => "nf4",
            CodebookKind::Fp4 => "fp4",
            CodebookKind::DynamicSigned8 => "dynamic8",
            CodebookKind::DynamicUnsigned8 => "dynamic8-unsigned",
        }
    }
}

impl fmt::Display for CodebookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodebookKind {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        CodebookKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == lowered)
            .ok_or_else(|| {
                QuantError::unsupported_codebook(
                    "CODEBOOK_UNKNOWN",
                    "no codebook is provisioned under this name",
                    s,
                    "codebook lookup",
                )
            })
    }
}

/// An immutable, ascending set of representative values
#[derive(Debug)]
pub struct Codebook {
    kind: CodebookKind,
    values: Vec<f32>,
    max_step: f32,
    zero_index: u8,
}

static NF4: OnceLock<Codebook> = OnceLock::new();
static FP4: OnceLock<Codebook> = OnceLock::new();
static DYNAMIC_SIGNED: OnceLock<Codebook> = OnceLock::new();
static DYNAMIC_UNSIGNED: OnceLock<Codebook> = OnceLock::new();

impl Codebook {
    /// Returns the process-wide codebook for `kind`, building it on first use
    pub fn get(kind: CodebookKind) -> &'static Codebook {
        match kind {
            CodebookKind::Nf4 => NF4.get_or_init(|| Codebook::build(kind, NF4_LEVELS.to_vec())),
            CodebookKind::Fp4 => FP4.get_or_init(|| Codebook::build(kind, FP4_LEVELS.to_vec())),
            CodebookKind::DynamicSigned8 => {
                DYNAMIC_SIGNED.get_or_init(|| Codebook::build(kind, create_dynamic_map(true)))
            }
            CodebookKind::DynamicUnsigned8 => {
                DYNAMIC_UNSIGNED.get_or_init(|| Codebook::build(kind, create_dynamic_map(false)))
            }
        }
    }

    fn build(kind: CodebookKind, mut values: Vec<f32>) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        debug_assert_eq!(values.len(), kind.num_entries());

        let max_step = values
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(0.0f32, f32::max);

        let mut codebook = Self { kind, values, max_step, zero_index: 0 };
        codebook.zero_index = codebook.nearest(0.0);
        codebook
    }

    /// Returns the tag of this codebook
    pub fn kind(&self) -> CodebookKind {
        self.kind
    }

    /// Returns the entries in ascending order
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Returns the number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Codebooks are never empty; provided for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Largest gap between adjacent entries.
    ///
    /// Reconstruction error per element is bounded by `max_step() * scale`.
    pub fn max_step(&self) -> f32 {
        self.max_step
    }

    /// Index stored for elements of an all-zero block
    pub fn zero_index(&self) -> u8 {
        self.zero_index
    }

    /// Returns the value for an index
    #[inline]
    pub fn value(&self, index: u8) -> f32 {
        self.values[index as usize]
    }

    /// Returns the index of the entry nearest to `x`, lower index on ties.
    ///
    /// `x` must not be NaN; callers reject non-finite scales before normalising.
    #[inline]
    pub fn nearest(&self, x: f32) -> u8 {
        let values = &self.values;
        let upper = values.partition_point(|&c| c < x);
        if upper == 0 {
            return 0;
        }
        if upper == values.len() {
            return (values.len() - 1) as u8;
        }
        let below = x - values[upper - 1];
        let above = values[upper] - x;
        let mut index = if above < below { upper } else { upper - 1 };
        // Repeated entries (FP4's signed zeros) collapse to the first occurrence
        while index > 0 && values[index - 1] == values[index] {
            index -= 1;
        }
        index as u8
    }
}

/// Builds the 256-entry dynamic-tree map used for 8-bit state and scales.
///
/// Each decade `10^(i-6)` for `i in 0..7` contributes the midpoints of an even
/// split of `[0.1, 1]`; the split doubles in resolution per decade. The signed
/// map mirrors every midpoint except the smallest, whose slot holds `-1` so a
/// block with a negative absmax element decodes it exactly; the unsigned map
/// spends the sign bit on twice the resolution instead. Both maps add `0` and
/// `1`.
fn create_dynamic_map(signed: bool) -> Vec<f32> {
    const MAX_EXPONENT_BITS: i32 = 7;
    let mut data: Vec<f32> = Vec::with_capacity(256);

    for i in 0..MAX_EXPONENT_BITS {
        let fraction_items = if signed { (1usize << i) + 1 } else { (1usize << (i + 1)) + 1 };
        let decade = 10f64.powi(i - (MAX_EXPONENT_BITS - 1));
        let step = 0.9 / (fraction_items - 1) as f64;

        for k in 0..fraction_items - 1 {
            let lo = 0.1 + step * k as f64;
            let hi = 0.1 + step * (k + 1) as f64;
            let mean = (lo + hi) / 2.0;
            data.push((decade * mean) as f32);
            if signed && (i, k) != (0, 0) {
                data.push((-decade * mean) as f32);
            }
        }
    }

    if signed {
        data.push(-1.0);
    }
    data.push(0.0);
    data.push(1.0);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codebooks_sorted_and_sized() {
        for kind in CodebookKind::ALL {
            let codebook = Codebook::get(kind);
            assert_eq!(codebook.len(), kind.num_entries(), "{}", kind);
            for w in codebook.values().windows(2) {
                assert!(w[0] <= w[1], "{} not ascending: {} > {}", kind, w[0], w[1]);
            }
            assert!(codebook.values().iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_endpoints() {
        for kind in [CodebookKind::Nf4, CodebookKind::Fp4] {
            let codebook = Codebook::get(kind);
            assert_eq!(codebook.values()[0], -1.0);
            assert_eq!(codebook.values()[15], 1.0);
        }
        let signed = Codebook::get(CodebookKind::DynamicSigned8);
        assert_eq!(signed.values()[0], -1.0);
        assert_eq!(signed.values()[255], 1.0);
        let unsigned = Codebook::get(CodebookKind::DynamicUnsigned8);
        assert_eq!(unsigned.values()[0], 0.0);
        assert_eq!(unsigned.values()[255], 1.0);
    }

    #[test]
    fn test_dynamic_maps_have_distinct_entries() {
        for kind in [CodebookKind::DynamicSigned8, CodebookKind::DynamicUnsigned8] {
            let codebook = Codebook::get(kind);
            for w in codebook.values().windows(2) {
                assert!(w[0] < w[1], "{} has repeated entry {}", kind, w[0]);
            }
        }
    }

    #[test]
    fn test_nearest_exact_entries() {
        let codebook = Codebook::get(CodebookKind::Nf4);
        for (i, &v) in NF4_LEVELS.iter().enumerate() {
            assert_eq!(codebook.nearest(v) as usize, i);
        }
    }

    #[test]
    fn test_nearest_ties_go_low() {
        let codebook = Codebook::get(CodebookKind::Fp4);
        // Midpoint between 1/6 (index 10) and 1/4 (index 11)
        let mid = (1.0 / 6.0 + 0.25) / 2.0;
        let idx = codebook.nearest(mid);
        let lo = (mid - codebook.value(10)).abs();
        let hi = (codebook.value(11) - mid).abs();
        if lo <= hi {
            assert_eq!(idx, 10);
        } else {
            assert_eq!(idx, 11);
        }
        // Signed zeros compare equal; the first one wins
        assert_eq!(codebook.nearest(0.0), 7);
        assert_eq!(codebook.nearest(-0.0), 7);
        assert_eq!(codebook.nearest(1e-6), 7);
        assert_eq!(codebook.nearest(-1e-6), 7);
    }

    #[test]
    fn test_nearest_clamps_out_of_range() {
        let codebook = Codebook::get(CodebookKind::Nf4);
        assert_eq!(codebook.nearest(-5.0), 0);
        assert_eq!(codebook.nearest(5.0), 15);
    }

    #[test]
    fn test_zero_index_decodes_to_zero() {
        for kind in CodebookKind::ALL {
            let codebook = Codebook::get(kind);
            assert_eq!(codebook.value(codebook.zero_index()), 0.0, "{}", kind);
        }
    }

    #[test]
    fn test_max_step() {
        let nf4 = Codebook::get(CodebookKind::Nf4);
        assert!((nf4.max_step() - (1.0 - 0.696_192_8)).abs() < 1e-6);
        let fp4 = Codebook::get(CodebookKind::Fp4);
        assert!((fp4.max_step() - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("NF4".parse::<CodebookKind>().unwrap(), CodebookKind::Nf4);
        assert_eq!("fp4".parse::<CodebookKind>().unwrap(), CodebookKind::Fp4);
        assert_eq!(
            "dynamic8-unsigned".parse::<CodebookKind>().unwrap(),
            CodebookKind::DynamicUnsigned8
        );
        let err = "int3".parse::<CodebookKind>().unwrap_err();
        assert_eq!(err.code(), "CODEBOOK_UNKNOWN");
    }
}
