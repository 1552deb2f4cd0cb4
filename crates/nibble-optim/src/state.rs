//! Optimizer state buffers, full precision or block-wise 8-bit
//!
//! A quantized moment buffer stores one 8-bit dynamic-map code per element,
//! one absmax scale per block and, per block, up to `k` outliers kept at full
//! precision. Outliers are the `k` largest magnitudes of the block (lower
//! offset first on ties); they are left out of the block's scale and decode
//! to their exact values.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nibble_quant::{decode_block, encode_block, Codebook, CodebookKind, QuantError};
use serde::{Deserialize, Serialize};

use crate::config::StateQuantConfig;
use crate::paging::Pageable;
use crate::{OptimError, Result};

/// Marks an unused outlier slot
pub const EMPTY_SLOT: u32 = u32::MAX;

const RECORD_MAGIC: u32 = 0x4E42_5354;

/// Representation of a moment buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMode {
    /// Plain f32 buffers
    Full32,
    /// Block-wise 8-bit codes with per-block scales
    Blockwise8,
}

/// One block-wise 8-bit moment buffer
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedState {
    kind: CodebookKind,
    numel: usize,
    block_size: usize,
    outliers: usize,
    codes: Vec<u8>,
    scales: Vec<f32>,
    outlier_offsets: Vec<u32>,
    outlier_values: Vec<f32>,
}

impl QuantizedState {
    /// All-zero state of `numel` elements
    pub fn zeros(kind: CodebookKind, numel: usize, block_size: usize, outliers: usize) -> Result<Self> {
        if block_size == 0 || block_size > EMPTY_SLOT as usize {
            return Err(QuantError::invalid_block_size(block_size, "optimizer state").into());
        }
        if kind.bits() != 8 {
            return Err(QuantError::unsupported_codebook(
                "STATE_CODEBOOK_NOT_8BIT",
                "optimizer state uses the 8-bit dynamic maps",
                kind.name(),
                "optimizer state quantization",
            )
            .into());
        }

        let num_blocks = numel.div_ceil(block_size);
        let codebook = Codebook::get(kind);
        Ok(Self {
            kind,
            numel,
            block_size,
            outliers,
            codes: vec![codebook.zero_index(); numel],
            scales: vec![0.0; num_blocks],
            outlier_offsets: vec![EMPTY_SLOT; num_blocks * outliers],
            outlier_values: vec![0.0; num_blocks * outliers],
        })
    }

    /// Quantizes `values`
    pub fn from_values(
        values: &[f32],
        kind: CodebookKind,
        block_size: usize,
        outliers: usize,
        verify: bool,
    ) -> Result<Self> {
        let mut state = Self::zeros(kind, values.len(), block_size, outliers)?;
        for (mut block, chunk) in state.blocks_mut().into_iter().zip(values.chunks(block_size)) {
            block.encode_from(chunk, verify)?;
        }
        Ok(state)
    }

    /// Codebook of the codes
    pub fn kind(&self) -> CodebookKind {
        self.kind
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Elements per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks
    pub fn num_blocks(&self) -> usize {
        self.scales.len()
    }

    /// Outlier slots per block
    pub fn outliers(&self) -> usize {
        self.outliers
    }

    /// Per-block scales
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Per-element codes
    pub fn codes(&self) -> &[u8] {
        &self.codes
    }

    /// In-memory footprint in bytes
    pub fn size_bytes(&self) -> usize {
        self.codes.len() + self.scales.len() * 4 + self.outlier_offsets.len() * 8
    }

    /// Decodes the whole buffer
    pub fn decode(&self) -> Vec<f32> {
        let codebook = Codebook::get(self.kind);
        let k = self.outliers;
        let mut out = vec![0.0f32; self.numel];
        for (b, chunk) in out.chunks_mut(self.block_size).enumerate() {
            let codes = &self.codes[b * self.block_size..b * self.block_size + chunk.len()];
            decode_with_outliers(
                codes,
                self.scales[b],
                &self.outlier_offsets[b * k..(b + 1) * k],
                &self.outlier_values[b * k..(b + 1) * k],
                codebook,
                chunk,
            );
        }
        out
    }

    /// Splits the buffer into independently mutable blocks
    pub fn blocks_mut(&mut self) -> Vec<StateBlockMut<'_>> {
        let codebook = Codebook::get(self.kind);
        let block_size = self.block_size;
        let num_blocks = self.scales.len();
        let offsets = split_slots(&mut self.outlier_offsets, self.outliers, num_blocks);
        let values = split_slots(&mut self.outlier_values, self.outliers, num_blocks);

        self.codes
            .chunks_mut(block_size)
            .zip(self.scales.iter_mut())
            .zip(offsets)
            .zip(values)
            .enumerate()
            .map(|(index, (((codes, scale), offsets), values))| StateBlockMut {
                index,
                codes,
                scale,
                offsets,
                values,
                codebook,
            })
            .collect()
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let kind = match self.kind {
            CodebookKind::DynamicUnsigned8 => 1u8,
            _ => 0u8,
        };
        w.write_u8(kind)?;
        w.write_u64::<LittleEndian>(self.numel as u64)?;
        w.write_u64::<LittleEndian>(self.block_size as u64)?;
        w.write_u64::<LittleEndian>(self.outliers as u64)?;
        w.write_all(&self.codes)?;
        for &s in &self.scales {
            w.write_f32::<LittleEndian>(s)?;
        }
        for &o in &self.outlier_offsets {
            w.write_u32::<LittleEndian>(o)?;
        }
        for &v in &self.outlier_values {
            w.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    fn read_from(r: &mut Cursor<&[u8]>) -> Result<Self> {
        let kind = match r.read_u8().map_err(truncated)? {
            0 => CodebookKind::DynamicSigned8,
            1 => CodebookKind::DynamicUnsigned8,
            other => {
                return Err(OptimError::state_corruption(
                    "STATE_BAD_CODEBOOK_TAG",
                    format!("unknown codebook tag {}", other),
                    "decoding quantized state",
                ))
            }
        };
        let numel = read_len(r)?;
        let block_size = read_len(r)?;
        let outliers = read_len(r)?;

        if block_size == 0 {
            return Err(OptimError::state_corruption(
                "STATE_BAD_LENGTH",
                "quantized state has a zero block size",
                "decoding quantized state",
            ));
        }
        let num_blocks = numel.div_ceil(block_size);
        let needed = num_blocks
            .checked_mul(outliers)
            .and_then(|slots| slots.checked_mul(8))
            .and_then(|n| num_blocks.checked_mul(4).and_then(|s| n.checked_add(s)))
            .and_then(|n| n.checked_add(numel));
        ensure_remaining(r, needed.unwrap_or(usize::MAX))?;

        let mut state = Self::zeros(kind, numel, block_size, outliers)?;

        r.read_exact(&mut state.codes).map_err(truncated)?;
        r.read_f32_into::<LittleEndian>(&mut state.scales).map_err(truncated)?;
        r.read_u32_into::<LittleEndian>(&mut state.outlier_offsets).map_err(truncated)?;
        r.read_f32_into::<LittleEndian>(&mut state.outlier_values).map_err(truncated)?;

        if let Some(b) = state.scales.iter().position(|s| !s.is_finite() || *s < 0.0) {
            return Err(OptimError::state_corruption(
                "STATE_BAD_SCALE",
                format!("scale of block {} is negative or not finite", b),
                "decoding quantized state",
            ));
        }
        if state.outlier_offsets.iter().any(|&o| o != EMPTY_SLOT && o as usize >= block_size) {
            return Err(OptimError::state_corruption(
                "STATE_BAD_OUTLIER_OFFSET",
                "outlier offset lies outside its block",
                "decoding quantized state",
            ));
        }
        Ok(state)
    }
}

/// Mutable view of one block of a [`QuantizedState`]
#[derive(Debug)]
pub struct StateBlockMut<'a> {
    index: usize,
    codes: &'a mut [u8],
    scale: &'a mut f32,
    offsets: &'a mut [u32],
    values: &'a mut [f32],
    codebook: &'static Codebook,
}

impl<'a> StateBlockMut<'a> {
    /// Index of this block within its buffer
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of elements in this block
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the block holds no elements
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Decodes the block into `out`
    pub fn decode_into(&self, out: &mut [f32]) {
        decode_with_outliers(&self.codes[..], *self.scale, &self.offsets[..], &self.values[..], self.codebook, out);
    }

    /// Re-encodes the block from `values`, recomputing its scale.
    ///
    /// With `verify` set, the block is decoded again and every element is
    /// checked against `max_step * scale`; a violation is `StateCorruption`.
    pub fn encode_from(&mut self, values: &[f32], verify: bool) -> Result<()> {
        debug_assert_eq!(values.len(), self.codes.len());
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(QuantError::numeric_overflow(
                self.index,
                values[i],
                format!("optimizer state at offset {} of block {}", i, self.index),
            )
            .into());
        }

        let k = self.offsets.len().min(values.len());
        self.offsets.fill(EMPTY_SLOT);
        self.values.fill(0.0);

        let mut chosen: Vec<usize> = Vec::new();
        if k > 0 {
            let mut order: Vec<usize> = (0..values.len()).collect();
            let by_magnitude = |a: &usize, b: &usize| {
                values[*b].abs().total_cmp(&values[*a].abs()).then(a.cmp(b))
            };
            if k < order.len() {
                order.select_nth_unstable_by(k - 1, by_magnitude);
                order.truncate(k);
            }
            order.sort_unstable();
            chosen = order;
        }

        let scale = values
            .iter()
            .enumerate()
            .filter(|(i, _)| chosen.binary_search(i).is_err())
            .fold(0.0f32, |acc, (_, v)| acc.max(v.abs()));

        encode_block(values, scale, self.codebook, self.codes);
        *self.scale = scale;
        for (slot, &offset) in chosen.iter().enumerate() {
            self.offsets[slot] = offset as u32;
            self.values[slot] = values[offset];
            self.codes[offset] = self.codebook.zero_index();
        }

        if verify {
            self.verify(values)?;
        }
        Ok(())
    }

    fn verify(&self, values: &[f32]) -> Result<()> {
        let mut decoded = vec![0.0f32; values.len()];
        self.decode_into(&mut decoded);
        let scale = *self.scale;
        let bound = self.codebook.max_step() * scale + 1e-6 * scale;
        for (i, (&orig, &got)) in values.iter().zip(&decoded).enumerate() {
            let error = (orig - got).abs();
            if error > bound {
                return Err(OptimError::state_corruption(
                    "STATE_ROUNDTRIP_BOUND",
                    format!(
                        "re-encoded value at offset {} is off by {} (bound {})",
                        i, error, bound
                    ),
                    format!("block {} of {} state", self.index, self.codebook.kind()),
                ));
            }
        }
        Ok(())
    }
}

/// A moment buffer in either representation
#[derive(Debug, Clone, PartialEq)]
pub enum StateBuffer {
    /// Full precision
    Full(Vec<f32>),
    /// Block-wise 8-bit
    Quantized(QuantizedState),
}

impl StateBuffer {
    /// All-zero buffer in the given mode
    pub fn zeros(numel: usize, mode: StateMode, kind: CodebookKind, config: &StateQuantConfig) -> Result<Self> {
        match mode {
            StateMode::Full32 => Ok(StateBuffer::Full(vec![0.0; numel])),
            StateMode::Blockwise8 => Ok(StateBuffer::Quantized(QuantizedState::zeros(
                kind,
                numel,
                config.block_size,
                config.outliers,
            )?)),
        }
    }

    /// Representation of this buffer
    pub fn mode(&self) -> StateMode {
        match self {
            StateBuffer::Full(_) => StateMode::Full32,
            StateBuffer::Quantized(_) => StateMode::Blockwise8,
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        match self {
            StateBuffer::Full(values) => values.len(),
            StateBuffer::Quantized(state) => state.numel(),
        }
    }

    /// In-memory footprint in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            StateBuffer::Full(values) => values.len() * 4,
            StateBuffer::Quantized(state) => state.size_bytes(),
        }
    }

    /// Decoded values
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            StateBuffer::Full(values) => values.clone(),
            StateBuffer::Quantized(state) => state.decode(),
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            StateBuffer::Full(values) => {
                w.write_u8(0)?;
                w.write_u64::<LittleEndian>(values.len() as u64)?;
                for &v in values {
                    w.write_f32::<LittleEndian>(v)?;
                }
                Ok(())
            }
            StateBuffer::Quantized(state) => {
                w.write_u8(1)?;
                state.write_to(w)
            }
        }
    }

    fn read_from(r: &mut Cursor<&[u8]>) -> Result<Self> {
        match r.read_u8().map_err(truncated)? {
            0 => {
                let numel = read_len(r)?;
                ensure_remaining(r, numel.saturating_mul(4))?;
                let mut values = vec![0.0f32; numel];
                r.read_f32_into::<LittleEndian>(&mut values).map_err(truncated)?;
                Ok(StateBuffer::Full(values))
            }
            1 => Ok(StateBuffer::Quantized(QuantizedState::read_from(r)?)),
            other => Err(OptimError::state_corruption(
                "STATE_BAD_BUFFER_TAG",
                format!("unknown buffer tag {}", other),
                "decoding state buffer",
            )),
        }
    }
}

/// Adam state for one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// Completed steps
    pub step: u64,
    /// First moment, signed
    pub moment1: StateBuffer,
    /// Second moment, non-negative
    pub moment2: StateBuffer,
}

impl StateRecord {
    /// Zero state for a parameter of `numel` elements
    pub fn new(numel: usize, config: &StateQuantConfig) -> Result<Self> {
        let mode = config.mode_for(numel);
        Ok(Self {
            step: 0,
            moment1: StateBuffer::zeros(numel, mode, CodebookKind::DynamicSigned8, config)?,
            moment2: StateBuffer::zeros(numel, mode, CodebookKind::DynamicUnsigned8, config)?,
        })
    }

    /// Number of parameter elements covered
    pub fn numel(&self) -> usize {
        self.moment1.numel()
    }
}

impl Pageable for StateRecord {
    fn size_bytes(&self) -> usize {
        self.moment1.size_bytes() + self.moment2.size_bytes()
    }

    fn to_page_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.size_bytes() + 64);
        bytes.write_u32::<LittleEndian>(RECORD_MAGIC)?;
        bytes.write_u64::<LittleEndian>(self.step)?;
        self.moment1.write_to(&mut bytes)?;
        self.moment2.write_to(&mut bytes)?;
        Ok(bytes)
    }

    fn from_page_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        let magic = r.read_u32::<LittleEndian>().map_err(truncated)?;
        if magic != RECORD_MAGIC {
            return Err(OptimError::state_corruption(
                "STATE_BAD_MAGIC",
                format!("expected record magic {:#x}, found {:#x}", RECORD_MAGIC, magic),
                "decoding state record",
            ));
        }
        let step = r.read_u64::<LittleEndian>().map_err(truncated)?;
        let moment1 = StateBuffer::read_from(&mut r)?;
        let moment2 = StateBuffer::read_from(&mut r)?;
        if moment1.numel() != moment2.numel() {
            return Err(OptimError::state_corruption(
                "STATE_MOMENT_LENGTHS",
                format!("moment lengths differ: {} vs {}", moment1.numel(), moment2.numel()),
                "decoding state record",
            ));
        }
        Ok(Self { step, moment1, moment2 })
    }
}

fn decode_with_outliers(
    codes: &[u8],
    scale: f32,
    offsets: &[u32],
    values: &[f32],
    codebook: &Codebook,
    out: &mut [f32],
) {
    decode_block(codes, scale, codebook, out);
    for (&offset, &value) in offsets.iter().zip(values) {
        if offset == EMPTY_SLOT {
            continue;
        }
        if let Some(slot) = out.get_mut(offset as usize) {
            *slot = value;
        }
    }
}

fn split_slots<T>(slots: &mut [T], k: usize, num_blocks: usize) -> Vec<&mut [T]> {
    if k == 0 {
        (0..num_blocks).map(|_| <&mut [T]>::default()).collect()
    } else {
        slots.chunks_mut(k).collect()
    }
}

fn truncated(err: std::io::Error) -> OptimError {
    OptimError::state_corruption("STATE_TRUNCATED", err.to_string(), "decoding state record")
}

fn read_len(r: &mut Cursor<&[u8]>) -> Result<usize> {
    let len = r.read_u64::<LittleEndian>().map_err(truncated)?;
    usize::try_from(len).map_err(|_| {
        OptimError::state_corruption("STATE_BAD_LENGTH", format!("length {} overflows usize", len), "decoding state record")
    })
}

fn ensure_remaining(r: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    let remaining = r.get_ref().len().saturating_sub(r.position() as usize);
    if remaining < needed {
        return Err(OptimError::state_corruption(
            "STATE_TRUNCATED",
            format!("{} bytes needed, {} remaining", needed, remaining),
            "decoding state record",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(outliers: usize) -> StateQuantConfig {
        StateQuantConfig {
            mode: StateMode::Blockwise8,
            block_size: 8,
            outliers,
            min_quantized_numel: 0,
            verify_roundtrip: true,
        }
    }

    #[test]
    fn test_zero_state_decodes_to_zero() {
        let state = QuantizedState::zeros(CodebookKind::DynamicSigned8, 20, 8, 2).unwrap();
        assert_eq!(state.num_blocks(), 3);
        assert!(state.decode().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_outliers_are_exact_and_excluded_from_scale() {
        let values = [0.1f32, -0.2, 50.0, 0.05, -80.0, 0.3, 0.0, 0.15];
        let state = QuantizedState::from_values(&values, CodebookKind::DynamicSigned8, 8, 2, true).unwrap();

        assert!((state.scales()[0] - 0.3).abs() < 1e-7);
        let decoded = state.decode();
        assert_eq!(decoded[2], 50.0);
        assert_eq!(decoded[4], -80.0);
        for i in [0usize, 1, 3, 5, 6, 7] {
            assert!((decoded[i] - values[i]).abs() <= 0.3 * 0.02);
        }
    }

    #[test]
    fn test_outlier_ties_prefer_lower_offset() {
        let values = [1.0f32, -1.0, 1.0, 0.5];
        let state = QuantizedState::from_values(&values, CodebookKind::DynamicSigned8, 4, 2, false).unwrap();
        assert_eq!(&state.outlier_offsets[..], &[0, 1]);
        assert_eq!(state.scales()[0], 1.0);
    }

    #[test]
    fn test_no_outliers() {
        let values: Vec<f32> = (0..19).map(|i| i as f32 * 0.25).collect();
        let state = QuantizedState::from_values(&values, CodebookKind::DynamicUnsigned8, 8, 0, true).unwrap();
        assert_eq!(state.scales(), &[1.75, 3.75, 4.5]);
        let decoded = state.decode();
        assert_eq!(decoded[7], 1.75);
        assert_eq!(decoded[18], 4.5);
    }

    #[test]
    fn test_verify_reports_bound_violation() {
        let mut state = QuantizedState::zeros(CodebookKind::DynamicSigned8, 4, 4, 0).unwrap();
        let mut blocks = state.blocks_mut();
        blocks[0].encode_from(&[0.5, -0.25, 1.0, 0.0], false).unwrap();
        blocks[0].verify(&[0.5, -0.25, 1.0, 0.0]).unwrap();

        let err = blocks[0].verify(&[0.5, -0.25, 1.0, 0.5]).unwrap_err();
        assert_eq!(err.code(), "STATE_ROUNDTRIP_BOUND");
    }

    #[test]
    fn test_non_finite_state_is_rejected() {
        let values = [0.0f32, f32::NAN, 0.0, 0.0];
        let err = QuantizedState::from_values(&values, CodebookKind::DynamicSigned8, 2, 0, false).unwrap_err();
        match err {
            OptimError::Quant(QuantError::NumericOverflow { block_index, .. }) => assert_eq!(block_index, 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_four_bit_codebook_rejected_for_state() {
        let err = QuantizedState::zeros(CodebookKind::Nf4, 8, 8, 0).unwrap_err();
        assert_eq!(err.code(), "STATE_CODEBOOK_NOT_8BIT");
    }

    #[test]
    fn test_record_page_bytes_roundtrip() {
        let mut record = StateRecord::new(20, &config(1)).unwrap();
        record.step = 7;
        if let StateBuffer::Quantized(state) = &mut record.moment1 {
            let values: Vec<f32> = (0..20).map(|i| (i as f32 - 10.0) * 0.01).collect();
            *state = QuantizedState::from_values(&values, CodebookKind::DynamicSigned8, 8, 1, true).unwrap();
        }

        let bytes = record.to_page_bytes().unwrap();
        let back = StateRecord::from_page_bytes(&bytes).unwrap();
        assert_eq!(back, record);

        let full = StateRecord::new(5, &StateQuantConfig::default()).unwrap();
        assert_eq!(full.moment1.mode(), StateMode::Full32);
        let back = StateRecord::from_page_bytes(&full.to_page_bytes().unwrap()).unwrap();
        assert_eq!(back, full);
    }

    #[test]
    fn test_corrupt_page_bytes_rejected() {
        let record = StateRecord::new(16, &config(2)).unwrap();
        let bytes = record.to_page_bytes().unwrap();

        let err = StateRecord::from_page_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, OptimError::StateCorruption { .. }));

        let mut bad = bytes.clone();
        bad[0] ^= 0xFF;
        assert_eq!(StateRecord::from_page_bytes(&bad).unwrap_err().code(), "STATE_BAD_MAGIC");
    }
}
