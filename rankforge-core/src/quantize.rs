//! Weight quantization modes used by the quantized-rank adapter.

use crate::error::EngineError;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quantization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    /// 4-bit normalized float: symmetric, 15 levels in `[-7, 7] * scale`.
    Nf4,
    /// 8-bit affine with zero point.
    Int8,
    /// Half-precision stand-in: rounding to 3 decimals.
    Fp16,
}

impl QuantizationMode {
    pub fn bits(&self) -> u8 {
        match self {
            Self::Nf4 => 4,
            Self::Int8 => 8,
            Self::Fp16 => 16,
        }
    }
}

impl fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nf4 => write!(f, "nf4"),
            Self::Int8 => write!(f, "int8"),
            Self::Fp16 => write!(f, "fp16"),
        }
    }
}

impl std::str::FromStr for QuantizationMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nf4" => Ok(Self::Nf4),
            "int8" => Ok(Self::Int8),
            "fp16" => Ok(Self::Fp16),
            other => Err(EngineError::configuration(format!("unknown quantization mode '{other}'"))),
        }
    }
}

/// 8-bit affine codes plus the parameters needed to invert them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineQuantized {
    pub codes: Vec<u8>,
    pub scale: f32,
    pub zero_point: i32,
    pub shape: Vec<usize>,
}

/// Quantize then dequantize a tensor with the given mode.
pub fn quantize(weights: &ArrayD<f32>, mode: QuantizationMode) -> ArrayD<f32> {
    match mode {
        QuantizationMode::Nf4 => quantize_nf4(weights),
        QuantizationMode::Int8 => dequantize_int8(&quantize_int8(weights)),
        QuantizationMode::Fp16 => quantize_fp16(weights),
    }
}

/// `scale = max|W| / 7`, `q = round(clip(W / scale, -7, 7)) * scale`.
pub fn quantize_nf4(weights: &ArrayD<f32>) -> ArrayD<f32> {
    let abs_max = weights.iter().fold(0.0_f32, |acc, v| acc.max(v.abs()));
    if abs_max == 0.0 {
        return ArrayD::zeros(weights.raw_dim());
    }
    let scale = abs_max / 7.0;
    weights.mapv(|w| (w / scale).clamp(-7.0, 7.0).round() * scale)
}

/// `scale = (max - min) / 255`, `zero_point = round(-min / scale)`.
pub fn quantize_int8(weights: &ArrayD<f32>) -> AffineQuantized {
    let shape = weights.shape().to_vec();
    let (min, max) = weights
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if weights.is_empty() || max <= min {
        // Constant tensor: code 1 at zero point 0 dequantizes to the value itself.
        let value = if weights.is_empty() { 0.0 } else { min };
        return AffineQuantized {
            codes: vec![1; weights.len()],
            scale: value,
            zero_point: 0,
            shape,
        };
    }
    let scale = (max - min) / 255.0;
    let zero_point = (-min / scale).round() as i32;
    let codes = weights
        .iter()
        .map(|&w| ((w / scale).round() as i32 + zero_point).clamp(0, 255) as u8)
        .collect();
    AffineQuantized {
        codes,
        scale,
        zero_point,
        shape,
    }
}

/// Inverse affine mapping: `(code - zero_point) * scale`.
pub fn dequantize_int8(quantized: &AffineQuantized) -> ArrayD<f32> {
    let values: Vec<f32> = quantized
        .codes
        .iter()
        .map(|&c| (c as i32 - quantized.zero_point) as f32 * quantized.scale)
        .collect();
    ArrayD::from_shape_vec(IxDyn(&quantized.shape), values)
        .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&quantized.shape)))
}

/// Precision truncation to 3 decimals.
pub fn quantize_fp16(weights: &ArrayD<f32>) -> ArrayD<f32> {
    weights.mapv(|w| (w * 1000.0).round() / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn test_nf4_levels() {
        let w = tensor(&[-1.4, -0.1, 0.0, 0.35, 0.7]);
        let q = quantize_nf4(&w);
        let scale = 1.4 / 7.0;
        for v in q.iter() {
            let level = v / scale;
            assert!((level - level.round()).abs() < 1e-4);
            assert!(level.abs() <= 7.0 + 1e-4);
        }
        assert!((q[0] + 1.4).abs() < 1e-5);
    }

    #[test]
    fn test_nf4_zero_tensor() {
        let q = quantize_nf4(&tensor(&[0.0, 0.0]));
        assert!(q.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_int8_roundtrip_within_one_step() {
        let w = tensor(&[-2.0, -0.731, 0.0, 0.5, 1.25, 3.0]);
        let q = quantize_int8(&w);
        let back = dequantize_int8(&q);
        for (a, b) in w.iter().zip(back.iter()) {
            assert!((a - b).abs() <= q.scale + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_int8_constant_tensor() {
        for value in [0.3, -1.75, 0.0, 42.0] {
            let w = tensor(&[value; 3]);
            let back = dequantize_int8(&quantize_int8(&w));
            assert_eq!(back, w);
        }
    }

    #[test]
    fn test_fp16_truncation() {
        let q = quantize_fp16(&tensor(&[0.123456, -1.98765]));
        assert!((q[0] - 0.123).abs() < 1e-6);
        assert!((q[1] + 1.988).abs() < 1e-6);
    }

    #[test]
    fn test_mode_bits_and_display() {
        assert_eq!(QuantizationMode::Nf4.bits(), 4);
        assert_eq!(QuantizationMode::Int8.to_string(), "int8");
        assert_eq!("FP16".parse::<QuantizationMode>().unwrap(), QuantizationMode::Fp16);
        assert!("int4".parse::<QuantizationMode>().is_err());
    }
}
