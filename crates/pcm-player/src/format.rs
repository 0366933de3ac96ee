//! Raw PCM chunk conversion.
//!
//! Turns little-endian byte chunks into normalized interleaved `f32` samples.
//! Chunks must hold a whole number of samples; anything else is rejected as a
//! whole so the stream never slips out of sample phase.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Chunk could not be converted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("chunk of {len} bytes is not a multiple of the {width}-byte sample width")]
    Misaligned { len: usize, width: usize },
}

/// Supported wire encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    #[serde(alias = "8bitInt")]
    Int8,
    #[serde(alias = "16bitInt")]
    Int16,
    #[serde(alias = "32bitInt")]
    Int32,
    #[serde(alias = "32bitFloat")]
    Float32,
}

impl SampleEncoding {
    /// Bytes per sample.
    pub fn sample_width(self) -> usize {
        match self {
            SampleEncoding::Int8 => 1,
            SampleEncoding::Int16 => 2,
            SampleEncoding::Int32 | SampleEncoding::Float32 => 4,
        }
    }

    /// Value that maps the integer range onto [-1, 1].
    pub fn divisor(self) -> f64 {
        match self {
            SampleEncoding::Int8 => 128.0,
            SampleEncoding::Int16 => 32_768.0,
            SampleEncoding::Int32 => 2_147_483_648.0,
            SampleEncoding::Float32 => 1.0,
        }
    }

    /// Convert a raw chunk into normalized samples.
    ///
    /// Integer encodings land in [-1, 1] by construction. `Float32` input is passed through
    /// untouched, including values outside that range.
    pub fn convert(self, bytes: &[u8]) -> Result<Vec<f32>, FormatError> {
        let width = self.sample_width();
        if bytes.len() % width != 0 {
            return Err(FormatError::Misaligned {
                len: bytes.len(),
                width,
            });
        }

        let samples = match self {
            SampleEncoding::Int8 => bytes
                .iter()
                .map(|b| f32::from(*b as i8) / 128.0)
                .collect(),
            SampleEncoding::Int16 => bytes
                .chunks_exact(2)
                .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / 32_768.0)
                .collect(),
            SampleEncoding::Int32 => bytes
                .chunks_exact(4)
                .map(|c| {
                    let v = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    (f64::from(v) / self.divisor()) as f32
                })
                .collect(),
            SampleEncoding::Float32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };
        Ok(samples)
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleEncoding::Int8 => "int8",
            SampleEncoding::Int16 => "int16",
            SampleEncoding::Int32 => "int32",
            SampleEncoding::Float32 => "float32",
        };
        f.write_str(name)
    }
}

/// Unrecognized encoding name.
#[derive(Debug, Error)]
#[error("unknown sample encoding: {0} (expected int8, int16, int32 or float32)")]
pub struct UnknownEncoding(String);

impl FromStr for SampleEncoding {
    type Err = UnknownEncoding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "int8" | "i8" | "8bitInt" => Ok(SampleEncoding::Int8),
            "int16" | "i16" | "16bitInt" => Ok(SampleEncoding::Int16),
            "int32" | "i32" | "32bitInt" => Ok(SampleEncoding::Int32),
            "float32" | "f32" | "32bitFloat" => Ok(SampleEncoding::Float32),
            other => Err(UnknownEncoding(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int16_converts_little_endian() {
        let data = [
            0x00, 0x40, // 16384
            0x00, 0x80, // -32768
            0xFF, 0x7F, // 32767
            0x00, 0x00, // 0
        ];
        let out = SampleEncoding::Int16.convert(&data).unwrap();
        assert_eq!(out, vec![0.5, -1.0, 32_767.0 / 32_768.0, 0.0]);
    }

    #[test]
    fn int8_covers_full_range() {
        let data = [0x80, 0x7F, 0x00, 0xC0];
        let out = SampleEncoding::Int8.convert(&data).unwrap();
        assert_eq!(out, vec![-1.0, 127.0 / 128.0, 0.0, -0.5]);
    }

    #[test]
    fn int32_extremes_stay_in_range() {
        let mut data = Vec::new();
        data.extend_from_slice(&i32::MIN.to_le_bytes());
        data.extend_from_slice(&i32::MAX.to_le_bytes());
        data.extend_from_slice(&(1i32 << 30).to_le_bytes());
        let out = SampleEncoding::Int32.convert(&data).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], -1.0);
        assert!(out[1] <= 1.0 && out[1] > 0.999);
        assert_eq!(out[2], 0.5);
    }

    #[test]
    fn integer_encodings_yield_len_over_width_samples_in_range() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        for enc in [
            SampleEncoding::Int8,
            SampleEncoding::Int16,
            SampleEncoding::Int32,
        ] {
            let out = enc.convert(&bytes).unwrap();
            assert_eq!(out.len(), bytes.len() / enc.sample_width());
            assert!(out.iter().all(|s| (-1.0..=1.0).contains(s)), "{enc}");
        }
    }

    #[test]
    fn float32_is_byte_exact_passthrough() {
        let input = [0.25f32, -3.5, 1.0e-7, f32::MAX];
        let bytes: Vec<u8> = input.iter().flat_map(|s| s.to_le_bytes()).collect();
        let out = SampleEncoding::Float32.convert(&bytes).unwrap();
        assert_eq!(out.len(), input.len());
        for (a, b) in out.iter().zip(input.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn misaligned_chunk_is_rejected() {
        let err = SampleEncoding::Int16.convert(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, FormatError::Misaligned { len: 3, width: 2 });
        assert!(SampleEncoding::Float32.convert(&[0; 6]).is_err());
        assert!(SampleEncoding::Int8.convert(&[0; 7]).is_ok());
    }

    #[test]
    fn empty_chunk_converts_to_nothing() {
        assert!(SampleEncoding::Int32.convert(&[]).unwrap().is_empty());
    }

    #[test]
    fn parses_names_and_legacy_spellings() {
        assert_eq!("int16".parse::<SampleEncoding>().unwrap(), SampleEncoding::Int16);
        assert_eq!("32bitFloat".parse::<SampleEncoding>().unwrap(), SampleEncoding::Float32);
        assert_eq!("8bitInt".parse::<SampleEncoding>().unwrap(), SampleEncoding::Int8);
        assert!("24bitInt".parse::<SampleEncoding>().is_err());
        assert_eq!(SampleEncoding::Int32.to_string(), "int32");
    }
}
