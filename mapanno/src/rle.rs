//! COCO run-length encoded masks, as emitted by SAM-style mask generators
//! with `output_mode="coco_rle"`.
//!
//! Runs alternate background/foreground starting with background and walk the
//! mask in column-major order. The compressed string form stores each run as
//! 5-bit groups offset by 48, with runs after the second delta-coded against
//! the run two positions earlier.

use serde::{Deserialize, Serialize};

use crate::mask::Mask;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RleError {
    #[error("invalid character {0:?} in compressed counts")]
    InvalidChar(char),
    #[error("compressed counts end inside a run")]
    Truncated,
    #[error("negative run length in counts")]
    NegativeRun,
    #[error("run length does not fit in 64 bits")]
    Overflow,
    #[error("runs cover {got} pixels, mask has {expected}")]
    LengthMismatch { got: u64, expected: u64 },
}

/// `size` is `[height, width]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoRle {
    pub size: [u32; 2],
    pub counts: RleCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    Compressed(String),
    Runs(Vec<u32>),
}

impl CocoRle {
    pub fn height(&self) -> u32 {
        self.size[0]
    }

    pub fn width(&self) -> u32 {
        self.size[1]
    }

    /// Run lengths, decompressing the string form if needed.
    pub fn runs(&self) -> Result<Vec<u32>, RleError> {
        match &self.counts {
            RleCounts::Runs(runs) => Ok(runs.clone()),
            RleCounts::Compressed(s) => decompress(s),
        }
    }

    /// Decode into a row-major mask.
    pub fn to_mask(&self) -> Result<Mask, RleError> {
        let (h, w) = (self.height(), self.width());
        let n = h as u64 * w as u64;
        let runs = self.runs()?;

        let covered: u64 = runs.iter().map(|&r| r as u64).sum();
        if covered != n {
            return Err(RleError::LengthMismatch { got: covered, expected: n });
        }

        let mut column_major = vec![0u8; n as usize];
        let mut idx = 0usize;
        let mut value = 0u8;
        for &run in &runs {
            let end = idx + run as usize;
            column_major[idx..end].fill(value);
            idx = end;
            value ^= 1;
        }

        Mask::from_column_major(w, h, &column_major).ok_or(RleError::LengthMismatch {
            got: covered,
            expected: n,
        })
    }
}

/// Decompress the COCO string form into run lengths.
pub fn decompress(s: &str) -> Result<Vec<u32>, RleError> {
    let mut runs: Vec<i64> = Vec::new();
    let mut chars = s.chars();

    while let Some(first) = chars.next() {
        let mut x: i64 = 0;
        let mut k = 0;
        let mut c = Some(first);
        loop {
            let ch = c.ok_or(RleError::Truncated)?;
            let code = (ch as i64) - 48;
            if !(0..64).contains(&code) {
                return Err(RleError::InvalidChar(ch));
            }
            if k >= 12 {
                return Err(RleError::Overflow);
            }
            x |= (code & 0x1f) << (5 * k);
            k += 1;
            if code & 0x20 == 0 {
                if code & 0x10 != 0 {
                    x |= -1i64 << (5 * k);
                }
                break;
            }
            c = chars.next();
        }
        if runs.len() > 2 {
            x += runs[runs.len() - 2];
        }
        if x < 0 {
            return Err(RleError::NegativeRun);
        }
        if x > u32::MAX as i64 {
            return Err(RleError::Overflow);
        }
        runs.push(x);
    }

    Ok(runs.into_iter().map(|r| r as u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compress run lengths the way pycocotools does.
    fn compress(runs: &[u32]) -> String {
        let mut s = String::new();
        for (i, &run) in runs.iter().enumerate() {
            let mut x = run as i64;
            if i > 2 {
                x -= runs[i - 2] as i64;
            }
            loop {
                let mut c = x & 0x1f;
                x >>= 5;
                let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
                if more {
                    c |= 0x20;
                }
                s.push((c as u8 + 48) as char);
                if !more {
                    break;
                }
            }
        }
        s
    }

    #[test]
    fn decode_plain_runs() {
        // 2x3 mask (h=2, w=3), column-major 0 0 | 1 1 | 0 1
        let rle = CocoRle {
            size: [2, 3],
            counts: RleCounts::Runs(vec![2, 2, 1, 1]),
        };
        let m = rle.to_mask().unwrap();
        assert!(!m.get(0, 0) && !m.get(0, 1));
        assert!(m.get(1, 0) && m.get(1, 1));
        assert!(!m.get(2, 0) && m.get(2, 1));
        assert_eq!(m.area(), 3);
    }

    #[test]
    fn decompress_known_string() {
        // pycocotools: encode of a 4x4 mask with a 2x2 block at rows 1..3, cols 1..3
        // gives runs [5, 2, 2, 2, 5].
        let runs = vec![5, 2, 2, 2, 5];
        let s = compress(&runs);
        assert_eq!(decompress(&s).unwrap(), runs);
    }

    #[test]
    fn decompress_large_and_delta_coded_runs() {
        let runs = vec![100_000, 37, 99_000, 1, 250_000, 3];
        assert_eq!(decompress(&compress(&runs)).unwrap(), runs);
    }

    #[test]
    fn compressed_rle_decodes_to_mask() {
        let rle = CocoRle {
            size: [4, 4],
            counts: RleCounts::Compressed(compress(&[5, 2, 2, 2, 5])),
        };
        let m = rle.to_mask().unwrap();
        assert_eq!(m.area(), 4);
        assert!(m.get(1, 1) && m.get(2, 1) && m.get(1, 2) && m.get(2, 2));
    }

    #[test]
    fn length_mismatch_is_reported() {
        let rle = CocoRle {
            size: [4, 4],
            counts: RleCounts::Runs(vec![5, 2]),
        };
        assert_eq!(
            rle.to_mask().unwrap_err(),
            RleError::LengthMismatch { got: 7, expected: 16 }
        );
    }

    #[test]
    fn invalid_character_is_reported() {
        assert_eq!(decompress("1~"), Err(RleError::InvalidChar('~')));
    }

    #[test]
    fn deserializes_both_forms() {
        let a: CocoRle = serde_json::from_str(r#"{"size":[2,3],"counts":[2,2,1,1]}"#).unwrap();
        assert_eq!(a.counts, RleCounts::Runs(vec![2, 2, 1, 1]));
        let b: CocoRle = serde_json::from_str(r#"{"size":[2,3],"counts":"22"}"#).unwrap();
        assert_eq!(b.counts, RleCounts::Compressed("22".to_string()));
    }
}
