use crate::error::CoreError;

pub const LT_HASH_LEN: usize = 128;

/// Order-independent accumulator over a set of values: 64 little-endian u16
/// lanes, each item contributing its 128-byte blake3 expansion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LtHash {
    lanes: [u8; LT_HASH_LEN],
}

impl Default for LtHash {
    fn default() -> Self {
        Self {
            lanes: [0u8; LT_HASH_LEN],
        }
    }
}

impl LtHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let lanes: [u8; LT_HASH_LEN] = bytes.try_into().map_err(|_| {
            CoreError::Structural(format!("rolling hash of {} bytes", bytes.len()))
        })?;
        Ok(Self { lanes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.lanes
    }

    pub fn add(&mut self, item: &[u8]) {
        let expanded = expand(item);
        self.combine(&expanded, u16::wrapping_add);
    }

    pub fn subtract(&mut self, item: &[u8]) {
        let expanded = expand(item);
        self.combine(&expanded, u16::wrapping_sub);
    }

    fn combine(&mut self, other: &[u8; LT_HASH_LEN], op: fn(u16, u16) -> u16) {
        for i in (0..LT_HASH_LEN).step_by(2) {
            let a = u16::from_le_bytes([self.lanes[i], self.lanes[i + 1]]);
            let b = u16::from_le_bytes([other[i], other[i + 1]]);
            let [lo, hi] = op(a, b).to_le_bytes();
            self.lanes[i] = lo;
            self.lanes[i + 1] = hi;
        }
    }
}

fn expand(item: &[u8]) -> [u8; LT_HASH_LEN] {
    let mut out = [0u8; LT_HASH_LEN];
    let mut hasher = blake3::Hasher::new();
    hasher.update(item);
    hasher.finalize_xof().fill(&mut out);
    out
}
