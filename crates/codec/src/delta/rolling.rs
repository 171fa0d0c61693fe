//! Rolling weak checksum used for delta block matching.
//!
//! An Adler-style pair of 16-bit sums: `s1` accumulates bytes, `s2`
//! accumulates the running prefix sums. The window can be advanced one byte
//! at a time in constant time, which is what makes scanning a target file
//! for moved blocks affordable.

/// Rolling checksum state over a fixed-size window.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    /// Creates zeroed state.
    #[must_use]
    pub const fn new() -> Self {
        Self { s1: 0, s2: 0, len: 0 }
    }

    /// Recomputes the state for a fresh block.
    pub fn reset_to_block(&mut self, block: &[u8]) {
        self.s1 = 0;
        self.s2 = 0;
        self.len = block.len();
        for &byte in block {
            self.s1 = self.s1.wrapping_add(u32::from(byte));
            self.s2 = self.s2.wrapping_add(self.s1);
        }
        self.s1 &= 0xffff;
        self.s2 &= 0xffff;
    }

    /// Advances the window by removing `outgoing` and appending `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        debug_assert!(self.len > 0, "roll requires an initialised window");
        let window_len = self.len as u32;
        let out = u32::from(outgoing);
        let inn = u32::from(incoming);

        self.s1 = self.s1.wrapping_sub(out).wrapping_add(inn) & 0xffff;
        self.s2 = self
            .s2
            .wrapping_sub(window_len.wrapping_mul(out))
            .wrapping_add(self.s1)
            & 0xffff;
    }

    /// Packed 32-bit checksum value.
    #[must_use]
    pub const fn value(&self) -> u32 {
        (self.s2 << 16) | self.s1
    }

    /// One-shot checksum of a block.
    #[must_use]
    pub fn of_block(block: &[u8]) -> u32 {
        let mut state = Self::new();
        state.reset_to_block(block);
        state.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_matches_recompute_at_every_offset() {
        let data: Vec<u8> = (0..512u16).map(|i| (i % 251) as u8).collect();
        let window = 64;

        let mut rolling = RollingChecksum::new();
        rolling.reset_to_block(&data[..window]);

        for start in 1..data.len() - window {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.value(),
                RollingChecksum::of_block(&data[start..start + window]),
                "mismatch at offset {start}"
            );
        }
    }
}
