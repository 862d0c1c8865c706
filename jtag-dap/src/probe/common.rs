//! Scan chain description and bypass padding shared by the JTAG users.

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

/// One TAP on the scan chain.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TapConfig {
    /// Dotted TAP name, e.g. `cpu.tap`.
    pub name: String,
    /// Instruction register length in bits.
    pub ir_len: u8,
    /// Disabled TAPs stay on the chain but are not initialized.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TapConfig {
    pub fn new(name: impl Into<String>, ir_len: u8) -> Self {
        Self {
            name: name.into(),
            ir_len,
            enabled: true,
        }
    }
}

/// The TAPs of one scan chain. Index 0 is the TAP closest to TDO.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ScanChain {
    taps: Vec<TapConfig>,
}

impl ScanChain {
    pub fn new(taps: Vec<TapConfig>) -> Self {
        Self { taps }
    }

    pub fn taps(&self) -> &[TapConfig] {
        &self.taps
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.taps.iter().position(|tap| tap.name == name)
    }

    pub fn tap(&self, name: &str) -> Option<&TapConfig> {
        self.taps.iter().find(|tap| tap.name == name)
    }

    /// Bypass padding needed to address the TAP at `selected`.
    pub fn chain_params(&self, selected: usize) -> Option<ChainParams> {
        let irlen = self.taps.get(selected)?.ir_len as usize;
        let mut params = ChainParams {
            irlen,
            ..ChainParams::default()
        };

        for (index, tap) in self.taps.iter().enumerate() {
            if index < selected {
                params.irpre += tap.ir_len as usize;
                params.drpre += 1;
            } else if index > selected {
                params.irpost += tap.ir_len as usize;
                params.drpost += 1;
            }
        }

        Some(params)
    }
}

/// Bit counts of the other TAPs around the selected one.
///
/// Every other TAP is held in BYPASS: its IR bits are all ones and it adds one
/// bit to every DR scan.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ChainParams {
    pub irpre: usize,
    pub irpost: usize,
    pub drpre: usize,
    pub drpost: usize,
    pub irlen: usize,
}

impl ChainParams {
    /// Wraps an instruction for the selected TAP with BYPASS for all others.
    pub fn pad_ir(&self, instruction: u32) -> BitVec<u8, Lsb0> {
        let mut bits = BitVec::with_capacity(self.irpre + self.irlen + self.irpost);
        bits.resize(self.irpre, true);
        bits.extend((0..self.irlen).map(|i| i < 32 && instruction & (1 << i) != 0));
        bits.resize(bits.len() + self.irpost, true);
        bits
    }

    /// Wraps a data register value with one bypass bit per other TAP.
    pub fn pad_dr(&self, data: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        let mut bits = BitVec::with_capacity(self.drpre + data.len() + self.drpost);
        bits.resize(self.drpre, false);
        bits.extend_from_bitslice(data);
        bits.resize(bits.len() + self.drpost, false);
        bits
    }

    /// Extracts the selected TAP's bits from a padded DR capture.
    pub fn unpad_dr<'a>(
        &self,
        captured: &'a BitSlice<u8, Lsb0>,
        len: usize,
    ) -> &'a BitSlice<u8, Lsb0> {
        &captured[self.drpre..][..len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chain() -> ScanChain {
        ScanChain::new(vec![
            TapConfig::new("fpga.tap", 6),
            TapConfig::new("cpu.tap", 4),
            TapConfig::new("dsp.tap", 5),
        ])
    }

    #[test]
    fn chain_params_count_other_taps() {
        let params = chain().chain_params(1).unwrap();

        assert_eq!(
            params,
            ChainParams {
                irpre: 6,
                irpost: 5,
                drpre: 1,
                drpost: 1,
                irlen: 4,
            }
        );
    }

    #[test]
    fn unknown_position_has_no_params() {
        assert_eq!(chain().chain_params(3), None);
    }

    #[test]
    fn ir_padding_is_bypass() {
        let params = ChainParams {
            irpre: 2,
            irpost: 1,
            irlen: 4,
            ..Default::default()
        };

        assert_eq!(
            params.pad_ir(0xA),
            bitvec![u8, Lsb0; 1, 1, 0, 1, 0, 1, 1]
        );
    }

    #[test]
    fn dr_padding_round_trips() {
        let params = ChainParams {
            drpre: 2,
            drpost: 1,
            ..Default::default()
        };
        let data = bitvec![u8, Lsb0; 1, 0, 1];

        let padded = params.pad_dr(&data);
        assert_eq!(padded, bitvec![u8, Lsb0; 0, 0, 1, 0, 1, 0]);
        assert_eq!(params.unpad_dr(&padded, 3).to_bitvec(), data);
    }
}
