//! Device configuration consumed by renderer initialization
//!
//! File loading and discovery belong to the outer configuration layer;
//! these structs are the contract it fills in before a device reset.

use serde::{Deserialize, Serialize};

use crate::{AmbiNorm, Channel, MAX_AMBI_COEFFS};

/// Preferred stereo reproduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoMode {
    Headphones,
    Speakers,
    #[default]
    Auto,
}

/// HRTF rendering depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HrtfMode {
    /// Per-voice HRIR rendering
    #[default]
    Full,
    /// Ambisonic panning with a device-side HRTF decode
    Basic,
}

/// Stereo output encoding when HRTF and crossfeed are not in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoEncoding {
    Uhj,
    #[default]
    Panpot,
}

/// Per-device renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Use the dual-band high-quality decoder for custom layouts
    pub hq_mode: bool,
    /// Enable near-field control filtering
    pub nfc: bool,
    /// Reference delay (seconds) for NFC on ambisonic output, 0 disables
    pub nfc_ref_delay: f32,
    /// Enable per-speaker distance compensation
    pub distance_comp: bool,
    /// Enable the front image stabilizer on surround layouts
    pub front_stabilizer: bool,
    pub stereo_mode: StereoMode,
    pub hrtf_mode: HrtfMode,
    pub stereo_encoding: StereoEncoding,
    /// Crossfeed strength 1..=6, 0 disables
    pub cf_level: u8,
    /// Add TPDF dither sized for the output format
    pub dither: bool,
    /// Run the look-ahead limiter on the real output
    pub output_limiter: bool,
    /// Component ordering of an ambisonic output device
    pub ambi_layout: crate::AmbiLayout,
    /// Normalization of an ambisonic output device
    pub ambi_norm: crate::AmbiNorm,
    /// Custom speaker-layout decoder description, already loaded
    pub custom_decoder: Option<CustomDecoder>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hq_mode: false,
            nfc: true,
            nfc_ref_delay: 0.0,
            distance_comp: true,
            front_stabilizer: false,
            stereo_mode: StereoMode::default(),
            hrtf_mode: HrtfMode::default(),
            stereo_encoding: StereoEncoding::default(),
            cf_level: 0,
            dither: true,
            output_limiter: true,
            ambi_layout: crate::AmbiLayout::default(),
            ambi_norm: crate::AmbiNorm::default(),
            custom_decoder: None,
        }
    }
}

/// One speaker of a custom decoder description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderSpeaker {
    /// Output channel the speaker feeds
    pub channel: Channel,
    /// Distance from the listening position in meters
    pub distance: f32,
    /// Matrix row: gain per ambisonic component, in the description's
    /// masked component order
    pub hf_gains: Vec<f32>,
    /// Low-frequency matrix row; empty for single-band decoders
    pub lf_gains: Vec<f32>,
}

/// Custom ambisonic decoder description (the loaded form of a decoder
/// preset file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDecoder {
    pub speakers: Vec<DecoderSpeaker>,
    /// 1 = single band, 2 = dual band with a crossover
    pub freq_bands: u8,
    /// Crossover frequency in Hz (dual band only)
    pub xover_freq: f32,
    /// Crossover band balance in dB (dual band only)
    pub xover_ratio: f32,
    /// Bitmask of the ambisonic components (by ACN) the matrices cover
    pub chan_mask: u32,
    /// Normalization convention of the matrix coefficients
    pub coeff_scale: AmbiNorm,
    /// Per-order gains for the high-frequency matrix
    pub hf_order_gain: [f32; 4],
    /// Per-order gains for the low-frequency matrix
    pub lf_order_gain: [f32; 4],
}

/// Component masks per order, for interpreting `chan_mask`
pub const AMBI_0ORDER_MASK: u32 = 0x0000_0001;
pub const AMBI_1ORDER_MASK: u32 = 0x0000_000F;
pub const AMBI_2ORDER_MASK: u32 = 0x0000_01FF;
pub const AMBI_3ORDER_MASK: u32 = 0x0000_FFFF;

/// Mask bits selecting components with height information
pub const AMBI_PERIPHONIC_MASK: u32 = 0xFE34;

impl CustomDecoder {
    pub fn is_periphonic(&self) -> bool {
        (self.chan_mask & AMBI_PERIPHONIC_MASK) != 0
    }

    /// Ambisonic order implied by the channel mask
    pub fn order(&self) -> usize {
        if self.chan_mask > AMBI_2ORDER_MASK {
            3
        } else if self.chan_mask > AMBI_1ORDER_MASK {
            2
        } else {
            1
        }
    }

    /// ACNs covered by the channel mask, in ascending order
    pub fn masked_acns(&self) -> Vec<usize> {
        (0..MAX_AMBI_COEFFS)
            .filter(|&acn| self.chan_mask & (1 << acn) != 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(mask: u32) -> CustomDecoder {
        CustomDecoder {
            speakers: Vec::new(),
            freq_bands: 1,
            xover_freq: 400.0,
            xover_ratio: 0.0,
            chan_mask: mask,
            coeff_scale: AmbiNorm::N3d,
            hf_order_gain: [1.0; 4],
            lf_order_gain: [1.0; 4],
        }
    }

    #[test]
    fn order_from_mask() {
        assert_eq!(decoder(AMBI_1ORDER_MASK).order(), 1);
        assert_eq!(decoder(AMBI_2ORDER_MASK).order(), 2);
        assert_eq!(decoder(AMBI_3ORDER_MASK).order(), 3);
    }

    #[test]
    fn periphonic_detection() {
        // Horizontal first-order: W, X, Y only.
        assert!(!decoder(0b1011).is_periphonic());
        // Full first-order includes Z (ACN 2).
        assert!(decoder(AMBI_1ORDER_MASK).is_periphonic());
    }

    #[test]
    fn masked_acns_ascending() {
        assert_eq!(decoder(0b1011).masked_acns(), vec![0, 1, 3]);
    }
}
