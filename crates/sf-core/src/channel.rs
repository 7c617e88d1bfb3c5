//! Output channel, layout, and sample format model

use serde::{Deserialize, Serialize};

/// Named speaker position on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
    /// Ambisonic component feeds on an ambisonic output device
    Aux(u8),
}

impl Channel {
    pub fn label(&self) -> &'static str {
        match self {
            Channel::FrontLeft => "front-left",
            Channel::FrontRight => "front-right",
            Channel::FrontCenter => "front-center",
            Channel::Lfe => "lfe",
            Channel::BackLeft => "back-left",
            Channel::BackRight => "back-right",
            Channel::BackCenter => "back-center",
            Channel::SideLeft => "side-left",
            Channel::SideRight => "side-right",
            Channel::Aux(_) => "aux",
        }
    }
}

/// Device output channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Quad,
    X51,
    X51Rear,
    X61,
    X71,
    /// Full-sphere ambisonic output of the given order (1..=3)
    Ambi3D(u8),
}

impl ChannelLayout {
    /// Number of interleaved output channels
    pub fn count(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Quad => 4,
            ChannelLayout::X51 | ChannelLayout::X51Rear => 6,
            ChannelLayout::X61 => 7,
            ChannelLayout::X71 => 8,
            ChannelLayout::Ambi3D(order) => (*order as usize + 1) * (*order as usize + 1),
        }
    }

    /// Channel names in interleave order. Ambisonic devices expose their
    /// components as numbered aux channels.
    pub fn channels(&self) -> Vec<Channel> {
        use Channel::*;
        match self {
            ChannelLayout::Mono => vec![FrontCenter],
            ChannelLayout::Stereo => vec![FrontLeft, FrontRight],
            ChannelLayout::Quad => vec![FrontLeft, FrontRight, BackLeft, BackRight],
            ChannelLayout::X51 => {
                vec![FrontLeft, FrontRight, FrontCenter, Lfe, SideLeft, SideRight]
            }
            ChannelLayout::X51Rear => {
                vec![FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight]
            }
            ChannelLayout::X61 => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackCenter,
                SideLeft,
                SideRight,
            ],
            ChannelLayout::X71 => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackLeft,
                BackRight,
                SideLeft,
                SideRight,
            ],
            ChannelLayout::Ambi3D(_) => (0..self.count()).map(|i| Aux(i as u8)).collect(),
        }
    }

    /// WAVE_FORMAT_EXTENSIBLE channel mask for this layout
    pub fn wave_channel_mask(&self) -> u32 {
        match self {
            ChannelLayout::Mono => 0x04,
            ChannelLayout::Stereo => 0x03,
            ChannelLayout::Quad => 0x33,
            ChannelLayout::X51 => 0x60F,
            ChannelLayout::X51Rear => 0x3F,
            ChannelLayout::X61 => 0x70F,
            ChannelLayout::X71 => 0x63F,
            // B-Format streams carry no speaker mask.
            ChannelLayout::Ambi3D(_) => 0,
        }
    }

    pub fn is_ambisonic(&self) -> bool {
        matches!(self, ChannelLayout::Ambi3D(_))
    }

    /// True when the layout has the three front channels the image
    /// stabilizer requires.
    pub fn has_front_trio(&self) -> bool {
        matches!(
            self,
            ChannelLayout::X51 | ChannelLayout::X51Rear | ChannelLayout::X61 | ChannelLayout::X71
        )
    }
}

/// Device output sample type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I8 | SampleFormat::U8 => 1,
            SampleFormat::I16 | SampleFormat::U16 => 2,
            SampleFormat::I32 | SampleFormat::U32 | SampleFormat::F32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleFormat::F32)
    }

    /// Default dither quantization depth in bits, 0 when dither is
    /// pointless for the format.
    pub fn default_dither_bits(&self) -> u8 {
        match self {
            SampleFormat::I8 | SampleFormat::U8 => 8,
            SampleFormat::I16 | SampleFormat::U16 => 16,
            // 24+ effective bits are below the float mantissa already.
            SampleFormat::I32 | SampleFormat::U32 | SampleFormat::F32 => 0,
        }
    }
}

/// Source buffer channel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    Mono,
    Stereo,
    Rear,
    Quad,
    X51,
    X61,
    X71,
    /// First-order B-Format, horizontal only (W, X, Y), FuMa convention
    BFormat2D,
    /// First-order B-Format with height (W, X, Y, Z), FuMa convention
    BFormat3D,
}

impl BufferFormat {
    pub fn channel_count(&self) -> usize {
        match self {
            BufferFormat::Mono => 1,
            BufferFormat::Stereo | BufferFormat::Rear => 2,
            BufferFormat::Quad | BufferFormat::BFormat3D => 4,
            BufferFormat::BFormat2D => 3,
            BufferFormat::X51 => 6,
            BufferFormat::X61 => 7,
            BufferFormat::X71 => 8,
        }
    }

    pub fn is_bformat(&self) -> bool {
        matches!(self, BufferFormat::BFormat2D | BufferFormat::BFormat3D)
    }
}

/// How the device turns the dry mix into real output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Ambisonic panning decoded to the output layout
    Normal,
    /// Two-speaker stereo; azimuths are reshaped toward the speaker span
    StereoPair,
    /// Per-voice HRTF rendering to headphones
    Hrtf,
}

/// Distance attenuation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceModel {
    #[default]
    InverseClamped,
    Inverse,
    LinearClamped,
    Linear,
    ExponentClamped,
    Exponent,
    Disable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_counts_match_channel_lists() {
        for layout in [
            ChannelLayout::Mono,
            ChannelLayout::Stereo,
            ChannelLayout::Quad,
            ChannelLayout::X51,
            ChannelLayout::X51Rear,
            ChannelLayout::X61,
            ChannelLayout::X71,
            ChannelLayout::Ambi3D(1),
            ChannelLayout::Ambi3D(2),
            ChannelLayout::Ambi3D(3),
        ] {
            assert_eq!(layout.count(), layout.channels().len(), "{layout:?}");
        }
    }

    #[test]
    fn wave_masks() {
        assert_eq!(ChannelLayout::Mono.wave_channel_mask(), 0x04);
        assert_eq!(ChannelLayout::Stereo.wave_channel_mask(), 0x03);
        assert_eq!(ChannelLayout::Quad.wave_channel_mask(), 0x33);
        assert_eq!(ChannelLayout::X51.wave_channel_mask(), 0x60F);
        assert_eq!(ChannelLayout::X51Rear.wave_channel_mask(), 0x3F);
        assert_eq!(ChannelLayout::X61.wave_channel_mask(), 0x70F);
        assert_eq!(ChannelLayout::X71.wave_channel_mask(), 0x63F);
    }

    #[test]
    fn ambi_channel_counts() {
        assert_eq!(ChannelLayout::Ambi3D(1).count(), 4);
        assert_eq!(ChannelLayout::Ambi3D(2).count(), 9);
        assert_eq!(ChannelLayout::Ambi3D(3).count(), 16);
    }

    #[test]
    fn bformat_flags() {
        assert!(BufferFormat::BFormat2D.is_bformat());
        assert!(BufferFormat::BFormat3D.is_bformat());
        assert!(!BufferFormat::Stereo.is_bformat());
    }
}
