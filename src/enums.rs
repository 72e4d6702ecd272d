use serde::Deserialize;

/// Whether a re-opened tile is decoded up front or plane by plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StackMode {
    /// Decode the whole `(c, z, y, x)` stack into memory.
    #[default]
    Loaded,
    /// Keep the reader open and decode each plane when it is requested.
    Virtual,
}

/// Physical length units reported by a backend or configured for the stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    #[default]
    Meter,
    Millimeter,
    Micrometer,
    Nanometer,
}

impl LengthUnit {
    pub fn in_meters(self) -> f64 {
        match self {
            LengthUnit::Meter => 1.0,
            LengthUnit::Millimeter => 1e-3,
            LengthUnit::Micrometer => 1e-6,
            LengthUnit::Nanometer => 1e-9,
        }
    }

    /// Factor converting a value in `self` into a value in `other`.
    pub fn factor_to(self, other: LengthUnit) -> f64 {
        match (self, other) {
            // Keep the common stage/pixel pairing exact.
            (LengthUnit::Meter, LengthUnit::Micrometer) => 1e6,
            (a, b) if a == b => 1.0,
            (a, b) => a.in_meters() / b.in_meters(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    #[default]
    LinearBlending,
    Average,
    Median,
    MaxIntensity,
    MinIntensity,
    None,
}

/// Fixed lookup-table colours a channel can be displayed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelColor {
    Red,
    Green,
    Blue,
    Cyan,
    Magenta,
    Yellow,
    Grays,
}

pub const PALETTE: [ChannelColor; 7] = [
    ChannelColor::Red,
    ChannelColor::Green,
    ChannelColor::Blue,
    ChannelColor::Cyan,
    ChannelColor::Magenta,
    ChannelColor::Yellow,
    ChannelColor::Grays,
];

impl ChannelColor {
    pub fn name(self) -> &'static str {
        match self {
            ChannelColor::Red => "Red",
            ChannelColor::Green => "Green",
            ChannelColor::Blue => "Blue",
            ChannelColor::Cyan => "Cyan",
            ChannelColor::Magenta => "Magenta",
            ChannelColor::Yellow => "Yellow",
            ChannelColor::Grays => "Grays",
        }
    }

    pub fn rgb(self) -> [u8; 3] {
        match self {
            ChannelColor::Red => [255, 0, 0],
            ChannelColor::Green => [0, 255, 0],
            ChannelColor::Blue => [0, 0, 255],
            ChannelColor::Cyan => [0, 255, 255],
            ChannelColor::Magenta => [255, 0, 255],
            ChannelColor::Yellow => [255, 255, 0],
            ChannelColor::Grays => [255, 255, 255],
        }
    }

    /// Exact RGB lookup against [`PALETTE`].
    pub fn from_rgb(rgb: [u8; 3]) -> Option<Self> {
        PALETTE.into_iter().find(|color| color.rgb() == rgb)
    }
}
