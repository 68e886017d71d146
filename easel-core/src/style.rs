//! Stroke, text and image attributes attached to canvas elements.

use serde::{Deserialize, Serialize};

/// End cap drawn at open stroke ends.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineCap {
    #[default]
    Round,
    Butt,
    Square,
}

/// Corner shape where two stroke segments meet.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineJoin {
    #[default]
    Round,
    Miter,
    Bevel,
}

/// Stroke styling. The default is a solid line with round caps and joins.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct StrokeStyle {
    /// Dash pattern in pixels (empty = solid)
    pub dash: Vec<f32>,
    pub cap: LineCap,
    pub join: LineJoin,
}

impl StrokeStyle {
    /// A dashed stroke with default caps and joins.
    pub fn dashed(pattern: impl Into<Vec<f32>>) -> Self {
        Self {
            dash: pattern.into(),
            ..Self::default()
        }
    }

    pub fn is_solid(&self) -> bool {
        self.dash.is_empty()
    }

    /// Whether this is the solid/round style every element starts with.
    pub fn is_default(&self) -> bool {
        self.is_solid() && self.cap == LineCap::Round && self.join == LineJoin::Round
    }
}

/// Horizontal alignment of a text block.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// Content and formatting of a text element.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TextFormat {
    pub content: String,
    pub font_family: String,
    pub font_size: f32,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub align: TextAlign,
}

impl TextFormat {
    pub const DEFAULT_FONT_FAMILY: &'static str = "Arial";
    pub const DEFAULT_FONT_SIZE: f32 = 16.0;

    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            content: String::new(),
            font_family: Self::DEFAULT_FONT_FAMILY.to_string(),
            font_size: Self::DEFAULT_FONT_SIZE,
            bold: false,
            italic: false,
            underline: false,
            align: TextAlign::Left,
        }
    }
}

/// Source of an image element plus the pixel size of the original asset.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct ImageSource {
    /// URL or data URI
    pub src: String,
    pub natural_width: u32,
    pub natural_height: u32,
}

impl ImageSource {
    pub fn new(src: impl Into<String>, natural_width: u32, natural_height: u32) -> Self {
        Self {
            src: src.into(),
            natural_width,
            natural_height,
        }
    }
}
