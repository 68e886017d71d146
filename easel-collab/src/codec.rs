//! Compact wire encoding for batches of canvas elements.
//!
//! Each element maps to a short-keyed record:
//! ```text
//! { "i": id, "t": kind, "c": color, "w": stroke width, "o": opacity, "z": layer,
//!   "p": [[x,y],..]      pencil / line / arrow
//!   "b": [x,y,w,h]       rectangle / circle / image / text
//!   "tx": {..}           text content and formatting
//!   "im": {..}           image source and natural size
//!   "f", "d", "lc", "lj" fill, dash, cap, join (only when set / non-default) }
//! ```
//!
//! Geometry is rounded to whole pixels on encode; everything else survives
//! `decode(encode(x))` unchanged. Decoding is fail-closed: a record missing
//! the geometry or block its kind requires rejects the whole batch.

use easel_core::{
    Bounds, Element, ElementKind, ImageSource, LineCap, LineJoin, Point, StrokeStyle, TextAlign,
    TextFormat,
};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("element {id}: unknown kind code '{code}'")]
    UnknownKind { id: String, code: String },
    #[error("element {id}: missing required field '{field}'")]
    MissingField { id: String, field: &'static str },
    #[error("malformed batch: {0}")]
    Malformed(String),
}

/// Codec settings.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Batches whose JSON size exceeds this are sent compact. Default: 10KB.
    pub compress_threshold_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compress_threshold_bytes: 10 * 1024,
        }
    }
}

fn default_color() -> String {
    Element::DEFAULT_COLOR.to_string()
}

fn default_stroke_width() -> f32 {
    Element::DEFAULT_STROKE_WIDTH
}

fn default_opacity() -> f32 {
    Element::DEFAULT_OPACITY
}

fn default_font_family() -> String {
    TextFormat::DEFAULT_FONT_FAMILY.to_string()
}

fn default_font_size() -> f32 {
    TextFormat::DEFAULT_FONT_SIZE
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_default_font_family(family: &String) -> bool {
    family == TextFormat::DEFAULT_FONT_FAMILY
}

fn is_default_font_size(size: &f32) -> bool {
    *size == TextFormat::DEFAULT_FONT_SIZE
}

fn is_left(align: &TextAlign) -> bool {
    *align == TextAlign::Left
}

/// Text block of a compact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactText {
    #[serde(rename = "s", default)]
    pub content: String,
    #[serde(rename = "ff", default = "default_font_family", skip_serializing_if = "is_default_font_family")]
    pub font_family: String,
    #[serde(rename = "fs", default = "default_font_size", skip_serializing_if = "is_default_font_size")]
    pub font_size: f32,
    #[serde(rename = "b", default, skip_serializing_if = "is_false")]
    pub bold: bool,
    #[serde(rename = "it", default, skip_serializing_if = "is_false")]
    pub italic: bool,
    #[serde(rename = "u", default, skip_serializing_if = "is_false")]
    pub underline: bool,
    #[serde(rename = "al", default, skip_serializing_if = "is_left")]
    pub align: TextAlign,
}

/// Image block of a compact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactImage {
    #[serde(rename = "s")]
    pub src: String,
    #[serde(rename = "w", default)]
    pub natural_width: u32,
    #[serde(rename = "h", default)]
    pub natural_height: u32,
}

/// Short-keyed, pixel-rounded wire record for one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactElement {
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "c", default = "default_color")]
    pub color: String,
    #[serde(rename = "w", default = "default_stroke_width")]
    pub stroke_width: f32,
    #[serde(rename = "o", default = "default_opacity")]
    pub opacity: f32,
    #[serde(rename = "z", default)]
    pub layer: i32,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<[i32; 2]>>,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[i32; 4]>,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub dash: Option<Vec<f32>>,
    #[serde(rename = "lc", default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<LineCap>,
    #[serde(rename = "lj", default, skip_serializing_if = "Option::is_none")]
    pub join: Option<LineJoin>,
    #[serde(rename = "tx", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<CompactText>,
    #[serde(rename = "im", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<CompactImage>,
}

fn kind_code(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Pencil => "pn",
        ElementKind::Line => "ln",
        ElementKind::Arrow => "ar",
        ElementKind::Rectangle => "rc",
        ElementKind::Circle => "ci",
        ElementKind::Image => "im",
        ElementKind::Text => "tx",
    }
}

fn kind_from_code(code: &str) -> Option<ElementKind> {
    ElementKind::ALL.into_iter().find(|k| kind_code(*k) == code)
}

fn px(value: f32) -> i32 {
    value.round() as i32
}

/// An element batch as it goes over the wire: verbatim or compact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "elements", rename_all = "lowercase")]
pub enum ElementBatch {
    Verbatim(Vec<Element>),
    Compact(Vec<CompactElement>),
}

impl ElementBatch {
    pub fn len(&self) -> usize {
        match self {
            ElementBatch::Verbatim(v) => v.len(),
            ElementBatch::Compact(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_compact(&self) -> bool {
        matches!(self, ElementBatch::Compact(_))
    }

    /// Recover the element list regardless of format.
    pub fn into_elements(self) -> Result<Vec<Element>, CodecError> {
        match self {
            ElementBatch::Verbatim(v) => Ok(v),
            ElementBatch::Compact(v) => PayloadCodec::decode(&v),
        }
    }
}

/// Stateless element batch codec.
pub struct PayloadCodec;

impl PayloadCodec {
    /// Encode elements into compact records.
    pub fn encode(elements: &[Element]) -> Vec<CompactElement> {
        elements.iter().map(Self::encode_one).collect()
    }

    fn encode_one(el: &Element) -> CompactElement {
        let kind = el.kind;
        let points = kind
            .uses_points()
            .then(|| el.points.iter().map(|p| [px(p.x), px(p.y)]).collect());
        // Box kinds always carry a box, text a format and images a source,
        // falling back to model defaults so the record stays decodable.
        let bounds = kind.uses_bounds().then(|| {
            let b = el.bounds.unwrap_or_default();
            [px(b.x), px(b.y), px(b.width), px(b.height)]
        });

        let text = (kind == ElementKind::Text).then(|| {
            let t = el.text.clone().unwrap_or_default();
            CompactText {
                content: t.content,
                font_family: t.font_family,
                font_size: t.font_size,
                bold: t.bold,
                italic: t.italic,
                underline: t.underline,
                align: t.align,
            }
        });
        let image = (kind == ElementKind::Image).then(|| {
            let i = el.image.clone().unwrap_or_default();
            CompactImage {
                src: i.src,
                natural_width: i.natural_width,
                natural_height: i.natural_height,
            }
        });

        let stroke = &el.stroke;
        CompactElement {
            id: el.id.clone(),
            kind: kind_code(kind).to_string(),
            color: el.color.clone(),
            stroke_width: el.stroke_width,
            opacity: el.opacity,
            layer: el.layer,
            points,
            bounds,
            fill: el.fill.clone(),
            dash: (!stroke.dash.is_empty()).then(|| stroke.dash.clone()),
            cap: (stroke.cap != LineCap::Round).then_some(stroke.cap),
            join: (stroke.join != LineJoin::Round).then_some(stroke.join),
            text,
            image,
        }
    }

    /// Decode compact records. Any invalid record rejects the whole batch.
    pub fn decode(records: &[CompactElement]) -> Result<Vec<Element>, CodecError> {
        records.iter().map(Self::decode_one).collect()
    }

    /// Decode a JSON array of compact records.
    pub fn decode_slice(bytes: &[u8]) -> Result<Vec<Element>, CodecError> {
        let records: Vec<CompactElement> =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Self::decode(&records)
    }

    fn decode_one(rec: &CompactElement) -> Result<Element, CodecError> {
        let kind = kind_from_code(&rec.kind).ok_or_else(|| CodecError::UnknownKind {
            id: rec.id.clone(),
            code: rec.kind.clone(),
        })?;
        let missing = |field| CodecError::MissingField {
            id: rec.id.clone(),
            field,
        };

        let mut element = if kind.uses_points() {
            let points = rec
                .points
                .as_ref()
                .ok_or_else(|| missing("p"))?
                .iter()
                .map(|[x, y]| Point::new(*x as f32, *y as f32))
                .collect();
            Element::path(rec.id.clone(), kind, points)
        } else {
            let [x, y, w, h] = rec.bounds.ok_or_else(|| missing("b"))?;
            let bounds = Bounds::new(x as f32, y as f32, w as f32, h as f32);
            match kind {
                ElementKind::Text => {
                    let t = rec.text.as_ref().ok_or_else(|| missing("tx"))?;
                    let format = TextFormat {
                        content: t.content.clone(),
                        font_family: t.font_family.clone(),
                        font_size: t.font_size,
                        bold: t.bold,
                        italic: t.italic,
                        underline: t.underline,
                        align: t.align,
                    };
                    Element::text(rec.id.clone(), bounds, format)
                }
                ElementKind::Image => {
                    let i = rec.image.as_ref().ok_or_else(|| missing("im"))?;
                    let source = ImageSource::new(i.src.clone(), i.natural_width, i.natural_height);
                    Element::image(rec.id.clone(), bounds, source)
                }
                _ => Element::shape(rec.id.clone(), kind, bounds),
            }
        };

        element.color = rec.color.clone();
        element.stroke_width = rec.stroke_width;
        element.opacity = rec.opacity;
        element.layer = rec.layer;
        element.fill = rec.fill.clone();
        element.stroke = StrokeStyle {
            dash: rec.dash.clone().unwrap_or_default(),
            cap: rec.cap.unwrap_or_default(),
            join: rec.join.unwrap_or_default(),
        };
        Ok(element)
    }

    /// Byte size of the JSON serialization of `data`.
    pub fn estimate_size<T: Serialize + ?Sized>(data: &T) -> usize {
        let mut counter = ByteCounter(0);
        if let Err(e) = serde_json::to_writer(&mut counter, data) {
            log::warn!("Size estimate failed: {e}");
        }
        counter.0
    }

    /// Whether the batch's JSON size is strictly above `threshold_bytes`.
    pub fn should_compress(elements: &[Element], threshold_bytes: usize) -> bool {
        Self::estimate_size(elements) > threshold_bytes
    }

    /// Pick the wire format for a batch: compact only when it pays off.
    pub fn prepare(elements: Vec<Element>, config: &CodecConfig) -> ElementBatch {
        if Self::should_compress(&elements, config.compress_threshold_bytes) {
            ElementBatch::Compact(Self::encode(&elements))
        } else {
            ElementBatch::Verbatim(elements)
        }
    }
}

/// `io::Write` sink that only counts bytes.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pencil() -> Element {
        Element::path(
            "stroke-1",
            ElementKind::Pencil,
            vec![Point::new(1.6, 2.4), Point::new(3.1, 3.9), Point::new(5.0, 5.0)],
        )
    }

    fn roundtrip(elements: &[Element]) -> Vec<Element> {
        PayloadCodec::decode(&PayloadCodec::encode(elements)).unwrap()
    }

    #[test]
    fn test_pencil_points_round_to_pixels() {
        let decoded = roundtrip(&[pencil()]);
        assert_eq!(
            decoded[0].points,
            vec![Point::new(2.0, 2.0), Point::new(3.0, 4.0), Point::new(5.0, 5.0)]
        );
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let bounds = Bounds::new(10.4, 20.6, 100.2, 49.5);
        let elements = vec![
            pencil().with_color("#ff00aa").with_opacity(0.5).with_layer(3),
            Element::path("l", ElementKind::Line, vec![Point::new(0.0, 0.0), Point::new(9.7, 9.2)])
                .with_stroke_width(4.5),
            Element::path("a", ElementKind::Arrow, vec![Point::new(-3.5, 8.49)])
                .with_stroke(StrokeStyle {
                    dash: vec![6.0, 3.0],
                    cap: LineCap::Square,
                    join: LineJoin::Bevel,
                }),
            Element::shape("r", ElementKind::Rectangle, bounds).with_fill("#eeeeee"),
            Element::shape("c", ElementKind::Circle, bounds).with_layer(-1),
            Element::text(
                "t",
                bounds,
                TextFormat {
                    content: "hello".into(),
                    font_family: "Courier".into(),
                    font_size: 22.5,
                    bold: true,
                    italic: false,
                    underline: true,
                    align: TextAlign::Center,
                },
            ),
            Element::image("i", bounds, ImageSource::new("https://cdn/x.png", 640, 480)),
        ];

        let decoded = roundtrip(&elements);
        let expected: Vec<Element> = elements.iter().map(Element::quantized).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_default_stroke_is_omitted() {
        let json = serde_json::to_string(&PayloadCodec::encode(&[pencil()])).unwrap();
        assert!(!json.contains("\"d\""));
        assert!(!json.contains("\"lc\""));
        assert!(!json.contains("\"lj\""));
        assert!(!json.contains("\"b\""));
    }

    #[test]
    fn test_non_default_stroke_is_kept() {
        let el = pencil().with_stroke(StrokeStyle {
            cap: LineCap::Butt,
            ..StrokeStyle::default()
        });
        let rec = &PayloadCodec::encode(&[el])[0];
        assert_eq!(rec.cap, Some(LineCap::Butt));
        assert!(rec.dash.is_none());
        assert!(rec.join.is_none());
    }

    #[test]
    fn test_roundtrip_shape_built_elements_of_every_kind() {
        let elements: Vec<Element> = ElementKind::ALL
            .iter()
            .map(|&kind| Element::shape(format!("{kind:?}"), kind, Bounds::new(1.0, 2.0, 3.0, 4.0)))
            .collect();
        assert_eq!(roundtrip(&elements), elements);
    }

    #[test]
    fn test_box_kind_without_blocks_encodes_defaults() {
        let mut text = Element::shape("t", ElementKind::Text, Bounds::default());
        text.bounds = None;
        text.text = None;
        let mut image = Element::shape("i", ElementKind::Image, Bounds::default());
        image.image = None;

        let decoded = roundtrip(&[text, image]);
        assert_eq!(decoded[0].bounds, Some(Bounds::default()));
        assert_eq!(decoded[0].text, Some(TextFormat::default()));
        assert_eq!(decoded[1].image, Some(ImageSource::default()));
    }

    #[test]
    fn test_type_specific_fields_only_when_relevant() {
        let rect = Element::shape("r", ElementKind::Rectangle, Bounds::new(0.0, 0.0, 5.0, 5.0));
        let rec = &PayloadCodec::encode(&[rect])[0];
        assert!(rec.points.is_none());
        assert!(rec.text.is_none());
        assert!(rec.image.is_none());
        assert_eq!(rec.bounds, Some([0, 0, 5, 5]));
    }

    #[test]
    fn test_absent_optional_fields_decode_to_defaults() {
        let decoded = PayloadCodec::decode_slice(br#"[{"i":"x","t":"rc","b":[1,2,3,4]}]"#).unwrap();
        let el = &decoded[0];
        assert_eq!(el.color, Element::DEFAULT_COLOR);
        assert_eq!(el.stroke_width, Element::DEFAULT_STROKE_WIDTH);
        assert_eq!(el.opacity, 1.0);
        assert_eq!(el.layer, 0);
        assert!(el.stroke.is_default());
        assert_eq!(el.bounds, Some(Bounds::new(1.0, 2.0, 3.0, 4.0)));
    }

    #[test]
    fn test_text_defaults_elided_and_restored() {
        let el = Element::text("t", Bounds::default(), TextFormat::new("hi"));
        let json = serde_json::to_string(&PayloadCodec::encode(&[el.clone()])).unwrap();
        assert!(!json.contains("\"ff\""));
        assert!(!json.contains("\"fs\""));
        assert_eq!(roundtrip(&[el.clone()]), vec![el]);
    }

    #[test]
    fn test_missing_geometry_rejects_batch() {
        let result = PayloadCodec::decode_slice(
            br#"[{"i":"ok","t":"rc","b":[0,0,1,1]},{"i":"bad","t":"pn"}]"#,
        );
        assert_eq!(
            result,
            Err(CodecError::MissingField { id: "bad".into(), field: "p" })
        );
    }

    #[test]
    fn test_missing_text_block_rejected() {
        let result = PayloadCodec::decode_slice(br#"[{"i":"t1","t":"tx","b":[0,0,1,1]}]"#);
        assert!(matches!(result, Err(CodecError::MissingField { field: "tx", .. })));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = PayloadCodec::decode_slice(br#"[{"i":"q","t":"zz"}]"#);
        assert!(matches!(result, Err(CodecError::UnknownKind { .. })));
    }

    #[test]
    fn test_unparseable_batch_rejected() {
        assert!(matches!(
            PayloadCodec::decode_slice(b"not json"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_estimate_size_matches_json_length() {
        let elements = vec![pencil(), pencil()];
        let json = serde_json::to_vec(&elements).unwrap();
        assert_eq!(PayloadCodec::estimate_size(&elements), json.len());
    }

    #[test]
    fn test_should_compress_threshold_boundary() {
        let elements = vec![pencil()];
        let size = PayloadCodec::estimate_size(&elements);
        assert!(!PayloadCodec::should_compress(&elements, size));
        assert!(PayloadCodec::should_compress(&elements, size - 1));
        assert!(!PayloadCodec::should_compress(&elements, size + 1));
    }

    #[test]
    fn test_compact_form_is_smaller() {
        let elements: Vec<Element> = (0..50)
            .map(|i| {
                Element::path(
                    format!("stroke-{i}"),
                    ElementKind::Pencil,
                    (0..20).map(|j| Point::new(j as f32 * 1.37, i as f32 * 0.71)).collect(),
                )
            })
            .collect();
        let verbatim = PayloadCodec::estimate_size(&elements);
        let compact = PayloadCodec::estimate_size(&PayloadCodec::encode(&elements));
        assert!(compact < verbatim, "compact {compact} >= verbatim {verbatim}");
    }

    #[test]
    fn test_prepare_is_adaptive() {
        let small = PayloadCodec::prepare(vec![pencil()], &CodecConfig::default());
        assert!(!small.is_compact());

        let config = CodecConfig { compress_threshold_bytes: 10 };
        let big = PayloadCodec::prepare(vec![pencil()], &config);
        assert!(big.is_compact());
        assert_eq!(big.len(), 1);
        assert_eq!(big.into_elements().unwrap(), vec![pencil().quantized()]);
    }
}
