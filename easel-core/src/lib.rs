//! # easel-core: canvas element model
//!
//! The drawable elements that participants create and mutate on a shared
//! board. Freehand-style tools (pencil, line, arrow) carry a point list;
//! box-style tools (rectangle, circle, image, text) carry a bounding box.
//! Text and image elements additionally carry a formatting or source block.
//!
//! The model is plain data. Synchronization, locking and the wire encoding
//! live in `easel-collab`.

pub mod style;

pub use style::{ImageSource, LineCap, LineJoin, StrokeStyle, TextAlign, TextFormat};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Snap to whole pixels.
    pub fn rounded(&self) -> Self {
        Self {
            x: self.x.round(),
            y: self.y.round(),
        }
    }
}

/// Axis-aligned bounding box in canvas coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Snap every edge value to whole pixels.
    pub fn rounded(&self) -> Self {
        Self {
            x: self.x.round(),
            y: self.y.round(),
            width: self.width.round(),
            height: self.height.round(),
        }
    }
}

/// The drawing tool an element was created with.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Pencil,
    Line,
    Arrow,
    Rectangle,
    Circle,
    Image,
    Text,
}

impl ElementKind {
    pub const ALL: [ElementKind; 7] = [
        ElementKind::Pencil,
        ElementKind::Line,
        ElementKind::Arrow,
        ElementKind::Rectangle,
        ElementKind::Circle,
        ElementKind::Image,
        ElementKind::Text,
    ];

    /// Kinds whose geometry is a free-form point list.
    pub fn uses_points(&self) -> bool {
        matches!(self, ElementKind::Pencil | ElementKind::Line | ElementKind::Arrow)
    }

    /// Kinds whose geometry is a bounding box.
    pub fn uses_bounds(&self) -> bool {
        !self.uses_points()
    }
}

/// One drawable element on the shared canvas.
///
/// `points` is only meaningful for point-list kinds and `bounds` only for
/// box kinds; `text` and `image` only for their respective kinds. Use the
/// constructors to get a consistent combination.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    /// Stroke color as a CSS color string
    pub color: String,
    pub stroke_width: f32,
    /// 0.0 (transparent) ..= 1.0 (opaque)
    pub opacity: f32,
    /// Z-order; higher layers draw on top
    pub layer: i32,
    pub points: Vec<Point>,
    pub bounds: Option<Bounds>,
    /// Fill color for box kinds (None = no fill)
    pub fill: Option<String>,
    pub stroke: StrokeStyle,
    pub text: Option<TextFormat>,
    pub image: Option<ImageSource>,
}

impl Element {
    pub const DEFAULT_COLOR: &'static str = "#000000";
    pub const DEFAULT_STROKE_WIDTH: f32 = 2.0;
    pub const DEFAULT_OPACITY: f32 = 1.0;

    fn base(id: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            kind,
            color: Self::DEFAULT_COLOR.to_string(),
            stroke_width: Self::DEFAULT_STROKE_WIDTH,
            opacity: Self::DEFAULT_OPACITY,
            layer: 0,
            points: Vec::new(),
            bounds: None,
            fill: None,
            stroke: StrokeStyle::default(),
            text: None,
            image: None,
        }
    }

    /// A pencil, line or arrow element.
    ///
    /// Box kinds passed here fall back to a zero-size box at the first point.
    pub fn path(id: impl Into<String>, kind: ElementKind, points: Vec<Point>) -> Self {
        let mut element = Self::base(id, kind);
        if kind.uses_points() {
            element.points = points;
        } else {
            let origin = points.first().copied().unwrap_or_default();
            element.bounds = Some(Bounds::new(origin.x, origin.y, 0.0, 0.0));
        }
        element
    }

    /// A box element, usually a rectangle or circle.
    ///
    /// Text and image kinds get an empty format or source. Point-list kinds
    /// ignore the box.
    pub fn shape(id: impl Into<String>, kind: ElementKind, bounds: Bounds) -> Self {
        let mut element = Self::base(id, kind);
        if kind.uses_bounds() {
            element.bounds = Some(bounds);
        }
        match kind {
            ElementKind::Text => element.text = Some(TextFormat::default()),
            ElementKind::Image => element.image = Some(ImageSource::default()),
            _ => {}
        }
        element
    }

    pub fn text(id: impl Into<String>, bounds: Bounds, format: TextFormat) -> Self {
        let mut element = Self::base(id, ElementKind::Text);
        element.bounds = Some(bounds);
        element.text = Some(format);
        element
    }

    pub fn image(id: impl Into<String>, bounds: Bounds, source: ImageSource) -> Self {
        let mut element = Self::base(id, ElementKind::Image);
        element.bounds = Some(bounds);
        element.image = Some(source);
        element
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_stroke_width(mut self, width: f32) -> Self {
        self.stroke_width = width;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn with_layer(mut self, layer: i32) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn with_stroke(mut self, stroke: StrokeStyle) -> Self {
        self.stroke = stroke;
        self
    }

    /// Copy with all geometry snapped to whole pixels, the precision the
    /// wire encoding keeps.
    pub fn quantized(&self) -> Self {
        let mut element = self.clone();
        element.points = self.points.iter().map(Point::rounded).collect();
        element.bounds = self.bounds.map(|b| b.rounded());
        element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_element_defaults() {
        let el = Element::path("p1", ElementKind::Pencil, vec![Point::new(1.0, 2.0)]);
        assert_eq!(el.color, "#000000");
        assert_eq!(el.stroke_width, 2.0);
        assert_eq!(el.opacity, 1.0);
        assert_eq!(el.layer, 0);
        assert!(el.stroke.is_default());
        assert!(el.bounds.is_none());
        assert_eq!(el.points.len(), 1);
    }

    #[test]
    fn test_shape_fills_text_and_image_blocks() {
        let b = Bounds::new(0.0, 0.0, 10.0, 20.0);
        let text = Element::shape("t1", ElementKind::Text, b);
        assert_eq!(text.text, Some(TextFormat::default()));
        assert!(text.image.is_none());

        let image = Element::shape("i1", ElementKind::Image, b);
        assert_eq!(image.image, Some(ImageSource::default()));
        assert!(Element::shape("r1", ElementKind::Rectangle, b).text.is_none());
    }

    #[test]
    fn test_shape_element_has_bounds_only() {
        let el = Element::shape("r1", ElementKind::Rectangle, Bounds::new(0.0, 0.0, 10.0, 20.0));
        assert!(el.points.is_empty());
        assert_eq!(el.bounds.unwrap().height, 20.0);
    }

    #[test]
    fn test_path_constructor_with_box_kind() {
        let el = Element::path("c1", ElementKind::Circle, vec![Point::new(4.0, 5.0)]);
        assert!(el.points.is_empty());
        assert_eq!(el.bounds, Some(Bounds::new(4.0, 5.0, 0.0, 0.0)));
    }

    #[test]
    fn test_kind_geometry_classes() {
        let pointy: Vec<_> = ElementKind::ALL.iter().filter(|k| k.uses_points()).collect();
        assert_eq!(pointy.len(), 3);
        assert!(ElementKind::Image.uses_bounds());
        assert!(ElementKind::Text.uses_bounds());
    }

    #[test]
    fn test_quantized_rounds_geometry_only() {
        let el = Element::path(
            "p1",
            ElementKind::Pencil,
            vec![Point::new(1.6, 2.4), Point::new(3.1, 3.9)],
        )
        .with_stroke_width(2.5);

        let q = el.quantized();
        assert_eq!(q.points, vec![Point::new(2.0, 2.0), Point::new(3.0, 4.0)]);
        assert_eq!(q.stroke_width, 2.5);
    }

    #[test]
    fn test_opacity_is_clamped() {
        let el = Element::shape("r", ElementKind::Rectangle, Bounds::default()).with_opacity(1.7);
        assert_eq!(el.opacity, 1.0);
    }

    #[test]
    fn test_stroke_style_default_detection() {
        assert!(StrokeStyle::default().is_default());
        assert!(!StrokeStyle::dashed(vec![4.0, 2.0]).is_default());
        let butt = StrokeStyle {
            cap: LineCap::Butt,
            ..StrokeStyle::default()
        };
        assert!(butt.is_solid());
        assert!(!butt.is_default());
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ElementKind::Rectangle).unwrap();
        assert_eq!(json, "\"rectangle\"");
    }
}
