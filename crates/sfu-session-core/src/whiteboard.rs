use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::SessionError;
use crate::transport::SocketTransport;

const DEFAULT_THICKNESS: f32 = 6.0;
const DEFAULT_ERASE_RADIUS: f32 = 10.0;
const DEFAULT_FONT: &str = "Arial";
const DEFAULT_FONT_SIZE: f32 = 20.0;
const DEFAULT_COLOR: &str = "#000000";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShapeKind {
    Freehand,
    #[default]
    Line,
    Rectangle,
    Circle,
    Triangle,
    Pentagon,
    Hexagon,
    Rhombus,
    Parallelogram,
    Octagon,
    Oval,
    Text,
    Image,
}

impl ShapeKind {
    /// Unknown names fall back to a line.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "freehand" => Self::Freehand,
            "rectangle" | "rect" => Self::Rectangle,
            "circle" | "ellipse" => Self::Circle,
            "triangle" => Self::Triangle,
            "pentagon" => Self::Pentagon,
            "hexagon" => Self::Hexagon,
            "rhombus" => Self::Rhombus,
            "parallelogram" => Self::Parallelogram,
            "octagon" => Self::Octagon,
            "oval" => Self::Oval,
            "text" => Self::Text,
            "image" => Self::Image,
            _ => Self::Line,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Freehand => "freehand",
            Self::Line => "line",
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
            Self::Triangle => "triangle",
            Self::Pentagon => "pentagon",
            Self::Hexagon => "hexagon",
            Self::Rhombus => "rhombus",
            Self::Parallelogram => "parallelogram",
            Self::Octagon => "octagon",
            Self::Oval => "oval",
            Self::Text => "text",
            Self::Image => "image",
        }
    }

    /// Wire action used to broadcast a new shape of this kind.
    pub fn action(self) -> &'static str {
        match self {
            Self::Freehand => "draw",
            Self::Text => "text",
            _ => "shape",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineType {
    #[default]
    Solid,
    Dashed,
    Dotted,
    DashDot,
}

impl LineType {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "dashed" => Self::Dashed,
            "dotted" => Self::Dotted,
            "dashdot" | "dash_dot" => Self::DashDot,
            _ => Self::Solid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Solid => "solid",
            Self::Dashed => "dashed",
            Self::Dotted => "dotted",
            Self::DashDot => "dashDot",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn distance(self, other: Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub id: String,
    pub kind: ShapeKind,
    pub start: Option<Point>,
    pub end: Option<Point>,
    pub points: Vec<Point>,
    pub color: String,
    pub thickness: f32,
    pub line_type: LineType,
    pub text: Option<String>,
    pub font_family: String,
    pub font_size: f32,
    pub image_src: Option<String>,
}

impl Default for Shape {
    fn default() -> Self {
        Self {
            id: new_shape_id(),
            kind: ShapeKind::default(),
            start: None,
            end: None,
            points: Vec::new(),
            color: DEFAULT_COLOR.to_string(),
            thickness: DEFAULT_THICKNESS,
            line_type: LineType::default(),
            text: None,
            font_family: DEFAULT_FONT.to_string(),
            font_size: DEFAULT_FONT_SIZE,
            image_src: None,
        }
    }
}

fn new_shape_id() -> String {
    format!("shape_{}", uuid::Uuid::new_v4().simple())
}

fn num(payload: &Value, key: &str) -> Option<f32> {
    payload.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

fn text(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn point_at(payload: &Value, x: &str, y: &str) -> Point {
    Point::new(num(payload, x).unwrap_or(0.0), num(payload, y).unwrap_or(0.0))
}

fn points(payload: &Value) -> Vec<Point> {
    payload
        .get("points")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter(|p| p.is_object())
                .map(|p| point_at(p, "x", "y"))
                .collect()
        })
        .unwrap_or_default()
}

impl Shape {
    /// Build a shape from a loosely typed wire object.
    ///
    /// Missing coordinates read as zero, unknown kinds as lines.
    pub fn from_wire(payload: &Value) -> Self {
        let kind = ShapeKind::parse(payload.get("type").and_then(Value::as_str).unwrap_or(""));
        let mut shape = Shape {
            id: text(payload, "id").unwrap_or_else(new_shape_id),
            kind,
            color: text(payload, "color").unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            thickness: num(payload, "thickness").unwrap_or(DEFAULT_THICKNESS),
            line_type: LineType::parse(payload.get("lineType").and_then(Value::as_str).unwrap_or("")),
            ..Shape::default()
        };
        match kind {
            ShapeKind::Freehand => shape.points = points(payload),
            ShapeKind::Text => {
                let x = num(payload, "x").or_else(|| num(payload, "x1")).unwrap_or(0.0);
                let y = num(payload, "y").or_else(|| num(payload, "y1")).unwrap_or(0.0);
                shape.start = Some(Point::new(x, y));
                shape.text = text(payload, "text");
                shape.thickness = 1.0;
                shape.font_family = text(payload, "font")
                    .or_else(|| text(payload, "fontFamily"))
                    .unwrap_or_else(|| DEFAULT_FONT.to_string());
                shape.font_size = num(payload, "fontSize").unwrap_or(DEFAULT_FONT_SIZE);
            }
            ShapeKind::Image => {
                shape.start = Some(point_at(payload, "x1", "y1"));
                shape.end = Some(point_at(payload, "x2", "y2"));
                shape.image_src = text(payload, "src").or_else(|| text(payload, "imageSrc"));
                shape.thickness = 1.0;
                shape.color = DEFAULT_COLOR.to_string();
            }
            _ => {
                shape.start = Some(point_at(payload, "x1", "y1"));
                shape.end = Some(point_at(payload, "x2", "y2"));
            }
        }
        shape
    }

    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), json!(self.id));
        map.insert("type".into(), json!(self.kind.as_str()));
        map.insert("color".into(), json!(self.color));
        map.insert("thickness".into(), json!(self.thickness));
        map.insert("lineType".into(), json!(self.line_type.as_str()));
        if let Some(start) = self.start {
            map.insert("x1".into(), json!(start.x));
            map.insert("y1".into(), json!(start.y));
        }
        if let Some(end) = self.end {
            map.insert("x2".into(), json!(end.x));
            map.insert("y2".into(), json!(end.y));
        }
        if !self.points.is_empty() {
            map.insert("points".into(), json!(self.points));
        }
        if let Some(text) = &self.text {
            map.insert("text".into(), json!(text));
            map.insert("fontFamily".into(), json!(self.font_family));
            map.insert("fontSize".into(), json!(self.font_size));
        }
        if let Some(src) = &self.image_src {
            map.insert("src".into(), json!(src));
        }
        Value::Object(map)
    }

    /// Equal in everything but the id.
    fn same_drawing(&self, other: &Shape) -> bool {
        Shape { id: String::new(), ..self.clone() } == Shape { id: String::new(), ..other.clone() }
    }

    fn is_near(&self, point: Point, radius: f32) -> bool {
        if self.kind == ShapeKind::Freehand {
            return self.points.iter().any(|p| p.distance(point) < radius);
        }
        let (Some(start), Some(end)) = (self.start, self.end) else {
            return false;
        };
        let center = Point::new((start.x + end.x) / 2.0, (start.y + end.y) / 2.0);
        let half_extent = (end.x - start.x).abs().max((end.y - start.y).abs()) / 2.0;
        center.distance(point) < radius + half_extent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhiteboardUser {
    pub name: String,
    pub use_board: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireUser {
    name: Option<String>,
    use_board: Option<bool>,
}

/// `whiteboardUpdated` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WhiteboardUpdate {
    pub whiteboard_users: Option<Vec<Value>>,
    pub whiteboard_data: Option<Value>,
    pub status: Option<String>,
}

/// `whiteboardAction` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WhiteboardActionEvent {
    pub action: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhiteboardState {
    pub shapes: Vec<Shape>,
    pub undo_stack: Vec<Vec<Shape>>,
    pub redo_stack: Vec<Vec<Shape>>,
    pub users: Vec<WhiteboardUser>,
    pub started: bool,
    pub ended: bool,
    pub use_image_background: bool,
}

impl WhiteboardState {
    /// Merge an action broadcast by another participant.
    ///
    /// Returns false for unknown actions and actions that changed nothing.
    pub fn apply_action(&mut self, action: &str, payload: &Value) -> bool {
        match action {
            "draw" => {
                let shape = if payload.get("type").and_then(Value::as_str) == Some("freehand") {
                    Shape {
                        kind: ShapeKind::Freehand,
                        points: points(payload),
                        ..Shape::from_wire(payload)
                    }
                } else {
                    Shape { kind: ShapeKind::Line, ..Shape::from_wire(&line_payload(payload)) }
                };
                self.shapes.push(shape);
                true
            }
            "shape" | "text" | "uploadImage" => {
                let shape = match action {
                    "text" => Shape::from_wire(&with_type(payload, "text")),
                    "uploadImage" => Shape::from_wire(&with_type(payload, "image")),
                    _ => Shape::from_wire(payload),
                };
                self.shapes.push(shape);
                true
            }
            "erase" => {
                let point = point_at(payload, "x", "y");
                let radius = num(payload, "thickness").map(|t| t / 2.0).unwrap_or(DEFAULT_ERASE_RADIUS);
                let before = self.shapes.len();
                self.shapes.retain(|s| !s.is_near(point, radius));
                before != self.shapes.len()
            }
            "clear" => {
                let had = !self.shapes.is_empty();
                self.shapes.clear();
                had
            }
            "toggleBackground" => {
                self.use_image_background = !self.use_image_background;
                true
            }
            "undo" => {
                if self.shapes.is_empty() {
                    return false;
                }
                self.redo_stack.push(self.shapes.clone());
                self.shapes.pop();
                true
            }
            "redo" => {
                let Some(last) = self.redo_stack.pop() else {
                    return false;
                };
                self.undo_stack.push(std::mem::replace(&mut self.shapes, last));
                true
            }
            "deleteShape" => {
                let before = self.shapes.len();
                match text(payload, "id") {
                    Some(id) => self.shapes.retain(|s| s.id != id),
                    None => {
                        let target = Shape::from_wire(payload);
                        self.shapes.retain(|s| !s.same_drawing(&target));
                    }
                }
                before != self.shapes.len()
            }
            "shapes" => {
                let Some(list) = payload.get("shapes").and_then(Value::as_array) else {
                    return false;
                };
                self.shapes = list.iter().filter(|s| s.is_object()).map(Shape::from_wire).collect();
                true
            }
            other => {
                tracing::debug!("ignoring whiteboard action {other}");
                false
            }
        }
    }

    /// Merge a `whiteboardUpdated` push.
    pub fn apply_update(&mut self, update: WhiteboardUpdate) {
        if let Some(users) = update.whiteboard_users {
            self.users = users
                .into_iter()
                .filter_map(|u| serde_json::from_value::<WireUser>(u).ok())
                .filter_map(|u| {
                    Some(WhiteboardUser { name: u.name?, use_board: u.use_board.unwrap_or(true) })
                })
                .collect();
        }
        if let Some(list) = update
            .whiteboard_data
            .as_ref()
            .and_then(|d| d.get("shapes"))
            .and_then(Value::as_array)
        {
            self.shapes = list.iter().filter(|s| s.is_object()).map(Shape::from_wire).collect();
        }
        match update.status.as_deref() {
            Some("started") => {
                self.started = true;
                self.ended = false;
            }
            Some("ended") | Some("stopped") => {
                self.started = false;
                self.ended = true;
            }
            _ => {}
        }
    }

    /// Hosts always draw; others need a board assignment.
    pub fn can_draw(&self, member: &str, islevel: &str) -> bool {
        islevel == "2" || self.users.iter().any(|u| u.name == member && u.use_board)
    }

    /// Add a locally drawn shape, keeping an undo snapshot.
    ///
    /// Returns the action and payload to broadcast.
    pub fn add_local_shape(&mut self, shape: Shape) -> (&'static str, Value) {
        self.undo_stack.push(self.shapes.clone());
        let payload = shape.to_wire();
        let action = shape.kind.action();
        self.shapes.push(shape);
        (action, payload)
    }

    pub fn undo_local(&mut self) -> bool {
        let Some(previous) = self.undo_stack.pop() else {
            return false;
        };
        self.redo_stack.push(std::mem::replace(&mut self.shapes, previous));
        true
    }

    pub fn redo_local(&mut self) -> bool {
        let Some(next) = self.redo_stack.pop() else {
            return false;
        };
        self.undo_stack.push(std::mem::replace(&mut self.shapes, next));
        true
    }

    pub fn clear_local(&mut self) {
        self.undo_stack.push(std::mem::take(&mut self.shapes));
    }
}

fn with_type(payload: &Value, kind: &str) -> Value {
    let mut payload = payload.clone();
    if let Some(map) = payload.as_object_mut() {
        map.insert("type".into(), json!(kind));
    }
    payload
}

fn line_payload(payload: &Value) -> Value {
    with_type(payload, "line")
}

/// Broadcast a board action to the room.
pub async fn send_board_action(
    socket: &dyn SocketTransport,
    room_name: &str,
    action: &str,
    payload: Value,
) -> Result<(), SessionError> {
    socket
        .emit(
            "updateBoardAction",
            json!({"action": action, "payload": payload, "roomName": room_name}),
        )
        .await
}
