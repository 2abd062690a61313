//! GeoJSON 导入导出。坐标与 ASAP 一样按像素单位存储。

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use slidemark_core::annotation::{Annotation, AnnotationStore, AnnotationType, GroupId};
use slidemark_core::color::Rgb8;
use slidemark_core::geometry::{Point2, Vector2};

use crate::{AnnotationLoader, AnnotationSaver, IoError};

#[derive(Debug, Serialize, Deserialize)]
struct FeatureCollection {
    #[serde(rename = "type")]
    kind: String,
    features: Vec<GeoFeature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeoFeature {
    #[serde(rename = "type")]
    kind: String,
    geometry: Geometry,
    #[serde(default)]
    properties: Properties,
}

type Position = Vec<f64>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
enum Geometry {
    Point(Position),
    LineString(Vec<Position>),
    Polygon(Vec<Vec<Position>>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    annotation_type: Option<String>,
}

/// GeoJSON 读写入口。
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoJson;

impl GeoJson {
    pub fn new() -> Self {
        Self
    }

    /// 根可以是 FeatureCollection、单个 Feature 或 Feature 数组，其余一律视为损坏。
    pub fn parse_str(&self, source: &str, mpp: Vector2) -> Result<AnnotationStore, IoError> {
        let root: Value = serde_json::from_str(source)
            .map_err(|err| IoError::InvalidDocument(format!("GeoJSON 解析失败: {err}")))?;
        let features = match root {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.get("type").and_then(Value::as_str) {
                Some("FeatureCollection") => match object.remove("features") {
                    Some(Value::Array(items)) => items,
                    _ => {
                        return Err(IoError::InvalidDocument(
                            "FeatureCollection 缺少 features 数组".to_string(),
                        ));
                    }
                },
                Some("Feature") => vec![Value::Object(object)],
                other => {
                    return Err(IoError::InvalidDocument(format!(
                        "不支持的 GeoJSON 根类型: {other:?}"
                    )));
                }
            },
            _ => {
                return Err(IoError::InvalidDocument(
                    "GeoJSON 根必须是对象或数组".to_string(),
                ));
            }
        };

        let mut store = AnnotationStore::new(mpp);
        for (index, value) in features.into_iter().enumerate() {
            let geometry_type = value
                .get("geometry")
                .and_then(|geometry| geometry.get("type"))
                .and_then(Value::as_str);
            if let Some(
                kind @ ("MultiPoint" | "MultiLineString" | "MultiPolygon" | "GeometryCollection"),
            ) = geometry_type
            {
                return Err(IoError::UnsupportedFeature(format!(
                    "第 {index} 个 Feature 的几何类型 {kind}"
                )));
            }
            let feature: GeoFeature = serde_json::from_value(value).map_err(|err| {
                IoError::InvalidDocument(format!("第 {index} 个 Feature 无效: {err}"))
            })?;
            let annotation = feature_to_annotation(&mut store, feature, index)?;
            store.push_annotation(annotation);
        }
        Ok(store)
    }

    pub fn to_json_string(&self, store: &AnnotationStore) -> Result<String, IoError> {
        let features = store
            .annotations()
            .filter(|(_, annotation)| annotation.coordinate_count() > 0)
            .map(|(_, annotation)| annotation_to_feature(store, annotation))
            .collect();
        let collection = FeatureCollection {
            kind: "FeatureCollection".to_string(),
            features,
        };
        serde_json::to_string_pretty(&collection)
            .map_err(|err| IoError::InvalidDocument(format!("GeoJSON 序列化失败: {err}")))
    }
}

impl AnnotationLoader for GeoJson {
    fn load(&self, path: &Path, mpp: Vector2) -> Result<AnnotationStore, IoError> {
        let data = fs::read_to_string(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_str(&data, mpp)
    }
}

impl AnnotationSaver for GeoJson {
    fn save(&self, store: &AnnotationStore, path: &Path) -> Result<(), IoError> {
        let text = self.to_json_string(store)?;
        fs::write(path, text).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn position_to_point(position: &[f64], index: usize) -> Result<Point2, IoError> {
    match position {
        [x, y, ..] => Ok(Point2::new(*x, *y)),
        _ => Err(IoError::InvalidDocument(format!(
            "第 {index} 个 Feature 的坐标少于两个分量"
        ))),
    }
}

fn feature_to_annotation(
    store: &mut AnnotationStore,
    feature: GeoFeature,
    index: usize,
) -> Result<Annotation, IoError> {
    let (default_type, positions) = match feature.geometry {
        Geometry::Point(position) => (AnnotationType::Point, vec![position]),
        Geometry::LineString(positions) => (AnnotationType::Line, positions),
        Geometry::Polygon(rings) => {
            let mut ring = rings.into_iter().next().unwrap_or_default();
            if ring.len() > 1 && ring.first() == ring.last() {
                ring.pop();
            }
            (AnnotationType::Polygon, ring)
        }
    };

    let mut pixels = Vec::with_capacity(positions.len());
    for position in &positions {
        pixels.push(position_to_point(position, index)?);
    }
    let coordinates: Vec<Point2> = pixels
        .into_iter()
        .map(|pixel| store.pixel_to_world(pixel))
        .collect();

    let properties = feature.properties;
    let annotation_type = match properties.annotation_type.as_deref() {
        Some(name) => parse_type_name(name).unwrap_or_else(|| {
            warn!(feature = index, type_name = name, "未知的标注类型，按几何类型处理");
            default_type
        }),
        None => default_type.inferred_for(coordinates.len()),
    };
    let color = properties.color.as_deref().and_then(Rgb8::parse_hex);
    let group_id = match properties.group.as_deref() {
        None | Some("") => GroupId::NONE,
        Some(name) => match store.find_group_by_name(name) {
            Some(id) => id,
            None => {
                let active = match color {
                    Some(color) => store.add_group_with_color(name, color),
                    None => store.add_group(name),
                };
                store.group_id(active).unwrap_or(GroupId::NONE)
            }
        },
    };

    let mut annotation = Annotation::new(annotation_type, coordinates, group_id);
    if let Some(name) = properties.name {
        annotation.name = name;
    }
    Ok(annotation)
}

fn annotation_to_feature(store: &AnnotationStore, annotation: &Annotation) -> GeoFeature {
    let position = |world: &Point2| {
        let pixel = store.world_to_pixel(*world);
        vec![pixel.x(), pixel.y()]
    };
    let positions: Vec<Position> = annotation.coordinates().iter().map(position).collect();
    let geometry = match annotation.annotation_type {
        AnnotationType::Point | AnnotationType::Text if positions.len() == 1 => {
            Geometry::Point(positions.into_iter().next().unwrap_or_default())
        }
        kind if kind.is_area() && positions.len() >= 3 => {
            let mut ring = positions;
            if let Some(first) = ring.first().cloned() {
                ring.push(first);
            }
            Geometry::Polygon(vec![ring])
        }
        _ => Geometry::LineString(positions),
    };

    let group = store.group_by_id(annotation.group_id);
    GeoFeature {
        kind: "Feature".to_string(),
        geometry,
        properties: Properties {
            name: (!annotation.name.is_empty()).then(|| annotation.name.clone()),
            group: group
                .filter(|_| annotation.group_id != GroupId::NONE)
                .map(|g| g.name.clone()),
            color: group.map(|g| g.color.to_string()),
            annotation_type: Some(type_name(annotation.annotation_type).to_string()),
        },
    }
}

fn parse_type_name(name: &str) -> Option<AnnotationType> {
    let annotation_type = match name {
        "Point" => AnnotationType::Point,
        "Line" => AnnotationType::Line,
        "Rectangle" => AnnotationType::Rectangle,
        "Polygon" => AnnotationType::Polygon,
        "Spline" => AnnotationType::Spline,
        "Ellipse" => AnnotationType::Ellipse,
        "Text" => AnnotationType::Text,
        _ => return None,
    };
    Some(annotation_type)
}

fn type_name(annotation_type: AnnotationType) -> &'static str {
    match annotation_type {
        AnnotationType::Point => "Point",
        AnnotationType::Line => "Line",
        AnnotationType::Rectangle => "Rectangle",
        AnnotationType::Polygon => "Polygon",
        AnnotationType::Spline => "Spline",
        AnnotationType::Ellipse => "Ellipse",
        AnnotationType::Text => "Text",
    }
}
