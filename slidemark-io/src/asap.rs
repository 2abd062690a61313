//! ASAP 标注格式。文件中的坐标为像素单位，读入时乘以 mpp 换算到世界坐标。

use tracing::{debug, warn};

use slidemark_core::annotation::{Annotation, AnnotationStore, AnnotationType, GroupId};
use slidemark_core::color::Rgb8;
use slidemark_core::geometry::{Point2, Vector2};

use crate::xml::{XmlElement, XmlError, XmlEvent, XmlReader, XmlWriter};

const ROOT: &str = "ASAP_Annotations";

/// 两趟解析：第一趟只收集 `<Group>`（它们在文件中可能位于标注之后）以保留声明顺序，
/// 第二趟构建标注，遇到未声明的分组按名称即时创建。
pub(crate) fn parse(source: &str, mpp: Vector2) -> Result<AnnotationStore, XmlError> {
    let mut store = AnnotationStore::new(mpp);
    for declared in collect_groups(source)? {
        if declared.name == AnnotationStore::NONE_GROUP_NAME
            || store.find_group_by_name(&declared.name).is_some()
        {
            continue;
        }
        let index = match declared.color {
            Some(color) => store.add_group_with_color(declared.name, color),
            None => store.add_group(declared.name),
        };
        if let Some(group) = store.group_mut(index) {
            group.is_explicitly_defined = true;
        }
    }

    let mut reader = XmlReader::new(source);
    let mut current: Option<AnnotationRecord> = None;
    while let Some(event) = reader.next_event()? {
        match event {
            XmlEvent::Start(element) if element.name == "Annotation" => {
                current = Some(AnnotationRecord::from_element(&element));
            }
            XmlEvent::Empty(element) if element.name == "Annotation" => {
                AnnotationRecord::from_element(&element).finish(&mut store);
            }
            XmlEvent::Start(element) | XmlEvent::Empty(element) if element.name == "Coordinate" => {
                if let Some(record) = current.as_mut() {
                    record.push_coordinate(&element, reader.line())?;
                }
            }
            XmlEvent::End(name) if name == "Annotation" => {
                if let Some(record) = current.take() {
                    record.finish(&mut store);
                }
            }
            _ => {}
        }
    }
    Ok(store)
}

struct DeclaredGroup {
    name: String,
    color: Option<Rgb8>,
}

fn collect_groups(source: &str) -> Result<Vec<DeclaredGroup>, XmlError> {
    let mut reader = XmlReader::new(source);
    let mut groups = Vec::new();
    let mut root_checked = false;
    while let Some(event) = reader.next_event()? {
        let element = match event {
            XmlEvent::Start(element) | XmlEvent::Empty(element) => element,
            _ => continue,
        };
        if !root_checked {
            if element.name != ROOT {
                return Err(XmlError {
                    line: 1,
                    message: format!("根元素应为 <{ROOT}>，实际为 <{}>", element.name),
                });
            }
            root_checked = true;
        }
        if element.name == "Group" {
            let Some(name) = element.attribute("Name") else {
                debug!("忽略缺少 Name 的分组");
                continue;
            };
            groups.push(DeclaredGroup {
                name: name.to_string(),
                color: element.attribute("Color").and_then(Rgb8::parse_hex),
            });
        }
    }
    if !root_checked {
        return Err(XmlError {
            line: 1,
            message: format!("文件中没有 <{ROOT}> 根元素"),
        });
    }
    Ok(groups)
}

struct AnnotationRecord {
    name: String,
    group: Option<String>,
    type_name: Option<String>,
    color: Option<Rgb8>,
    coordinates: Vec<(i64, Point2)>,
}

impl AnnotationRecord {
    fn from_element(element: &XmlElement) -> Self {
        Self {
            name: element.attribute("Name").unwrap_or_default().to_string(),
            group: element.attribute("PartOfGroup").map(str::to_string),
            type_name: element.attribute("Type").map(str::to_string),
            color: element.attribute("Color").and_then(Rgb8::parse_hex),
            coordinates: Vec::new(),
        }
    }

    /// 缺少 X 或 Y 的坐标被忽略；缺少 Order 时按文档顺序排列。
    fn push_coordinate(&mut self, element: &XmlElement, line: usize) -> Result<(), XmlError> {
        let (Some(x), Some(y)) = (element.attribute("X"), element.attribute("Y")) else {
            debug!(annotation = %self.name, "忽略缺少 X/Y 的坐标");
            return Ok(());
        };
        let order = match element.attribute("Order") {
            Some(raw) => parse_number::<i64>(raw, "Coordinate Order", line)?,
            None => self.coordinates.len() as i64,
        };
        let point = Point2::new(
            parse_number::<f64>(x, "Coordinate X", line)?,
            parse_number::<f64>(y, "Coordinate Y", line)?,
        );
        self.coordinates.push((order, point));
        Ok(())
    }

    fn finish(mut self, store: &mut AnnotationStore) {
        let annotation_type = match self.type_name.as_deref() {
            Some(name) => annotation_type_from_asap(name).unwrap_or_else(|| {
                warn!(annotation = %self.name, type_name = name, "未知的标注类型，按 Polygon 处理");
                AnnotationType::Polygon
            }),
            None => AnnotationType::Polygon,
        };
        let group_id = resolve_group(store, self.group.as_deref(), self.color);

        self.coordinates.sort_by_key(|(order, _)| *order);
        let coordinates = self
            .coordinates
            .iter()
            .map(|(_, pixel)| store.pixel_to_world(*pixel))
            .collect();
        store.push_annotation(Annotation::new(annotation_type, coordinates, group_id).with_name(self.name));
    }
}

fn resolve_group(store: &mut AnnotationStore, name: Option<&str>, color: Option<Rgb8>) -> GroupId {
    let name = match name.map(str::trim) {
        None | Some("") => return GroupId::NONE,
        Some(name) if name == AnnotationStore::NONE_GROUP_NAME => return GroupId::NONE,
        Some(name) => name,
    };
    if let Some(id) = store.find_group_by_name(name) {
        return id;
    }
    let index = match color {
        Some(color) => store.add_group_with_color(name, color),
        None => store.add_group(name),
    };
    store.group_id(index).unwrap_or(GroupId::NONE)
}

fn parse_number<T: std::str::FromStr>(raw: &str, context: &str, line: usize) -> Result<T, XmlError> {
    raw.trim().parse::<T>().map_err(|_| XmlError {
        line,
        message: format!("{context} 解析失败（值：\"{raw}\"）"),
    })
}

fn annotation_type_from_asap(name: &str) -> Option<AnnotationType> {
    let annotation_type = match name {
        "Dot" => AnnotationType::Point,
        "Measurement" | "Line" => AnnotationType::Line,
        "Rectangle" => AnnotationType::Rectangle,
        "Polygon" => AnnotationType::Polygon,
        "Spline" => AnnotationType::Spline,
        "Ellipse" => AnnotationType::Ellipse,
        "Text" => AnnotationType::Text,
        _ => return None,
    };
    Some(annotation_type)
}

fn annotation_type_to_asap(annotation_type: AnnotationType) -> &'static str {
    match annotation_type {
        AnnotationType::Point => "Dot",
        AnnotationType::Line => "Measurement",
        AnnotationType::Rectangle => "Rectangle",
        AnnotationType::Polygon => "Polygon",
        AnnotationType::Spline => "Spline",
        AnnotationType::Ellipse => "Ellipse",
        AnnotationType::Text => "Text",
    }
}

/// 先写分组（跳过 0 号 "None"），再按活动顺序写标注。
pub(crate) fn write(store: &AnnotationStore) -> String {
    let mut writer = XmlWriter::new();
    writer.start(ROOT, &[]);

    writer.start("AnnotationGroups", &[]);
    for (id, group) in store.groups() {
        if id == GroupId::NONE {
            continue;
        }
        let color = group.color.to_string();
        writer.start(
            "Group",
            &[
                ("Name", group.name.as_str()),
                ("PartOfGroup", AnnotationStore::NONE_GROUP_NAME),
                ("Color", color.as_str()),
            ],
        );
        writer.empty("Attributes", &[]);
        writer.end();
    }
    writer.end();

    writer.start("Annotations", &[]);
    for (_, annotation) in store.annotations() {
        let group = store.group_by_id(annotation.group_id);
        let group_name = group.map_or(AnnotationStore::NONE_GROUP_NAME, |g| g.name.as_str());
        let color = group.map(|g| g.color.to_string()).unwrap_or_default();
        writer.start(
            "Annotation",
            &[
                ("Name", annotation.name.as_str()),
                ("Type", annotation_type_to_asap(annotation.annotation_type)),
                ("PartOfGroup", group_name),
                ("Color", color.as_str()),
            ],
        );
        writer.start("Coordinates", &[]);
        for (order, world) in annotation.coordinates().iter().enumerate() {
            let pixel = store.world_to_pixel(*world);
            let order = order.to_string();
            let x = pixel.x().to_string();
            let y = pixel.y().to_string();
            writer.empty(
                "Coordinate",
                &[("Order", order.as_str()), ("X", x.as_str()), ("Y", y.as_str())],
            );
        }
        writer.end();
        writer.end();
    }
    writer.end();

    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Vector2 {
        Vector2::new(1.0, 1.0)
    }

    #[test]
    fn groups_after_annotations_keep_declared_order() {
        let source = r##"<ASAP_Annotations>
  <Annotations>
    <Annotation Name="a" PartOfGroup="Stroma" Type="Polygon" Color="#00ff00">
      <Coordinates>
        <Coordinate Order="2" X="0" Y="10"/>
        <Coordinate Order="0" X="0" Y="0"/>
        <Coordinate Order="1" X="10" Y="0"/>
      </Coordinates>
    </Annotation>
    <Annotation Name="b" PartOfGroup="Unlisted" Type="Spline" Color="#123456">
      <Coordinates/>
    </Annotation>
  </Annotations>
  <AnnotationGroups>
    <Group Name="Tumor" PartOfGroup="None" Color="#ff0000"><Attributes/></Group>
    <Group Name="Stroma" PartOfGroup="None" Color="#0000ff"><Attributes/></Group>
  </AnnotationGroups>
</ASAP_Annotations>"##;
        let store = parse(source, unit()).unwrap();
        let names: Vec<&str> = store.groups().map(|(_, g)| g.name.as_str()).collect();
        assert_eq!(names, vec!["None", "Tumor", "Stroma", "Unlisted"]);
        let stroma = store.group(2).unwrap();
        assert_eq!(stroma.color, Rgb8::new(0, 0, 255));
        assert!(stroma.is_explicitly_defined);
        let unlisted = store.group(3).unwrap();
        assert_eq!(unlisted.color, Rgb8::new(0x12, 0x34, 0x56));
        assert!(!unlisted.is_explicitly_defined);

        let a = store.annotation(0).unwrap();
        assert_eq!(a.group_id, store.group_id(2).unwrap());
        assert_eq!(
            a.coordinates(),
            &[Point2::new(0.0, 0.0), Point2::new(10.0, 0.0), Point2::new(0.0, 10.0)]
        );
        assert_eq!(store.annotation(1).unwrap().annotation_type, AnnotationType::Spline);
    }

    #[test]
    fn unknown_type_and_missing_attributes_are_defaulted() {
        let source = r#"<ASAP_Annotations><Annotations>
            <Annotation Type="PointSet"><Coordinates><Coordinate X="1" Y="2"/><Coordinate X="3"/></Coordinates></Annotation>
        </Annotations></ASAP_Annotations>"#;
        let store = parse(source, unit()).unwrap();
        let annotation = store.annotation(0).unwrap();
        assert_eq!(annotation.annotation_type, AnnotationType::Polygon);
        assert_eq!(annotation.display_name(), "(unnamed)");
        assert_eq!(annotation.group_id, GroupId::NONE);
        assert_eq!(annotation.coordinate_count(), 1);
    }

    #[test]
    fn wrong_root_and_bad_numbers_fail() {
        assert!(parse("<Annotations/>", unit()).is_err());
        assert!(parse("", unit()).is_err());
        let bad = r#"<ASAP_Annotations><Annotations><Annotation Name="x" Type="Dot">
            <Coordinates><Coordinate Order="0" X="ten" Y="2"/></Coordinates>
        </Annotation></Annotations></ASAP_Annotations>"#;
        let err = parse(bad, unit()).err().unwrap();
        assert!(err.message.contains("Coordinate X"));
    }

    #[test]
    fn writer_skips_none_group_and_scales_by_mpp() {
        let mut store = AnnotationStore::new(Vector2::new(0.5, 0.25));
        let tumor = store.add_group_with_color("Tumor", Rgb8::new(255, 0, 0));
        let tumor = store.group_id(tumor).unwrap();
        store.push_annotation(
            Annotation::new(AnnotationType::Point, vec![Point2::new(5.0, 5.0)], tumor)
                .with_name("P & Q"),
        );
        let text = write(&store);
        assert!(!text.contains("Name=\"None\" PartOfGroup"));
        assert!(text.contains("<Group Name=\"Tumor\" PartOfGroup=\"None\" Color=\"#ff0000\">"));
        assert!(text.contains("Name=\"P &amp; Q\" Type=\"Dot\" PartOfGroup=\"Tumor\""));
        assert!(text.contains("<Coordinate Order=\"0\" X=\"10\" Y=\"20\" />"));

        let reloaded = parse(&text, Vector2::new(0.5, 0.25)).unwrap();
        let annotation = reloaded.annotation(0).unwrap();
        assert_eq!(annotation.name, "P & Q");
        assert_eq!(annotation.coordinates(), &[Point2::new(5.0, 5.0)]);
    }
}
