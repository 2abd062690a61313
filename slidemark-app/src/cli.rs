use tracing::info;

use slidemark_core::annotation::{AnnotationType, GroupId};
use slidemark_core::geometry::{Bounds2D, Point2};
use slidemark_engine::command::{CommandBus, CommandContext, CommandRequest};
use slidemark_engine::session::EditSession;

/// 打印当前标注集合的概览：分组、标注、面积与包围盒。
pub fn print_summary(session: &mut EditSession) {
    let set = session.annotations_mut();
    let source = set.source_path().map(|path| path.display().to_string());
    let modified = set.is_modified();
    let store = set.store_mut();
    let mpp = store.mpp();

    info!(
        annotations = store.annotation_count(),
        groups = store.group_count(),
        features = store.feature_count(),
        "标注集合统计"
    );

    match source {
        Some(path) => println!("标注文件：{path}"),
        None => println!("当前为新建的空白标注集合"),
    }
    println!(
        "mpp=({:.4}, {:.4}), 未保存修改={}",
        mpp.x(),
        mpp.y(),
        if modified { "是" } else { "否" }
    );

    println!("分组 ({}):", store.group_count());
    let groups: Vec<(GroupId, String, String, bool)> = store
        .groups()
        .map(|(id, group)| (id, group.name.clone(), group.color.to_string(), group.is_hidden))
        .collect();
    for (id, name, color, hidden) in groups {
        let members = store
            .annotations()
            .filter(|(_, annotation)| annotation.group_id == id)
            .count();
        println!(
            "  - {name} 颜色={color}, 可见={}, 标注数={members}",
            if hidden { "否" } else { "是" }
        );
    }

    println!("标注 ({}):", store.annotation_count());
    let mut total_area = 0.0;
    let mut extent = Bounds2D::empty();
    for index in 0..store.annotation_count() {
        let group_name = store
            .annotation(index)
            .and_then(|annotation| store.group_by_id(annotation.group_id))
            .map(|group| group.name.clone())
            .unwrap_or_default();
        let Some(annotation) = store.annotation_mut(index) else {
            continue;
        };
        let bounds = annotation.bounds();
        let area = annotation.area();
        total_area += area;
        extent.include_bounds(&bounds);
        println!(
            "  - #{index} {} [{}], 分组={group_name}, 坐标数={}, 闭合={}, 面积={area:.2}, 包围盒={} -> {}",
            annotation.display_name(),
            describe_type(annotation.annotation_type),
            annotation.coordinate_count(),
            if annotation.is_closed() { "是" } else { "否" },
            format_point(bounds.min()),
            format_point(bounds.max()),
        );
    }
    println!("总面积={total_area:.2} μm²");
    if !extent.is_empty() {
        println!(
            "整体范围={} -> {}",
            format_point(extent.min()),
            format_point(extent.max())
        );
    }
}

pub fn dispatch_cli_command(
    bus: &CommandBus,
    text: &str,
    session: &mut EditSession,
) -> Result<(), String> {
    let request = CommandRequest::parse(text);
    let mut context = CommandContext { session };
    let response = bus.dispatch(&request, &mut context);
    if response.success {
        if let Some(message) = response.message {
            println!("[命令] {message}");
        }
        Ok(())
    } else {
        let commands: Vec<&str> = bus.available_commands().copied().collect();
        println!("支持的命令: {}", commands.join(", "));
        Err(response.message.unwrap_or_else(|| "未知错误".to_string()))
    }
}

fn describe_type(annotation_type: AnnotationType) -> &'static str {
    match annotation_type {
        AnnotationType::Point => "点",
        AnnotationType::Line => "测量线",
        AnnotationType::Rectangle => "矩形",
        AnnotationType::Polygon => "多边形",
        AnnotationType::Spline => "样条",
        AnnotationType::Ellipse => "椭圆",
        AnnotationType::Text => "文字",
    }
}

fn format_point(point: Point2) -> String {
    format!("({:.2}, {:.2})", point.x(), point.y())
}
