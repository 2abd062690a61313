use tracing::{debug, info};

use slidemark_core::annotation::{
    Annotation, AnnotationSet, AnnotationType, CoordinateRef, GroupId,
};
use slidemark_core::geometry::{Bounds2D, Point2};

use crate::errors::EngineError;
use crate::hit_test::{HitQuery, HitResult, hit_test};

/// 编辑交互参数（世界坐标单位）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EditConfig {
    /// 手绘拖拽时两次采样之间的最小累计距离。
    pub freeform_spacing: f64,
    /// 光标距离起点小于该值时手绘自动闭合；同时作为拾取坐标/边的容差。
    pub hover_tolerance: f64,
    pub selection_bias: f64,
    pub bounds_tolerance: f64,
    pub split_enabled: bool,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            freeform_spacing: 5.0,
            hover_tolerance: 8.0,
            selection_bias: 4.0,
            bounds_tolerance: 10.0,
            split_enabled: true,
        }
    }
}

/// 正在创建中的形状，以及它需要的临时状态。
#[derive(Debug, Clone, Copy, PartialEq)]
enum Creation {
    Line,
    Rectangle { anchor: Point2 },
    Ellipse,
    Freeform { last_position: Point2, travelled: f64 },
}

/// 删除坐标的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateDeletion {
    CoordinateRemoved,
    /// 只剩一个坐标时删除整个标注。
    AnnotationRemoved,
}

/// 编辑会话：持有标注集合，负责把输入事件翻译成对集合的修改。
#[derive(Debug)]
pub struct EditSession {
    annotations: AnnotationSet,
    config: EditConfig,
    creation: Option<Creation>,
    active_group: GroupId,
}

impl EditSession {
    pub fn new(annotations: AnnotationSet, config: EditConfig) -> Self {
        Self {
            annotations,
            config,
            creation: None,
            active_group: GroupId::NONE,
        }
    }

    #[inline]
    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    #[inline]
    pub fn annotations_mut(&mut self) -> &mut AnnotationSet {
        &mut self.annotations
    }

    pub fn into_annotations(self) -> AnnotationSet {
        self.annotations
    }

    /// 替换整个集合（例如重新加载文件后），放弃进行中的创建。
    pub fn replace_annotations(&mut self, annotations: AnnotationSet) {
        self.annotations = annotations;
        self.creation = None;
        self.active_group = GroupId::NONE;
    }

    #[inline]
    pub fn config(&self) -> EditConfig {
        self.config
    }

    pub fn set_config(&mut self, config: EditConfig) {
        self.config = config;
    }

    #[inline]
    pub fn is_creating(&self) -> bool {
        self.creation.is_some()
    }

    #[inline]
    pub fn active_group(&self) -> GroupId {
        self.active_group
    }

    /// 之后新建的标注归入该分组。
    pub fn set_active_group(&mut self, group: GroupId) -> Result<(), EngineError> {
        self.ensure_group(group)?;
        self.active_group = group;
        Ok(())
    }

    pub fn begin_frame(&mut self) -> u64 {
        self.annotations.begin_frame()
    }

    // ---- 模式 ----

    pub fn is_edit_mode(&self) -> bool {
        self.annotations.edit.is_edit_mode
    }

    pub fn set_edit_mode(&mut self, enabled: bool) {
        let edit = &mut self.annotations.edit;
        edit.is_edit_mode = enabled;
        if !enabled {
            edit.is_insert_coordinate_mode = false;
            edit.is_split_mode = false;
            edit.selected_coordinate = None;
        }
    }

    pub fn toggle_edit_mode(&mut self) -> bool {
        let enabled = !self.is_edit_mode();
        self.set_edit_mode(enabled);
        enabled
    }

    pub fn set_insert_coordinate_mode(&mut self, enabled: bool) {
        self.annotations.edit.is_insert_coordinate_mode = enabled;
    }

    // ---- 命中测试与选择 ----

    /// 编辑模式下偏向已选中标注，否则偏向未选中标注（便于点选切换）。
    fn effective_bias(&self) -> f64 {
        if self.is_edit_mode() {
            self.config.selection_bias
        } else {
            -self.config.selection_bias
        }
    }

    pub fn hit_test(&mut self, point: Point2) -> Option<HitResult> {
        let query = HitQuery {
            point,
            bounds_tolerance: self.config.bounds_tolerance,
            selection_bias: self.effective_bias(),
        };
        let frame = self.annotations.edit.frame;
        hit_test(self.annotations.store_mut(), query, frame)
    }

    /// 点选。`additive` 为假时先清空其他选择；未命中时返回 `None`。
    pub fn select_at(&mut self, point: Point2, additive: bool) -> Option<usize> {
        let hit = self
            .hit_test(point)
            .filter(|hit| hit.edge_distance <= self.config.hover_tolerance);
        if !additive {
            self.deselect_all();
        }
        let hit = hit?;
        if let Some(annotation) = self.annotations.store_mut().annotation_mut(hit.annotation_index) {
            annotation.is_selected = true;
        }
        Some(hit.annotation_index)
    }

    pub fn toggle_selection(&mut self, index: usize) -> Result<bool, EngineError> {
        let annotation = self.annotation_mut(index)?;
        annotation.is_selected = !annotation.is_selected;
        Ok(annotation.is_selected)
    }

    pub fn select_all(&mut self) {
        let store = self.annotations.store_mut();
        for index in 0..store.annotation_count() {
            if store.is_annotation_hidden(index) {
                continue;
            }
            if let Some(annotation) = store.annotation_mut(index) {
                annotation.is_selected = true;
            }
        }
    }

    pub fn deselect_all(&mut self) {
        let store = self.annotations.store_mut();
        for index in 0..store.annotation_count() {
            if let Some(annotation) = store.annotation_mut(index) {
                annotation.is_selected = false;
            }
        }
    }

    pub fn selected_indices(&self) -> Vec<usize> {
        self.annotations
            .store()
            .annotations()
            .filter(|(_, annotation)| annotation.is_selected)
            .map(|(index, _)| index)
            .collect()
    }

    #[inline]
    pub fn selected_count(&self) -> usize {
        self.selected_indices().len()
    }

    /// 拖框选择：包围盒完整落在框内的可见标注被选中，返回新增选中数。
    pub fn select_in_bounds(&mut self, marquee: Bounds2D, additive: bool) -> usize {
        if !additive {
            self.deselect_all();
        }
        let store = self.annotations.store_mut();
        let mut selected = 0;
        for index in 0..store.annotation_count() {
            if store.is_annotation_hidden(index) {
                continue;
            }
            let Some(annotation) = store.annotation_mut(index) else {
                continue;
            };
            if annotation.coordinate_count() == 0 || annotation.is_selected {
                continue;
            }
            if marquee.contains_bounds(&annotation.bounds()) {
                annotation.is_selected = true;
                selected += 1;
            }
        }
        selected
    }

    // ---- 创建 ----

    pub fn create_point(&mut self, position: Point2) -> usize {
        self.begin_annotation(AnnotationType::Point, vec![position], None)
    }

    /// 两端重合的线段，随后由 `update_creation` 拖动终点。
    pub fn create_line(&mut self, position: Point2) -> usize {
        self.begin_annotation(
            AnnotationType::Line,
            vec![position, position],
            Some(Creation::Line),
        )
    }

    pub fn create_rectangle(&mut self, position: Point2) -> usize {
        self.begin_annotation(
            AnnotationType::Rectangle,
            vec![position; 4],
            Some(Creation::Rectangle { anchor: position }),
        )
    }

    /// 椭圆的两个控制点：中心与外接矩形角点。
    pub fn create_ellipse(&mut self, position: Point2) -> usize {
        self.begin_annotation(
            AnnotationType::Ellipse,
            vec![position, position],
            Some(Creation::Ellipse),
        )
    }

    /// 开始手绘，标注保持开放直到闭合或取消。
    pub fn create_freeform(&mut self, position: Point2) -> usize {
        self.begin_annotation(
            AnnotationType::Polygon,
            vec![position],
            Some(Creation::Freeform {
                last_position: position,
                travelled: 0.0,
            }),
        )
    }

    fn begin_annotation(
        &mut self,
        kind: AnnotationType,
        coordinates: Vec<Point2>,
        creation: Option<Creation>,
    ) -> usize {
        if self.creation.is_some() {
            self.finish_creation();
        }
        self.deselect_all();
        let mut annotation = Annotation::new(kind, coordinates, self.active_group);
        annotation.is_selected = true;
        annotation.is_open = matches!(creation, Some(Creation::Freeform { .. }));
        let index = self.annotations.store_mut().push_annotation(annotation);
        if creation.is_some() {
            self.annotations.edit.editing_annotation = Some(index);
        }
        self.creation = creation;
        self.annotations.mark_modified();
        debug!(index, kind = ?kind, "新建标注");
        index
    }

    fn creating_index(&self) -> Result<usize, EngineError> {
        match (self.creation, self.annotations.edit.editing_annotation) {
            (Some(_), Some(index)) => Ok(index),
            _ => Err(EngineError::NotCreating),
        }
    }

    /// 指针移动：更新正在创建的形状的自由控制点；手绘时按间距追加采样。
    pub fn update_creation(&mut self, position: Point2) -> Result<(), EngineError> {
        let index = self.creating_index()?;
        let Some(creation) = self.creation else {
            return Err(EngineError::NotCreating);
        };
        match creation {
            Creation::Line | Creation::Ellipse => {
                self.annotation_mut(index)?.set_coordinate(1, position);
                self.annotations.mark_modified();
            }
            Creation::Rectangle { anchor } => {
                self.annotation_mut(index)?
                    .replace_coordinates(rectangle_from_corners(anchor, position));
                self.annotations.mark_modified();
            }
            Creation::Freeform {
                last_position,
                travelled,
            } => {
                if self.close_freeform_if_near_start(index, position)? {
                    return Ok(());
                }
                let travelled = travelled + last_position.distance(position);
                if travelled > self.config.freeform_spacing {
                    self.annotation_mut(index)?.push_coordinate(position);
                    self.annotations.mark_modified();
                    self.creation = Some(Creation::Freeform {
                        last_position: position,
                        travelled: 0.0,
                    });
                } else {
                    self.creation = Some(Creation::Freeform {
                        last_position: position,
                        travelled,
                    });
                }
            }
        }
        Ok(())
    }

    /// 手绘时的显式点击：无视间距直接追加坐标。
    pub fn click_freeform(&mut self, position: Point2) -> Result<(), EngineError> {
        let index = self.creating_index()?;
        if !matches!(self.creation, Some(Creation::Freeform { .. })) {
            return Err(EngineError::NotCreating);
        }
        if self.close_freeform_if_near_start(index, position)? {
            return Ok(());
        }
        self.annotation_mut(index)?.push_coordinate(position);
        self.creation = Some(Creation::Freeform {
            last_position: position,
            travelled: 0.0,
        });
        self.annotations.mark_modified();
        Ok(())
    }

    fn close_freeform_if_near_start(
        &mut self,
        index: usize,
        position: Point2,
    ) -> Result<bool, EngineError> {
        let tolerance = self.config.hover_tolerance;
        let annotation = self.annotation_mut(index)?;
        let near_start = annotation
            .coordinate(0)
            .is_some_and(|start| start.distance(position) < tolerance);
        if annotation.coordinate_count() >= 3 && near_start {
            annotation.is_open = false;
            self.end_creation();
            self.annotations.mark_modified();
            info!(index, "手绘标注已闭合");
            return Ok(true);
        }
        Ok(false)
    }

    /// 结束创建。不足 3 个坐标的手绘被丢弃，返回最终保留的标注下标。
    pub fn finish_creation(&mut self) -> Option<usize> {
        let index = self.creating_index().ok()?;
        let creation = self.creation?;
        if let Creation::Freeform { .. } = creation {
            let count = self
                .annotations
                .store()
                .annotation(index)
                .map_or(0, |annotation| annotation.coordinate_count());
            if count < 3 {
                self.end_creation();
                self.annotations.delete_annotation(index);
                debug!(index, count, "手绘坐标不足，已丢弃");
                return None;
            }
            if let Some(annotation) = self.annotations.store_mut().annotation_mut(index) {
                annotation.is_open = false;
            }
            self.annotations.mark_modified();
        }
        self.end_creation();
        Some(index)
    }

    /// 取消（Esc）。手绘按 `finish_creation` 的规则处理，其他形状直接删除。
    pub fn cancel_creation(&mut self) {
        let Ok(index) = self.creating_index() else {
            return;
        };
        match self.creation {
            Some(Creation::Freeform { .. }) => {
                self.finish_creation();
            }
            _ => {
                self.end_creation();
                self.annotations.delete_annotation(index);
            }
        }
    }

    fn end_creation(&mut self) {
        self.creation = None;
        self.annotations.edit.editing_annotation = None;
    }

    // ---- 坐标编辑 ----

    /// 在 `index`（0..=count）处插入坐标。
    pub fn insert_coordinate(
        &mut self,
        annotation: usize,
        index: usize,
        point: Point2,
    ) -> Result<(), EngineError> {
        let target = self.annotation_mut(annotation)?;
        let count = target.coordinate_count();
        if !target.insert_coordinate(index, point) {
            return Err(EngineError::CoordinateOutOfRange {
                annotation,
                index,
                count,
            });
        }
        if let Some(selected) = &mut self.annotations.edit.selected_coordinate {
            if selected.annotation == annotation && selected.coordinate >= index {
                selected.coordinate += 1;
            }
        }
        self.annotations.mark_modified();
        Ok(())
    }

    /// 删除坐标；若标注只剩这一个坐标，则删除整个标注。
    pub fn delete_coordinate(
        &mut self,
        annotation: usize,
        index: usize,
    ) -> Result<CoordinateDeletion, EngineError> {
        let target = self.annotation_mut(annotation)?;
        let count = target.coordinate_count();
        if index >= count {
            return Err(EngineError::CoordinateOutOfRange {
                annotation,
                index,
                count,
            });
        }
        if count == 1 {
            if self.annotations.edit.editing_annotation == Some(annotation) {
                self.creation = None;
            }
            self.annotations.delete_annotation(annotation);
            return Ok(CoordinateDeletion::AnnotationRemoved);
        }
        target.remove_coordinate(index);

        let edit = &mut self.annotations.edit;
        edit.selected_coordinate = match edit.selected_coordinate {
            Some(selected) if selected.annotation == annotation && selected.coordinate == index => {
                None
            }
            Some(selected) if selected.annotation == annotation && selected.coordinate > index => {
                Some(CoordinateRef {
                    coordinate: selected.coordinate - 1,
                    ..selected
                })
            }
            other => other,
        };
        if edit.selected_coordinate.is_none() {
            edit.is_split_mode = false;
        }
        self.annotations.mark_modified();
        Ok(CoordinateDeletion::CoordinateRemoved)
    }

    pub fn move_coordinate(
        &mut self,
        annotation: usize,
        index: usize,
        point: Point2,
    ) -> Result<(), EngineError> {
        let target = self.annotation_mut(annotation)?;
        let count = target.coordinate_count();
        if !target.set_coordinate(index, point) {
            return Err(EngineError::CoordinateOutOfRange {
                annotation,
                index,
                count,
            });
        }
        self.annotations.mark_modified();
        Ok(())
    }

    /// 在指针处拾取最近的坐标作为拖拽目标。
    pub fn begin_coordinate_drag(&mut self, point: Point2) -> Option<CoordinateRef> {
        let hit = self.hit_test(point)?;
        if hit.coordinate_distance > self.config.hover_tolerance {
            return None;
        }
        let selected = CoordinateRef {
            annotation: hit.annotation_index,
            coordinate: hit.nearest_coordinate_index,
        };
        if let Some(annotation) = self.annotations.store_mut().annotation_mut(hit.annotation_index) {
            annotation.is_selected = true;
        }
        self.annotations.edit.selected_coordinate = Some(selected);
        Some(selected)
    }

    /// 拖动当前选中的坐标；矩形会同步移动相邻两个角点以保持轴对齐。
    pub fn drag_selected_coordinate(&mut self, point: Point2) -> Result<(), EngineError> {
        let selected = self
            .annotations
            .edit
            .selected_coordinate
            .ok_or(EngineError::NoSelectedCoordinate)?;
        let target = self.annotation_mut(selected.annotation)?;
        let count = target.coordinate_count();
        if selected.coordinate >= count {
            return Err(EngineError::CoordinateOutOfRange {
                annotation: selected.annotation,
                index: selected.coordinate,
                count,
            });
        }
        match drag_rectangle_corner(target.coordinates(), target.annotation_type, selected.coordinate, point) {
            Some(corners) => target.replace_coordinates(corners),
            None => {
                target.set_coordinate(selected.coordinate, point);
                if target.annotation_type == AnnotationType::Rectangle {
                    target.annotation_type = AnnotationType::Polygon;
                }
            }
        }
        self.annotations.mark_modified();
        Ok(())
    }

    pub fn end_coordinate_drag(&mut self) {
        if !self.annotations.edit.is_split_mode {
            self.annotations.edit.selected_coordinate = None;
        }
    }

    /// 插入坐标模式：把投影点插到命中边上，返回新坐标的位置。未处于该模式时不做任何事。
    pub fn insert_coordinate_at(&mut self, point: Point2) -> Result<Option<CoordinateRef>, EngineError> {
        if !self.annotations.edit.is_insert_coordinate_mode {
            return Ok(None);
        }
        let Some(hit) = self.hit_test(point) else {
            return Ok(None);
        };
        if hit.edge_distance > self.config.hover_tolerance {
            return Ok(None);
        }
        let kind = self.annotation_mut(hit.annotation_index)?.annotation_type;
        if matches!(kind, AnnotationType::Ellipse | AnnotationType::Text) {
            return Ok(None);
        }
        let index = hit.edge_coordinate_index + 1;
        self.insert_coordinate(hit.annotation_index, index, hit.projected_point)?;
        Ok(Some(CoordinateRef {
            annotation: hit.annotation_index,
            coordinate: index,
        }))
    }

    // ---- 拆分 ----

    /// 以当前选中坐标为第一个拆分点进入拆分模式。
    pub fn begin_split(&mut self) -> Result<CoordinateRef, EngineError> {
        if !self.config.split_enabled {
            return Err(EngineError::SplitDisabled);
        }
        let selected = self
            .annotations
            .edit
            .selected_coordinate
            .ok_or(EngineError::NoSelectedCoordinate)?;
        self.annotations.edit.is_split_mode = true;
        Ok(selected)
    }

    pub fn cancel_split(&mut self) {
        self.annotations.edit.is_split_mode = false;
    }

    /// 以选中坐标与 `target` 为两个拆分点。
    pub fn split_at_selected(&mut self, target: usize) -> Result<Option<usize>, EngineError> {
        let selected = self
            .annotations
            .edit
            .selected_coordinate
            .ok_or(EngineError::NoSelectedCoordinate)?;
        self.split_annotation(selected.annotation, selected.coordinate, target)
    }

    /// 沿两个坐标之间的连线把多边形一分为二，返回新标注的下标。
    ///
    /// 两点相同或相邻（含首尾相邻）时不做任何事，只退出拆分模式。原标注保留
    /// [low, high] 区间内的坐标，新标注由区间外的坐标加上两个边界坐标组成。
    pub fn split_annotation(
        &mut self,
        annotation: usize,
        first: usize,
        second: usize,
    ) -> Result<Option<usize>, EngineError> {
        self.annotations.edit.is_split_mode = false;
        if !self.config.split_enabled {
            return Err(EngineError::SplitDisabled);
        }
        let source = self.annotation_mut(annotation)?;
        let count = source.coordinate_count();
        for index in [first, second] {
            if index >= count {
                return Err(EngineError::CoordinateOutOfRange {
                    annotation,
                    index,
                    count,
                });
            }
        }
        if !matches!(
            source.annotation_type,
            AnnotationType::Polygon | AnnotationType::Rectangle | AnnotationType::Spline
        ) {
            return Ok(None);
        }

        let low = first.min(second);
        let high = first.max(second);
        let adjacent = high - low == 1 || (low == 0 && high == count - 1);
        if low == high || adjacent {
            return Ok(None);
        }

        let coordinates = source.coordinates().to_vec();
        let mut split_off = source.clone();
        source.replace_coordinates(coordinates[low..=high].to_vec());

        let mut remainder = coordinates[high..].to_vec();
        remainder.extend_from_slice(&coordinates[..=low]);
        split_off.replace_coordinates(remainder);
        split_off.is_selected = false;

        let new_index = self.annotations.store_mut().push_annotation(split_off);
        self.annotations.edit.selected_coordinate = None;
        self.annotations.mark_modified();
        info!(annotation, new_index, low, high, "标注已拆分");
        Ok(Some(new_index))
    }

    // ---- 删除 / 分组 / 特征 ----

    pub fn delete_annotation(&mut self, index: usize) -> Result<(), EngineError> {
        self.annotation_mut(index)?;
        if self.annotations.edit.editing_annotation == Some(index) {
            self.creation = None;
        }
        self.annotations.delete_annotation(index);
        Ok(())
    }

    pub fn delete_selected_annotations(&mut self) -> usize {
        let removed = self.annotations.delete_selected_annotations();
        if self.annotations.edit.editing_annotation.is_none() {
            self.creation = None;
        }
        if removed > 0 {
            info!(removed, "已删除选中标注");
        }
        removed
    }

    /// 调整标注顺序，正在创建或拖拽的标注随之移动。
    pub fn move_annotation(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        self.annotation_mut(from)?;
        self.annotation_mut(to)?;
        self.annotations.move_annotation(from, to);
        Ok(())
    }

    pub fn assign_group(&mut self, annotation: usize, group: GroupId) -> Result<(), EngineError> {
        self.ensure_group(group)?;
        self.annotation_mut(annotation)?.group_id = group;
        self.annotations.mark_modified();
        Ok(())
    }

    /// 按名称查找分组后归入，名称不存在时报错。
    pub fn assign_selected_to_group_named(&mut self, name: &str) -> Result<usize, EngineError> {
        let group = self
            .annotations
            .store()
            .find_group_by_name(name)
            .ok_or_else(|| EngineError::GroupNameNotFound(name.to_string()))?;
        self.assign_group_to_selected(group)
    }

    /// 把所有选中标注归入 `group`，返回受影响数量。
    pub fn assign_group_to_selected(&mut self, group: GroupId) -> Result<usize, EngineError> {
        self.ensure_group(group)?;
        let store = self.annotations.store_mut();
        let mut changed = 0;
        for index in 0..store.annotation_count() {
            if let Some(annotation) = store.annotation_mut(index) {
                if annotation.is_selected && annotation.group_id != group {
                    annotation.group_id = group;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.annotations.mark_modified();
        }
        Ok(changed)
    }

    /// 设置特征取值。限定分组的特征只能用于该分组的标注。
    pub fn set_feature_value(
        &mut self,
        annotation: usize,
        feature: usize,
        value: f32,
    ) -> Result<(), EngineError> {
        let definition = self
            .annotations
            .store()
            .feature(feature)
            .cloned()
            .ok_or(EngineError::FeatureOutOfRange(feature))?;
        let target = self.annotation_mut(annotation)?;
        if definition.restrict_to_group && target.group_id != definition.group_id {
            return Err(EngineError::FeatureNotApplicable {
                feature,
                annotation,
            });
        }
        target.set_feature_value(definition.id, value);
        self.annotations.mark_modified();
        Ok(())
    }

    fn ensure_group(&self, group: GroupId) -> Result<(), EngineError> {
        match self.annotations.store().active_group_index(group) {
            Some(_) => Ok(()),
            None => Err(EngineError::GroupNotFound(group.get())),
        }
    }

    fn annotation_mut(&mut self, index: usize) -> Result<&mut Annotation, EngineError> {
        let store = self.annotations.store_mut();
        let count = store.annotation_count();
        store
            .annotation_mut(index)
            .ok_or(EngineError::AnnotationOutOfRange { index, count })
    }
}

/// 角点顺序：(x0,y0) (x1,y0) (x1,y1) (x0,y1)。
fn rectangle_from_corners(anchor: Point2, opposite: Point2) -> Vec<Point2> {
    vec![
        anchor,
        Point2::new(opposite.x(), anchor.y()),
        opposite,
        Point2::new(anchor.x(), opposite.y()),
    ]
}

fn is_axis_aligned_rectangle(corners: &[Point2]) -> bool {
    match corners {
        [c0, c1, c2, c3] => {
            c0.y() == c1.y() && c1.x() == c2.x() && c2.y() == c3.y() && c3.x() == c0.x()
        }
        _ => false,
    }
}

fn drag_rectangle_corner(
    corners: &[Point2],
    kind: AnnotationType,
    index: usize,
    point: Point2,
) -> Option<Vec<Point2>> {
    if kind != AnnotationType::Rectangle || !is_axis_aligned_rectangle(corners) {
        return None;
    }
    let opposite = corners[(index + 2) % 4];
    let mut moved = corners.to_vec();
    moved[index] = point;
    let (next, prev) = if index % 2 == 0 {
        (
            Point2::new(opposite.x(), point.y()),
            Point2::new(point.x(), opposite.y()),
        )
    } else {
        (
            Point2::new(point.x(), opposite.y()),
            Point2::new(opposite.x(), point.y()),
        )
    };
    moved[(index + 1) % 4] = next;
    moved[(index + 3) % 4] = prev;
    Some(moved)
}
