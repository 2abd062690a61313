//! 标注集合：存储区（stored）与活动索引（active）双层结构。
//!
//! 所有记录只追加到 `stored_*` 数组，删除/排序只改动 `active_*` 索引数组，
//! 因此历史引用（例如标注的 `group_id`）永远不会悬空。

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{DerivedCache, ValidityMask};
use crate::color::Rgb8;
use crate::geometry::{
    self, Bounds2D, ELLIPSE_SEGMENTS, Point2, Triangle, Vector2, ellipse_radii,
};

/// 每个标注的特征向量宽度（特征 id 即下标）。
pub const MAX_FEATURES: usize = 32;

pub const UNNAMED: &str = "(unnamed)";

const SAVE_WAIT_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnnotationType {
    Point,
    Line,
    Rectangle,
    Polygon,
    Spline,
    Ellipse,
    Text,
}

impl AnnotationType {
    /// 坐标数量变化后重新推断类型。对同一数量重复调用结果不变。
    pub fn inferred_for(self, coordinate_count: usize) -> Self {
        match self {
            AnnotationType::Rectangle if coordinate_count == 4 => AnnotationType::Rectangle,
            AnnotationType::Point
            | AnnotationType::Line
            | AnnotationType::Rectangle
            | AnnotationType::Polygon
            | AnnotationType::Spline => match coordinate_count {
                0 => self,
                1 => AnnotationType::Point,
                2 => AnnotationType::Line,
                _ => match self {
                    AnnotationType::Spline => AnnotationType::Spline,
                    _ => AnnotationType::Polygon,
                },
            },
            AnnotationType::Ellipse | AnnotationType::Text => self,
        }
    }

    #[inline]
    pub fn is_area(self) -> bool {
        matches!(
            self,
            AnnotationType::Rectangle
                | AnnotationType::Polygon
                | AnnotationType::Spline
                | AnnotationType::Ellipse
        )
    }
}

/// 存储区中的分组下标。0 号保留给 "None"，永不删除。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GroupId(usize);

impl GroupId {
    pub const NONE: GroupId = GroupId(0);

    #[inline]
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

/// 命中测试的副作用：记录本帧到各标注边的原始距离，供拖框多选使用。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitStamp {
    pub distance: f64,
    pub frame: u64,
}

impl Default for HitStamp {
    fn default() -> Self {
        Self {
            distance: f64::INFINITY,
            frame: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Annotation {
    pub annotation_type: AnnotationType,
    coordinates: Vec<Point2>,
    pub group_id: GroupId,
    features: [f32; MAX_FEATURES],
    pub name: String,
    /// 手绘中的标注尚未闭合。
    pub is_open: bool,
    pub is_selected: bool,
    pub hit_stamp: HitStamp,
    cache: DerivedCache,
}

impl Annotation {
    pub fn new(
        annotation_type: AnnotationType,
        coordinates: Vec<Point2>,
        group_id: GroupId,
    ) -> Self {
        Self {
            annotation_type,
            coordinates,
            group_id,
            features: [0.0; MAX_FEATURES],
            name: String::new(),
            is_open: false,
            is_selected: false,
            hit_stamp: HitStamp::default(),
            cache: DerivedCache::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 名称为空时返回 "(unnamed)"。
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            UNNAMED
        } else {
            &self.name
        }
    }

    #[inline]
    pub fn coordinates(&self) -> &[Point2] {
        &self.coordinates
    }

    #[inline]
    pub fn coordinate_count(&self) -> usize {
        self.coordinates.len()
    }

    #[inline]
    pub fn coordinate(&self, index: usize) -> Option<Point2> {
        self.coordinates.get(index).copied()
    }

    pub fn set_coordinate(&mut self, index: usize, point: Point2) -> bool {
        match self.coordinates.get_mut(index) {
            Some(slot) => {
                *slot = point;
                self.cache.invalidate_geometry();
                true
            }
            None => false,
        }
    }

    /// 追加到末尾，随后重新推断类型。
    pub fn push_coordinate(&mut self, point: Point2) {
        self.coordinates.push(point);
        self.after_count_change();
    }

    /// 在 `index`（0..=count）处插入坐标，随后重新推断类型。
    pub fn insert_coordinate(&mut self, index: usize, point: Point2) -> bool {
        if index > self.coordinates.len() {
            return false;
        }
        self.coordinates.insert(index, point);
        self.after_count_change();
        true
    }

    pub fn remove_coordinate(&mut self, index: usize) -> Option<Point2> {
        if index >= self.coordinates.len() {
            return None;
        }
        let removed = self.coordinates.remove(index);
        self.after_count_change();
        Some(removed)
    }

    pub fn replace_coordinates(&mut self, coordinates: Vec<Point2>) {
        self.coordinates = coordinates;
        self.after_count_change();
    }

    /// 释放坐标缓冲区（删除标注时调用）。
    pub(crate) fn release_coordinates(&mut self) {
        self.coordinates = Vec::new();
        self.cache.invalidate_all();
    }

    fn after_count_change(&mut self) {
        self.annotation_type = self.annotation_type.inferred_for(self.coordinates.len());
        self.cache.invalidate_geometry();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.annotation_type.is_area() && !self.is_open
    }

    /// 用于命中测试与绘制的轮廓。椭圆由两个控制点展开为采样多边形。
    pub fn outline(&self) -> Cow<'_, [Point2]> {
        outline_of(self.annotation_type, &self.coordinates)
    }

    pub fn bounds(&mut self) -> Bounds2D {
        let kind = self.annotation_type;
        let coordinates = &self.coordinates;
        *self.cache.bounds.get_or_compute(|| shape_bounds(kind, coordinates))
    }

    pub fn area(&mut self) -> f64 {
        let kind = self.annotation_type;
        let coordinates = &self.coordinates;
        *self.cache.area.get_or_compute(|| shape_area(kind, coordinates))
    }

    /// 填充三角形；多边形无法剖分时返回 `None`（轮廓绘制不受影响）。
    pub fn tessellation(&mut self) -> Option<&[Triangle]> {
        let kind = self.annotation_type;
        let coordinates = &self.coordinates;
        self.cache
            .tessellation
            .get_or_compute(|| shape_tessellation(kind, coordinates))
            .as_deref()
    }

    /// 拖拽时渲染端可以限制重算频率：不允许重算且缓存失效时返回上一次的结果。
    pub fn tessellation_for_drawing(&mut self, allow_recompute: bool) -> Option<&[Triangle]> {
        if !allow_recompute && !self.cache.tessellation.is_valid() {
            return self.cache.fallback_tessellation();
        }
        self.tessellation()
    }

    pub fn nonzero_feature_count(&mut self) -> usize {
        let features = &self.features;
        *self
            .cache
            .nonzero_feature_count
            .get_or_compute(|| features.iter().filter(|value| **value != 0.0).count())
    }

    #[inline]
    pub fn feature_value(&self, feature_id: usize) -> Option<f32> {
        self.features.get(feature_id).copied()
    }

    pub fn set_feature_value(&mut self, feature_id: usize, value: f32) -> bool {
        match self.features.get_mut(feature_id) {
            Some(slot) => {
                *slot = value;
                self.cache.invalidate_features();
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn cache(&self) -> &DerivedCache {
        &self.cache
    }

    #[inline]
    pub fn fallback_mask(&self) -> ValidityMask {
        self.cache.fallback_mask()
    }

    pub(crate) fn roll_frame(&mut self) {
        self.cache.roll_frame();
    }
}

fn outline_of(kind: AnnotationType, coordinates: &[Point2]) -> Cow<'_, [Point2]> {
    match (kind, coordinates) {
        (AnnotationType::Ellipse, [center, corner, ..]) => {
            Cow::Owned(geometry::ellipse_outline(*center, *corner, ELLIPSE_SEGMENTS))
        }
        _ => Cow::Borrowed(coordinates),
    }
}

fn shape_bounds(kind: AnnotationType, coordinates: &[Point2]) -> Bounds2D {
    match (kind, coordinates) {
        (AnnotationType::Ellipse, [center, corner, ..]) => {
            let radii = ellipse_radii(*center, *corner);
            Bounds2D::new(
                center.translate(Vector2::new(-radii.x(), -radii.y())),
                center.translate(radii),
            )
        }
        _ => geometry::polygon_bounds(coordinates),
    }
}

fn shape_area(kind: AnnotationType, coordinates: &[Point2]) -> f64 {
    match (kind, coordinates) {
        (AnnotationType::Ellipse, [center, corner, ..]) => {
            let radii = ellipse_radii(*center, *corner);
            std::f64::consts::PI * radii.x() * radii.y()
        }
        _ if kind.is_area() => geometry::polygon_area(coordinates),
        _ => 0.0,
    }
}

fn shape_tessellation(kind: AnnotationType, coordinates: &[Point2]) -> Option<Vec<Triangle>> {
    if !kind.is_area() {
        return None;
    }
    let outline = outline_of(kind, coordinates);
    match geometry::triangulate(&outline) {
        Ok(triangles) => Some(triangles),
        Err(err) => {
            debug!(error = %err, vertices = outline.len(), "跳过填充：三角剖分失败");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub color: Rgb8,
    /// 该分组在源文件中显式声明过（写回时保留顺序）。
    pub is_explicitly_defined: bool,
    pub is_hidden: bool,
    pub is_deleted: bool,
}

impl Group {
    pub fn new(name: impl Into<String>, color: Rgb8) -> Self {
        Self {
            name: name.into(),
            color,
            is_explicitly_defined: false,
            is_hidden: false,
            is_deleted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    /// 特征向量中的下标。
    pub id: usize,
    pub restrict_to_group: bool,
    pub group_id: GroupId,
    pub is_deleted: bool,
}

/// 标注集合的全部数据。可整体深拷贝，用作后台保存的快照。
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    stored_annotations: Vec<Annotation>,
    active_annotations: Vec<usize>,
    stored_groups: Vec<Group>,
    active_groups: Vec<usize>,
    stored_features: Vec<Feature>,
    active_features: Vec<usize>,
    mpp: Vector2,
}

impl AnnotationStore {
    pub const NONE_GROUP_NAME: &'static str = "None";

    pub fn new(mpp: Vector2) -> Self {
        let mut none = Group::new(Self::NONE_GROUP_NAME, Rgb8::new(50, 50, 50));
        none.is_explicitly_defined = true;
        Self {
            stored_annotations: Vec::new(),
            active_annotations: Vec::new(),
            stored_groups: vec![none],
            active_groups: vec![0],
            stored_features: Vec::new(),
            active_features: Vec::new(),
            mpp: sanitize_mpp(mpp),
        }
    }

    #[inline]
    pub fn mpp(&self) -> Vector2 {
        self.mpp
    }

    pub fn set_mpp(&mut self, mpp: Vector2) {
        self.mpp = sanitize_mpp(mpp);
    }

    /// 文件（像素）坐标 → 世界坐标。
    #[inline]
    pub fn pixel_to_world(&self, pixel: Point2) -> Point2 {
        Point2::from_vec(pixel.as_vec2() * self.mpp.as_vec2())
    }

    #[inline]
    pub fn world_to_pixel(&self, world: Point2) -> Point2 {
        Point2::from_vec(world.as_vec2() / self.mpp.as_vec2())
    }

    // ---- 标注 ----

    #[inline]
    pub fn annotation_count(&self) -> usize {
        self.active_annotations.len()
    }

    #[inline]
    pub fn stored_annotation_count(&self) -> usize {
        self.stored_annotations.len()
    }

    pub fn annotation(&self, active_index: usize) -> Option<&Annotation> {
        let stored = *self.active_annotations.get(active_index)?;
        self.stored_annotations.get(stored)
    }

    pub fn annotation_mut(&mut self, active_index: usize) -> Option<&mut Annotation> {
        let stored = *self.active_annotations.get(active_index)?;
        self.stored_annotations.get_mut(stored)
    }

    /// 按活动顺序遍历 (活动下标, 标注)。
    pub fn annotations(&self) -> impl Iterator<Item = (usize, &Annotation)> + '_ {
        self.active_annotations
            .iter()
            .enumerate()
            .filter_map(|(active, &stored)| {
                self.stored_annotations.get(stored).map(|ann| (active, ann))
            })
    }

    /// 追加标注，返回活动下标。
    pub fn push_annotation(&mut self, annotation: Annotation) -> usize {
        self.stored_annotations.push(annotation);
        self.active_annotations
            .push(self.stored_annotations.len() - 1);
        self.active_annotations.len() - 1
    }

    /// 删除单个标注：释放坐标缓冲区并压缩活动数组。
    pub fn delete_annotation(&mut self, active_index: usize) -> bool {
        if active_index >= self.active_annotations.len() {
            return false;
        }
        let stored = self.active_annotations.remove(active_index);
        if let Some(annotation) = self.stored_annotations.get_mut(stored) {
            annotation.release_coordinates();
            annotation.is_selected = false;
        }
        true
    }

    /// 一次线性遍历重建活动数组，删除所有选中标注，返回删除数量。
    pub fn delete_selected_annotations(&mut self) -> usize {
        let remap = self.delete_selected_with_remap();
        remap.len() - self.active_annotations.len()
    }

    /// 同 `delete_selected_annotations`，返回旧活动下标到新活动下标的映射（被删除的为 `None`）。
    fn delete_selected_with_remap(&mut self) -> Vec<Option<usize>> {
        let scratch = std::mem::take(&mut self.active_annotations);
        let mut remap = Vec::with_capacity(scratch.len());
        let mut kept = Vec::with_capacity(scratch.len());
        for stored in scratch {
            match self.stored_annotations.get_mut(stored) {
                Some(annotation) if annotation.is_selected => {
                    annotation.release_coordinates();
                    annotation.is_selected = false;
                    remap.push(None);
                }
                Some(_) => {
                    remap.push(Some(kept.len()));
                    kept.push(stored);
                }
                None => remap.push(None),
            }
        }
        self.active_annotations = kept;
        remap
    }

    /// 调整绘制/保存顺序，只移动索引。
    pub fn move_annotation(&mut self, from: usize, to: usize) -> bool {
        move_index(&mut self.active_annotations, from, to)
    }

    pub fn is_annotation_hidden(&self, active_index: usize) -> bool {
        self.annotation(active_index)
            .and_then(|annotation| self.stored_groups.get(annotation.group_id.get()))
            .is_some_and(|group| group.is_hidden)
    }

    /// 帧边界：让每个标注记住本帧结束时缓存的有效位。
    pub fn roll_frame(&mut self) {
        for &stored in &self.active_annotations {
            if let Some(annotation) = self.stored_annotations.get_mut(stored) {
                annotation.roll_frame();
            }
        }
    }

    // ---- 分组 ----

    #[inline]
    pub fn group_count(&self) -> usize {
        self.active_groups.len()
    }

    pub fn group(&self, active_index: usize) -> Option<&Group> {
        let stored = *self.active_groups.get(active_index)?;
        self.stored_groups.get(stored)
    }

    pub fn group_mut(&mut self, active_index: usize) -> Option<&mut Group> {
        let stored = *self.active_groups.get(active_index)?;
        self.stored_groups.get_mut(stored)
    }

    /// 活动下标 → 存储区 id（标注通过 id 引用分组）。
    pub fn group_id(&self, active_index: usize) -> Option<GroupId> {
        self.active_groups.get(active_index).copied().map(GroupId)
    }

    /// 通过存储区 id 查分组，已软删除的分组仍可查到。
    pub fn group_by_id(&self, id: GroupId) -> Option<&Group> {
        self.stored_groups.get(id.get())
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &Group)> + '_ {
        self.active_groups
            .iter()
            .filter_map(|&stored| self.stored_groups.get(stored).map(|g| (GroupId(stored), g)))
    }

    pub fn add_group(&mut self, name: impl Into<String>) -> usize {
        let color = Rgb8::palette(self.stored_groups.len());
        self.add_group_with_color(name, color)
    }

    pub fn add_group_with_color(&mut self, name: impl Into<String>, color: Rgb8) -> usize {
        self.stored_groups.push(Group::new(name, color));
        self.active_groups.push(self.stored_groups.len() - 1);
        self.active_groups.len() - 1
    }

    /// 在活动分组中按名称查找。
    pub fn find_group_by_name(&self, name: &str) -> Option<GroupId> {
        self.groups()
            .find(|(_, group)| group.name == name)
            .map(|(id, _)| id)
    }

    pub fn active_group_index(&self, id: GroupId) -> Option<usize> {
        self.active_groups.iter().position(|&stored| stored == id.get())
    }

    /// 软删除分组：引用它的标注改挂到 0 号分组，特征的组限制同样回落。
    pub fn delete_group(&mut self, active_index: usize) -> bool {
        let Some(&stored) = self.active_groups.get(active_index) else {
            return false;
        };
        if stored == GroupId::NONE.get() {
            return false;
        }
        let deleted = GroupId(stored);
        self.stored_groups[stored].is_deleted = true;
        for annotation in &mut self.stored_annotations {
            if annotation.group_id == deleted {
                annotation.group_id = GroupId::NONE;
            }
        }
        for feature in &mut self.stored_features {
            if feature.group_id == deleted {
                feature.group_id = GroupId::NONE;
                feature.restrict_to_group = false;
            }
        }
        self.active_groups.remove(active_index);
        true
    }

    pub fn set_group_hidden(&mut self, active_index: usize, hidden: bool) -> bool {
        match self.group_mut(active_index) {
            Some(group) => {
                group.is_hidden = hidden;
                true
            }
            None => false,
        }
    }

    pub fn move_group(&mut self, from: usize, to: usize) -> bool {
        move_index(&mut self.active_groups, from, to)
    }

    // ---- 特征 ----

    #[inline]
    pub fn feature_count(&self) -> usize {
        self.active_features.len()
    }

    pub fn feature(&self, active_index: usize) -> Option<&Feature> {
        let stored = *self.active_features.get(active_index)?;
        self.stored_features.get(stored)
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> + '_ {
        self.active_features
            .iter()
            .filter_map(|&stored| self.stored_features.get(stored))
    }

    /// 新建特征，返回活动下标；特征向量已满时返回 `None`。
    pub fn add_feature(&mut self, name: impl Into<String>) -> Option<usize> {
        let id = self.stored_features.len();
        if id >= MAX_FEATURES {
            return None;
        }
        self.stored_features.push(Feature {
            name: name.into(),
            id,
            restrict_to_group: false,
            group_id: GroupId::NONE,
            is_deleted: false,
        });
        self.active_features.push(id);
        Some(self.active_features.len() - 1)
    }

    pub fn find_feature_by_name(&self, name: &str) -> Option<usize> {
        self.active_features.iter().position(|&stored| {
            self.stored_features
                .get(stored)
                .is_some_and(|feature| feature.name == name)
        })
    }

    pub fn restrict_feature_to_group(&mut self, active_index: usize, group: Option<GroupId>) -> bool {
        let Some(&stored) = self.active_features.get(active_index) else {
            return false;
        };
        if let Some(id) = group {
            if self.stored_groups.get(id.get()).is_none_or(|g| g.is_deleted) {
                return false;
            }
        }
        let feature = &mut self.stored_features[stored];
        feature.restrict_to_group = group.is_some();
        feature.group_id = group.unwrap_or(GroupId::NONE);
        true
    }

    /// 软删除特征，并清零所有标注中该特征的取值。
    pub fn delete_feature(&mut self, active_index: usize) -> bool {
        let Some(&stored) = self.active_features.get(active_index) else {
            return false;
        };
        let id = self.stored_features[stored].id;
        self.stored_features[stored].is_deleted = true;
        for annotation in &mut self.stored_annotations {
            if annotation.feature_value(id).is_some_and(|value| value != 0.0) {
                annotation.set_feature_value(id, 0.0);
            }
        }
        self.active_features.remove(active_index);
        true
    }
}

fn sanitize_mpp(mpp: Vector2) -> Vector2 {
    let fix = |value: f64| {
        if value.is_finite() && value > 0.0 {
            value
        } else {
            1.0
        }
    };
    Vector2::new(fix(mpp.x()), fix(mpp.y()))
}

fn move_index(indices: &mut Vec<usize>, from: usize, to: usize) -> bool {
    if from >= indices.len() || to >= indices.len() {
        return false;
    }
    let value = indices.remove(from);
    indices.insert(to, value);
    true
}

/// `from` 移到 `to` 之后，原下标 `index` 所在的新位置。
fn moved_index(index: usize, from: usize, to: usize) -> usize {
    if index == from {
        to
    } else if from < to && index > from && index <= to {
        index - 1
    } else if to < from && index >= to && index < from {
        index + 1
    } else {
        index
    }
}

/// 指向某个标注中某个坐标。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateRef {
    pub annotation: usize,
    pub coordinate: usize,
}

/// 编辑状态。所有下标均为活动下标，删除标注时同步修正。
#[derive(Debug, Clone, Default)]
pub struct EditState {
    pub is_edit_mode: bool,
    pub is_insert_coordinate_mode: bool,
    pub is_split_mode: bool,
    pub editing_annotation: Option<usize>,
    pub selected_coordinate: Option<CoordinateRef>,
    pub frame: u64,
}

impl EditState {
    /// 活动数组重排后修正编辑指针，`remap[old]` 为新下标。
    fn remap_annotations(&mut self, remap: impl Fn(usize) -> Option<usize>) {
        self.editing_annotation = self.editing_annotation.and_then(&remap);
        self.selected_coordinate = self.selected_coordinate.and_then(|coord| {
            remap(coord.annotation).map(|annotation| CoordinateRef {
                annotation,
                ..coord
            })
        });
        if self.selected_coordinate.is_none() {
            self.is_split_mode = false;
        }
    }

    fn on_annotation_removed(&mut self, removed: usize) {
        self.editing_annotation = match self.editing_annotation {
            Some(index) if index == removed => None,
            Some(index) if index > removed => Some(index - 1),
            other => other,
        };
        self.selected_coordinate = match self.selected_coordinate {
            Some(coord) if coord.annotation == removed => None,
            Some(coord) if coord.annotation > removed => Some(CoordinateRef {
                annotation: coord.annotation - 1,
                ..coord
            }),
            other => other,
        };
        if self.selected_coordinate.is_none() {
            self.is_split_mode = false;
        }
    }
}

/// 后台保存的互斥标志。保存任务用 `try_claim` 抢占，抢不到就放弃本次保存。
#[derive(Debug, Default)]
pub struct SaveState {
    in_progress: Mutex<()>,
    saved_generation: AtomicU64,
}

/// 持有期间其他保存请求都会被跳过。
#[derive(Debug)]
pub struct SaveClaim<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl SaveState {
    pub fn try_claim(&self) -> Option<SaveClaim<'_>> {
        match self.in_progress.try_lock() {
            Ok(guard) => Some(SaveClaim { _guard: guard }),
            Err(TryLockError::Poisoned(poisoned)) => Some(SaveClaim {
                _guard: poisoned.into_inner(),
            }),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn is_saving(&self) -> bool {
        matches!(self.in_progress.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// 记录已经落盘的修改代数，只增不减。
    pub fn record_saved(&self, generation: u64) {
        self.saved_generation.fetch_max(generation, Ordering::AcqRel);
    }

    #[inline]
    pub fn saved_generation(&self) -> u64 {
        self.saved_generation.load(Ordering::Acquire)
    }
}

/// 交给后台保存任务的私有深拷贝。
#[derive(Debug, Clone)]
pub struct AnnotationSnapshot {
    pub store: AnnotationStore,
    pub generation: u64,
    /// 源文件来自磁盘时，首次覆盖前需要备份为 `.orig`。
    pub backup_on_save: bool,
    pub source_path: Option<PathBuf>,
}

impl AnnotationSnapshot {
    /// 写到 `path` 是否算作保存了集合本身（另存为其他文件不算）。
    pub fn saves_source(&self, path: &Path) -> bool {
        self.source_path.as_deref().is_none_or(|source| source == path)
    }
}

#[derive(Debug)]
pub struct AnnotationSet {
    store: AnnotationStore,
    pub edit: EditState,
    generation: u64,
    last_modified: Option<Instant>,
    source_path: Option<PathBuf>,
    loaded_from_disk: bool,
    save_state: Arc<SaveState>,
}

impl AnnotationSet {
    pub fn new(mpp: Vector2) -> Self {
        Self {
            store: AnnotationStore::new(mpp),
            edit: EditState::default(),
            generation: 0,
            last_modified: None,
            source_path: None,
            loaded_from_disk: false,
            save_state: Arc::new(SaveState::default()),
        }
    }

    #[inline]
    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    /// 直接改动存储区后调用方需要自行 `mark_modified`。
    #[inline]
    pub fn store_mut(&mut self) -> &mut AnnotationStore {
        &mut self.store
    }

    /// 设置修改标志并刷新最后修改时间（自动保存据此节流）。
    pub fn mark_modified(&mut self) {
        self.generation += 1;
        self.last_modified = Some(Instant::now());
    }

    /// 存在尚未落盘的修改。
    pub fn is_modified(&self) -> bool {
        self.generation > self.save_state.saved_generation()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn last_modified(&self) -> Option<Instant> {
        self.last_modified
    }

    #[inline]
    pub fn save_state(&self) -> &Arc<SaveState> {
        &self.save_state
    }

    #[inline]
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn set_source_path(&mut self, path: Option<PathBuf>) {
        self.source_path = path;
    }

    #[inline]
    pub fn is_loaded_from_disk(&self) -> bool {
        self.loaded_from_disk
    }

    pub fn delete_annotation(&mut self, active_index: usize) -> bool {
        if !self.store.delete_annotation(active_index) {
            return false;
        }
        self.edit.on_annotation_removed(active_index);
        self.mark_modified();
        true
    }

    pub fn delete_selected_annotations(&mut self) -> usize {
        let remap = self.store.delete_selected_with_remap();
        let removed = remap.len() - self.store.annotation_count();
        if removed > 0 {
            self.edit
                .remap_annotations(|old| remap.get(old).copied().flatten());
            self.mark_modified();
        }
        removed
    }

    /// 调整标注顺序（影响绘制与保存顺序），编辑指针跟随移动。
    pub fn move_annotation(&mut self, from: usize, to: usize) -> bool {
        if !self.store.move_annotation(from, to) {
            return false;
        }
        self.edit
            .remap_annotations(|old| Some(moved_index(old, from, to)));
        self.mark_modified();
        true
    }

    pub fn move_group(&mut self, from: usize, to: usize) -> bool {
        if !self.store.move_group(from, to) {
            return false;
        }
        self.mark_modified();
        true
    }

    /// 清空并恢复到只有 "None" 分组的初始状态。
    pub fn unload_and_reinit_annotations(&mut self) {
        let mpp = self.store.mpp();
        self.reset_with(AnnotationStore::new(mpp), None, false);
    }

    /// 用完整解析好的数据替换当前内容（加载成功后调用，失败时不会走到这里）。
    pub fn replace_store(&mut self, store: AnnotationStore, source_path: Option<PathBuf>) {
        let from_disk = source_path.is_some();
        self.reset_with(store, source_path, from_disk);
    }

    fn reset_with(&mut self, store: AnnotationStore, source: Option<PathBuf>, from_disk: bool) {
        self.store = store;
        self.edit = EditState::default();
        self.source_path = source;
        self.loaded_from_disk = from_disk;
        self.generation += 1;
        self.last_modified = None;
        self.save_state.record_saved(self.generation);
    }

    /// 深拷贝全部数据（含每个标注的坐标缓冲区），后台任务只接触这份拷贝。
    pub fn snapshot(&self) -> AnnotationSnapshot {
        AnnotationSnapshot {
            store: self.store.clone(),
            generation: self.generation,
            backup_on_save: self.loaded_from_disk,
            source_path: self.source_path.clone(),
        }
    }

    /// 帧边界：推进帧计数并滚动缓存回退掩码。
    pub fn begin_frame(&mut self) -> u64 {
        self.store.roll_frame();
        self.edit.frame += 1;
        self.edit.frame
    }
}

impl Default for AnnotationSet {
    fn default() -> Self {
        Self::new(Vector2::new(1.0, 1.0))
    }
}

impl Drop for AnnotationSet {
    /// 等待进行中的保存结束后再释放。
    fn drop(&mut self) {
        loop {
            match self.save_state.in_progress.try_lock() {
                Ok(_) | Err(TryLockError::Poisoned(_)) => break,
                Err(TryLockError::WouldBlock) => {
                    debug!("等待后台保存结束");
                    thread::sleep(SAVE_WAIT_INTERVAL);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DerivedKind;

    fn square(origin: f64, size: f64) -> Vec<Point2> {
        vec![
            Point2::new(origin, origin),
            Point2::new(origin + size, origin),
            Point2::new(origin + size, origin + size),
            Point2::new(origin, origin + size),
        ]
    }

    #[test]
    fn new_store_has_reserved_none_group() {
        let store = AnnotationStore::new(Vector2::new(0.5, 0.5));
        assert_eq!(store.group_count(), 1);
        assert_eq!(store.group(0).map(|g| g.name.as_str()), Some("None"));
        assert_eq!(store.find_group_by_name("None"), Some(GroupId::NONE));
        assert_eq!(store.annotation_count(), 0);
    }

    #[test]
    fn type_inference_is_idempotent() {
        let kinds = [
            AnnotationType::Point,
            AnnotationType::Line,
            AnnotationType::Rectangle,
            AnnotationType::Polygon,
            AnnotationType::Spline,
            AnnotationType::Ellipse,
            AnnotationType::Text,
        ];
        for kind in kinds {
            for count in 0..7 {
                let once = kind.inferred_for(count);
                assert_eq!(once.inferred_for(count), once, "{kind:?} with {count}");
            }
        }
        assert_eq!(AnnotationType::Rectangle.inferred_for(5), AnnotationType::Polygon);
        assert_eq!(AnnotationType::Rectangle.inferred_for(4), AnnotationType::Rectangle);
        assert_eq!(AnnotationType::Rectangle.inferred_for(2), AnnotationType::Line);
        assert_eq!(AnnotationType::Rectangle.inferred_for(1), AnnotationType::Point);
        assert_eq!(AnnotationType::Polygon.inferred_for(2), AnnotationType::Line);
        assert_eq!(AnnotationType::Point.inferred_for(3), AnnotationType::Polygon);
        assert_eq!(AnnotationType::Spline.inferred_for(3), AnnotationType::Spline);
        assert_eq!(AnnotationType::Spline.inferred_for(1), AnnotationType::Point);
    }

    #[test]
    fn coordinate_edits_invalidate_geometry_cache() {
        let mut annotation = Annotation::new(AnnotationType::Polygon, square(0.0, 2.0), GroupId::NONE);
        assert!((annotation.area() - 4.0).abs() < 1e-12);
        assert_eq!(annotation.tessellation().map(|t| t.len()), Some(2));
        annotation.set_feature_value(3, 1.5);
        assert_eq!(annotation.nonzero_feature_count(), 1);

        assert!(annotation.set_coordinate(2, Point2::new(4.0, 4.0)));
        assert!(!annotation.cache().is_valid(DerivedKind::Area));
        assert!(!annotation.cache().is_valid(DerivedKind::Bounds));
        assert!(annotation.cache().is_valid(DerivedKind::NonzeroFeatureCount));
        assert_eq!(annotation.bounds().max(), Point2::new(4.0, 4.0));

        annotation.set_feature_value(3, 0.0);
        assert!(!annotation.cache().is_valid(DerivedKind::NonzeroFeatureCount));
        assert_eq!(annotation.nonzero_feature_count(), 0);
        assert!(!annotation.set_feature_value(MAX_FEATURES, 1.0));
    }

    #[test]
    fn inserting_and_removing_reinfers_type() {
        let mut annotation =
            Annotation::new(AnnotationType::Rectangle, square(0.0, 1.0), GroupId::NONE);
        assert!(annotation.insert_coordinate(4, Point2::new(0.0, 0.5)));
        assert_eq!(annotation.annotation_type, AnnotationType::Polygon);
        assert!(!annotation.insert_coordinate(9, Point2::new(0.0, 0.0)));
        annotation.remove_coordinate(0);
        annotation.remove_coordinate(0);
        annotation.remove_coordinate(0);
        assert_eq!(annotation.coordinate_count(), 2);
        assert_eq!(annotation.annotation_type, AnnotationType::Line);
        assert!(annotation.remove_coordinate(5).is_none());
    }

    #[test]
    fn ellipse_uses_control_points_for_derived_values() {
        let mut ellipse = Annotation::new(
            AnnotationType::Ellipse,
            vec![Point2::new(0.0, 0.0), Point2::new(2.0, 1.0)],
            GroupId::NONE,
        );
        assert!((ellipse.area() - std::f64::consts::PI * 2.0).abs() < 1e-12);
        let bounds = ellipse.bounds();
        assert_eq!(bounds.min(), Point2::new(-2.0, -1.0));
        assert_eq!(bounds.max(), Point2::new(2.0, 1.0));
        assert_eq!(ellipse.outline().len(), ELLIPSE_SEGMENTS);
        assert!(ellipse.tessellation().is_some());
    }

    #[test]
    fn tessellation_fallback_is_served_while_recompute_is_throttled() {
        let mut annotation = Annotation::new(AnnotationType::Polygon, square(0.0, 1.0), GroupId::NONE);
        assert!(annotation.tessellation().is_some());
        annotation.set_coordinate(0, Point2::new(-1.0, -1.0));
        assert_eq!(annotation.tessellation_for_drawing(false).map(|t| t.len()), Some(2));
        let moved = Point2::new(-1.0, -1.0);
        let fresh = annotation
            .tessellation_for_drawing(true)
            .expect("凸四边形应能剖分");
        assert!(fresh.iter().any(|tri| tri.contains(&moved)));
    }

    #[test]
    fn deleting_group_reassigns_annotations_to_none() {
        let mut store = AnnotationStore::new(Vector2::new(1.0, 1.0));
        let tumor = store.add_group("Tumor");
        let tumor_id = store.group_id(tumor).unwrap();
        let feature = store.add_feature("grade").unwrap();
        assert!(store.restrict_feature_to_group(feature, Some(tumor_id)));
        let index = store.push_annotation(Annotation::new(
            AnnotationType::Polygon,
            square(0.0, 1.0),
            tumor_id,
        ));

        assert!(!store.delete_group(0), "0 号分组不可删除");
        assert!(store.delete_group(tumor));
        assert_eq!(store.group_count(), 1);
        assert!(store.find_group_by_name("Tumor").is_none());
        assert!(store.group_by_id(tumor_id).unwrap().is_deleted);
        assert_eq!(store.annotation(index).unwrap().group_id, GroupId::NONE);
        assert!(!store.feature(feature).unwrap().restrict_to_group);
    }

    #[test]
    fn deleting_feature_clears_values() {
        let mut store = AnnotationStore::new(Vector2::new(1.0, 1.0));
        let first = store.add_feature("a").unwrap();
        store.add_feature("b").unwrap();
        let index = store.push_annotation(Annotation::new(
            AnnotationType::Point,
            vec![Point2::new(1.0, 1.0)],
            GroupId::NONE,
        ));
        store.annotation_mut(index).unwrap().set_feature_value(0, 2.0);
        assert!(store.delete_feature(first));
        assert_eq!(store.feature_count(), 1);
        assert_eq!(store.feature(0).unwrap().name, "b");
        assert_eq!(store.annotation(index).unwrap().feature_value(0), Some(0.0));
        assert_eq!(store.find_feature_by_name("b"), Some(0));
    }

    #[test]
    fn feature_vector_width_is_capped() {
        let mut store = AnnotationStore::new(Vector2::new(1.0, 1.0));
        for i in 0..MAX_FEATURES {
            assert!(store.add_feature(format!("f{i}")).is_some());
        }
        assert!(store.add_feature("overflow").is_none());
    }

    #[test]
    fn bulk_delete_keeps_active_indices_unique_and_valid() {
        let mut store = AnnotationStore::new(Vector2::new(1.0, 1.0));
        for i in 0..6 {
            let mut annotation = Annotation::new(
                AnnotationType::Point,
                vec![Point2::new(i as f64, 0.0)],
                GroupId::NONE,
            );
            annotation.is_selected = i % 2 == 0;
            store.push_annotation(annotation);
        }
        assert_eq!(store.delete_selected_annotations(), 3);
        assert_eq!(store.annotation_count(), 3);
        assert_eq!(store.stored_annotation_count(), 6);
        let xs: Vec<f64> = store
            .annotations()
            .map(|(_, ann)| ann.coordinates()[0].x())
            .collect();
        assert_eq!(xs, vec![1.0, 3.0, 5.0]);

        assert!(store.move_annotation(2, 0));
        assert_eq!(store.annotation(0).unwrap().coordinates()[0].x(), 5.0);
        assert!(!store.delete_annotation(3));
        assert!(store.delete_annotation(0));
        assert_eq!(store.annotation_count(), 2);
    }

    #[test]
    fn hidden_group_hides_its_annotations() {
        let mut store = AnnotationStore::new(Vector2::new(1.0, 1.0));
        let group = store.add_group("Stroma");
        let id = store.group_id(group).unwrap();
        let index = store.push_annotation(Annotation::new(
            AnnotationType::Point,
            vec![Point2::new(0.0, 0.0)],
            id,
        ));
        assert!(!store.is_annotation_hidden(index));
        store.set_group_hidden(group, true);
        assert!(store.is_annotation_hidden(index));
    }

    #[test]
    fn mpp_conversion_round_trips() {
        let store = AnnotationStore::new(Vector2::new(0.25, 0.5));
        let world = store.pixel_to_world(Point2::new(10.0, 20.0));
        assert_eq!(world, Point2::new(2.5, 10.0));
        assert_eq!(store.world_to_pixel(world), Point2::new(10.0, 20.0));
        let fallback = AnnotationStore::new(Vector2::new(0.0, f64::NAN));
        assert_eq!(fallback.mpp(), Vector2::new(1.0, 1.0));
    }

    #[test]
    fn modification_tracking_follows_saved_generation() {
        let mut set = AnnotationSet::default();
        assert!(!set.is_modified());
        set.mark_modified();
        assert!(set.is_modified());
        assert!(set.last_modified().is_some());

        let snapshot = set.snapshot();
        set.mark_modified();
        set.save_state().record_saved(snapshot.generation);
        assert!(set.is_modified(), "快照之后的修改仍需保存");
        set.save_state().record_saved(set.generation());
        assert!(!set.is_modified());
    }

    #[test]
    fn reinit_restores_single_none_group() {
        let mut set = AnnotationSet::default();
        set.store_mut().add_group("Tumor");
        set.store_mut().push_annotation(Annotation::new(
            AnnotationType::Point,
            vec![Point2::new(0.0, 0.0)],
            GroupId::NONE,
        ));
        set.edit.is_edit_mode = true;
        set.mark_modified();

        set.unload_and_reinit_annotations();
        assert_eq!(set.store().group_count(), 1);
        assert_eq!(set.store().group(0).unwrap().name, "None");
        assert_eq!(set.store().annotation_count(), 0);
        assert!(!set.edit.is_edit_mode);
        assert!(!set.is_modified());
    }

    #[test]
    fn deleting_annotation_shifts_edit_pointers() {
        let mut set = AnnotationSet::default();
        for i in 0..3 {
            set.store_mut().push_annotation(Annotation::new(
                AnnotationType::Point,
                vec![Point2::new(i as f64, 0.0)],
                GroupId::NONE,
            ));
        }
        set.edit.editing_annotation = Some(2);
        set.edit.selected_coordinate = Some(CoordinateRef {
            annotation: 1,
            coordinate: 0,
        });
        assert!(set.delete_annotation(0));
        assert_eq!(set.edit.editing_annotation, Some(1));
        assert_eq!(set.edit.selected_coordinate.map(|c| c.annotation), Some(0));
        assert!(set.delete_annotation(0));
        assert!(set.edit.selected_coordinate.is_none());
        assert!(set.is_modified());
    }

    #[test]
    fn save_claim_is_exclusive() {
        let set = AnnotationSet::default();
        let state = Arc::clone(set.save_state());
        let claim = state.try_claim().expect("首次抢占应成功");
        assert!(state.is_saving());
        assert!(state.try_claim().is_none());
        drop(claim);
        assert!(!state.is_saving());
        assert!(state.try_claim().is_some());
    }

    fn set_with_points(count: usize) -> AnnotationSet {
        let mut set = AnnotationSet::default();
        for i in 0..count {
            set.store_mut().push_annotation(Annotation::new(
                AnnotationType::Point,
                vec![Point2::new(i as f64, 0.0)],
                GroupId::NONE,
            ));
        }
        set
    }

    #[test]
    fn bulk_delete_remaps_edit_pointers() {
        let mut set = set_with_points(4);
        set.edit.editing_annotation = Some(3);
        set.edit.selected_coordinate = Some(CoordinateRef {
            annotation: 2,
            coordinate: 0,
        });
        for index in [0, 1] {
            set.store_mut().annotation_mut(index).unwrap().is_selected = true;
        }
        assert_eq!(set.delete_selected_annotations(), 2);
        assert_eq!(set.edit.editing_annotation, Some(1));
        assert_eq!(
            set.edit.selected_coordinate,
            Some(CoordinateRef {
                annotation: 0,
                coordinate: 0,
            })
        );

        set.store_mut().annotation_mut(1).unwrap().is_selected = true;
        assert_eq!(set.delete_selected_annotations(), 1);
        assert_eq!(set.edit.editing_annotation, None);
        assert_eq!(set.edit.selected_coordinate.map(|c| c.annotation), Some(0));
    }

    #[test]
    fn moving_annotation_follows_edit_pointers_and_marks_modified() {
        let mut set = set_with_points(3);
        set.edit.selected_coordinate = Some(CoordinateRef {
            annotation: 0,
            coordinate: 0,
        });
        set.edit.editing_annotation = Some(2);
        let generation = set.generation();

        assert!(set.move_annotation(1, 0));
        assert_eq!(set.edit.selected_coordinate.map(|c| c.annotation), Some(1));
        assert_eq!(set.edit.editing_annotation, Some(2));
        assert_eq!(set.store().annotation(0).unwrap().coordinates(), &[Point2::new(1.0, 0.0)]);
        assert!(set.generation() > generation);

        assert!(set.move_annotation(0, 2));
        assert_eq!(set.edit.selected_coordinate.map(|c| c.annotation), Some(0));
        assert_eq!(set.edit.editing_annotation, Some(1));
        assert!(!set.move_annotation(0, 3));

        let generation = set.generation();
        set.store_mut().add_group("A");
        assert!(set.move_group(1, 0));
        assert!(set.generation() > generation);
    }

    #[test]
    fn moved_index_matches_vec_reordering() {
        for from in 0..4 {
            for to in 0..4 {
                let mut order: Vec<usize> = (0..4).collect();
                assert!(move_index(&mut order, from, to));
                for (new_position, old) in order.iter().enumerate() {
                    assert_eq!(moved_index(*old, from, to), new_position);
                }
            }
        }
    }

    #[test]
    fn pushing_coordinates_reinfers_type() {
        let mut annotation =
            Annotation::new(AnnotationType::Point, vec![Point2::new(0.0, 0.0)], GroupId::NONE);
        annotation.push_coordinate(Point2::new(1.0, 0.0));
        assert_eq!(annotation.annotation_type, AnnotationType::Line);
        annotation.push_coordinate(Point2::new(1.0, 1.0));
        assert_eq!(annotation.annotation_type, AnnotationType::Polygon);
        assert_eq!(annotation.coordinate_count(), 3);
    }

    #[test]
    fn dropping_set_waits_for_running_save() {
        use std::sync::atomic::AtomicBool;
        use std::sync::mpsc;

        let set = AnnotationSet::default();
        let state = Arc::clone(set.save_state());
        let released = Arc::new(AtomicBool::new(false));
        let (claimed_tx, claimed_rx) = mpsc::channel();

        let worker = {
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let claim = state.try_claim().expect("后台保存应能抢到标志");
                claimed_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                released.store(true, Ordering::SeqCst);
                drop(claim);
            })
        };

        claimed_rx.recv().unwrap();
        drop(set);
        assert!(released.load(Ordering::SeqCst));
        worker.join().unwrap();
    }
}
