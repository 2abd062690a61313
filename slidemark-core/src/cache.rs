//! 标注派生值（包围盒、面积、三角剖分、非零特征数）的按需缓存。

use crate::geometry::{Bounds2D, Triangle};

/// 单个派生值的缓存槽。
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Stale,
    Valid(T),
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Cached::Stale
    }
}

impl<T> Cached<T> {
    #[inline]
    pub fn is_valid(&self) -> bool {
        matches!(self, Cached::Valid(_))
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        match self {
            Cached::Valid(value) => Some(value),
            Cached::Stale => None,
        }
    }

    /// 缓存失效时调用 `compute` 重新计算并写回。
    pub fn get_or_compute(&mut self, compute: impl FnOnce() -> T) -> &T {
        if let Cached::Stale = self {
            *self = Cached::Valid(compute());
        }
        match self {
            Cached::Valid(value) => value,
            Cached::Stale => unreachable!("cache slot was just filled"),
        }
    }

    /// 标记为失效，返回此前的有效值。
    #[inline]
    pub fn invalidate(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Cached::Valid(value) => Some(value),
            Cached::Stale => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKind {
    Bounds,
    Area,
    Tessellation,
    NonzeroFeatureCount,
}

/// 各派生值是否有效的快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidityMask {
    pub bounds: bool,
    pub area: bool,
    pub tessellation: bool,
    pub nonzero_feature_count: bool,
}

impl ValidityMask {
    pub fn contains(&self, kind: DerivedKind) -> bool {
        match kind {
            DerivedKind::Bounds => self.bounds,
            DerivedKind::Area => self.area,
            DerivedKind::Tessellation => self.tessellation,
            DerivedKind::NonzeroFeatureCount => self.nonzero_feature_count,
        }
    }
}

/// 三角剖分失败（自相交等）时记为 `None`，只影响填充绘制。
pub type Tessellation = Option<Vec<Triangle>>;

#[derive(Debug, Clone, Default)]
pub struct DerivedCache {
    pub(crate) bounds: Cached<Bounds2D>,
    pub(crate) area: Cached<f64>,
    pub(crate) tessellation: Cached<Tessellation>,
    pub(crate) nonzero_feature_count: Cached<usize>,
    fallback: ValidityMask,
    fallback_tessellation: Option<Vec<Triangle>>,
}

impl DerivedCache {
    /// 坐标变化后调用：包围盒、面积、三角剖分全部失效。
    /// 上一次成功的剖分结果保留为回退值，拖拽期间限速重算时继续用于绘制。
    pub fn invalidate_geometry(&mut self) {
        self.bounds.invalidate();
        self.area.invalidate();
        if let Some(Some(triangles)) = self.tessellation.invalidate() {
            self.fallback_tessellation = Some(triangles);
        }
    }

    pub fn invalidate_features(&mut self) {
        self.nonzero_feature_count.invalidate();
    }

    pub fn invalidate_all(&mut self) {
        self.invalidate_geometry();
        self.invalidate_features();
    }

    pub fn validity(&self) -> ValidityMask {
        ValidityMask {
            bounds: self.bounds.is_valid(),
            area: self.area.is_valid(),
            tessellation: self.tessellation.is_valid(),
            nonzero_feature_count: self.nonzero_feature_count.is_valid(),
        }
    }

    #[inline]
    pub fn is_valid(&self, kind: DerivedKind) -> bool {
        self.validity().contains(kind)
    }

    /// 上一帧结束时的有效位。
    #[inline]
    pub fn fallback_mask(&self) -> ValidityMask {
        self.fallback
    }

    /// 帧边界：记录当前有效位作为下一帧的回退掩码。
    pub fn roll_frame(&mut self) {
        self.fallback = self.validity();
        if self.fallback.tessellation {
            self.fallback_tessellation = None;
        }
    }

    /// 最近一次被失效掉的剖分结果。
    pub fn fallback_tessellation(&self) -> Option<&[Triangle]> {
        self.fallback_tessellation.as_deref()
    }
}
