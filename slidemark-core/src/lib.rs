pub mod annotation;
pub mod cache;

pub mod geometry {
    use std::f64::consts::TAU;

    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 二维点（世界坐标，单位为微米），内部以 `glam::DVec2` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point2) -> Vector2 {
            Vector2(other.0 - self.0)
        }

        #[inline]
        pub fn distance_squared(self, other: Point2) -> f64 {
            self.0.distance_squared(other.0)
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量，也用于表示 mpp（x/y 两个方向的像素尺寸）。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_points(start: Point2, end: Point2) -> Self {
            Self(end.0 - start.0)
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }

        #[inline]
        pub fn dot(self, other: Vector2) -> f64 {
            self.0.dot(other.0)
        }

        /// 二维叉积（z 分量），正值表示 `other` 位于左侧。
        #[inline]
        pub fn cross(self, other: Vector2) -> f64 {
            self.0.perp_dot(other.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框。空框的 min/max 互相颠倒，任何点都不会落在其中。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        /// 由两个任意角点构造规范化后的边界框（拖框选择时使用）。
        pub fn from_corners(a: Point2, b: Point2) -> Self {
            Self {
                min: Point2::from_vec(a.as_vec2().min(b.as_vec2())),
                max: Point2::from_vec(a.as_vec2().max(b.as_vec2())),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            let min_vec = self.min.as_vec2().min(point.as_vec2());
            let max_vec = self.max.as_vec2().max(point.as_vec2());
            self.min = Point2::from_vec(min_vec);
            self.max = Point2::from_vec(max_vec);
        }

        pub fn include_bounds(&mut self, other: &Bounds2D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        /// 向四周扩张 `margin`，空框保持为空。
        pub fn expanded(&self, margin: f64) -> Self {
            if self.is_empty() {
                return *self;
            }
            let offset = DVec2::splat(margin);
            Self {
                min: Point2::from_vec(self.min.as_vec2() - offset),
                max: Point2::from_vec(self.max.as_vec2() + offset),
            }
        }

        #[inline]
        pub fn contains(&self, point: Point2) -> bool {
            point.x() >= self.min.x()
                && point.x() <= self.max.x()
                && point.y() >= self.min.y()
                && point.y() <= self.max.y()
        }

        /// `other` 是否完整落在当前框内。
        pub fn contains_bounds(&self, other: &Bounds2D) -> bool {
            !other.is_empty() && self.contains(other.min) && self.contains(other.max)
        }
    }

    /// 点到折线的最近投影结果。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct PolylineProjection {
        /// 最近边的起点下标；在此下标之后插入即可把投影点放到该边上。
        pub insert_after: usize,
        pub projected: Point2,
        /// 投影点在边上的参数位置，已限制到 [0, 1]。
        pub t: f64,
        pub distance: f64,
    }

    /// 把 `point` 投影到折线上，返回距离最近的边。`closed` 为真时额外检查首尾相连的边。
    ///
    /// 多条边距离相同时取遍历顺序中的第一条。
    pub fn project_point_onto_polyline(
        point: Point2,
        coords: &[Point2],
        closed: bool,
    ) -> Option<PolylineProjection> {
        match coords {
            [] => None,
            [only] => Some(PolylineProjection {
                insert_after: 0,
                projected: *only,
                t: 0.0,
                distance: point.distance(*only),
            }),
            _ => {
                let count = coords.len();
                let edge_count = if closed { count } else { count - 1 };
                let mut best: Option<(f64, PolylineProjection)> = None;
                for index in 0..edge_count {
                    let start = coords[index];
                    let end = coords[(index + 1) % count];
                    let (projected, t) = project_onto_segment(point, start, end);
                    let distance_sq = point.distance_squared(projected);
                    let improves = match &best {
                        Some((best_sq, _)) => distance_sq < *best_sq,
                        None => true,
                    };
                    if improves {
                        best = Some((
                            distance_sq,
                            PolylineProjection {
                                insert_after: index,
                                projected,
                                t,
                                distance: distance_sq.sqrt(),
                            },
                        ));
                    }
                }
                best.map(|(_, projection)| projection)
            }
        }
    }

    fn project_onto_segment(point: Point2, start: Point2, end: Point2) -> (Point2, f64) {
        let edge = Vector2::from_points(start, end);
        let length_sq = edge.length_squared();
        if length_sq <= f64::EPSILON {
            return (start, 0.0);
        }
        let t = (start.vector_to(point).dot(edge) / length_sq).clamp(0.0, 1.0);
        (Point2::from_vec(start.as_vec2() + edge.as_vec2() * t), t)
    }

    /// 鞋带公式计算的有向面积，逆时针为正。
    pub fn polygon_signed_area(coords: &[Point2]) -> f64 {
        if coords.len() < 3 {
            return 0.0;
        }
        let mut sum = 0.0;
        for (index, current) in coords.iter().enumerate() {
            let next = coords[(index + 1) % coords.len()];
            sum += current.x() * next.y() - next.x() * current.y();
        }
        sum * 0.5
    }

    #[inline]
    pub fn polygon_area(coords: &[Point2]) -> f64 {
        polygon_signed_area(coords).abs()
    }

    pub fn polygon_bounds(coords: &[Point2]) -> Bounds2D {
        let mut bounds = Bounds2D::empty();
        for point in coords {
            bounds.include_point(*point);
        }
        bounds
    }

    pub type Triangle = [Point2; 3];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TriangulationError {
        TooFewVertices(usize),
        /// 连续 2×剩余顶点数 次尝试都没有找到耳朵，通常意味着多边形自相交。
        Stalled { remaining: usize },
    }

    impl std::fmt::Display for TriangulationError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TriangulationError::TooFewVertices(count) => {
                    write!(f, "三角剖分至少需要 3 个顶点（实际 {count} 个）")
                }
                TriangulationError::Stalled { remaining } => {
                    write!(f, "耳切法在剩余 {remaining} 个顶点时停滞")
                }
            }
        }
    }

    impl std::error::Error for TriangulationError {}

    /// 耳切法三角剖分。先按有向面积把环绕方向统一为逆时针，再逐个剪掉耳朵。
    pub fn triangulate(coords: &[Point2]) -> Result<Vec<Triangle>, TriangulationError> {
        let count = coords.len();
        if count < 3 {
            return Err(TriangulationError::TooFewVertices(count));
        }

        let mut remaining: Vec<usize> = (0..count).collect();
        if polygon_signed_area(coords) < 0.0 {
            remaining.reverse();
        }

        let mut triangles = Vec::with_capacity(count - 2);
        let mut cursor = 0usize;
        let mut attempts = 0usize;
        while remaining.len() > 3 {
            let len = remaining.len();
            if attempts >= 2 * len {
                return Err(TriangulationError::Stalled { remaining: len });
            }
            let prev = remaining[(cursor + len - 1) % len];
            let curr = remaining[cursor];
            let next = remaining[(cursor + 1) % len];
            if is_ear(coords, &remaining, prev, curr, next) {
                triangles.push([coords[prev], coords[curr], coords[next]]);
                remaining.remove(cursor);
                if cursor >= remaining.len() {
                    cursor = 0;
                }
                attempts = 0;
            } else {
                cursor = (cursor + 1) % len;
                attempts += 1;
            }
        }
        triangles.push([
            coords[remaining[0]],
            coords[remaining[1]],
            coords[remaining[2]],
        ]);
        Ok(triangles)
    }

    fn is_ear(coords: &[Point2], remaining: &[usize], prev: usize, curr: usize, next: usize) -> bool {
        let a = coords[prev];
        let b = coords[curr];
        let c = coords[next];
        if a.vector_to(b).cross(b.vector_to(c)) <= 0.0 {
            return false;
        }
        remaining
            .iter()
            .filter(|&&index| index != prev && index != curr && index != next)
            .map(|&index| coords[index])
            .filter(|p| *p != a && *p != b && *p != c)
            .all(|p| !point_in_triangle(p, a, b, c))
    }

    fn point_in_triangle(p: Point2, a: Point2, b: Point2, c: Point2) -> bool {
        a.vector_to(b).cross(a.vector_to(p)) >= 0.0
            && b.vector_to(c).cross(b.vector_to(p)) >= 0.0
            && c.vector_to(a).cross(c.vector_to(p)) >= 0.0
    }

    pub const ELLIPSE_SEGMENTS: usize = 64;

    /// 椭圆以中心点与外接矩形的一个角点表示，两轴与坐标轴对齐。
    #[inline]
    pub fn ellipse_radii(center: Point2, corner: Point2) -> Vector2 {
        Vector2::new((corner.x() - center.x()).abs(), (corner.y() - center.y()).abs())
    }

    pub fn ellipse_outline(center: Point2, corner: Point2, segments: usize) -> Vec<Point2> {
        let radii = ellipse_radii(center, corner);
        let segments = segments.max(3);
        (0..segments)
            .map(|step| {
                let angle = TAU * step as f64 / segments as f64;
                Point2::new(
                    center.x() + radii.x() * angle.cos(),
                    center.y() + radii.y() * angle.sin(),
                )
            })
            .collect()
    }

}

pub mod color {
    use std::fmt;

    use serde::{Deserialize, Serialize};

    /// 8 位 RGB 颜色，文件中以 `#rrggbb` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Rgb8 {
        pub r: u8,
        pub g: u8,
        pub b: u8,
    }

    /// 新建分组时按顺序轮换的默认颜色。
    pub const DEFAULT_PALETTE: [Rgb8; 8] = [
        Rgb8::new(0, 200, 0),
        Rgb8::new(220, 40, 40),
        Rgb8::new(40, 90, 230),
        Rgb8::new(230, 160, 0),
        Rgb8::new(150, 60, 200),
        Rgb8::new(0, 180, 190),
        Rgb8::new(230, 90, 170),
        Rgb8::new(120, 120, 120),
    ];

    impl Rgb8 {
        pub const fn new(r: u8, g: u8, b: u8) -> Self {
            Self { r, g, b }
        }

        /// 解析 `#rrggbb`（允许省略 `#`，大小写不敏感）。
        pub fn parse_hex(raw: &str) -> Option<Self> {
            let hex = raw.trim();
            let hex = hex.strip_prefix('#').unwrap_or(hex);
            if hex.len() != 6 || !hex.is_ascii() {
                return None;
            }
            let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
            Some(Self {
                r: channel(0..2)?,
                g: channel(2..4)?,
                b: channel(4..6)?,
            })
        }

        #[inline]
        pub fn palette(index: usize) -> Self {
            DEFAULT_PALETTE[index % DEFAULT_PALETTE.len()]
        }
    }

    impl fmt::Display for Rgb8 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        }
    }

}
