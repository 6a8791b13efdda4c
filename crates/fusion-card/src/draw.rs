//! Drawing and blitting primitives.
//!
//! Each primitive follows the same path: clip precheck, acceleration
//! check + acquisition, driver dispatch until it refuses, then software
//! fallback for whatever remains. Matrix-transformed primitives are
//! rewritten (axis-aligned fast path) or triangulated before the software
//! stage.

use crate::state::{AccelMask, CardState, RenderOptions, StateModified};
use crate::{CardCapsFlags, GraphicsCore};
use fusion_surface::{Line, Point, Rectangle, Triangle};
use tracing::trace;

/// 16.16 fixed-point transform of a point, affine or projective. The
/// projective path saturates when `w` collapses to zero.
fn transform(x: &mut i32, y: &mut i32, m: &[i32; 9], affine: bool) {
    let (tx, ty);
    if affine {
        tx = ((*x as i64 * m[0] as i64 + *y as i64 * m[1] as i64 + m[2] as i64 + 0x8000) >> 16)
            as i32;
        ty = ((*x as i64 * m[3] as i64 + *y as i64 * m[4] as i64 + m[5] as i64 + 0x8000) >> 16)
            as i32;
    } else {
        let px = *x as i64 * m[0] as i64 + *y as i64 * m[1] as i64 + m[2] as i64;
        let py = *x as i64 * m[3] as i64 + *y as i64 * m[4] as i64 + m[5] as i64;
        let w = *x as i64 * m[6] as i64 + *y as i64 * m[7] as i64 + m[8] as i64;
        if w == 0 {
            tx = if px < 0 { -0x7fff_ffff } else { 0x7fff_ffff };
            ty = if py < 0 { -0x7fff_ffff } else { 0x7fff_ffff };
        } else {
            tx = (px / w) as i32;
            ty = (py / w) as i32;
        }
    }
    *x = tx;
    *y = ty;
}

/// Digital differential analyzer along one triangle edge.
#[derive(Default, Clone, Copy)]
struct Dda {
    xi: i32,
    xf: i32,
    mi: i32,
    mf: i32,
    _2dy: i32,
}

impl Dda {
    fn setup(xs: i32, ys: i32, xe: i32, ye: i32) -> Dda {
        let dx = xe - xs;
        let dy = ye - ys;
        if dy == 0 {
            return Dda {
                xi: xs,
                ..Dda::default()
            };
        }
        let mut dda = Dda {
            xi: xs,
            mi: dx / dy,
            mf: 2 * (dx % dy),
            xf: -dy,
            _2dy: 2 * dy,
        };
        if dda.mf < 0 {
            dda.mf += 2 * dy.abs();
            dda.mi -= 1;
        }
        dda
    }

    fn step(&mut self) {
        self.xi += self.mi;
        self.xf += self.mf;
        if self.xf > 0 {
            self.xi += 1;
            self.xf -= self._2dy;
        }
    }
}

impl GraphicsCore {
    /// Fill a batch of rectangles.
    pub fn fill_rectangles(&self, state: &mut CardState, rects: &[Rectangle]) {
        if rects.is_empty() {
            return;
        }
        trace!(target: "fusion.card", count = rects.len(), "fill rectangles");

        let with_matrix = state.render_options.contains(RenderOptions::MATRIX);

        // Skip leading rectangles outside the clip.
        let mut i = 0;
        if !with_matrix {
            while i < rects.len() && !rects[i].intersects(&state.clip) {
                i += 1;
            }
            if i == rects.len() {
                return;
            }
        }

        if self.state_check_acquire(state, AccelMask::FILLRECTANGLE) {
            let driver = self.driver().cloned().unwrap();
            let caps = driver.caps();
            let limits = driver.limits();

            while i < rects.len() {
                if !with_matrix && !rects[i].intersects(&state.clip) {
                    i += 1;
                    continue;
                }
                let mut rect = rects[i];

                if rect.w > limits.dst_max_w || rect.h > limits.dst_max_h {
                    rect.clip_to(&state.clip);
                    if rect.w > limits.dst_max_w || rect.h > limits.dst_max_h {
                        trace!(target: "fusion.card", "driver limits prevent hw operation");
                        break;
                    }
                } else if !caps.flags.contains(CardCapsFlags::CLIPPING)
                    && !caps.clip.contains(AccelMask::FILLRECTANGLE)
                {
                    rect.clip_to(&state.clip);
                }

                if !driver.fill_rectangle(&rect) {
                    trace!(target: "fusion.card", "driver refused, falling back");
                    break;
                }
                i += 1;
            }

            self.state_release(state);
        }

        if i < rects.len() {
            self.fill_rectangles_software(state, &rects[i..]);
        }
    }

    fn fill_rectangles_software(&self, state: &mut CardState, rects: &[Rectangle]) {
        let with_matrix = state.render_options.contains(RenderOptions::MATRIX);
        let software = self.software().clone();

        if !with_matrix {
            if software.acquire(state, AccelMask::FILLRECTANGLE) {
                for rect in rects {
                    let mut rect = *rect;
                    if rect.clip_to(&state.clip) {
                        software.fill_rectangle(state, &rect);
                    }
                }
                software.release(state);
            }
        } else if state.matrix[1] == 0 && state.matrix[3] == 0 {
            // Scaled/translated only: transform to axis-aligned rects and
            // re-enter with the matrix option cleared.
            let mut transformed = Vec::with_capacity(rects.len());
            for rect in rects {
                let (mut x1, mut y1) = (rect.x, rect.y);
                let (mut x2, mut y2) = (rect.x + rect.w, rect.y + rect.h);
                transform(&mut x1, &mut y1, &state.matrix, state.affine_matrix);
                transform(&mut x2, &mut y2, &state.matrix, state.affine_matrix);
                let mut rect = Rectangle::new(
                    x1.min(x2),
                    y1.min(y2),
                    (x2 - x1).abs(),
                    (y2 - y1).abs(),
                );
                if rect.clip_to(&state.clip) {
                    transformed.push(rect);
                }
            }
            if !transformed.is_empty() {
                state.render_options.remove(RenderOptions::MATRIX);
                state.modified |= StateModified::RENDER_OPTIONS;

                self.fill_rectangles(state, &transformed);

                state.render_options.insert(RenderOptions::MATRIX);
                state.modified |= StateModified::RENDER_OPTIONS;
            }
        } else {
            // Rotated rectangles: split into triangles.
            if software.acquire(state, AccelMask::FILLRECTANGLE) {
                for rect in rects {
                    for corners in [
                        [
                            (rect.x, rect.y),
                            (rect.x + rect.w, rect.y),
                            (rect.x + rect.w, rect.y + rect.h),
                        ],
                        [
                            (rect.x, rect.y),
                            (rect.x + rect.w, rect.y + rect.h),
                            (rect.x, rect.y + rect.h),
                        ],
                    ] {
                        let mut tri = Triangle {
                            x1: corners[0].0,
                            y1: corners[0].1,
                            x2: corners[1].0,
                            y2: corners[1].1,
                            x3: corners[2].0,
                            y3: corners[2].1,
                        };
                        transform(&mut tri.x1, &mut tri.y1, &state.matrix, state.affine_matrix);
                        transform(&mut tri.x2, &mut tri.y2, &state.matrix, state.affine_matrix);
                        transform(&mut tri.x3, &mut tri.y3, &state.matrix, state.affine_matrix);
                        tri.sort();
                        if tri.y3 - tri.y1 > 0 {
                            self.fill_tri(&tri, state, false);
                        }
                    }
                }
                software.release(state);
            }
        }
    }

    /// Outline a rectangle. A driver with DRAWRECTANGLE acceleration gets
    /// the whole shape; otherwise it decomposes into four fills (two
    /// full-width spans, two side bars).
    pub fn draw_rectangle(&self, state: &mut CardState, rect: &Rectangle) {
        if rect.is_empty() {
            return;
        }
        if !state.render_options.contains(RenderOptions::MATRIX)
            && !rect.intersects(&state.clip)
        {
            return;
        }

        if self.state_check_acquire(state, AccelMask::DRAWRECTANGLE) {
            let driver = self.driver().cloned().unwrap();
            let done = driver.draw_rectangle(rect);
            self.state_release(state);
            if done {
                return;
            }
        }

        // Decompose: top, bottom, left, right.
        let mut parts = Vec::with_capacity(4);
        parts.push(Rectangle::new(rect.x, rect.y, rect.w, 1));
        if rect.h > 1 {
            parts.push(Rectangle::new(rect.x, rect.y + rect.h - 1, rect.w, 1));
        }
        if rect.h > 2 {
            parts.push(Rectangle::new(rect.x, rect.y + 1, 1, rect.h - 2));
            if rect.w > 1 {
                parts.push(Rectangle::new(
                    rect.x + rect.w - 1,
                    rect.y + 1,
                    1,
                    rect.h - 2,
                ));
            }
        }
        self.fill_rectangles(state, &parts);
    }

    /// Fill triangles. Hardware triangle support is used when present;
    /// otherwise each triangle runs as DDA scanline spans through the
    /// rectangle path (hardware fills if FILLRECTANGLE is accelerated,
    /// software spans otherwise).
    pub fn fill_triangles(&self, state: &mut CardState, tris: &[Triangle]) {
        let with_matrix = state.render_options.contains(RenderOptions::MATRIX);

        let mut sorted = Vec::with_capacity(tris.len());
        for tri in tris {
            let mut tri = *tri;
            if with_matrix {
                transform(&mut tri.x1, &mut tri.y1, &state.matrix, state.affine_matrix);
                transform(&mut tri.x2, &mut tri.y2, &state.matrix, state.affine_matrix);
                transform(&mut tri.x3, &mut tri.y3, &state.matrix, state.affine_matrix);
            }
            tri.sort();
            // A triangle flattened onto one row draws zero rows.
            if tri.y3 - tri.y1 > 0 {
                sorted.push(tri);
            }
        }
        if sorted.is_empty() {
            return;
        }

        let mut i = 0;
        if self.state_check_acquire(state, AccelMask::FILLTRIANGLE) {
            let driver = self.driver().cloned().unwrap();
            while i < sorted.len() {
                if !driver.fill_triangle(&sorted[i]) {
                    break;
                }
                i += 1;
            }
            self.state_release(state);
        }

        while i < sorted.len() {
            if self.state_check_acquire(state, AccelMask::FILLRECTANGLE) {
                self.fill_tri(&sorted[i], state, true);
                self.state_release(state);
            } else {
                let software = self.software().clone();
                if software.acquire(state, AccelMask::FILLRECTANGLE) {
                    self.fill_tri(&sorted[i], state, false);
                    software.release(state);
                }
            }
            i += 1;
        }
    }

    /// Scanline triangle fill; vertices must be y-sorted. Each span is
    /// clipped and dispatched as a one-row rectangle.
    fn fill_tri(&self, tri: &Triangle, state: &CardState, accelerated: bool) {
        let clip_x1 = state.clip.x1;
        let clip_x2 = state.clip.x2;

        let mut y = tri.y1;
        let yend = tri.y3.min(state.clip.y2);

        let mut dda1 = Dda::setup(tri.x1, tri.y1, tri.x3, tri.y3);
        let mut dda2 = Dda::setup(tri.x1, tri.y1, tri.x2, tri.y2);

        while y <= yend {
            if y == tri.y2 {
                if tri.y2 == tri.y3 {
                    return;
                }
                dda2 = Dda::setup(tri.x2, tri.y2, tri.x3, tri.y3);
            }

            let mut w = (dda1.xi - dda2.xi).abs();
            let mut x = dda1.xi.min(dda2.xi);

            if clip_x2 < x + w {
                w = clip_x2 - x + 1;
            }
            if w > 0 {
                if clip_x1 > x {
                    w -= clip_x1 - x;
                    x = clip_x1;
                }
                if w > 0 && y >= state.clip.y1 {
                    let span = Rectangle::new(x, y, w, 1);
                    if accelerated {
                        if let Some(driver) = self.driver() {
                            driver.fill_rectangle(&span);
                        }
                    } else {
                        self.software().fill_rectangle(state, &span);
                    }
                }
            }

            dda1.step();
            dda2.step();
            y += 1;
        }
    }

    /// Draw a batch of line segments. The hardware gets pre-clipped
    /// segments unless it clips itself; refused or unaccelerated segments
    /// walk pixel steps as one-pixel spans through the software seam.
    pub fn draw_lines(&self, state: &mut CardState, lines: &[Line]) {
        if lines.is_empty() {
            return;
        }
        trace!(target: "fusion.card", count = lines.len(), "draw lines");

        let with_matrix = state.render_options.contains(RenderOptions::MATRIX);

        // Hardware sees the lines as given (a matrix-capable accelerator
        // applies the transform itself); only the software fallback
        // transforms up front.
        let mut i = 0;
        if self.state_check_acquire(state, AccelMask::DRAWLINE) {
            let driver = self.driver().cloned().unwrap();
            let caps = driver.caps();

            while i < lines.len() {
                let mut line = lines[i];
                if !with_matrix
                    && !caps.flags.contains(CardCapsFlags::CLIPPING)
                    && !caps.clip.contains(AccelMask::DRAWLINE)
                    && !line.clip_to(&state.clip)
                {
                    i += 1;
                    continue;
                }
                if !driver.draw_line(&line) {
                    break;
                }
                i += 1;
            }

            self.state_release(state);
        }

        if i < lines.len() {
            let software = self.software().clone();
            if software.acquire(state, AccelMask::DRAWLINE) {
                for line in &lines[i..] {
                    let mut line = *line;
                    if with_matrix {
                        transform(&mut line.x1, &mut line.y1, &state.matrix, state.affine_matrix);
                        transform(&mut line.x2, &mut line.y2, &state.matrix, state.affine_matrix);
                    }
                    if line.clip_to(&state.clip) {
                        draw_line_spans(&*software, state, &line);
                    }
                }
                software.release(state);
            }
        }
    }

    /// Stretch-blit one source rectangle onto one destination rectangle.
    pub fn stretch_blit(&self, state: &mut CardState, src: &Rectangle, dst: &Rectangle) {
        if src.is_empty() || dst.is_empty() {
            return;
        }
        if !state.render_options.contains(RenderOptions::MATRIX) && !dst.intersects(&state.clip) {
            return;
        }

        if self.state_check_acquire(state, AccelMask::STRETCHBLIT) {
            let driver = self.driver().cloned().unwrap();
            let done = driver.stretch_blit(src, dst);
            self.state_release(state);
            if done {
                return;
            }
        }

        let software = self.software().clone();
        if software.acquire(state, AccelMask::STRETCHBLIT) {
            software.stretch_blit(state, src, dst);
            software.release(state);
        }
    }

    /// Blit a batch of rectangles from the source to destination points.
    pub fn blit(&self, state: &mut CardState, rects: &[Rectangle], points: &[Point]) {
        debug_assert_eq!(rects.len(), points.len());
        if rects.is_empty() {
            return;
        }
        trace!(target: "fusion.card", count = rects.len(), "blit");

        let mut i = 0;
        if self.state_check_acquire(state, AccelMask::BLIT) {
            let driver = self.driver().cloned().unwrap();
            let caps = driver.caps();

            while i < rects.len() {
                let mut rect = rects[i];
                let mut point = points[i];

                if !caps.flags.contains(CardCapsFlags::CLIPPING)
                    && !caps.clip.contains(AccelMask::BLIT)
                    && !clip_blit(&state.clip, &mut rect, &mut point)
                {
                    i += 1;
                    continue;
                }

                if !driver.blit(&rect, point.x, point.y) {
                    break;
                }
                i += 1;
            }

            self.state_release(state);
        }

        if i < rects.len() {
            let software = self.software().clone();
            if software.acquire(state, AccelMask::BLIT) {
                for (rect, point) in rects[i..].iter().zip(&points[i..]) {
                    let mut rect = *rect;
                    let mut point = *point;
                    if clip_blit(&state.clip, &mut rect, &mut point) {
                        software.blit(state, &rect, point.x, point.y);
                    }
                }
                software.release(state);
            }
        }
    }

    /// Two-source blit; no software fallback exists for it.
    pub fn blit2(&self, state: &mut CardState, rect: &Rectangle, dx: i32, dy: i32, sx2: i32, sy2: i32) {
        if self.state_check_acquire(state, AccelMask::BLIT2) {
            let driver = self.driver().cloned().unwrap();
            driver.blit2(rect, dx, dy, sx2, sy2);
            self.state_release(state);
        } else {
            trace!(target: "fusion.card", "blit2 not accelerated, dropped");
        }
    }
}

/// Bresenham walk of a clipped segment, emitted as one-pixel fills.
fn draw_line_spans(
    software: &dyn crate::SoftwareRasterizer,
    state: &CardState,
    line: &Line,
) {
    let dx = (line.x2 - line.x1).abs();
    let dy = -(line.y2 - line.y1).abs();
    let sx = if line.x1 < line.x2 { 1 } else { -1 };
    let sy = if line.y1 < line.y2 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (line.x1, line.y1);

    loop {
        software.fill_rectangle(state, &Rectangle::new(x, y, 1, 1));
        if x == line.x2 && y == line.y2 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Clip a blit so the destination rectangle fits the clip; the source
/// rectangle shifts accordingly. Returns false when nothing remains.
fn clip_blit(clip: &fusion_surface::Region, rect: &mut Rectangle, point: &mut Point) -> bool {
    let mut dest = Rectangle::new(point.x, point.y, rect.w, rect.h);
    if !dest.clip_to(clip) {
        return false;
    }
    rect.x += dest.x - point.x;
    rect.y += dest.y - point.y;
    rect.w = dest.w;
    rect.h = dest.h;
    point.x = dest.x;
    point.y = dest.y;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_surface::Region;

    #[test]
    fn transform_identity_is_noop() {
        let m = [0x10000, 0, 0, 0, 0x10000, 0, 0, 0, 0x10000];
        let (mut x, mut y) = (17, -4);
        transform(&mut x, &mut y, &m, true);
        assert_eq!((x, y), (17, -4));
    }

    #[test]
    fn transform_translation() {
        // Translate by (10, 20) in 16.16.
        let m = [0x10000, 0, 10 << 16, 0, 0x10000, 20 << 16, 0, 0, 0x10000];
        let (mut x, mut y) = (1, 2);
        transform(&mut x, &mut y, &m, true);
        assert_eq!((x, y), (11, 22));
    }

    #[test]
    fn projective_zero_w_saturates() {
        let m = [1, 0, 0, 0, 1, 0, 0, 0, 0];
        let (mut x, mut y) = (5, -3);
        transform(&mut x, &mut y, &m, false);
        assert_eq!(x, 0x7fff_ffff);
        assert_eq!(y, -0x7fff_ffff);
    }

    #[test]
    fn clip_blit_shifts_source() {
        let clip = Region::new(10, 10, 100, 100);
        let mut rect = Rectangle::new(0, 0, 20, 20);
        let mut point = Point { x: 5, y: 5 };
        assert!(clip_blit(&clip, &mut rect, &mut point));
        assert_eq!(point.x, 10);
        assert_eq!(point.y, 10);
        assert_eq!(rect, Rectangle::new(5, 5, 15, 15));
    }

    #[test]
    fn clip_blit_rejects_outside() {
        let clip = Region::new(0, 0, 9, 9);
        let mut rect = Rectangle::new(0, 0, 4, 4);
        let mut point = Point { x: 50, y: 50 };
        assert!(!clip_blit(&clip, &mut rect, &mut point));
    }

    #[test]
    fn dda_walks_a_vertical_edge() {
        let mut dda = Dda::setup(5, 0, 5, 10);
        for _ in 0..10 {
            assert_eq!(dda.xi, 5);
            dda.step();
        }
    }
}
