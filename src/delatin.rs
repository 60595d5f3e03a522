//! Greedy height-field triangulation with Delaunay refinement.
//!
//! Starting from the two triangles spanning the grid, the pixel with the
//! largest vertical error is repeatedly inserted and the affected triangles
//! are legalized by edge flips, until no grid sample deviates from the
//! piecewise-linear surface by more than the requested error.

/// Marker for a halfedge on the hull.
const NONE: usize = usize::MAX;

pub struct Delatin<'a> {
    data: &'a [f64],
    width: usize,
    height: usize,
    /// Vertex coordinates as (x, y) pairs in pixel space.
    pub coords: Vec<i64>,
    /// Triangle vertex indices, three per triangle.
    pub triangles: Vec<usize>,

    halfedges: Vec<usize>,
    candidates: Vec<i64>,
    queue_indices: Vec<Option<usize>>,
    queue: Vec<usize>,
    errors: Vec<f64>,
    rms: Vec<f64>,
    pending: Vec<usize>,
    rms_sum: f64,
}

impl<'a> Delatin<'a> {
    /// `data` is row-major with `width * height` samples; both sides must be at least 2.
    pub fn new(data: &'a [f64], width: usize, height: usize) -> Self {
        debug_assert!(width >= 2 && height >= 2);
        debug_assert_eq!(data.len(), width * height);

        let mut tin = Self {
            data,
            width,
            height,
            coords: Vec::new(),
            triangles: Vec::new(),
            halfedges: Vec::new(),
            candidates: Vec::new(),
            queue_indices: Vec::new(),
            queue: Vec::new(),
            errors: Vec::new(),
            rms: Vec::new(),
            pending: Vec::new(),
            rms_sum: 0.0,
        };

        let x1 = width as i64 - 1;
        let y1 = height as i64 - 1;
        let p0 = tin.add_point(0, 0);
        let p1 = tin.add_point(x1, 0);
        let p2 = tin.add_point(0, y1);
        let p3 = tin.add_point(x1, y1);

        // 初期の2三角形
        let t0 = tin.add_triangle(p3, p0, p2, NONE, NONE, NONE, None);
        tin.add_triangle(p0, p3, p1, t0, NONE, NONE, None);
        tin.flush();
        tin
    }

    /// Refine until the maximum error drops to `max_error` or below.
    pub fn run(&mut self, max_error: f64) {
        while self.max_error() > max_error {
            self.refine();
        }
    }

    pub fn refine(&mut self) {
        self.step();
        self.flush();
    }

    pub fn max_error(&self) -> f64 {
        self.errors.first().copied().unwrap_or(0.0)
    }

    /// Root-mean-square deviation of the current surface.
    pub fn rmsd(&self) -> f64 {
        if self.rms_sum > 0.0 {
            (self.rms_sum / (self.width * self.height) as f64).sqrt()
        } else {
            0.0
        }
    }

    pub fn height_at(&self, x: i64, y: i64) -> f64 {
        self.data[self.width * y as usize + x as usize]
    }

    pub fn vertex_count(&self) -> usize {
        self.coords.len() / 2
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len() / 3
    }

    /// Vertices as `(x, y, z)` in pixel space.
    pub fn vertices(&self) -> Vec<[f64; 3]> {
        self.coords
            .chunks_exact(2)
            .map(|c| [c[0] as f64, c[1] as f64, self.height_at(c[0], c[1])])
            .collect()
    }

    pub fn triangle_indices(&self) -> Vec<[usize; 3]> {
        self.triangles
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect()
    }

    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for &t in &pending {
            let a = 2 * self.triangles[t * 3];
            let b = 2 * self.triangles[t * 3 + 1];
            let c = 2 * self.triangles[t * 3 + 2];
            let (p0x, p0y) = (self.coords[a], self.coords[a + 1]);
            let (p1x, p1y) = (self.coords[b], self.coords[b + 1]);
            let (p2x, p2y) = (self.coords[c], self.coords[c + 1]);
            self.find_candidate(p0x, p0y, p1x, p1y, p2x, p2y, t);
        }
    }

    /// Rasterize a triangle, record its worst pixel and queue it.
    #[allow(clippy::too_many_arguments)]
    fn find_candidate(
        &mut self,
        p0x: i64,
        p0y: i64,
        p1x: i64,
        p1y: i64,
        p2x: i64,
        p2y: i64,
        t: usize,
    ) {
        let min_x = p0x.min(p1x).min(p2x);
        let min_y = p0y.min(p1y).min(p2y);
        let max_x = p0x.max(p1x).max(p2x);
        let max_y = p0y.max(p1y).max(p2y);

        // 前進差分用の辺関数
        let mut w00 = orient(p1x, p1y, p2x, p2y, min_x, min_y);
        let mut w01 = orient(p2x, p2y, p0x, p0y, min_x, min_y);
        let mut w02 = orient(p0x, p0y, p1x, p1y, min_x, min_y);
        let a01 = p1y - p0y;
        let b01 = p0x - p1x;
        let a12 = p2y - p1y;
        let b12 = p1x - p2x;
        let a20 = p0y - p2y;
        let b20 = p2x - p0x;

        let a = orient(p0x, p0y, p1x, p1y, p2x, p2y) as f64;
        let z0 = self.height_at(p0x, p0y) / a;
        let z1 = self.height_at(p1x, p1y) / a;
        let z2 = self.height_at(p2x, p2y) / a;

        let mut max_error = 0.0f64;
        let mut mx = 0i64;
        let mut my = 0i64;
        let mut rms = 0.0f64;

        for y in min_y..=max_y {
            let mut dx = 0i64;
            if w00 < 0 && a12 != 0 {
                dx = dx.max(floor_div(-w00, a12));
            }
            if w01 < 0 && a20 != 0 {
                dx = dx.max(floor_div(-w01, a20));
            }
            if w02 < 0 && a01 != 0 {
                dx = dx.max(floor_div(-w02, a01));
            }

            let mut w0 = w00 + a12 * dx;
            let mut w1 = w01 + a20 * dx;
            let mut w2 = w02 + a01 * dx;
            let mut was_inside = false;

            let mut x = min_x + dx;
            while x <= max_x {
                if w0 >= 0 && w1 >= 0 && w2 >= 0 {
                    was_inside = true;
                    let z = z0 * w0 as f64 + z1 * w1 as f64 + z2 * w2 as f64;
                    let dz = (z - self.height_at(x, y)).abs();
                    rms += dz * dz;
                    if dz > max_error {
                        max_error = dz;
                        mx = x;
                        my = y;
                    }
                } else if was_inside {
                    break;
                }
                w0 += a12;
                w1 += a20;
                w2 += a01;
                x += 1;
            }

            w00 += b12;
            w01 += b20;
            w02 += b01;
        }

        if (mx == p0x && my == p0y) || (mx == p1x && my == p1y) || (mx == p2x && my == p2y) {
            max_error = 0.0;
        }

        self.candidates[2 * t] = mx;
        self.candidates[2 * t + 1] = my;
        self.rms[t] = rms;
        self.queue_push(t, max_error, rms);
    }

    /// Split the worst triangle at its candidate pixel.
    fn step(&mut self) {
        let t = self.queue_pop();

        let e0 = t * 3;
        let e1 = t * 3 + 1;
        let e2 = t * 3 + 2;

        let p0 = self.triangles[e0];
        let p1 = self.triangles[e1];
        let p2 = self.triangles[e2];

        let (ax, ay) = (self.coords[2 * p0], self.coords[2 * p0 + 1]);
        let (bx, by) = (self.coords[2 * p1], self.coords[2 * p1 + 1]);
        let (cx, cy) = (self.coords[2 * p2], self.coords[2 * p2 + 1]);
        let px = self.candidates[2 * t];
        let py = self.candidates[2 * t + 1];

        let pn = self.add_point(px, py);

        if orient(ax, ay, bx, by, px, py) == 0 {
            self.handle_collinear(pn, e0);
        } else if orient(bx, by, cx, cy, px, py) == 0 {
            self.handle_collinear(pn, e1);
        } else if orient(cx, cy, ax, ay, px, py) == 0 {
            self.handle_collinear(pn, e2);
        } else {
            let h0 = self.halfedges[e0];
            let h1 = self.halfedges[e1];
            let h2 = self.halfedges[e2];

            let t0 = self.add_triangle(p0, p1, pn, h0, NONE, NONE, Some(e0));
            let t1 = self.add_triangle(p1, p2, pn, h1, NONE, t0 + 1, None);
            let t2 = self.add_triangle(p2, p0, pn, h2, t0 + 2, t1 + 1, None);

            self.legalize(t0);
            self.legalize(t1);
            self.legalize(t2);
        }
    }

    fn add_point(&mut self, x: i64, y: i64) -> usize {
        let i = self.coords.len() / 2;
        self.coords.push(x);
        self.coords.push(y);
        i
    }

    /// Add a triangle, or overwrite the one starting at halfedge `e`.
    #[allow(clippy::too_many_arguments)]
    fn add_triangle(
        &mut self,
        a: usize,
        b: usize,
        c: usize,
        ab: usize,
        bc: usize,
        ca: usize,
        e: Option<usize>,
    ) -> usize {
        let e = e.unwrap_or(self.triangles.len());
        let t = e / 3;

        if e == self.triangles.len() {
            self.triangles.extend_from_slice(&[a, b, c]);
            self.halfedges.extend_from_slice(&[ab, bc, ca]);
            self.candidates.extend_from_slice(&[0, 0]);
            self.queue_indices.push(None);
            self.rms.push(0.0);
        } else {
            self.triangles[e..e + 3].copy_from_slice(&[a, b, c]);
            self.halfedges[e..e + 3].copy_from_slice(&[ab, bc, ca]);
            self.candidates[2 * t] = 0;
            self.candidates[2 * t + 1] = 0;
            self.queue_indices[t] = None;
            self.rms[t] = 0.0;
        }

        // 隣接ハーフエッジを接続
        if ab != NONE {
            self.halfedges[ab] = e;
        }
        if bc != NONE {
            self.halfedges[bc] = e + 1;
        }
        if ca != NONE {
            self.halfedges[ca] = e + 2;
        }

        self.pending.push(t);
        e
    }

    //           pl                    pl
    //          /||\                  /  \
    //       al/ || \bl            al/    \a
    //        /  ||  \              /      \
    //       /  a||b  \    flip    /___ar___\
    //     p0\   ||   /p1   =>   p0\---bl---/p1
    //        \  ||  /              \      /
    //       ar\ || /br             b\    /br
    //          \||/                  \  /
    //           pr                    pr
    fn legalize(&mut self, a: usize) {
        let b = self.halfedges[a];
        if b == NONE {
            return;
        }

        let a0 = a - a % 3;
        let b0 = b - b % 3;
        let al = a0 + (a + 1) % 3;
        let ar = a0 + (a + 2) % 3;
        let bl = b0 + (b + 2) % 3;
        let br = b0 + (b + 1) % 3;
        let p0 = self.triangles[ar];
        let pr = self.triangles[a];
        let pl = self.triangles[al];
        let p1 = self.triangles[bl];

        let c = &self.coords;
        if !in_circle(
            c[2 * p0],
            c[2 * p0 + 1],
            c[2 * pr],
            c[2 * pr + 1],
            c[2 * pl],
            c[2 * pl + 1],
            c[2 * p1],
            c[2 * p1 + 1],
        ) {
            return;
        }

        let hal = self.halfedges[al];
        let har = self.halfedges[ar];
        let hbl = self.halfedges[bl];
        let hbr = self.halfedges[br];

        self.queue_remove(a0 / 3);
        self.queue_remove(b0 / 3);

        let t0 = self.add_triangle(p0, p1, pl, NONE, hbl, hal, Some(a0));
        let t1 = self.add_triangle(p1, p0, pr, t0, har, hbr, Some(b0));

        self.legalize(t0 + 1);
        self.legalize(t1 + 2);
    }

    /// The new vertex lies on edge `a` of its triangle.
    fn handle_collinear(&mut self, pn: usize, a: usize) {
        let a0 = a - a % 3;
        let al = a0 + (a + 1) % 3;
        let ar = a0 + (a + 2) % 3;
        let p0 = self.triangles[ar];
        let pr = self.triangles[a];
        let pl = self.triangles[al];
        let hal = self.halfedges[al];
        let har = self.halfedges[ar];

        let b = self.halfedges[a];

        if b == NONE {
            let t0 = self.add_triangle(pn, p0, pr, NONE, har, NONE, Some(a0));
            let t1 = self.add_triangle(p0, pn, pl, t0, NONE, hal, None);
            self.legalize(t0 + 1);
            self.legalize(t1 + 2);
            return;
        }

        let b0 = b - b % 3;
        let bl = b0 + (b + 2) % 3;
        let br = b0 + (b + 1) % 3;
        let p1 = self.triangles[bl];
        let hbl = self.halfedges[bl];
        let hbr = self.halfedges[br];

        self.queue_remove(b0 / 3);

        let t0 = self.add_triangle(p0, pr, pn, har, NONE, NONE, Some(a0));
        let t1 = self.add_triangle(pr, p1, pn, hbr, NONE, t0 + 1, Some(b0));
        let t2 = self.add_triangle(p1, pl, pn, hbl, NONE, t1 + 1, None);
        let t3 = self.add_triangle(pl, p0, pn, hal, t0 + 2, t2 + 1, None);

        self.legalize(t0);
        self.legalize(t1);
        self.legalize(t2);
        self.legalize(t3);
    }

    // 最大誤差を先頭に持つ二分ヒープ

    fn queue_push(&mut self, t: usize, error: f64, rms: f64) {
        let i = self.queue.len();
        self.queue_indices[t] = Some(i);
        self.queue.push(t);
        self.errors.push(error);
        self.rms_sum += rms;
        self.queue_up(i);
    }

    fn queue_pop(&mut self) -> usize {
        let n = self.queue.len() - 1;
        self.queue_swap(0, n);
        self.queue_down(0, n);
        self.queue_pop_back()
    }

    fn queue_pop_back(&mut self) -> usize {
        let t = self.queue.pop().expect("queue is not empty");
        self.errors.pop();
        self.rms_sum -= self.rms[t];
        self.queue_indices[t] = None;
        t
    }

    fn queue_remove(&mut self, t: usize) {
        let Some(i) = self.queue_indices[t] else {
            // まだキューに入っていない三角形
            if let Some(pos) = self.pending.iter().position(|&p| p == t) {
                self.pending.swap_remove(pos);
                return;
            }
            panic!("broken triangulation: triangle {} is neither queued nor pending", t);
        };

        let n = self.queue.len() - 1;
        if n != i {
            self.queue_swap(i, n);
            if !self.queue_down(i, n) {
                self.queue_up(i);
            }
        }
        self.queue_pop_back();
    }

    fn queue_less(&self, i: usize, j: usize) -> bool {
        self.errors[i] > self.errors[j]
    }

    fn queue_swap(&mut self, i: usize, j: usize) {
        let pi = self.queue[i];
        let pj = self.queue[j];
        self.queue[i] = pj;
        self.queue[j] = pi;
        self.queue_indices[pi] = Some(j);
        self.queue_indices[pj] = Some(i);
        self.errors.swap(i, j);
    }

    fn queue_up(&mut self, j0: usize) {
        let mut j = j0;
        while j > 0 {
            let i = (j - 1) / 2;
            if !self.queue_less(j, i) {
                break;
            }
            self.queue_swap(i, j);
            j = i;
        }
    }

    fn queue_down(&mut self, i0: usize, n: usize) -> bool {
        let mut i = i0;
        loop {
            let j1 = 2 * i + 1;
            if j1 >= n {
                break;
            }
            let j2 = j1 + 1;
            let mut j = j1;
            if j2 < n && self.queue_less(j2, j1) {
                j = j2;
            }
            if !self.queue_less(j, i) {
                break;
            }
            self.queue_swap(i, j);
            i = j;
        }
        i > i0
    }
}

fn orient(ax: i64, ay: i64, bx: i64, by: i64, cx: i64, cy: i64) -> i64 {
    (bx - cx) * (ay - cy) - (by - cy) * (ax - cx)
}

#[allow(clippy::too_many_arguments)]
fn in_circle(ax: i64, ay: i64, bx: i64, by: i64, cx: i64, cy: i64, px: i64, py: i64) -> bool {
    let dx = (ax - px) as f64;
    let dy = (ay - py) as f64;
    let ex = (bx - px) as f64;
    let ey = (by - py) as f64;
    let fx = (cx - px) as f64;
    let fy = (cy - py) as f64;

    let ap = dx * dx + dy * dy;
    let bp = ex * ex + ey * ey;
    let cp = fx * fx + fy * fy;

    dx * (ey * cp - bp * fy) - dy * (ex * cp - bp * fx) + ap * (ex * fy - ey * fx) < 0.0
}

fn floor_div(a: i64, b: i64) -> i64 {
    (a as f64 / b as f64).floor() as i64
}
