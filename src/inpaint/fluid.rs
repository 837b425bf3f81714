//! Navier-Stokes style inpainting.
//!
//! Treats image intensity as a stream function: the Laplacian (smoothness)
//! is transported along isophotes, `I_t = grad(lap I) . perp(grad I)`, which
//! continues edges into the hole. A diffusion term keeps the explicit scheme
//! stable. The caller pre-fills the hole with Telea over the same radius so
//! the iteration starts close to its fixed point.

use super::Field;

/// Transport iterations per unit of radius.
const ITERATIONS_PER_RADIUS: u32 = 4;
/// Explicit time step for the transport term.
const DT: f32 = 0.1;
/// Diffusion coefficient (must stay <= 0.25 for the 4-neighbour stencil).
const DIFFUSION: f32 = 0.2;

/// Run `ITERATIONS_PER_RADIUS * radius` transport steps over the `unknown`
/// pixels of an already pre-filled `field`.
pub(super) fn transport(field: &mut Field, unknown: &[bool], radius: u32) {
    let holes: Vec<usize> = (0..unknown.len()).filter(|&i| unknown[i]).collect();
    // the Laplacian is needed on the hole and its one-pixel rim
    let mut rim = vec![false; unknown.len()];
    for &i in &holes {
        rim[i] = true;
        for n in field.neighbors4(i) {
            rim[n] = true;
        }
    }
    let active: Vec<usize> = (0..rim.len()).filter(|&i| rim[i]).collect();

    let mut lap = vec![[0.0_f32; 3]; field.px.len()];
    let mut next = Vec::with_capacity(holes.len());
    for _ in 0..ITERATIONS_PER_RADIUS * radius {
        for &i in &active {
            lap[i] = laplacian(field, i);
        }
        next.clear();
        for &i in &holes {
            next.push(step(field, &lap, i));
        }
        for (&i, v) in holes.iter().zip(&next) {
            field.px[i] = *v;
        }
    }
}

/// Left, right, up, down neighbours with clamped borders.
fn stencil(field: &Field, idx: usize) -> [usize; 4] {
    let (w, h) = (field.width, field.height);
    let (x, y) = (idx % w, idx / w);
    [
        if x > 0 { idx - 1 } else { idx },
        if x + 1 < w { idx + 1 } else { idx },
        if y > 0 { idx - w } else { idx },
        if y + 1 < h { idx + w } else { idx },
    ]
}

fn laplacian(field: &Field, idx: usize) -> [f32; 3] {
    let [l, r, u, d] = stencil(field, idx);
    let px = &field.px;
    std::array::from_fn(|c| px[l][c] + px[r][c] + px[u][c] + px[d][c] - 4.0 * px[idx][c])
}

/// One explicit update of pixel `idx`, values kept in `[0, 255]`.
fn step(field: &Field, lap: &[[f32; 3]], idx: usize) -> [f32; 3] {
    let [l, r, u, d] = stencil(field, idx);
    let px = &field.px;
    std::array::from_fn(|c| {
        // work in [0, 1] so the transport term stays bounded
        let at = |i: usize| px[i][c] / 255.0;
        let ix = (at(r) - at(l)) / 2.0;
        let iy = (at(d) - at(u)) / 2.0;
        let lx = (lap[r][c] - lap[l][c]) / (2.0 * 255.0);
        let ly = (lap[d][c] - lap[u][c]) / (2.0 * 255.0);
        let transport = lx * -iy + ly * ix;
        let diffusion = lap[idx][c] / 255.0;
        let v = at(idx) + DT * transport + DIFFUSION * diffusion;
        v.clamp(0.0, 1.0) * 255.0
    })
}
