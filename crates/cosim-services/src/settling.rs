//! Granular bed generation and settling.
//!
//! Particles are generated inside the patch container by one of three
//! sampling strategies, then the bed is simulated under gravity alone, with
//! no rig interaction, for the configured settling time. Snapshots are
//! written to `settling/` at the configured cadence.
//!
//! Settling does not check for convergence; a bed that is still moving at
//! the end of the settling time is used as is.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cosim_core::config::{ceil_ratio, GranularSettings, SamplingMethod};
use cosim_core::payload::{PatchBounds, Vec3};

use crate::node::CosimError;
use crate::terrain::grid::{norm, sub, SpatialGrid};
use crate::terrain::PrepareEnv;

/// Gap factor between generated particle centers.
const SEPARATION: f64 = 1.01;

/// Dart-throwing attempts per particle slot.
const ATTEMPTS_PER_SLOT: usize = 30;

/// Box particle centers may be generated in.
#[derive(Debug, Clone, Copy)]
struct Region {
    lo: Vec3,
    hi: Vec3,
}

fn region(bounds: &PatchBounds, radius: f64, height: f64) -> Region {
    Region {
        lo: [bounds.x_min + radius, bounds.y_min + radius, radius],
        hi: [bounds.x_max - radius, bounds.y_max - radius, height - radius],
    }
}

fn inside(r: &Region, p: &Vec3) -> bool {
    (0..3).all(|k| p[k] >= r.lo[k] - 1e-12 && p[k] <= r.hi[k] + 1e-12)
}

/// Generate initial particle centers.
pub fn generate(
    method: SamplingMethod,
    bounds: &PatchBounds,
    radius: f64,
    init_height: f64,
    in_layers: bool,
    seed: u64,
) -> Vec<Vec3> {
    let r = region(bounds, radius, init_height);
    if (0..3).any(|k| r.hi[k] < r.lo[k]) {
        return Vec::new();
    }
    match method {
        SamplingMethod::RegularGrid => regular_grid(&r, radius),
        SamplingMethod::HcpPack => hcp_pack(&r, radius),
        SamplingMethod::PoissonDisk => {
            let mut rng = StdRng::seed_from_u64(seed);
            if in_layers {
                poisson_layers(&r, radius, &mut rng)
            } else {
                poisson_volume(&r, radius, &mut rng)
            }
        }
    }
}

fn regular_grid(r: &Region, radius: f64) -> Vec<Vec3> {
    let d = 2.0 * radius * SEPARATION;
    let counts: Vec<usize> = (0..3)
        .map(|k| ((r.hi[k] - r.lo[k]) / d).floor() as usize + 1)
        .collect();
    let mut points = Vec::with_capacity(counts.iter().product());
    for k in 0..counts[2] {
        for j in 0..counts[1] {
            for i in 0..counts[0] {
                points.push([
                    r.lo[0] + i as f64 * d,
                    r.lo[1] + j as f64 * d,
                    r.lo[2] + k as f64 * d,
                ]);
            }
        }
    }
    points
}

fn hcp_pack(r: &Region, radius: f64) -> Vec<Vec3> {
    let rad = radius * SEPARATION;
    let dz = 2.0 * rad * (2.0f64 / 3.0).sqrt();
    let dy = rad * 3.0f64.sqrt();
    let mut points = Vec::new();
    let mut k = 0usize;
    loop {
        let z = r.lo[2] + k as f64 * dz;
        if z > r.hi[2] + 1e-12 {
            break;
        }
        let layer_shift = if k % 2 == 1 { dy / 3.0 } else { 0.0 };
        let mut j = 0usize;
        loop {
            let y = r.lo[1] + layer_shift + j as f64 * dy;
            if y > r.hi[1] + 1e-12 {
                break;
            }
            let row_shift = if (j + k) % 2 == 1 { rad } else { 0.0 };
            let mut i = 0usize;
            loop {
                let x = r.lo[0] + row_shift + i as f64 * 2.0 * rad;
                if x > r.hi[0] + 1e-12 {
                    break;
                }
                points.push([x, y, z]);
                i += 1;
            }
            j += 1;
        }
        k += 1;
    }
    points
}

fn accept(grid: &mut SpatialGrid, points: &mut Vec<Vec3>, p: Vec3, min_dist: f64) -> bool {
    let mut clear = true;
    grid.for_each_near(&p, |i| {
        if norm(&sub(&points[i], &p)) < min_dist {
            clear = false;
        }
    });
    if clear {
        grid.insert(points.len(), &p);
        points.push(p);
    }
    clear
}

fn poisson_volume(r: &Region, radius: f64, rng: &mut StdRng) -> Vec<Vec3> {
    let min_dist = 2.0 * radius * SEPARATION;
    let volume: f64 = (0..3).map(|k| r.hi[k] - r.lo[k] + min_dist).product();
    let slots = (volume / min_dist.powi(3)).ceil() as usize;
    let mut grid = SpatialGrid::new(min_dist);
    let mut points = Vec::new();
    for _ in 0..slots * ATTEMPTS_PER_SLOT {
        let p = [
            rng.gen_range(r.lo[0]..=r.hi[0]),
            rng.gen_range(r.lo[1]..=r.hi[1]),
            rng.gen_range(r.lo[2]..=r.hi[2]),
        ];
        accept(&mut grid, &mut points, p, min_dist);
    }
    points
}

fn poisson_layers(r: &Region, radius: f64, rng: &mut StdRng) -> Vec<Vec3> {
    let min_dist = 2.0 * radius * SEPARATION;
    let area = (r.hi[0] - r.lo[0] + min_dist) * (r.hi[1] - r.lo[1] + min_dist);
    let slots = (area / (min_dist * min_dist)).ceil() as usize;
    let mut grid = SpatialGrid::new(min_dist);
    let mut points = Vec::new();
    let mut z = r.lo[2];
    while z <= r.hi[2] + 1e-12 {
        for _ in 0..slots * ATTEMPTS_PER_SLOT {
            let p = [
                rng.gen_range(r.lo[0]..=r.hi[0]),
                rng.gen_range(r.lo[1]..=r.hi[1]),
                z,
            ];
            accept(&mut grid, &mut points, p, min_dist);
        }
        z += min_dist;
    }
    points
}

// ── Settling ──────────────────────────────────────────────────────────────────

/// A particle bed that can be stepped and snapshotted.
pub trait Settle {
    fn settle_step(&mut self, dt: f64);

    fn snapshot(&self) -> serde_json::Value;

    fn particle_count(&self) -> usize;
}

/// Number of steps and snapshot cadence for a settling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlingPlan {
    pub steps: u64,
    /// Steps between snapshots, if snapshots are written.
    pub snapshot_every: Option<u64>,
}

impl SettlingPlan {
    pub fn new(settings: &GranularSettings, step_size: f64, output_enabled: bool) -> Self {
        let steps = ceil_ratio(settings.settling_time, step_size);
        let snapshots =
            output_enabled && settings.settling_output && settings.settling_output_fps > 0.0;
        let snapshot_every = snapshots
            .then(|| ceil_ratio(1.0, settings.settling_output_fps * step_size).max(1));
        Self { steps, snapshot_every }
    }
}

/// Simulate `bed` under gravity for the planned number of steps.
/// Returns the number of snapshots written.
pub fn settle<B: Settle>(
    bed: &mut B,
    plan: SettlingPlan,
    env: &PrepareEnv<'_>,
) -> Result<u64, CosimError> {
    tracing::info!(
        particles = bed.particle_count(),
        steps = plan.steps,
        "settling granular bed"
    );
    let mut snapshots = 0u64;
    for step in 0..plan.steps {
        bed.settle_step(env.step_size);
        if let Some(every) = plan.snapshot_every {
            if step % every == 0 {
                env.output.write_snapshot(snapshots, &bed.snapshot())?;
                snapshots += 1;
            }
        }
        if env.verbose && step % 1000 == 0 {
            tracing::debug!(step, "settling");
        }
    }
    tracing::info!(snapshots, "settling complete");
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> PatchBounds {
        PatchBounds::centered(0.4, 0.2)
    }

    fn min_pair_distance(points: &[Vec3]) -> f64 {
        let mut min = f64::INFINITY;
        for i in 0..points.len() {
            for j in (i + 1)..points.len() {
                min = min.min(norm(&sub(&points[i], &points[j])));
            }
        }
        min
    }

    #[test]
    fn every_method_respects_spacing_and_container() {
        let r = 0.02;
        let reg = region(&bounds(), r, 0.12);
        let methods = [
            SamplingMethod::PoissonDisk,
            SamplingMethod::HcpPack,
            SamplingMethod::RegularGrid,
        ];
        for method in methods {
            for layers in [true, false] {
                let points = generate(method, &bounds(), r, 0.12, layers, 7);
                assert!(!points.is_empty(), "{method:?} generated nothing");
                assert!(points.iter().all(|p| inside(&reg, p)), "{method:?} left the container");
                assert!(min_pair_distance(&points) >= 2.0 * r - 1e-9, "{method:?} overlaps");
            }
        }
    }

    #[test]
    fn poisson_sampling_is_seeded() {
        let a = generate(SamplingMethod::PoissonDisk, &bounds(), 0.02, 0.1, true, 42);
        let b = generate(SamplingMethod::PoissonDisk, &bounds(), 0.02, 0.1, true, 42);
        let c = generate(SamplingMethod::PoissonDisk, &bounds(), 0.02, 0.1, true, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn too_small_container_yields_no_particles() {
        let tiny = PatchBounds::centered(0.01, 0.01);
        let points = generate(SamplingMethod::RegularGrid, &tiny, 0.02, 0.5, false, 0);
        assert!(points.is_empty());
    }

    #[test]
    fn plan_counts_steps_and_snapshots() {
        let mut settings = GranularSettings::default();
        settings.settling_time = 0.4;
        settings.settling_output_fps = 100.0;
        let plan = SettlingPlan::new(&settings, 1e-4, true);
        assert_eq!(plan.steps, 4000);
        assert_eq!(plan.snapshot_every, Some(100));

        settings.settling_output = false;
        assert_eq!(SettlingPlan::new(&settings, 1e-4, true).snapshot_every, None);
    }
}
