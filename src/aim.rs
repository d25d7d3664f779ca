//!
//! # Ray aiming
//!
//! The chief ray and the marginal rays are found by solving for the two launch
//! parameters of a [`Launch`] such that the ray pierces the stop surface at a
//! given point of the stop local frame.
//! The 2×2 Jacobian of the stop hit with respect to the launch parameters is
//! computed by finite differences and the Newton step is damped by
//! backtracking. Clear apertures are ignored while aiming.

use crate::{
    error::{Error, ErrorKind, Result},
    field::{Field, Launch},
    ray::{Ray, RayFailure, RayStatus},
    system::OpticalSystem,
    trace::{TraceResult, Tracer},
};
use nalgebra as na;
use roots::find_root_brent;

type Matrix2 = na::Matrix2<f64>;
type Vector2 = na::Vector2<f64>;

/// Finite difference step of the launch parameters
pub const JACOBIAN_STEP: f64 = 1e-6;
/// Stop hit tolerance of the chief ray [mm]
pub const CHIEF_TOLERANCE: f64 = 1e-8;
/// Newton iteration limit
pub const MAX_ITERATIONS: usize = 50;
const DAMPING: f64 = 0.5;
const MAX_BACKTRACKS: usize = 12;

/// Chief ray: the ray through the center of the stop
#[derive(Debug, Clone)]
pub struct ChiefRay {
    /// Launch parameters
    pub params: [f64; 2],
    /// Stop hit Jacobian at the solution
    pub jacobian: [[f64; 2]; 2],
    /// Distance to the stop center [mm]
    pub residual: f64,
    pub iterations: usize,
    /// Trace to the image surface
    pub trace: TraceResult,
}

/// Ray through a given point of the stop
#[derive(Debug, Clone)]
pub struct MarginalRay {
    pub params: [f64; 2],
    /// Pupil fraction
    pub rho: f64,
    /// Unit direction in the stop plane
    pub direction: [f64; 2],
    /// Distance to the requested stop point [mm]
    pub residual: f64,
    /// Scale factor of the sweep that converged
    pub scale: f64,
    pub trace: TraceResult,
}

/// Named stop edge directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Up,
    Down,
    Left,
    Right,
}
impl Edge {
    pub fn direction(&self) -> [f64; 2] {
        match self {
            Edge::Up => [0., 1.],
            Edge::Down => [0., -1.],
            Edge::Left => [-1., 0.],
            Edge::Right => [1., 0.],
        }
    }
}

/// Chief ray and the four edge rays of a field
#[derive(Debug, Clone)]
pub struct EdgeRays {
    pub chief: ChiefRay,
    pub up: MarginalRay,
    pub down: MarginalRay,
    pub left: MarginalRay,
    pub right: MarginalRay,
}
impl EdgeRays {
    /// Ray paths, chief ray first
    pub fn polylines(&self) -> Vec<&TraceResult> {
        vec![
            &self.chief.trace,
            &self.up.trace,
            &self.down.trace,
            &self.left.trace,
            &self.right.trace,
        ]
    }
}

/// Stop aiming solver
pub struct Aimer<'a> {
    system: &'a OpticalSystem,
    launch: Launch,
    stop: usize,
    radius: f64,
}
impl<'a> Aimer<'a> {
    pub fn new(system: &'a OpticalSystem, field: Field) -> Result<Self> {
        let (stop, radius) = system.stop_radius()?;
        Ok(Self {
            system,
            launch: Launch::new(system, field)?,
            stop,
            radius,
        })
    }
    pub fn launch(&self) -> &Launch {
        &self.launch
    }
    /// Stop surface index
    pub fn stop(&self) -> usize {
        self.stop
    }
    /// Stop semi-diameter [mm]
    pub fn stop_radius(&self) -> f64 {
        self.radius
    }
    pub fn ray(&self, params: [f64; 2]) -> Ray {
        self.launch.ray(params)
    }
    /// Stop hit `(x,y)` in the stop local frame of the ray with launch `params`
    pub fn stop_hit(&self, params: [f64; 2]) -> std::result::Result<Vector2, RayFailure> {
        let result = Tracer::new(self.system)
            .ignore_apertures()
            .trace_to(self.launch.ray(params), self.stop);
        match result.status {
            RayStatus::AtImage => {
                let p = self.system.frame(self.stop).to_local(&result.ray.p);
                Ok(Vector2::new(p.x, p.y))
            }
            RayStatus::Vignetted { reason, .. } => Err(reason),
        }
    }
    /// Full trace of the ray with launch `params`, apertures included
    pub fn trace(&self, params: [f64; 2]) -> TraceResult {
        Tracer::new(self.system).trace(self.launch.ray(params))
    }
    /// Finite difference Jacobian of the stop hit at `params`, where the hit is `f0`
    ///
    /// A perturbed ray that fails is reported as a ray failure, a degenerate
    /// Jacobian as an internal error.
    fn jacobian(&self, params: [f64; 2], f0: &Vector2) -> Result<Matrix2> {
        let h = JACOBIAN_STEP;
        let perturbed = |p: [f64; 2]| {
            self.stop_hit(p)
                .map_err(|reason| failure("aim", reason, "finite difference ray"))
        };
        let fa = perturbed([params[0] + h, params[1]])?;
        let fb = perturbed([params[0], params[1] + h])?;
        let j = Matrix2::from_columns(&[(fa - f0) / h, (fb - f0) / h]);
        if j.determinant().abs() < 1e-14 * j.norm_squared().max(1e-300) {
            Err(Error::internal("aim", "singular stop Jacobian"))
        } else {
            Ok(j)
        }
    }
    /// Damped Newton solve of `stop_hit(p) = target` from `guess`
    ///
    /// Returns the parameters, the residual, the Jacobian at the solution when
    /// it can be evaluated and the number of iterations.
    pub fn solve(
        &self,
        target: [f64; 2],
        guess: [f64; 2],
        tolerance: f64,
    ) -> Result<([f64; 2], f64, Option<Matrix2>, usize)> {
        let target = Vector2::new(target[0], target[1]);
        let mut p = Vector2::new(guess[0], guess[1]);
        let mut f = self
            .stop_hit([p[0], p[1]])
            .map_err(|reason| failure("aim", reason, "initial guess"))?
            - target;
        for iteration in 0..MAX_ITERATIONS {
            if f.norm() < tolerance {
                let j = match self.jacobian([p[0], p[1]], &(f + target)) {
                    Ok(j) => Some(j),
                    Err(e) => {
                        log::debug!("aim: converged without a Jacobian: {}", e);
                        None
                    }
                };
                return Ok(([p[0], p[1]], f.norm(), j, iteration));
            }
            let j = self.jacobian([p[0], p[1]], &(f + target))?;
            let delta = j
                .lu()
                .solve(&-f)
                .ok_or_else(|| Error::internal("aim", "singular stop Jacobian"))?;
            let mut alpha = 1.;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let q = p + delta * alpha;
                if let Ok(fq) = self.stop_hit([q[0], q[1]]) {
                    let fq = fq - target;
                    if fq.norm() < f.norm() {
                        accepted = Some((q, fq));
                        break;
                    }
                }
                alpha *= DAMPING;
            }
            match accepted {
                Some((q, fq)) => {
                    p = q;
                    f = fq;
                }
                None => {
                    log::debug!(
                        "aim: line search failed at iteration {} with residual {:.3e}",
                        iteration,
                        f.norm()
                    );
                    return Err(Error::non_convergence(
                        "aim",
                        format!("line search failed, residual {:.3e}mm", f.norm()),
                    ));
                }
            }
        }
        Err(Error::non_convergence(
            "aim",
            format!(
                "no convergence after {} iterations, residual {:.3e}mm",
                MAX_ITERATIONS,
                f.norm()
            ),
        ))
    }
    /// Solves for the ray through the center of the stop
    pub fn chief(&self) -> Result<ChiefRay> {
        let stop_center = self.system.frame(self.stop).origin;
        let guess = self.launch.aim_at(&stop_center);
        let (params, residual, j, iterations) = self
            .solve([0., 0.], guess, CHIEF_TOLERANCE)
            .map_err(|e| match e.kind {
                ErrorKind::Domain => e,
                _ => Error::non_convergence("chief ray", e.to_string()),
            })?;
        let j = j.ok_or_else(|| {
            Error::non_convergence("chief ray", "stop Jacobian cannot be evaluated at the solution")
        })?;
        let trace = Tracer::new(self.system)
            .ignore_apertures()
            .trace(self.launch.ray(params));
        if let RayStatus::Vignetted { surface, reason } = trace.status {
            return Err(failure(
                "chief ray",
                reason,
                &format!("surface #{}", surface),
            ));
        }
        log::debug!(
            "chief ray: {:?} in {} iterations, residual {:.3e}mm",
            params,
            iterations,
            residual
        );
        Ok(ChiefRay {
            params,
            jacobian: [[j[(0, 0)], j[(0, 1)]], [j[(1, 0)], j[(1, 1)]]],
            residual,
            iterations,
            trace,
        })
    }
    /// Linear estimate of the launch parameters hitting the stop local point `target`
    pub fn linear_guess(&self, chief: &ChiefRay, target: [f64; 2]) -> Option<[f64; 2]> {
        let j = Matrix2::new(
            chief.jacobian[0][0],
            chief.jacobian[0][1],
            chief.jacobian[1][0],
            chief.jacobian[1][1],
        );
        let d = j.try_inverse()? * Vector2::new(target[0], target[1]);
        Some([chief.params[0] + d[0], chief.params[1] + d[1]])
    }
    /// Solves for the ray through the stop at the fraction `rho` of the stop radius along `direction`
    pub fn marginal(&self, chief: &ChiefRay, rho: f64, direction: [f64; 2]) -> Result<MarginalRay> {
        if !(rho > 0. && rho <= 1.) {
            return Err(Error::invalid_input(
                "marginal ray",
                format!("pupil fraction must be in (0,1], found {}", rho),
            ));
        }
        let norm = direction[0].hypot(direction[1]);
        if !(norm > 0. && norm.is_finite()) {
            return Err(Error::invalid_input(
                "marginal ray",
                "stop direction must be a non-zero vector",
            ));
        }
        let direction = [direction[0] / norm, direction[1] / norm];
        let target = [rho * self.radius * direction[0], rho * self.radius * direction[1]];
        let edge_tolerance = (1e-4 * self.radius).max(1e-4);
        let newton_tolerance = CHIEF_TOLERANCE * self.radius.max(1.);
        let guess = self
            .linear_guess(chief, target)
            .ok_or_else(|| Error::internal("marginal ray", "singular chief ray Jacobian"))?;
        let pc = chief.params;
        let toward = |s: f64| [pc[0] + s * (guess[0] - pc[0]), pc[1] + s * (guess[1] - pc[1])];

        // scale sweep 0.98, 0.96, ..., 0.30
        let mut best: Option<([f64; 2], f64, f64)> = None;
        for k in 0..35 {
            let scale = 0.98 - 0.02 * k as f64;
            match self.solve(target, toward(scale), newton_tolerance) {
                Ok((params, residual, _, _)) if residual <= edge_tolerance => {
                    best = Some((params, residual, scale));
                    break;
                }
                Ok(_) => (),
                Err(e) => log::debug!("marginal ray: scale {:.2} failed: {}", scale, e),
            }
        }
        let (params, residual, scale) = match best {
            Some((params, residual, scale)) => {
                let refined = self.refine(pc, params, target, direction);
                match refined {
                    Some((p, r)) if r < residual => (p, r, scale),
                    _ => (params, residual, scale),
                }
            }
            None => {
                log::warn!("marginal ray: Newton sweep failed, falling back to a line search");
                match self.refine(pc, guess, target, direction) {
                    Some((p, r)) if r <= edge_tolerance => (p, r, 1.),
                    _ => {
                        return Err(Error::non_convergence(
                            "marginal ray",
                            format!("no ray through the stop at ρ={} along {:?}", rho, direction),
                        ))
                    }
                }
            }
        };
        let trace = self.trace(params);
        Ok(MarginalRay {
            params,
            rho,
            direction,
            residual,
            scale,
            trace,
        })
    }
    /// Brent search along the line from the chief ray parameters `pc` through `p`
    /// for the ray whose stop hit projected on `direction` equals the target radius
    fn refine(
        &self,
        pc: [f64; 2],
        p: [f64; 2],
        target: [f64; 2],
        direction: [f64; 2],
    ) -> Option<([f64; 2], f64)> {
        let radius = target[0] * direction[0] + target[1] * direction[1];
        let at = |sigma: f64| [pc[0] + sigma * (p[0] - pc[0]), pc[1] + sigma * (p[1] - pc[1])];
        let g = |sigma: f64| match self.stop_hit(at(sigma)) {
            Ok(h) => h[0] * direction[0] + h[1] * direction[1] - radius,
            Err(_) => f64::NAN,
        };
        // bracket around sigma=1
        let mut delta: f64 = 0.02;
        let mut bracket = None;
        for _ in 0..12 {
            let (a, b) = ((1. - delta).max(0.), 1. + delta);
            let (ga, gb) = (g(a), g(b));
            if ga.is_finite() && gb.is_finite() && ga * gb <= 0. {
                bracket = Some((a, b));
                break;
            }
            if !gb.is_finite() {
                // beyond the traceable region: bisect toward sigma=1
                delta *= 0.5;
            } else {
                delta *= 2.;
            }
        }
        let (a, b) = bracket?;
        let sigma = find_root_brent(a, b, &g, &mut 1e-12f64).ok()?;
        let params = at(sigma);
        let h = self.stop_hit(params).ok()?;
        let residual = (h[0] - target[0]).hypot(h[1] - target[1]);
        Some((params, residual))
    }
    /// Chief ray and the up, down, left and right marginal rays at the pupil fraction `rho`
    pub fn edge_rays(&self, rho: f64) -> Result<EdgeRays> {
        let chief = self.chief()?;
        let up = self.marginal(&chief, rho, Edge::Up.direction())?;
        let down = self.marginal(&chief, rho, Edge::Down.direction())?;
        let left = self.marginal(&chief, rho, Edge::Left.direction())?;
        let right = self.marginal(&chief, rho, Edge::Right.direction())?;
        Ok(EdgeRays {
            chief,
            up,
            down,
            left,
            right,
        })
    }
}

/// Maps a ray failure to a request error
fn failure(location: &'static str, reason: RayFailure, context: &str) -> Error {
    match reason {
        RayFailure::Domain => Error::domain(location, format!("{}: {}", context, reason)),
        _ => Error::non_convergence(location, format!("{}: {}", context, reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{glass::GlassCatalog, surface::Surface};

    fn system(object: f64) -> OpticalSystem {
        OpticalSystem::new(
            vec![
                Surface::object(object),
                Surface::standard(40., 4.).set_index(1.6).set_semi_diameter(10.),
                Surface::standard(-80., 5.).set_semi_diameter(10.),
                Surface::stop(4., 60.),
                Surface::image(),
            ],
            0.55,
            &GlassCatalog::new(),
        )
        .unwrap()
    }

    #[test]
    fn chief_ray_hits_stop_center() {
        let system = system(f64::INFINITY);
        let aimer = Aimer::new(&system, Field::angle(3., -2.)).unwrap();
        let chief = aimer.chief().unwrap();
        assert!(chief.residual < CHIEF_TOLERANCE);
        let hit = chief.trace.at(3).unwrap().point;
        assert!(system.frame(3).to_local(&hit).norm() < 1e-8);
    }

    #[test]
    fn finite_object_chief_ray() {
        let system = system(150.);
        let aimer = Aimer::new(&system, Field::height(2., 5.)).unwrap();
        let chief = aimer.chief().unwrap();
        assert!(chief.residual < CHIEF_TOLERANCE);
        assert!(chief.trace.is_ok());
    }

    #[test]
    fn marginal_rays_hit_stop_edge() {
        let system = system(f64::INFINITY);
        let aimer = Aimer::new(&system, Field::angle(0., 4.)).unwrap();
        let edges = aimer.edge_rays(0.9).unwrap();
        for (ray, dir) in [
            (&edges.up, [0., 1.]),
            (&edges.down, [0., -1.]),
            (&edges.left, [-1., 0.]),
            (&edges.right, [1., 0.]),
        ] {
            assert!(ray.residual <= 1e-4 * 4., "{:?}: {}", dir, ray.residual);
            let hit = system.frame(3).to_local(&ray.trace.at(3).unwrap().point);
            assert!((hit.x - 3.6 * dir[0]).abs() < 4e-4);
            assert!((hit.y - 3.6 * dir[1]).abs() < 4e-4);
        }
        assert_eq!(edges.polylines().len(), 5);
    }

    fn hemisphere() -> OpticalSystem {
        OpticalSystem::new(
            vec![
                Surface::object(f64::INFINITY),
                Surface::standard(5., 2.).set_semi_diameter(5.),
                Surface::image(),
            ],
            0.55,
            &GlassCatalog::new(),
        )
        .unwrap()
    }

    #[test]
    fn failed_difference_ray_is_a_ray_failure() {
        let system = hemisphere();
        let aimer = Aimer::new(&system, Field::default()).unwrap();
        // the +η difference ray leaves the sag domain of the R=5 sphere
        let p = [0., 5. - 0.5 * JACOBIAN_STEP];
        let f0 = aimer.stop_hit(p).unwrap();
        let e = aimer.jacobian(p, &f0).unwrap_err();
        assert!(
            matches!(e.kind, ErrorKind::Domain | ErrorKind::NonConvergence),
            "{}",
            e
        );
    }

    #[test]
    fn converged_guess_without_jacobian() {
        let system = hemisphere();
        let aimer = Aimer::new(&system, Field::default()).unwrap();
        let p = [0., 5. - 0.5 * JACOBIAN_STEP];
        let f0 = aimer.stop_hit(p).unwrap();
        let (params, residual, j, iterations) = aimer.solve([f0[0], f0[1]], p, 1e-9).unwrap();
        assert_eq!(params, p);
        assert_eq!(residual, 0.);
        assert!(j.is_none());
        assert_eq!(iterations, 0);
    }

    #[test]
    fn invalid_pupil_fraction() {
        let system = system(f64::INFINITY);
        let aimer = Aimer::new(&system, Field::default()).unwrap();
        let chief = aimer.chief().unwrap();
        assert!(aimer.marginal(&chief, 1.5, [0., 1.]).is_err());
        assert!(aimer.marginal(&chief, 0.5, [0., 0.]).is_err());
    }
}
