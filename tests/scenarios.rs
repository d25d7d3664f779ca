use ndarray::Array2;
use optrace::{
    analysis::{ImagePlacement, ANALYSIS},
    error::ErrorKind,
    paraxial::Paraxial,
    progress::Monitor,
    psf::{compute_psf, PsfSettings},
    pupil::build_pupil_map,
    Aimer, CancelToken, Edge, Field, GlassCatalog, OpticalSystem, Progress, PupilSpec, Ray,
    Surface, TiltOrder, Tracer, Vector,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::{Arc, Mutex};

const D_LINE: f64 = 0.5876;

fn plano_convex() -> Vec<Surface> {
    vec![
        Surface::object(f64::INFINITY),
        Surface::standard(51.68, 5.)
            .set_material("N-BK7")
            .set_semi_diameter(2.5),
        Surface::standard(f64::INFINITY, 95.).set_semi_diameter(12.5),
        Surface::image(),
    ]
}

fn doublet() -> Vec<Surface> {
    vec![
        Surface::object(f64::INFINITY),
        Surface::standard(50., 4.)
            .set_material("N-BK7")
            .set_semi_diameter(4.),
        Surface::standard(-50., 2.).set_semi_diameter(10.),
        Surface::standard(30., 4.)
            .set_material("N-BK7")
            .set_semi_diameter(10.),
        Surface::standard(-30., 20.).set_semi_diameter(10.),
        Surface::image(),
    ]
}

fn at_paraxial_focus(surfaces: Vec<Surface>) -> OpticalSystem {
    let mut system = OpticalSystem::new(surfaces, D_LINE, &GlassCatalog::builtin()).unwrap();
    let t = Paraxial::new(&system).image_distance().unwrap();
    system.refocus(t).unwrap();
    system
}

#[test]
fn s1_on_axis_plano_convex() {
    let report = ANALYSIS::default()
        .set_wavelength(D_LINE)
        .set_field(Field::angle(0., 0.))
        .set_pupil(PupilSpec::grid(64))
        .set_image_placement(ImagePlacement::Paraxial)
        .build(plano_convex(), &GlassCatalog::builtin())
        .unwrap()
        .run()
        .unwrap();
    assert!(report.strehl >= 0.99, "Strehl: {}", report.strehl);
    assert!(report.rms_waves <= 0.02, "RMS: {}λ", report.rms_waves);
    // chief node of the raw OPD
    let c = report.pupil.size / 2;
    assert!(report.pupil.raw[[c, c]].abs() < 1e-3);
}

#[test]
fn s2_edge_marginal_ray() {
    let system = at_paraxial_focus(plano_convex());
    let aimer = Aimer::new(&system, Field::angle(0., 0.)).unwrap();
    let chief = aimer.chief().unwrap();
    let up = aimer.marginal(&chief, 0.98, Edge::Up.direction()).unwrap();
    let r = aimer.stop_radius();
    assert!(up.residual <= 1e-4 * r, "residual: {}", up.residual);
    assert!(up.trace.is_ok(), "{}", up.trace.status);
    let hit = up.trace.at(aimer.stop()).unwrap().point;
    assert!((hit.y - 0.98 * r).abs() <= 1e-4 * r);
}

#[test]
fn s3_off_axis_coma() {
    let report = ANALYSIS::default()
        .set_wavelength(D_LINE)
        .set_field(Field::angle(5., 0.))
        .set_pupil(PupilSpec::grid(128))
        .set_image_placement(ImagePlacement::Paraxial)
        .set_parallel(true)
        .build(doublet(), &GlassCatalog::builtin())
        .unwrap()
        .run()
        .unwrap();
    let z8 = report.zernike().and_then(|z| z.get(8)).unwrap();
    assert!(z8.abs() > 0.05, "Z8: {}λ", z8);
    let c = report.pupil.size / 2;
    assert!(report.pupil.raw[[c, c]].abs() < 1e-3);
    assert!(report.strehl >= 0. && report.strehl <= 1.);
}

#[test]
fn s4_strehl_monotonicity() {
    let system = at_paraxial_focus(plano_convex());
    let monitor = Monitor::default();
    let pupil = build_pupil_map(&system, Field::default(), &PupilSpec::grid(64), &monitor, false)
        .unwrap();
    let geometry = optrace::PsfGeometry::new(5., Paraxial::new(&system).efl().unwrap());
    let mut rng = StdRng::seed_from_u64(20231017);
    let strehl: Vec<f64> = [0., 0.05, 0.1, 0.2]
        .iter()
        .map(|sigma| {
            let mut opd = pupil.z_opd.clone();
            if *sigma > 0. {
                let noise = Normal::new(0., sigma * D_LINE).unwrap();
                opd.zip_mut_with(&pupil.mask, |v, m| {
                    if *m {
                        *v += noise.sample(&mut rng)
                    }
                });
            }
            compute_psf(
                &opd,
                &pupil.amp,
                &pupil.mask,
                D_LINE,
                geometry,
                &PsfSettings::default(),
                &monitor,
            )
            .unwrap()
            .strehl
        })
        .collect();
    assert!(strehl.iter().all(|s| (0. ..=1.).contains(s)));
    assert!(
        strehl.windows(2).all(|w| w[1] < w[0]),
        "Strehl: {:?}",
        strehl
    );
}

#[test]
fn s5_cancellation() {
    let token = CancelToken::new();
    let token_ = token.clone();
    let seen = Arc::new(Mutex::new(vec![]));
    let seen_ = seen.clone();
    let result = ANALYSIS::default()
        .set_pupil(PupilSpec::grid(64))
        .set_image_placement(ImagePlacement::Paraxial)
        .set_cancel(token)
        .set_progress(Arc::new(move |p: Progress| {
            if p.percent >= 40. {
                token_.cancel();
            }
            seen_.lock().unwrap().push(p.percent);
        }))
        .build(plano_convex(), &GlassCatalog::builtin())
        .unwrap()
        .run();
    let e = result.unwrap_err();
    assert_eq!(e.kind, ErrorKind::Cancelled);
    // one grid row is 75/64 percent
    let last = seen.lock().unwrap().iter().cloned().fold(0., f64::max);
    assert!(last >= 40. && last < 40. + 75. / 64. + 1e-9, "last progress: {}", last);
}

#[test]
fn s6_reversibility() {
    let system = at_paraxial_focus(plano_convex());
    let tracer = Tracer::new(&system);
    let start = Vector::new(0., 0., -25.);
    let (s, c) = 3f64.to_radians().sin_cos();
    let u = Vector::new(s, 0., c);
    let forward = tracer.trace(Ray::new(start, u, D_LINE));
    assert!(forward.is_ok(), "{}", forward.status);
    let backward = tracer.trace_backward(forward.ray.reversed(), system.image());
    assert!(backward.is_ok(), "{}", backward.status);
    let ray = backward.ray;
    let s = (start.z - ray.p.z) / ray.u.z;
    assert!((ray.at(s) - start).norm() < 1e-3);
}

#[test]
fn paraxial_consistency() {
    let system = OpticalSystem::new(
        vec![
            Surface::object(f64::INFINITY),
            Surface::standard(50., 1.).set_index(1.5).set_semi_diameter(5.),
            Surface::standard(-50., 60.).set_semi_diameter(5.),
            Surface::image(),
        ],
        D_LINE,
        &GlassCatalog::builtin(),
    )
    .unwrap();
    let bfl = Paraxial::new(&system).bfl().unwrap();
    assert!((bfl - 49.8328).abs() < 1e-3, "BFL: {}", bfl);
    let trace = Tracer::new(&system).trace_to(
        Ray::new(Vector::new(0., 0.1, -10.), Vector::z(), D_LINE),
        2,
    );
    assert!(trace.is_ok());
    let ray = trace.ray;
    let s = -ray.p.y / ray.u.y;
    let real = ray.at(s).z - system.frame(2).origin.z;
    assert!(((real - bfl) / bfl).abs() < 1e-3, "real {} vs paraxial {}", real, bfl);
}

#[test]
fn diffraction_limited_strehl_and_energy() {
    let n = 64;
    let x = optrace::pupil::pupil_coordinates(n);
    let mask = Array2::from_shape_fn((n, n), |(i, j)| x[i].hypot(x[j]) <= 1.);
    let amp = mask.mapv(|m| if m { 1. } else { 0. });
    let psf = compute_psf(
        &Array2::zeros((n, n)),
        &amp,
        &mask,
        D_LINE,
        optrace::PsfGeometry::from_f_number(20.),
        &PsfSettings {
            padding: 2,
            ee_radii: vec![f64::INFINITY],
        },
        &Monitor::default(),
    )
    .unwrap();
    assert!((psf.strehl - 1.).abs() < 1e-9);
    assert!((psf.ee_values[0] - 1.).abs() < 1e-6);
}

#[test]
fn parallel_matches_serial() {
    let system = at_paraxial_focus(plano_convex());
    let field = Field::angle(0., 1.);
    let spec = PupilSpec::grid(32);
    let monitor = Monitor::default();
    let serial = build_pupil_map(&system, field, &spec, &monitor, false).unwrap();
    let parallel = build_pupil_map(&system, field, &spec, &monitor, true).unwrap();
    assert_eq!(serial.mask, parallel.mask);
    for (a, b) in serial.raw.iter().zip(parallel.raw.iter()) {
        assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()));
    }
}

#[test]
fn decentered_lens_wavefront() {
    let mut surfaces = plano_convex();
    surfaces[1] = surfaces[1]
        .clone()
        .set_decenter([0., 0.2])
        .set_tilt([0.5, 0., 0.], TiltOrder::XYZ);
    let system = at_paraxial_focus(surfaces);
    // the lens pose carries to the image surface
    let z = system.frame(system.image()).rotation.column(2).into_owned();
    assert!((z.y + 0.5f64.to_radians().sin()).abs() < 1e-12);
    let spec = PupilSpec::grid(32);
    let monitor = Monitor::default();
    let serial = build_pupil_map(&system, Field::default(), &spec, &monitor, false).unwrap();
    assert_eq!(serial.failures, 0);
    assert!(serial.valid_count() > 750, "{}", serial);
    assert!(serial
        .raw
        .iter()
        .zip(serial.mask.iter())
        .all(|(v, m)| !*m || v.is_finite()));
    let c = serial.size / 2;
    assert!(serial.raw[[c, c]].abs() < 1e-3);
    assert!(serial.rms_waves() < 0.25, "{}", serial);
    let parallel = build_pupil_map(&system, Field::default(), &spec, &monitor, true).unwrap();
    assert_eq!(serial.mask, parallel.mask);
    for (a, b) in serial.raw.iter().zip(parallel.raw.iter()) {
        assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()));
    }
}
