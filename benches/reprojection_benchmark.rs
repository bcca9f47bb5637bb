//! Reprojection solve benchmark
//!
//! Times one error function evaluation and a full bundle solve on a generated
//! scene, for the dense and the sparse engine.
//!
//! ## Usage
//!
//! ```bash
//! cargo bench --bench reprojection_benchmark
//! ```

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use matchmove_solver::core::{
    AttributeStore, ErrorIndex, Frame, NoProgress, ParameterIndex, ReprojectionErrorFunction,
    SolveObjects,
};
use matchmove_solver::optimizer::{ErrorFunction, EvaluationPhase};
use matchmove_solver::scene::MemoryScene;
use matchmove_solver::{EngineKind, SolveController, SolverOptions};
use nalgebra::{Point3, Vector3};
use std::hint::black_box;

const FRAMES: i32 = 10;

/// A camera dollying along X past `n` bundles, markers placed on the projections.
fn generated_scene(n: usize) -> (MemoryScene, SolveObjects) {
    let mut scene = MemoryScene::new();
    let frames: Vec<Frame> = (1..=FRAMES).map(Frame).collect();
    let camera = scene.add_camera(
        "cam",
        Vector3::new(0.0, 0.0, 12.0),
        Vector3::zeros(),
        35.0,
        (36.0, 24.0),
    );
    if let Some(tx) = scene.camera(camera).map(|c| c.translate[0]) {
        let _ = scene.animate_attribute(tx, frames.iter().map(|&f| (f, 0.3 * f64::from(f.0))));
    }

    let mut markers = Vec::with_capacity(n);
    let mut bundles = Vec::with_capacity(n);
    let mut attributes = Vec::with_capacity(3 * n);
    for i in 0..n {
        let t = i as f64;
        let point = Point3::new(
            (t * 1.3) % 4.0 - 2.0,
            (t * 0.7) % 3.0 - 1.5,
            (t * 0.9) % 2.0 - 1.0,
        );
        let bundle = scene.add_bundle(&format!("bundle{i}"), point);
        let marker = scene.add_marker(&format!("marker{i}"), camera, bundle);
        for &frame in &frames {
            let _ = scene.place_marker_on_bundle(marker, frame);
        }
        if let Some(b) = scene.bundle(bundle) {
            attributes.extend(b.translate);
        }
        bundles.push(bundle);
        markers.push(marker);
    }

    for &attr in &attributes {
        if let Ok(value) = scene.get_value(attr, None) {
            let _ = scene.set_value(attr, value + 0.05, None);
        }
    }
    let _ = scene.commit_batch();

    let objects = SolveObjects::new()
        .with_cameras([camera])
        .with_markers(markers)
        .with_bundles(bundles)
        .with_attributes(attributes)
        .with_frames(frames);
    (scene, objects)
}

fn bench_error_function(c: &mut Criterion) {
    let mut group = c.benchmark_group("error_function");
    for n in [10, 50] {
        let (mut scene, objects) = generated_scene(n);
        let Ok(parameters) =
            ParameterIndex::build(&scene, &objects.attributes, objects.frames.len())
        else {
            continue;
        };
        let Ok(errors) = ErrorIndex::build(&scene, &objects.markers, &objects.frames) else {
            continue;
        };
        let params: Vec<f64> = objects
            .attributes
            .iter()
            .filter_map(|&attr| scene.get_value(attr, None).ok())
            .collect();
        let mut output = vec![0.0; errors.error_count()];
        let Ok(mut function) =
            ReprojectionErrorFunction::new(&mut scene, &NoProgress, &objects, &parameters, &errors)
        else {
            continue;
        };

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                function.evaluate(black_box(&params), &mut output, EvaluationPhase::Nominal);
                black_box(output[0])
            })
        });
    }
    group.finish();
}

fn bench_bundle_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_solve");
    group.sample_size(10);
    for engine in [EngineKind::DenseLM, EngineKind::SparseLM] {
        group.bench_function(BenchmarkId::new(engine.to_string(), 30), |b| {
            b.iter_with_setup(
                || generated_scene(30),
                |(mut scene, objects)| {
                    let options = SolverOptions::new().with_engine(engine);
                    let report =
                        SolveController::new(options).solve(&mut scene, &objects, &NoProgress);
                    black_box(report.map(|r| r.mean_error).ok())
                },
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_error_function, bench_bundle_solve);
criterion_main!(benches);
