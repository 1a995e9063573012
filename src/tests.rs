use crate::knn::{DistanceKernel, KernelError, MatmulKernel, NearestEntry};
use crate::{
    parse_metadata, parse_tensors, Dataset, DriverConfiguration, MetadataValue, MismatchKind,
    OptimizerEngine, ParseOptions, Point, ProjectorError, RunParameters, RunState, StepCallback,
    TickOutcome,
};
use ndarray::{Array2, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::ops::Range;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Everything a [`MockEngine`] was told.
#[derive(Debug, Default)]
struct EngineLog {
    neighbor_lists: Vec<usize>,
    k: Vec<usize>,
    steps: usize,
    perturbs: usize,
    labels: Option<Vec<String>>,
    auxiliary: String,
    factor: Option<f32>,
}

/// Engine whose layout is the point's row number along every axis.
struct MockEngine {
    dimensions: usize,
    solution: Vec<f32>,
    log: Arc<Mutex<EngineLog>>,
}

impl MockEngine {
    fn boxed(dimensions: usize) -> (Box<dyn OptimizerEngine>, Arc<Mutex<EngineLog>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let engine = MockEngine {
            dimensions,
            solution: Vec::new(),
            log: Arc::clone(&log),
        };
        (Box::new(engine), log)
    }
}

impl OptimizerEngine for MockEngine {
    fn init(&mut self, neighbors: &[Vec<NearestEntry>]) -> Result<(), ProjectorError> {
        let mut log = self.log.lock().unwrap();
        log.neighbor_lists.push(neighbors.len());
        log.k.push(neighbors.first().map_or(0, Vec::len));
        self.solution = (0..neighbors.len() * self.dimensions)
            .map(|i| (i / self.dimensions) as f32)
            .collect();
        Ok(())
    }

    fn step(&mut self) {
        self.log.lock().unwrap().steps += 1;
    }

    fn solution(&self) -> &[f32] {
        &self.solution
    }

    fn perturb(&mut self) {
        self.log.lock().unwrap().perturbs += 1;
        self.solution.iter_mut().for_each(|x| *x += 100.0);
    }

    fn dimensionality(&self) -> usize {
        self.dimensions
    }

    fn set_supervision(&mut self, labels: Option<&[String]>, auxiliary: &str) {
        let mut log = self.log.lock().unwrap();
        log.labels = labels.map(<[String]>::to_vec);
        auxiliary.clone_into(&mut log.auxiliary);
    }

    fn set_supervise_factor(&mut self, factor: f32) {
        self.log.lock().unwrap().factor = Some(factor);
    }
}

/// Matmul kernel that counts how many blocks it computed.
#[derive(Default)]
struct CountingKernel {
    blocks: AtomicUsize,
}

impl DistanceKernel for CountingKernel {
    fn similarities(
        &self,
        data: ArrayView2<f32>,
        rows: Range<usize>,
    ) -> Result<Array2<f32>, KernelError> {
        self.blocks.fetch_add(1, Ordering::SeqCst);
        MatmulKernel.similarities(data, rows)
    }
}

fn recorder() -> (StepCallback, Rc<RefCell<Vec<Option<usize>>>>) {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    (
        Box::new(move |iteration: Option<usize>| sink.borrow_mut().push(iteration)),
        calls,
    )
}

/// `clusters` groups of `per_cluster` points, each group offset along its own
/// set of axes.
fn clustered(per_cluster: usize, clusters: usize, dim: usize, seed: u64) -> Vec<Point> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..per_cluster * clusters)
        .map(|i| {
            let cluster = i / per_cluster;
            let vector = (0..dim)
                .map(|d| {
                    let offset = if d % clusters == cluster { 5.0f32 } else { 0.0 };
                    offset + rng.gen_range(-0.5f32..0.5)
                })
                .collect();
            Point::new(i, vector)
        })
        .collect()
}

fn params(perplexity: f32) -> RunParameters {
    RunParameters::builder().perplexity(perplexity).build()
}

#[test]
fn test_tensor_parse_examples() {
    let options = ParseOptions::default();

    let points = parse_tensors(&b"1.0\t2.0\t3.0\n4.0\t5.0\t6.0\n"[..], &options).unwrap();
    assert_eq!(points.len(), 2);
    assert!(points.iter().all(|p| p.vector.len() == 3 && p.metadata.is_empty()));

    let points = parse_tensors(&b"cat\t1.0\t2.0\ndog\t3.0\t4.0\n"[..], &options).unwrap();
    assert_eq!(points[1].vector, vec![3.0, 4.0]);
    assert_eq!(
        points[1].metadata.get("label"),
        Some(&MetadataValue::Text("dog".to_owned()))
    );
}

#[test]
fn test_sequence_example() {
    let links = [Some(2.0), None, Some(3.0), None];
    let points = links
        .iter()
        .enumerate()
        .map(|(i, link)| {
            let mut point = Point::new(i, vec![i as f32, 0.5]);
            if let Some(next) = link {
                point
                    .metadata
                    .insert("__seq_next__".to_owned(), MetadataValue::Number(*next));
            }
            point
        })
        .collect();

    let dataset = Dataset::new(points).unwrap();
    assert_eq!(dataset.sequences().len(), 1);
    assert_eq!(dataset.sequences()[0].point_indices, vec![0, 2, 3]);
    assert_eq!(dataset.points()[1].sequence_index, None);
}

#[test]
fn test_metadata_header_mismatches() {
    let options = ParseOptions::default();
    let mut dataset = Dataset::new(clustered(3, 1, 2, 1)).unwrap();

    // One column with a stray header line: four records for three points.
    let single = parse_metadata(&b"name\na\nb\nc\n"[..], &options, 50).unwrap();
    assert!(matches!(
        dataset.merge_metadata(single),
        Err(ProjectorError::MetadataShapeMismatch {
            kind: MismatchKind::SingleColumnHeader,
            points: 3,
            records: 4
        })
    ));

    // Two columns without a header: the first row is consumed as one.
    let headerless = parse_metadata(&b"a\t1\nb\t2\nc\t3\n"[..], &options, 50).unwrap();
    assert!(matches!(
        dataset.merge_metadata(headerless),
        Err(ProjectorError::MetadataShapeMismatch {
            kind: MismatchKind::MissingHeader,
            points: 3,
            records: 2
        })
    ));

    let good = parse_metadata(&b"name\tsize\na\t1\nb\t2\nc\t\n"[..], &options, 50).unwrap();
    dataset.merge_metadata(good).unwrap();
    assert_eq!(
        dataset.points()[1].metadata.get("size"),
        Some(&MetadataValue::Number(2.0))
    );
    assert_eq!(
        dataset.points()[2].metadata.get("size"),
        Some(&MetadataValue::Missing)
    );
    let stats = &dataset.sprite_and_metadata_info().unwrap().stats;
    assert!(stats[1].is_numeric);
}

#[test]
fn test_stop_while_running() {
    let mut dataset = Dataset::new(clustered(4, 2, 3, 2)).unwrap();
    let (engine, log) = MockEngine::boxed(2);
    let (on_step, calls) = recorder();

    dataset
        .start_run_with_engine(params(1.0), engine, on_step)
        .unwrap();
    assert_eq!(dataset.run_state(), RunState::Running);
    assert!(dataset.has_run());
    assert!(dataset.has_projection("tsne"));

    assert_eq!(dataset.tick(), TickOutcome::Stepped(1));
    assert_eq!(dataset.tick(), TickOutcome::Stepped(2));
    assert_eq!(dataset.iteration(), 2);

    dataset.stop();
    assert_eq!(*calls.borrow(), vec![Some(1), Some(2), None]);
    assert_eq!(dataset.run_state(), RunState::Stopped);
    assert!(!dataset.has_run());
    assert!(!dataset.has_projection("tsne"));

    let before: Vec<_> = dataset.points().iter().map(|p| p.projections.clone()).collect();
    dataset.perturb();
    let after: Vec<_> = dataset.points().iter().map(|p| p.projections.clone()).collect();
    assert_eq!(before, after);
    assert_eq!(log.lock().unwrap().perturbs, 0);
    assert!(before.iter().all(|p| p.contains_key("tsne-0")));

    assert_eq!(dataset.tick(), TickOutcome::Stopped);
    assert_eq!(calls.borrow().len(), 3);
}

#[test]
fn test_pause_resume_and_stop_while_paused() {
    let mut dataset = Dataset::new(clustered(4, 2, 3, 3)).unwrap();
    let (engine, log) = MockEngine::boxed(3);
    let (on_step, calls) = recorder();
    let params = RunParameters::builder().perplexity(1.0).dimensions(3).build();
    dataset
        .start_run_with_engine(params, engine, on_step)
        .unwrap();

    assert_eq!(dataset.tick(), TickOutcome::Stepped(1));
    dataset.pause();
    assert_eq!(dataset.run_state(), RunState::Paused);
    assert_eq!(dataset.tick(), TickOutcome::Paused);
    assert_eq!(dataset.tick(), TickOutcome::Paused);
    assert_eq!(dataset.iteration(), 1);
    assert_eq!(log.lock().unwrap().steps, 1);

    dataset.perturb();
    assert_eq!(log.lock().unwrap().perturbs, 1);
    let moved = dataset
        .points()
        .iter()
        .filter_map(|p| p.projections.get("tsne-2"))
        .all(|&x| x >= 100.0);
    assert!(moved);

    dataset.resume();
    assert_eq!(dataset.tick(), TickOutcome::Stepped(2));

    dataset.pause();
    dataset.stop();
    assert_eq!(*calls.borrow(), vec![Some(1), Some(2), None]);
    assert_eq!(dataset.tick(), TickOutcome::Stopped);
}

#[test]
fn test_stop_from_another_thread() {
    let mut dataset = Dataset::new(clustered(4, 2, 3, 4)).unwrap();
    let (engine, _log) = MockEngine::boxed(2);
    let (on_step, calls) = recorder();
    dataset
        .start_run_with_engine(params(1.0), engine, on_step)
        .unwrap();
    assert_eq!(dataset.tick(), TickOutcome::Stepped(1));

    let control = dataset.control();
    std::thread::spawn(move || control.stop()).join().unwrap();

    assert!(!dataset.has_run());
    assert_eq!(dataset.tick(), TickOutcome::Stopped);
    assert_eq!(*calls.borrow(), vec![Some(1), None]);
    assert_eq!(dataset.tick(), TickOutcome::Stopped);
    assert_eq!(calls.borrow().len(), 2);
}

#[test]
fn test_new_run_stops_previous() {
    let mut dataset = Dataset::new(clustered(4, 2, 3, 5)).unwrap();
    let (first_engine, _) = MockEngine::boxed(2);
    let (second_engine, _) = MockEngine::boxed(2);
    let (first_step, first_calls) = recorder();
    let (second_step, second_calls) = recorder();

    dataset
        .start_run_with_engine(params(1.0), first_engine, first_step)
        .unwrap();
    dataset.tick();
    dataset
        .start_run_with_engine(params(1.0), second_engine, second_step)
        .unwrap();

    assert_eq!(*first_calls.borrow(), vec![Some(1), None]);
    assert_eq!(dataset.iteration(), 0);
    assert_eq!(dataset.tick(), TickOutcome::Stepped(1));
    assert_eq!(*second_calls.borrow(), vec![Some(1)]);
}

#[test]
fn test_invalid_dimensions_leave_run_alone() {
    let mut dataset = Dataset::new(clustered(4, 2, 3, 6)).unwrap();
    let (engine, _) = MockEngine::boxed(4);
    let (on_step, _) = recorder();
    let params = RunParameters::builder().dimensions(4).build();

    assert!(matches!(
        dataset.start_run_with_engine(params, engine, on_step),
        Err(ProjectorError::InvalidEmbeddingDimensions(4))
    ));
    assert_eq!(dataset.run_state(), RunState::Idle);
    assert_eq!(dataset.tick(), TickOutcome::Idle);
}

#[test]
fn test_engine_dimensionality_must_match_run() {
    let mut dataset = Dataset::new(clustered(4, 2, 3, 13)).unwrap();

    for engine_dimensions in [4, 3] {
        let (engine, log) = MockEngine::boxed(engine_dimensions);
        let (on_step, calls) = recorder();
        assert!(matches!(
            dataset.start_run_with_engine(params(1.0), engine, on_step),
            Err(ProjectorError::InvalidEmbeddingDimensions(d)) if d == engine_dimensions
        ));
        assert!(log.lock().unwrap().neighbor_lists.is_empty());
        assert!(calls.borrow().is_empty());
    }
    assert_eq!(dataset.run_state(), RunState::Idle);

    let (engine, _) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(1.0), engine, on_step)
        .unwrap();
    assert_eq!(dataset.tick(), TickOutcome::Stepped(1));
    for point in dataset.points() {
        let x = point.projections["tsne-0"];
        assert_eq!(point.projections.get("tsne-1"), Some(&x));
        assert!(!point.projections.contains_key("tsne-2"));
    }
}

#[test]
fn test_neighbor_cache_reuse() {
    let kernel = Arc::new(CountingKernel::default());
    let mut dataset = Dataset::new(clustered(10, 2, 4, 7))
        .unwrap()
        .with_kernel(Arc::clone(&kernel) as Arc<dyn DistanceKernel>);
    let blocks = || kernel.blocks.load(Ordering::SeqCst);

    let (engine, log) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(2.0), engine, on_step)
        .unwrap();
    let computed = blocks();
    assert!(computed > 0);
    assert_eq!(log.lock().unwrap().k, vec![6]);
    assert_eq!(dataset.nearest().map(|(_, k)| k), Some(6));

    // Same k: reused.
    let (engine, _) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(2.2), engine, on_step)
        .unwrap();
    assert_eq!(blocks(), computed);

    // Larger k: recomputed.
    let (engine, log) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(3.0), engine, on_step)
        .unwrap();
    assert!(blocks() > computed);
    assert_eq!(log.lock().unwrap().k, vec![9]);

    // Normalizing drops the cache.
    let recomputed = blocks();
    dataset.normalize().unwrap();
    assert!(dataset.nearest().is_none());
    let (engine, _) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(3.0), engine, on_step)
        .unwrap();
    assert!(blocks() > recomputed);
}

/// Kernel that always fails.
struct FailingKernel;

impl DistanceKernel for FailingKernel {
    fn similarities(
        &self,
        _data: ArrayView2<f32>,
        _rows: Range<usize>,
    ) -> Result<Array2<f32>, KernelError> {
        Err(KernelError::ComputeFailure("device lost".to_owned()))
    }
}

/// Neighbor table a run builds over `points`, on the CPU or through `kernel`.
fn neighbor_table(
    points: Vec<Point>,
    kernel: Option<Arc<dyn DistanceKernel>>,
    normalize: bool,
    perplexity: f32,
) -> Vec<Vec<NearestEntry>> {
    let config = DriverConfiguration::builder()
        .accelerated_knn(kernel.is_some())
        .seed(3)
        .build();
    let mut dataset = Dataset::with_config(points, config).unwrap();
    if let Some(kernel) = kernel {
        dataset = dataset.with_kernel(kernel);
    }
    if normalize {
        dataset.normalize().unwrap();
    }

    let (engine, _) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(perplexity), engine, on_step)
        .unwrap();
    dataset.nearest().unwrap().0.to_vec()
}

#[test]
fn test_failing_kernel_falls_back_to_cpu() {
    let points = clustered(6, 2, 4, 12);
    let cpu = neighbor_table(points.clone(), None, false, 1.7);
    let failing = neighbor_table(points, Some(Arc::new(FailingKernel)), false, 1.7);
    assert_eq!(cpu, failing);
}

#[test]
fn test_point_at_centroid_same_on_every_strategy() {
    // The last point becomes the all-zero vector after normalizing.
    let points: Vec<Point> = [[2.0, 0.0], [0.0, 2.0], [-2.0, 0.0], [0.0, -2.0], [0.0, 0.0]]
        .iter()
        .enumerate()
        .map(|(i, v)| Point::new(i, v.to_vec()))
        .collect();

    let cpu = neighbor_table(points.clone(), None, true, 0.4);
    let failing = neighbor_table(points.clone(), Some(Arc::new(FailingKernel)), true, 0.4);
    let accelerated = neighbor_table(points, Some(Arc::new(MatmulKernel)), true, 0.4);
    assert_eq!(cpu, failing);

    for table in [&cpu, &accelerated] {
        assert_eq!(table.len(), 5);
        for list in table {
            assert_eq!(list.len(), 1);
            assert!(
                (list[0].dist - 0.5).abs() < 1e-6,
                "Expected every nearest neighbor at 0.5, got {}",
                list[0].dist
            );
        }
    }
}

#[test]
fn test_sample_cap() {
    let config = DriverConfiguration::builder()
        .sample_size(10)
        .accelerated_knn(false)
        .seed(11)
        .build();
    let mut dataset = Dataset::with_config(clustered(15, 2, 4, 8), config).unwrap();
    let (engine, log) = MockEngine::boxed(2);
    let (on_step, _) = recorder();

    dataset
        .start_run_with_engine(params(1.0), engine, on_step)
        .unwrap();
    dataset.tick();

    assert_eq!(log.lock().unwrap().neighbor_lists, vec![10]);
    let (nearest, _) = dataset.nearest().unwrap();
    assert!(nearest.iter().all(|list| list.len() == 3));

    let written = dataset
        .points()
        .iter()
        .filter(|p| p.projections.contains_key("tsne-0"))
        .count();
    assert_eq!(written, 10);
}

#[test]
fn test_supervision_forwarding() {
    let mut dataset = Dataset::new(clustered(2, 2, 3, 9)).unwrap();
    let metadata = parse_metadata(
        &b"kind\tx\nfruit\t1\n\t2\nfruit\t3\nnut\t4\n"[..],
        &ParseOptions::default(),
        50,
    )
    .unwrap();
    dataset.merge_metadata(metadata).unwrap();

    dataset.set_supervision(Some("kind"), "nut");
    dataset.set_supervise_factor(0.25);

    let (engine, log) = MockEngine::boxed(2);
    let (on_step, _) = recorder();
    dataset
        .start_run_with_engine(params(1.0), engine, on_step)
        .unwrap();

    {
        let log = log.lock().unwrap();
        let mut labels = log.labels.clone().unwrap();
        labels.sort();
        assert_eq!(labels, vec!["Unknown #1", "fruit", "fruit", "nut"]);
        assert_eq!(log.auxiliary, "nut");
        assert_eq!(log.factor, Some(0.25));
    }

    dataset.set_supervision(None, "");
    assert!(log.lock().unwrap().labels.is_none());
}

#[test]
fn test_streamed_tensors_embed_clusters() {
    let points = clustered(20, 3, 9, 10);
    let mut text = String::new();
    for point in &points {
        let row: Vec<String> = point.vector.iter().map(f32::to_string).collect();
        writeln!(text, "{}", row.join("\t")).unwrap();
    }

    let options = ParseOptions::builder().chunk_size(97).build();
    let parsed = parse_tensors(text.as_bytes(), &options).unwrap();
    assert_eq!(parsed.len(), 60);
    assert_eq!(parsed[17].vector, points[17].vector);

    let config = DriverConfiguration::builder().seed(42).build();
    let mut dataset = Dataset::with_config(parsed, config).unwrap();
    dataset.normalize().unwrap();

    let (on_step, calls) = recorder();
    dataset.start_run(params(5.0), on_step).unwrap();
    for expected in 1..=300 {
        assert_eq!(dataset.tick(), TickOutcome::Stepped(expected));
    }
    dataset.stop();
    assert_eq!(calls.borrow().last(), Some(&None));

    let coords: Vec<[f32; 2]> = dataset
        .points()
        .iter()
        .map(|p| [p.projections["tsne-0"], p.projections["tsne-1"]])
        .collect();
    assert!(coords.iter().flatten().all(|x| x.is_finite()));

    let (mut intra, mut inter) = (0.0, 0.0);
    let (mut intra_count, mut inter_count) = (0, 0);
    for i in 0..coords.len() {
        for j in (i + 1)..coords.len() {
            let d = ((coords[i][0] - coords[j][0]).powi(2) + (coords[i][1] - coords[j][1]).powi(2))
                .sqrt();
            if i / 20 == j / 20 {
                intra += d;
                intra_count += 1;
            } else {
                inter += d;
                inter_count += 1;
            }
        }
    }
    intra /= intra_count as f32;
    inter /= inter_count as f32;
    assert!(
        intra < inter,
        "Cluster structure not preserved, intra: {intra}, inter: {inter}"
    );
}
