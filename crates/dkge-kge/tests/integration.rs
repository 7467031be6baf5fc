//! End-to-end checks across modules, all inside one process.

use dkge_core::{Dataset, EvalGraph, Triple};
use dkge_kge::checkpoint::{load_checkpoint, prepare_run_dir};
use dkge_kge::{
    CandidateSet, EvaluationService, Evaluator, ModelName, Orchestrator, Scorer, ServiceClient,
    SharedEmbeddingStore, StoreShape, Table, TrainConfig,
};
use ndarray::array;

fn toy_dataset() -> Dataset {
    Dataset::from_triples(
        "toy",
        4,
        2,
        vec![
            Triple::new(0, 0, 1),
            Triple::new(1, 0, 2),
            Triple::new(2, 0, 3),
            Triple::new(0, 1, 3),
            Triple::new(3, 1, 1),
            Triple::new(2, 1, 0),
        ],
        vec![],
        vec![],
    )
    .unwrap()
}

fn toy_config(save: &std::path::Path) -> TrainConfig {
    TrainConfig::default()
        .with_dataset("data", "toy")
        .with_save_path(save)
        .with_hidden_dim(8)
        .with_batch_size(2)
        .with_neg_sample_size(2)
        .with_max_step(10)
}

#[test]
fn single_process_run_exports_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = toy_config(dir.path());
    config.save_emb = Some(dir.path().join("emb"));

    let run_dir = prepare_run_dir(dir.path(), ModelName::TransE, "toy").unwrap();
    let summary = Orchestrator::new(config).run_with(toy_dataset(), &run_dir).unwrap();
    assert_eq!(summary.total_steps, 10);
    assert!(run_dir.join("worker_0.json").exists());

    let ckpt = load_checkpoint(&dir.path().join("emb"), "toy", ModelName::TransE).unwrap();
    assert_eq!(ckpt.entities.dim(), (4, 8));
    assert_eq!(ckpt.relations.dim(), (2, 8));
}

#[test]
fn relation_partition_with_too_many_workers_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = toy_config(dir.path()).with_num_proc(3).with_rel_part(true);
    let run_dir = prepare_run_dir(dir.path(), ModelName::TransE, "toy").unwrap();

    let err = Orchestrator::new(config)
        .with_program(dir.path().join("no-such-program"))
        .run_with(toy_dataset(), &run_dir)
        .unwrap_err();
    assert!(err.is_configuration(), "unexpected error: {err}");
}

#[test]
fn identical_runs_get_distinct_directories() {
    let dir = tempfile::tempdir().unwrap();
    let a = prepare_run_dir(dir.path(), ModelName::DistMult, "toy").unwrap();
    let b = prepare_run_dir(dir.path(), ModelName::DistMult, "toy").unwrap();
    assert_ne!(a, b);
    assert_eq!(a.parent(), b.parent());
    assert_eq!(a.file_name().unwrap(), "DistMult_toy_0");
    assert_eq!(b.file_name().unwrap(), "DistMult_toy_1");
}

#[test]
fn store_handles_share_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.bin");
    let writer = SharedEmbeddingStore::create(&path, StoreShape::new(3, 1, 2, 2)).unwrap();
    let reader = SharedEmbeddingStore::open(&path).unwrap();

    writer.update(Table::Entity, &[1], &array![[0.5, -0.5]]).unwrap();
    reader.update(Table::Entity, &[1], &array![[0.5, 0.5]]).unwrap();
    assert_eq!(writer.read_row(Table::Entity, 1).unwrap(), vec![1.0, 0.0]);
}

#[test]
fn ranking_through_the_service_matches_the_local_graph() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("eval.sock");
    let dataset = toy_dataset();
    let mut local = EvalGraph::from_dataset(&dataset);
    let handle = EvaluationService::bind(EvalGraph::from_dataset(&dataset), &socket, 2)
        .unwrap()
        .spawn();

    let scorer = Scorer::new(dkge_kge::ScoringFunction::DistMult, 0.0, 1.0);
    let entities = array![[1.0, 0.2], [0.3, 1.0], [-0.5, 0.4], [0.9, -0.7]];
    let relations = array![[1.0, 1.0], [0.5, -1.0]];
    let evaluator = Evaluator::new(&scorer, entities, relations).with_batch_size(2);
    let triples = dataset.train().to_vec();

    let mut client = ServiceClient::connect(&socket).unwrap();
    let remote = evaluator
        .evaluate(&triples, CandidateSet::All, Some(&mut client), 0)
        .unwrap();
    let in_memory = evaluator
        .evaluate(&triples, CandidateSet::All, Some(&mut local), 0)
        .unwrap();
    assert_eq!(remote, in_memory);
    assert_eq!(remote.num_triples, 12);

    drop(client);
    ServiceClient::connect(&socket).unwrap().shutdown().unwrap();
    handle.join().unwrap().unwrap();
}
