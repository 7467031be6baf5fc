//! Run directories and embedding export.

use crate::config::{ModelName, TrainConfig};
use crate::error::{Error, Result};
use crate::store::{SharedEmbeddingStore, Table};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;

/// Create a fresh `{model}_{dataset}_{n}` directory under `save_path`.
///
/// `n` starts at the number of existing entries sharing the prefix and is
/// bumped until the name is free, so two runs never share a directory.
pub fn prepare_run_dir(save_path: &Path, model: ModelName, dataset: &str) -> Result<PathBuf> {
    fs::create_dir_all(save_path)?;
    let prefix = format!("{model}_{dataset}_");
    let mut n = fs::read_dir(save_path)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .count();

    loop {
        let dir = save_path.join(format!("{prefix}{n}"));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Metadata written next to exported embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model_name: ModelName,
    pub dataset: String,
    /// Training step the embeddings were taken at.
    pub step: usize,
    pub n_entities: usize,
    pub n_relations: usize,
    pub entity_dim: usize,
    pub relation_dim: usize,
    pub hidden_dim: usize,
    pub gamma: f32,
}

/// Exported tables plus their metadata.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub entities: Array2<f32>,
    pub relations: Array2<f32>,
}

/// Paths of the three export files for a dataset/model pair.
pub fn export_paths(dir: &Path, dataset: &str, model: ModelName) -> [PathBuf; 3] {
    let stem = format!("{dataset}_{model}");
    [
        dir.join(format!("{stem}_entity.bin")),
        dir.join(format!("{stem}_relation.bin")),
        dir.join(format!("{stem}_checkpoint.json")),
    ]
}

/// Snapshot both tables of `store` into `dir`.
pub fn export_embeddings(
    dir: &Path,
    config: &TrainConfig,
    store: &SharedEmbeddingStore,
    step: usize,
) -> Result<CheckpointMeta> {
    fs::create_dir_all(dir)?;
    let shape = store.shape();
    let meta = CheckpointMeta {
        model_name: config.model_name,
        dataset: config.dataset.clone(),
        step,
        n_entities: shape.n_entities,
        n_relations: shape.n_relations,
        entity_dim: shape.entity_dim,
        relation_dim: shape.relation_dim,
        hidden_dim: config.hidden_dim,
        gamma: config.gamma,
    };

    let [entity_path, relation_path, meta_path] = export_paths(dir, &config.dataset, config.model_name);
    bincode::serialize_into(BufWriter::new(File::create(&entity_path)?), &store.snapshot(Table::Entity))?;
    bincode::serialize_into(BufWriter::new(File::create(&relation_path)?), &store.snapshot(Table::Relation))?;
    serde_json::to_writer_pretty(BufWriter::new(File::create(&meta_path)?), &meta)?;

    info!(dir = %dir.display(), step, "exported embeddings");
    Ok(meta)
}

/// Read an export written by [`export_embeddings`].
pub fn load_checkpoint(dir: &Path, dataset: &str, model: ModelName) -> Result<Checkpoint> {
    let [entity_path, relation_path, meta_path] = export_paths(dir, dataset, model);
    let meta: CheckpointMeta = serde_json::from_reader(BufReader::new(File::open(&meta_path)?))?;
    let entities: Array2<f32> = bincode::deserialize_from(BufReader::new(File::open(&entity_path)?))?;
    let relations: Array2<f32> = bincode::deserialize_from(BufReader::new(File::open(&relation_path)?))?;

    if entities.dim() != (meta.n_entities, meta.entity_dim)
        || relations.dim() != (meta.n_relations, meta.relation_dim)
    {
        return Err(Error::Configuration(format!(
            "checkpoint in {} has matrices {:?} / {:?} that disagree with its metadata",
            dir.display(),
            entities.dim(),
            relations.dim()
        )));
    }
    Ok(Checkpoint {
        meta,
        entities,
        relations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreShape;

    #[test]
    fn test_run_dirs_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = prepare_run_dir(dir.path(), ModelName::TransE, "toy").unwrap();
        let b = prepare_run_dir(dir.path(), ModelName::TransE, "toy").unwrap();
        assert_eq!(a.file_name().unwrap(), "TransE_toy_0");
        assert_eq!(b.file_name().unwrap(), "TransE_toy_1");

        // a gap in the numbering does not make the next run reuse a name
        fs::remove_dir(&a).unwrap();
        let c = prepare_run_dir(dir.path(), ModelName::TransE, "toy").unwrap();
        assert_eq!(c.file_name().unwrap(), "TransE_toy_2");

        let other = prepare_run_dir(dir.path(), ModelName::Rescal, "toy").unwrap();
        assert_eq!(other.file_name().unwrap(), "RESCAL_toy_0");
    }

    #[test]
    fn test_export_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SharedEmbeddingStore::create(dir.path().join("store.bin"), StoreShape::new(4, 2, 8, 8)).unwrap();
        store.init_uniform(0.1, 1);

        let config = TrainConfig::default().with_dataset("data", "toy").with_hidden_dim(8);
        let out = dir.path().join("emb");
        let meta = export_embeddings(&out, &config, &store, 10).unwrap();
        assert_eq!(meta.step, 10);
        assert!(out.join("toy_TransE_entity.bin").exists());

        let ckpt = load_checkpoint(&out, "toy", ModelName::TransE).unwrap();
        assert_eq!(ckpt.entities.dim(), (4, 8));
        assert_eq!(ckpt.relations.dim(), (2, 8));
        assert_eq!(ckpt.entities, store.snapshot(Table::Entity));
        assert_eq!(ckpt.meta, meta);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_checkpoint(dir.path(), "toy", ModelName::TransE),
            Err(Error::Io(_))
        ));
    }
}
