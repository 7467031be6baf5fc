//! Train/valid/test triple sets and the on-disk dictionary format.

use crate::{Error, Result, Triple};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// One of the three logical subsets of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    /// Training triples.
    Train,
    /// Validation triples.
    Valid,
    /// Test triples.
    Test,
}

impl Split {
    /// File name of the split in a format `1` dataset directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Train => "train.txt",
            Self::Valid => "valid.txt",
            Self::Test => "test.txt",
        }
    }
}

/// A full triple set with its entity and relation vocabularies.
///
/// `n_entities` and `n_relations` are constants for the whole run; every
/// triple in every split is guaranteed to be in range.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    entity_names: Vec<String>,
    relation_names: Vec<String>,
    train: Vec<Triple>,
    valid: Vec<Triple>,
    test: Vec<Triple>,
}

impl Dataset {
    /// Build a dataset from already-encoded triples.
    ///
    /// Entities and relations get synthetic names (`e{id}`, `r{id}`).
    pub fn from_triples(
        name: impl Into<String>,
        n_entities: usize,
        n_relations: usize,
        train: Vec<Triple>,
        valid: Vec<Triple>,
        test: Vec<Triple>,
    ) -> Result<Self> {
        let dataset = Self {
            name: name.into(),
            entity_names: (0..n_entities).map(|i| format!("e{i}")).collect(),
            relation_names: (0..n_relations).map(|i| format!("r{i}")).collect(),
            train,
            valid,
            test,
        };
        dataset.check_ranges()?;
        Ok(dataset)
    }

    /// Load `{data_path}/{name}` in the given format.
    ///
    /// Format `1` is a directory with `entities.dict` and `relations.dict`
    /// (`id<TAB>name` per line) plus `train.txt`, `valid.txt` and `test.txt`
    /// (`head<TAB>relation<TAB>tail` names per line). Missing valid/test
    /// files load as empty splits.
    pub fn load(data_path: impl AsRef<Path>, name: &str, format: &str) -> Result<Self> {
        if format != "1" {
            return Err(Error::Configuration(format!(
                "unsupported dataset format `{format}` (only `1` is available)"
            )));
        }

        let dir = data_path.as_ref().join(name);
        let entity_names = read_dict(&dir.join("entities.dict"))?;
        let relation_names = read_dict(&dir.join("relations.dict"))?;

        let entity_ids: HashMap<&str, u32> = entity_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i as u32))
            .collect();
        let relation_ids: HashMap<&str, u32> = relation_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i as u32))
            .collect();

        let mut splits = Vec::with_capacity(3);
        for split in [Split::Train, Split::Valid, Split::Test] {
            let path = dir.join(split.file_name());
            if split != Split::Train && !path.exists() {
                debug!(path = %path.display(), "split file missing, using an empty split");
                splits.push(Vec::new());
                continue;
            }
            splits.push(read_triples(&path, &entity_ids, &relation_ids)?);
        }
        let test = splits.pop().unwrap_or_default();
        let valid = splits.pop().unwrap_or_default();
        let train = splits.pop().unwrap_or_default();

        info!(
            dataset = name,
            entities = entity_names.len(),
            relations = relation_names.len(),
            train = train.len(),
            valid = valid.len(),
            test = test.len(),
            "loaded dataset"
        );

        Ok(Self {
            name: name.to_string(),
            entity_names,
            relation_names,
            train,
            valid,
            test,
        })
    }

    fn check_ranges(&self) -> Result<()> {
        let n_entities = self.n_entities() as u32;
        let n_relations = self.n_relations() as u32;
        for split in [Split::Train, Split::Valid, Split::Test] {
            if let Some(bad) = self
                .split(split)
                .iter()
                .find(|t| t.head >= n_entities || t.tail >= n_entities || t.relation >= n_relations)
            {
                return Err(Error::Dataset(format!(
                    "{split:?} triple {bad} is out of range ({n_entities} entities, {n_relations} relations)"
                )));
            }
        }
        Ok(())
    }

    /// Dataset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entities.
    pub fn n_entities(&self) -> usize {
        self.entity_names.len()
    }

    /// Number of relations.
    pub fn n_relations(&self) -> usize {
        self.relation_names.len()
    }

    /// Triples of one split.
    pub fn split(&self, split: Split) -> &[Triple] {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }

    /// Training triples.
    pub fn train(&self) -> &[Triple] {
        &self.train
    }

    /// All triples, train first, then valid, then test.
    pub fn all_triples(&self) -> impl Iterator<Item = Triple> + '_ {
        self.train
            .iter()
            .chain(self.valid.iter())
            .chain(self.test.iter())
            .copied()
    }

    /// Name of an entity id.
    pub fn entity_name(&self, id: u32) -> Option<&str> {
        self.entity_names.get(id as usize).map(String::as_str)
    }

    /// Name of a relation id.
    pub fn relation_name(&self, id: u32) -> Option<&str> {
        self.relation_names.get(id as usize).map(String::as_str)
    }
}

fn read_dict(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .map_err(|e| Error::Dataset(format!("cannot open {}: {e}", path.display())))?;
    let mut entries: Vec<(usize, String)> = Vec::new();

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (id, name) = line.split_once('\t').ok_or_else(|| {
            Error::Dataset(format!("{}:{}: expected `id<TAB>name`", path.display(), line_no + 1))
        })?;
        let id: usize = id.trim().parse().map_err(|_| {
            Error::Dataset(format!("{}:{}: bad id `{id}`", path.display(), line_no + 1))
        })?;
        entries.push((id, name.to_string()));
    }

    entries.sort_by_key(|(id, _)| *id);
    for (expected, (id, _)) in entries.iter().enumerate() {
        if *id != expected {
            return Err(Error::Dataset(format!(
                "{}: ids must be dense from 0, found {id} at position {expected}",
                path.display()
            )));
        }
    }
    Ok(entries.into_iter().map(|(_, name)| name).collect())
}

fn read_triples(
    path: &Path,
    entity_ids: &HashMap<&str, u32>,
    relation_ids: &HashMap<&str, u32>,
) -> Result<Vec<Triple>> {
    let file = File::open(path)
        .map_err(|e| Error::Dataset(format!("cannot open {}: {e}", path.display())))?;
    let mut triples = Vec::new();

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split('\t');
        let (Some(h), Some(r), Some(t)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::Dataset(format!(
                "{}:{}: expected `head<TAB>relation<TAB>tail`",
                path.display(),
                line_no + 1
            )));
        };
        let lookup = |map: &HashMap<&str, u32>, key: &str, what: &str| {
            map.get(key).copied().ok_or_else(|| {
                Error::Dataset(format!(
                    "{}:{}: unknown {what} `{key}`",
                    path.display(),
                    line_no + 1
                ))
            })
        };
        triples.push(Triple::new(
            lookup(entity_ids, h, "entity")?,
            lookup(relation_ids, r, "relation")?,
            lookup(entity_ids, t, "entity")?,
        ));
    }
    Ok(triples)
}
