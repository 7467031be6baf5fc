//! Embedding tables shared between worker processes.
//!
//! The store is a single file mapped with `MAP_SHARED` by every process
//! that opens it, so all workers see the same physical pages. Layout:
//!
//! ```text
//! [ header: 64 bytes                                    ]
//! [ entity matrix    n_entities  x entity_dim    f32    ]
//! [ relation matrix  n_relations x relation_dim  f32    ]
//! [ entity state     n_entities                  f32    ]
//! [ relation state   n_relations                 f32    ]
//! ```
//!
//! Cells are read and written as `AtomicU32` bit patterns with relaxed
//! ordering. Updates are `load -> add -> store` with no lock: two writers
//! on the same row may lose one of the increments.

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

const MAGIC: &[u8; 8] = b"DKGESTOR";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 64;

/// Which matrix an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Table {
    /// One row per entity.
    Entity,
    /// One row per relation.
    Relation,
}

/// Row counts and widths of both tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShape {
    pub n_entities: usize,
    pub n_relations: usize,
    pub entity_dim: usize,
    pub relation_dim: usize,
}

impl StoreShape {
    pub fn new(n_entities: usize, n_relations: usize, entity_dim: usize, relation_dim: usize) -> Self {
        Self {
            n_entities,
            n_relations,
            entity_dim,
            relation_dim,
        }
    }

    /// `(rows, width)` of a table.
    pub fn dims(&self, table: Table) -> (usize, usize) {
        match table {
            Table::Entity => (self.n_entities, self.entity_dim),
            Table::Relation => (self.n_relations, self.relation_dim),
        }
    }

    fn cells(&self) -> usize {
        self.n_entities * self.entity_dim
            + self.n_relations * self.relation_dim
            + self.n_entities
            + self.n_relations
    }

    fn file_len(&self) -> usize {
        HEADER_LEN + self.cells() * 4
    }

    /// First cell of a table's matrix.
    fn matrix_base(&self, table: Table) -> usize {
        match table {
            Table::Entity => 0,
            Table::Relation => self.n_entities * self.entity_dim,
        }
    }

    /// First cell of a table's optimiser state.
    fn state_base(&self, table: Table) -> usize {
        let matrices = self.n_entities * self.entity_dim + self.n_relations * self.relation_dim;
        match table {
            Table::Entity => matrices,
            Table::Relation => matrices + self.n_entities,
        }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&VERSION.to_le_bytes());
        for (i, v) in [self.n_entities, self.n_relations, self.entity_dim, self.relation_dim]
            .into_iter()
            .enumerate()
        {
            let at = 16 + i * 8;
            header[at..at + 8].copy_from_slice(&(v as u64).to_le_bytes());
        }
        header
    }

    fn decode(header: &[u8]) -> io::Result<Self> {
        if header.len() < HEADER_LEN || &header[..8] != MAGIC {
            return Err(invalid("not an embedding store (bad magic)"));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != VERSION {
            return Err(invalid(&format!("unsupported store version {version}")));
        }
        let field = |i: usize| -> io::Result<usize> {
            let at = 16 + i * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&header[at..at + 8]);
            usize::try_from(u64::from_le_bytes(buf)).map_err(|_| invalid("shape overflows usize"))
        };
        Ok(Self::new(field(0)?, field(1)?, field(2)?, field(3)?))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Entity and relation tables in a shared memory-mapped file.
#[derive(Debug)]
pub struct SharedEmbeddingStore {
    path: PathBuf,
    shape: StoreShape,
    /// Keeps the mapping alive; cells are only touched through `cells`.
    mmap: MmapMut,
    cells: NonNull<AtomicU32>,
    len: usize,
}

// SAFETY: all access after construction goes through `AtomicU32` cells in
// the mapping, which stays valid and fixed in place for the lifetime of
// `mmap`.
unsafe impl Send for SharedEmbeddingStore {}
unsafe impl Sync for SharedEmbeddingStore {}

impl SharedEmbeddingStore {
    /// Create (or truncate) the store file and map it. All cells start at 0.
    pub fn create(path: impl AsRef<Path>, shape: StoreShape) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(shape.file_len() as u64)?;

        // SAFETY: the file was just sized; other processes only map it
        // after this call returns.
        let mut mmap = unsafe { MmapOptions::new().len(shape.file_len()).map_mut(&file)? };
        mmap[..HEADER_LEN].copy_from_slice(&shape.encode());

        debug!(path = %path.display(), ?shape, bytes = shape.file_len(), "created embedding store");
        Self::from_mmap(path, shape, mmap)
    }

    /// Map an existing store file created by [`SharedEmbeddingStore::create`].
    ///
    /// # Errors
    ///
    /// IO error with kind `InvalidData` when the header is not a store
    /// header or the file length disagrees with the recorded shape.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file: File = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: the mapping is shared by design; all cell access is atomic.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let shape = StoreShape::decode(&mmap)?;
        if mmap.len() != shape.file_len() {
            return Err(invalid(&format!(
                "store length {} does not match shape {:?}",
                mmap.len(),
                shape
            ))
            .into());
        }
        Self::from_mmap(path, shape, mmap)
    }

    fn from_mmap(path: &Path, shape: StoreShape, mut mmap: MmapMut) -> Result<Self> {
        // SAFETY: HEADER_LEN is within the mapping; the mapping is page
        // aligned so the body is 4-byte aligned.
        let body = unsafe { mmap.as_mut_ptr().add(HEADER_LEN) }.cast::<AtomicU32>();
        let cells = NonNull::new(body).ok_or_else(|| invalid("null mapping"))?;
        Ok(Self {
            path: path.to_path_buf(),
            shape,
            mmap,
            cells,
            len: shape.cells(),
        })
    }

    fn cells(&self) -> &[AtomicU32] {
        // SAFETY: `len` cells follow the header for as long as `mmap` lives.
        unsafe { std::slice::from_raw_parts(self.cells.as_ptr(), self.len) }
    }

    pub fn shape(&self) -> StoreShape {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_row(&self, table: Table, id: u32) -> Result<usize> {
        let (rows, _) = self.shape.dims(table);
        let id = id as usize;
        if id >= rows {
            return Err(Error::Configuration(format!(
                "{table:?} row {id} out of range (table has {rows} rows)"
            )));
        }
        Ok(id)
    }

    fn row(&self, table: Table, id: u32) -> Result<&[AtomicU32]> {
        let id = self.check_row(table, id)?;
        let (_, dim) = self.shape.dims(table);
        let start = self.shape.matrix_base(table) + id * dim;
        Ok(&self.cells()[start..start + dim])
    }

    /// Copy one row out of the store.
    pub fn read_row(&self, table: Table, id: u32) -> Result<Vec<f32>> {
        Ok(self
            .row(table, id)?
            .iter()
            .map(|c| f32::from_bits(c.load(Ordering::Relaxed)))
            .collect())
    }

    /// Copy the rows for `ids` into a `(ids.len(), dim)` matrix.
    pub fn read(&self, table: Table, ids: &[u32]) -> Result<Array2<f32>> {
        let (_, dim) = self.shape.dims(table);
        let mut out = Array2::zeros((ids.len(), dim));
        for (i, &id) in ids.iter().enumerate() {
            for (dst, cell) in out.row_mut(i).iter_mut().zip(self.row(table, id)?) {
                *dst = f32::from_bits(cell.load(Ordering::Relaxed));
            }
        }
        Ok(out)
    }

    fn check_values(&self, table: Table, ids: &[u32], values: &Array2<f32>) -> Result<()> {
        let (_, dim) = self.shape.dims(table);
        if values.dim() != (ids.len(), dim) {
            return Err(Error::Configuration(format!(
                "expected a ({}, {dim}) matrix, got {:?}",
                ids.len(),
                values.dim()
            )));
        }
        Ok(())
    }

    /// Add `deltas` row-wise into the rows for `ids`, without locking.
    pub fn update(&self, table: Table, ids: &[u32], deltas: &Array2<f32>) -> Result<()> {
        self.check_values(table, ids, deltas)?;
        for (i, &id) in ids.iter().enumerate() {
            for (cell, delta) in self.row(table, id)?.iter().zip(deltas.row(i)) {
                let old = f32::from_bits(cell.load(Ordering::Relaxed));
                cell.store((old + delta).to_bits(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Overwrite the rows for `ids`.
    pub fn write_rows(&self, table: Table, ids: &[u32], values: &Array2<f32>) -> Result<()> {
        self.check_values(table, ids, values)?;
        for (i, &id) in ids.iter().enumerate() {
            for (cell, v) in self.row(table, id)?.iter().zip(values.row(i)) {
                cell.store(v.to_bits(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Optimiser state of one row.
    pub fn state(&self, table: Table, id: u32) -> Result<f32> {
        let id = self.check_row(table, id)?;
        let cell = &self.cells()[self.shape.state_base(table) + id];
        Ok(f32::from_bits(cell.load(Ordering::Relaxed)))
    }

    /// Add `value` to a row's optimiser state and return the new state.
    pub fn accumulate_state(&self, table: Table, id: u32, value: f32) -> Result<f32> {
        let id = self.check_row(table, id)?;
        let cell = &self.cells()[self.shape.state_base(table) + id];
        let new = f32::from_bits(cell.load(Ordering::Relaxed)) + value;
        cell.store(new.to_bits(), Ordering::Relaxed);
        Ok(new)
    }

    /// A copy of a whole table.
    pub fn snapshot(&self, table: Table) -> Array2<f32> {
        let (rows, dim) = self.shape.dims(table);
        let base = self.shape.matrix_base(table);
        let cells = &self.cells()[base..base + rows * dim];
        Array2::from_shape_fn((rows, dim), |(r, c)| {
            f32::from_bits(cells[r * dim + c].load(Ordering::Relaxed))
        })
    }

    /// Overwrite a whole table, e.g. from a checkpoint.
    pub fn load(&self, table: Table, matrix: &Array2<f32>) -> Result<()> {
        let (rows, dim) = self.shape.dims(table);
        if matrix.dim() != (rows, dim) {
            return Err(Error::Configuration(format!(
                "{table:?} checkpoint has shape {:?}, store expects ({rows}, {dim})",
                matrix.dim()
            )));
        }
        let base = self.shape.matrix_base(table);
        let cells = &self.cells()[base..base + rows * dim];
        for (cell, v) in cells.iter().zip(matrix.iter()) {
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fill both matrices uniformly in `[-emb_init, emb_init]` and reset
    /// the optimiser state.
    pub fn init_uniform(&self, emb_init: f32, seed: u64) {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let matrices = self.shape.state_base(Table::Entity);
        for (i, cell) in self.cells().iter().enumerate() {
            let v = if i < matrices {
                rng.gen_range(-emb_init..=emb_init)
            } else {
                0.0
            };
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
    }

    /// Push dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn shape() -> StoreShape {
        StoreShape::new(4, 2, 3, 2)
    }

    #[test]
    fn test_new_store_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedEmbeddingStore::create(dir.path().join("store.bin"), shape()).unwrap();
        assert_eq!(store.read(Table::Entity, &[0, 3]).unwrap(), Array2::<f32>::zeros((2, 3)));
        assert_eq!(store.state(Table::Relation, 1).unwrap(), 0.0);
    }

    #[test]
    fn test_update_adds() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedEmbeddingStore::create(dir.path().join("store.bin"), shape()).unwrap();
        let delta = array![[1.0, 2.0], [0.5, -0.5]];
        store.update(Table::Relation, &[1, 0], &delta).unwrap();
        store.update(Table::Relation, &[1, 0], &delta).unwrap();
        assert_eq!(store.read_row(Table::Relation, 1).unwrap(), vec![2.0, 4.0]);
        assert_eq!(store.read_row(Table::Relation, 0).unwrap(), vec![1.0, -1.0]);
        // entity table untouched
        assert_eq!(store.read_row(Table::Entity, 3).unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_second_handle_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let a = SharedEmbeddingStore::create(&path, shape()).unwrap();
        let b = SharedEmbeddingStore::open(&path).unwrap();
        assert_eq!(b.shape(), shape());

        a.write_rows(Table::Entity, &[2], &array![[7.0, 8.0, 9.0]]).unwrap();
        assert_eq!(b.read_row(Table::Entity, 2).unwrap(), vec![7.0, 8.0, 9.0]);

        b.accumulate_state(Table::Entity, 2, 1.5).unwrap();
        assert_eq!(a.state(Table::Entity, 2).unwrap(), 1.5);
    }

    #[test]
    fn test_out_of_range_and_bad_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedEmbeddingStore::create(dir.path().join("store.bin"), shape()).unwrap();
        assert!(store.read(Table::Entity, &[4]).unwrap_err().is_configuration());
        assert!(store
            .update(Table::Entity, &[0], &Array2::zeros((1, 2)))
            .unwrap_err()
            .is_configuration());
        assert!(store.load(Table::Relation, &Array2::zeros((3, 2))).is_err());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        match SharedEmbeddingStore::open(&path).unwrap_err() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_load_and_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedEmbeddingStore::create(dir.path().join("store.bin"), shape()).unwrap();
        store.init_uniform(0.25, 3);
        let ent = store.snapshot(Table::Entity);
        assert_eq!(ent.dim(), (4, 3));
        assert!(ent.iter().all(|v| v.abs() <= 0.25));
        assert!(ent.iter().any(|v| *v != 0.0));
        assert_eq!(store.state(Table::Entity, 0).unwrap(), 0.0);

        let rel = array![[1.0, 2.0], [3.0, 4.0]];
        store.load(Table::Relation, &rel).unwrap();
        assert_eq!(store.snapshot(Table::Relation), rel);
        store.flush().unwrap();
    }
}
