//! Storage engine
//!
//! A thin layer over an LMDB environment (heed) that exposes two kinds of
//! named root objects:
//!
//! - **Variable-size trees**: sorted byte key -> byte value collections
//! - **Tables**: schema-backed rows with a primary key and fixed-size
//!   (8 byte, big-endian) secondary indexes, either per table or global
//!
//! Every root object is registered in a root catalog so the whole
//! environment can be enumerated (snapshot creation) and recreated by name
//! (snapshot installation). Transactions follow LMDB semantics: one writer
//! at a time, any number of independent readers.
//!
//! # Physical layout
//!
//! ```text
//! $roots            name -> RootObjectType
//! $schemas          table name -> TableSchema
//! t/<tree>          tree contents
//! r/<table>         primary key -> encoded row
//! x/<table>/<index> u64 -> primary key        (per-table index)
//! g/<index>         u64 -> table ref + key    (global index)
//! ```

mod table;
mod tree;

pub use table::{FixedSizeIndexDef, Table, TableSchema, TableValue};
pub use tree::Tree;

use crate::{Error, Result};
use heed::byteorder::BigEndian;
use heed::types::{Bytes, SerdeBincode, Str, U64};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Maximum length of a root object name in bytes
pub const MAX_ROOT_NAME_LEN: usize = 255;

/// Prefix reserved for internal databases
const INTERNAL_PREFIX: char = '$';

/// Kind of a named root object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootObjectType {
    /// Sorted key -> value collection
    VariableSizeTree,
    /// Schema-backed row table
    Table,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the LMDB files
    pub path: PathBuf,
    /// LMDB map size in bytes
    pub map_size: usize,
    /// Maximum number of named databases
    pub max_dbs: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            map_size: 1024 * 1024 * 1024, // 1GB
            max_dbs: 512,
        }
    }
}

impl StorageConfig {
    /// Configuration rooted at `path` with default sizes
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the map size
    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }
}

/// Transactional storage environment
pub struct StorageEnvironment {
    env: Env,
    path: PathBuf,
    roots: Database<Str, SerdeBincode<RootObjectType>>,
    schemas: Database<Str, SerdeBincode<TableSchema>>,
}

impl StorageEnvironment {
    /// Open (or create) the environment described by `config`
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size)
                .max_dbs(config.max_dbs)
                .open(&config.path)?
        };

        let mut wtxn = env.write_txn()?;
        let roots = env.create_database(&mut wtxn, Some("$roots"))?;
        let schemas = env.create_database(&mut wtxn, Some("$schemas"))?;
        wtxn.commit()?;

        tracing::debug!("Opened storage environment at {:?}", config.path);

        Ok(Self {
            env,
            path: config.path.clone(),
            roots,
            schemas,
        })
    }

    /// Directory of this environment
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin the (single) write transaction
    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Begin an independent read-only transaction
    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Create (or open) an internal database that is not part of the root
    /// catalog. Internal names start with `$`.
    pub(crate) fn create_internal_database<KC: 'static, DC: 'static>(
        &self,
        txn: &mut RwTxn,
        name: &str,
    ) -> Result<Database<KC, DC>> {
        debug_assert!(name.starts_with(INTERNAL_PREFIX));
        Ok(self.env.create_database(txn, Some(name))?)
    }

    /// List every root object (trees and tables) in name order
    pub fn roots(&self, txn: &RoTxn) -> Result<Vec<(String, RootObjectType)>> {
        let mut roots = Vec::new();
        for item in self.roots.iter(txn)? {
            let (name, kind) = item?;
            roots.push((name.to_string(), kind));
        }
        Ok(roots)
    }

    /// Type of the root object called `name`, if any
    pub fn root_type(&self, txn: &RoTxn, name: &str) -> Result<Option<RootObjectType>> {
        Ok(self.roots.get(txn, name)?)
    }

    /// Create a tree, or open it if it already exists
    pub fn create_tree(&self, txn: &mut RwTxn, name: &str) -> Result<Tree> {
        validate_root_name(name)?;
        match self.roots.get(txn, name)? {
            Some(RootObjectType::Table) => {
                return Err(Error::storage(format!(
                    "Cannot create tree '{}': a table with that name exists",
                    name
                )));
            }
            Some(RootObjectType::VariableSizeTree) => {}
            None => self
                .roots
                .put(txn, name, &RootObjectType::VariableSizeTree)?,
        }

        let db = self.env.create_database(txn, Some(&tree_db_name(name)))?;
        Ok(Tree::new(name, db))
    }

    /// Open an existing tree
    pub fn open_tree(&self, txn: &RoTxn, name: &str) -> Result<Option<Tree>> {
        if self.roots.get(txn, name)? != Some(RootObjectType::VariableSizeTree) {
            return Ok(None);
        }
        let db: Option<Database<Bytes, Bytes>> =
            self.env.open_database(txn, Some(&tree_db_name(name)))?;
        Ok(db.map(|db| Tree::new(name, db)))
    }

    /// Delete a tree and all of its contents. Returns false when no such
    /// tree exists.
    pub fn delete_tree(&self, txn: &mut RwTxn, name: &str) -> Result<bool> {
        let Some(tree) = self.open_tree(txn, name)? else {
            return Ok(false);
        };
        tree.clear(txn)?;
        self.roots.delete(txn, name)?;
        Ok(true)
    }

    /// Create a table with `schema`, or open it if it already exists with
    /// the same schema.
    pub fn create_table(&self, txn: &mut RwTxn, name: &str, schema: &TableSchema) -> Result<Table> {
        validate_root_name(name)?;
        match self.roots.get(txn, name)? {
            Some(RootObjectType::VariableSizeTree) => {
                return Err(Error::storage(format!(
                    "Cannot create table '{}': a tree with that name exists",
                    name
                )));
            }
            Some(RootObjectType::Table) => {
                if let Some(existing) = self.schemas.get(txn, name)? {
                    if &existing != schema {
                        return Err(Error::storage(format!(
                            "Table '{}' already exists with a different schema",
                            name
                        )));
                    }
                }
            }
            None => self.roots.put(txn, name, &RootObjectType::Table)?,
        }
        self.schemas.put(txn, name, schema)?;

        let rows = self.env.create_database(txn, Some(&table_rows_db_name(name)))?;
        let mut indexes = Vec::with_capacity(schema.indexes().len());
        for def in schema.indexes() {
            let db_name = index_db_name(name, def);
            let db: Database<U64<BigEndian>, Bytes> =
                self.env.create_database(txn, Some(&db_name))?;
            indexes.push((def.clone(), db));
        }

        Ok(Table::new(name, schema.clone(), rows, indexes))
    }

    /// Read the locally known schema of a table
    pub fn read_table_schema(&self, txn: &RoTxn, name: &str) -> Result<Option<TableSchema>> {
        Ok(self.schemas.get(txn, name)?)
    }

    /// Open an existing table. Returns `None` when no schema is known for
    /// `name`.
    pub fn open_table(&self, txn: &RoTxn, name: &str) -> Result<Option<Table>> {
        let Some(schema) = self.schemas.get(txn, name)? else {
            return Ok(None);
        };

        let rows: Database<Bytes, Bytes> = self
            .env
            .open_database(txn, Some(&table_rows_db_name(name)))?
            .ok_or_else(|| Error::storage(format!("Table '{}' has a schema but no rows", name)))?;

        let mut indexes = Vec::with_capacity(schema.indexes().len());
        for def in schema.indexes() {
            let db: Database<U64<BigEndian>, Bytes> = self
                .env
                .open_database(txn, Some(&index_db_name(name, def)))?
                .ok_or_else(|| {
                    Error::storage(format!("Table '{}' is missing index '{}'", name, def.name))
                })?;
            indexes.push((def.clone(), db));
        }

        Ok(Some(Table::new(name, schema, rows, indexes)))
    }

    /// Rows of every table registered in the global index `index_name`
    /// whose indexed value is strictly greater than `after`, in index
    /// order. Each row is returned with the name of its table.
    pub fn seek_global_index_after(
        &self,
        txn: &RoTxn,
        index_name: &str,
        after: u64,
    ) -> Result<Vec<(String, TableValue)>> {
        let db: Option<Database<U64<BigEndian>, Bytes>> =
            self.env.open_database(txn, Some(&global_index_db_name(index_name)))?;
        let Some(db) = db else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        let range = (Bound::Excluded(after), Bound::Unbounded);
        for item in db.range(txn, &range)? {
            let (_, reference) = item?;
            let (table_name, key) = table::decode_global_ref(reference)?;
            let table = self.open_table(txn, &table_name)?.ok_or_else(|| {
                Error::storage(format!(
                    "Global index '{}' references missing table '{}'",
                    index_name, table_name
                ))
            })?;
            if let Some(row) = table.read_by_key(txn, &key)? {
                results.push((table_name, row));
            }
        }
        Ok(results)
    }

    /// Highest value stored in the global index `index_name`
    pub fn last_in_global_index(&self, txn: &RoTxn, index_name: &str) -> Result<Option<u64>> {
        let db: Option<Database<U64<BigEndian>, Bytes>> =
            self.env.open_database(txn, Some(&global_index_db_name(index_name)))?;
        match db {
            Some(db) => Ok(db.last(txn)?.map(|(value, _)| value)),
            None => Ok(None),
        }
    }

    /// Force dirty pages to disk
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

fn validate_root_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("Root object name cannot be empty"));
    }
    if name.len() > MAX_ROOT_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "Root object name cannot exceed {} bytes, got {}",
            MAX_ROOT_NAME_LEN,
            name.len()
        )));
    }
    if name.starts_with(INTERNAL_PREFIX) {
        return Err(Error::invalid_argument(format!(
            "Root object name '{}' uses the reserved '$' prefix",
            name
        )));
    }
    Ok(())
}

fn tree_db_name(name: &str) -> String {
    format!("t/{}", name)
}

fn table_rows_db_name(name: &str) -> String {
    format!("r/{}", name)
}

fn index_db_name(table: &str, def: &FixedSizeIndexDef) -> String {
    if def.global {
        global_index_db_name(&def.name)
    } else {
        format!("x/{}/{}", table, def.name)
    }
}

fn global_index_db_name(index: &str) -> String {
    format!("g/{}", index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    fn open_env(ctx: &TestContext) -> StorageEnvironment {
        StorageEnvironment::open(&StorageConfig::at(ctx.path()).with_map_size(64 * 1024 * 1024))
            .unwrap()
    }

    fn schema() -> TableSchema {
        TableSchema::new(0)
            .define_fixed_size_index("ByVersion", 1, false)
            .define_fixed_size_index("AllVersions", 1, true)
    }

    fn row(key: &str, version: u64) -> TableValue {
        TableValue::new(vec![
            key.as_bytes().to_vec(),
            version.to_be_bytes().to_vec(),
            b"payload".to_vec(),
        ])
    }

    #[test]
    fn test_tree_create_and_read() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        let tree = storage.create_tree(&mut txn, "config").unwrap();
        tree.add(&mut txn, b"b", b"2").unwrap();
        tree.add(&mut txn, b"a", b"1").unwrap();
        txn.commit().unwrap();

        let txn = storage.read_txn().unwrap();
        let tree = storage.open_tree(&txn, "config").unwrap().unwrap();
        assert_eq!(tree.read(&txn, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.len(&txn).unwrap(), 2);
        assert_eq!(
            storage.roots(&txn).unwrap(),
            vec![("config".to_string(), RootObjectType::VariableSizeTree)]
        );
    }

    #[test]
    fn test_delete_tree() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        let tree = storage.create_tree(&mut txn, "scratch").unwrap();
        tree.add(&mut txn, b"k", b"v").unwrap();
        assert!(storage.delete_tree(&mut txn, "scratch").unwrap());
        assert!(!storage.delete_tree(&mut txn, "scratch").unwrap());
        txn.commit().unwrap();

        let txn = storage.read_txn().unwrap();
        assert!(storage.open_tree(&txn, "scratch").unwrap().is_none());
        assert!(storage.roots(&txn).unwrap().is_empty());
    }

    #[test]
    fn test_reserved_and_conflicting_names() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        assert!(matches!(
            storage.create_tree(&mut txn, "$log"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            storage.create_tree(&mut txn, ""),
            Err(Error::InvalidArgument(_))
        ));
        storage.create_table(&mut txn, "items", &schema()).unwrap();
        assert!(matches!(
            storage.create_tree(&mut txn, "items"),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_table_insert_read_delete() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        let table = storage.create_table(&mut txn, "items", &schema()).unwrap();
        table.insert(&mut txn, &row("a", 1)).unwrap();
        table.insert(&mut txn, &row("b", 2)).unwrap();
        assert!(table.insert(&mut txn, &row("a", 3)).is_err());
        txn.commit().unwrap();

        let mut txn = storage.write_txn().unwrap();
        let table = storage.open_table(&txn, "items").unwrap().unwrap();
        assert_eq!(table.number_of_entries(&txn).unwrap(), 2);
        assert_eq!(table.read_by_key(&txn, b"a").unwrap(), Some(row("a", 1)));
        assert!(table.delete_by_key(&mut txn, b"a").unwrap());
        assert!(!table.delete_by_key(&mut txn, b"a").unwrap());
        assert_eq!(table.number_of_entries(&txn).unwrap(), 1);
        txn.commit().unwrap();

        let txn = storage.read_txn().unwrap();
        let global = storage.seek_global_index_after(&txn, "AllVersions", 0).unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].0, "items");
        assert_eq!(global[0].1, row("b", 2));
    }

    #[test]
    fn test_table_schema_mismatch() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        storage.create_table(&mut txn, "items", &schema()).unwrap();
        storage.create_table(&mut txn, "items", &schema()).unwrap();
        let other = TableSchema::new(0);
        assert!(storage.create_table(&mut txn, "items", &other).is_err());
    }

    #[test]
    fn test_global_index_spans_tables() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        let first = storage.create_table(&mut txn, "first", &schema()).unwrap();
        let second = storage.create_table(&mut txn, "second", &schema()).unwrap();
        first.insert(&mut txn, &row("x", 1)).unwrap();
        second.insert(&mut txn, &row("y", 2)).unwrap();
        first.insert(&mut txn, &row("z", 3)).unwrap();
        txn.commit().unwrap();

        let txn = storage.read_txn().unwrap();
        let after_one = storage.seek_global_index_after(&txn, "AllVersions", 1).unwrap();
        let tables: Vec<_> = after_one.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tables, vec!["second", "first"]);
        assert_eq!(storage.last_in_global_index(&txn, "AllVersions").unwrap(), Some(3));
        assert_eq!(storage.last_in_global_index(&txn, "Missing").unwrap(), None);
    }

    #[test]
    fn test_deleting_stale_row_keeps_repointed_global_entry() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        let first = storage.create_table(&mut txn, "first", &schema()).unwrap();
        let second = storage.create_table(&mut txn, "second", &schema()).unwrap();
        first.insert(&mut txn, &row("old", 7)).unwrap();
        // A replacement row takes over version 7 while the old one still exists
        second.insert(&mut txn, &row("new", 7)).unwrap();
        assert!(first.delete_by_key(&mut txn, b"old").unwrap());
        txn.commit().unwrap();

        let txn = storage.read_txn().unwrap();
        let global = storage.seek_global_index_after(&txn, "AllVersions", 0).unwrap();
        assert_eq!(global, vec![("second".to_string(), row("new", 7))]);
        assert_eq!(storage.last_in_global_index(&txn, "AllVersions").unwrap(), Some(7));
    }

    #[test]
    fn test_deleting_stale_row_keeps_repointed_table_entry() {
        let ctx = TestContext::new();
        let storage = open_env(&ctx);

        let mut txn = storage.write_txn().unwrap();
        let table = storage.create_table(&mut txn, "items", &schema()).unwrap();
        table.insert(&mut txn, &row("a", 4)).unwrap();
        table.insert(&mut txn, &row("b", 4)).unwrap();
        assert!(table.delete_by_key(&mut txn, b"a").unwrap());
        txn.commit().unwrap();

        let txn = storage.read_txn().unwrap();
        let table = storage.open_table(&txn, "items").unwrap().unwrap();
        assert_eq!(table.seek_index_after(&txn, "ByVersion", 0).unwrap(), vec![row("b", 4)]);
    }
}
