//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: document records (bincode), keyed by document id
//! - `blocks`:    block rows (JSON, LZ4 compressed), keyed by
//!   `<document_id:16 bytes><block id:utf-8>`
//!
//! Block rows of one document share a 16-byte prefix, so delete-many and
//! find-many for a document are a single prefix scan.
//!
//! RocksDB calls block the calling thread; every trait method runs on the
//! blocking pool so a slow disk never stalls the connection tasks.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{sort_by_order, BlockFilter, DocumentFilter, DocumentStore};
use crate::error::StoreError;
use crate::model::{BlockRow, Document};

const CF_DOCUMENTS: &str = "documents";
const CF_BLOCKS: &str = "blocks";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_BLOCKS];

type Db = DBWithThreadMode<SingleThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mininote_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk shape of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    id: Uuid,
    owner: Uuid,
    title: String,
    last_editor: Uuid,
    last_modified_ms: i64,
}

impl DocumentRecord {
    fn encode(document: &Document) -> Result<Vec<u8>, StoreError> {
        let record = Self {
            id: document.id,
            owner: document.owner,
            title: document.title.clone(),
            last_editor: document.last_editor,
            last_modified_ms: document.last_modified.timestamp_millis(),
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Document, StoreError> {
        let (record, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let last_modified = DateTime::<Utc>::from_timestamp_millis(record.last_modified_ms)
            .ok_or_else(|| StoreError::Deserialization("timestamp out of range".into()))?;
        Ok(Document {
            id: record.id,
            owner: record.owner,
            title: record.title,
            last_editor: record.last_editor,
            last_modified,
        })
    }
}

fn encode_row(row: &BlockRow) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(row).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_row(bytes: &[u8]) -> Result<BlockRow, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn block_key(document_id: Uuid, block_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + block_id.len());
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(block_id.as_bytes());
    key
}

fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: Arc<Db>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BLOCKS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }
        opts
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Run a blocking closure against the database on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    fn scan_documents(db: &Db, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let cf_docs = cf(db, CF_DOCUMENTS)?;
        if let Some(id) = filter.id {
            return match db.get_cf(cf_docs, id.as_bytes())? {
                Some(bytes) => {
                    let doc = DocumentRecord::decode(&bytes)?;
                    Ok(if filter.matches(&doc) { vec![doc] } else { Vec::new() })
                }
                None => Ok(Vec::new()),
            };
        }

        let mut docs = Vec::new();
        for item in db.iterator_cf(cf_docs, IteratorMode::Start) {
            let (_, value) = item?;
            let doc = DocumentRecord::decode(&value)?;
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn scan_blocks(db: &Db, filter: &BlockFilter) -> Result<Vec<(Box<[u8]>, BlockRow)>, StoreError> {
        let cf_blocks = cf(db, CF_BLOCKS)?;
        let prefix = filter.document_id.as_bytes();

        let mut rows = Vec::new();
        for item in db.prefix_iterator_cf(cf_blocks, prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let row = decode_row(&value)?;
            if filter.matches(&row) {
                rows.push((key, row));
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn find_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |db| Self::scan_documents(db, &filter)).await
    }

    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        let opts = self.write_options();
        self.blocking(move |db| {
            let value = DocumentRecord::encode(&document)?;
            db.put_cf_opt(cf(db, CF_DOCUMENTS)?, document.id.as_bytes(), value, &opts)?;
            Ok(())
        })
        .await
    }

    async fn update_document(&self, document: &Document) -> Result<bool, StoreError> {
        let document = document.clone();
        let opts = self.write_options();
        self.blocking(move |db| {
            let cf_docs = cf(db, CF_DOCUMENTS)?;
            if db.get_cf(cf_docs, document.id.as_bytes())?.is_none() {
                return Ok(false);
            }
            let value = DocumentRecord::encode(&document)?;
            db.put_cf_opt(cf_docs, document.id.as_bytes(), value, &opts)?;
            Ok(true)
        })
        .await
    }

    async fn delete_documents(&self, filter: &DocumentFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        let opts = self.write_options();
        self.blocking(move |db| {
            let cf_docs = cf(db, CF_DOCUMENTS)?;
            let doomed = Self::scan_documents(db, &filter)?;
            if doomed.is_empty() {
                return Ok(0);
            }
            let mut batch = WriteBatch::default();
            for doc in &doomed {
                batch.delete_cf(cf_docs, doc.id.as_bytes());
            }
            db.write_opt(batch, &opts)?;
            Ok(doomed.len() as u64)
        })
        .await
    }

    async fn find_blocks(&self, filter: &BlockFilter) -> Result<Vec<BlockRow>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |db| {
            let mut rows: Vec<BlockRow> =
                Self::scan_blocks(db, &filter)?.into_iter().map(|(_, row)| row).collect();
            sort_by_order(&mut rows);
            Ok(rows)
        })
        .await
    }

    async fn insert_blocks(&self, rows: Vec<BlockRow>) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let opts = self.write_options();
        self.blocking(move |db| {
            let cf_blocks = cf(db, CF_BLOCKS)?;
            let mut batch = WriteBatch::default();
            for row in &rows {
                batch.put_cf(cf_blocks, block_key(row.document_id, &row.id), encode_row(row)?);
            }
            db.write_opt(batch, &opts)?;
            Ok(rows.len() as u64)
        })
        .await
    }

    async fn delete_blocks(&self, filter: &BlockFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        let opts = self.write_options();
        self.blocking(move |db| {
            let cf_blocks = cf(db, CF_BLOCKS)?;
            let doomed = Self::scan_blocks(db, &filter)?;
            if doomed.is_empty() {
                return Ok(0);
            }
            let mut batch = WriteBatch::default();
            for (key, _) in &doomed {
                batch.delete_cf(cf_blocks, key);
            }
            db.write_opt(batch, &opts)?;
            Ok(doomed.len() as u64)
        })
        .await
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
