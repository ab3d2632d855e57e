//! Durable storage for documents, trees, and chunks.
//!
//! SQLite-backed. Each ingest is one logical transaction: the document
//! row flips to `completed` in the same transaction that writes the tree
//! and chunk rows, so no partial document is ever visible. Deleting a
//! document cascades to its tree and chunks.
//!
//! Embeddings are stored as little-endian packed f32 BLOBs.

use crate::chunker::Chunk;
use crate::error::{IndexError, Result};
use crate::tree::{DocumentTree, NoTextTree, NodeMap};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Processing,
    Completed,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Processing => "processing",
            DocStatus::Completed => "completed",
            DocStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => DocStatus::Completed,
            "failed" => DocStatus::Failed,
            _ => DocStatus::Processing,
        }
    }
}

/// A document metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub company: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub doc_type: String,
    pub filename: String,
    pub page_count: usize,
    pub total_tokens: usize,
    pub node_count: usize,
    pub chunk_count: usize,
    pub status: DocStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub ingest_timestamp: String,
}

/// A chunk embedding loaded for value search.
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub node_id: String,
    pub chunk_index: usize,
    pub embedding: Vec<f32>,
}

/// The tree artefacts persisted for one document.
#[derive(Debug, Clone)]
pub struct StoredTree {
    pub tree: DocumentTree,
    pub tree_no_text: NoTextTree,
    pub node_map: NodeMap,
}

/// SQLite-backed store with serialized writes.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY,
                company TEXT NOT NULL,
                ticker TEXT NOT NULL,
                fiscal_year INTEGER NOT NULL,
                doc_type TEXT NOT NULL,
                filename TEXT NOT NULL,
                page_count INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                node_count INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'processing',
                error_message TEXT,
                ingest_timestamp TEXT NOT NULL,
                UNIQUE(ticker, fiscal_year, doc_type)
            );

            CREATE TABLE IF NOT EXISTS trees (
                doc_id INTEGER PRIMARY KEY
                    REFERENCES documents(id) ON DELETE CASCADE,
                tree_json TEXT NOT NULL,
                tree_no_text TEXT NOT NULL,
                node_map_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                doc_id INTEGER NOT NULL
                    REFERENCES documents(id) ON DELETE CASCADE,
                node_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                start_page INTEGER NOT NULL,
                end_page INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                UNIQUE(doc_id, node_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_doc_node ON chunks(doc_id, node_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IndexError::Storage("connection lock poisoned".to_string()))
    }

    /// Insert a new `processing` document row.
    ///
    /// Fails with [`IndexError::DuplicateDocument`] when a row for the same
    /// (ticker, fiscal_year, doc_type) already exists.
    pub fn insert_document(
        &self,
        company: &str,
        ticker: &str,
        fiscal_year: i64,
        doc_type: &str,
        filename: &str,
    ) -> Result<i64> {
        if let Some(existing) = self.find_document(ticker, fiscal_year, doc_type)? {
            return Err(IndexError::DuplicateDocument {
                ticker: ticker.to_string(),
                fiscal_year,
                doc_type: doc_type.to_string(),
                doc_id: existing.id,
            });
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO documents (company, ticker, fiscal_year, doc_type, filename, status, ingest_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, 'processing', ?6)",
            params![
                company,
                ticker,
                fiscal_year,
                doc_type,
                filename,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Look up a document by its unique metadata key.
    pub fn find_document(
        &self,
        ticker: &str,
        fiscal_year: i64,
        doc_type: &str,
    ) -> Result<Option<DocumentRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM documents WHERE ticker = ?1 AND fiscal_year = ?2 AND doc_type = ?3",
                DOC_COLUMNS
            ),
            params![ticker, fiscal_year, doc_type],
            row_to_document,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fetch a document by id.
    pub fn get_document(&self, doc_id: i64) -> Result<Option<DocumentRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOC_COLUMNS),
            params![doc_id],
            row_to_document,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All documents, oldest first.
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM documents ORDER BY id", DOC_COLUMNS))?;
        let rows = stmt.query_map([], row_to_document)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Completed documents only, the retrieval candidate set.
    pub fn list_completed(&self) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .list_documents()?
            .into_iter()
            .filter(|d| d.status == DocStatus::Completed)
            .collect())
    }

    /// Delete a document; tree and chunks cascade.
    pub fn delete_document(&self, doc_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])?;
        Ok(())
    }

    /// Mark a document failed, preserving the error message.
    pub fn mark_failed(&self, doc_id: i64, message: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE documents SET status = 'failed', error_message = ?2 WHERE id = ?1",
            params![doc_id, message],
        )?;
        Ok(())
    }

    /// Finish an ingest: one transaction writing the document counters, the
    /// tree artefacts, and every chunk, then flipping status to `completed`.
    pub fn complete_document(
        &self,
        doc_id: i64,
        page_count: usize,
        total_tokens: usize,
        tree: &DocumentTree,
        chunks: &[(Chunk, Vec<f32>)],
    ) -> Result<()> {
        let tree_no_text = tree.to_no_text();
        let node_map = tree.to_node_map();

        let tree_json =
            serde_json::to_string(tree).map_err(|e| IndexError::Serialization(e.to_string()))?;
        let no_text_json = serde_json::to_string(&tree_no_text)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        let node_map_json = serde_json::to_string(&node_map)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE documents
             SET page_count = ?2, total_tokens = ?3, node_count = ?4, chunk_count = ?5,
                 status = 'completed', error_message = NULL
             WHERE id = ?1",
            params![
                doc_id,
                page_count,
                total_tokens,
                tree.node_count(),
                chunks.len()
            ],
        )?;

        tx.execute(
            "INSERT OR REPLACE INTO trees (doc_id, tree_json, tree_no_text, node_map_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![doc_id, tree_json, no_text_json, node_map_json],
        )?;

        for (chunk, embedding) in chunks {
            tx.execute(
                "INSERT INTO chunks (doc_id, node_id, chunk_index, content, token_count,
                                     start_page, end_page, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    doc_id,
                    chunk.node_id,
                    chunk.chunk_index,
                    chunk.content,
                    chunk.token_count,
                    chunk.start_page,
                    chunk.end_page,
                    embedding_to_blob(embedding),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the tree artefacts for a document.
    pub fn load_tree(&self, doc_id: i64) -> Result<Option<StoredTree>> {
        let conn = self.conn()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT tree_json, tree_no_text, node_map_json FROM trees WHERE doc_id = ?1",
                params![doc_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((tree_json, no_text_json, node_map_json)) = row else {
            return Ok(None);
        };

        Ok(Some(StoredTree {
            tree: serde_json::from_str(&tree_json)
                .map_err(|e| IndexError::Serialization(e.to_string()))?,
            tree_no_text: serde_json::from_str(&no_text_json)
                .map_err(|e| IndexError::Serialization(e.to_string()))?,
            node_map: serde_json::from_str(&node_map_json)
                .map_err(|e| IndexError::Serialization(e.to_string()))?,
        }))
    }

    /// Load every chunk embedding for a document, for in-memory scoring.
    pub fn load_chunk_embeddings(&self, doc_id: i64) -> Result<Vec<ChunkEmbedding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, chunk_index, embedding FROM chunks
             WHERE doc_id = ?1 ORDER BY node_id, chunk_index",
        )?;
        let rows = stmt.query_map(params![doc_id], |row| {
            let blob: Vec<u8> = row.get(2)?;
            Ok(ChunkEmbedding {
                node_id: row.get(0)?,
                chunk_index: row.get::<_, i64>(1)? as usize,
                embedding: blob_to_embedding(&blob),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Number of chunk rows for a document.
    pub fn chunk_count(&self, doc_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE doc_id = ?1",
            params![doc_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Total number of documents.
    pub fn document_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

const DOC_COLUMNS: &str = "id, company, ticker, fiscal_year, doc_type, filename, page_count, \
                           total_tokens, node_count, chunk_count, status, error_message, \
                           ingest_timestamp";

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let status: String = row.get(10)?;
    Ok(DocumentRecord {
        id: row.get(0)?,
        company: row.get(1)?,
        ticker: row.get(2)?,
        fiscal_year: row.get(3)?,
        doc_type: row.get(4)?,
        filename: row.get(5)?,
        page_count: row.get::<_, i64>(6)? as usize,
        total_tokens: row.get::<_, i64>(7)? as usize,
        node_count: row.get::<_, i64>(8)? as usize,
        chunk_count: row.get::<_, i64>(9)? as usize,
        status: DocStatus::parse(&status),
        error_message: row.get(11)?,
        ingest_timestamp: row.get(12)?,
    })
}

/// Pack an embedding into a little-endian f32 BLOB.
pub fn embedding_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Unpack a little-endian f32 BLOB into an embedding.
pub fn blob_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeNode;

    fn sample_tree() -> DocumentTree {
        let mut tree = DocumentTree::new(
            "INFY_20F_2022",
            vec![
                TreeNode::new("Item 1", 1, 10),
                TreeNode::new("Item 2", 11, 20),
            ],
            20,
        );
        tree.nodes[0].text = Some("business overview".to_string());
        tree.assign_node_ids();
        tree
    }

    fn sample_chunks() -> Vec<(Chunk, Vec<f32>)> {
        vec![
            (
                Chunk {
                    node_id: "0000".to_string(),
                    chunk_index: 0,
                    content: "business overview".to_string(),
                    token_count: 2,
                    start_page: 1,
                    end_page: 10,
                },
                vec![1.0, 0.0, 0.5],
            ),
            (
                Chunk {
                    node_id: "0001".to_string(),
                    chunk_index: 0,
                    content: "risk factors".to_string(),
                    token_count: 2,
                    start_page: 11,
                    end_page: 20,
                },
                vec![0.0, 1.0, 0.25],
            ),
        ]
    }

    #[test]
    fn test_blob_roundtrip() {
        let vec = vec![0.1f32, -2.5, 3.75, 0.0];
        let blob = embedding_to_blob(&vec);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(&blob), vec);
    }

    #[test]
    fn test_insert_and_duplicate() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "INFY_20F_2022.pdf")
            .unwrap();

        let err = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "INFY_20F_2022.pdf")
            .unwrap_err();
        match err {
            IndexError::DuplicateDocument { doc_id, .. } => assert_eq!(doc_id, id),
            other => panic!("expected duplicate error, got {other}"),
        }

        // Different year is fine
        assert!(
            store
                .insert_document("Infosys", "INFY", 2023, "20-F", "INFY_20F_2023.pdf")
                .is_ok()
        );
    }

    #[test]
    fn test_complete_document_transaction() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "f.pdf")
            .unwrap();

        let tree = sample_tree();
        store
            .complete_document(id, 20, 9000, &tree, &sample_chunks())
            .unwrap();

        let doc = store.get_document(id).unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Completed);
        assert_eq!(doc.page_count, 20);
        assert_eq!(doc.node_count, 2);
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(store.chunk_count(id).unwrap(), 2);

        let stored = store.load_tree(id).unwrap().unwrap();
        assert_eq!(stored.tree.node_count(), 2);
        assert_eq!(stored.node_map.len(), 2);
        assert_eq!(stored.tree_no_text.nodes.len(), 2);

        let embeddings = store.load_chunk_embeddings(id).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].node_id, "0000");
        assert_eq!(embeddings[0].embedding, vec![1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_delete_cascades() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "f.pdf")
            .unwrap();
        store
            .complete_document(id, 20, 9000, &sample_tree(), &sample_chunks())
            .unwrap();

        store.delete_document(id).unwrap();

        assert!(store.get_document(id).unwrap().is_none());
        assert!(store.load_tree(id).unwrap().is_none());
        assert_eq!(store.chunk_count(id).unwrap(), 0);
        assert_eq!(store.document_count().unwrap(), 0);
    }

    #[test]
    fn test_mark_failed_preserves_message() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "f.pdf")
            .unwrap();

        store.mark_failed(id, "outline generation failed").unwrap();

        let doc = store.get_document(id).unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Failed);
        assert_eq!(
            doc.error_message.as_deref(),
            Some("outline generation failed")
        );
        // Failed documents are not retrieval candidates
        assert!(store.list_completed().unwrap().is_empty());
    }

    #[test]
    fn test_force_replacement_flow() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "f.pdf")
            .unwrap();
        store
            .complete_document(first, 20, 9000, &sample_tree(), &sample_chunks())
            .unwrap();

        // Force path: delete then reinsert under the same key.
        store.delete_document(first).unwrap();
        let second = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "f.pdf")
            .unwrap();

        assert_ne!(first, second);
        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second);
    }
}
