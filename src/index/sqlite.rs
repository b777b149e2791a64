//! SQLite-backed search index: documents, chunks, FTS5 and vectors.
//!
//! `index` runs chunk → embed → store. Embedding finishes before the write
//! transaction opens, so a failed or throttled embed leaves the previous
//! version of the document fully intact. The transaction then replaces the
//! document row, its chunks, FTS rows and vectors in one commit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{IndexError, IndexingPipeline};
use crate::chunk::{chunk_markdown, document_title};
use crate::embedding::{vec_to_blob, Embedder};
use crate::hasher;
use crate::models::Chunk;

pub struct SqliteIndex {
    pool: SqlitePool,
    max_tokens: usize,
    embedder: Option<Arc<dyn Embedder>>,
    batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
}

impl SqliteIndex {
    pub fn new(
        pool: SqlitePool,
        max_tokens: usize,
        embedder: Option<Arc<dyn Embedder>>,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            max_tokens,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn stats(&self) -> anyhow::Result<IndexStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexStats {
            documents,
            chunks,
            embedded,
        })
    }

    /// Content hash the index currently holds for `path`.
    #[cfg(test)]
    pub async fn indexed_hash(&self, path: &str) -> anyhow::Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT content_hash FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, IndexError> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };

        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            vectors.extend(embedder.embed(&texts).await?);
        }
        Ok(vectors)
    }
}

async fn delete_document_rows(
    tx: &mut Transaction<'_, Sqlite>,
    document_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl IndexingPipeline for SqliteIndex {
    async fn index(&self, path: &str, content: &str) -> Result<usize, IndexError> {
        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        let doc_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let chunks = chunk_markdown(&doc_id, content, self.max_tokens);
        let vectors = self.embed_chunks(&chunks).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, path, title, content_hash, size, updated_at, body)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                title = excluded.title,
                content_hash = excluded.content_hash,
                size = excluded.size,
                updated_at = excluded.updated_at,
                body = excluded.body
            "#,
        )
        .bind(&doc_id)
        .bind(path)
        .bind(document_title(content))
        .bind(hasher::hash_bytes(content.as_bytes()))
        .bind(content.len() as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(content)
        .execute(&mut *tx)
        .await?;

        delete_document_rows(&mut tx, &doc_id).await?;

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(embedder) = &self.embedder {
            let now = chrono::Utc::now().timestamp();
            for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                sqlx::query(
                    "INSERT INTO embeddings (chunk_id, model, dims, created_at, hash) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(embedder.model_name())
                .bind(embedder.dims() as i64)
                .bind(now)
                .bind(&chunk.hash)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        tracing::debug!(path, chunks = chunks.len(), "indexed document");
        Ok(chunks.len())
    }

    async fn deindex(&self, path: &str) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(doc_id) = existing_id {
            delete_document_rows(&mut tx, &doc_id).await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
            tracing::debug!(path, "removed document from index");
        }

        tx.commit().await?;
        Ok(())
    }
}
