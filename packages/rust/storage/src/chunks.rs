//! Embedded chunks owned by an indexed item.

use chrono::Utc;
use libsql::params;
use uuid::Uuid;
use webindex_shared::{IndexError, IndexId, OrgId, Result};

use crate::index::parse_id;
use crate::{Storage, db_err, finish, ts};

/// One chunk of text with its embedding vector.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub index_id: IndexId,
    pub chunk_index: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    pub model: String,
}

impl Storage {
    /// Replace every chunk of `index_id` in one transaction.
    ///
    /// Returns the new chunk ids in order.
    pub async fn replace_chunks(
        &self,
        index_id: &IndexId,
        org: &OrgId,
        model: &str,
        chunks: &[NewChunk],
    ) -> Result<Vec<String>> {
        let tx = self.begin_immediate().await?;
        let result: Result<_> = async {
            tx.execute(
                "DELETE FROM chunks WHERE index_id = ?1",
                params![index_id.to_string()],
            )
            .await
            .map_err(db_err)?;

            let now = ts(Utc::now());
            let mut ids = Vec::with_capacity(chunks.len());
            for (position, chunk) in chunks.iter().enumerate() {
                let id = Uuid::now_v7().to_string();
                let embedding = serde_json::to_string(&chunk.embedding)
                    .map_err(|e| IndexError::Storage(format!("failed to encode embedding: {e}")))?;
                tx.execute(
                    "INSERT INTO chunks (id, index_id, org_id, chunk_index, text, embedding, model, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id.as_str(),
                        index_id.to_string(),
                        org.as_str(),
                        position as i64,
                        chunk.text.as_str(),
                        embedding,
                        model,
                        now.as_str()
                    ],
                )
                .await
                .map_err(db_err)?;
                ids.push(id);
            }
            Ok(ids)
        }
        .await;
        finish(tx, result).await
    }

    pub async fn list_chunks(&self, index_id: &IndexId) -> Result<Vec<StoredChunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, index_id, chunk_index, text, embedding, model FROM chunks
                 WHERE index_id = ?1 ORDER BY chunk_index",
                params![index_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut chunks = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let embedding: String = row.get(4).map_err(db_err)?;
            chunks.push(StoredChunk {
                id: row.get(0).map_err(db_err)?,
                index_id: parse_id(&row.get::<String>(1).map_err(db_err)?)?,
                chunk_index: row.get::<i64>(2).map_err(db_err)? as u32,
                text: row.get(3).map_err(db_err)?,
                embedding: serde_json::from_str(&embedding)
                    .map_err(|e| IndexError::Storage(format!("invalid embedding: {e}")))?,
                model: row.get(5).map_err(db_err)?,
            });
        }
        Ok(chunks)
    }
}
