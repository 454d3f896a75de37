use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::activities::{Activity, ActivityContext, ActivityError, require_str};

/// Persists annotated chunks back into the content store.
///
/// Output layout: `{library}/{book_id}/{chapter_id}.chunks/` with one
/// zero-padded file per chunk plus a manifest. The manifest records the
/// effect key of the step that wrote it; a retry of the same step sees its
/// own key and returns the recorded result instead of rewriting; this is
/// the idempotency contract the orchestrator requires of activities.
pub struct StoreChunksActivity;

#[derive(Serialize, Deserialize)]
struct ChunkManifest {
    effect_key: String,
    run_id: String,
    chunk_count: usize,
    files: Vec<String>,
}

#[async_trait]
impl Activity for StoreChunksActivity {
    fn name(&self) -> &str {
        "store_chunks"
    }

    fn description(&self) -> &str {
        "Write annotated chunks and a manifest into the book library"
    }

    async fn execute(
        &self,
        input: &serde_json::Value,
        ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        let book_id = require_str(input, "book_id")?;
        let chapter_id = require_str(input, "chapter_id")?;
        let annotated = input
            .get("annotated")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ActivityError::permanent(anyhow::anyhow!("missing input field 'annotated'"))
            })?;

        let out_dir = ctx
            .library_dir
            .join(book_id)
            .join(format!("{}.chunks", chapter_id));
        let manifest_path = out_dir.join("manifest.json");

        // Re-execution of the same step is a no-op.
        if let Ok(data) = tokio::fs::read_to_string(&manifest_path).await {
            if let Ok(manifest) = serde_json::from_str::<ChunkManifest>(&data) {
                if manifest.effect_key == ctx.effect_key {
                    info!(
                        run_id = %ctx.run_id,
                        step = ctx.step_index,
                        "Chunks already written by this step, skipping"
                    );
                    return Ok(serde_json::json!({
                        "written": manifest.chunk_count,
                        "output_dir": out_dir.to_string_lossy(),
                        "deduplicated": true,
                    }));
                }
            }
        }

        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| ActivityError::transient(anyhow::Error::new(e)))?;

        let mut files = Vec::with_capacity(annotated.len());
        for (i, entry) in annotated.iter().enumerate() {
            let text = entry.get("text").and_then(|v| v.as_str()).ok_or_else(|| {
                ActivityError::permanent(anyhow::anyhow!("annotated chunk {} has no text", i))
            })?;
            let file_name = format!("{:03}.txt", i);
            tokio::fs::write(out_dir.join(&file_name), text)
                .await
                .map_err(|e| ActivityError::transient(anyhow::Error::new(e)))?;
            files.push(file_name);
        }

        let manifest = ChunkManifest {
            effect_key: ctx.effect_key.clone(),
            run_id: ctx.run_id.clone(),
            chunk_count: files.len(),
            files,
        };

        // Atomic manifest write: the manifest appearing is the commit point.
        let tmp_path = out_dir.join("manifest.json.tmp");
        let data = serde_json::to_string_pretty(&manifest)
            .map_err(|e| ActivityError::permanent(anyhow::Error::new(e)))?;
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| ActivityError::transient(anyhow::Error::new(e)))?;
        tokio::fs::rename(&tmp_path, &manifest_path)
            .await
            .map_err(|e| ActivityError::transient(anyhow::Error::new(e)))?;

        info!(
            run_id = %ctx.run_id,
            step = ctx.step_index,
            chunks = manifest.chunk_count,
            dir = %out_dir.display(),
            "Chunks written"
        );

        Ok(serde_json::json!({
            "written": manifest.chunk_count,
            "output_dir": out_dir.to_string_lossy(),
            "deduplicated": false,
        }))
    }
}
