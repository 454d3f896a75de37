use async_trait::async_trait;

use crate::activities::builtin::chunk_chapter::estimate_tokens;
use crate::activities::{Activity, ActivityContext, ActivityError};

/// Attaches per-chunk metadata (position, line count, token estimate) that
/// downstream consumers use to pick reading order and sizes.
pub struct AnnotateChunksActivity;

#[async_trait]
impl Activity for AnnotateChunksActivity {
    fn name(&self) -> &str {
        "annotate_chunks"
    }

    fn description(&self) -> &str {
        "Attach index, line and token metadata to each chunk"
    }

    async fn execute(
        &self,
        input: &serde_json::Value,
        _ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        let chunks = input
            .get("chunks")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ActivityError::permanent(anyhow::anyhow!("missing input field 'chunks'"))
            })?;

        let mut annotated = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let text = chunk.as_str().ok_or_else(|| {
                ActivityError::permanent(anyhow::anyhow!("chunk {} is not a string", index))
            })?;
            annotated.push(serde_json::json!({
                "index": index,
                "line_count": text.lines().count(),
                "token_estimate": estimate_tokens(text),
                "text": text,
            }));
        }

        Ok(serde_json::json!({
            "annotated": annotated,
            "chunk_count": annotated.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ActivityContext {
        ActivityContext {
            run_id: "r1".to_string(),
            step_index: 2,
            attempt: 1,
            effect_key: "k".to_string(),
            library_dir: std::path::PathBuf::from("library"),
        }
    }

    #[tokio::test]
    async fn annotates_each_chunk_in_order() {
        let input = serde_json::json!({ "chunks": ["Hello!\nWorld!\n", "Bye!\n"] });
        let out = AnnotateChunksActivity.execute(&input, ctx()).await.unwrap();

        let annotated = out["annotated"].as_array().unwrap();
        assert_eq!(annotated.len(), 2);
        assert_eq!(annotated[0]["index"], 0);
        assert_eq!(annotated[0]["line_count"], 2);
        assert_eq!(annotated[1]["index"], 1);
        assert_eq!(annotated[1]["text"], "Bye!\n");
    }

    #[tokio::test]
    async fn rejects_missing_chunks() {
        let input = serde_json::json!({});
        let err = AnnotateChunksActivity
            .execute(&input, ctx())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
