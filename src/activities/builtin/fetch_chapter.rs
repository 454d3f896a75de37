use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::activities::{Activity, ActivityContext, ActivityError, require_str};

/// Loads a chapter's raw text from the content store.
///
/// Layout: `{library}/{book_id}/{chapter_id}.txt`. A missing book or chapter
/// is a permanent error (retrying an invalid identifier cannot help), while
/// any other I/O trouble is transient.
pub struct FetchChapterActivity;

#[async_trait]
impl Activity for FetchChapterActivity {
    fn name(&self) -> &str {
        "fetch_chapter"
    }

    fn description(&self) -> &str {
        "Read a chapter's text from the book library"
    }

    async fn execute(
        &self,
        input: &serde_json::Value,
        ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        let book_id = require_str(input, "book_id")?;
        let chapter_id = require_str(input, "chapter_id")?;
        validate_path_component(book_id)?;
        validate_path_component(chapter_id)?;

        let path = ctx
            .library_dir
            .join(book_id)
            .join(format!("{}.txt", chapter_id));

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ActivityError::permanent(anyhow::anyhow!(
                    "chapter '{}' of book '{}' not found at {}",
                    chapter_id,
                    book_id,
                    path.display()
                )));
            }
            Err(e) => {
                return Err(ActivityError::transient(
                    anyhow::Error::new(e)
                        .context(format!("failed to read chapter file {}", path.display())),
                ));
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let content_sha256 = hex::encode(hasher.finalize());

        Ok(serde_json::json!({
            "text": text,
            "content_sha256": content_sha256,
            "source_path": path.to_string_lossy(),
        }))
    }
}

fn validate_path_component(id: &str) -> Result<(), ActivityError> {
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(ActivityError::permanent(anyhow::anyhow!(
            "identifier '{}' contains path separators",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &std::path::Path) -> ActivityContext {
        ActivityContext {
            run_id: "r1".to_string(),
            step_index: 0,
            attempt: 1,
            effect_key: "k".to_string(),
            library_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn reads_chapter_text_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("book-42")).unwrap();
        std::fs::write(dir.path().join("book-42/ch-3.txt"), "Hello!\n").unwrap();

        let input = serde_json::json!({ "book_id": "book-42", "chapter_id": "ch-3" });
        let out = FetchChapterActivity
            .execute(&input, ctx(dir.path()))
            .await
            .unwrap();

        assert_eq!(out["text"], "Hello!\n");
        assert_eq!(out["content_sha256"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn missing_chapter_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let input = serde_json::json!({ "book_id": "nope", "chapter_id": "ch-1" });
        let err = FetchChapterActivity
            .execute(&input, ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let input = serde_json::json!({ "book_id": "../etc", "chapter_id": "passwd" });
        let err = FetchChapterActivity
            .execute(&input, ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
