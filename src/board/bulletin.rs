use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use super::{epoch, new_record_id, non_blank, now_millis, Attachment, OneOrMany};
use crate::error::{ApiError, ApiResult};
use crate::store::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bulletin {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "epoch")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body for creating or replacing a bulletin.
#[derive(Debug, Default, Deserialize)]
pub struct BulletinDraft {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Option<OneOrMany<Attachment>>,
}

impl BulletinDraft {
    fn validate(self) -> ApiResult<(String, String, Vec<Attachment>)> {
        match (non_blank(self.title.as_deref()), non_blank(self.content.as_deref())) {
            (Some(title), Some(content)) => Ok((
                title,
                content,
                self.attachments.map(OneOrMany::into_vec).unwrap_or_default(),
            )),
            _ => Err(ApiError::bad_request("title and content are required")),
        }
    }
}

#[derive(Clone)]
pub struct BulletinBoard {
    store: Arc<dyn KvStore>,
}

impl BulletinBoard {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<Bulletin>> {
        let mut bulletins = Vec::new();
        for key in self.store.list(None).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Bulletin>(&raw) {
                Ok(mut bulletin) => {
                    if bulletin.id.is_empty() {
                        bulletin.id = key;
                    }
                    bulletins.push(bulletin);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable bulletin record"),
            }
        }
        bulletins.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(bulletins)
    }

    pub async fn create(&self, draft: BulletinDraft) -> ApiResult<String> {
        let (title, content, attachments) = draft.validate()?;
        let bulletin = Bulletin {
            id: new_record_id("bulletin"),
            title,
            content,
            attachments,
            date: Utc::now(),
            created_at: now_millis(),
            updated_at: None,
            extra: Map::new(),
        };
        self.store.put_json(&bulletin.id, &bulletin, None).await?;
        Ok(bulletin.id)
    }

    /// Replaces title, content and attachments of an existing bulletin.
    pub async fn update(&self, id: &str, draft: BulletinDraft) -> ApiResult<Bulletin> {
        let mut bulletin: Bulletin = self
            .store
            .get_json(id)
            .await?
            .ok_or_else(|| ApiError::not_found("bulletin not found"))?;
        let (title, content, attachments) = draft.validate()?;
        bulletin.id = id.to_string();
        bulletin.title = title;
        bulletin.content = content;
        bulletin.attachments = attachments;
        bulletin.updated_at = Some(now_millis());
        self.store.put_json(id, &bulletin, None).await?;
        Ok(bulletin)
    }

    pub async fn delete(&self, id: &str) -> ApiResult<()> {
        if self.store.get(id).await?.is_none() {
            return Err(ApiError::not_found("bulletin not found"));
        }
        self.store.delete(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn draft(value: Value) -> BulletinDraft {
        serde_json::from_value(value).unwrap()
    }

    fn board() -> BulletinBoard {
        BulletinBoard::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn create_then_list_newest_first() {
        let board = board();
        let first = board
            .create(draft(json!({"title": "Water", "content": "Off on Friday"})))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = board
            .create(draft(json!({
                "title": "Power",
                "content": "Maintenance",
                "attachments": [{"url": "https://cdn.example/plan.pdf"}]
            })))
            .await
            .unwrap();
        assert!(first.starts_with("bulletin-"));

        let list = board.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second);
        assert_eq!(list[0].attachments.len(), 1);
        assert_eq!(list[1].id, first);
    }

    #[tokio::test]
    async fn create_requires_title_and_content() {
        let board = board();
        let err = board.create(draft(json!({"title": "only"}))).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = board
            .create(draft(json!({"title": " ", "content": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn update_replaces_and_keeps_creation_time() {
        let board = board();
        let id = board
            .create(draft(json!({
                "title": "Water",
                "content": "Off",
                "attachments": {"url": "https://cdn.example/a.png"}
            })))
            .await
            .unwrap();
        let updated = board
            .update(&id, draft(json!({"title": "Water", "content": "Back on"})))
            .await
            .unwrap();
        assert_eq!(updated.content, "Back on");
        assert!(updated.attachments.is_empty());
        assert!(updated.created_at > 0);
        assert!(updated.updated_at.is_some());

        let missing = board
            .update("bulletin-x", draft(json!({"title": "a", "content": "b"})))
            .await
            .unwrap_err();
        assert!(matches!(missing, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_checks_existence() {
        let board = board();
        let id = board
            .create(draft(json!({"title": "t", "content": "c"})))
            .await
            .unwrap();
        board.delete(&id).await.unwrap();
        assert!(matches!(board.delete(&id).await.unwrap_err(), ApiError::NotFound(_)));
        assert!(board.list().await.unwrap().is_empty());
    }
}
