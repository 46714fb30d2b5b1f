use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{epoch, new_record_id, non_blank, now_millis, present, Attachment, OneOrMany};
use crate::error::{ApiError, ApiResult};
use crate::store::KvStore;

// Checked on new input only. Stored records over these limits still load.
pub const MAX_FIELD_CHARS: usize = 100;
pub const MAX_TEXT_CHARS: usize = 2000;
pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

fn anonymous() -> String {
    ANONYMOUS_AUTHOR.to_string()
}

/// Stored comments may predate some fields, so every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    #[serde(default = "anonymous")]
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "epoch")]
    pub date: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    #[serde(default)]
    pub content: String,
    #[serde(default = "epoch")]
    pub date: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resident's submission as persisted in the `advices` namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub building: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub pending_attachments: Vec<Attachment>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub replies: Vec<Reply>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default = "epoch")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of a public `POST /api/advice`. Older clients send
/// `author`/`title`/`content` instead of `name`/`contact`/`description`.
#[derive(Debug, Default, Deserialize)]
pub struct AdviceSubmission {
    pub name: Option<String>,
    pub author: Option<String>,
    pub building: Option<String>,
    pub contact: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Option<OneOrMany<Attachment>>,
}

/// Partial update; `None` leaves a field untouched, `Some(None)` is an explicit null.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvicePatch {
    #[serde(default, deserialize_with = "present")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub building: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub contact: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub attachments: Option<Option<Vec<Attachment>>>,
    #[serde(default, deserialize_with = "present")]
    pub pending_attachments: Option<Option<Vec<Attachment>>>,
    #[serde(default, deserialize_with = "present")]
    pub comments: Option<Option<Vec<Comment>>>,
    #[serde(default, deserialize_with = "present")]
    pub replies: Option<Option<Vec<Reply>>>,
    #[serde(default, deserialize_with = "present")]
    pub title: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub content: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub author: Option<Option<String>>,
}

impl AdvicePatch {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.building.is_none()
            && self.contact.is_none()
            && self.description.is_none()
            && self.attachments.is_none()
            && self.pending_attachments.is_none()
            && self.comments.is_none()
            && self.replies.is_none()
            && self.title.is_none()
            && self.content.is_none()
            && self.author.is_none()
    }
}

fn required_field(value: Option<&str>, label: &str) -> ApiResult<String> {
    let value = non_blank(value).ok_or_else(|| ApiError::bad_request(format!("{label} is required")))?;
    if value.chars().count() > MAX_FIELD_CHARS {
        return Err(ApiError::bad_request(format!(
            "{label} must be at most {MAX_FIELD_CHARS} characters"
        )));
    }
    Ok(value)
}

fn long_text(value: Option<&str>, label: &str) -> ApiResult<String> {
    let value = value.map(str::trim).unwrap_or_default().to_string();
    if value.chars().count() > MAX_TEXT_CHARS {
        return Err(ApiError::bad_request(format!(
            "{label} must be at most {MAX_TEXT_CHARS} characters"
        )));
    }
    Ok(value)
}

/// Advice persistence and the moderation operations on top of it.
#[derive(Clone)]
pub struct AdviceBoard {
    store: Arc<dyn KvStore>,
}

impl AdviceBoard {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Every readable record, newest first.
    pub async fn list_all(&self) -> Result<Vec<Advice>> {
        let mut advices = Vec::new();
        for key in self.store.list(None).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Advice>(&raw) {
                Ok(mut advice) => {
                    if advice.id.is_empty() {
                        advice.id = key;
                    }
                    debug!(
                        id = %advice.id,
                        attachments = advice.attachments.len(),
                        pending = advice.pending_attachments.len(),
                        "loaded advice"
                    );
                    advices.push(advice);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable advice record"),
            }
        }
        advices.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(advices)
    }

    pub async fn list_approved(&self) -> Result<Vec<Advice>> {
        let mut advices = self.list_all().await?;
        advices.retain(|a| a.approved);
        Ok(advices)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Advice>> {
        self.store.get_json(id).await
    }

    async fn existing(&self, id: &str) -> ApiResult<Advice> {
        self.get(id)
            .await?
            .ok_or_else(|| ApiError::not_found("advice not found"))
    }

    async fn save(&self, advice: &Advice) -> Result<()> {
        self.store.put_json(&advice.id, advice, None).await
    }

    /// Validates and stores a new submission, returning its ID.
    pub async fn create(&self, submission: AdviceSubmission) -> ApiResult<String> {
        let name = required_field(submission.name.or(submission.author).as_deref(), "name")?;
        let building = required_field(submission.building.as_deref(), "building")?;
        let contact = required_field(submission.contact.or(submission.title).as_deref(), "contact")?;
        let description = long_text(
            submission.description.or(submission.content).as_deref(),
            "description",
        )?;
        let pending = submission
            .attachments
            .map(OneOrMany::into_vec)
            .unwrap_or_default();

        let advice = Advice {
            id: new_record_id("advice"),
            name,
            building,
            contact,
            description,
            attachments: Vec::new(),
            pending_attachments: pending,
            comments: Vec::new(),
            replies: Vec::new(),
            approved: false,
            date: Utc::now(),
            created_at: now_millis(),
            updated_at: None,
            extra: Map::new(),
        };
        self.save(&advice).await?;
        debug!(id = %advice.id, pending = advice.pending_attachments.len(), "advice created");
        Ok(advice.id)
    }

    pub async fn update(&self, id: &str, patch: AdvicePatch) -> ApiResult<Advice> {
        if patch.is_empty() {
            return Err(ApiError::bad_request("no updatable fields supplied"));
        }
        let mut advice = self.existing(id).await?;

        if let Some(name) = &patch.name {
            advice.name = required_field(name.as_deref(), "name")?;
        }
        if let Some(building) = &patch.building {
            advice.building = required_field(building.as_deref(), "building")?;
        }
        if let Some(contact) = &patch.contact {
            advice.contact = required_field(contact.as_deref(), "contact")?;
        }
        if let Some(description) = &patch.description {
            advice.description = long_text(description.as_deref(), "description")?;
        }
        if let Some(attachments) = patch.attachments {
            advice.attachments = attachments.unwrap_or_default();
        }
        if let Some(pending) = patch.pending_attachments {
            advice.pending_attachments = pending.unwrap_or_default();
        }
        if let Some(comments) = patch.comments {
            advice.comments = comments.unwrap_or_default();
        }
        if let Some(replies) = patch.replies {
            advice.replies = replies.unwrap_or_default();
        }
        if let Some(title) = &patch.title {
            advice.contact = required_field(title.as_deref(), "contact")?;
        }
        if let Some(content) = &patch.content {
            advice.description = long_text(content.as_deref(), "description")?;
        }
        if let Some(author) = &patch.author {
            advice.name = required_field(author.as_deref(), "name")?;
        }

        if advice.id.is_empty() {
            advice.id = id.to_string();
        }
        advice.updated_at = Some(now_millis());
        self.save(&advice).await?;
        Ok(advice)
    }

    pub async fn delete(&self, id: &str) -> ApiResult<()> {
        if self.store.get(id).await?.is_none() {
            return Err(ApiError::not_found("advice not found"));
        }
        self.store.delete(id).await?;
        Ok(())
    }

    pub async fn add_comment(
        &self,
        advice_id: Option<&str>,
        author: Option<&str>,
        content: Option<&str>,
    ) -> ApiResult<Comment> {
        let (Some(advice_id), Some(content)) = (non_blank(advice_id), non_blank(content)) else {
            return Err(ApiError::bad_request("adviceId and content are required"));
        };
        if content.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::bad_request(format!(
                "content must be at most {MAX_TEXT_CHARS} characters"
            )));
        }
        let author = match non_blank(author) {
            Some(a) if a.chars().count() > MAX_FIELD_CHARS => {
                return Err(ApiError::bad_request(format!(
                    "author must be at most {MAX_FIELD_CHARS} characters"
                )))
            }
            Some(a) => a,
            None => ANONYMOUS_AUTHOR.to_string(),
        };

        let mut advice = self.existing(&advice_id).await?;
        let comment = Comment {
            author,
            content,
            date: Utc::now(),
            extra: Map::new(),
        };
        advice.comments.push(comment.clone());
        advice.id = advice_id;
        advice.updated_at = Some(now_millis());
        self.save(&advice).await?;
        Ok(comment)
    }

    pub async fn approve(&self, id: &str) -> ApiResult<Advice> {
        let mut advice = self.existing(id).await?;
        advice.approved = true;
        advice.id = id.to_string();
        advice.updated_at = Some(now_millis());
        self.save(&advice).await?;
        Ok(advice)
    }

    pub async fn reply(&self, id: &str, text: Option<&str>) -> ApiResult<Advice> {
        let mut advice = self.existing(id).await?;
        let content = non_blank(text).ok_or_else(|| ApiError::bad_request("reply text is required"))?;
        if content.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::bad_request(format!(
                "reply must be at most {MAX_TEXT_CHARS} characters"
            )));
        }
        advice.replies.push(Reply {
            content,
            date: Utc::now(),
            extra: Map::new(),
        });
        advice.id = id.to_string();
        advice.updated_at = Some(now_millis());
        self.save(&advice).await?;
        Ok(advice)
    }

    /// Deletes without checking existence; removing twice is not an error.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(id).await
    }
}
