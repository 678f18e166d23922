//! Activity records and the identifiers that scope them
//!
//! Every synchronized entity is a [`Record`]: a client-assigned [`LocalId`],
//! an optional [`CanonicalId`] handed out by the remote store once the write
//! is durable, the [`OwnerScope`] it belongs to and a kind-specific
//! [`RecordBody`].

use crate::{normalize, CpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The (teacher, class) pair all cached data is partitioned by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerScope {
    pub owner_id: String,
    pub class_id: String,
}

impl OwnerScope {
    pub fn new(owner_id: impl Into<String>, class_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            class_id: class_id.into(),
        }
    }

    /// Prefix for every local cache key belonging to this scope
    pub fn storage_prefix(&self) -> String {
        format!("{}/{}", self.owner_id, self.class_id)
    }

    /// Path of a collection inside the remote document store
    pub fn remote_path(&self, collection: Collection) -> String {
        format!(
            "teachers/{}/classes/{}/{}",
            self.owner_id,
            self.class_id,
            collection.key()
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(CpError::ValidationError("owner id cannot be empty".into()));
        }
        if self.class_id.trim().is_empty() {
            return Err(CpError::ValidationError("class id cannot be empty".into()));
        }
        if self.owner_id.contains('/') || self.class_id.contains('/') {
            return Err(CpError::ValidationError(
                "scope ids cannot contain '/'".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.class_id)
    }
}

/// Client-generated identifier, never sent to the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// Millisecond timestamp in hex followed by 32 random bits.
    ///
    /// Ids generated later sort after ids generated earlier (at millisecond
    /// resolution), and two devices creating a record in the same
    /// millisecond still get distinct ids.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let salt: u32 = rand::random();
        Self(format!("{:011x}-{:08x}", millis, salt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LocalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the remote store once a write is durable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CanonicalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synchronized collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Students,
    PraiseLog,
    EmotionLog,
    Notifications,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Students,
        Collection::PraiseLog,
        Collection::EmotionLog,
        Collection::Notifications,
    ];

    /// Stable name used for cache keys, bus topics and remote paths
    pub fn key(self) -> &'static str {
        match self {
            Collection::Students => "students",
            Collection::PraiseLog => "praise_log",
            Collection::EmotionLog => "emotion_log",
            Collection::Notifications => "notifications",
        }
    }

    /// Append-mostly activity logs are capped; the roster is not.
    pub fn is_log(self) -> bool {
        !matches!(self, Collection::Students)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Collection {
    type Err = CpError;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.key() == s || c.key().replace('_', "-") == s)
            .ok_or_else(|| CpError::UnknownCollection(s.to_string()))
    }
}

/// One conversation turn of an emotion check-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub student_message: String,
    #[serde(default)]
    pub teacher_reply: Option<String>,
    /// One-way latch: once true it never reverts through a merge
    #[serde(default)]
    pub read: bool,
}

impl Turn {
    pub fn new(student_message: impl Into<String>) -> Self {
        Self {
            student_message: student_message.into(),
            teacher_reply: None,
            read: false,
        }
    }

    /// Take every field from `remote` except `read`, which is OR-ed.
    pub fn merge_from(&mut self, remote: &Turn) {
        let read = self.read || remote.read;
        *self = remote.clone();
        self.read = read;
    }
}

/// Fields that identify "the same action" when no canonical id is known yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
    pub kind: &'static str,
    pub subject: &'a str,
    pub discriminant: &'a str,
}

/// Kind-specific payload of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RecordBody {
    Praise {
        student_id: String,
        category: String,
        amount: i64,
        #[serde(default)]
        note: Option<String>,
    },
    EmotionCheckIn {
        student_id: String,
        emotion: String,
        #[serde(default)]
        turns: Vec<Turn>,
    },
    Student {
        student_id: String,
        name: String,
        #[serde(default)]
        points: i64,
        #[serde(default)]
        pet: Option<String>,
    },
    Notification {
        student_id: String,
        title: String,
        #[serde(default)]
        body: String,
    },
}

impl RecordBody {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordBody::Praise { .. } => "praise",
            RecordBody::EmotionCheckIn { .. } => "emotion_check_in",
            RecordBody::Student { .. } => "student",
            RecordBody::Notification { .. } => "notification",
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            RecordBody::Praise { .. } => Collection::PraiseLog,
            RecordBody::EmotionCheckIn { .. } => Collection::EmotionLog,
            RecordBody::Student { .. } => Collection::Students,
            RecordBody::Notification { .. } => Collection::Notifications,
        }
    }

    pub fn student_id(&self) -> &str {
        match self {
            RecordBody::Praise { student_id, .. }
            | RecordBody::EmotionCheckIn { student_id, .. }
            | RecordBody::Student { student_id, .. }
            | RecordBody::Notification { student_id, .. } => student_id,
        }
    }

    pub fn dedup_key(&self) -> DedupKey<'_> {
        let discriminant = match self {
            RecordBody::Praise { category, .. } => category.as_str(),
            RecordBody::EmotionCheckIn { emotion, .. } => emotion.as_str(),
            RecordBody::Student { student_id, .. } => student_id.as_str(),
            RecordBody::Notification { title, .. } => title.as_str(),
        };
        DedupKey {
            kind: self.kind(),
            subject: self.student_id(),
            discriminant,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        match self {
            RecordBody::EmotionCheckIn { turns, .. } => turns,
            _ => &[],
        }
    }

    pub fn turns_mut(&mut self) -> Option<&mut Vec<Turn>> {
        match self {
            RecordBody::EmotionCheckIn { turns, .. } => Some(turns),
            _ => None,
        }
    }

    /// Adopt `remote` as authoritative while keeping local read latches.
    ///
    /// Turns are merged index by index; local turns beyond the remote list
    /// (appended locally, not yet echoed) are kept at the end.
    pub fn merge_remote(&mut self, remote: &RecordBody) {
        let local_turns = self.turns_mut().map(std::mem::take).unwrap_or_default();
        *self = remote.clone();

        if let Some(turns) = self.turns_mut() {
            for (turn, local) in turns.iter_mut().zip(local_turns.iter()) {
                turn.read |= local.read;
            }
            if local_turns.len() > turns.len() {
                let extra = local_turns[turns.len()..].to_vec();
                turns.extend(extra);
            }
        }
    }

    /// OR the read latches of `remote` into this body, leaving every other field alone
    pub fn latch_reads_from(&mut self, remote: &RecordBody) {
        if let Some(turns) = self.turns_mut() {
            for (turn, theirs) in turns.iter_mut().zip(remote.turns()) {
                turn.read |= theirs.read;
            }
        }
    }

    /// Whether two bodies differ only in whitespace or invisible characters
    pub fn trivially_equals(&self, other: &RecordBody) -> bool {
        self.normalized() == other.normalized()
    }

    fn normalized(&self) -> RecordBody {
        let text = |s: &str| normalize::normalize_text(s);
        match self {
            RecordBody::Praise {
                student_id,
                category,
                amount,
                note,
            } => RecordBody::Praise {
                student_id: student_id.clone(),
                category: text(category),
                amount: *amount,
                note: note.as_deref().map(text).filter(|n| !n.is_empty()),
            },
            RecordBody::EmotionCheckIn {
                student_id,
                emotion,
                turns,
            } => RecordBody::EmotionCheckIn {
                student_id: student_id.clone(),
                emotion: text(emotion),
                turns: turns
                    .iter()
                    .map(|t| Turn {
                        student_message: text(&t.student_message),
                        teacher_reply: t.teacher_reply.as_deref().map(text),
                        // latches are merged separately, never compared
                        read: false,
                    })
                    .collect(),
            },
            RecordBody::Student {
                student_id,
                name,
                points,
                pet,
            } => RecordBody::Student {
                student_id: student_id.clone(),
                name: text(name),
                points: *points,
                pet: pet.as_deref().map(text),
            },
            RecordBody::Notification {
                student_id,
                title,
                body,
            } => RecordBody::Notification {
                student_id: student_id.clone(),
                title: text(title),
                body: text(body),
            },
        }
    }
}

/// A locally cached activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub local_id: LocalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<CanonicalId>,
    pub scope: OwnerScope,
    /// Client-assigned creation time in milliseconds since the epoch
    pub created_at: i64,
    pub body: RecordBody,
}

impl Record {
    /// A fresh provisional record stamped with the current time
    pub fn new(scope: OwnerScope, body: RecordBody) -> Self {
        Self::new_at(scope, body, chrono::Utc::now().timestamp_millis())
    }

    pub fn new_at(scope: OwnerScope, body: RecordBody, created_at: i64) -> Self {
        Self {
            local_id: LocalId::generate(),
            canonical_id: None,
            scope,
            created_at,
            body,
        }
    }

    /// Insert form of a record first seen in a remote snapshot
    pub fn from_remote(remote: RemoteRecord) -> Self {
        Self {
            local_id: LocalId::generate(),
            canonical_id: Some(remote.canonical_id),
            scope: remote.scope,
            created_at: remote.created_at,
            body: remote.body,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.canonical_id.is_none()
    }

    pub fn collection(&self) -> Collection {
        self.body.collection()
    }

    /// Remote document form. The local id never leaves the device.
    pub fn to_document(&self) -> Result<Value> {
        let mut doc = serde_json::to_value(&self.body)?;
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| CpError::ParseError("record body is not an object".into()))?;
        obj.insert("ownerId".into(), Value::String(self.scope.owner_id.clone()));
        obj.insert("classId".into(), Value::String(self.scope.class_id.clone()));
        obj.insert("createdAt".into(), Value::from(self.created_at));
        if let Some(id) = &self.canonical_id {
            obj.insert("id".into(), Value::String(id.to_string()));
        }
        Ok(doc)
    }
}

/// A record as delivered by the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub canonical_id: CanonicalId,
    pub scope: OwnerScope,
    pub created_at: i64,
    pub body: RecordBody,
}

impl RemoteRecord {
    /// Parse a raw remote document. Fails on anything that is not a
    /// complete, well-typed record.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| CpError::ParseError("document is not an object".into()))?;

        let field = |name: &str| -> Result<String> {
            obj.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| CpError::ParseError(format!("missing or empty `{}`", name)))
        };

        let canonical_id = CanonicalId::new(field("id")?);
        let scope = OwnerScope::new(field("ownerId")?, field("classId")?);
        let created_at = obj
            .get("createdAt")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .ok_or_else(|| CpError::ParseError("missing `createdAt`".into()))?;
        let body: RecordBody = serde_json::from_value(doc.clone())?;

        Ok(Self {
            canonical_id,
            scope,
            created_at,
            body,
        })
    }
}
