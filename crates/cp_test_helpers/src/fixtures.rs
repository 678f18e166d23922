//! Record bodies and remote documents for sync tests

use cp_common::{CanonicalId, OwnerScope, Record, RecordBody, Turn};
use serde_json::Value;

pub fn scope(owner_id: &str, class_id: &str) -> OwnerScope {
    OwnerScope::new(owner_id, class_id)
}

pub fn praise(student_id: &str, category: &str) -> RecordBody {
    RecordBody::Praise {
        student_id: student_id.to_string(),
        category: category.to_string(),
        amount: 1,
        note: None,
    }
}

pub fn check_in(student_id: &str, emotion: &str, message: &str) -> RecordBody {
    RecordBody::EmotionCheckIn {
        student_id: student_id.to_string(),
        emotion: emotion.to_string(),
        turns: vec![Turn::new(message)],
    }
}

pub fn student(student_id: &str, name: &str, points: i64) -> RecordBody {
    RecordBody::Student {
        student_id: student_id.to_string(),
        name: name.to_string(),
        points,
        pet: None,
    }
}

/// A confirmed record as the remote store would deliver it
pub fn remote_document(scope: &OwnerScope, id: &str, created_at: i64, body: RecordBody) -> Value {
    let mut record = Record::new_at(scope.clone(), body, created_at);
    record.canonical_id = Some(CanonicalId::new(id));
    record
        .to_document()
        .expect("record bodies always serialize to objects")
}
