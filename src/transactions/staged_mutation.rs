//! The per-attempt queue of staged document mutations.
//!
//! Inserting a mutation for a document already in the queue overwrites the
//! prior entry for that document -- an attempt only ever needs to replay its
//! latest intent for a given key at commit time.

use serde_json::Value;

use crate::common::DocumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedMutationType {
    Insert,
    Replace,
    Remove,
}

impl StagedMutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedMutationType::Insert => "insert",
            StagedMutationType::Replace => "replace",
            StagedMutationType::Remove => "remove",
        }
    }
}

/// One document's staged intent, plus enough of its pre-attempt state to
/// restore it on rollback.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    pub document_id: DocumentId,
    pub kind: StagedMutationType,
    pub staged_content: Option<Value>,
    /// CAS observed on the document immediately before staging; `0` for a
    /// fresh insert, since the shadow document is created with CAS=0.
    pub cas_before_staging: u64,
    /// The document's body before this attempt touched it, used to restore
    /// it verbatim on rollback of a `replace`/`remove`.
    pub original_content: Option<Value>,
}

/// FIFO-ordered but keyed-overwrite queue: a second stage against the same
/// document replaces the first rather than appending.
#[derive(Debug, Clone, Default)]
pub struct StagedMutationQueue {
    entries: Vec<StagedMutation>,
}

impl StagedMutationQueue {
    pub fn new() -> Self {
        StagedMutationQueue { entries: Vec::new() }
    }

    pub fn stage(&mut self, mutation: StagedMutation) {
        if let Some(existing) = self.entries.iter_mut().find(|m| m.document_id == mutation.document_id) {
            *existing = mutation;
        } else {
            self.entries.push(mutation);
        }
    }

    pub fn find(&self, document_id: &DocumentId) -> Option<&StagedMutation> {
        self.entries.iter().find(|m| &m.document_id == document_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagedMutation> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(key: &str) -> DocumentId {
        DocumentId::new("travel-sample", key.as_bytes().to_vec())
    }

    #[test]
    fn staging_twice_for_the_same_document_overwrites() {
        let mut queue = StagedMutationQueue::new();
        queue.stage(StagedMutation {
            document_id: doc("k1"),
            kind: StagedMutationType::Insert,
            staged_content: Some(serde_json::json!({"v": 1})),
            cas_before_staging: 0,
            original_content: None,
        });
        queue.stage(StagedMutation {
            document_id: doc("k1"),
            kind: StagedMutationType::Replace,
            staged_content: Some(serde_json::json!({"v": 2})),
            cas_before_staging: 7,
            original_content: Some(serde_json::json!({"v": 0})),
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.find(&doc("k1")).unwrap().kind, StagedMutationType::Replace);
    }

    #[test]
    fn distinct_documents_both_stay_queued() {
        let mut queue = StagedMutationQueue::new();
        queue.stage(StagedMutation {
            document_id: doc("k1"),
            kind: StagedMutationType::Insert,
            staged_content: None,
            cas_before_staging: 0,
            original_content: None,
        });
        queue.stage(StagedMutation {
            document_id: doc("k2"),
            kind: StagedMutationType::Remove,
            staged_content: None,
            cas_before_staging: 3,
            original_content: Some(serde_json::json!({"v": 1})),
        });
        assert_eq!(queue.len(), 2);
    }
}
