//! Comparison request, per-student payload and aggregate report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::provider::ProviderResponse;
use crate::error::FanoutError;

/// Resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerToken(String);

impl CallerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Instructor reference plus the student submissions to compare against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRequest {
    pub instructor: serde_json::Value,
    pub students: BTreeMap<String, serde_json::Value>,
}

impl ComparisonRequest {
    pub fn validate(&self) -> Result<(), FanoutError> {
        if self.students.is_empty() {
            return Err(FanoutError::InvalidRequest(
                "students must be a non-empty mapping".to_string(),
            ));
        }
        if let Some(id) = self.students.keys().find(|id| id.trim().is_empty()) {
            return Err(FanoutError::InvalidRequest(format!(
                "student id {id:?} is blank"
            )));
        }
        Ok(())
    }

    /// Payload for one student.
    pub fn payload_for(&self, student_id: &str) -> Option<StudentPayload> {
        self.students.get(student_id).map(|student| StudentPayload {
            instructor: self.instructor.clone(),
            student_id: student_id.to_string(),
            student: student.clone(),
        })
    }
}

/// What a provider receives for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentPayload {
    pub instructor: serde_json::Value,
    pub student_id: String,
    pub student: serde_json::Value,
}

/// student id -> `provider/config` key -> response. Successful calls only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComparisonReport(BTreeMap<String, BTreeMap<String, ProviderResponse>>);

impl ComparisonReport {
    /// Report with an empty entry per student.
    pub fn for_students<'a>(students: impl IntoIterator<Item = &'a String>) -> Self {
        Self(
            students
                .into_iter()
                .map(|s| (s.clone(), BTreeMap::new()))
                .collect(),
        )
    }

    pub fn insert(&mut self, student_id: &str, entry: &str, response: ProviderResponse) {
        self.0
            .entry(student_id.to_string())
            .or_default()
            .insert(entry.to_string(), response);
    }

    pub fn get(&self, student_id: &str, entry: &str) -> Option<&ProviderResponse> {
        self.0.get(student_id)?.get(entry)
    }

    pub fn student(&self, student_id: &str) -> Option<&BTreeMap<String, ProviderResponse>> {
        self.0.get(student_id)
    }

    /// Number of (student, provider) responses.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
