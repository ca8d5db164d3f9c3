//! Namespace exclusion and label selection.

use std::str::FromStr;

use crate::error::ForensicsError;
use crate::sources::ContainerRecord;

/// Kubernetes records a pod's namespace as a label on its containers.
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

/// A conjunction of exact `key=value` clauses. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    clauses: Vec<(String, String)>,
}

impl LabelFilter {
    pub fn parse(expression: &str) -> Result<Self, ForensicsError> {
        let mut clauses = Vec::new();
        for clause in expression.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let (key, value) = clause
                .split_once('=')
                .ok_or_else(|| ForensicsError::InvalidFilter(clause.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ForensicsError::InvalidFilter(clause.to_string()));
            }
            clauses.push((key.to_string(), value.trim().to_string()));
        }
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, record: &ContainerRecord) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| record.labels().get(key) == Some(value))
    }
}

impl FromStr for LabelFilter {
    type Err = ForensicsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// True when the record's namespace, or its pod namespace label, is excluded.
pub fn namespace_excluded(record: &ContainerRecord, excluded: &[String]) -> bool {
    let pod_namespace = record.labels().get(POD_NAMESPACE_LABEL);
    excluded
        .iter()
        .any(|ns| ns == record.namespace() || pod_namespace == Some(ns))
}

/// Namespace check first, then the label expression.
pub fn matches(record: &ContainerRecord, labels: &LabelFilter, excluded: &[String]) -> bool {
    !namespace_excluded(record, excluded) && labels.matches(record)
}
