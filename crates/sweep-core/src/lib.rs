//! Core domain model for the archived-repository target sweeper.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sweep-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("display name {0:?} is not of the form owner/repo")]
    Malformed(String),
}

/// `owner/repo` identity used to correlate a scan target with a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub owner: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parses a display name that must consist of exactly two non-empty `/` segments.
    pub fn parse(display_name: &str) -> Result<Self, NameError> {
        let mut segments = display_name.split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
                Ok(Self::new(owner, name))
            }
            _ => Err(NameError::Malformed(display_name.to_string())),
        }
    }
}

impl FromStr for QualifiedName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A record in the scanning platform representing one monitored repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub display_name: String,
    pub scan_org_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Target {
    pub fn qualified_name(&self) -> Result<QualifiedName, NameError> {
        QualifiedName::parse(&self.display_name)
    }
}

/// Snapshot of a repository on the hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub owner: String,
    pub name: String,
    pub archived: bool,
}

impl Repo {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(self.owner.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgMappingEntry {
    pub external_org_name: String,
    pub scan_org_id: String,
    pub integration_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("organization {0:?} is mapped more than once")]
    Duplicate(String),
    #[error("organization name must not be empty")]
    EmptyName,
    #[error("organization {0:?} has an empty scan org id")]
    EmptyScanOrgId(String),
}

/// Static table translating hosting-platform organization names into scan identifiers.
///
/// Entries keep their load order. Names are unique; there is no way to mutate an
/// entry once the table has been built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgMapping {
    entries: Vec<OrgMappingEntry>,
}

impl OrgMapping {
    pub fn from_entries(
        entries: impl IntoIterator<Item = OrgMappingEntry>,
    ) -> Result<Self, MappingError> {
        let mut mapping = Self::default();
        for entry in entries {
            mapping.push(entry)?;
        }
        Ok(mapping)
    }

    fn push(&mut self, entry: OrgMappingEntry) -> Result<(), MappingError> {
        if entry.external_org_name.is_empty() {
            return Err(MappingError::EmptyName);
        }
        if entry.scan_org_id.is_empty() {
            return Err(MappingError::EmptyScanOrgId(entry.external_org_name));
        }
        if self.get(&entry.external_org_name).is_some() {
            return Err(MappingError::Duplicate(entry.external_org_name));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn get(&self, external_org_name: &str) -> Option<&OrgMappingEntry> {
        self.entries
            .iter()
            .find(|e| e.external_org_name == external_org_name)
    }

    pub fn entries(&self) -> &[OrgMappingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct MappingFields {
    #[serde(alias = "scan_org_id")]
    org_id: String,
    #[serde(default)]
    integration_id: Option<String>,
}

impl<'de> Deserialize<'de> for OrgMapping {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = OrgMapping;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of organization names to {org_id, integration_id}")
            }

            fn visit_map<A>(self, mut access: A) -> Result<OrgMapping, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut mapping = OrgMapping::default();
                while let Some((name, fields)) = access.next_entry::<String, MappingFields>()? {
                    mapping
                        .push(OrgMappingEntry {
                            external_org_name: name,
                            scan_org_id: fields.org_id,
                            integration_id: fields.integration_id,
                        })
                        .map_err(de::Error::custom)?;
                }
                Ok(mapping)
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

/// Why a target could not be matched to a definitive repository state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedReason {
    MalformedName,
    MissingFromState,
}

/// Result of a single remote deletion, as classified by the action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RemovalOutcome {
    Removed,
    AlreadyAbsent,
    Failed {
        status: Option<u16>,
        message: String,
    },
}

/// Per-target decision recorded for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum Decision {
    Removed,
    AlreadyAbsent,
    WouldRemove,
    SkippedActive,
    SkippedUnresolved { reason: UnresolvedReason },
    Failed { message: String },
}

impl From<RemovalOutcome> for Decision {
    fn from(outcome: RemovalOutcome) -> Self {
        match outcome {
            RemovalOutcome::Removed => Decision::Removed,
            RemovalOutcome::AlreadyAbsent => Decision::AlreadyAbsent,
            RemovalOutcome::Failed { status, message } => Decision::Failed {
                message: match status {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub target_id: String,
    /// The parsed `owner/repo` name, or the raw display name when it did not parse.
    pub qualified_name: String,
    pub decision: Decision,
}
