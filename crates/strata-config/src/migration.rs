//! Forward-only schema migrations for the remote config document
//!
//! Stored copies are decoded into an untyped value first, upgraded one
//! version at a time, and only then deserialized into
//! [`RemoteConfigDocument`]. Each applied step is appended to
//! `migrationHistory`. A document written by a newer release is rejected
//! rather than downgraded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;

use strata_common::{Error, Result};

use crate::document::{Migration, RemoteConfigDocument, DEFAULT_DNS_BASE, DEFAULT_DNS_PATTERN};

/// Schema version written by this release
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

const DOCUMENT_KIND: &str = "RemoteConfigDocument";

/// A decoded document and the versions it was migrated from
#[derive(Clone, Debug)]
pub struct Upgraded {
    /// The document at the current schema version
    pub document: RemoteConfigDocument,
    /// `fromVersion` of every migration applied during decoding
    pub applied: Vec<u32>,
}

impl Upgraded {
    /// True if decoding changed the schema version
    pub fn migrated(&self) -> bool {
        !self.applied.is_empty()
    }
}

trait SchemaMigration: Sync {
    fn from_version(&self) -> u32;
    fn description(&self) -> &'static str;
    fn apply(&self, document: &mut Map<String, Value>) -> Result<()>;
}

/// v1 → v2: per-cluster DNS settings, copied onto each node
struct AddDnsSettings;

impl SchemaMigration for AddDnsSettings {
    fn from_version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "add DNS settings to clusters and nodes"
    }

    fn apply(&self, document: &mut Map<String, Value>) -> Result<()> {
        let mut dns = BTreeMap::new();

        if let Some(Value::Object(clusters)) = document.get_mut("clusters") {
            for (reference, binding) in clusters.iter_mut() {
                let binding = binding.as_object_mut().ok_or_else(|| {
                    Error::validation_for_field(
                        format!("clusters.{reference}"),
                        "cluster binding must be a mapping",
                    )
                })?;
                let base = binding
                    .entry("dnsBase")
                    .or_insert_with(|| json!(DEFAULT_DNS_BASE))
                    .clone();
                let pattern = binding
                    .entry("dnsPattern")
                    .or_insert_with(|| json!(DEFAULT_DNS_PATTERN))
                    .clone();
                dns.insert(reference.clone(), (base, pattern));
            }
        }

        if let Some(Value::Array(nodes)) = document.get_mut("consensusNodes") {
            for (i, node) in nodes.iter_mut().enumerate() {
                let node = node.as_object_mut().ok_or_else(|| {
                    Error::validation_for_field(
                        format!("consensusNodes[{i}]"),
                        "consensus node must be a mapping",
                    )
                })?;
                let (base, pattern) = node
                    .get("clusterReference")
                    .and_then(Value::as_str)
                    .and_then(|r| dns.get(r).cloned())
                    .unwrap_or_else(|| (json!(DEFAULT_DNS_BASE), json!(DEFAULT_DNS_PATTERN)));
                node.entry("dnsBase").or_insert(base);
                node.entry("dnsPattern").or_insert(pattern);
            }
        }

        Ok(())
    }
}

/// v2 → v3: last-updated stamp and command history
struct AddAuditTrail;

impl SchemaMigration for AddAuditTrail {
    fn from_version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "add last-updated stamp and command history"
    }

    fn apply(&self, document: &mut Map<String, Value>) -> Result<()> {
        if let Some(Value::Object(metadata)) = document.get_mut("metadata") {
            if let Some(created_at) = metadata.get("createdAt").cloned() {
                metadata.entry("lastUpdatedAt").or_insert(created_at);
            }
            if let Some(created_by) = metadata.get("createdBy").cloned() {
                metadata.entry("lastUpdatedBy").or_insert(created_by);
            }
        }
        document
            .entry("commandHistory")
            .or_insert_with(|| Value::Array(Vec::new()));
        Ok(())
    }
}

const MIGRATIONS: &[&dyn SchemaMigration] = &[&AddDnsSettings, &AddAuditTrail];

/// Schema version recorded in an undecoded document
pub fn schema_version(document: &Value) -> Result<u32> {
    let version = document
        .get("metadata")
        .and_then(|m| m.get("schemaVersion"))
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            Error::validation_for_field("metadata.schemaVersion", "missing schema version")
        })?;
    u32::try_from(version).map_err(|_| {
        Error::validation_for_field(
            "metadata.schemaVersion",
            format!("schema version {version} is out of range"),
        )
    })
}

/// Decode a stored YAML document, migrating it to the current schema
pub fn decode(yaml: &str, migrated_by: &str, now: DateTime<Utc>) -> Result<Upgraded> {
    let value: Value = serde_yaml::from_str(yaml)
        .map_err(|e| Error::serialization_for_kind(DOCUMENT_KIND, e.to_string()))?;
    upgrade(value, migrated_by, now)
}

/// Migrate an undecoded document to the current schema
pub fn upgrade(document: Value, migrated_by: &str, now: DateTime<Utc>) -> Result<Upgraded> {
    let mut version = schema_version(&document)?;
    if version == 0 {
        return Err(Error::validation_for_field(
            "metadata.schemaVersion",
            "schema version must be at least 1",
        ));
    }
    if version > CURRENT_SCHEMA_VERSION {
        return Err(Error::validation_for_field(
            "metadata.schemaVersion",
            format!(
                "document schema version {version} is newer than supported version {CURRENT_SCHEMA_VERSION}; upgrade strata"
            ),
        ));
    }

    let Value::Object(mut map) = document else {
        return Err(Error::serialization_for_kind(
            DOCUMENT_KIND,
            "document must be a mapping",
        ));
    };

    let mut applied = Vec::new();
    for step in MIGRATIONS {
        if step.from_version() != version {
            continue;
        }
        step.apply(&mut map)?;

        let entry = serde_json::to_value(Migration {
            from_version: version,
            migrated_at: now,
            migrated_by: migrated_by.to_string(),
        })
        .map_err(|e| Error::serialization_for_kind(DOCUMENT_KIND, e.to_string()))?;
        match map
            .entry("migrationHistory")
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(history) => history.push(entry),
            _ => {
                return Err(Error::validation_for_field(
                    "migrationHistory",
                    "migration history must be a list",
                ))
            }
        }

        version += 1;
        if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
            metadata.insert("schemaVersion".to_string(), json!(version));
        }
        debug!(
            from_version = step.from_version(),
            migration = step.description(),
            "Applied remote config migration"
        );
        applied.push(step.from_version());
    }

    if version != CURRENT_SCHEMA_VERSION {
        return Err(Error::internal_with_context(
            "migration",
            format!("no migration path from schema version {version}"),
        ));
    }

    let document: RemoteConfigDocument = serde_json::from_value(Value::Object(map))
        .map_err(|e| Error::serialization_for_kind(DOCUMENT_KIND, e.to_string()))?;
    Ok(Upgraded { document, applied })
}
