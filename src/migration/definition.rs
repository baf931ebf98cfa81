//! `MigrationDefinition` - one versioned, directional schema change

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::checksum::calculate_checksum;

/// Metadata key under which the forward-script checksum is stored
pub const CHECKSUM_KEY: &str = "checksum";

/// Monotonically comparable migration version (timestamp: `YYYYMMDDHHMMSS`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub i64);

impl Version {
    /// Version reported when nothing has been applied
    pub const ZERO: Version = Version(0);

    /// Derive a version from a point in time
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        // Format is all digits, so the parse cannot fail for years 0..=9999
        let stamp = at.format("%Y%m%d%H%M%S").to_string();
        Version(stamp.parse().unwrap_or_default())
    }

    /// Next version after this one
    #[must_use]
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(v: i64) -> Self {
        Version(v)
    }
}

/// A named, versioned schema change with forward and reverse scripts
///
/// Definitions are never deleted; they are the append-only ledger of schema
/// history. Only apply and rollback flip `applied` / `applied_at` / `applied_by`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    /// Unique identifier (`<version>_<name>` for authored migrations)
    pub id: String,
    /// Ordering token
    pub version: Version,
    /// Human-readable name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Forward (apply) script
    pub up_script: String,
    /// Reverse (rollback) script; empty means irreversible
    pub down_script: String,
    /// Ids of migrations that must be applied first
    pub dependencies: BTreeSet<String>,
    /// Whether the migration is currently applied
    pub applied: bool,
    /// When the migration was last applied
    pub applied_at: Option<DateTime<Utc>>,
    /// Who applied it
    pub applied_by: Option<String>,
    /// Free-form key/value metadata
    pub metadata: BTreeMap<String, String>,
    /// When the definition was authored
    pub created_at: DateTime<Utc>,
}

impl MigrationDefinition {
    /// Create a pending definition whose id is `<version>_<name>`
    pub fn new(version: impl Into<Version>, name: impl Into<String>) -> Self {
        let version = version.into();
        let name = name.into();
        Self {
            id: format!("{version}_{}", slugify(&name)),
            version,
            name,
            description: String::new(),
            up_script: String::new(),
            down_script: String::new(),
            dependencies: BTreeSet::new(),
            applied: false,
            applied_at: None,
            applied_by: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Override the generated id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the forward script (also refreshes the stored checksum)
    #[must_use]
    pub fn with_up(mut self, script: impl Into<String>) -> Self {
        self.up_script = script.into();
        self.metadata
            .insert(CHECKSUM_KEY.to_string(), calculate_checksum(&self.up_script));
        self
    }

    #[must_use]
    pub fn with_down(mut self, script: impl Into<String>) -> Self {
        self.down_script = script.into();
        self
    }

    /// Add a dependency on another migration id
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether a reverse script exists
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        !self.down_script.trim().is_empty()
    }

    /// Checksum recorded in metadata, if any
    #[must_use]
    pub fn stored_checksum(&self) -> Option<&str> {
        self.metadata.get(CHECKSUM_KEY).map(String::as_str)
    }

    /// Checksum of the current forward script
    #[must_use]
    pub fn current_checksum(&self) -> String {
        calculate_checksum(&self.up_script)
    }

    pub(crate) fn mark_applied(&mut self, at: DateTime<Utc>, by: &str) {
        self.applied = true;
        self.applied_at = Some(at);
        self.applied_by = Some(by.to_string());
    }

    pub(crate) fn mark_reverted(&mut self) {
        self.applied = false;
        self.applied_at = None;
        self.applied_by = None;
    }
}

/// Lowercase snake_case form of a migration name, safe for ids
pub(crate) fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_version_from_datetime() {
        let at = Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 5).unwrap();
        assert_eq!(Version::from_datetime(at), Version(20_240_120_120_005));
    }

    #[test]
    fn test_new_definition_derives_id_from_version_and_name() {
        let def = MigrationDefinition::new(20_240_120_120_000, "Create Users table!");
        assert_eq!(def.id, "20240120120000_create_users_table");
        assert!(!def.applied);
        assert!(!def.is_reversible());
    }

    #[test]
    fn test_with_up_records_checksum() {
        let def = MigrationDefinition::new(1, "a").with_up("CREATE TABLE a (id INT)");
        assert_eq!(def.stored_checksum(), Some(def.current_checksum().as_str()));
    }

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("  add -- index on  email "), "add_index_on_email");
        assert_eq!(slugify("v2"), "v2");
    }
}
