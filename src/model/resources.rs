//! Resource requests and their validation.
//!
//! Resources are kept as strings exactly as operators wrote them. Equality is
//! numeric for the well-known fields so that `"1"` and `"1.0"` cpus never
//! show up as a modification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{Result, ValidationError};

/// Resource name for CPU shares.
pub const CPUS: &str = "cpus";

/// Resource name for memory in MB.
pub const MEMORY: &str = "memory";

/// Resource name for the number of ports.
pub const PORTS: &str = "ports";

/// Default CPU shares when none are given.
pub const DEFAULT_CPUS: f64 = 0.1;

/// Default memory in MB when none is given.
pub const DEFAULT_MEMORY: f64 = 100.0;

/// Default port count when none is given.
pub const DEFAULT_PORTS: u32 = 1;

/// Absolute tolerance for floating point resource comparison.
const FLOAT_TOLERANCE: f64 = 0.001;

/// Required resource fields and their defaults.
const REQUIRED: &[(&str, &str)] = &[(CPUS, "0.1"), (MEMORY, "100"), (PORTS, "1")];

/// A mapping of resource name to value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, String>);

/// A detected defect in a resource set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flaw {
    /// A required field is absent. Repairing inserts the default.
    MissingResource {
        /// Where the flaw was found.
        context: String,
        /// Missing field name.
        field: String,
        /// Value inserted on repair.
        default: String,
    },
    /// A field is present but does not parse. This cannot be repaired.
    MalformedResource {
        /// Where the flaw was found.
        context: String,
        /// Field name.
        field: String,
        /// The unparseable value.
        value: String,
    },
}

impl Resources {
    /// Creates an empty resource set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Creates a resource set holding the default for every required field.
    #[must_use]
    pub fn defaults() -> Self {
        REQUIRED.iter().map(|(name, value)| (*name, *value)).collect()
    }

    /// Sets a resource value, returning self for chaining.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets a resource value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the raw value of a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of resource entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no resources are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over resources in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// CPU shares, falling back to the default when absent or malformed.
    #[must_use]
    pub fn cpus(&self) -> f64 {
        self.parse_or(CPUS, DEFAULT_CPUS)
    }

    /// Memory in MB, falling back to the default when absent or malformed.
    #[must_use]
    pub fn memory(&self) -> f64 {
        self.parse_or(MEMORY, DEFAULT_MEMORY)
    }

    /// Number of ports, falling back to the default when absent or malformed.
    #[must_use]
    pub fn ports(&self) -> u32 {
        self.parse_or(PORTS, DEFAULT_PORTS)
    }

    fn parse_or<T>(&self, name: &str, default: T) -> T
    where
        T: std::str::FromStr + fmt::Display + Copy,
    {
        match self.0.get(name) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Could not parse value {raw:?} for {name}, using default: {default}");
                default
            }),
            None => {
                debug!("Using default value for {name}: {default}");
                default
            }
        }
    }

    /// Checks that each required resource is set and parses.
    #[must_use]
    pub fn validate(&self, context: &str) -> Vec<Flaw> {
        let mut flaws = Vec::new();

        for (field, default) in REQUIRED {
            match self.0.get(*field) {
                None => flaws.push(Flaw::MissingResource {
                    context: context.to_string(),
                    field: (*field).to_string(),
                    default: (*default).to_string(),
                }),
                Some(value) if !Self::parses(field, value) => {
                    flaws.push(Flaw::MalformedResource {
                        context: context.to_string(),
                        field: (*field).to_string(),
                        value: value.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        flaws
    }

    fn parses(field: &str, value: &str) -> bool {
        let value = value.trim();
        if field == PORTS {
            value.parse::<u32>().is_ok()
        } else {
            value.parse::<f64>().is_ok_and(f64::is_finite)
        }
    }
}

/// Compares `cpus` and `memory` within a small tolerance, `ports` exactly and
/// every other key as a string.
///
/// Malformed values of the well-known fields compare as their default, so
/// `cpus: "lots"` equals `cpus: "abc"`. Validation rejects such values before
/// they reach desired state.
impl PartialEq for Resources {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            debug!("Resource lengths differ");
            return false;
        }

        if self.ports() != other.ports() {
            debug!("Ports differ");
            return false;
        }

        if (self.cpus() - other.cpus()).abs() > FLOAT_TOLERANCE {
            debug!("Cpus differ");
            return false;
        }

        if (self.memory() - other.memory()).abs() > FLOAT_TOLERANCE {
            debug!("Memory differs");
            return false;
        }

        self.0
            .iter()
            .filter(|(name, _)| !matches!(name.as_str(), CPUS | MEMORY | PORTS))
            .all(|(name, value)| other.0.get(name) == Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Resources {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Flaw {
    /// Returns true if [`Flaw::repair`] can fix this flaw.
    #[must_use]
    pub const fn is_repairable(&self) -> bool {
        matches!(self, Self::MissingResource { .. })
    }

    /// Repairs the flaw in the given resource set.
    ///
    /// # Errors
    ///
    /// Returns a validation error for flaws that cannot be repaired.
    pub fn repair(&self, resources: &mut Resources) -> Result<()> {
        match self {
            Self::MissingResource { field, default, .. } => {
                resources.insert(field.clone(), default.clone());
                Ok(())
            }
            Self::MalformedResource {
                context,
                field,
                value,
            } => Err(ValidationError::MalformedResource {
                field: field.clone(),
                value: value.clone(),
                context: context.clone(),
            }
            .into()),
        }
    }
}

impl fmt::Display for Flaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingResource { context, field, .. } => {
                write!(f, "Missing resource field {field:?} for {context}")
            }
            Self::MalformedResource {
                context,
                field,
                value,
            } => write!(f, "Malformed resource field {field:?}={value:?} for {context}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cpus: &str, memory: &str, ports: &str) -> Resources {
        Resources::new()
            .with(CPUS, cpus)
            .with(MEMORY, memory)
            .with(PORTS, ports)
    }

    #[test]
    fn test_equality_tolerates_float_formatting() {
        assert_eq!(resources("1", "100", "1"), resources("1.0", "100", "1"));
        assert_eq!(resources("0.5", "256", "2"), resources("0.5000", "256.0", "2"));
    }

    #[test]
    fn test_ports_compare_exactly() {
        assert_ne!(resources("1", "100", "1"), resources("1", "100", "2"));
    }

    #[test]
    fn test_small_float_drift_is_equal_large_is_not() {
        assert_eq!(resources("1", "100", "1"), resources("1.0005", "100", "1"));
        assert_ne!(resources("1", "100", "1"), resources("1.01", "100", "1"));
    }

    #[test]
    fn test_length_mismatch_is_unequal() {
        let extra = resources("1", "100", "1").with("disk", "10");
        assert_ne!(resources("1", "100", "1"), extra);
    }

    #[test]
    fn test_extra_keys_compare_as_strings() {
        let a = resources("1", "100", "1").with("gpus", "1");
        let b = resources("1", "100", "1").with("gpus", "2");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_accessors_fall_back_to_defaults() {
        let empty = Resources::new();
        assert!((empty.cpus() - DEFAULT_CPUS).abs() < f64::EPSILON);
        assert!((empty.memory() - DEFAULT_MEMORY).abs() < f64::EPSILON);
        assert_eq!(empty.ports(), DEFAULT_PORTS);

        let garbage = resources("lots", "100", "x");
        assert!((garbage.cpus() - DEFAULT_CPUS).abs() < f64::EPSILON);
        assert_eq!(garbage.ports(), DEFAULT_PORTS);
    }

    #[test]
    fn test_malformed_values_compare_as_default() {
        let lots = resources("lots", "100", "1");
        let abc = resources("abc", "100", "1");
        assert_eq!(lots, abc);
        assert_eq!(lots, resources("0.1", "100", "1"));
        assert!(!lots.validate("test").is_empty());
    }

    #[test]
    fn test_defaults_are_valid() {
        let defaults = Resources::defaults();
        assert_eq!(defaults.len(), 3);
        assert!(defaults.validate("east").is_empty());
    }

    #[test]
    fn test_missing_fields_are_repaired_with_defaults() {
        let mut res = Resources::new().with(CPUS, "2");
        let flaws = res.validate("east:github.com/acme/web");
        assert_eq!(flaws.len(), 2);
        assert!(flaws.iter().all(Flaw::is_repairable));

        for flaw in &flaws {
            flaw.repair(&mut res).expect("repair should succeed");
        }
        assert_eq!(res.get(MEMORY), Some("100"));
        assert_eq!(res.get(PORTS), Some("1"));
        assert!(res.validate("east").is_empty());
    }

    #[test]
    fn test_malformed_field_is_not_repairable() {
        let mut res = resources("1", "a lot", "1");
        let flaws = res.validate("east");
        assert_eq!(flaws.len(), 1);
        assert!(!flaws[0].is_repairable());
        assert!(flaws[0].repair(&mut res).is_err());
        assert_eq!(res.get(MEMORY), Some("a lot"));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let json = serde_json::to_string(&resources("1", "100", "1")).expect("serialize");
        assert_eq!(json, r#"{"cpus":"1","memory":"100","ports":"1"}"#);
    }
}
