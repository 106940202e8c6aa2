use std::fmt;

use crate::error::{Error, Result};

/// A fully qualified collection name: database plus collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Namespace {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `"db.collection"`. The collection part may itself contain dots.
    pub fn parse(ns: &str) -> Result<Namespace> {
        let (db, coll) = ns
            .split_once('.')
            .ok_or_else(|| Error::Configuration(format!("invalid namespace {:?}", ns)))?;
        if db.is_empty() || coll.is_empty() {
            return Err(Error::Configuration(format!("invalid namespace {:?}", ns)));
        }
        Ok(Namespace::new(db, coll))
    }

    /// The `$cmd` pseudo-collection used for legacy command queries.
    pub fn command(db: &str) -> String {
        format!("{}.$cmd", db)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ns = Namespace::parse("app.users").unwrap();
        assert_eq!(ns, Namespace::new("app", "users"));
        assert_eq!(ns.to_string(), "app.users");
    }

    #[test]
    fn test_collection_part_keeps_dots() {
        let ns = Namespace::parse("app.system.indexes").unwrap();
        assert_eq!(ns.db, "app");
        assert_eq!(ns.coll, "system.indexes");
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(Namespace::parse("plain").is_err());
        assert!(Namespace::parse(".users").is_err());
        assert!(Namespace::parse("app.").is_err());
    }

    #[test]
    fn test_command_namespace() {
        assert_eq!(Namespace::command("admin"), "admin.$cmd");
    }
}
