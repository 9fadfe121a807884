//! Nested, ordered configuration documents with deep-merge semantics.
//!
//! A [`ConfigTree`] is the working configuration a board client owns and
//! transmits. It is backed by a YAML mapping so key order survives a
//! load/dump round trip, which keeps the payloads sent to the boards stable.
//!
//! Every mapping value is a *nested* node; everything else (numbers, strings,
//! booleans, lists) is a *scalar* node. [`merge`] only combines nodes of the
//! same kind:
//!
//! ```text
//! dest:   { daq: { NEvents: 100, l1a_enables: { random_l1a: 0 } } }
//! update: { daq: { NEvents: 500 } }
//! result: { daq: { NEvents: 500, l1a_enables: { random_l1a: 0 } } }
//! ```

use crate::error::{AppResult, DaqError};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::path::Path;

/// Insertion-ordered configuration document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: Mapping,
}

impl ConfigTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing YAML mapping.
    pub fn from_mapping(root: Mapping) -> Self {
        Self { root }
    }

    /// Parse a YAML document. An empty document yields an empty tree; any
    /// other non-mapping root is rejected.
    pub fn from_yaml_str(document: &str) -> AppResult<Self> {
        match serde_yaml::from_str::<Value>(document)? {
            Value::Null => Ok(Self::new()),
            Value::Mapping(root) => Ok(Self { root }),
            other => Err(DaqError::Configuration(format!(
                "configuration document root must be a mapping, found {}",
                kind_of(&other)
            ))),
        }
    }

    /// Load a YAML document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Serialize the whole tree as a YAML document.
    pub fn to_yaml(&self) -> AppResult<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }

    /// Borrow the underlying mapping.
    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// True when the tree has no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up a value by dotted path (`"daq.l1a_enables.random_l1a"`).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.as_mapping()?.get(part)?;
        }
        Some(current)
    }

    /// Mutable lookup by dotted path.
    pub fn get_path_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get_mut(parts.next()?)?;
        for part in parts {
            current = current.as_mapping_mut()?.get_mut(part)?;
        }
        Some(current)
    }

    /// Set a scalar (or subtree) at a dotted path, creating intermediate
    /// mappings as needed. Fails with `StructureMismatch` when an
    /// intermediate key already holds a scalar.
    pub fn set_path(&mut self, path: &str, value: impl Into<Value>) -> AppResult<()> {
        let keys: Vec<&str> = path.split('.').collect();
        let fragment = make_nested(&keys, value);
        self.merge(&fragment).map(|_| ())
    }

    /// Deep-merge `update` into this tree. See [`merge`].
    pub fn merge(&mut self, update: &ConfigTree) -> AppResult<&mut Self> {
        merge(self, update)
    }
}

impl fmt::Display for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_yaml::to_string(&self.root) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{:?}", self.root),
        }
    }
}

impl From<Mapping> for ConfigTree {
    fn from(root: Mapping) -> Self {
        Self::from_mapping(root)
    }
}

/// Deep-merge `update` into `dest` and return `dest`.
///
/// For every key of `update`: a missing key is inserted, two nested nodes
/// are merged recursively, two scalars are overwritten (no coercion between
/// scalar kinds), and a nested/scalar pair fails with
/// [`DaqError::StructureMismatch`] naming the dotted path.
///
/// The whole update is checked before anything is written, so a failed merge
/// leaves `dest` exactly as it was.
pub fn merge<'a>(dest: &'a mut ConfigTree, update: &ConfigTree) -> AppResult<&'a mut ConfigTree> {
    check_compatible(&dest.root, &update.root, "")?;
    apply(&mut dest.root, &update.root);
    Ok(dest)
}

/// Build a single-branch tree: `make_nested(&["a", "b", "c"], 5)` is
/// `{a: {b: {c: 5}}}`.
///
/// With no keys, a mapping value becomes the tree itself and any other value
/// yields an empty tree.
pub fn make_nested<K: AsRef<str>>(keys: &[K], value: impl Into<Value>) -> ConfigTree {
    let mut node = value.into();
    for key in keys.iter().rev() {
        let mut level = Mapping::new();
        level.insert(Value::String(key.as_ref().to_owned()), node);
        node = Value::Mapping(level);
    }
    match node {
        Value::Mapping(root) => ConfigTree { root },
        _ => ConfigTree::new(),
    }
}

fn check_compatible(dest: &Mapping, update: &Mapping, prefix: &str) -> AppResult<()> {
    for (key, incoming) in update {
        let Some(existing) = dest.get(key) else {
            continue;
        };
        let path = join_path(prefix, key);
        match (existing, incoming) {
            (Value::Mapping(existing), Value::Mapping(incoming)) => {
                check_compatible(existing, incoming, &path)?
            }
            (Value::Mapping(_), _) | (_, Value::Mapping(_)) => {
                return Err(DaqError::StructureMismatch { path })
            }
            _ => {}
        }
    }
    Ok(())
}

fn apply(dest: &mut Mapping, update: &Mapping) {
    for (key, incoming) in update {
        if let (Some(Value::Mapping(existing)), Value::Mapping(incoming)) =
            (dest.get_mut(key), incoming)
        {
            apply(existing, incoming);
            continue;
        }
        // Replacing an existing key keeps its position.
        dest.insert(key.clone(), incoming.clone());
    }
}

fn join_path(prefix: &str, key: &Value) -> String {
    let label = match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{:?}", other),
    };
    if prefix.is_empty() {
        label
    } else {
        format!("{prefix}.{label}")
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(doc: &str) -> ConfigTree {
        ConfigTree::from_yaml_str(doc).unwrap()
    }

    #[test]
    fn make_nested_builds_single_branch() {
        let nested = make_nested(&["a", "b", "c"], 5);
        assert_eq!(nested, tree("a:\n  b:\n    c: 5\n"));
        assert_eq!(nested.get_path("a.b.c").and_then(Value::as_u64), Some(5));
    }

    #[test]
    fn merge_inserts_recurses_and_overwrites() {
        let mut dest = tree(
            "daq:\n  NEvents: 100\n  l1a_enables:\n    random_l1a: 0\nclient:\n  run_type: default\n",
        );
        let update = tree("daq:\n  NEvents: 500\n  active_menu: randomL1A\n");

        merge(&mut dest, &update).unwrap();

        assert_eq!(dest.get_path("daq.NEvents").and_then(Value::as_u64), Some(500));
        assert_eq!(
            dest.get_path("daq.active_menu").and_then(Value::as_str),
            Some("randomL1A")
        );
        assert_eq!(
            dest.get_path("daq.l1a_enables.random_l1a").and_then(Value::as_u64),
            Some(0)
        );
        assert_eq!(
            dest.get_path("client.run_type").and_then(Value::as_str),
            Some("default")
        );
    }

    #[test]
    fn scalar_overwrite_does_not_coerce() {
        let mut dest = tree("a: 1\n");
        merge(&mut dest, &tree("a: one\n")).unwrap();
        assert_eq!(dest.get_path("a").and_then(Value::as_str), Some("one"));
    }

    #[test]
    fn sequences_are_scalars() {
        let mut dest = tree("gens:\n  - name: A\n  - name: B\n");
        merge(&mut dest, &tree("gens:\n  - name: C\n")).unwrap();
        let gens = dest.get_path("gens").and_then(Value::as_sequence).unwrap();
        assert_eq!(gens.len(), 1);
    }

    #[test]
    fn mismatch_reports_dotted_path_and_leaves_dest_untouched() {
        let original = tree("a:\n  x: 1\nb:\n  c:\n    d: 2\n");
        let mut dest = original.clone();
        // "a.x" would be written first if the merge were applied eagerly.
        let update = tree("a:\n  x: 9\nb:\n  c: 3\n");

        let err = merge(&mut dest, &update).unwrap_err();
        match err {
            DaqError::StructureMismatch { path } => assert_eq!(path, "b.c"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(dest, original);
    }

    #[test]
    fn scalar_replaced_by_tree_is_a_mismatch() {
        let mut dest = tree("a: 1\n");
        assert!(matches!(
            merge(&mut dest, &tree("a:\n  b: 2\n")),
            Err(DaqError::StructureMismatch { .. })
        ));
    }

    #[test]
    fn repeated_merges_compose() {
        let base = tree("a:\n  x: 1\n  y: 2\nkeep: true\n");
        let first = tree("a:\n  x: 10\n  z: 3\n");
        let second = tree("a:\n  y: 20\nextra: 1\n");

        let mut sequential = base.clone();
        merge(&mut sequential, &first).unwrap();
        merge(&mut sequential, &second).unwrap();

        let mut combined = first.clone();
        merge(&mut combined, &second).unwrap();
        let mut at_once = base.clone();
        merge(&mut at_once, &combined).unwrap();

        assert_eq!(sequential, at_once);
        assert_eq!(sequential.get_path("keep").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn merge_is_idempotent() {
        let update = tree("a:\n  b: 1\n");
        let mut once = tree("a:\n  c: 2\n");
        merge(&mut once, &update).unwrap();
        let mut twice = once.clone();
        merge(&mut twice, &update).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn set_path_creates_intermediate_levels() {
        let mut cfg = ConfigTree::new();
        cfg.set_path("client.outputDirectory", "data").unwrap();
        cfg.set_path("client.run_type", "run").unwrap();
        assert_eq!(
            cfg.get_path("client.outputDirectory").and_then(Value::as_str),
            Some("data")
        );
        assert_eq!(cfg.len(), 1);
    }

    #[test]
    fn yaml_round_trip_preserves_order() {
        let cfg = tree("zeta: 1\nalpha: 2\nmid:\n  b: 1\n  a: 2\n");
        let again = ConfigTree::from_yaml_str(&cfg.to_yaml().unwrap()).unwrap();
        assert_eq!(cfg, again);
        let keys: Vec<_> = again
            .as_mapping()
            .keys()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn non_mapping_root_is_rejected() {
        assert!(ConfigTree::from_yaml_str("- 1\n- 2\n").is_err());
        assert!(ConfigTree::from_yaml_str("").unwrap().is_empty());
    }
}
