//! Deployment Symbol Table
//!
//! Maps symbolic names to the resources they produced. A symbol is either an
//! `Object` (one resource, bound once) or an `Array` (one id appended per copy
//! iteration). The kind is fixed when the symbol is declared.
//!
//! Lookups are case-insensitive. `name[2]` addresses one element of an array
//! symbol.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExpandError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SymbolKind {
    Array,
    Object,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Array => write!(f, "array"),
            SymbolKind::Object => write!(f, "object"),
        }
    }
}

/// One symbolic name and what it is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentSymbol {
    Array { name: String, ids: Vec<String> },
    Object { name: String, id: Option<String> },
}

impl DeploymentSymbol {
    pub fn name(&self) -> &str {
        match self {
            DeploymentSymbol::Array { name, .. } | DeploymentSymbol::Object { name, .. } => name,
        }
    }

    pub fn kind(&self) -> SymbolKind {
        match self {
            DeploymentSymbol::Array { .. } => SymbolKind::Array,
            DeploymentSymbol::Object { .. } => SymbolKind::Object,
        }
    }

    /// Object symbols ignore `index`. Array symbols need one; an index past a
    /// non-empty binding is an error, an empty binding is simply not bound yet.
    pub fn get_id(&self, index: Option<usize>) -> Result<Option<&str>> {
        match self {
            DeploymentSymbol::Object { id, .. } => Ok(id.as_deref()),
            DeploymentSymbol::Array { name, ids } => match index {
                None => Ok(None),
                Some(_) if ids.is_empty() => Ok(None),
                Some(i) => ids.get(i).map(|s| Some(s.as_str())).ok_or_else(|| {
                    ExpandError::SymbolIndexOutOfRange {
                        name: name.clone(),
                        index: i,
                        len: ids.len(),
                    }
                }),
            },
        }
    }

    pub fn ids(&self) -> &[String] {
        match self {
            DeploymentSymbol::Array { ids, .. } => ids,
            DeploymentSymbol::Object { id, .. } => id.as_slice(),
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.ids().is_empty()
    }
}

/// Per-deployment symbol table
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<String, DeploymentSymbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    fn conflict(existing: &DeploymentSymbol, requested: SymbolKind) -> ExpandError {
        ExpandError::SymbolKindConflict {
            name: existing.name().to_string(),
            existing: existing.kind(),
            requested,
        }
    }

    /// Declare an iterated symbol. Re-declaring as an array is a no-op.
    pub fn declare_array(&mut self, name: &str) -> Result<()> {
        match self.symbols.get(&Self::key(name)) {
            Some(existing) if existing.kind() == SymbolKind::Array => Ok(()),
            Some(existing) => Err(Self::conflict(existing, SymbolKind::Array)),
            None => {
                self.symbols.insert(
                    Self::key(name),
                    DeploymentSymbol::Array {
                        name: name.to_string(),
                        ids: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Declare a single-resource symbol, optionally already bound
    pub fn declare_object(&mut self, name: &str, initial: Option<String>) -> Result<()> {
        match self.symbols.get(&Self::key(name)) {
            Some(existing) if existing.kind() == SymbolKind::Object => {
                if let Some(id) = initial {
                    self.configure(name, id)?;
                }
                Ok(())
            }
            Some(existing) => Err(Self::conflict(existing, SymbolKind::Object)),
            None => {
                self.symbols.insert(
                    Self::key(name),
                    DeploymentSymbol::Object {
                        name: name.to_string(),
                        id: initial,
                    },
                );
                Ok(())
            }
        }
    }

    /// Bind a resource: appended for arrays, set once for objects
    pub fn configure(&mut self, name: &str, resource_id: String) -> Result<()> {
        let symbol = self
            .symbols
            .get_mut(&Self::key(name))
            .ok_or_else(|| ExpandError::UnknownSymbol {
                name: name.to_string(),
            })?;
        match symbol {
            DeploymentSymbol::Array { ids, .. } => {
                ids.push(resource_id);
                Ok(())
            }
            DeploymentSymbol::Object { id: Some(bound), name } => {
                Err(ExpandError::SymbolAlreadyBound {
                    name: name.clone(),
                    id: bound.clone(),
                })
            }
            DeploymentSymbol::Object { id, .. } => {
                *id = Some(resource_id);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&DeploymentSymbol> {
        self.symbols.get(&Self::key(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(&Self::key(name))
    }

    /// Id bound to `name` (at `index` for arrays); `None` when not bound yet
    pub fn get_id(&self, name: &str, index: Option<usize>) -> Result<Option<String>> {
        match self.get(name) {
            Some(symbol) => Ok(symbol.get_id(index)?.map(str::to_string)),
            None => Ok(None),
        }
    }

    /// Every id bound to `name`, in binding order; empty when nothing is bound
    pub fn get_ids(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|s| s.ids().to_vec())
            .unwrap_or_default()
    }

    /// Resolve `name` or `name[i]`
    pub fn lookup(&self, reference: &str) -> Result<Option<String>> {
        match split_indexed(reference) {
            Some((name, index)) => self.get_id(name, Some(index)),
            None => self.get_id(reference, None),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// `name[3]` → (`name`, 3)
pub fn split_indexed(reference: &str) -> Option<(&str, usize)> {
    let open = reference.find('[')?;
    let inner = reference[open + 1..].strip_suffix(']')?;
    let index = inner.trim().parse().ok()?;
    Some((&reference[..open], index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_object_symbol_binds_once() {
        let mut table = SymbolTable::new();
        table.declare_object("storage", None).unwrap();
        assert_eq!(table.get_id("storage", None).unwrap(), None);

        table.configure("storage", "/id/sa".into()).unwrap();
        assert_eq!(table.get_id("STORAGE", Some(7)).unwrap(), Some("/id/sa".into()));

        let err = table.configure("storage", "/id/other".into()).unwrap_err();
        assert!(matches!(err, ExpandError::SymbolAlreadyBound { .. }));
        assert_eq!(table.get_id("storage", None).unwrap(), Some("/id/sa".into()));
    }

    #[test]
    fn test_array_symbol_appends_in_order() {
        let mut table = SymbolTable::new();
        table.declare_array("nics").unwrap();
        assert!(table.get_ids("nics").is_empty());
        assert_eq!(table.get_id("nics", Some(0)).unwrap(), None);

        for i in 0..3 {
            table.configure("nics", format!("/id/nic{}", i)).unwrap();
        }
        assert_eq!(table.get_ids("nics"), vec!["/id/nic0", "/id/nic1", "/id/nic2"]);
        assert_eq!(table.lookup("nics[1]").unwrap(), Some("/id/nic1".into()));
    }

    #[test]
    fn test_array_index_out_of_range_is_distinct() {
        let mut table = SymbolTable::new();
        table.declare_array("nics").unwrap();
        table.configure("nics", "/id/nic0".into()).unwrap();
        let err = table.get_id("nics", Some(5)).unwrap_err();
        assert_eq!(
            err,
            ExpandError::SymbolIndexOutOfRange {
                name: "nics".into(),
                index: 5,
                len: 1,
            }
        );
    }

    #[test]
    fn test_kind_conflict() {
        let mut table = SymbolTable::new();
        table.declare_array("x").unwrap();
        let err = table.declare_object("X", None).unwrap_err();
        assert_eq!(
            err,
            ExpandError::SymbolKindConflict {
                name: "x".into(),
                existing: SymbolKind::Array,
                requested: SymbolKind::Object,
            }
        );

        table.declare_object("y", Some("/id/y".into())).unwrap();
        assert!(table.declare_array("y").is_err());
    }

    #[test]
    fn test_get_ids_unknown_is_empty() {
        let table = SymbolTable::new();
        assert!(table.get_ids("nothing").is_empty());
        assert_eq!(table.lookup("nothing").unwrap(), None);
    }

    #[test]
    fn test_split_indexed() {
        assert_eq!(split_indexed("vms[2]"), Some(("vms", 2)));
        assert_eq!(split_indexed("vms"), None);
        assert_eq!(split_indexed("vms[x]"), None);
    }
}
