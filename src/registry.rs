//! Table registry and dependency ordering
//!
//! One topological sort over the live foreign-key graph yields every order the
//! engine needs: backup and insert walk it forward, delete walks it backwards
//! with identity-owned tables removed.

use crate::introspection::{ConstraintDescriptor, ConstraintKind};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::warn;

/// Tables the engine keeps for itself; never captured, exported or restored
pub const ENGINE_TABLES: &[&str] = &["backup_settings"];

pub fn is_engine_table(name: &str) -> bool {
    ENGINE_TABLES.contains(&name)
}

/// A table in dependency order
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub name: String,
    /// Longest chain of references below this table; referenced tables rank lower
    pub rank: usize,
    /// Keyed to the external identity store; never bulk-deleted
    pub identity_owned: bool,
}

/// Declared tables plus the identity-owned flags
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    declared: Vec<String>,
    identity_owned: HashSet<String>,
}

impl TableRegistry {
    pub fn new(declared: Vec<String>, identity_owned: impl IntoIterator<Item = String>) -> Self {
        Self {
            declared,
            identity_owned: identity_owned.into_iter().collect(),
        }
    }

    /// Declared tables; empty when the registry defers to discovery
    pub fn declared(&self) -> &[String] {
        &self.declared
    }

    pub fn is_identity_owned(&self, table: &str) -> bool {
        self.identity_owned.contains(table)
    }

    /// Order `tables` so every referenced table precedes its referencers.
    ///
    /// Only edges between tables of `schema` listed in `tables` count;
    /// self-references are ignored. Tables caught in a cycle are appended
    /// after the acyclic part in their given order.
    pub fn resolve(&self, schema: &str, tables: &[String], foreign_keys: &[ConstraintDescriptor]) -> DependencyOrder {
        let position: HashMap<&str, usize> = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();

        // parent -> children, child -> distinct parents
        let mut children: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        let mut parents: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for fk in foreign_keys.iter().filter(|c| c.kind == ConstraintKind::ForeignKey) {
            let Some(reference) = fk.references.as_ref().filter(|r| r.schema == schema) else {
                continue;
            };
            let (Some(&child), Some(&parent)) = (
                position.get(fk.table.as_str()),
                position.get(reference.table.as_str()),
            ) else {
                continue;
            };
            if child == parent {
                continue;
            }
            children.entry(parent).or_default().insert(child);
            parents.entry(child).or_default().insert(parent);
        }

        let mut pending: Vec<usize> = (0..tables.len())
            .map(|i| parents.get(&i).map_or(0, BTreeSet::len))
            .collect();
        let mut rank = vec![0usize; tables.len()];
        let mut placed = vec![false; tables.len()];

        // Kahn's algorithm, always taking the earliest ready table
        let mut ready: BTreeSet<usize> = (0..tables.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(tables.len());
        while let Some(next) = ready.pop_first() {
            placed[next] = true;
            order.push(next);
            for &child in children.get(&next).into_iter().flatten() {
                rank[child] = rank[child].max(rank[next] + 1);
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() < tables.len() {
            let cyclic_rank = order.iter().map(|&i| rank[i] + 1).max().unwrap_or(0);
            let stuck: Vec<usize> = (0..tables.len()).filter(|&i| !placed[i]).collect();
            warn!(
                "Foreign key cycle among {:?}; appending in declared order",
                stuck.iter().map(|&i| tables[i].as_str()).collect::<Vec<_>>()
            );
            for i in stuck {
                rank[i] = cyclic_rank;
                order.push(i);
            }
        }

        DependencyOrder {
            tables: order
                .into_iter()
                .map(|i| TableDescriptor {
                    name: tables[i].clone(),
                    rank: rank[i],
                    identity_owned: self.is_identity_owned(&tables[i]),
                })
                .collect(),
        }
    }
}

/// Tables sorted parent-before-child
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyOrder {
    tables: Vec<TableDescriptor>,
}

impl DependencyOrder {
    /// Creation, backup and insert order
    pub fn forward(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter()
    }

    /// Delete order: child before parent, identity-owned tables excluded
    pub fn deletable(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter().rev().filter(|t| !t.identity_owned)
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::ForeignReference;
    use pretty_assertions::assert_eq;

    fn fk(table: &str, references: &str) -> ConstraintDescriptor {
        ConstraintDescriptor {
            name: format!("{}_{}_fk", table, references),
            kind: ConstraintKind::ForeignKey,
            table: table.to_string(),
            columns: vec![format!("{}_id", references)],
            references: Some(ForeignReference {
                schema: "public".to_string(),
                table: references.to_string(),
                columns: vec!["id".to_string()],
            }),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parents_precede_children() {
        let registry = TableRegistry::new(Vec::new(), names(&["profiles"]));
        let tables = names(&["asset_assignments", "assets", "employees", "departments", "profiles"]);
        let fks = vec![
            fk("asset_assignments", "assets"),
            fk("asset_assignments", "employees"),
            fk("employees", "departments"),
            fk("employees", "profiles"),
        ];

        let order = registry.resolve("public", &tables, &fks);

        assert_eq!(
            order.names(),
            names(&["assets", "departments", "profiles", "employees", "asset_assignments"])
        );
        let ranks: Vec<usize> = order.forward().map(|t| t.rank).collect();
        assert_eq!(ranks, vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_delete_order_is_reverse_without_identity_owned() {
        let registry = TableRegistry::new(Vec::new(), names(&["profiles"]));
        let tables = names(&["profiles", "employees", "departments"]);
        let fks = vec![fk("employees", "departments"), fk("employees", "profiles")];

        let order = registry.resolve("public", &tables, &fks);
        let deletes: Vec<&str> = order.deletable().map(|t| t.name.as_str()).collect();

        assert_eq!(deletes, vec!["employees", "departments"]);
    }

    #[test]
    fn test_edges_outside_the_table_set_are_ignored() {
        let registry = TableRegistry::default();
        let tables = names(&["profiles"]);
        // profiles -> auth.users lives outside the captured schema
        let order = registry.resolve("public", &tables, &[fk("profiles", "users")]);

        assert_eq!(order.names(), names(&["profiles"]));
    }

    #[test]
    fn test_same_named_table_in_another_schema_is_not_a_parent() {
        let registry = TableRegistry::default();
        let tables = names(&["users", "profiles"]);
        let mut to_auth_users = fk("profiles", "users");
        if let Some(reference) = to_auth_users.references.as_mut() {
            reference.schema = "auth".to_string();
        }

        let order = registry.resolve("public", &tables, &[to_auth_users]);

        assert_eq!(order.names(), names(&["users", "profiles"]));
        assert!(order.forward().all(|t| t.rank == 0));
    }

    #[test]
    fn test_settings_table_belongs_to_the_engine() {
        assert!(is_engine_table("backup_settings"));
        assert!(!is_engine_table("assets"));
    }

    #[test]
    fn test_self_reference_does_not_block() {
        let registry = TableRegistry::default();
        let tables = names(&["employees"]);
        let order = registry.resolve("public", &tables, &[fk("employees", "employees")]);

        assert_eq!(order.len(), 1);
    }

    #[test]
    fn test_cycle_is_appended_after_acyclic_tables() {
        let registry = TableRegistry::default();
        let tables = names(&["a", "b", "c"]);
        let fks = vec![fk("a", "b"), fk("b", "a")];

        let order = registry.resolve("public", &tables, &fks);

        assert_eq!(order.names(), names(&["c", "a", "b"]));
        assert!(order.forward().skip(1).all(|t| t.rank == 1));
    }
}
