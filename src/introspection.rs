//! Schema Introspection Module
//!
//! Reads catalog metadata for a set of tables: enum types, columns, primary
//! keys, unique constraints, foreign keys, indexes, functions, triggers and
//! row-level-security policies. Each artifact class is fetched on its own so
//! one failing catalog query only drops that class.

use crate::db::queries;
use crate::error::AppError;
use crate::registry::ENGINE_TABLES;
use crate::sql::{quote_ident, quote_qualified};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Everything captured about a schema in one introspection run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCatalog {
    pub schema: String,
    pub captured_at: DateTime<Utc>,
    pub enums: Vec<EnumType>,
    pub tables: Vec<TableSchema>,
    pub foreign_keys: Vec<ConstraintDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub functions: Vec<FunctionDescriptor>,
    pub triggers: Vec<TriggerDescriptor>,
    pub policies: Vec<PolicyDescriptor>,
    /// One entry per artifact class that could not be read
    pub warnings: Vec<String>,
}

impl SchemaCatalog {
    pub fn empty(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            captured_at: Utc::now(),
            enums: Vec::new(),
            tables: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            functions: Vec::new(),
            triggers: Vec::new(),
            policies: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Primary key columns of a table, empty when it has none
    pub fn primary_key(&self, table: &str) -> Vec<String> {
        self.table(table)
            .and_then(|t| t.primary_key.as_ref())
            .map(|pk| pk.columns.clone())
            .unwrap_or_default()
    }

    /// Column descriptors of a table keyed by name
    pub fn columns_by_name(&self, table: &str) -> HashMap<&str, &ColumnDescriptor> {
        self.table(table)
            .map(|t| t.columns.iter().map(|c| (c.name.as_str(), c)).collect())
            .unwrap_or_default()
    }
}

/// Enum type with labels in declaration order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub labels: Vec<String>,
}

/// Table with its columns and inline constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Option<ConstraintDescriptor>,
    pub unique_constraints: Vec<ConstraintDescriptor>,
}

/// Column as reported by `information_schema.columns`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    /// `data_type`, e.g. `character varying`, `ARRAY`, `USER-DEFINED`
    pub data_type: String,
    /// Underlying type name, e.g. `varchar`, `_text`, `mood`
    pub udt_name: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_precision: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_scale: Option<i32>,
    /// `ALWAYS` or `BY DEFAULT` for identity columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Expression of a stored generated column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
}

impl ColumnDescriptor {
    pub fn is_json(&self) -> bool {
        matches!(self.udt_name.as_str(), "json" | "jsonb")
    }

    /// Cast applied when reading rows; `numeric` goes through text so JSON
    /// numbers never round it
    pub fn exact_text_cast(&self) -> Option<&'static str> {
        match self.udt_name.as_str() {
            "numeric" => Some("text"),
            "_numeric" => Some("text[]"),
            _ => None,
        }
    }

    /// Computed by the server; never written on insert
    pub fn is_generated(&self) -> bool {
        self.generated.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
}

impl ConstraintKind {
    fn from_contype(contype: &str) -> Option<Self> {
        match contype {
            "p" => Some(ConstraintKind::PrimaryKey),
            "u" => Some(ConstraintKind::Unique),
            "f" => Some(ConstraintKind::ForeignKey),
            _ => None,
        }
    }
}

/// Primary key, unique or foreign key constraint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDescriptor {
    pub name: String,
    pub kind: ConstraintKind,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignReference>,
}

/// Target side of a foreign key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignReference {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    /// `CREATE [UNIQUE] INDEX ...` as produced by `pg_indexes`
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub name: String,
    /// `CREATE OR REPLACE ...` as produced by `pg_get_functiondef`
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    pub name: String,
    pub table: String,
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDescriptor {
    pub name: String,
    pub table: String,
    /// `PERMISSIVE` or `RESTRICTIVE`
    pub permissive: String,
    pub roles: Vec<String>,
    /// `ALL`, `SELECT`, `INSERT`, `UPDATE` or `DELETE`
    pub command: String,
    pub using_expr: Option<String>,
    pub check_expr: Option<String>,
}

impl PolicyDescriptor {
    /// `CREATE POLICY` statement reproducing this policy
    pub fn definition(&self, schema: &str) -> String {
        let roles = if self.roles.is_empty() {
            "public".to_string()
        } else {
            self.roles
                .iter()
                .map(|r| if r == "public" { r.clone() } else { quote_ident(r) })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!(
            "CREATE POLICY {} ON {} AS {} FOR {} TO {}",
            quote_ident(&self.name),
            quote_qualified(schema, &self.table),
            self.permissive,
            self.command,
            roles
        );
        if let Some(using) = &self.using_expr {
            sql.push_str(&format!(" USING ({})", using));
        }
        if let Some(check) = &self.check_expr {
            sql.push_str(&format!(" WITH CHECK ({})", check));
        }
        sql.push(';');
        sql
    }
}

/// How much of the catalog to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrospectionScope {
    /// Columns and constraints only (restore ordering, row decoding)
    Structure,
    /// Structure plus enums, indexes, functions, triggers and policies
    Full,
}

/// Read access to a live schema
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// Base tables of the configured schema
    async fn list_tables(&self) -> Result<Vec<String>, AppError>;

    /// Capture catalog metadata for `tables`. Never fails as a whole;
    /// unreadable artifact classes are reported in `warnings`.
    async fn introspect(&self, tables: &[String], scope: IntrospectionScope) -> SchemaCatalog;
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector {
    pool: Pool,
    schema: String,
}

impl PostgresIntrospector {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    async fn fetch_enums(
        client: &deadpool_postgres::Client,
        schema: &str,
    ) -> Result<Vec<EnumType>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_ENUMS, &[&schema]).await?;
        Ok(rows
            .iter()
            .map(|row| EnumType {
                name: row.get("name"),
                labels: row.get("labels"),
            })
            .collect())
    }

    async fn fetch_columns(
        client: &deadpool_postgres::Client,
        schema: &str,
        tables: &[String],
    ) -> Result<HashMap<String, Vec<ColumnDescriptor>>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_COLUMNS, &[&schema, &tables]).await?;

        let mut columns: HashMap<String, Vec<ColumnDescriptor>> = HashMap::new();
        for row in rows {
            columns
                .entry(row.get("table_name"))
                .or_default()
                .push(ColumnDescriptor {
                    name: row.get("column_name"),
                    data_type: row.get("data_type"),
                    udt_name: row.get("udt_name"),
                    nullable: row.get("nullable"),
                    default_value: row.get("column_default"),
                    max_length: row.get("max_length"),
                    numeric_precision: row.get("numeric_precision"),
                    numeric_scale: row.get("numeric_scale"),
                    identity: row.get("identity_generation"),
                    generated: row.get("generation_expression"),
                });
        }
        Ok(columns)
    }

    async fn fetch_constraints(
        client: &deadpool_postgres::Client,
        schema: &str,
        tables: &[String],
    ) -> Result<Vec<ConstraintDescriptor>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_CONSTRAINTS, &[&schema, &tables]).await?;

        let constraints = rows
            .iter()
            .filter_map(|row| {
                let kind = ConstraintKind::from_contype(row.get::<_, &str>("kind"))?;
                let references = match kind {
                    ConstraintKind::ForeignKey => Some(ForeignReference {
                        schema: row.get::<_, Option<String>>("referenced_schema").unwrap_or_default(),
                        table: row.get::<_, Option<String>>("referenced_table").unwrap_or_default(),
                        columns: row.try_get("referenced_columns").unwrap_or_default(),
                    }),
                    _ => None,
                };
                Some(ConstraintDescriptor {
                    name: row.get("constraint_name"),
                    kind,
                    table: row.get("table_name"),
                    columns: row.try_get("columns").unwrap_or_default(),
                    references,
                })
            })
            .collect();
        Ok(constraints)
    }

    async fn fetch_indexes(
        client: &deadpool_postgres::Client,
        schema: &str,
        tables: &[String],
    ) -> Result<Vec<IndexDescriptor>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_INDEXES, &[&schema, &tables]).await?;
        Ok(rows
            .iter()
            .map(|row| IndexDescriptor {
                name: row.get("name"),
                table: row.get("table_name"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn fetch_functions(
        client: &deadpool_postgres::Client,
        schema: &str,
    ) -> Result<Vec<FunctionDescriptor>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_FUNCTIONS, &[&schema]).await?;
        Ok(rows
            .iter()
            .map(|row| FunctionDescriptor {
                name: row.get("name"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn fetch_triggers(
        client: &deadpool_postgres::Client,
        schema: &str,
        tables: &[String],
    ) -> Result<Vec<TriggerDescriptor>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_TRIGGERS, &[&schema, &tables]).await?;
        Ok(rows
            .iter()
            .map(|row| TriggerDescriptor {
                name: row.get("name"),
                table: row.get("table_name"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn fetch_policies(
        client: &deadpool_postgres::Client,
        schema: &str,
        tables: &[String],
    ) -> Result<Vec<PolicyDescriptor>, tokio_postgres::Error> {
        let rows = client.query(queries::LIST_POLICIES, &[&schema, &tables]).await?;
        Ok(rows
            .iter()
            .map(|row| PolicyDescriptor {
                name: row.get("name"),
                table: row.get("table_name"),
                permissive: row.get("permissive"),
                roles: row.try_get("roles").unwrap_or_default(),
                command: row.get("command"),
                using_expr: row.get("using_expr"),
                check_expr: row.get("check_expr"),
            })
            .collect())
    }
}

/// Keep a class's result, or log the failure and fall back to the default
fn settle<T: Default>(
    class: &str,
    result: Result<T, tokio_postgres::Error>,
    warnings: &mut Vec<String>,
) -> T {
    match result {
        Ok(items) => items,
        Err(e) => {
            warn!("Failed to introspect {}: {}", class, e);
            warnings.push(format!("{}: {}", class, e));
            T::default()
        }
    }
}

/// Attach columns and inline constraints to each requested table, in request order
fn assemble_tables(
    tables: &[String],
    mut columns: HashMap<String, Vec<ColumnDescriptor>>,
    constraints: Vec<ConstraintDescriptor>,
) -> (Vec<TableSchema>, Vec<ConstraintDescriptor>) {
    let mut schemas: Vec<TableSchema> = tables
        .iter()
        .map(|name| TableSchema {
            name: name.clone(),
            columns: columns.remove(name).unwrap_or_default(),
            primary_key: None,
            unique_constraints: Vec::new(),
        })
        .collect();

    let mut foreign_keys = Vec::new();
    for constraint in constraints {
        match constraint.kind {
            ConstraintKind::ForeignKey => foreign_keys.push(constraint),
            ConstraintKind::PrimaryKey => {
                if let Some(t) = schemas.iter_mut().find(|t| t.name == constraint.table) {
                    t.primary_key = Some(constraint);
                }
            }
            ConstraintKind::Unique => {
                if let Some(t) = schemas.iter_mut().find(|t| t.name == constraint.table) {
                    t.unique_constraints.push(constraint);
                }
            }
        }
    }

    (schemas, foreign_keys)
}

#[async_trait]
impl CatalogReader for PostgresIntrospector {
    async fn list_tables(&self) -> Result<Vec<String>, AppError> {
        let client = self.pool.get().await?;
        let excluded: Vec<&str> = ENGINE_TABLES.to_vec();
        let rows = client.query(queries::LIST_TABLES, &[&self.schema, &excluded]).await?;
        Ok(rows.iter().map(|r| r.get("table_name")).collect())
    }

    async fn introspect(&self, tables: &[String], scope: IntrospectionScope) -> SchemaCatalog {
        let mut catalog = SchemaCatalog::empty(self.schema.clone());
        let schema = self.schema.as_str();

        let client = match self.pool.get().await {
            Ok(client) => client,
            Err(e) => {
                warn!("Introspection could not acquire a connection: {}", e);
                catalog.warnings.push(format!("connection: {}", e));
                catalog.tables = assemble_tables(tables, HashMap::new(), Vec::new()).0;
                return catalog;
            }
        };

        let columns = settle(
            "columns",
            Self::fetch_columns(&client, schema, tables).await,
            &mut catalog.warnings,
        );
        let constraints = settle(
            "constraints",
            Self::fetch_constraints(&client, schema, tables).await,
            &mut catalog.warnings,
        );
        let (table_schemas, foreign_keys) = assemble_tables(tables, columns, constraints);
        catalog.tables = table_schemas;
        catalog.foreign_keys = foreign_keys;

        if scope == IntrospectionScope::Full {
            catalog.enums = settle(
                "enum types",
                Self::fetch_enums(&client, schema).await,
                &mut catalog.warnings,
            );
            catalog.indexes = settle(
                "indexes",
                Self::fetch_indexes(&client, schema, tables).await,
                &mut catalog.warnings,
            );
            catalog.functions = settle(
                "functions",
                Self::fetch_functions(&client, schema).await,
                &mut catalog.warnings,
            );
            catalog.triggers = settle(
                "triggers",
                Self::fetch_triggers(&client, schema, tables).await,
                &mut catalog.warnings,
            );
            catalog.policies = settle(
                "policies",
                Self::fetch_policies(&client, schema, tables).await,
                &mut catalog.warnings,
            );
        }

        debug!(
            "Introspected {} tables, {} FKs, {} enums, {} indexes, {} functions, {} triggers, {} policies ({} warnings)",
            catalog.tables.len(),
            catalog.foreign_keys.len(),
            catalog.enums.len(),
            catalog.indexes.len(),
            catalog.functions.len(),
            catalog.triggers.len(),
            catalog.policies.len(),
            catalog.warnings.len()
        );

        catalog
    }
}
