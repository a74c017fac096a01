//! SQL dump generator
//!
//! Renders an introspected catalog plus captured rows as one idempotent SQL
//! document. Sections are emitted in a fixed order: enum types, sequences,
//! `BEGIN`, tables, foreign keys, indexes, functions, triggers, RLS policies,
//! data, sequence positions, `COMMIT`.

use crate::backup::paginator::TableRows;
use crate::backup::value::{decode_row, Row};
use crate::introspection::{ColumnDescriptor, SchemaCatalog, TableSchema};
use crate::registry::DependencyOrder;
use crate::sql::{quote_ident, quote_ident_list, quote_literal, quote_qualified};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static NEXTVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"nextval\('((?:[^']|'')+)'(?:::regclass)?\)").expect("valid regex")
});

static CREATE_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^CREATE\s+(UNIQUE\s+)?INDEX\s+(CONCURRENTLY\s+)?(IF\s+NOT\s+EXISTS\s+)?")
        .expect("valid regex")
});

/// A sequence feeding a column default
#[derive(Debug, Clone, PartialEq, Eq)]
struct SequenceUse {
    /// Sequence name exactly as written in the default, e.g. `assets_id_seq`
    name: String,
    table: String,
    column: String,
}

pub struct DdlSynthesizer<'a> {
    catalog: &'a SchemaCatalog,
    order: &'a DependencyOrder,
}

impl<'a> DdlSynthesizer<'a> {
    pub fn new(catalog: &'a SchemaCatalog, order: &'a DependencyOrder) -> Self {
        Self { catalog, order }
    }

    /// Render the whole document; `data` is expected in dependency order
    pub fn render(&self, data: &[TableRows]) -> String {
        let mut doc = SqlDocument::default();
        let schema = self.catalog.schema.as_str();

        doc.line("-- PgVault SQL export");
        doc.line(format!("-- Schema: {}", schema));
        doc.line(format!("-- Generated: {}", Utc::now().to_rfc3339()));
        for warning in &self.catalog.warnings {
            doc.line(format!("-- Warning: not captured: {}", warning));
        }

        doc.section("ENUM TYPES");
        for enum_type in &self.catalog.enums {
            let labels: Vec<String> = enum_type.labels.iter().map(|l| quote_literal(l)).collect();
            doc.line("DO $$ BEGIN");
            doc.line(format!(
                "    CREATE TYPE {} AS ENUM ({});",
                quote_qualified(schema, &enum_type.name),
                labels.join(", ")
            ));
            doc.line("EXCEPTION WHEN duplicate_object THEN NULL;");
            doc.line("END $$;");
        }

        let sequences = self.sequences();
        doc.section("SEQUENCES");
        for sequence in &sequences {
            doc.line(format!("CREATE SEQUENCE IF NOT EXISTS {};", sequence.name));
        }

        doc.blank();
        doc.line("BEGIN;");

        doc.section("CREATE TABLE");
        for table in self.tables() {
            doc.line(self.create_table(table));
            doc.blank();
        }

        doc.section("FOREIGN KEYS");
        for table in self.tables() {
            for fk in self.catalog.foreign_keys.iter().filter(|fk| fk.table == table.name) {
                let Some(reference) = &fk.references else { continue };
                let owner = quote_qualified(schema, &fk.table);
                doc.line(format!(
                    "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
                    owner,
                    quote_ident(&fk.name)
                ));
                doc.line(format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE;",
                    owner,
                    quote_ident(&fk.name),
                    quote_ident_list(&fk.columns),
                    quote_qualified(&reference.schema, &reference.table),
                    quote_ident_list(&reference.columns)
                ));
            }
        }

        doc.section("INDEXES");
        for index in &self.catalog.indexes {
            doc.line(format!("{};", idempotent_index(&index.definition)));
        }

        doc.section("FUNCTIONS");
        for function in &self.catalog.functions {
            doc.line(format!("{};", function.definition.trim_end()));
            doc.blank();
        }

        doc.section("TRIGGERS");
        for trigger in &self.catalog.triggers {
            doc.line(format!(
                "DROP TRIGGER IF EXISTS {} ON {};",
                quote_ident(&trigger.name),
                quote_qualified(schema, &trigger.table)
            ));
            doc.line(format!("{};", trigger.definition.trim_end()));
        }

        doc.section("RLS POLICIES");
        for table in self.tables() {
            doc.line(format!(
                "ALTER TABLE {} ENABLE ROW LEVEL SECURITY;",
                quote_qualified(schema, &table.name)
            ));
        }
        for policy in &self.catalog.policies {
            doc.line(format!(
                "DROP POLICY IF EXISTS {} ON {};",
                quote_ident(&policy.name),
                quote_qualified(schema, &policy.table)
            ));
            doc.line(policy.definition(schema));
        }

        doc.section("DATA");
        for table in data {
            self.write_rows(&mut doc, table);
        }

        let identities = self.identity_columns();
        if !sequences.is_empty() || !identities.is_empty() {
            doc.section("SEQUENCE POSITIONS");
            for sequence in &sequences {
                doc.line(format!(
                    "SELECT setval({}, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false);",
                    quote_literal(&sequence.name),
                    quote_ident(&sequence.column),
                    quote_qualified(schema, &sequence.table)
                ));
            }
            for (table, column) in &identities {
                let relation = quote_qualified(schema, table);
                doc.line(format!(
                    "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false);",
                    quote_literal(&relation),
                    quote_literal(column),
                    quote_ident(column),
                    relation
                ));
            }
        }

        doc.blank();
        doc.line("COMMIT;");
        doc.finish()
    }

    /// Captured tables in dependency order
    fn tables(&self) -> impl Iterator<Item = &'a TableSchema> + '_ {
        self.order.forward().filter_map(|t| self.catalog.table(&t.name))
    }

    fn sequences(&self) -> Vec<SequenceUse> {
        let mut seen = HashSet::new();
        let mut sequences = Vec::new();
        for table in self.tables() {
            for column in &table.columns {
                let Some(default) = &column.default_value else { continue };
                let Some(captures) = NEXTVAL.captures(default) else { continue };
                let name = captures[1].replace("''", "'");
                if seen.insert(name.clone()) {
                    sequences.push(SequenceUse {
                        name,
                        table: table.name.clone(),
                        column: column.name.clone(),
                    });
                }
            }
        }
        sequences
    }

    /// `(table, column)` for every identity column
    fn identity_columns(&self) -> Vec<(&'a str, &'a str)> {
        self.tables()
            .flat_map(|table| {
                table
                    .columns
                    .iter()
                    .filter(|c| c.identity.is_some())
                    .map(move |c| (table.name.as_str(), c.name.as_str()))
            })
            .collect()
    }

    fn create_table(&self, table: &TableSchema) -> String {
        let enums: HashSet<&str> = self.catalog.enums.iter().map(|e| e.name.as_str()).collect();

        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|col| {
                let mut def = format!("    {} {}", quote_ident(&col.name), column_type(col, &enums));
                if !col.nullable {
                    def.push_str(" NOT NULL");
                }
                match (&col.generated, &col.identity, &col.default_value) {
                    (Some(expression), _, _) => {
                        def.push_str(&format!(" GENERATED ALWAYS AS ({}) STORED", expression))
                    }
                    (None, Some(generation), _) => {
                        def.push_str(&format!(" GENERATED {} AS IDENTITY", generation))
                    }
                    (None, None, Some(default)) => def.push_str(&format!(" DEFAULT {}", default)),
                    (None, None, None) => {}
                }
                def
            })
            .collect();

        if let Some(pk) = &table.primary_key {
            lines.push(format!(
                "    CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(&pk.name),
                quote_ident_list(&pk.columns)
            ));
        }
        for unique in &table.unique_constraints {
            lines.push(format!(
                "    CONSTRAINT {} UNIQUE ({})",
                quote_ident(&unique.name),
                quote_ident_list(&unique.columns)
            ));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
            quote_qualified(&self.catalog.schema, &table.name),
            lines.join(",\n")
        )
    }

    fn write_rows(&self, doc: &mut SqlDocument, table: &TableRows) {
        let target = quote_qualified(&self.catalog.schema, &table.table);
        if let Some(error) = &table.error {
            doc.line(format!("-- {}: skipped ({})", target, error.replace('\n', " ")));
            return;
        }
        doc.line(format!("-- {}: {} rows", target, table.rows.len()));

        let columns = self.catalog.columns_by_name(&table.table);
        // Identity values are replayed as captured
        let overriding = if columns.values().any(|c| c.identity.is_some()) {
            " OVERRIDING SYSTEM VALUE"
        } else {
            ""
        };
        for row in &table.rows {
            let decoded: Row = decode_row(row.clone(), &columns)
                .into_iter()
                .filter(|(name, _)| !columns.get(name.as_str()).is_some_and(|c| c.is_generated()))
                .collect();
            let names: Vec<&str> = decoded.iter().map(|(name, _)| name.as_str()).collect();
            let literals: Vec<String> = decoded
                .iter()
                .map(|(name, value)| value.to_sql_literal(columns.get(name.as_str()).copied()))
                .collect();
            doc.line(format!(
                "INSERT INTO {} ({}){} VALUES ({}) ON CONFLICT DO NOTHING;",
                target,
                quote_ident_list(&names),
                overriding,
                literals.join(", ")
            ));
        }
    }
}

/// Canonical column type for `CREATE TABLE`
fn column_type(col: &ColumnDescriptor, enums: &HashSet<&str>) -> String {
    match col.data_type.as_str() {
        "ARRAY" => {
            let element = col.udt_name.trim_start_matches('_');
            if enums.contains(element) {
                format!("{}[]", quote_ident(element))
            } else {
                format!("{}[]", element)
            }
        }
        "USER-DEFINED" => quote_ident(&col.udt_name),
        "character varying" => match col.max_length {
            Some(n) => format!("character varying({})", n),
            None => "character varying".to_string(),
        },
        "character" => match col.max_length {
            Some(n) => format!("character({})", n),
            None => "character".to_string(),
        },
        "numeric" => match (col.numeric_precision, col.numeric_scale) {
            (Some(p), Some(s)) => format!("numeric({},{})", p, s),
            (Some(p), None) => format!("numeric({})", p),
            _ => "numeric".to_string(),
        },
        "timestamp with time zone" | "timestamp without time zone" => col.data_type.clone(),
        other => other.to_string(),
    }
}

/// `CREATE [UNIQUE] INDEX IF NOT EXISTS ...`, dropping `CONCURRENTLY`
fn idempotent_index(definition: &str) -> String {
    let definition = definition.trim().trim_end_matches(';');
    match CREATE_INDEX.captures(definition) {
        Some(captures) => {
            let unique = if captures.get(1).is_some() { "UNIQUE " } else { "" };
            format!(
                "CREATE {}INDEX IF NOT EXISTS {}",
                unique,
                &definition[captures[0].len()..]
            )
        }
        None => definition.to_string(),
    }
}

/// Line-oriented output buffer with section banners
#[derive(Default)]
struct SqlDocument {
    buf: String,
}

impl SqlDocument {
    fn line(&mut self, text: impl AsRef<str>) {
        self.buf.push_str(text.as_ref());
        self.buf.push('\n');
    }

    fn blank(&mut self) {
        self.buf.push('\n');
    }

    fn section(&mut self, title: &str) {
        self.blank();
        self.line("-- ============================================================");
        self.line(format!("-- {}", title));
        self.line("-- ============================================================");
    }

    fn finish(self) -> String {
        self.buf
    }
}
