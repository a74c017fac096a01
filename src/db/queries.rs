//! SQL query constants
//!
//! Catalog reads take the schema name as `$1` and, where scoped to a set of
//! tables, the table names as a `text[]` in `$2`.

/// Base tables of a schema, minus the `text[]` of excluded names in `$2`
pub const LIST_TABLES: &str = r#"
    SELECT table_name::text AS table_name
    FROM information_schema.tables
    WHERE table_schema::text = $1
      AND table_type = 'BASE TABLE'
      AND table_name::text <> ALL($2::text[])
    ORDER BY table_name
"#;

/// Enum types with labels in declaration order
pub const LIST_ENUMS: &str = r#"
    SELECT
        t.typname::text AS name,
        array_agg(e.enumlabel::text ORDER BY e.enumsortorder) AS labels
    FROM pg_type t
    JOIN pg_enum e ON e.enumtypid = t.oid
    JOIN pg_namespace n ON n.oid = t.typnamespace
    WHERE n.nspname::text = $1
    GROUP BY t.typname
    ORDER BY t.typname
"#;

/// Columns of the given tables in ordinal order
pub const LIST_COLUMNS: &str = r#"
    SELECT
        c.table_name::text AS table_name,
        c.column_name::text AS column_name,
        c.data_type::text AS data_type,
        c.udt_name::text AS udt_name,
        c.is_nullable = 'YES' AS nullable,
        c.column_default::text AS column_default,
        c.character_maximum_length::int AS max_length,
        c.numeric_precision::int AS numeric_precision,
        c.numeric_scale::int AS numeric_scale,
        CASE WHEN c.is_identity = 'YES' THEN c.identity_generation::text END AS identity_generation,
        CASE WHEN c.is_generated = 'ALWAYS' THEN c.generation_expression::text END AS generation_expression
    FROM information_schema.columns c
    WHERE c.table_schema::text = $1
      AND c.table_name::text = ANY($2::text[])
    ORDER BY c.table_name, c.ordinal_position
"#;

/// Primary key, unique and foreign key constraints with ordered column lists
pub const LIST_CONSTRAINTS: &str = r#"
    SELECT
        con.conname::text AS constraint_name,
        con.contype::text AS kind,
        src.relname::text AS table_name,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        ref_ns.nspname::text AS referenced_schema,
        ref.relname::text AS referenced_table,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS referenced_columns
    FROM pg_constraint con
    JOIN pg_class src ON src.oid = con.conrelid
    JOIN pg_namespace ns ON ns.oid = src.relnamespace
    LEFT JOIN pg_class ref ON ref.oid = con.confrelid
    LEFT JOIN pg_namespace ref_ns ON ref_ns.oid = ref.relnamespace
    WHERE con.contype IN ('p', 'u', 'f')
      AND ns.nspname::text = $1
      AND src.relname::text = ANY($2::text[])
    ORDER BY src.relname, con.contype, con.conname
"#;

/// Indexes not owned by a constraint
pub const LIST_INDEXES: &str = r#"
    SELECT
        i.indexname::text AS name,
        i.tablename::text AS table_name,
        i.indexdef AS definition
    FROM pg_indexes i
    WHERE i.schemaname::text = $1
      AND i.tablename::text = ANY($2::text[])
      AND NOT EXISTS (
          SELECT 1
          FROM pg_constraint con
          JOIN pg_class ci ON ci.oid = con.conindid
          JOIN pg_namespace cn ON cn.oid = ci.relnamespace
          WHERE ci.relname = i.indexname AND cn.nspname = i.schemaname
      )
    ORDER BY i.tablename, i.indexname
"#;

/// User-defined functions and procedures, excluding extension members
pub const LIST_FUNCTIONS: &str = r#"
    SELECT
        p.proname::text AS name,
        pg_get_functiondef(p.oid) AS definition
    FROM pg_proc p
    JOIN pg_namespace n ON n.oid = p.pronamespace
    WHERE n.nspname::text = $1
      AND p.prokind IN ('f', 'p')
      AND NOT EXISTS (
          SELECT 1 FROM pg_depend d
          WHERE d.objid = p.oid AND d.deptype = 'e'
      )
    ORDER BY p.proname, p.oid
"#;

/// Non-internal triggers on the given tables
pub const LIST_TRIGGERS: &str = r#"
    SELECT
        t.tgname::text AS name,
        c.relname::text AS table_name,
        pg_get_triggerdef(t.oid) AS definition
    FROM pg_trigger t
    JOIN pg_class c ON c.oid = t.tgrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname::text = $1
      AND c.relname::text = ANY($2::text[])
      AND NOT t.tgisinternal
    ORDER BY c.relname, t.tgname
"#;

/// Row-level-security policies on the given tables
pub const LIST_POLICIES: &str = r#"
    SELECT
        p.policyname::text AS name,
        p.tablename::text AS table_name,
        p.permissive AS permissive,
        p.roles::text[] AS roles,
        p.cmd AS command,
        p.qual AS using_expr,
        p.with_check AS check_expr
    FROM pg_policies p
    WHERE p.schemaname::text = $1
      AND p.tablename::text = ANY($2::text[])
    ORDER BY p.tablename, p.policyname
"#;

/// One page of a table as JSON text, `{columns}`, `{order}` and `{table}` substituted by the caller
pub const PAGE_TEMPLATE: &str =
    "SELECT row_to_json(t)::text AS row FROM (SELECT {columns} FROM {table}{order} LIMIT $1 OFFSET $2) t";

/// Admin role lookup against the identity provider's role table
pub const IS_ADMIN: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM user_roles
        WHERE user_id::text = $1 AND role::text = $2
    ) AS is_admin
"#;

/// Engine bookkeeping table
pub const CREATE_BACKUP_SETTINGS: &str = r#"
    CREATE TABLE IF NOT EXISTS backup_settings (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        hour SMALLINT NOT NULL DEFAULT 2,
        minute SMALLINT NOT NULL DEFAULT 0,
        recipient_email TEXT,
        enabled BOOLEAN NOT NULL DEFAULT false,
        scheduler_token TEXT,
        last_backup_at TIMESTAMPTZ,
        last_backup_status TEXT,
        last_backup_error TEXT,
        last_backup_file TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

pub const LOAD_BACKUP_SETTINGS: &str = r#"
    SELECT hour::int AS hour, minute::int AS minute, recipient_email, enabled,
           scheduler_token, last_backup_at, last_backup_status,
           last_backup_error, last_backup_file
    FROM backup_settings
    WHERE id = 1
"#;

pub const SAVE_BACKUP_SETTINGS: &str = r#"
    INSERT INTO backup_settings (id, hour, minute, recipient_email, enabled, scheduler_token, updated_at)
    VALUES (1, $1::int::smallint, $2::int::smallint, $3, $4, $5, now())
    ON CONFLICT (id) DO UPDATE SET
        hour = EXCLUDED.hour,
        minute = EXCLUDED.minute,
        recipient_email = EXCLUDED.recipient_email,
        enabled = EXCLUDED.enabled,
        scheduler_token = EXCLUDED.scheduler_token,
        updated_at = now()
"#;

pub const RECORD_BACKUP_RUN: &str = r#"
    INSERT INTO backup_settings (id, last_backup_at, last_backup_status, last_backup_error, last_backup_file)
    VALUES (1, $1, $2, $3, $4)
    ON CONFLICT (id) DO UPDATE SET
        last_backup_at = EXCLUDED.last_backup_at,
        last_backup_status = EXCLUDED.last_backup_status,
        last_backup_error = EXCLUDED.last_backup_error,
        last_backup_file = COALESCE(EXCLUDED.last_backup_file, backup_settings.last_backup_file),
        updated_at = now()
"#;
