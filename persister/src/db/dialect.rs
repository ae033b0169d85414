//! SQL rendering for the supported database flavors.

use serde_json::Value;
use stowage_engine::{ColumnKind, DbRow, RowNormalizer};

/// SQL flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Quote an identifier. Embedded quotes are doubled.
    pub fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Positional placeholder, 1-based.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Postgres => format!("${}", index),
        }
    }

    /// How rows read back differ from rows written, if they do.
    pub fn row_normalizer(&self) -> Option<RowNormalizer> {
        match self {
            Dialect::Sqlite => Some(booleans_as_integers),
            Dialect::Postgres => None,
        }
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match (self, kind) {
            (_, ColumnKind::Text) => " TEXT",
            // Untyped columns in SQLite keep whatever storage class is written.
            (Dialect::Sqlite, ColumnKind::Cell) => "",
            (Dialect::Postgres, ColumnKind::Cell) => " JSONB",
        }
    }

    pub fn create_table(&self, table: &str, id_column: &str, columns: &[(String, ColumnKind)]) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY",
            self.quote(table),
            self.quote(id_column)
        );
        for (column, kind) in columns {
            sql.push_str(&format!(", {}{}", self.quote(column), self.column_type(*kind)));
        }
        sql.push(')');
        sql
    }

    pub fn add_column(&self, table: &str, column: &str, kind: ColumnKind) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}{}",
            self.quote(table),
            self.quote(column),
            self.column_type(kind)
        )
    }

    /// Query returning one `name` row per column of the table bound to
    /// placeholder 1.
    pub fn list_columns(&self) -> String {
        match self {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info(?1)".to_string(),
            Dialect::Postgres => "SELECT column_name::text AS name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1"
                .to_string(),
        }
    }

    /// Query returning a row if the table bound to placeholder 1 exists.
    pub fn table_exists(&self) -> String {
        match self {
            Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1".to_string(),
            Dialect::Postgres => "SELECT table_name::text AS name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
                .to_string(),
        }
    }

    pub fn select_all(&self, table: &str) -> String {
        format!("SELECT * FROM {}", self.quote(table))
    }

    pub fn delete_all(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote(table))
    }

    /// Insert one row of `id_column` plus `columns`; an existing id is
    /// overwritten.
    pub fn upsert(&self, table: &str, id_column: &str, columns: &[&str]) -> String {
        let names: Vec<String> = std::iter::once(id_column)
            .chain(columns.iter().copied())
            .map(|c| self.quote(c))
            .collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| self.placeholder(i)).collect();

        let conflict = if columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let updates: Vec<String> = columns
                .iter()
                .map(|c| format!("{0} = excluded.{0}", self.quote(c)))
                .collect();
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            self.quote(table),
            names.join(", "),
            placeholders.join(", "),
            self.quote(id_column),
            conflict
        )
    }
}

/// SQLite has no boolean storage class.
fn booleans_as_integers(row: &mut DbRow) {
    for value in row.values_mut() {
        if let Value::Bool(flag) = value {
            *value = Value::from(i64::from(*flag));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_rows_narrow_booleans() {
        let normalize = Dialect::Sqlite.row_normalizer().unwrap();
        let mut row = DbRow::from([
            ("_id".to_string(), Value::from("fido")),
            ("good".to_string(), Value::Bool(true)),
            ("bad".to_string(), Value::Bool(false)),
        ]);
        normalize(&mut row);
        assert_eq!(row["_id"], Value::from("fido"));
        assert_eq!(row["good"], Value::from(1));
        assert_eq!(row["bad"], Value::from(0));

        assert!(Dialect::Postgres.row_normalizer().is_none());
    }

    #[test]
    fn quoting_escapes_quotes() {
        assert_eq!(Dialect::Sqlite.quote("pets"), "\"pets\"");
        assert_eq!(Dialect::Postgres.quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn create_table_per_dialect() {
        let columns = vec![
            ("species".to_string(), ColumnKind::Cell),
            ("store".to_string(), ColumnKind::Text),
        ];
        assert_eq!(
            Dialect::Sqlite.create_table("pets", "_id", &columns),
            "CREATE TABLE IF NOT EXISTS \"pets\" (\"_id\" TEXT PRIMARY KEY, \"species\", \"store\" TEXT)"
        );
        assert_eq!(
            Dialect::Postgres.create_table("pets", "_id", &columns),
            "CREATE TABLE IF NOT EXISTS \"pets\" (\"_id\" TEXT PRIMARY KEY, \"species\" JSONB, \"store\" TEXT)"
        );
    }

    #[test]
    fn upsert_per_dialect() {
        assert_eq!(
            Dialect::Sqlite.upsert("pets", "_id", &["color", "species"]),
            "INSERT INTO \"pets\" (\"_id\", \"color\", \"species\") VALUES (?1, ?2, ?3) \
             ON CONFLICT (\"_id\") DO UPDATE SET \"color\" = excluded.\"color\", \"species\" = excluded.\"species\""
        );
        assert_eq!(
            Dialect::Postgres.upsert("pets", "_id", &["species"]),
            "INSERT INTO \"pets\" (\"_id\", \"species\") VALUES ($1, $2) \
             ON CONFLICT (\"_id\") DO UPDATE SET \"species\" = excluded.\"species\""
        );
    }

    #[test]
    fn upsert_without_cells_does_nothing_on_conflict() {
        assert_eq!(
            Dialect::Sqlite.upsert("t", "id", &[]),
            "INSERT INTO \"t\" (\"id\") VALUES (?1) ON CONFLICT (\"id\") DO NOTHING"
        );
    }

    #[test]
    fn add_column_uses_cell_type() {
        assert_eq!(
            Dialect::Postgres.add_column("pets", "age", ColumnKind::Cell),
            "ALTER TABLE \"pets\" ADD COLUMN \"age\" JSONB"
        );
        assert_eq!(
            Dialect::Sqlite.add_column("pets", "age", ColumnKind::Cell),
            "ALTER TABLE \"pets\" ADD COLUMN \"age\""
        );
    }

    #[test]
    fn introspection_binds_table_name() {
        assert!(Dialect::Sqlite.table_exists().ends_with("?1"));
        assert!(Dialect::Postgres.list_columns().contains("$1"));
    }
}
