//! Reconciliation: deciding whether a save must write and whether a load
//! must apply.
//!
//! # Save path
//!
//! Every [`SaveStep`] is fingerprinted over its id column and intended rows.
//! A step whose fingerprint equals the one cached for its [`Target`] after the
//! last successful write is dropped. If every step is dropped the save issues
//! no write commands at all.
//!
//! # Load path
//!
//! External content is merged into current content and the result is
//! compared by fingerprint, so a load of unchanged data reports
//! `changed == false` and the caller can skip notifying anyone.
//!
//! The same cache serves as the common base for loads: a target whose
//! external fingerprint still matches the cache has not changed since the
//! last sync, so applying it would only discard newer local edits.
//!
//! # Medium narrowing
//!
//! A medium may hand back a different but equivalent scalar than the one
//! written (a boolean read back as `1`). A [`RowNormalizer`] maps intended
//! rows to the stored form before fingerprinting, so a persister's own
//! write is recognised when it is read back.
//!
//! The cache is owned by one reconciler, which in turn is owned by one
//! persister; nothing here is process-global.

use crate::codec::{encode_json, encode_table, encode_values, json_row};
use crate::config::DbTable;
use crate::plan::{SaveStep, Target};
use crate::{error::Result, Content, DbRow, Error, Table, TableId, Values};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;

/// SHA-256 over the canonical JSON serialization of some content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint any serializable value.
    ///
    /// Callers are expected to pass `BTreeMap`-based data so the encoding is
    /// canonical.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let mut writer = DigestWriter(Sha256::new());
        serde_json::to_writer(&mut writer, value).map_err(|e| Error::malformed(e.to_string()))?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&writer.0.finalize());
        Ok(Fingerprint(bytes))
    }

    /// Fingerprint of whole store content.
    pub fn of_content(content: &Content) -> Result<Self> {
        content.validate()?;
        Self::of(content)
    }

    /// Fingerprint of a table's intended rows.
    pub fn of_rows(db_table: &DbTable, rows: &[DbRow]) -> Result<Self> {
        Self::of(&(&db_table.row_id_column, rows))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

struct DigestWriter(Sha256);

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Content freshly read from the medium.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalSnapshot {
    /// JSON mode. `None` when the medium holds no store row yet.
    Json(Option<Content>),
    /// Tabular mode: only the tables (and values) that were read successfully.
    Tabular {
        tables: Vec<(TableId, Table)>,
        values: Option<Values>,
    },
}

/// Outcome of merging external content into current content.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub content: Content,
    pub changed: bool,
}

/// Rewrites a row into the form the medium stores it in.
pub type RowNormalizer = fn(&mut DbRow);

/// Per-persister reconciliation state.
#[derive(Default)]
pub struct Reconciler {
    persisted: HashMap<Target, Fingerprint>,
    normalize: Option<RowNormalizer>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("persisted", &self.persisted.len())
            .field("normalized", &self.normalize.is_some())
            .finish()
    }
}

impl Reconciler {
    /// Create a reconciler with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reconciler that fingerprints rows as `normalize` leaves them.
    pub fn with_row_normalizer(normalize: RowNormalizer) -> Self {
        Self {
            persisted: HashMap::new(),
            normalize: Some(normalize),
        }
    }

    /// Fingerprint whole content.
    pub fn fingerprint_of(content: &Content) -> Result<Fingerprint> {
        Fingerprint::of_content(content)
    }

    /// Fingerprint the rows a step would write, in stored form.
    pub fn fingerprint_step(&self, step: &SaveStep) -> Result<Fingerprint> {
        self.fingerprint_rows(&step.db_table, &step.rows)
    }

    fn fingerprint_rows(&self, db_table: &DbTable, rows: &[DbRow]) -> Result<Fingerprint> {
        match self.normalize {
            Some(normalize) => {
                let mut rows = rows.to_vec();
                rows.iter_mut().for_each(normalize);
                Fingerprint::of_rows(db_table, &rows)
            }
            None => Fingerprint::of_rows(db_table, rows),
        }
    }

    /// Whether content with `fingerprint` must be written to `target`.
    pub fn should_write(&self, target: &Target, fingerprint: &Fingerprint) -> bool {
        self.persisted.get(target) != Some(fingerprint)
    }

    /// Keep only the steps whose content differs from the last persisted
    /// content, paired with their fingerprints.
    pub fn pending(&self, steps: Vec<SaveStep>) -> Result<Vec<(SaveStep, Fingerprint)>> {
        let mut pending = Vec::with_capacity(steps.len());
        for step in steps {
            let fingerprint = self.fingerprint_step(&step)?;
            if self.should_write(&step.target, &fingerprint) {
                pending.push((step, fingerprint));
            }
        }
        Ok(pending)
    }

    /// Remember that `target` now holds content with `fingerprint`.
    pub fn record(&mut self, target: Target, fingerprint: Fingerprint) {
        self.persisted.insert(target, fingerprint);
    }

    /// Fingerprint what a load just read, as the rows a save of it would
    /// produce. Comparable with [`Reconciler::fingerprint_step`].
    pub fn fingerprint_loaded(&self, db_table: &DbTable, loaded: &Loaded<'_>) -> Result<Fingerprint> {
        let rows = match loaded {
            Loaded::Store { store_column, content } => vec![json_row(
                &db_table.row_id_column,
                store_column,
                &encode_json(content)?,
            )],
            Loaded::Table { table_id, table } => encode_table(table_id, table, &db_table.row_id_column)?,
            Loaded::Values(values) => encode_values(values, &db_table.row_id_column)?,
        };
        self.fingerprint_rows(db_table, &rows)
    }

    /// Whether `target` still holds what this reconciler last wrote or read.
    ///
    /// A load uses this as the common base: when the medium has not moved
    /// since the last sync, local edits made since then must not be replaced
    /// by the older external copy.
    pub fn is_synced(&self, target: &Target, fingerprint: &Fingerprint) -> bool {
        self.persisted.get(target) == Some(fingerprint)
    }

    /// Drop the cached fingerprint for `target`, forcing its next write.
    pub fn forget(&mut self, target: &Target) {
        self.persisted.remove(target);
    }

    /// Drop every cached fingerprint.
    pub fn clear(&mut self) {
        self.persisted.clear();
    }

    pub fn cached(&self, target: &Target) -> Option<&Fingerprint> {
        self.persisted.get(target)
    }

    /// Merge external content into `current`.
    ///
    /// JSON mode replaces everything. Tabular mode replaces only the tables
    /// (and values) that were read; the rest of `current` is kept.
    pub fn merge(&self, external: ExternalSnapshot, current: &Content) -> Result<Merge> {
        let content = match external {
            ExternalSnapshot::Json(None) => current.clone(),
            ExternalSnapshot::Json(Some(content)) => content,
            ExternalSnapshot::Tabular { tables, values } => {
                let mut merged = current.clone();
                for (table_id, table) in tables {
                    merged.tables.insert(table_id, table);
                }
                if let Some(values) = values {
                    merged.values = values;
                }
                merged
            }
        };
        let changed = Self::fingerprint_of(&content)? != Self::fingerprint_of(current)?;
        Ok(Merge { content, changed })
    }
}

/// Content a load step produced, borrowed for fingerprinting.
#[derive(Debug, Clone, Copy)]
pub enum Loaded<'a> {
    Store { store_column: &'a str, content: &'a Content },
    Table { table_id: &'a str, table: &'a Table },
    Values(&'a Values),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::config::{DatabasePersisterConfig, PersistMode, TabularConfig};
    use crate::plan::plan_save;
    use crate::{CellValue, Row};

    fn pets() -> Content {
        let mut content = Content::new();
        content.set_cell("pets", "fido", "species", "dog");
        content
    }

    fn tabular() -> PersistMode {
        DatabasePersisterConfig::from(TabularConfig::new().both("pets", "pets").both("toys", "toys"))
            .resolve()
            .unwrap()
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let mut a = Content::new();
        a.set_cell("t", "r1", "c", 1).set_cell("t", "r2", "c", 2);
        let mut b = Content::new();
        b.set_cell("t", "r2", "c", 2).set_cell("t", "r1", "c", 1);
        assert_eq!(
            Reconciler::fingerprint_of(&a).unwrap(),
            Reconciler::fingerprint_of(&b).unwrap()
        );
    }

    #[test]
    fn fingerprint_distinguishes_types() {
        let mut a = Content::new();
        a.set_cell("t", "r", "c", "1");
        let mut b = Content::new();
        b.set_cell("t", "r", "c", 1);
        assert_ne!(
            Reconciler::fingerprint_of(&a).unwrap(),
            Reconciler::fingerprint_of(&b).unwrap()
        );
    }

    #[test]
    fn second_identical_save_has_nothing_pending() {
        let mode = tabular();
        let mut reconciler = Reconciler::new();

        let steps = plan_save(&encode(&pets(), &mode).unwrap());
        let pending = reconciler.pending(steps).unwrap();
        assert_eq!(pending.len(), 2);
        for (step, fingerprint) in pending {
            reconciler.record(step.target, fingerprint);
        }

        let steps = plan_save(&encode(&pets(), &mode).unwrap());
        assert!(reconciler.pending(steps).unwrap().is_empty());
    }

    #[test]
    fn only_changed_table_is_pending() {
        let mode = tabular();
        let mut reconciler = Reconciler::new();
        for (step, fingerprint) in reconciler
            .pending(plan_save(&encode(&pets(), &mode).unwrap()))
            .unwrap()
        {
            reconciler.record(step.target, fingerprint);
        }

        let mut content = pets();
        content.set_cell("toys", "ball", "color", "red");
        let pending = reconciler
            .pending(plan_save(&encode(&content, &mode).unwrap()))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0.target.db_table(), "toys");
    }

    #[test]
    fn cleared_cache_writes_again() {
        let mode = tabular();
        let mut reconciler = Reconciler::new();
        for (step, fingerprint) in reconciler
            .pending(plan_save(&encode(&pets(), &mode).unwrap()))
            .unwrap()
        {
            reconciler.record(step.target, fingerprint);
        }
        reconciler.clear();
        let pending = reconciler
            .pending(plan_save(&encode(&pets(), &mode).unwrap()))
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn loaded_fingerprint_matches_save() {
        let mode = DatabasePersisterConfig::json().resolve().unwrap();
        let mut reconciler = Reconciler::new();
        let content = pets();

        let step = plan_save(&encode(&content, &mode).unwrap()).remove(0);
        let fingerprint = reconciler.fingerprint_loaded(
            &step.db_table,
            &Loaded::Store {
                store_column: "store",
                content: &content,
            },
        )
        .unwrap();
        assert_eq!(fingerprint, reconciler.fingerprint_step(&step).unwrap());

        assert!(!reconciler.is_synced(&step.target, &fingerprint));
        reconciler.record(step.target.clone(), fingerprint);
        assert!(reconciler.is_synced(&step.target, &fingerprint));
        assert!(reconciler.pending(vec![step]).unwrap().is_empty());
    }

    fn booleans_as_numbers(row: &mut DbRow) {
        for value in row.values_mut() {
            if let serde_json::Value::Bool(flag) = value {
                *value = serde_json::Value::from(i64::from(*flag));
            }
        }
    }

    #[test]
    fn normalized_save_matches_narrowed_load() {
        let mode = tabular();
        let mut reconciler = Reconciler::with_row_normalizer(booleans_as_numbers);
        let mut content = Content::new();
        content.set_cell("pets", "fido", "good", true);

        let step = plan_save(&encode(&content, &mode).unwrap()).remove(0);
        let written = reconciler.fingerprint_step(&step).unwrap();
        reconciler.record(step.target.clone(), written);

        // What the medium gives back: the boolean as a number.
        let mut narrowed = Table::new();
        narrowed.insert("fido".into(), Row::from([("good".to_string(), CellValue::Number(1.0))]));
        let read = reconciler
            .fingerprint_loaded(
                &step.db_table,
                &Loaded::Table {
                    table_id: "pets",
                    table: &narrowed,
                },
            )
            .unwrap();
        assert!(reconciler.is_synced(&step.target, &read));

        // Saving the same content again writes nothing.
        assert!(reconciler.pending(vec![step]).unwrap().is_empty());
        assert_ne!(
            Reconciler::new().fingerprint_step(&plan_save(&encode(&content, &mode).unwrap())[0]).unwrap(),
            read
        );
    }

    #[test]
    fn merge_unchanged_json() {
        let reconciler = Reconciler::new();
        let merge = reconciler
            .merge(ExternalSnapshot::Json(Some(pets())), &pets())
            .unwrap();
        assert!(!merge.changed);
        assert_eq!(merge.content, pets());
    }

    #[test]
    fn merge_missing_json_row_keeps_current() {
        let merge = Reconciler::new()
            .merge(ExternalSnapshot::Json(None), &pets())
            .unwrap();
        assert!(!merge.changed);
        assert_eq!(merge.content, pets());
    }

    #[test]
    fn merge_tabular_replaces_only_read_tables() {
        let mut current = pets();
        current.set_cell("local", "x", "y", 1);

        let mut incoming = Table::new();
        incoming.insert(
            "felix".into(),
            Row::from([("species".to_string(), CellValue::from("cat"))]),
        );

        let merge = Reconciler::new()
            .merge(
                ExternalSnapshot::Tabular {
                    tables: vec![("pets".into(), incoming.clone())],
                    values: None,
                },
                &current,
            )
            .unwrap();

        assert!(merge.changed);
        assert_eq!(merge.content.tables["pets"], incoming);
        assert_eq!(merge.content.cell("local", "x", "y"), Some(&1.into()));
    }
}
