//! SQLite store backend

use super::traits::{OpenStore, RecordStore, StoreError, StoreResult};
use crate::model::{ChangeRecord, EntityKind, Operation};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed record store
///
/// One table keyed by (entity, id); the field map is stored as a JSON
/// column and queried with `json_extract`, so fan-out lookups need no
/// per-entity schema. Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                entity TEXT NOT NULL,
                id TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                PRIMARY KEY (entity, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_entity
                ON records(entity);
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Rebuild a record from a stored row. Stored rows are snapshots, so
    /// they come back with `Load` semantics regardless of the operation
    /// that wrote them.
    fn row_to_record(
        entity: EntityKind,
        id: String,
        schema: String,
        fields_json: String,
    ) -> StoreResult<ChangeRecord> {
        let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)?;
        Ok(ChangeRecord::new(schema, entity, Operation::Load, id, fields))
    }
}

impl RecordStore for SqliteStore {
    fn upsert(&self, record: &ChangeRecord) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let fields_json = serde_json::to_string(&record.fields)?;

        conn.execute(
            r#"
            INSERT INTO records (entity, id, schema_name, fields_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity, id) DO UPDATE SET
                schema_name = excluded.schema_name,
                fields_json = excluded.fields_json
            "#,
            params![record.entity.table(), record.key, record.schema, fields_json],
        )?;

        Ok(())
    }

    fn get(&self, entity: EntityKind, key: &str) -> StoreResult<Option<ChangeRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, schema_name, fields_json FROM records WHERE entity = ?1 AND id = ?2",
                params![entity.table(), key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, schema, fields_json)) => {
                Ok(Some(Self::row_to_record(entity, id, schema, fields_json)?))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, entity: EntityKind, key: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM records WHERE entity = ?1 AND id = ?2",
            params![entity.table(), key],
        )?;
        Ok(affected > 0)
    }

    fn find_by_field(
        &self,
        entity: EntityKind,
        field: &str,
        value: &str,
    ) -> StoreResult<Vec<ChangeRecord>> {
        self.find_by_fields(entity, &[(field, value)])
    }

    fn find_by_fields(
        &self,
        entity: EntityKind,
        criteria: &[(&str, &str)],
    ) -> StoreResult<Vec<ChangeRecord>> {
        let conn = self.conn.lock().unwrap();

        // Absent fields compare as '' so similarity grouping treats missing
        // and empty values as equal.
        let mut sql = String::from(
            "SELECT id, schema_name, fields_json FROM records WHERE entity = ?1",
        );
        for i in 0..criteria.len() {
            let base = 2 + i * 2;
            sql.push_str(&format!(
                " AND COALESCE(json_extract(fields_json, '$.' || ?{}), '') = ?{}",
                base,
                base + 1
            ));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let mut args: Vec<String> = vec![entity.table().to_string()];
        for (field, value) in criteria {
            args.push((*field).to_string());
            args.push((*value).to_string());
        }

        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, schema, fields_json) = row?;
            records.push(Self::row_to_record(entity, id, schema, fields_json)?);
        }
        Ok(records)
    }

    fn count(&self, entity: EntityKind) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity = ?1",
            params![entity.table()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}
