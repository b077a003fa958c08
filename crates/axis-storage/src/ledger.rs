//! Fulfillment ledger

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::Database;
use crate::error::StorageError;
use crate::record::{FulfillmentRecord, FulfillmentState};
use crate::Result;

pub struct FulfillmentLedger {
    /// In-memory record cache
    records: Arc<RwLock<HashMap<String, FulfillmentRecord>>>,
    db: Database,
}

impl FulfillmentLedger {
    pub fn new(db: Database) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            db,
        }
    }

    /// Open a ledger and load every stored record
    pub fn open(db: Database) -> Result<Self> {
        let ledger = Self::new(db);
        ledger.load()?;
        Ok(ledger)
    }

    /// Record a new attempt in the pending state
    pub fn create(&self, isbn: &str, vault_id: &str, book_dir: &str) -> Result<FulfillmentRecord> {
        let record = FulfillmentRecord::new(
            isbn.to_string(),
            vault_id.to_string(),
            book_dir.to_string(),
        );

        self.save_record(&record)?;
        self.records
            .write()
            .insert(record.id.clone(), record.clone());

        tracing::info!(
            fulfillment_id = %record.id,
            isbn = %record.isbn,
            "Recorded fulfillment"
        );

        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<FulfillmentRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    pub fn mark_downloading(&self, id: &str) -> Result<FulfillmentRecord> {
        self.transition(id, FulfillmentState::Downloading, None)
    }

    pub fn complete(&self, id: &str) -> Result<FulfillmentRecord> {
        self.transition(id, FulfillmentState::Completed, None)
    }

    /// Mark the attempt failed, keeping the user-facing reason
    pub fn fail(&self, id: &str, reason: &str) -> Result<FulfillmentRecord> {
        self.transition(id, FulfillmentState::Failed, Some(reason.to_string()))
    }

    pub fn cancel(&self, id: &str) -> Result<FulfillmentRecord> {
        self.transition(id, FulfillmentState::Cancelled, None)
    }

    /// Every record, newest first
    pub fn list(&self) -> Vec<FulfillmentRecord> {
        let mut records: Vec<FulfillmentRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn latest_for_isbn(&self, isbn: &str) -> Option<FulfillmentRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.isbn == isbn)
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Load records from database
    pub fn load(&self) -> Result<()> {
        let records = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, isbn, vault_id, book_dir, state, error, created_at, completed_at
                 FROM fulfillments",
            )?;

            let records: Vec<FulfillmentRecord> = stmt
                .query_map([], |row| {
                    let state_str: String = row.get(4)?;
                    let state: FulfillmentState =
                        state_str.parse().unwrap_or(FulfillmentState::Failed);

                    let created_str: String = row.get(6)?;
                    let completed_str: Option<String> = row.get(7)?;

                    Ok(FulfillmentRecord {
                        id: row.get(0)?,
                        isbn: row.get(1)?,
                        vault_id: row.get(2)?,
                        book_dir: row.get(3)?,
                        state,
                        error: row.get(5)?,
                        created_at: parse_timestamp(&created_str).unwrap_or_else(Utc::now),
                        completed_at: completed_str.as_deref().and_then(parse_timestamp),
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();

            Ok(records)
        })?;

        tracing::debug!(count = records.len(), "Loaded fulfillment ledger");

        let mut cache = self.records.write();
        for record in records {
            cache.insert(record.id.clone(), record);
        }

        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        target: FulfillmentState,
        error: Option<String>,
    ) -> Result<FulfillmentRecord> {
        let mut record = self.get(id)?;

        if !record.state.can_transition_to(target) {
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                from: record.state.to_string(),
                to: target.to_string(),
            });
        }

        record.state = target;
        record.error = error;
        if target.is_terminal() {
            record.completed_at = Some(Utc::now());
        }

        self.save_record(&record)?;
        self.records
            .write()
            .insert(id.to_string(), record.clone());

        match target {
            FulfillmentState::Failed => {
                tracing::warn!(fulfillment_id = %id, error = ?record.error, "Fulfillment failed")
            }
            _ => tracing::info!(fulfillment_id = %id, state = %target, "Fulfillment updated"),
        }

        Ok(record)
    }

    fn save_record(&self, record: &FulfillmentRecord) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO fulfillments
                 (id, isbn, vault_id, book_dir, state, error, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.id,
                    record.isbn,
                    record.vault_id,
                    record.book_dir,
                    record.state.as_str(),
                    record.error,
                    record.created_at.to_rfc3339(),
                    record.completed_at.map(|dt| dt.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }
}

impl Clone for FulfillmentLedger {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            db: self.db.clone(),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
