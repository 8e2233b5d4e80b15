//! Payment references and their association with (subject, resource).
//!
//! A reference is a random 32-byte public key, base58-encoded. It is attached
//! to the payer's transaction so the settlement can be found on the ledger.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::to_chrono;
use crate::constants::REFERENCE_LEN;
use crate::error::X402Error;
use crate::storage::{lock, open_sqlite};

/// Generate a fresh reference from the OS CSPRNG.
///
/// Base58 of 32 bytes is 43 or 44 characters; shorter encodings are redrawn
/// so every reference has the same length.
pub fn generate_reference() -> String {
    loop {
        let mut bytes = [0u8; 32];
        rand::fill(&mut bytes);
        let encoded = bs58::encode(bytes).into_string();
        if encoded.len() == REFERENCE_LEN {
            return encoded;
        }
    }
}

/// Check that `address` is a base58-encoded 32-byte public key.
pub fn validate_address(address: &str) -> Result<(), X402Error> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| X402Error::InvalidAddress(format!("{address}: {e}")))?;
    if bytes.len() != 32 {
        return Err(X402Error::InvalidAddress(format!(
            "{address}: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Stored association between a reference and what it pays for.
///
/// `amount`/`currency`/`recipient` are refreshed each time the intent is
/// rebuilt; the reference and timestamps never change once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRecord {
    pub reference: String,
    pub subject_id: String,
    pub resource_id: String,
    pub amount: u64,
    pub currency: crate::price::Currency,
    pub recipient: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ReferenceRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Storage for issued references.
///
/// Implementations must make [`ReferenceStore::get_or_insert`] atomic per
/// (subject, resource) key so racing requests agree on one reference.
pub trait ReferenceStore: Send + Sync {
    /// Return the live, unconfirmed record for `(subject, resource)`, or store
    /// `candidate` if there is none. A confirmed reference is never handed
    /// out again; it stays retrievable through [`ReferenceStore::find`].
    /// Price fields of a reused record are updated from `candidate`.
    fn get_or_insert(
        &self,
        candidate: ReferenceRecord,
        now: DateTime<Utc>,
    ) -> Result<ReferenceRecord, X402Error>;

    /// Look a record up by its reference.
    fn find(&self, reference: &str) -> Result<Option<ReferenceRecord>, X402Error>;

    /// Mark a reference as settled so later checks can short-circuit.
    fn mark_confirmed(&self, reference: &str, settlement_id: &str) -> Result<(), X402Error>;

    /// Settlement id if the reference was confirmed before.
    fn confirmed_settlement(&self, reference: &str) -> Result<Option<String>, X402Error>;

    /// Drop unconfirmed records that expired before `now`, and confirmed ones
    /// once `confirmed_retention` has passed since they expired.
    fn purge_expired(
        &self,
        now: DateTime<Utc>,
        confirmed_retention: Duration,
    ) -> Result<usize, X402Error>;
}

type Key = (String, String);

/// In-memory reference store backed by DashMap. Lost on restart.
#[derive(Default)]
pub struct InMemoryReferenceStore {
    records: DashMap<String, ReferenceRecord>,
    /// Reference currently offered for each (subject, resource).
    current: DashMap<Key, String>,
    confirmed: DashMap<String, String>,
}

impl InMemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ReferenceStore for InMemoryReferenceStore {
    fn get_or_insert(
        &self,
        candidate: ReferenceRecord,
        now: DateTime<Utc>,
    ) -> Result<ReferenceRecord, X402Error> {
        let key = (candidate.subject_id.clone(), candidate.resource_id.clone());
        // The entry guard holds the shard lock for the whole check-then-set.
        match self.current.entry(key) {
            Entry::Occupied(mut o) => {
                let reference = o.get().clone();
                if !self.confirmed.contains_key(&reference) {
                    if let Some(mut record) = self.records.get_mut(&reference) {
                        if record.is_live(now) {
                            record.amount = candidate.amount;
                            record.currency = candidate.currency;
                            record.recipient = candidate.recipient;
                            return Ok(record.clone());
                        }
                    }
                    self.records.remove(&reference);
                }
                self.records
                    .insert(candidate.reference.clone(), candidate.clone());
                o.insert(candidate.reference.clone());
                Ok(candidate)
            }
            Entry::Vacant(v) => {
                self.records
                    .insert(candidate.reference.clone(), candidate.clone());
                v.insert(candidate.reference.clone());
                Ok(candidate)
            }
        }
    }

    fn find(&self, reference: &str) -> Result<Option<ReferenceRecord>, X402Error> {
        Ok(self.records.get(reference).map(|r| r.clone()))
    }

    fn mark_confirmed(&self, reference: &str, settlement_id: &str) -> Result<(), X402Error> {
        self.confirmed
            .entry(reference.to_string())
            .or_insert_with(|| settlement_id.to_string());
        Ok(())
    }

    fn confirmed_settlement(&self, reference: &str) -> Result<Option<String>, X402Error> {
        Ok(self.confirmed.get(reference).map(|s| s.clone()))
    }

    fn purge_expired(
        &self,
        now: DateTime<Utc>,
        confirmed_retention: Duration,
    ) -> Result<usize, X402Error> {
        let retention = to_chrono(confirmed_retention);
        let before = self.records.len();
        self.records.retain(|reference, record| {
            if self.confirmed.contains_key(reference) {
                now < record.expires_at + retention
            } else {
                record.is_live(now)
            }
        });
        self.confirmed
            .retain(|reference, _| self.records.contains_key(reference));
        self.current
            .retain(|_, reference| self.records.contains_key(reference));
        Ok(before.saturating_sub(self.records.len()))
    }
}

/// Persistent reference store backed by SQLite.
pub struct SqliteReferenceStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteReferenceStore {
    pub fn open(path: &str) -> Result<Self, X402Error> {
        let conn = open_sqlite(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS payment_references (
                reference TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                recipient TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payment_references_key
                ON payment_references (subject_id, resource_id);
            CREATE TABLE IF NOT EXISTS confirmed_references (
                reference TEXT PRIMARY KEY,
                settlement_id TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

const RECORD_COLUMNS: &str =
    "reference, subject_id, resource_id, amount, currency, recipient, created_at, expires_at";

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ReferenceRecord, String, String)> {
    let millis = |i: usize| -> rusqlite::Result<DateTime<Utc>> {
        let ms: i64 = row.get(i)?;
        Ok(DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC))
    };
    Ok((
        ReferenceRecord {
            reference: row.get(0)?,
            subject_id: row.get(1)?,
            resource_id: row.get(2)?,
            amount: 0,
            currency: crate::price::Currency::Sol,
            recipient: row.get(5)?,
            created_at: millis(6)?,
            expires_at: millis(7)?,
        },
        row.get(3)?,
        row.get(4)?,
    ))
}

/// Finish decoding the columns stored as text.
fn complete(
    (mut record, amount, currency): (ReferenceRecord, String, String),
) -> Result<ReferenceRecord, X402Error> {
    record.amount = amount
        .parse()
        .map_err(|_| X402Error::Storage(format!("corrupt amount '{amount}'")))?;
    record.currency = serde_json::from_str(&currency)?;
    Ok(record)
}

impl ReferenceStore for SqliteReferenceStore {
    fn get_or_insert(
        &self,
        candidate: ReferenceRecord,
        now: DateTime<Utc>,
    ) -> Result<ReferenceRecord, X402Error> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let currency = serde_json::to_string(&candidate.currency)?;

        let live = tx
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM payment_references
                     WHERE subject_id = ?1 AND resource_id = ?2 AND expires_at > ?3
                       AND reference NOT IN (SELECT reference FROM confirmed_references)
                     ORDER BY created_at DESC LIMIT 1"
                ),
                rusqlite::params![
                    candidate.subject_id,
                    candidate.resource_id,
                    now.timestamp_millis()
                ],
                record_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
            .map(complete)
            .transpose()?;

        let stored = match live {
            Some(mut live) => {
                tx.execute(
                    "UPDATE payment_references SET amount = ?1, currency = ?2, recipient = ?3
                     WHERE reference = ?4",
                    rusqlite::params![
                        candidate.amount.to_string(),
                        currency,
                        candidate.recipient,
                        live.reference
                    ],
                )?;
                live.amount = candidate.amount;
                live.currency = candidate.currency;
                live.recipient = candidate.recipient;
                live
            }
            None => {
                tx.execute(
                    "DELETE FROM payment_references
                     WHERE subject_id = ?1 AND resource_id = ?2
                       AND reference NOT IN (SELECT reference FROM confirmed_references)",
                    rusqlite::params![candidate.subject_id, candidate.resource_id],
                )?;
                tx.execute(
                    "INSERT INTO payment_references
                     (reference, subject_id, resource_id, amount, currency, recipient, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        candidate.reference,
                        candidate.subject_id,
                        candidate.resource_id,
                        candidate.amount.to_string(),
                        currency,
                        candidate.recipient,
                        candidate.created_at.timestamp_millis(),
                        candidate.expires_at.timestamp_millis()
                    ],
                )?;
                candidate
            }
        };
        tx.commit()?;
        Ok(stored)
    }

    fn find(&self, reference: &str) -> Result<Option<ReferenceRecord>, X402Error> {
        let conn = lock(&self.conn);
        let row = conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM payment_references WHERE reference = ?1"),
            rusqlite::params![reference],
            record_from_row,
        );
        match row {
            Ok(parts) => complete(parts).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn mark_confirmed(&self, reference: &str, settlement_id: &str) -> Result<(), X402Error> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT OR IGNORE INTO confirmed_references (reference, settlement_id) VALUES (?1, ?2)",
            rusqlite::params![reference, settlement_id],
        )?;
        Ok(())
    }

    fn confirmed_settlement(&self, reference: &str) -> Result<Option<String>, X402Error> {
        let conn = lock(&self.conn);
        match conn.query_row(
            "SELECT settlement_id FROM confirmed_references WHERE reference = ?1",
            rusqlite::params![reference],
            |row| row.get::<_, String>(0),
        ) {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn purge_expired(
        &self,
        now: DateTime<Utc>,
        confirmed_retention: Duration,
    ) -> Result<usize, X402Error> {
        let cutoff = now - to_chrono(confirmed_retention);
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let purged = tx.execute(
            "DELETE FROM payment_references
             WHERE (expires_at <= ?1
                    AND reference NOT IN (SELECT reference FROM confirmed_references))
                OR (expires_at <= ?2
                    AND reference IN (SELECT reference FROM confirmed_references))",
            rusqlite::params![now.timestamp_millis(), cutoff.timestamp_millis()],
        )?;
        tx.execute(
            "DELETE FROM confirmed_references
             WHERE reference NOT IN (SELECT reference FROM payment_references)",
            [],
        )?;
        tx.commit()?;
        Ok(purged)
    }
}
