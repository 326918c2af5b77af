//! SQLite store for the position registry.
//!
//! Decimal values are stored as canonical decimal strings so a restart
//! restores quantities exactly.

use crate::position::{ActivePosition, PositionStatus};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub struct PositionStore {
    conn: Connection,
}

impl PositionStore {
    /// Open (and initialize) the store at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;
        info!("Position store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                entry_timestamp INTEGER NOT NULL,
                spot_qty TEXT NOT NULL,
                perp_qty TEXT NOT NULL,
                entry_spread TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            "#,
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    pub fn insert(&self, position: &ActivePosition) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO positions (id, symbol, entry_timestamp, spot_qty, perp_qty,
                                   entry_spread, total_fees, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                position.id,
                position.symbol,
                position.entered_at.timestamp(),
                position.spot_qty.to_string(),
                position.perp_qty.to_string(),
                position.entry_spread.to_string(),
                position.total_fees.to_string(),
                position.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: PositionStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE positions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        anyhow::ensure!(updated == 1, "no position row with id {}", id);
        Ok(())
    }

    pub fn update_quantities(
        &self,
        id: &str,
        spot_qty: Decimal,
        perp_qty: Decimal,
        total_fees: Decimal,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE positions SET spot_qty = ?1, perp_qty = ?2, total_fees = ?3 WHERE id = ?4",
            params![
                spot_qty.to_string(),
                perp_qty.to_string(),
                total_fees.to_string(),
                id
            ],
        )?;
        anyhow::ensure!(updated == 1, "no position row with id {}", id);
        Ok(())
    }

    /// Rows with status OPEN or CLOSING, the ones startup must reconcile.
    pub fn load_unclosed(&self) -> Result<Vec<ActivePosition>> {
        self.query_rows(
            "SELECT id, symbol, entry_timestamp, spot_qty, perp_qty, entry_spread, total_fees, status
             FROM positions WHERE status IN ('OPEN', 'CLOSING') ORDER BY entry_timestamp",
        )
    }

    pub fn load_all(&self) -> Result<Vec<ActivePosition>> {
        self.query_rows(
            "SELECT id, symbol, entry_timestamp, spot_qty, perp_qty, entry_spread, total_fees, status
             FROM positions ORDER BY entry_timestamp",
        )
    }

    fn query_rows(&self, sql: &str) -> Result<Vec<ActivePosition>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut positions = Vec::new();
        for row in rows {
            let (id, symbol, ts, spot, perp, spread, fees, status) = row?;
            let entered_at = Utc
                .timestamp_opt(ts, 0)
                .single()
                .with_context(|| format!("invalid entry_timestamp {} for {}", ts, id))?;
            positions.push(ActivePosition::from_stored(
                id,
                symbol,
                entered_at,
                parse_decimal(&spot)?,
                parse_decimal(&perp)?,
                parse_decimal(&spread)?,
                parse_decimal(&fees)?,
                PositionStatus::parse(&status)?,
            ));
        }
        Ok(positions)
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("invalid decimal {:?} in positions table", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> ActivePosition {
        ActivePosition::open("DOGEUSDT", dec!(10000), dec!(10000), dec!(0.003), dec!(1.2)).unwrap()
    }

    #[test]
    fn insert_and_load_round_trip() {
        let store = PositionStore::open_in_memory().unwrap();
        let position = sample();
        store.insert(&position).unwrap();

        let loaded = store.load_unclosed().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, position.id);
        assert_eq!(loaded[0].spot_qty, dec!(10000));
        assert_eq!(loaded[0].entry_spread, dec!(0.003));
        assert_eq!(loaded[0].status, PositionStatus::Open);
        assert_eq!(loaded[0].entered_at.timestamp(), position.entered_at.timestamp());
    }

    #[test]
    fn closed_rows_are_not_reloaded() {
        let store = PositionStore::open_in_memory().unwrap();
        let position = sample();
        store.insert(&position).unwrap();
        store
            .update_status(&position.id, PositionStatus::Closed)
            .unwrap();

        assert!(store.load_unclosed().unwrap().is_empty());
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn quantity_updates_persist() {
        let store = PositionStore::open_in_memory().unwrap();
        let position = sample();
        store.insert(&position).unwrap();
        store
            .update_quantities(&position.id, dec!(5000), dec!(5000), dec!(2.4))
            .unwrap();

        let loaded = store.load_unclosed().unwrap();
        assert_eq!(loaded[0].spot_qty, dec!(5000));
        assert_eq!(loaded[0].total_fees, dec!(2.4));
    }

    #[test]
    fn updating_missing_row_errors() {
        let store = PositionStore::open_in_memory().unwrap();
        assert!(store.update_status("absent", PositionStatus::Closed).is_err());
    }
}
