//! In-process implementation of every store and migration-target trait.
//!
//! One mutex guards all state, so each operation is atomic the same way a
//! single Postgres transaction is. Used by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use super::temporal::{check_no_overlap, normalize_instant, plan_price_change, validate_code, PricePlan};
use super::{
    InventoryHistoryEntry, InventoryObservation, InventorySnapshot, InventoryStore,
    PriceHistoryStore, PriceInterval, PriceOutcome, ProductCatalog,
};
use crate::error::{StoreError, StoreResult};
use crate::migrations::ledger::{
    BackendError, BackendResult, MigrationLedger, MigrationRecord, MigrationTarget,
};

#[derive(Default)]
struct MemoryState {
    ledger_exists: bool,
    ledger: BTreeMap<String, MigrationRecord>,
    executed: Vec<String>,
    products: HashMap<String, Option<String>>,
    prices: BTreeMap<String, Vec<PriceInterval>>,
    snapshots: HashMap<String, InventorySnapshot>,
    history: Vec<InventoryHistoryEntry>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_product(&self, code: &str) -> StoreResult<()> {
        if self.products.contains_key(code) {
            Ok(())
        } else {
            Err(StoreError::UnknownProduct(code.to_string()))
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_marker: Option<String>,
    missing_tool: Option<String>,
    pending_ping_failures: AtomicU32,
    concurrent_record: Option<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts containing `marker` fail with an execution error.
    pub fn with_failing_script(mut self, marker: impl Into<String>) -> Self {
        self.failing_marker = Some(marker.into());
        self
    }

    /// `check_tooling` reports `tool` as missing.
    pub fn with_missing_tool(mut self, tool: impl Into<String>) -> Self {
        self.missing_tool = Some(tool.into());
        self
    }

    /// Another writer records `filename` with `content_hash` after the
    /// applier's lookup but before its `apply_migration` takes the lock.
    pub fn with_concurrent_record(
        mut self,
        filename: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        self.concurrent_record = Some((filename.into(), content_hash.into()));
        self
    }

    /// The next `n` pings fail.
    pub fn fail_pings(&self, n: u32) {
        self.pending_ping_failures.store(n, Ordering::SeqCst);
    }

    /// Every script executed so far, in order (base schema and migrations).
    pub async fn executed_scripts(&self) -> Vec<String> {
        self.state.lock().await.executed.clone()
    }

    fn check_script(&self, sql: &str) -> BackendResult<()> {
        match &self.failing_marker {
            Some(marker) if sql.contains(marker.as_str()) => Err(BackendError::Execution(
                format!("statement failed near '{}'", marker),
            )),
            _ => Ok(()),
        }
    }
}

// ── Migration ledger / target ─────────────────────────────────

#[async_trait]
impl MigrationLedger for MemoryStore {
    async fn ensure_exists(&self) -> BackendResult<()> {
        self.state.lock().await.ledger_exists = true;
        Ok(())
    }

    async fn lookup(&self, filename: &str) -> BackendResult<Option<MigrationRecord>> {
        let state = self.state.lock().await;
        if !state.ledger_exists {
            return Err(BackendError::Execution(
                "ledger table does not exist".to_string(),
            ));
        }
        Ok(state.ledger.get(filename).cloned())
    }

    async fn insert_if_absent(&self, filename: &str, content_hash: &str) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        if state.ledger.contains_key(filename) {
            return Ok(false);
        }
        state.ledger.insert(
            filename.to_string(),
            MigrationRecord {
                filename: filename.to_string(),
                content_hash: content_hash.to_string(),
                applied_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn list_applied(&self) -> BackendResult<Vec<MigrationRecord>> {
        Ok(self.state.lock().await.ledger.values().cloned().collect())
    }
}

#[async_trait]
impl MigrationTarget for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn check_tooling(&self) -> BackendResult<()> {
        match &self.missing_tool {
            Some(tool) => Err(BackendError::ToolUnavailable(tool.clone())),
            None => Ok(()),
        }
    }

    async fn ping(&self) -> BackendResult<()> {
        let remaining = self.pending_ping_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_ping_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Execution("store unreachable".to_string()));
        }
        Ok(())
    }

    async fn execute_script(&self, sql: &str) -> BackendResult<()> {
        self.check_script(sql)?;
        self.state.lock().await.executed.push(sql.to_string());
        Ok(())
    }

    async fn apply_migration(
        &self,
        filename: &str,
        content_hash: &str,
        sql: &str,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock().await;
        if let Some((winner, hash)) = &self.concurrent_record {
            if winner == filename && !state.ledger.contains_key(filename) {
                state.ledger.insert(
                    filename.to_string(),
                    MigrationRecord {
                        filename: filename.to_string(),
                        content_hash: hash.clone(),
                        applied_at: Utc::now(),
                    },
                );
            }
        }
        if state.ledger.contains_key(filename) {
            return Ok(false);
        }
        self.check_script(sql)?;
        state.executed.push(sql.to_string());
        state.ledger.insert(
            filename.to_string(),
            MigrationRecord {
                filename: filename.to_string(),
                content_hash: content_hash.to_string(),
                applied_at: Utc::now(),
            },
        );
        Ok(true)
    }
}

// ── Catalog stores ────────────────────────────────────────────

#[async_trait]
impl ProductCatalog for MemoryStore {
    async fn ensure_product(&self, code: &str, name: Option<&str>) -> StoreResult<bool> {
        validate_code(code)?;
        let mut state = self.state.lock().await;
        if state.products.contains_key(code) {
            return Ok(false);
        }
        state
            .products
            .insert(code.to_string(), name.map(str::to_string));
        Ok(true)
    }
}

#[async_trait]
impl PriceHistoryStore for MemoryStore {
    async fn record_price(
        &self,
        code: &str,
        price: Option<Decimal>,
        effective_from: DateTime<Utc>,
    ) -> StoreResult<PriceOutcome> {
        let mut state = self.state.lock().await;
        let open = state
            .prices
            .get(code)
            .and_then(|rows| rows.iter().find(|r| r.is_open()).cloned());

        let plan = plan_price_change(code, open.as_ref(), price, effective_from)?;
        if !matches!(plan, PricePlan::NoPrice | PricePlan::Unchanged) {
            state.require_product(code)?;
        }

        match plan {
            PricePlan::NoPrice => Ok(PriceOutcome::NoPrice),
            PricePlan::Unchanged => Ok(PriceOutcome::Unchanged),
            PricePlan::Open { price, at } => {
                let id = state.next_id();
                let row = PriceInterval {
                    id,
                    code: code.to_string(),
                    price,
                    effective_from: at,
                    effective_to: None,
                };
                let rows = state.prices.entry(code.to_string()).or_default();
                check_no_overlap(rows, &row)?;
                rows.push(row);
                debug!("Opened price interval for {} at {}", code, at);
                Ok(PriceOutcome::Opened)
            }
            PricePlan::Supersede {
                close_id,
                previous,
                price,
                at,
            } => {
                let id = state.next_id();
                let rows = state.prices.entry(code.to_string()).or_default();

                // Work on a copy so a rejected write leaves the pre-state.
                let mut next = rows.clone();
                if let Some(closing) = next.iter_mut().find(|r| r.id == close_id) {
                    closing.effective_to = Some(at);
                }
                let row = PriceInterval {
                    id,
                    code: code.to_string(),
                    price,
                    effective_from: at,
                    effective_to: None,
                };
                check_no_overlap(&next, &row)?;
                next.push(row);
                *rows = next;
                debug!("Superseded price for {}: {} -> {} at {}", code, previous, price, at);
                Ok(PriceOutcome::Superseded { previous })
            }
        }
    }

    async fn open_interval(&self, code: &str) -> StoreResult<Option<PriceInterval>> {
        let state = self.state.lock().await;
        Ok(state
            .prices
            .get(code)
            .and_then(|rows| rows.iter().find(|r| r.is_open()).cloned()))
    }

    async fn price_as_of(&self, code: &str, instant: DateTime<Utc>) -> StoreResult<Option<Decimal>> {
        let instant = normalize_instant(instant);
        let state = self.state.lock().await;
        Ok(state
            .prices
            .get(code)
            .and_then(|rows| rows.iter().find(|r| r.contains(instant)))
            .map(|r| r.price))
    }

    async fn price_history(&self, code: &str) -> StoreResult<Vec<PriceInterval>> {
        let state = self.state.lock().await;
        let mut rows = state.prices.get(code).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.effective_from);
        Ok(rows)
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn record_inventory(&self, observation: &InventoryObservation) -> StoreResult<()> {
        validate_code(&observation.code)?;
        let mut state = self.state.lock().await;
        state.require_product(&observation.code)?;

        let as_of = normalize_instant(observation.as_of);
        let id = state.next_id();
        state.history.push(InventoryHistoryEntry {
            id,
            code: observation.code.clone(),
            stock_total: observation.stock_total,
            reserved: observation.reserved,
            stock_free: observation.stock_free,
            as_of,
        });
        state.snapshots.insert(
            observation.code.clone(),
            InventorySnapshot {
                code: observation.code.clone(),
                stock_total: observation.stock_total,
                reserved: observation.reserved,
                stock_free: observation.stock_free,
                as_of_date: as_of.date_naive(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn snapshot(&self, code: &str) -> StoreResult<Option<InventorySnapshot>> {
        Ok(self.state.lock().await.snapshots.get(code).cloned())
    }

    async fn history(&self, code: &str) -> StoreResult<Vec<InventoryHistoryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|e| e.code == code)
            .cloned()
            .collect())
    }
}
