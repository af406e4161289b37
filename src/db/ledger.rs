//! Contract Ledger
//!
//! Durable persistence of contracts, trades and engine configuration.
//! Writes are atomic per statement and reads observe prior writes within the
//! process, so the check-then-write sequences in the engine stay correct
//! across restarts.
//!
//! SQLite has no decimal column type; every price/volume/profit value is
//! stored as TEXT and parsed back into `rust_decimal::Decimal` at the row
//! boundary so arithmetic never goes through floating point.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::models::{Contract, ContractStatus, NewContract, NewTrade, Trade, TradeKind};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("duplicate buy order id: {0}")]
    DuplicateBuyOrderId(String),

    #[error("corrupt {column} value in ledger: {value}")]
    CorruptColumn { column: &'static str, value: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Realized profit aggregate over SELL trades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfitSummary {
    pub total_profit: Decimal,
    pub sell_count: i64,
}

#[derive(sqlx::FromRow)]
struct ContractRow {
    id: i64,
    market: String,
    buy_price: String,
    buy_amount: String,
    target_price: String,
    status: String,
    buy_order_id: String,
    current_order_id: Option<String>,
    created_at: DateTime<Utc>,
    sell_price: Option<String>,
    profit: Option<String>,
    profit_rate: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

fn parse_decimal(column: &'static str, value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value).map_err(|_| LedgerError::CorruptColumn {
        column,
        value: value.to_string(),
    })
}

fn parse_decimal_opt(
    column: &'static str,
    value: Option<&str>,
) -> Result<Option<Decimal>, LedgerError> {
    value.map(|v| parse_decimal(column, v)).transpose()
}

impl TryFrom<ContractRow> for Contract {
    type Error = LedgerError;

    fn try_from(row: ContractRow) -> Result<Self, Self::Error> {
        let status = ContractStatus::from_str(&row.status).map_err(|_| {
            LedgerError::CorruptColumn {
                column: "status",
                value: row.status.clone(),
            }
        })?;

        Ok(Contract {
            id: row.id,
            market: row.market,
            buy_price: parse_decimal("buy_price", &row.buy_price)?,
            buy_amount: parse_decimal("buy_amount", &row.buy_amount)?,
            target_price: parse_decimal("target_price", &row.target_price)?,
            status,
            buy_order_id: row.buy_order_id,
            current_order_id: row.current_order_id,
            created_at: row.created_at,
            sell_price: parse_decimal_opt("sell_price", row.sell_price.as_deref())?,
            profit: parse_decimal_opt("profit", row.profit.as_deref())?,
            profit_rate: parse_decimal_opt("profit_rate", row.profit_rate.as_deref())?,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: i64,
    contract_id: i64,
    kind: String,
    price: String,
    amount: String,
    fee: String,
    profit: String,
    executed_at: DateTime<Utc>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = LedgerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let kind = TradeKind::from_str(&row.kind).map_err(|_| LedgerError::CorruptColumn {
            column: "kind",
            value: row.kind.clone(),
        })?;

        Ok(Trade {
            id: row.id,
            contract_id: row.contract_id,
            kind,
            price: parse_decimal("price", &row.price)?,
            amount: parse_decimal("amount", &row.amount)?,
            fee: parse_decimal("fee", &row.fee)?,
            profit: parse_decimal("profit", &row.profit)?,
            executed_at: row.executed_at,
        })
    }
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new ACTIVE contract. Rejects a duplicate `buy_order_id` so
    /// replayed fill events can never create a second contract.
    pub async fn create_contract(&self, contract: &NewContract) -> Result<i64, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO contracts (
                market, buy_price, buy_amount, target_price, status,
                buy_order_id, current_order_id, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&contract.market)
        .bind(contract.buy_price.to_string())
        .bind(contract.buy_amount.to_string())
        .bind(contract.target_price.to_string())
        .bind(ContractStatus::Active.to_string())
        .bind(&contract.buy_order_id)
        .bind(contract.current_order_id.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                LedgerError::DuplicateBuyOrderId(contract.buy_order_id.clone()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists_by_buy_order_id(&self, buy_order_id: &str) -> Result<bool, LedgerError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM contracts WHERE buy_order_id = ?1)")
                .bind(buy_order_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub async fn list_active(&self) -> Result<Vec<Contract>, LedgerError> {
        let rows: Vec<ContractRow> =
            sqlx::query_as("SELECT * FROM contracts WHERE status = 'ACTIVE' ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Contract::try_from).collect()
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Contract>, LedgerError> {
        let row: Option<ContractRow> = sqlx::query_as("SELECT * FROM contracts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Contract::try_from).transpose()
    }

    pub async fn find_by_current_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<Contract>, LedgerError> {
        let row: Option<ContractRow> =
            sqlx::query_as("SELECT * FROM contracts WHERE current_order_id = ?1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Contract::try_from).transpose()
    }

    /// Point the contract at a new live order id, or at NULL when the sell
    /// leg could not be posted and must be re-placed by the monitor.
    pub async fn update_current_order_id(
        &self,
        id: i64,
        order_id: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE contracts SET current_order_id = ?1 WHERE id = ?2")
            .bind(order_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close an ACTIVE contract with its settlement figures. Returns `false`
    /// when the contract was already closed; closed contracts are never
    /// modified again.
    pub async fn close_contract(
        &self,
        id: i64,
        sell_price: Decimal,
        profit: Decimal,
        profit_rate: Decimal,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            r#"
            UPDATE contracts
            SET status = 'CLOSED',
                sell_price = ?1,
                profit = ?2,
                profit_rate = ?3,
                finished_at = ?4
            WHERE id = ?5 AND status = 'ACTIVE'
            "#,
        )
        .bind(sell_price.to_string())
        .bind(profit.to_string())
        .bind(profit_rate.to_string())
        .bind(finished_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    pub async fn append_trade(&self, trade: &NewTrade) -> Result<i64, LedgerError> {
        let done = sqlx::query(
            r#"
            INSERT INTO trades (contract_id, kind, price, amount, fee, profit, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(trade.contract_id)
        .bind(trade.kind.to_string())
        .bind(trade.price.to_string())
        .bind(trade.amount.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.profit.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(done.last_insert_rowid())
    }

    /// All trades recorded for a contract, oldest first.
    pub async fn list_trades_for_contract(
        &self,
        contract_id: i64,
    ) -> Result<Vec<Trade>, LedgerError> {
        let rows: Vec<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE contract_id = ?1 ORDER BY id")
                .bind(contract_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    /// Most recently closed contracts, newest first.
    pub async fn list_closed(&self, limit: i64) -> Result<Vec<Contract>, LedgerError> {
        let rows: Vec<ContractRow> = sqlx::query_as(
            r#"
            SELECT * FROM contracts
            WHERE status = 'CLOSED'
            ORDER BY finished_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Contract::try_from).collect()
    }

    /// Total realized profit and trade count over SELL trades, summed in
    /// exact decimal arithmetic.
    pub async fn realized_profit_summary(&self) -> Result<ProfitSummary, LedgerError> {
        let profits: Vec<String> =
            sqlx::query_scalar("SELECT profit FROM trades WHERE kind = 'SELL'")
                .fetch_all(&self.pool)
                .await?;

        let mut total = Decimal::ZERO;
        for p in &profits {
            total += parse_decimal("profit", p)?;
        }

        Ok(ProfitSummary {
            total_profit: total,
            sell_count: profits.len() as i64,
        })
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    fn new_contract(buy_order_id: &str, buy_price: Decimal) -> NewContract {
        NewContract {
            market: "KRW-USDT".to_string(),
            buy_price,
            buy_amount: dec!(5),
            target_price: buy_price + dec!(5),
            buy_order_id: buy_order_id.to_string(),
            current_order_id: Some(buy_order_id.to_string()),
        }
    }

    async fn ledger() -> Ledger {
        let db = Database::connect_in_memory().await.unwrap();
        Ledger::new(db.pool.clone())
    }

    #[tokio::test]
    async fn test_create_and_list_active() {
        let ledger = ledger().await;

        let id = ledger
            .create_contract(&new_contract("buy-1", dec!(1420)))
            .await
            .unwrap();
        assert!(id > 0);

        let active = ledger.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].buy_price, dec!(1420));
        assert_eq!(active[0].target_price, dec!(1425));
        assert_eq!(active[0].status, ContractStatus::Active);
        assert!(ledger.exists_by_buy_order_id("buy-1").await.unwrap());
        assert!(!ledger.exists_by_buy_order_id("buy-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_buy_order_id_rejected() {
        let ledger = ledger().await;

        ledger
            .create_contract(&new_contract("buy-1", dec!(1400)))
            .await
            .unwrap();
        let err = ledger
            .create_contract(&new_contract("buy-1", dec!(1420)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateBuyOrderId(id) if id == "buy-1"));
    }

    #[tokio::test]
    async fn test_close_contract_is_final() {
        let ledger = ledger().await;

        let id = ledger
            .create_contract(&new_contract("buy-1", dec!(1420)))
            .await
            .unwrap();

        let closed = ledger
            .close_contract(id, dec!(1425), dec!(25), dec!(5) / dec!(1420), Utc::now())
            .await
            .unwrap();
        assert!(closed);

        // A second close must not touch the settled row.
        let closed_again = ledger
            .close_contract(id, dec!(9999), dec!(0), dec!(0), Utc::now())
            .await
            .unwrap();
        assert!(!closed_again);

        let contract = ledger.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(contract.status, ContractStatus::Closed);
        assert_eq!(contract.sell_price, Some(dec!(1425)));
        assert_eq!(contract.profit, Some(dec!(25)));
        assert!(contract.finished_at.is_some());
        assert!(ledger.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_current_order_id_allows_null() {
        let ledger = ledger().await;

        let id = ledger
            .create_contract(&new_contract("buy-1", dec!(1400)))
            .await
            .unwrap();

        ledger
            .update_current_order_id(id, Some("sell-1"))
            .await
            .unwrap();
        let found = ledger.find_by_current_order_id("sell-1").await.unwrap();
        assert_eq!(found.unwrap().id, id);

        ledger.update_current_order_id(id, None).await.unwrap();
        let contract = ledger.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(contract.current_order_id, None);
    }

    #[tokio::test]
    async fn test_trades_and_profit_summary() {
        let ledger = ledger().await;

        let id = ledger
            .create_contract(&new_contract("buy-1", dec!(1420)))
            .await
            .unwrap();

        ledger
            .append_trade(&NewTrade {
                contract_id: id,
                kind: TradeKind::Buy,
                price: dec!(1420),
                amount: dec!(5),
                fee: Decimal::ZERO,
                profit: Decimal::ZERO,
            })
            .await
            .unwrap();
        ledger
            .append_trade(&NewTrade {
                contract_id: id,
                kind: TradeKind::Sell,
                price: dec!(1425),
                amount: dec!(5),
                fee: Decimal::ZERO,
                profit: dec!(25),
            })
            .await
            .unwrap();

        let summary = ledger.realized_profit_summary().await.unwrap();
        assert_eq!(summary.sell_count, 1);
        assert_eq!(summary.total_profit, dec!(25));

        let trades = ledger.list_trades_for_contract(id).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].kind, TradeKind::Buy);
        assert_eq!(trades[0].price, dec!(1420));
        assert_eq!(trades[1].kind, TradeKind::Sell);
        assert_eq!(trades[1].profit, dec!(25));
        assert!(trades[0].executed_at <= trades[1].executed_at);
    }

    #[tokio::test]
    async fn test_config_upsert() {
        let ledger = ledger().await;

        assert_eq!(ledger.get_config("last_grid_config").await.unwrap(), None);

        ledger.set_config("last_grid_config", "v1").await.unwrap();
        ledger.set_config("last_grid_config", "v2").await.unwrap();

        assert_eq!(
            ledger.get_config("last_grid_config").await.unwrap(),
            Some("v2".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_closed_newest_first() {
        let ledger = ledger().await;

        for (i, price) in [dec!(1400), dec!(1420), dec!(1440)].iter().enumerate() {
            let id = ledger
                .create_contract(&new_contract(&format!("buy-{i}"), *price))
                .await
                .unwrap();
            ledger
                .close_contract(id, *price + dec!(5), dec!(25), dec!(0.01), Utc::now())
                .await
                .unwrap();
        }

        let closed = ledger.list_closed(2).await.unwrap();
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].buy_price, dec!(1440));
    }
}
