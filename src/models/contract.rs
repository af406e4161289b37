#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractStatus {
    Active,
    Closed,
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractStatus::Active => write!(f, "ACTIVE"),
            ContractStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

impl FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(ContractStatus::Active),
            "CLOSED" => Ok(ContractStatus::Closed),
            other => Err(format!("unknown contract status: {other}")),
        }
    }
}

/// One round-trip trade in progress: a filled buy waiting for its
/// take-profit sell. `buy_order_id` is immutable and unique; it is the
/// idempotency key for fill processing. `current_order_id` tracks the live
/// sell order while the contract is active and is frozen on close. It is
/// `None` when the sell leg could not be posted yet; the monitor re-places
/// the sell in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: i64,
    pub market: String,
    pub buy_price: Decimal,
    pub buy_amount: Decimal,
    pub target_price: Decimal,
    pub status: ContractStatus,
    pub buy_order_id: String,
    pub current_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sell_price: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub profit_rate: Option<Decimal>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Insert payload for a freshly filled buy.
#[derive(Debug, Clone)]
pub struct NewContract {
    pub market: String,
    pub buy_price: Decimal,
    pub buy_amount: Decimal,
    pub target_price: Decimal,
    pub buy_order_id: String,
    pub current_order_id: Option<String>,
}
