//! Test utilities: sample events and a shared registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;
use crate::registry::EventTypeRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub account_id: String,
    pub owner: String,
    pub at: DateTime<Utc>,
}

impl DomainEvent for AccountOpened {
    const EVENT_TYPE: &'static str = "AccountOpened";

    fn aggregate_id(&self) -> String {
        self.account_id.clone()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsDeposited {
    pub account_id: String,
    pub amount: i64,
    pub at: DateTime<Utc>,
}

impl DomainEvent for FundsDeposited {
    const EVENT_TYPE: &'static str = "FundsDeposited";

    fn aggregate_id(&self) -> String {
        self.account_id.clone()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.at
    }
}

pub fn opened(account_id: &str, owner: &str) -> AccountOpened {
    AccountOpened {
        account_id: account_id.to_string(),
        owner: owner.to_string(),
        at: Utc::now(),
    }
}

pub fn deposited(account_id: &str, amount: i64) -> FundsDeposited {
    FundsDeposited {
        account_id: account_id.to_string(),
        amount,
        at: Utc::now(),
    }
}

/// Registry knowing both sample event types.
pub fn registry() -> Arc<EventTypeRegistry> {
    let registry = EventTypeRegistry::new()
        .with_event::<AccountOpened>()
        .and_then(|r| r.with_event::<FundsDeposited>())
        .unwrap();
    Arc::new(registry)
}
