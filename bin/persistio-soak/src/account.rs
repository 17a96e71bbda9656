//! Account objects driven by the soak workload

use parking_lot::Mutex;
use persistio_common::{Error, Identity, Result};
use persistio_core::{ObjectMapper, Persistent, Record};

pub struct Account {
    id: Identity,
    balance: Mutex<i64>,
}

impl Account {
    pub fn new(id: Identity, balance: i64) -> Self {
        Self {
            id,
            balance: Mutex::new(balance),
        }
    }

    pub fn balance(&self) -> i64 {
        *self.balance.lock()
    }

    pub fn deposit(&self, amount: i64) {
        *self.balance.lock() += amount;
    }
}

impl Persistent for Account {
    fn identity(&self) -> Identity {
        self.id.clone()
    }

    fn on_reload_accepted(&self, other: &Self) -> bool {
        *self.balance.lock() = other.balance();
        true
    }
}

pub struct AccountMapper;

impl ObjectMapper<Account> for AccountMapper {
    fn encode(&self, account: &Account) -> Result<Record> {
        Record::new().with("balance", account.balance())
    }

    fn decode(&self, id: &Identity, record: Record) -> Result<Account> {
        let balance = record
            .get("balance")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| Error::serialization(format!("{id}: balance missing")))?;
        Ok(Account::new(id.clone(), balance))
    }
}
