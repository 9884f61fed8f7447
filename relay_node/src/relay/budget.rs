//! Per-session relay budgets for requestors.
//!
//! A requestor's stake fixes `max_relays` per session; each selected
//! servicer may serve `max(1, max_relays / num_servicers)` of them. Slots
//! are reserved before forwarding and only consumed once evidence is
//! recorded.

use dashmap::DashMap;
use log::debug;

use crate::crypto::Address;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BudgetKey {
    requestor: Address,
    chain: String,
    session_height: i64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    committed: u64,
    reserved: u64,
}

pub fn servicer_limit(max_relays: u64, num_servicers: u32) -> u64 {
    (max_relays / u64::from(num_servicers.max(1))).max(1)
}

#[derive(Debug, Default)]
pub struct RelayBudget {
    usage: DashMap<BudgetKey, Usage>,
}

impl RelayBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves one relay slot. `recorded` seeds the counter the first
    /// time a session is seen, so restarts keep counting from the evidence.
    pub fn reserve(
        &self,
        requestor: Address,
        chain: &str,
        session_height: i64,
        limit: u64,
        recorded: impl FnOnce() -> u64,
    ) -> Result<Reservation<'_>> {
        let key = BudgetKey {
            requestor,
            chain: chain.to_string(),
            session_height,
        };
        let mut usage = self.usage.entry(key.clone()).or_insert_with(|| Usage {
            committed: recorded(),
            reserved: 0,
        });
        if usage.committed + usage.reserved >= limit {
            debug!(
                "requestor {} over budget ({} of {}) for session {}",
                requestor, usage.committed, limit, session_height
            );
            return Err(Error::OverService {
                requestor: requestor.to_hex(),
                limit,
            });
        }
        usage.reserved += 1;
        Ok(Reservation {
            budget: self,
            key: Some(key),
        })
    }

    pub fn used(&self, requestor: &Address, chain: &str, session_height: i64) -> u64 {
        let key = BudgetKey {
            requestor: *requestor,
            chain: chain.to_string(),
            session_height,
        };
        self.usage.get(&key).map(|u| u.committed).unwrap_or(0)
    }

    /// Forgets sessions that started before `session_height`.
    pub fn prune_before(&self, session_height: i64) {
        self.usage.retain(|k, _| k.session_height >= session_height);
    }

    fn settle(&self, key: &BudgetKey, commit: bool) {
        if let Some(mut usage) = self.usage.get_mut(key) {
            usage.reserved = usage.reserved.saturating_sub(1);
            if commit {
                usage.committed += 1;
            }
        }
    }
}

/// A reserved relay slot; released on drop unless committed.
#[must_use]
pub struct Reservation<'a> {
    budget: &'a RelayBudget,
    key: Option<BudgetKey>,
}

impl Reservation<'_> {
    pub fn commit(mut self) {
        if let Some(key) = self.key.take() {
            self.budget.settle(&key, true);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.budget.settle(&key, false);
        }
    }
}
