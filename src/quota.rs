use chrono::{NaiveDate, Utc};
use std::sync::Mutex;

/// Process-wide daily-reset budget for `Y`'s cost-weighted API calls.
///
/// The critical section never awaits, so a plain `std::sync::Mutex` is the
/// right tool here (unlike the per-token locks in `vault`, which protect
/// state held across `.await` points and therefore need `tokio::sync::Mutex`).
pub struct QuotaLedger {
    state: Mutex<LedgerState>,
    daily_limit: i64,
}

struct LedgerState {
    used: i64,
    reset_date: NaiveDate,
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub used: i64,
    pub limit: i64,
    pub reset_date: NaiveDate,
}

impl QuotaLedger {
    pub fn new(daily_limit: i64) -> Self {
        QuotaLedger {
            state: Mutex::new(LedgerState {
                used: 0,
                reset_date: Utc::now().date_naive(),
            }),
            daily_limit,
        }
    }

    /// Roll `used` back to zero if the UTC calendar date has advanced since
    /// the last reset, then attempt to debit `cost`. Returns `false` without
    /// mutating state when the debit would exceed the daily limit.
    pub fn check_and_consume(&self, cost: i64) -> bool {
        let mut st = self.state.lock().expect("quota ledger mutex poisoned");
        let today = Utc::now().date_naive();
        if today != st.reset_date {
            st.used = 0;
            st.reset_date = today;
        }
        if st.used + cost > self.daily_limit {
            return false;
        }
        st.used += cost;
        true
    }

    pub fn usage(&self) -> Usage {
        let mut st = self.state.lock().expect("quota ledger mutex poisoned");
        let today = Utc::now().date_naive();
        if today != st.reset_date {
            st.used = 0;
            st.reset_date = today;
        }
        Usage {
            used: st.used,
            limit: self.daily_limit,
            reset_date: st.reset_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumes_up_to_limit_then_refuses() {
        let ledger = QuotaLedger::new(100);
        assert!(ledger.check_and_consume(50));
        assert!(ledger.check_and_consume(50));
        assert!(!ledger.check_and_consume(1));
        let usage = ledger.usage();
        assert_eq!(usage.used, 100);
        assert_eq!(usage.limit, 100);
    }

    #[test]
    fn refusal_does_not_mutate_state() {
        let ledger = QuotaLedger::new(100);
        assert!(ledger.check_and_consume(90));
        assert!(!ledger.check_and_consume(50));
        assert_eq!(ledger.usage().used, 90);
    }

    #[test]
    fn reset_at_date_boundary_restores_budget() {
        let ledger = QuotaLedger::new(10);
        assert!(ledger.check_and_consume(10));
        assert!(!ledger.check_and_consume(1));
        // Simulate a day rollover by rewriting reset_date directly.
        {
            let mut st = ledger.state.lock().unwrap();
            st.reset_date = st.reset_date - chrono::Duration::days(1);
        }
        assert!(ledger.check_and_consume(10));
    }
}
