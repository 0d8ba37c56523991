//! Platform fees
//!
//! Thin façade over the configured fee table: lookups for the engines and
//! the daily fee notice fanned out through the notification port.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::config::FeeTable;
use crate::core_types::Token;
use crate::notify::{NotificationPort, kinds};
use crate::store::UserStore;

pub struct FeeService {
    table: FeeTable,
}

impl FeeService {
    pub fn new(table: FeeTable) -> Self {
        Self { table }
    }

    pub fn swap_fee_bps(&self) -> u32 {
        self.table.swap_fee_bps
    }

    pub fn p2p_fee_bps(&self) -> u32 {
        self.table.p2p_fee_bps
    }

    /// Flat withdrawal fee for `asset`; zero when unlisted.
    pub fn withdrawal_fee(&self, asset: &Token) -> Decimal {
        self.table
            .withdrawal_fees
            .iter()
            .find(|(sym, _)| sym.eq_ignore_ascii_case(asset.as_str()))
            .map(|(_, fee)| *fee)
            .unwrap_or(Decimal::ZERO)
    }

    /// Human summary for the daily fee notice.
    pub fn fee_message(&self) -> String {
        let mut lines = vec![
            "Current platform fees:".to_string(),
            format!("  swap: {} bps", self.table.swap_fee_bps),
            format!("  p2p:  {} bps", self.table.p2p_fee_bps),
        ];
        let mut withdrawals: Vec<_> = self.table.withdrawal_fees.iter().collect();
        withdrawals.sort_by(|a, b| a.0.cmp(b.0));
        for (asset, fee) in withdrawals {
            lines.push(format!("  withdrawal {}: {}", asset, fee));
        }
        lines.join("\n")
    }

    /// Daily job body: send the fee summary to every known user.
    pub async fn notify_fee_day(
        &self,
        users: &Arc<dyn UserStore>,
        notifier: &Arc<dyn NotificationPort>,
    ) -> anyhow::Result<usize> {
        let ids = users.list_user_ids().await?;
        let message = self.fee_message();
        let mut sent = 0;
        for user in ids {
            notifier
                .notify(user, kinds::FEE_DAY, json!({ "message": message }))
                .await;
            sent += 1;
        }
        if sent == 0 {
            warn!("fee-day notice had nobody to go to");
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn table() -> FeeTable {
        serde_json::from_str(
            r#"{"swap_fee_bps": 30, "p2p_fee_bps": 50, "withdrawal_fees": {"TON": "0.05"}}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_withdrawal_fee_lookup_case_insensitive() {
        let svc = FeeService::new(table());
        assert_eq!(svc.withdrawal_fee(&Token::new("ton")), d("0.05"));
        assert_eq!(svc.withdrawal_fee(&Token::new("SOL")), Decimal::ZERO);
    }

    #[test]
    fn test_fee_message_lists_everything() {
        let svc = FeeService::new(table());
        let msg = svc.fee_message();
        assert!(msg.contains("swap: 30 bps"));
        assert!(msg.contains("p2p:  50 bps"));
        assert!(msg.contains("withdrawal TON: 0.05"));
    }
}
