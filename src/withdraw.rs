//! Withdrawal requests
//!
//! Validates the destination, collects the flat per-asset fee from the fee
//! table into the platform account, delegates the net transfer to the
//! wallet adapter, and journals both movements. The user's balance delta
//! equals the requested amount; the chain receives amount minus fee.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::core_types::{Network, Token, UserId};
use crate::fees::FeeService;
use crate::money::{self, MoneyError};
use crate::store::{NewTransaction, StoreError, TransactionStore, TxKind};
use crate::telemetry;
use crate::wallet::{PLATFORM_ACCOUNT, WalletAdapter, WalletError, WithdrawalReceipt};

#[derive(Debug, Error)]
pub enum WithdrawError {
    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("amount {amount} does not cover the {fee} withdrawal fee")]
    AmountBelowFee { amount: Decimal, fee: Decimal },

    #[error("wallet failure: {0}")]
    Wallet(#[from] WalletError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

pub struct WithdrawService {
    wallet: Arc<dyn WalletAdapter>,
    transactions: Arc<dyn TransactionStore>,
    fees: Arc<FeeService>,
}

impl WithdrawService {
    pub fn new(
        wallet: Arc<dyn WalletAdapter>,
        transactions: Arc<dyn TransactionStore>,
        fees: Arc<FeeService>,
    ) -> Self {
        Self {
            wallet,
            transactions,
            fees,
        }
    }

    pub async fn request_withdrawal(
        &self,
        user: UserId,
        network: &Network,
        token: &Token,
        address: &str,
        amount: Decimal,
    ) -> Result<WithdrawalReceipt, WithdrawError> {
        money::ensure_positive(amount)?;
        if !self.wallet.validate_address(address, network).await? {
            return Err(WithdrawError::InvalidAddress(address.to_string()));
        }
        let fee = self.fees.withdrawal_fee(token);
        if amount <= fee {
            return Err(WithdrawError::AmountBelowFee { amount, fee });
        }
        let net = amount - fee;

        // collect the fee first; returned if the chain transfer never starts
        if fee > Decimal::ZERO {
            self.wallet.send(user, PLATFORM_ACCOUNT, token, fee).await?;
        }
        let receipt = match self
            .wallet
            .create_withdrawal(user, network, token, address, net)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                if fee > Decimal::ZERO {
                    if let Err(refund) =
                        self.wallet.send(PLATFORM_ACCOUNT, user, token, fee).await
                    {
                        error!(user, "fee refund after failed withdrawal failed: {}", refund);
                    }
                }
                return Err(e.into());
            }
        };

        self.transactions
            .record_transaction(NewTransaction {
                user_id: user,
                kind: TxKind::Withdrawal,
                network: Some(network.clone()),
                asset: token.clone(),
                amount: net,
                tx_hash: Some(receipt.tx_hash.clone()),
                reference: None,
            })
            .await?;
        if fee > Decimal::ZERO {
            self.transactions
                .record_transaction(NewTransaction {
                    user_id: user,
                    kind: TxKind::Fee,
                    network: Some(network.clone()),
                    asset: token.clone(),
                    amount: fee,
                    tx_hash: Some(receipt.tx_hash.clone()),
                    reference: None,
                })
                .await?;
        }

        telemetry::track_user_operation("withdrawal");
        info!(user, %token, %amount, "withdrawal requested");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeTable;
    use crate::store::MemoryStore;
    use crate::wallet::InMemoryWallet;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn service() -> (WithdrawService, Arc<InMemoryWallet>, Arc<MemoryStore>) {
        let wallet = Arc::new(InMemoryWallet::new());
        let store = Arc::new(MemoryStore::new());
        let fees: FeeTable = serde_json::from_str(
            r#"{"withdrawal_fees": {"TON": "0.05"}}"#,
        )
        .unwrap();
        let svc = WithdrawService::new(
            wallet.clone(),
            store.clone(),
            Arc::new(FeeService::new(fees)),
        );
        (svc, wallet, store)
    }

    #[tokio::test]
    async fn test_withdrawal_debits_amount_and_collects_fee() {
        let (svc, wallet, store) = service();
        let ton = Token::new("TON");
        wallet.deposit(1, &ton, d("5"));

        let receipt = svc
            .request_withdrawal(1, &Network::new("TON"), &ton, "EQAdestination", d("2"))
            .await
            .unwrap();
        assert!(!receipt.tx_hash.is_empty());
        // user parted with the full 2; the chain got 1.95, the platform 0.05
        assert_eq!(wallet.get_balance(1, &ton).await.unwrap(), d("3"));
        assert_eq!(
            wallet.get_balance(PLATFORM_ACCOUNT, &ton).await.unwrap(),
            d("0.05")
        );

        let journal = store.list_user_transactions(1, 10).await.unwrap();
        assert_eq!(journal.len(), 2);
        let withdrawal = journal.iter().find(|t| t.kind == TxKind::Withdrawal).unwrap();
        assert_eq!(withdrawal.amount, d("1.95"));
        let fee = journal.iter().find(|t| t.kind == TxKind::Fee).unwrap();
        assert_eq!(fee.amount, d("0.05"));
    }

    #[tokio::test]
    async fn test_withdrawal_rejects_bad_input() {
        let (svc, wallet, _) = service();
        let ton = Token::new("TON");
        wallet.deposit(1, &ton, d("5"));
        let net = Network::new("TON");

        assert!(matches!(
            svc.request_withdrawal(1, &net, &ton, "bad", d("2")).await,
            Err(WithdrawError::InvalidAddress(_))
        ));
        assert!(matches!(
            svc.request_withdrawal(1, &net, &ton, "EQAdestination", d("0.01")).await,
            Err(WithdrawError::AmountBelowFee { .. })
        ));
        assert!(matches!(
            svc.request_withdrawal(1, &net, &ton, "EQAdestination", d("100")).await,
            Err(WithdrawError::Wallet(WalletError::InsufficientFunds { .. }))
        ));
        // the pre-collected fee came back when the transfer never started
        assert_eq!(wallet.get_balance(1, &ton).await.unwrap(), d("5"));
        assert_eq!(
            wallet.get_balance(PLATFORM_ACCOUNT, &ton).await.unwrap(),
            d("0")
        );
    }
}
