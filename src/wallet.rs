//! Wallet adapter contract
//!
//! Key management and chain access live outside the core; engines only ask
//! for balance reads and balance deltas through [`WalletAdapter`]. The
//! in-memory adapter backs tests and single-node development, with the same
//! enforcement discipline as a real signer: checked arithmetic, explicit
//! errors, no negative balances, escrow tagged by order id.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::core_types::{Network, P2pOrderId, Token, UserId};

/// Account that accumulates platform fees taken on escrow release.
pub const PLATFORM_ACCOUNT: UserId = 0;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("insufficient funds: user {user} has {available}, needs {requested}")]
    InsufficientFunds {
        user: UserId,
        available: Decimal,
        requested: Decimal,
    },

    #[error("no escrow entry for order {0}")]
    EscrowMissing(P2pOrderId),

    #[error("escrow already held for order {0}")]
    EscrowExists(P2pOrderId),

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("wallet backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct WithdrawalReceipt {
    pub tx_hash: String,
    pub status: String,
}

/// External signer contract (C8).
///
/// Escrow entries are keyed by P2P order id; at most one entry per order.
/// Every mutation is atomic: it either fully applies or returns an error
/// with no balance change.
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    async fn get_balance(&self, user: UserId, token: &Token) -> Result<Decimal, WalletError>;

    async fn validate_address(
        &self,
        address: &str,
        network: &Network,
    ) -> Result<bool, WalletError>;

    /// Move spendable funds between two platform accounts.
    async fn send(
        &self,
        from_user: UserId,
        to_user: UserId,
        token: &Token,
        amount: Decimal,
    ) -> Result<(), WalletError>;

    async fn create_withdrawal(
        &self,
        user: UserId,
        network: &Network,
        token: &Token,
        address: &str,
        amount: Decimal,
    ) -> Result<WithdrawalReceipt, WalletError>;

    /// Move `amount` of `token` from `from_user`'s spendable balance into
    /// the escrow entry for `order_id`.
    async fn transfer_escrow(
        &self,
        order_id: P2pOrderId,
        from_user: UserId,
        token: &Token,
        amount: Decimal,
    ) -> Result<(), WalletError>;

    /// Credit the escrow for `order_id` to `to_user`, net of `fee` which
    /// accrues to [`PLATFORM_ACCOUNT`]. Returns (token, net credited).
    async fn release_escrow(
        &self,
        order_id: P2pOrderId,
        to_user: UserId,
        fee: Decimal,
    ) -> Result<(Token, Decimal), WalletError>;

    /// Return the escrow for `order_id` to its original owner, in full.
    async fn refund_escrow(&self, order_id: P2pOrderId) -> Result<(Token, Decimal), WalletError>;

    /// Amount currently escrowed for `order_id`, if any. Used by
    /// reconciliation and invariant checks.
    async fn escrowed(&self, order_id: P2pOrderId) -> Result<Option<Decimal>, WalletError>;
}

#[derive(Debug, Clone)]
struct EscrowEntry {
    owner: UserId,
    token: Token,
    amount: Decimal,
}

/// In-memory wallet for tests and single-node development.
#[derive(Default)]
pub struct InMemoryWallet {
    balances: DashMap<(UserId, Token), Decimal>,
    escrow: DashMap<P2pOrderId, EscrowEntry>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a spendable balance (stands in for a confirmed deposit).
    pub fn deposit(&self, user: UserId, token: &Token, amount: Decimal) {
        *self
            .balances
            .entry((user, token.clone()))
            .or_insert(Decimal::ZERO) += amount;
    }

    fn debit(&self, user: UserId, token: &Token, amount: Decimal) -> Result<(), WalletError> {
        let mut entry = self
            .balances
            .entry((user, token.clone()))
            .or_insert(Decimal::ZERO);
        if *entry < amount {
            return Err(WalletError::InsufficientFunds {
                user,
                available: *entry,
                requested: amount,
            });
        }
        *entry -= amount;
        Ok(())
    }
}

#[async_trait]
impl WalletAdapter for InMemoryWallet {
    async fn get_balance(&self, user: UserId, token: &Token) -> Result<Decimal, WalletError> {
        Ok(self
            .balances
            .get(&(user, token.clone()))
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO))
    }

    async fn validate_address(
        &self,
        address: &str,
        _network: &Network,
    ) -> Result<bool, WalletError> {
        Ok(address.len() >= 8 && !address.contains(char::is_whitespace))
    }

    async fn send(
        &self,
        from_user: UserId,
        to_user: UserId,
        token: &Token,
        amount: Decimal,
    ) -> Result<(), WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount);
        }
        self.debit(from_user, token, amount)?;
        self.deposit(to_user, token, amount);
        Ok(())
    }

    async fn create_withdrawal(
        &self,
        user: UserId,
        network: &Network,
        token: &Token,
        address: &str,
        amount: Decimal,
    ) -> Result<WithdrawalReceipt, WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount);
        }
        if !self.validate_address(address, network).await? {
            return Err(WalletError::InvalidAddress(address.to_string()));
        }
        self.debit(user, token, amount)?;
        Ok(WithdrawalReceipt {
            tx_hash: format!("0x{}", Uuid::new_v4().simple()),
            status: "BROADCAST".to_string(),
        })
    }

    async fn transfer_escrow(
        &self,
        order_id: P2pOrderId,
        from_user: UserId,
        token: &Token,
        amount: Decimal,
    ) -> Result<(), WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount);
        }
        if self.escrow.contains_key(&order_id) {
            return Err(WalletError::EscrowExists(order_id));
        }
        self.debit(from_user, token, amount)?;
        self.escrow.insert(
            order_id,
            EscrowEntry {
                owner: from_user,
                token: token.clone(),
                amount,
            },
        );
        Ok(())
    }

    async fn release_escrow(
        &self,
        order_id: P2pOrderId,
        to_user: UserId,
        fee: Decimal,
    ) -> Result<(Token, Decimal), WalletError> {
        let (_, entry) = self
            .escrow
            .remove(&order_id)
            .ok_or(WalletError::EscrowMissing(order_id))?;
        let net = entry.amount - fee;
        self.deposit(to_user, &entry.token, net);
        if fee > Decimal::ZERO {
            self.deposit(PLATFORM_ACCOUNT, &entry.token, fee);
        }
        Ok((entry.token, net))
    }

    async fn refund_escrow(&self, order_id: P2pOrderId) -> Result<(Token, Decimal), WalletError> {
        let (_, entry) = self
            .escrow
            .remove(&order_id)
            .ok_or(WalletError::EscrowMissing(order_id))?;
        self.deposit(entry.owner, &entry.token, entry.amount);
        Ok((entry.token, entry.amount))
    }

    async fn escrowed(&self, order_id: P2pOrderId) -> Result<Option<Decimal>, WalletError> {
        Ok(self.escrow.get(&order_id).map(|e| e.amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn ton() -> Token {
        Token::new("TON")
    }

    #[tokio::test]
    async fn test_escrow_lock_release_with_fee() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(1, &ton(), d("10"));

        wallet.transfer_escrow(7, 1, &ton(), d("10")).await.unwrap();
        assert_eq!(wallet.get_balance(1, &ton()).await.unwrap(), d("0"));
        assert_eq!(wallet.escrowed(7).await.unwrap(), Some(d("10")));

        let (token, net) = wallet.release_escrow(7, 2, d("0.05")).await.unwrap();
        assert_eq!(token, ton());
        assert_eq!(net, d("9.95"));
        assert_eq!(wallet.get_balance(2, &ton()).await.unwrap(), d("9.95"));
        assert_eq!(
            wallet.get_balance(PLATFORM_ACCOUNT, &ton()).await.unwrap(),
            d("0.05")
        );
        assert_eq!(wallet.escrowed(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_escrow_refund_returns_everything() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(1, &ton(), d("3"));
        wallet.transfer_escrow(9, 1, &ton(), d("3")).await.unwrap();
        let (_, refunded) = wallet.refund_escrow(9).await.unwrap();
        assert_eq!(refunded, d("3"));
        assert_eq!(wallet.get_balance(1, &ton()).await.unwrap(), d("3"));
    }

    #[tokio::test]
    async fn test_escrow_requires_funds_and_unique_order() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(1, &ton(), d("1"));
        assert!(matches!(
            wallet.transfer_escrow(5, 1, &ton(), d("2")).await,
            Err(WalletError::InsufficientFunds { .. })
        ));
        wallet.transfer_escrow(5, 1, &ton(), d("1")).await.unwrap();
        wallet.deposit(1, &ton(), d("1"));
        assert!(matches!(
            wallet.transfer_escrow(5, 1, &ton(), d("1")).await,
            Err(WalletError::EscrowExists(5))
        ));
    }

    #[tokio::test]
    async fn test_send_moves_spendable_funds() {
        let wallet = InMemoryWallet::new();
        wallet.deposit(1, &ton(), d("4"));
        wallet.send(1, 2, &ton(), d("1.5")).await.unwrap();
        assert_eq!(wallet.get_balance(1, &ton()).await.unwrap(), d("2.5"));
        assert_eq!(wallet.get_balance(2, &ton()).await.unwrap(), d("1.5"));
        assert!(matches!(
            wallet.send(1, 2, &ton(), d("100")).await,
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_withdrawal_debits_and_validates() {
        let wallet = InMemoryWallet::new();
        let net = Network::new("TON");
        wallet.deposit(1, &ton(), d("5"));
        let receipt = wallet
            .create_withdrawal(1, &net, &ton(), "EQAvalidaddr", d("2"))
            .await
            .unwrap();
        assert!(receipt.tx_hash.starts_with("0x"));
        assert_eq!(wallet.get_balance(1, &ton()).await.unwrap(), d("3"));

        assert!(matches!(
            wallet.create_withdrawal(1, &net, &ton(), "bad", d("1")).await,
            Err(WalletError::InvalidAddress(_))
        ));
    }
}
