//! P2P engine
//!
//! Owns the advertised-order state machine:
//!
//! ```text
//! OPEN ──take(taker)──▶ IN_PROGRESS
//! IN_PROGRESS ──buyer.confirm_payment──▶ PAYMENT_SENT
//! PAYMENT_SENT ──seller.release──▶ COMPLETED
//! {IN_PROGRESS, PAYMENT_SENT} ──either.open_dispute──▶ DISPUTE
//! DISPUTE ──admin.resolve──▶ RESOLVED ──▶ COMPLETED | CANCELLED
//! OPEN ──maker.cancel | expiry──▶ CANCELLED
//! IN_PROGRESS ──either.cancel──▶ CANCELLED
//! ```
//!
//! Status is the source of truth: every transition is a store-level CAS,
//! and the paired escrow movement happens immediately after the winning
//! CAS. A crash between the two leaves a terminal/RESOLVED row with a live
//! escrow entry, which `recover_escrows` settles at startup.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{
    DisputeResolution, NewP2pOrder, OpenOrderFilter, P2pError, P2pMessage, P2pOrder, P2pSide,
    P2pStatus, P2pUserStats, Review,
};
use crate::core_types::{P2pOrderId, Token, UserId};
use crate::money;
use crate::notify::{NotificationPort, kinds};
use crate::store::{NewTransaction, P2pPatch, P2pStore, TransactionStore, TxKind, UserStore};
use crate::telemetry;
use crate::wallet::WalletAdapter;

/// OPEN ads live this long before the expiry sweep cancels them.
const AD_LIFETIME_HOURS: i64 = 24;

/// Dispute-reason marker recording the admin verdict across the
/// RESOLVED -> terminal window.
const VERDICT_REFUND: &str = "verdict:refund";
const VERDICT_COMPLETE: &str = "verdict:complete";

pub struct P2pEngine {
    store: Arc<dyn P2pStore>,
    users: Arc<dyn UserStore>,
    transactions: Arc<dyn TransactionStore>,
    wallet: Arc<dyn WalletAdapter>,
    notifier: Arc<dyn NotificationPort>,
    fee_bps: u32,
}

impl P2pEngine {
    pub fn new(
        store: Arc<dyn P2pStore>,
        users: Arc<dyn UserStore>,
        transactions: Arc<dyn TransactionStore>,
        wallet: Arc<dyn WalletAdapter>,
        notifier: Arc<dyn NotificationPort>,
        fee_bps: u32,
    ) -> Self {
        Self {
            store,
            users,
            transactions,
            wallet,
            notifier,
            fee_bps,
        }
    }

    /// Post a new ad. Escrow is taken later, at take time.
    pub async fn create_order(
        &self,
        maker_id: UserId,
        side: P2pSide,
        base_currency: Token,
        quote_currency: Token,
        crypto_amount: Decimal,
        price: Decimal,
        payment_method_id: &str,
    ) -> Result<P2pOrder, P2pError> {
        money::ensure_positive(crypto_amount)?;
        money::ensure_positive(price)?;
        self.users.upsert_user(maker_id, None).await?;

        let order = self
            .store
            .insert_p2p(NewP2pOrder {
                maker_id,
                side,
                base_currency,
                quote_currency,
                crypto_amount,
                price,
                payment_method_id: payment_method_id.to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(AD_LIFETIME_HOURS),
            })
            .await?;
        info!(order_id = order.id, maker_id, %side, "p2p ad posted");
        telemetry::track_user_operation("p2p_create");
        Ok(order)
    }

    /// Take an OPEN ad. The crypto seller's funds move into escrow.
    pub async fn take_order(&self, id: P2pOrderId, taker_id: UserId) -> Result<P2pOrder, P2pError> {
        let order = self.get_order(id).await?;
        if order.maker_id == taker_id {
            return Err(P2pError::SelfTrade(id));
        }
        if order.status != P2pStatus::Open {
            return Err(P2pError::NotOpen(id));
        }
        self.users.upsert_user(taker_id, None).await?;

        // a taker funding the escrow (BUY ad) is checked up front so a
        // broke taker fails cleanly without touching the ad
        if order.side == P2pSide::Buy {
            let balance = self
                .wallet
                .get_balance(taker_id, &order.base_currency)
                .await?;
            if balance < order.crypto_amount {
                return Err(P2pError::Wallet(
                    crate::wallet::WalletError::InsufficientFunds {
                        user: taker_id,
                        available: balance,
                        requested: order.crypto_amount,
                    },
                ));
            }
        }

        let Some(order) = self
            .store
            .transition_p2p(
                id,
                P2pStatus::Open,
                P2pStatus::InProgress,
                P2pPatch {
                    taker_id: Some(taker_id),
                    ..Default::default()
                },
            )
            .await?
        else {
            // somebody took or cancelled it first
            return Err(P2pError::NotOpen(id));
        };

        let seller = order
            .crypto_seller()
            .ok_or(P2pError::EscrowInconsistent(id))?;
        match self
            .wallet
            .transfer_escrow(id, seller, &order.base_currency, order.crypto_amount)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                // deal is IN_PROGRESS but unfunded: freeze it for an admin
                error!(order_id = id, "escrow transfer failed after take: {}", e);
                self.store
                    .transition_p2p(
                        id,
                        P2pStatus::InProgress,
                        P2pStatus::Dispute,
                        P2pPatch {
                            dispute_reason: Some(format!("escrow transfer failed: {}", e)),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(P2pError::EscrowInconsistent(id));
            }
        }
        self.journal(
            seller,
            TxKind::EscrowLock,
            &order.base_currency,
            order.crypto_amount,
            None,
            id,
        )
        .await;

        self.notify_parties(&order, kinds::P2P_TAKEN).await;
        telemetry::track_user_operation("p2p_take");
        info!(order_id = id, taker_id, "p2p ad taken, escrow locked");
        Ok(order)
    }

    /// The fiat payer marks the off-platform payment as sent.
    pub async fn confirm_payment(
        &self,
        id: P2pOrderId,
        caller: UserId,
    ) -> Result<P2pOrder, P2pError> {
        let order = self.get_order(id).await?;
        if order.crypto_buyer() != Some(caller) {
            return Err(P2pError::NotAuthorized {
                id,
                user: caller,
                action: "confirm_payment",
            });
        }
        let Some(order) = self
            .store
            .transition_p2p(
                id,
                P2pStatus::InProgress,
                P2pStatus::PaymentSent,
                P2pPatch::default(),
            )
            .await?
        else {
            return Err(P2pError::InvalidTransition {
                id,
                status: self.get_order(id).await?.status,
                action: "confirm_payment",
            });
        };
        self.notify_parties(&order, kinds::P2P_PAYMENT_SENT).await;
        telemetry::track_user_operation("p2p_confirm_payment");
        Ok(order)
    }

    /// The crypto seller releases escrow to the buyer, net of the platform
    /// fee. Valid only from PAYMENT_SENT.
    pub async fn release(&self, id: P2pOrderId, caller: UserId) -> Result<P2pOrder, P2pError> {
        let order = self.get_order(id).await?;
        if order.crypto_seller() != Some(caller) {
            return Err(P2pError::NotAuthorized {
                id,
                user: caller,
                action: "release",
            });
        }
        let Some(order) = self
            .store
            .transition_p2p(
                id,
                P2pStatus::PaymentSent,
                P2pStatus::Completed,
                P2pPatch::default(),
            )
            .await?
        else {
            return Err(P2pError::InvalidTransition {
                id,
                status: self.get_order(id).await?.status,
                action: "release",
            });
        };

        self.settle_completed(&order).await?;
        self.notify_parties(&order, kinds::P2P_COMPLETED).await;
        telemetry::track_user_operation("p2p_release");
        info!(order_id = id, "p2p deal completed");
        Ok(order)
    }

    /// Cancel an ad (maker, OPEN) or an in-progress deal (either party,
    /// before PAYMENT_SENT). Escrow, if any, returns in full.
    pub async fn cancel(&self, id: P2pOrderId, caller: UserId) -> Result<P2pOrder, P2pError> {
        let order = self.get_order(id).await?;
        match order.status {
            P2pStatus::Open => {
                if order.maker_id != caller {
                    return Err(P2pError::NotAuthorized {
                        id,
                        user: caller,
                        action: "cancel",
                    });
                }
                let Some(order) = self
                    .store
                    .transition_p2p(id, P2pStatus::Open, P2pStatus::Cancelled, P2pPatch::default())
                    .await?
                else {
                    return Err(P2pError::NotOpen(id));
                };
                self.notify_parties(&order, kinds::P2P_CANCELLED).await;
                Ok(order)
            }
            P2pStatus::InProgress => {
                if !order.is_party(caller) {
                    return Err(P2pError::NotAuthorized {
                        id,
                        user: caller,
                        action: "cancel",
                    });
                }
                let Some(order) = self
                    .store
                    .transition_p2p(
                        id,
                        P2pStatus::InProgress,
                        P2pStatus::Cancelled,
                        P2pPatch::default(),
                    )
                    .await?
                else {
                    return Err(P2pError::InvalidTransition {
                        id,
                        status: self.get_order(id).await?.status,
                        action: "cancel",
                    });
                };
                self.refund(&order).await?;
                self.notify_parties(&order, kinds::P2P_CANCELLED).await;
                telemetry::track_user_operation("p2p_cancel");
                Ok(order)
            }
            status => Err(P2pError::InvalidTransition {
                id,
                status,
                action: "cancel",
            }),
        }
    }

    /// Either party freezes the deal for an admin. Escrow stays put.
    pub async fn open_dispute(
        &self,
        id: P2pOrderId,
        caller: UserId,
        reason: &str,
    ) -> Result<P2pOrder, P2pError> {
        let order = self.get_order(id).await?;
        if !order.is_party(caller) {
            return Err(P2pError::NotAuthorized {
                id,
                user: caller,
                action: "open_dispute",
            });
        }
        if !matches!(order.status, P2pStatus::InProgress | P2pStatus::PaymentSent) {
            return Err(P2pError::InvalidTransition {
                id,
                status: order.status,
                action: "open_dispute",
            });
        }
        let Some(order) = self
            .store
            .transition_p2p(
                id,
                order.status,
                P2pStatus::Dispute,
                P2pPatch {
                    dispute_reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?
        else {
            return Err(P2pError::InvalidTransition {
                id,
                status: self.get_order(id).await?.status,
                action: "open_dispute",
            });
        };
        self.notify_parties(&order, kinds::P2P_DISPUTE).await;
        telemetry::track_user_operation("p2p_dispute");
        warn!(order_id = id, caller, "p2p dispute opened: {}", reason);
        Ok(order)
    }

    /// Admin verdict. The verdict is recorded on the row (RESOLVED) before
    /// any money moves, so a crash mid-resolution is replayable.
    pub async fn resolve_dispute(
        &self,
        id: P2pOrderId,
        resolution: DisputeResolution,
    ) -> Result<P2pOrder, P2pError> {
        let verdict = match resolution {
            DisputeResolution::Refund => VERDICT_REFUND,
            DisputeResolution::Complete => VERDICT_COMPLETE,
        };
        let Some(order) = self
            .store
            .transition_p2p(
                id,
                P2pStatus::Dispute,
                P2pStatus::Resolved,
                P2pPatch {
                    dispute_reason: Some(verdict.to_string()),
                    ..Default::default()
                },
            )
            .await?
        else {
            return Err(P2pError::InvalidTransition {
                id,
                status: self.get_order(id).await?.status,
                action: "resolve_dispute",
            });
        };
        let order = self.apply_verdict(order, resolution).await?;
        telemetry::track_user_operation("p2p_resolve");
        Ok(order)
    }

    async fn apply_verdict(
        &self,
        order: P2pOrder,
        resolution: DisputeResolution,
    ) -> Result<P2pOrder, P2pError> {
        let id = order.id;
        match resolution {
            DisputeResolution::Refund => {
                self.refund(&order).await?;
                let Some(order) = self
                    .store
                    .transition_p2p(
                        id,
                        P2pStatus::Resolved,
                        P2pStatus::Cancelled,
                        P2pPatch::default(),
                    )
                    .await?
                else {
                    return Err(P2pError::EscrowInconsistent(id));
                };
                self.notify_parties(&order, kinds::P2P_CANCELLED).await;
                info!(order_id = id, "dispute resolved: refund");
                Ok(order)
            }
            DisputeResolution::Complete => {
                self.settle_completed(&order).await?;
                let Some(order) = self
                    .store
                    .transition_p2p(
                        id,
                        P2pStatus::Resolved,
                        P2pStatus::Completed,
                        P2pPatch::default(),
                    )
                    .await?
                else {
                    return Err(P2pError::EscrowInconsistent(id));
                };
                self.notify_parties(&order, kinds::P2P_COMPLETED).await;
                info!(order_id = id, "dispute resolved: complete");
                Ok(order)
            }
        }
    }

    /// Cancel every expired OPEN ad. Called by the scheduler once a minute.
    pub async fn sweep_expired(&self) -> Result<usize, P2pError> {
        let expired = self.store.list_expired_open(Utc::now()).await?;
        let mut swept = 0;
        for order in expired {
            match self
                .store
                .transition_p2p(
                    order.id,
                    P2pStatus::Open,
                    P2pStatus::Cancelled,
                    P2pPatch::default(),
                )
                .await
            {
                Ok(Some(cancelled)) => {
                    swept += 1;
                    self.notifier
                        .notify(
                            cancelled.maker_id,
                            kinds::P2P_CANCELLED,
                            json!({ "order_id": cancelled.id, "reason": "expired" }),
                        )
                        .await;
                }
                Ok(None) => {} // raced with a take or cancel; leave it be
                Err(e) => warn!(order_id = order.id, "expiry sweep failed: {}", e),
            }
        }
        if swept > 0 {
            info!("expired {} open p2p ads", swept);
        }
        Ok(swept)
    }

    /// Submit one review per party on a COMPLETED deal.
    pub async fn submit_review(
        &self,
        id: P2pOrderId,
        reviewer: UserId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Review, P2pError> {
        if !(1..=5).contains(&rating) {
            return Err(P2pError::InvalidRating);
        }
        let order = self.get_order(id).await?;
        if order.status != P2pStatus::Completed {
            return Err(P2pError::InvalidTransition {
                id,
                status: order.status,
                action: "submit_review",
            });
        }
        if !order.is_party(reviewer) {
            return Err(P2pError::NotAuthorized {
                id,
                user: reviewer,
                action: "submit_review",
            });
        }
        let subject = if order.maker_id == reviewer {
            order.taker_id.ok_or(P2pError::EscrowInconsistent(id))?
        } else {
            order.maker_id
        };

        let review = Review {
            order_id: id,
            reviewer_id: reviewer,
            subject_id: subject,
            rating,
            comment,
            created_at: Utc::now(),
        };
        self.store.insert_review(review.clone()).await.map_err(|e| {
            if matches!(e, crate::store::StoreError::Duplicate(_)) {
                P2pError::ReviewExists(id)
            } else {
                P2pError::Store(e)
            }
        })?;
        self.users.add_rating(subject, rating).await?;
        telemetry::track_user_operation("p2p_review");
        Ok(review)
    }

    /// Message the counterparty while the deal is live.
    pub async fn send_message(
        &self,
        id: P2pOrderId,
        sender: UserId,
        text: &str,
    ) -> Result<P2pMessage, P2pError> {
        let order = self.get_order(id).await?;
        if !order.is_party(sender) {
            return Err(P2pError::NotAuthorized {
                id,
                user: sender,
                action: "send_message",
            });
        }
        if !matches!(
            order.status,
            P2pStatus::InProgress | P2pStatus::PaymentSent | P2pStatus::Dispute
        ) {
            return Err(P2pError::InvalidTransition {
                id,
                status: order.status,
                action: "send_message",
            });
        }
        let message = self.store.insert_message(id, sender, text).await?;
        if let Some(counterparty) = [Some(order.maker_id), order.taker_id]
            .into_iter()
            .flatten()
            .find(|u| *u != sender)
        {
            self.notifier
                .notify(
                    counterparty,
                    kinds::P2P_MESSAGE,
                    json!({ "order_id": id, "from": sender }),
                )
                .await;
        }
        Ok(message)
    }

    pub async fn list_messages(
        &self,
        id: P2pOrderId,
        requester: UserId,
    ) -> Result<Vec<P2pMessage>, P2pError> {
        let order = self.get_order(id).await?;
        if !order.is_party(requester) {
            return Err(P2pError::NotAuthorized {
                id,
                user: requester,
                action: "list_messages",
            });
        }
        Ok(self.store.list_messages(id).await?)
    }

    pub async fn get_order(&self, id: P2pOrderId) -> Result<P2pOrder, P2pError> {
        self.store
            .get_p2p(id)
            .await?
            .ok_or(P2pError::NotFound(id))
    }

    pub async fn list_open(
        &self,
        side: P2pSide,
        filter: &OpenOrderFilter,
    ) -> Result<Vec<P2pOrder>, P2pError> {
        Ok(self.store.list_open(side, filter).await?)
    }

    pub async fn list_user_orders(&self, user: UserId) -> Result<Vec<P2pOrder>, P2pError> {
        Ok(self.store.list_user_p2p(user).await?)
    }

    pub async fn user_stats(&self, user: UserId) -> Result<P2pUserStats, P2pError> {
        Ok(self.store.p2p_user_stats(user).await?)
    }

    /// Startup reconciliation: finish any transition whose balance delta
    /// never landed. Status is the source of truth.
    pub async fn recover_escrows(&self) -> Result<usize, P2pError> {
        let mut recovered = 0;

        // verdict recorded, money not yet moved
        for order in self.store.list_by_status(P2pStatus::Resolved).await? {
            let resolution = match order.dispute_reason.as_deref() {
                Some(VERDICT_REFUND) => DisputeResolution::Refund,
                Some(VERDICT_COMPLETE) => DisputeResolution::Complete,
                other => {
                    error!(order_id = order.id, "unreadable verdict marker: {:?}", other);
                    continue;
                }
            };
            self.apply_verdict(order, resolution).await?;
            recovered += 1;
        }

        // terminal rows whose escrow never settled
        for order in self.store.list_by_status(P2pStatus::Completed).await? {
            if self.wallet.escrowed(order.id).await?.is_some() {
                self.settle_completed(&order).await?;
                recovered += 1;
            }
        }
        for order in self.store.list_by_status(P2pStatus::Cancelled).await? {
            if self.wallet.escrowed(order.id).await?.is_some() {
                self.refund(&order).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!("escrow reconciliation settled {} orders", recovered);
        }
        Ok(recovered)
    }

    /// Escrow -> buyer net of fee, with journal rows.
    async fn settle_completed(&self, order: &P2pOrder) -> Result<(), P2pError> {
        let buyer = order.crypto_buyer().ok_or(P2pError::EscrowInconsistent(order.id))?;
        let fee = money::fee_amount(order.crypto_amount, self.fee_bps);
        let (token, net) = self.wallet.release_escrow(order.id, buyer, fee).await?;
        self.journal(buyer, TxKind::EscrowRelease, &token, net, None, order.id)
            .await;
        if fee > Decimal::ZERO {
            self.journal(
                crate::wallet::PLATFORM_ACCOUNT,
                TxKind::Fee,
                &token,
                fee,
                None,
                order.id,
            )
            .await;
        }
        Ok(())
    }

    /// Escrow back to its owner, in full.
    async fn refund(&self, order: &P2pOrder) -> Result<(), P2pError> {
        match self.wallet.refund_escrow(order.id).await {
            Ok((token, amount)) => {
                let owner = order
                    .crypto_seller()
                    .ok_or(P2pError::EscrowInconsistent(order.id))?;
                self.journal(owner, TxKind::EscrowRefund, &token, amount, None, order.id)
                    .await;
                Ok(())
            }
            // nothing escrowed (OPEN cancel path) is fine
            Err(crate::wallet::WalletError::EscrowMissing(_)) => Ok(()),
            Err(e) => Err(P2pError::Wallet(e)),
        }
    }

    async fn journal(
        &self,
        user: UserId,
        kind: TxKind,
        asset: &Token,
        amount: Decimal,
        tx_hash: Option<String>,
        order_id: P2pOrderId,
    ) {
        if let Err(e) = self
            .transactions
            .record_transaction(NewTransaction {
                user_id: user,
                kind,
                network: None,
                asset: asset.clone(),
                amount,
                tx_hash,
                reference: Some(format!("p2p:{}", order_id)),
            })
            .await
        {
            error!(order_id, "transaction journal write failed: {}", e);
        }
    }

    async fn notify_parties(&self, order: &P2pOrder, kind: &str) {
        let payload = json!({ "order_id": order.id, "status": order.status.to_string() });
        self.notifier
            .notify(order.maker_id, kind, payload.clone())
            .await;
        if let Some(taker) = order.taker_id {
            self.notifier.notify(taker, kind, payload).await;
        }
    }
}
