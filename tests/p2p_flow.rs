//! End-to-end P2P deals: escrow conservation over the happy path, dispute
//! refunds, and the scheduler-driven expiry sweep.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crossflow::core_types::Token;
use crossflow::notify::LogNotifier;
use crossflow::p2p::{DisputeResolution, NewP2pOrder, P2pEngine, P2pSide, P2pStatus};
use crossflow::scheduler::{Schedule, Scheduler};
use crossflow::store::{MemoryStore, P2pStore};
use crossflow::wallet::{InMemoryWallet, PLATFORM_ACCOUNT, WalletAdapter};

const MAKER: i64 = 1;
const TAKER: i64 = 2;

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn ton() -> Token {
    Token::new("TON")
}

/// Engine with a 50 bps platform fee; maker holds 10 TON.
fn harness() -> (Arc<P2pEngine>, Arc<MemoryStore>, Arc<InMemoryWallet>) {
    let store = Arc::new(MemoryStore::new());
    let wallet = Arc::new(InMemoryWallet::new());
    wallet.deposit(MAKER, &ton(), d("10"));
    let engine = Arc::new(P2pEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        wallet.clone(),
        Arc::new(LogNotifier),
        50,
    ));
    (engine, store, wallet)
}

/// Spendable + escrowed TON across every account.
async fn total_ton(wallet: &InMemoryWallet, order_id: i64) -> Decimal {
    let mut total = Decimal::ZERO;
    for user in [MAKER, TAKER, PLATFORM_ACCOUNT] {
        total += wallet.get_balance(user, &ton()).await.unwrap();
    }
    total + wallet.escrowed(order_id).await.unwrap().unwrap_or(Decimal::ZERO)
}

#[tokio::test]
async fn sell_ad_happy_path_shifts_exactly_amount_minus_fee() {
    let (engine, _, wallet) = harness();
    let ad = engine
        .create_order(MAKER, P2pSide::Sell, ton(), Token::new("USDT"), d("10"), d("5"), "bank")
        .await
        .unwrap();

    engine.take_order(ad.id, TAKER).await.unwrap();
    // escrow holds exactly crypto_amount while the deal is live
    assert_eq!(wallet.escrowed(ad.id).await.unwrap(), Some(d("10")));
    assert_eq!(total_ton(&wallet, ad.id).await, d("10"));

    engine.confirm_payment(ad.id, TAKER).await.unwrap();
    assert_eq!(wallet.escrowed(ad.id).await.unwrap(), Some(d("10")));

    engine.release(ad.id, MAKER).await.unwrap();
    // taker got 10 - 0.05 fee; platform got the fee; nothing vanished
    assert_eq!(wallet.get_balance(TAKER, &ton()).await.unwrap(), d("9.95"));
    assert_eq!(
        wallet.get_balance(PLATFORM_ACCOUNT, &ton()).await.unwrap(),
        d("0.05")
    );
    assert_eq!(wallet.get_balance(MAKER, &ton()).await.unwrap(), d("0"));
    assert_eq!(total_ton(&wallet, ad.id).await, d("10"));

    // one five-star review from the taker, exactly once
    engine
        .submit_review(ad.id, TAKER, 5, Some("great".into()))
        .await
        .unwrap();
    assert!(engine.submit_review(ad.id, TAKER, 5, None).await.is_err());
    let stats = engine.user_stats(MAKER).await.unwrap();
    assert_eq!(stats.completed_deals, 1);
    assert_eq!(stats.average_rating, Some(d("5")));
}

#[tokio::test]
async fn dispute_at_payment_sent_refunds_maker_in_full() {
    let (engine, _, wallet) = harness();
    let ad = engine
        .create_order(MAKER, P2pSide::Sell, ton(), Token::new("USDT"), d("10"), d("5"), "bank")
        .await
        .unwrap();
    engine.take_order(ad.id, TAKER).await.unwrap();
    engine.confirm_payment(ad.id, TAKER).await.unwrap();

    engine
        .open_dispute(ad.id, MAKER, "payment never arrived")
        .await
        .unwrap();
    let resolved = engine
        .resolve_dispute(ad.id, DisputeResolution::Refund)
        .await
        .unwrap();

    assert_eq!(resolved.status, P2pStatus::Cancelled);
    // the 10 TON went back to the maker, the taker is untouched
    assert_eq!(wallet.get_balance(MAKER, &ton()).await.unwrap(), d("10"));
    assert_eq!(wallet.get_balance(TAKER, &ton()).await.unwrap(), d("0"));
    assert_eq!(wallet.escrowed(ad.id).await.unwrap(), None);
}

#[tokio::test]
async fn scheduler_sweep_cancels_expired_open_ads() {
    let (engine, store, wallet) = harness();

    // an OPEN ad already past its deadline
    let expired = store
        .insert_p2p(NewP2pOrder {
            maker_id: MAKER,
            side: P2pSide::Sell,
            base_currency: ton(),
            quote_currency: Token::new("USDT"),
            crypto_amount: d("1"),
            price: d("5"),
            payment_method_id: "bank".into(),
            expires_at: Utc::now() - chrono::Duration::minutes(1),
        })
        .await
        .unwrap();
    // and a live deal that must not be touched
    let live = engine
        .create_order(MAKER, P2pSide::Sell, ton(), Token::new("USDT"), d("2"), d("5"), "bank")
        .await
        .unwrap();

    let mut scheduler = Scheduler::new();
    {
        let engine = engine.clone();
        scheduler.register("p2p.sweep_expired", Schedule::Every(Duration::ZERO), move || {
            let engine = engine.clone();
            async move {
                engine.sweep_expired().await?;
                Ok(())
            }
        });
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(scheduler.tick_once().await, 1);

    let row = store.get_p2p(expired.id).await.unwrap().unwrap();
    assert_eq!(row.status, P2pStatus::Cancelled);
    // nothing was escrowed, so nothing moved
    assert_eq!(wallet.escrowed(expired.id).await.unwrap(), None);
    assert_eq!(wallet.get_balance(MAKER, &ton()).await.unwrap(), d("10"));

    let untouched = store.get_p2p(live.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, P2pStatus::Open);
}
