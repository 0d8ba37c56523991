//! Crossflow - Multi-Venue Crypto Trading Backend
//!
//! DEX aggregation, conditional spot orders, and P2P fiat/crypto deals
//! with platform escrow, plus the machinery that keeps them honest.
//!
//! # Modules
//!
//! - [`core_types`] - Id and symbol newtypes shared everywhere
//! - [`config`] - Environment-driven configuration
//! - [`money`] - Decimal validation and basis-point math
//! - [`cache`] - Typed TTL key-value store (C1)
//! - [`venue`] - Per-DEX HTTP clients (C2)
//! - [`dex`] - Quote fan-out, best route, swap cascade (C3)
//! - [`orders`] - Spot order lifecycle and trigger watcher (C4)
//! - [`p2p`] - Escrowed P2P state machine (C5)
//! - [`scheduler`] - Periodic job runner (C6)
//! - [`telemetry`] - Prometheus metrics and samplers (C7)
//! - [`wallet`] - External signer contract (C8)
//! - [`notify`] - Outbound notification port (C9)
//! - [`store`] - Repository traits, memory + Postgres backends
//! - [`copytrade`] - Follower fan-out on completed orders
//! - [`events`] - Order event bus
//! - [`fees`] - Fee table and fee-day notice
//! - [`backup`] - Database snapshot job
//! - [`withdraw`] - Withdrawal request flow

// Core types - must be first!
pub mod core_types;

// Configuration
pub mod config;
pub mod logging;

// Shared plumbing
pub mod cache;
pub mod events;
pub mod money;
pub mod notify;
pub mod store;
pub mod telemetry;
pub mod wallet;

// Trading components
pub mod copytrade;
pub mod dex;
pub mod orders;
pub mod p2p;
pub mod venue;

// Operational machinery
pub mod backup;
pub mod fees;
pub mod scheduler;
pub mod withdraw;

// Convenient re-exports at crate root
pub use cache::{CacheError, CacheStore, MemoryCache};
pub use config::{AppConfig, ConfigError};
pub use core_types::{Network, OrderId, P2pOrderId, Token, UserId};
pub use dex::{AggregatorError, DexAggregator, SwapOutcome};
pub use events::{EventBus, OrderCompleted};
pub use orders::{OrderEngine, OrderError, OrderStatus, OrderType, SpotOrder, TriggerWatcher};
pub use p2p::{P2pEngine, P2pError, P2pOrder, P2pSide, P2pStatus};
pub use scheduler::{Schedule, Scheduler};
pub use store::{MemoryStore, PgStore, StoreError};
pub use venue::{Quote, VenueClient, VenueError};
pub use wallet::{InMemoryWallet, WalletAdapter, WalletError};
