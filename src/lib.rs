//! TradeFeed Library
//!
//! Real-time data core for a crypto trading dashboard: pushed trading
//! signals and polled market prices, fanned out to in-process subscribers.

pub mod clock;
pub mod config;
pub mod prices;
pub mod signals;
pub mod telemetry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use prices::{PriceFeedManager, PriceFeedStatus};
pub use signals::{ConnectionState, FilterCriteria, LiveSignals, SignalIngestClient, SignalRouter};
pub use types::{ParsedSignal, PriceTick, Side, Strength, SubscriberHandle};
