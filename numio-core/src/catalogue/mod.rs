//! The offer catalogue.
//!
//! [`price`] turns upstream raw costs into sell prices; [`sync`] brings
//! every active provider's countries, services, pricing and aggregates to
//! a consistent state.

pub mod price;
pub mod sync;

pub use price::{PricingPolicy, sell_price};
pub use sync::ProviderSyncer;
