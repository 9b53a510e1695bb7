//! Client for hermes, the payment intermediary that countersigns promises.
//!
//! [`HermesApi`] is the contract the payment core depends on;
//! [`HermesCaller`] implements it over HTTP. [`HermesResolver`] maps a
//! (chain, hermes) pair to the client that talks to it.

pub mod api;
pub mod caller;
pub mod error;
pub mod resolver;

pub use api::{
    ConsumerData, HermesApi, LatestPromise, ProviderData, RRecoveryDetails, RefreshPromiseRequest,
    RequestPromise,
};
pub use caller::HermesCaller;
pub use error::{HermesCause, HermesError};
pub use resolver::{HermesEndpoint, HermesResolver, HttpHermesResolver};
