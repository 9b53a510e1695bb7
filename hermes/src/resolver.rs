//! Maps a chain and hermes to the client that talks to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tollgate_types::{ChainId, HermesId};

use crate::{HermesApi, HermesCaller, HermesError};

pub trait HermesResolver: Send + Sync {
    /// The hermes new promises on `chain_id` should go through.
    fn active_hermes(&self, chain_id: ChainId) -> Result<HermesId, HermesError>;

    /// A client for `hermes_id` on `chain_id`.
    fn caller(&self, chain_id: ChainId, hermes_id: &HermesId)
        -> Result<Arc<dyn HermesApi>, HermesError>;

    /// Hermeses on `chain_id` that no longer issue promises but may still
    /// hold unsettled earnings.
    fn inactive_hermeses(&self, chain_id: ChainId) -> Result<Vec<HermesId>, HermesError>;
}

/// A configured hermes instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HermesEndpoint {
    pub chain_id: ChainId,
    pub hermes_id: HermesId,
    pub url: String,
    /// Whether new promises are requested from this hermes.
    #[serde(default)]
    pub active: bool,
}

/// Resolves hermes from a static endpoint list. Clients are built lazily and
/// shared per URL.
pub struct HttpHermesResolver {
    endpoints: Vec<HermesEndpoint>,
    timeout: Duration,
    callers: Mutex<HashMap<String, Arc<HermesCaller>>>,
}

impl HttpHermesResolver {
    pub fn new(endpoints: Vec<HermesEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoints,
            timeout,
            callers: Mutex::new(HashMap::new()),
        }
    }

    fn endpoint(&self, chain_id: ChainId, hermes_id: &HermesId) -> Option<&HermesEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.chain_id == chain_id && &e.hermes_id == hermes_id)
    }
}

impl HermesResolver for HttpHermesResolver {
    fn active_hermes(&self, chain_id: ChainId) -> Result<HermesId, HermesError> {
        let on_chain = || self.endpoints.iter().filter(|e| e.chain_id == chain_id);
        on_chain()
            .find(|e| e.active)
            .or_else(|| on_chain().next())
            .map(|e| e.hermes_id.clone())
            .ok_or_else(|| HermesError::UnknownHermes(format!("chain {chain_id}")))
    }

    fn caller(
        &self,
        chain_id: ChainId,
        hermes_id: &HermesId,
    ) -> Result<Arc<dyn HermesApi>, HermesError> {
        let endpoint = self
            .endpoint(chain_id, hermes_id)
            .ok_or_else(|| HermesError::UnknownHermes(format!("{hermes_id} on chain {chain_id}")))?;

        let mut callers = self.callers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(caller) = callers.get(&endpoint.url) {
            return Ok(caller.clone());
        }
        let caller = Arc::new(HermesCaller::new(endpoint.url.clone(), self.timeout)?);
        tracing::debug!(hermes = %hermes_id, url = %endpoint.url, "created hermes caller");
        callers.insert(endpoint.url.clone(), caller.clone());
        Ok(caller)
    }

    fn inactive_hermeses(&self, chain_id: ChainId) -> Result<Vec<HermesId>, HermesError> {
        let active = self.active_hermes(chain_id)?;
        Ok(self
            .endpoints
            .iter()
            .filter(|e| e.chain_id == chain_id && e.hermes_id != active)
            .map(|e| e.hermes_id.clone())
            .collect())
    }
}
