//! Nullable identity registry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tollgate_chain::{ChainError, RegistrationStatusProvider};
use tollgate_types::{ChainId, Identity, RegistrationStatus};

/// Registration statuses set by the test. Unknown identities are unregistered.
#[derive(Default)]
pub struct NullRegistry {
    statuses: Mutex<HashMap<(ChainId, Identity), RegistrationStatus>>,
}

impl NullRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, chain_id: ChainId, identity: &Identity, status: RegistrationStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((chain_id, identity.clone()), status);
    }
}

#[async_trait]
impl RegistrationStatusProvider for NullRegistry {
    async fn get_registration_status(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<RegistrationStatus, ChainError> {
        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(chain_id, identity.clone()))
            .copied()
            .unwrap_or_default())
    }
}
