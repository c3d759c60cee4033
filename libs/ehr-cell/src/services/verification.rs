// libs/ehr-cell/src/services/verification.rs
//
// The EHR is eventually consistent: a just-written client record is not
// immediately readable. Before any appointment references it, poll until the
// record is externally queryable.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use shared_config::AppConfig;

use crate::models::{EhrClientId, EhrClientRecord, EhrError};
use crate::services::client::EhrApiClient;
use crate::services::retry::{retry_with_backoff, BackoffPolicy, Sleep};

pub struct PropagationVerifier {
    initial_delay: Duration,
    policy: BackoffPolicy,
    sleep: Arc<dyn Sleep>,
}

impl PropagationVerifier {
    pub fn new(initial_delay: Duration, policy: BackoffPolicy, sleep: Arc<dyn Sleep>) -> Self {
        Self {
            initial_delay,
            policy,
            sleep,
        }
    }

    pub fn from_config(config: &AppConfig, sleep: Arc<dyn Sleep>) -> Self {
        let base = BackoffPolicy::from_config(config);
        Self {
            initial_delay: Duration::from_millis(config.ehr_backoff_base_ms),
            policy: BackoffPolicy {
                max_attempts: 4,
                ..base
            },
            sleep,
        }
    }

    /// Wait until the given client is readable through the EHR's public
    /// surface: one fixed initial delay, then up to `max_attempts` reads with
    /// exponential backoff. Exhaustion fails the whole client-ensure
    /// operation; callers decide whether to retry the larger unit.
    pub async fn await_client_visible(
        &self,
        api: &EhrApiClient,
        client_id: &EhrClientId,
    ) -> Result<EhrClientRecord, EhrError> {
        debug!(
            "Verifying propagation of EHR client {} (initial delay {:?})",
            client_id, self.initial_delay
        );
        self.sleep.sleep(self.initial_delay).await;

        let record = retry_with_backoff(
            &self.policy,
            self.sleep.as_ref(),
            "verify_client_propagation",
            |_| api.get_client(client_id),
        )
        .await?;

        info!("EHR client {} confirmed externally readable", client_id);
        Ok(record)
    }
}
