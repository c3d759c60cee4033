// libs/booking-cell/src/services/service_resolver.rs
//
// Payer to canonical service mapping. Everything this can fail with is a
// configuration problem, so none of its errors are ever retried.

use reqwest::Method;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use shared_database::StoreClient;

use crate::models::{BookingError, ResolvedService, ServiceInstance};

pub struct ServiceResolver {
    store: Arc<StoreClient>,
}

impl ServiceResolver {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Map a raw payer identifier to exactly one active service instance and
    /// its duration. A payer-specific offering beats the global default.
    pub async fn resolve(&self, payer_id_raw: &str) -> Result<ResolvedService, BookingError> {
        let payer_id = Uuid::parse_str(payer_id_raw.trim())
            .map_err(|_| BookingError::InvalidPayerId(payer_id_raw.to_string()))?;

        let path = format!(
            "/rest/v1/service_instances?active=eq.true&or=(payer_id.eq.{},payer_id.is.null)",
            payer_id
        );
        let instances: Vec<ServiceInstance> =
            self.store.request(Method::GET, &path, None).await?;

        debug!(
            "Service resolution for payer {}: {} active instance(s)",
            payer_id,
            instances.len()
        );

        let chosen = select_instance(payer_id, &instances)
            .ok_or(BookingError::NoServiceForPayer(payer_id))?;

        let duration = chosen
            .duration_minutes
            .filter(|d| *d > 0)
            .ok_or(BookingError::MissingDuration(chosen.id))?;

        Ok(ResolvedService {
            service_instance_id: chosen.id,
            name: chosen.name.clone(),
            duration_minutes: duration,
        })
    }

    /// Look up an instance already referenced by a reservation, even when the
    /// payer mapping has since changed. The reservation row itself carries the
    /// authoritative duration, so a missing one here is not an error.
    pub async fn describe(&self, service_instance_id: Uuid) -> Result<ResolvedService, BookingError> {
        let path = format!("/rest/v1/service_instances?id=eq.{}", service_instance_id);
        let instances: Vec<ServiceInstance> = self.store.request(Method::GET, &path, None).await?;

        let instance = instances.into_iter().next().ok_or_else(|| {
            BookingError::Internal(format!(
                "service instance {} referenced by a reservation no longer exists",
                service_instance_id
            ))
        })?;

        Ok(ResolvedService {
            service_instance_id: instance.id,
            name: instance.name,
            duration_minutes: instance.duration_minutes.unwrap_or_default(),
        })
    }
}

/// Pick the offering for a payer: payer-specific first, global default second.
fn select_instance(payer_id: Uuid, instances: &[ServiceInstance]) -> Option<&ServiceInstance> {
    instances
        .iter()
        .find(|i| i.payer_id == Some(payer_id))
        .or_else(|| instances.iter().find(|i| i.payer_id.is_none()))
}
