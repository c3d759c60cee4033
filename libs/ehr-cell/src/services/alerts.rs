// =====================================================================================
// OPERATOR ALERT SERVICE
// =====================================================================================
//
// In-process registry of conditions that need a human: sync retry exhaustion,
// fallback identity matches that were deliberately not merged, invariant
// breaks. Alerts are structured so operators get enough detail to finish a
// sync manually.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub alert_id: String,
    pub severity: AlertSeverity,
    pub component: String,
    pub title: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

pub struct OperatorAlertService {
    active_alerts: Arc<RwLock<HashMap<String, OperatorAlert>>>,
}

impl OperatorAlertService {
    pub fn new() -> Self {
        Self {
            active_alerts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn raise(
        &self,
        severity: AlertSeverity,
        component: &str,
        title: &str,
        detail: String,
    ) -> String {
        let alert = OperatorAlert {
            alert_id: Uuid::new_v4().to_string(),
            severity: severity.clone(),
            component: component.to_string(),
            title: title.to_string(),
            detail,
            timestamp: Utc::now(),
        };

        match severity {
            AlertSeverity::Critical => {
                error!(
                    alert_id = %alert.alert_id,
                    component = %alert.component,
                    detail = %alert.detail,
                    "CRITICAL ALERT: {}", alert.title
                );
            }
            AlertSeverity::Warning => {
                warn!(
                    alert_id = %alert.alert_id,
                    component = %alert.component,
                    detail = %alert.detail,
                    "WARNING ALERT: {}", alert.title
                );
            }
            AlertSeverity::Info => {
                info!(
                    alert_id = %alert.alert_id,
                    component = %alert.component,
                    "INFO ALERT: {}", alert.title
                );
            }
        }

        let alert_id = alert.alert_id.clone();
        let mut active = self.active_alerts.write().await;
        active.insert(alert_id.clone(), alert);
        alert_id
    }

    pub async fn active_alerts(&self) -> Vec<OperatorAlert> {
        let alerts = self.active_alerts.read().await;
        alerts.values().cloned().collect()
    }

    pub async fn acknowledge(&self, alert_id: &str) -> bool {
        let mut alerts = self.active_alerts.write().await;
        alerts.remove(alert_id).is_some()
    }
}

impl Default for OperatorAlertService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raised_alerts_are_listed_and_acknowledged() {
        let service = OperatorAlertService::new();

        let id = service
            .raise(
                AlertSeverity::Warning,
                "ehr-sync",
                "appointment sync failed",
                "reservation abc needs manual sync".to_string(),
            )
            .await;

        let active = service.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].component, "ehr-sync");

        assert!(service.acknowledge(&id).await);
        assert!(service.active_alerts().await.is_empty());
    }
}
