// libs/ehr-cell/src/services/client.rs
use chrono::NaiveDate;
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{
    normalize_client_id, ClientSearchQuery, CreateEhrAppointmentRequest, CreateEhrClientRequest,
    EhrAppointment, EhrClientId, EhrClientRecord, EhrError,
};
use crate::services::gateway::RateLimitedGateway;

/// HTTP client for the external EHR. Every request is admitted through the
/// shared rate-limited gateway; responses are classified into the transient /
/// permanent taxonomy before anything else sees them.
pub struct EhrApiClient {
    client: Client,
    base_url: String,
    api_key: String,
    gateway: Arc<RateLimitedGateway>,
}

impl EhrApiClient {
    pub fn new(config: &AppConfig, gateway: Arc<RateLimitedGateway>) -> Result<Self, EhrError> {
        if !config.is_ehr_configured() {
            return Err(EhrError::NotConfigured);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| EhrError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.ehr_base_url.clone(),
            api_key: config.ehr_api_key.clone(),
            gateway,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, EhrError> {
        let url = format!("{}{}", self.base_url, path);

        self.gateway
            .run(|| async {
                debug!("EHR request: {} {}", method, url);

                let mut req = self
                    .client
                    .request(method.clone(), &url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json");
                if let Some(body_data) = &body {
                    req = req.json(body_data);
                }

                let response = req.send().await?;
                let status = response.status();
                let text = response.text().await.unwrap_or_default();

                if !status.is_success() {
                    error!("EHR error ({}): {}", status, text);
                    return Err(classify_failure(status.as_u16(), &text));
                }

                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&text).map_err(|e| EhrError::Decode(e.to_string()))
            })
            .await
    }

    /// POST /api/v1/clients
    pub async fn create_client(
        &self,
        request: &CreateEhrClientRequest,
    ) -> Result<EhrClientId, EhrError> {
        info!("Creating EHR client for {}", request.email);

        let body = serde_json::to_value(request).map_err(|e| EhrError::Decode(e.to_string()))?;
        let response = self.send(Method::POST, "/api/v1/clients", Some(body)).await?;

        let raw_id = response.get("id").unwrap_or(&response);
        let client_id = normalize_client_id(raw_id)?;
        info!("EHR client created: {}", client_id);
        Ok(client_id)
    }

    /// GET /api/v1/clients/{id}
    pub async fn get_client(&self, id: &EhrClientId) -> Result<EhrClientRecord, EhrError> {
        let path = format!("/api/v1/clients/{}", id);
        let response = self.send(Method::GET, &path, None).await?;
        serde_json::from_value(response).map_err(|e| EhrError::Decode(e.to_string()))
    }

    /// PATCH /api/v1/clients/{id}
    pub async fn update_client(&self, id: &EhrClientId, patch: Value) -> Result<(), EhrError> {
        debug!("Updating EHR client {}", id);
        let path = format!("/api/v1/clients/{}", id);
        self.send(Method::PATCH, &path, Some(patch)).await?;
        Ok(())
    }

    /// GET /api/v1/clients/search
    pub async fn search_clients(
        &self,
        query: &ClientSearchQuery,
    ) -> Result<Vec<EhrClientRecord>, EhrError> {
        let mut params = Vec::new();
        if let Some(email) = &query.email {
            params.push(format!("email={}", urlencoding::encode(email)));
        }
        if let Some(last_name) = &query.last_name {
            params.push(format!("last_name={}", urlencoding::encode(last_name)));
        }
        if let Some(dob) = &query.date_of_birth {
            params.push(format!("date_of_birth={}", urlencoding::encode(dob)));
        }

        let path = format!("/api/v1/clients/search?{}", params.join("&"));
        let response = self.send(Method::GET, &path, None).await?;

        // Not-found on a search is an empty result, not a propagation race.
        let records = match response {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<EhrClientRecord>, _>>()
                .map_err(|e| EhrError::Decode(e.to_string()))?,
            other => {
                return Err(EhrError::Decode(format!(
                    "unexpected search response shape: {}",
                    other
                )))
            }
        };
        Ok(records)
    }

    /// POST /api/v1/appointments
    pub async fn create_appointment(
        &self,
        request: &CreateEhrAppointmentRequest,
    ) -> Result<String, EhrError> {
        info!(
            "Creating EHR appointment for client {} at {}",
            request.client_id, request.start_time
        );

        let body = serde_json::to_value(request).map_err(|e| EhrError::Decode(e.to_string()))?;
        let response = self
            .send(Method::POST, "/api/v1/appointments", Some(body))
            .await?;

        let raw_id = response.get("id").unwrap_or(&response);
        let appointment_id = normalize_client_id(raw_id)
            .map_err(|_| EhrError::InvalidClientId(format!("appointment id missing: {}", response)))?;
        Ok(appointment_id.as_str().to_string())
    }

    /// GET /api/v1/appointments?provider_ref=…&date=…
    pub async fn list_appointments(
        &self,
        provider_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<EhrAppointment>, EhrError> {
        let path = format!(
            "/api/v1/appointments?provider_ref={}&date={}",
            provider_id,
            date.format("%Y-%m-%d")
        );
        let response = self.send(Method::GET, &path, None).await?;

        match response {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<EhrAppointment>, _>>()
                .map_err(|e| EhrError::Decode(e.to_string())),
            other => Err(EhrError::Decode(format!(
                "unexpected appointment list shape: {}",
                other
            ))),
        }
    }

    /// POST /api/v1/questionnaires/send
    pub async fn send_questionnaire(
        &self,
        client_id: &EhrClientId,
        questionnaire: &str,
    ) -> Result<(), EhrError> {
        let body = serde_json::json!({
            "client_id": client_id.as_str(),
            "questionnaire": questionnaire,
        });
        self.send(Method::POST, "/api/v1/questionnaires/send", Some(body))
            .await?;
        Ok(())
    }
}

fn classify_failure(status: u16, body: &str) -> EhrError {
    match status {
        429 => EhrError::RateLimited,
        500..=599 => EhrError::Server {
            status,
            message: body.to_string(),
        },
        404 => EhrError::ClientNotFound,
        _ if body.to_lowercase().contains("client not found") => EhrError::ClientNotFound,
        _ => EhrError::Api {
            status,
            message: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn classifies_rate_limit_and_server_errors() {
        assert_matches!(classify_failure(429, ""), EhrError::RateLimited);
        assert_matches!(classify_failure(500, "oops"), EhrError::Server { status: 500, .. });
        assert_matches!(classify_failure(503, ""), EhrError::Server { status: 503, .. });
    }

    #[test]
    fn classifies_propagation_race() {
        assert_matches!(classify_failure(404, ""), EhrError::ClientNotFound);
        assert_matches!(
            classify_failure(400, "Client not found for id 99"),
            EhrError::ClientNotFound
        );
    }

    #[test]
    fn other_client_errors_are_permanent() {
        assert_matches!(classify_failure(422, "bad dob"), EhrError::Api { status: 422, .. });
        assert_matches!(classify_failure(401, ""), EhrError::Api { status: 401, .. });
    }
}
