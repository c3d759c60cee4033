use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use patient_cell::models::{MatchConfidence, PatientDescriptor, PatientRef};
use patient_cell::services::identity::IdentityResolutionService;
use shared_config::AppConfig;
use shared_database::StoreClient;

fn test_config(store_uri: &str) -> AppConfig {
    AppConfig {
        store_url: store_uri.to_string(),
        store_api_key: "test-key".to_string(),
        ehr_base_url: String::new(),
        ehr_api_key: String::new(),
        ehr_rate_limit_burst: 10,
        ehr_rate_limit_per_second: 1000.0,
        ehr_max_concurrent: 4,
        ehr_queue_depth: 16,
        http_timeout_seconds: 5,
        ehr_backoff_base_ms: 5,
        ehr_max_attempts: 4,
        ehr_cache_ttl_seconds: 60,
    }
}

fn patient_row(id: Uuid, phone: Option<&str>, dob: Option<&str>) -> Value {
    json!({
        "id": id,
        "first_name": "Jane",
        "last_name": "Doe",
        "email": "jane.doe@example.com",
        "phone": phone,
        "date_of_birth": dob,
        "ehr_client_id": null,
        "ehr_email_alias": null,
        "status": "active",
        "referral_source": null,
        "created_at": "2026-01-10T09:00:00Z",
        "updated_at": "2026-01-10T09:00:00Z",
    })
}

fn descriptor(phone: Option<&str>, dob: Option<&str>) -> PatientRef {
    PatientRef::New {
        descriptor: PatientDescriptor {
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            email: "jane.doe@example.com".to_string(),
            phone: phone.map(str::to_string),
            date_of_birth: dob.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
        },
        referral: None,
    }
}

#[tokio::test]
async fn strong_match_backfills_missing_phone() {
    let store = MockServer::start().await;
    let patient_id = Uuid::new_v4();

    // The row matched on email + name + dob but was created without a phone.
    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([patient_row(patient_id, None, Some("1990-01-01"))])),
        )
        .mount(&store)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/patients"))
        .and(body_partial_json(json!({ "phone": "555-010-2233" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([patient_row(
            patient_id,
            Some("555-010-2233"),
            Some("1990-01-01")
        )])))
        .expect(1)
        .mount(&store)
        .await;

    let identity = IdentityResolutionService::new(Arc::new(StoreClient::new(&test_config(
        &store.uri(),
    ))));
    let (patient, confidence) = identity
        .resolve(&descriptor(Some("555-010-2233"), Some("1990-01-01")))
        .await
        .unwrap();

    assert_eq!(confidence, MatchConfidence::Strong);
    assert_eq!(patient.id, patient_id);
    assert_eq!(patient.phone.as_deref(), Some("555-010-2233"));
}

#[tokio::test]
async fn complete_row_is_not_rewritten_on_match() {
    let store = MockServer::start().await;
    let patient_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([patient_row(
            patient_id,
            Some("5550102233"),
            Some("1990-01-01")
        )])))
        .mount(&store)
        .await;

    // Every identity field is already present, so no update is issued.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/patients"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&store)
        .await;

    let identity = IdentityResolutionService::new(Arc::new(StoreClient::new(&test_config(
        &store.uri(),
    ))));
    let (patient, confidence) = identity
        .resolve(&descriptor(Some("5550102233"), Some("1990-01-01")))
        .await
        .unwrap();

    assert_eq!(confidence, MatchConfidence::Strong);
    assert_eq!(patient.id, patient_id);
}
