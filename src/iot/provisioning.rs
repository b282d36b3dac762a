//! Device provisioning service registration over HTTPS
//!
//! `PUT {endpoint}/{idScope}/registrations/{id}/register` starts an
//! operation which is polled until it leaves `assigning`.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};

use super::sas::{generate_sas_token, url_encode};

const API_VERSION: &str = "2021-06-01";
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Hub assignment returned by a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub assigned_hub: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest<'a> {
    registration_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<ModelPayload<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelPayload<'a> {
    model_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    operation_id: String,
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Clone)]
pub struct ProvisioningClient {
    http: Client,
    base_url: String,
    id_scope: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl ProvisioningClient {
    /// `endpoint` is a host name (HTTPS assumed) or a full base URL.
    pub fn new(http: Client, endpoint: &str, id_scope: &str) -> Self {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };

        Self {
            http,
            base_url,
            id_scope: id_scope.to_string(),
            poll_interval: Duration::from_secs(2),
            max_polls: 30,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn authorization(&self, registration_id: &str, device_key: &str) -> Result<String> {
        let resource = format!("{}/registrations/{}", self.id_scope, registration_id);
        let expiry = chrono::Utc::now().timestamp() + TOKEN_LIFETIME_SECS;
        generate_sas_token(&resource, device_key, Some("registration"), expiry)
    }

    /// Register `registration_id` with its derived symmetric key.
    pub async fn register(
        &self,
        registration_id: &str,
        device_key: &str,
        model_id: Option<&str>,
    ) -> Result<DeviceRegistration> {
        let authorization = self.authorization(registration_id, device_key)?;
        let registrations = format!(
            "{}/{}/registrations/{}",
            self.base_url,
            url_encode(&self.id_scope),
            url_encode(registration_id)
        );

        info!(registration_id, "Registering device with provisioning service");

        let response = self
            .http
            .put(format!("{}/register?api-version={}", registrations, API_VERSION))
            .header("Authorization", &authorization)
            .json(&RegistrationRequest {
                registration_id,
                payload: model_id.map(|model_id| ModelPayload { model_id }),
            })
            .send()
            .await?;

        let mut operation = Self::operation(registration_id, response).await?;

        let mut polls = 0;
        while operation.status.eq_ignore_ascii_case("assigning") {
            polls += 1;
            if polls > self.max_polls {
                return Err(self.failed(registration_id, "assigning timed out"));
            }
            tokio::time::sleep(self.poll_interval).await;

            debug!(registration_id, operation_id = %operation.operation_id, "Polling registration");
            let response = self
                .http
                .get(format!(
                    "{}/operations/{}?api-version={}",
                    registrations,
                    url_encode(&operation.operation_id),
                    API_VERSION
                ))
                .header("Authorization", &authorization)
                .send()
                .await?;
            operation = Self::operation(registration_id, response).await?;
        }

        if !operation.status.eq_ignore_ascii_case("assigned") {
            warn!(registration_id, "Registration ended with status {}", operation.status);
            return Err(self.failed(registration_id, &operation.status));
        }

        let state = operation.registration_state.unwrap_or(RegistrationState {
            assigned_hub: None,
            device_id: None,
        });
        let assigned_hub = state
            .assigned_hub
            .ok_or_else(|| self.failed(registration_id, "assigned without a hub"))?;

        info!(registration_id, "Device assigned to {}", assigned_hub);
        Ok(DeviceRegistration {
            assigned_hub,
            device_id: state
                .device_id
                .unwrap_or_else(|| registration_id.to_string()),
        })
    }

    async fn operation(
        registration_id: &str,
        response: reqwest::Response,
    ) -> Result<RegistrationOperation> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::ProvisioningFailed {
                device_id: registration_id.parse().unwrap_or_default(),
                status: format!("HTTP {}: {}", status, body),
            });
        }
        Ok(response.json().await?)
    }

    fn failed(&self, registration_id: &str, status: &str) -> ConnectorError {
        ConnectorError::ProvisioningFailed {
            device_id: registration_id.parse().unwrap_or_default(),
            status: status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeDps {
        polls: AtomicUsize,
        outcome: Mutex<String>,
        bodies: Mutex<Vec<Value>>,
    }

    async fn fake_dps(outcome: &str) -> (String, Arc<FakeDps>) {
        let dps = Arc::new(FakeDps::default());
        *dps.outcome.lock().unwrap() = outcome.to_string();

        let app = Router::new()
            .route(
                "/{scope}/registrations/{id}/register",
                put(
                    |State(dps): State<Arc<FakeDps>>,
                     Path((_scope, _id)): Path<(String, String)>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        if !auth.starts_with("SharedAccessSignature ")
                            || !auth.ends_with("&skn=registration")
                        {
                            return Err(StatusCode::UNAUTHORIZED);
                        }
                        dps.bodies.lock().unwrap().push(body);
                        Ok(Json(json!({"operationId": "op-1", "status": "assigning"})))
                    },
                ),
            )
            .route(
                "/{scope}/registrations/{id}/operations/{op}",
                get(
                    |State(dps): State<Arc<FakeDps>>,
                     Path((_scope, id, _op)): Path<(String, String, String)>| async move {
                        if dps.polls.fetch_add(1, Ordering::SeqCst) == 0 {
                            return Json(json!({"operationId": "op-1", "status": "assigning"}));
                        }
                        let outcome = dps.outcome.lock().unwrap().clone();
                        Json(json!({
                            "operationId": "op-1",
                            "status": outcome,
                            "registrationState": {
                                "assignedHub": "assigned-hub.example.net",
                                "deviceId": id,
                                "status": outcome
                            }
                        }))
                    },
                ),
            )
            .with_state(Arc::clone(&dps));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), dps)
    }

    const DEVICE_KEY: &str = "xa6WZG/4NUzIF1VmCgPS2+rHGQEaqk+I9Q8J8NgI0tM=";

    #[tokio::test]
    async fn test_register_polls_until_assigned() {
        let (base_url, dps) = fake_dps("assigned").await;
        let client = ProvisioningClient::new(Client::new(), &base_url, "0ne00000000")
            .with_poll_interval(Duration::from_millis(5));

        let registration = client
            .register("42", DEVICE_KEY, Some("dtmi:example:light;1"))
            .await
            .unwrap();

        assert_eq!(registration.assigned_hub, "assigned-hub.example.net");
        assert_eq!(registration.device_id, "42");
        assert_eq!(dps.polls.load(Ordering::SeqCst), 2);

        let bodies = dps.bodies.lock().unwrap();
        assert_eq!(bodies[0]["registrationId"], "42");
        assert_eq!(bodies[0]["payload"]["modelId"], "dtmi:example:light;1");
    }

    #[tokio::test]
    async fn test_register_without_model_id_omits_payload() {
        let (base_url, dps) = fake_dps("assigned").await;
        let client = ProvisioningClient::new(Client::new(), &base_url, "0ne00000000")
            .with_poll_interval(Duration::from_millis(5));

        client.register("7", DEVICE_KEY, None).await.unwrap();
        assert!(dps.bodies.lock().unwrap()[0].get("payload").is_none());
    }

    #[tokio::test]
    async fn test_register_failed_status() {
        let (base_url, _dps) = fake_dps("disabled").await;
        let client = ProvisioningClient::new(Client::new(), &base_url, "0ne00000000")
            .with_poll_interval(Duration::from_millis(5));

        let err = client.register("42", DEVICE_KEY, None).await.unwrap_err();
        match err {
            ConnectorError::ProvisioningFailed { device_id, status } => {
                assert_eq!(device_id, 42);
                assert_eq!(status, "disabled");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_host_name_endpoint_gets_https() {
        let client = ProvisioningClient::new(
            Client::new(),
            "global.azure-devices-provisioning.net",
            "0ne00000000",
        );
        assert_eq!(client.base_url, "https://global.azure-devices-provisioning.net");
    }
}
