//! REST client for the payment provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{CorrelationId, CreatedAgreement, PaymentProvider, ProviderError};
use crate::agreements::AgreementStatus;
use crate::error::{BillingError, BillingResult};
use crate::plans::BillingPlan;

const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// Connection settings for [`HttpProviderClient`]
#[derive(Debug, Clone)]
pub struct ProviderClientConfig {
    pub base_url: String,
    pub access_token: String,
    /// Applies to every call, including each retry of a status read
    pub timeout: Duration,
    /// Extra attempts for the (idempotent) status read
    pub status_retries: usize,
    /// First backoff step in milliseconds
    pub retry_base_millis: u64,
}

impl ProviderClientConfig {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: access_token.into(),
            timeout,
            status_retries: 2,
            retry_base_millis: 10,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePlanRequest<'a> {
    name: &'a str,
    amount_cents: i64,
    currency: &'a str,
    frequency: i32,
    frequency_type: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateAgreementRequest<'a> {
    plan_id: &'a str,
    back_url: &'a str,
    external_reference: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateAgreementRequest<'a> {
    status: &'a str,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AgreementResponse {
    id: String,
    #[serde(default)]
    checkout_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// reqwest-backed [`PaymentProvider`]
#[derive(Clone)]
pub struct HttpProviderClient {
    client: Client,
    base_url: Url,
    access_token: String,
    status_retries: usize,
    retry_base_millis: u64,
}

impl HttpProviderClient {
    pub fn new(config: ProviderClientConfig) -> BillingResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build provider client: {}", e)))?;

        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                BillingError::Config(format!("invalid provider base url '{}'", config.base_url))
            })?;

        Ok(Self {
            client,
            base_url,
            access_token: config.access_token,
            status_retries: config.status_retries,
            retry_base_millis: config.retry_base_millis.max(1),
        })
    }

    /// Base url plus `segments`, each percent-encoded as a single path segment
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        correlation_id: CorrelationId,
    ) -> Result<T, ProviderError> {
        let response = request
            .bearer_auth(&self.access_token)
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .send()
            .await
            .map_err(|e| transport_error(e, correlation_id))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                correlation_id = %correlation_id,
                status = status.as_u16(),
                "Payment provider returned an error status"
            );
            return Err(ProviderError::Status {
                correlation_id,
                code: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout { correlation_id }
            } else {
                ProviderError::Decode {
                    correlation_id,
                    message: e.to_string(),
                }
            }
        })
    }

    async fn fetch_agreement(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<AgreementResponse, ProviderError> {
        let request = self
            .client
            .get(self.url(&["agreements", agreement_id]));
        self.send(request, correlation_id).await
    }
}

fn transport_error(e: reqwest::Error, correlation_id: CorrelationId) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { correlation_id }
    } else {
        ProviderError::Transport {
            correlation_id,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpProviderClient {
    async fn create_plan(
        &self,
        plan: &BillingPlan,
        correlation_id: CorrelationId,
    ) -> Result<String, ProviderError> {
        let body = CreatePlanRequest {
            name: &plan.name,
            amount_cents: plan.price_cents,
            currency: &plan.currency,
            frequency: plan.frequency,
            frequency_type: &plan.frequency_type,
        };
        let request = self.client.post(self.url(&["plans"])).json(&body);
        let created: PlanResponse = self.send(request, correlation_id).await?;

        tracing::info!(
            plan_id = %plan.id,
            external_plan_id = %created.id,
            correlation_id = %correlation_id,
            "Billing plan synced to payment provider"
        );
        Ok(created.id)
    }

    async fn create_agreement(
        &self,
        plan: &BillingPlan,
        payer_back_url: &str,
        external_reference: &str,
        correlation_id: CorrelationId,
    ) -> Result<CreatedAgreement, ProviderError> {
        let plan_id = plan
            .external_plan_id
            .as_deref()
            .ok_or_else(|| ProviderError::Rejected {
                correlation_id,
                reason: format!("plan {} is not synced to the provider", plan.id),
            })?;

        let body = CreateAgreementRequest {
            plan_id,
            back_url: payer_back_url,
            external_reference,
        };
        let request = self.client.post(self.url(&["agreements"])).json(&body);
        let created: AgreementResponse = self.send(request, correlation_id).await?;

        let checkout_url = created.checkout_url.ok_or_else(|| ProviderError::Rejected {
            correlation_id,
            reason: format!("agreement {} was created without a checkout url", created.id),
        })?;

        Ok(CreatedAgreement {
            agreement_id: created.id,
            checkout_url,
        })
    }

    async fn cancel_agreement(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), ProviderError> {
        let request = self
            .client
            .put(self.url(&["agreements", agreement_id]))
            .json(&UpdateAgreementRequest { status: "canceled" });
        let updated: AgreementResponse = self.send(request, correlation_id).await?;

        let status = updated
            .status
            .as_deref()
            .map(AgreementStatus::parse)
            .unwrap_or(AgreementStatus::Canceled);
        if !status.is_terminal() {
            return Err(ProviderError::Rejected {
                correlation_id,
                reason: format!("agreement {} is still {}", agreement_id, status),
            });
        }
        Ok(())
    }

    async fn get_agreement_status(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<AgreementStatus, ProviderError> {
        let strategy = ExponentialBackoff::from_millis(self.retry_base_millis)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.status_retries);

        let agreement = RetryIf::spawn(
            strategy,
            || self.fetch_agreement(agreement_id, correlation_id),
            |e: &ProviderError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::debug!(
                        agreement_id = %agreement_id,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Retrying agreement status read"
                    );
                }
                retry
            },
        )
        .await?;

        agreement
            .status
            .as_deref()
            .map(AgreementStatus::parse)
            .ok_or_else(|| ProviderError::Decode {
                correlation_id,
                message: format!("agreement {} has no status", agreement.id),
            })
    }
}
