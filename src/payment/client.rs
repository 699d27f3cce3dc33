use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use tracing::trace;

use super::{GatewayError, PaymentGateway, PaymentRecord, PaymentRequest};

#[derive(Clone)]
pub struct HttpPaymentGateway {
    base_url: String,
    client: Client,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}/payments", self.base_url)
    }

    async fn send_payment(&self, token: &str, request: PaymentRequest) -> Result<(), GatewayError> {
        trace!(amount = request.amount, "posting payment");
        let response = self
            .client
            .post(self.url())
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(rejected(status, response).await),
        }
    }

    async fn fetch_payments(&self, token: &str) -> Result<Vec<PaymentRecord>, GatewayError> {
        let response = self
            .client
            .get(self.url())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(rejected(response.status(), response).await);
        }

        response
            .json::<Vec<PaymentRecord>>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

async fn rejected(status: StatusCode, response: reqwest::Response) -> GatewayError {
    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {e}>"));

    GatewayError::Rejected {
        status: status.as_u16(),
        message,
    }
}

impl PaymentGateway for HttpPaymentGateway {
    fn post_payment<'a>(
        &'a self,
        token: &'a str,
        request: PaymentRequest,
    ) -> BoxFuture<'a, Result<(), GatewayError>> {
        self.send_payment(token, request).boxed()
    }

    fn payments<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Vec<PaymentRecord>, GatewayError>> {
        self.fetch_payments(token).boxed()
    }
}
