//! Boundary to the external payment gateway.

pub mod client;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::HttpPaymentGateway;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    pub amount: i64,
}

/// One entry of a credential's payment history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("could not decode gateway response: {0}")]
    Decode(String),
}

pub trait PaymentGateway: Send + Sync {
    /// `POST /payments`. `Ok` only for a success status.
    fn post_payment<'a>(
        &'a self,
        token: &'a str,
        request: PaymentRequest,
    ) -> BoxFuture<'a, Result<(), GatewayError>>;

    /// `GET /payments`: the full, ordered history for `token`.
    fn payments<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Vec<PaymentRecord>, GatewayError>>;
}
