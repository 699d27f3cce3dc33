//! Session cookies resolved into request principals.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::error::AppError;
use crate::models::principal::{ChairPrincipal, OwnerPrincipal, RiderPrincipal};
use crate::state::AppState;

pub const CHAIR_SESSION_COOKIE: &str = "chair_session";
pub const RIDER_SESSION_COOKIE: &str = "app_session";
pub const OWNER_SESSION_COOKIE: &str = "owner_session";

fn session_token(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, token)| token.to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized(format!("{name} cookie is required")))
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ChairPrincipal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers, CHAIR_SESSION_COOKIE)?;
        if let Some(principal) = state.chair_sessions.get(&token) {
            return Ok(principal);
        }

        let chair = state
            .store
            .chair_by_access_token(&token)
            .ok_or_else(|| AppError::Unauthorized("invalid chair session".to_string()))?;
        let principal = ChairPrincipal {
            chair_id: chair.id,
            owner_id: chair.owner_id,
        };
        state.remember_chair_session(&token, principal);
        Ok(principal)
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RiderPrincipal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers, RIDER_SESSION_COOKIE)?;
        if let Some(principal) = state.rider_sessions.get(&token) {
            return Ok(principal);
        }

        let user = state
            .store
            .user_by_access_token(&token)
            .ok_or_else(|| AppError::Unauthorized("invalid app session".to_string()))?;
        let principal = RiderPrincipal { user_id: user.id };
        state.remember_rider_session(&token, principal);
        Ok(principal)
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for OwnerPrincipal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers, OWNER_SESSION_COOKIE)?;
        if let Some(principal) = state.owner_sessions.get(&token) {
            return Ok(principal);
        }

        let owner = state
            .store
            .owner_by_access_token(&token)
            .ok_or_else(|| AppError::Unauthorized("invalid owner session".to_string()))?;
        let principal = OwnerPrincipal { owner_id: owner.id };
        state.remember_owner_session(&token, principal);
        Ok(principal)
    }
}
