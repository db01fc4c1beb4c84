use axum::{
    Json,
    response::{IntoResponse, Response},
};
use cyder_tools::snow_flake::Snowflake;
use once_cell::sync::Lazy;
use rand::{Rng, distr::Alphanumeric, rng};
use serde::Serialize;

pub mod auth;
pub mod sse;

#[derive(Debug, Serialize)]
pub struct HttpResult<T> {
    pub code: usize,
    pub data: T,
}

impl<T> HttpResult<T> {
    pub fn new(data: T) -> HttpResult<T> {
        HttpResult { code: 0, data }
    }
}

impl<T> IntoResponse for HttpResult<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

pub static ID_GENERATOR: Lazy<Snowflake> = Lazy::new(|| Snowflake::new(1));

/// Lowercases `input` and collapses every run of non-alphanumeric characters into one `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Opaque identifier of the form `{prefix}_{random}`.
pub fn generate_public_id(prefix: &str, len: usize) -> String {
    let random: String = rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, random)
}
