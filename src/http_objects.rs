use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

use crate::{
    data_model::{valid_function_name, DeploySpec, FunctionDeployment, PackageSource},
    error::Error,
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match &e {
            Error::PackageInvalid(_) | Error::RemoteFetchFailed { .. } => {
                Self::bad_request(&e.to_string())
            }
            Error::NotFound(_) => Self::not_found(&e.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }
}

/// Body of `POST /upload`: deploy a function from an inlined package.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadRequest {
    pub name: String,
    /// Replica container count.
    pub threads: usize,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Base64-encoded package archive (zip or tar).
    pub zip: String,
}

impl UploadRequest {
    pub fn into_spec(self) -> Result<DeploySpec, ApiError> {
        validate_deploy_fields(&self.name, self.threads)?;
        // Clients commonly hard-wrap the encoded payload.
        let cleaned: Vec<u8> = self
            .zip
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let bytes = BASE64
            .decode(cleaned)
            .map_err(|e| ApiError::bad_request(&format!("invalid base64 package: {e}")))?;
        Ok(DeploySpec {
            name: self.name,
            replica_count: self.threads,
            environment: self.environment,
            source: PackageSource::Archive(bytes),
            subfolder_path: None,
        })
    }
}

/// Body of `POST /uploadURL`: deploy a function from a remote archive.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadUrlRequest {
    pub name: String,
    pub threads: usize,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub url: String,
    #[serde(default)]
    pub subfolder_path: Option<String>,
}

impl UploadUrlRequest {
    pub fn into_spec(self) -> Result<DeploySpec, ApiError> {
        validate_deploy_fields(&self.name, self.threads)?;
        if self.url.is_empty() {
            return Err(ApiError::bad_request("url must not be empty"));
        }
        Ok(DeploySpec {
            name: self.name,
            replica_count: self.threads,
            environment: self.environment,
            source: PackageSource::Url(self.url),
            subfolder_path: self.subfolder_path,
        })
    }
}

fn validate_deploy_fields(name: &str, threads: usize) -> Result<(), ApiError> {
    if !valid_function_name(name) {
        return Err(ApiError::bad_request(
            "function name must be non-empty and contain only alphanumeric characters or '-'",
        ));
    }
    if threads < 1 {
        return Err(ApiError::bad_request("threads must be at least 1"));
    }
    Ok(())
}

/// One entry of the `GET /list` response.
#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct FunctionListEntry {
    pub name: String,
    pub hash: String,
    pub threads: usize,
    pub resource: String,
}

impl From<&FunctionDeployment> for FunctionListEntry {
    fn from(deployment: &FunctionDeployment) -> Self {
        FunctionListEntry {
            name: deployment.name.clone(),
            hash: deployment.content_hash.clone(),
            threads: deployment.replica_count,
            resource: deployment.resource_path.clone(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LogsParams {
    /// Restrict log output to a single function.
    pub name: Option<String>,
}
