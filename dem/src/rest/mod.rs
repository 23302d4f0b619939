//! REST management surface. One configure() per resource family, a
//! shared-state extractor, the signature check, and the error mapping
//! existing clients rely on (including 402 for "not found", kept for
//! compatibility).

use std::fmt;
use std::sync::Arc;

use actix_web::{
    dev::ServiceRequest,
    error::BlockingError,
    http::StatusCode,
    web,
    HttpResponse,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{error::ModelError, state::ManagerState};

pub mod dem;
pub mod groups;
pub mod hosts;
pub mod targets;

/// Handle used by the shutdown verb to stop the HTTP server.
pub static SERVER: Lazy<Mutex<Option<actix_web::dev::Server>>> = Lazy::new(|| Mutex::new(None));

pub type Data = web::Data<Arc<ManagerState>>;

const ALLOW_ORIGIN: (&str, &str) = ("Access-Control-Allow-Origin", "*");
const ALLOW_METHODS: (&str, &str) = (
    "Access-Control-Allow-Methods",
    "GET,PUT,POST,DELETE,PATCH,OPTIONS",
);
const ALLOW_HEADERS: (&str, &str) = (
    "Access-Control-Allow-Headers",
    "access-control-allow-origin,origin,content-type,accept,x-requested-with,\
     authorization,client-security-token,accept-encoding",
);

/// 200 with the CORS headers every response carries.
pub fn ok_text(body: String) -> HttpResponse {
    HttpResponse::Ok()
        .header(ALLOW_ORIGIN.0, ALLOW_ORIGIN.1)
        .header(ALLOW_METHODS.0, ALLOW_METHODS.1)
        .header(ALLOW_HEADERS.0, ALLOW_HEADERS.1)
        .content_type("text/plain")
        .body(body)
}

#[derive(Debug)]
pub struct RestError {
    status: StatusCode,
    body: String,
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.body)
    }
}

impl actix_web::ResponseError for RestError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status)
            .header(ALLOW_ORIGIN.0, ALLOW_ORIGIN.1)
            .header(ALLOW_METHODS.0, ALLOW_METHODS.1)
            .header(ALLOW_HEADERS.0, ALLOW_HEADERS.1)
            .content_type("text/plain")
            .body(self.body.clone())
    }
}

impl RestError {
    pub fn not_implemented() -> Self {
        RestError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            body: "Method Not Implemented".to_string(),
        }
    }

    pub fn bad_page(path: &str) -> Self {
        RestError {
            status: StatusCode::NOT_FOUND,
            body: format!("Bad page {}", path),
        }
    }

    pub fn forbidden() -> Self {
        RestError {
            status: StatusCode::FORBIDDEN,
            body: "Forbidden".to_string(),
        }
    }
}

impl From<ModelError> for RestError {
    fn from(e: ModelError) -> Self {
        let status = match &e {
            // 402 predates this implementation; existing clients check
            // for it on missing entities
            ModelError::NotFound { .. } => StatusCode::PAYMENT_REQUIRED,
            ModelError::Exists { .. } => StatusCode::CONFLICT,
            ModelError::Invalid { .. } => StatusCode::BAD_REQUEST,
            ModelError::Remote { .. } => StatusCode::FORBIDDEN,
            ModelError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        RestError {
            status,
            body: e.to_string(),
        }
    }
}

impl From<BlockingError<ModelError>> for RestError {
    fn from(e: BlockingError<ModelError>) -> Self {
        match e {
            BlockingError::Error(e) => e.into(),
            BlockingError::Canceled => RestError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "internal error".to_string(),
            },
        }
    }
}

/// Signature check: when the request carries an Authorization header
/// it must match the loaded signature.
pub fn authorized(state: &ManagerState, req: &ServiceRequest) -> bool {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());
    match (header, state.signature.read().as_ref()) {
        (Some(value), Some(signature)) => value == signature,
        _ => true,
    }
}

/// Build the application with every resource mounted; shared between
/// the daemon and the API tests.
pub fn app_config(cfg: &mut web::ServiceConfig) {
    dem::configure(cfg);
    groups::configure(cfg);
    targets::configure(cfg);
    hosts::configure(cfg);
}

/// OPTIONS preflights get the CORS allowance; a known resource with an
/// unsupported verb is a 405, anything else is a bad page.
pub async fn default_handler(req: actix_web::HttpRequest) -> Result<HttpResponse, RestError> {
    if req.method() == actix_web::http::Method::OPTIONS {
        return Ok(ok_text(String::new()));
    }
    let path = req.path();
    let known = ["/dem", "/group", "/host", "/target"]
        .iter()
        .any(|root| path == *root || path.starts_with(&format!("{}/", root)));
    if known {
        return Err(RestError::not_implemented());
    }
    Err(RestError::bad_page(path))
}

