use std::collections::HashMap;

use diesel::result::Error as DieselError;
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::status::Custom;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Field -> messages map carried by validation failures, serialized as the
/// `errors` object of the response body.
#[derive(Debug, Serialize, Default)]
pub struct ValidationError(HashMap<String, Vec<String>>);

impl ValidationError {
    pub fn add_error<K: Into<String>, V: Into<String>>(&mut self, key: K, val: V) {
        self.0.entry(key.into()).or_default().push(val.into());
    }

    pub fn from<K: Into<String>, V: Into<String>>(key: K, val: V) -> Self {
        let mut error = ValidationError::default();
        error.add_error(key, val);
        error
    }

    pub fn merge(&mut self, other: ValidationError) {
        for (key, messages) in other.0 {
            self.0.entry(key).or_default().extend(messages);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("validation failed")]
    Validation(ValidationError),
    /// Registration failures keep the `{message, errors}` shape the demo
    /// client expects, with a 400 status.
    #[error("registration rejected")]
    Registration(ValidationError),
    #[error("missing or invalid credential")]
    Unauthorized,
    #[error("actor does not own the addressed entity")]
    Forbidden,
    #[error("internal error")]
    Internal,
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> ApiError {
        ApiError::Validation(err)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let (status, body) = match self {
            ApiError::Database(DieselError::NotFound) => (
                Status::NotFound,
                json!({"errors": {"entity": ["not found"]}}),
            ),
            ApiError::Database(error) => {
                log::error!("storage failure: {error}");
                (
                    Status::InternalServerError,
                    json!({"errors": {"server": ["internal error"]}}),
                )
            }
            ApiError::Validation(errors) => {
                (Status::UnprocessableEntity, json!({ "errors": errors }))
            }
            ApiError::Registration(errors) => (
                Status::BadRequest,
                json!({"message": "Input data validation failed", "errors": errors}),
            ),
            ApiError::Unauthorized => (
                Status::Unauthorized,
                json!({"errors": {"authorization": ["missing or invalid credential"]}}),
            ),
            ApiError::Forbidden => (
                Status::Forbidden,
                json!({"errors": {"authorization": ["forbidden"]}}),
            ),
            ApiError::Internal => (
                Status::InternalServerError,
                json!({"errors": {"server": ["internal error"]}}),
            ),
        };
        Custom(status, Json(body)).respond_to(req)
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// 201 responses for the creation-shaped endpoints (articles, comments,
/// follows, favorites).
pub type CreatedResult = Result<Custom<Json<Value>>, ApiError>;

pub fn created(body: Value) -> CreatedResult {
    Ok(Custom(Status::Created, Json(body)))
}

/// Payload validation: consume, check against the storage state where
/// needed, and hand the payload back or a field map.
pub trait Validate
where
    Self: Sized,
{
    type Error;
    fn validate(self, connection: &mut diesel::PgConnection) -> Result<Self, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_concatenates_messages_per_field() {
        let mut left = ValidationError::from("email", "invalid email");
        let mut right = ValidationError::from("email", "email already taken");
        right.add_error("username", "too short");

        left.merge(right);
        assert_eq!(left.len(), 2);

        let value = serde_json::to_value(&left).unwrap();
        assert_eq!(
            value["email"],
            json!(["invalid email", "email already taken"])
        );
        assert_eq!(value["username"], json!(["too short"]));
    }

    #[test]
    fn empty_map_reports_empty() {
        let errors = ValidationError::default();
        assert!(errors.is_empty());
        assert_eq!(errors.len(), 0);
    }
}
