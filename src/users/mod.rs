use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into, update as diesel_update};
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{self, FromRequest, Request};
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;
use serde_json::{json, Value};

pub mod models;
mod utils;

use crate::config::AppConfig;
use crate::db::schema::users;
use crate::db::Db;
use crate::types::{created, ApiError, ApiResult, CreatedResult, Validate, ValidationError};
use models::{decode_token, hash_password, Claims, NewUser, User};
use utils::*;

/// Required identity: the route fails with 401 unless a valid credential is
/// presented. Decoding is pure; no storage access happens in the guard.
pub struct Auth(pub Claims);

/// Optional identity. `None` only when no `Authorization` header was sent;
/// a credential that fails to decode is still a hard 401 rather than being
/// silently downgraded to anonymous.
pub struct MaybeAuth(pub Option<Claims>);

impl MaybeAuth {
    pub fn id(&self) -> Option<i32> {
        self.0.as_ref().map(|claims| claims.id)
    }
}

/// Names the payload field behind a users-table unique violation, so a
/// concurrent duplicate reports the column that actually collided.
fn unique_violation_field(constraint: Option<&str>) -> &'static str {
    match constraint {
        Some(name) if name.contains("email") => "email",
        _ => "username",
    }
}

fn token_of(header: &str) -> &str {
    header
        .strip_prefix("Token ")
        .or_else(|| header.strip_prefix("Bearer "))
        .unwrap_or(header)
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Auth {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let config = match request.guard::<&State<AppConfig>>().await {
            Outcome::Success(config) => config,
            _ => return Outcome::Error((Status::InternalServerError, ApiError::Internal)),
        };
        match request.headers().get_one("Authorization") {
            Some(header) => match decode_token(token_of(header), &config.secret) {
                Ok(claims) => Outcome::Success(Auth(claims)),
                Err(_) => Outcome::Error((Status::Unauthorized, ApiError::Unauthorized)),
            },
            None => Outcome::Error((Status::Unauthorized, ApiError::Unauthorized)),
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for MaybeAuth {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        if request.headers().get_one("Authorization").is_none() {
            return Outcome::Success(MaybeAuth(None));
        }
        Auth::from_request(request)
            .await
            .map(|auth| MaybeAuth(Some(auth.0)))
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationDetails {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct Registration {
    user: RegistrationDetails,
}

impl Validate for Registration {
    type Error = ApiError;

    fn validate(self, connection: &mut PgConnection) -> Result<Self, ApiError> {
        let mut errors = ValidationError::default();

        if let Err(e) = validate_email_format(&self.user.email) {
            errors.merge(e);
        }
        if let Err(e) = validate_username_format(&self.user.username) {
            errors.merge(e);
        }
        if let Err(e) = validate_password(&self.user.password) {
            errors.merge(e);
        }
        if email_taken(&self.user.email, None, connection)? {
            errors.add_error("email", "email already exists");
        }
        if username_taken(&self.user.username, None, connection)? {
            errors.add_error("username", "username already exists");
        }

        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ApiError::Registration(errors))
        }
    }
}

#[rocket::post("/", format = "json", data = "<registration>")]
pub async fn register(
    db: Db,
    config: &State<AppConfig>,
    registration: Json<Registration>,
) -> CreatedResult {
    let secret = config.secret.clone();
    let ttl = config.token_ttl_days;
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            let registration = registration.into_inner().validate(conn)?;
            let new_user = NewUser {
                username: registration.user.username,
                email: registration.user.email,
                password: hash_password(&registration.user.password)?,
            };
            // The pre-check above is an optimization only; a concurrent
            // duplicate still trips the unique constraint here.
            let user = insert_into(users::table)
                .values(&new_user)
                .get_result::<User>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::DatabaseError(
                        diesel::result::DatabaseErrorKind::UniqueViolation,
                        info,
                    ) => {
                        let field = unique_violation_field(info.constraint_name());
                        ApiError::Registration(ValidationError::from(
                            field,
                            format!("{field} already exists"),
                        ))
                    }
                    other => other.into(),
                })?;
            log::info!("registered user {}", user.username);
            Ok(json!({"user": user.auth_json(&secret, ttl)?}))
        })
        .await?;
    created(body)
}

#[derive(Debug, Deserialize)]
struct LoginDetails {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct Login {
    user: LoginDetails,
}

#[rocket::post("/login", format = "json", data = "<login>")]
pub async fn login(db: Db, config: &State<AppConfig>, login: Json<Login>) -> ApiResult<Value> {
    let secret = config.secret.clone();
    let ttl = config.token_ttl_days;
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            let login = login.into_inner();
            // An unknown email and a bad password fail identically.
            let user = users::table
                .filter(users::email.eq(&login.user.email))
                .first::<User>(conn)
                .optional()?
                .ok_or(ApiError::Unauthorized)?;
            if !user.verify_password(&login.user.password)? {
                return Err(ApiError::Unauthorized);
            }
            Ok(json!({"user": user.auth_json(&secret, ttl)?}))
        })
        .await?;
    Ok(Json(body))
}

#[rocket::get("/user")]
pub async fn current(db: Db, auth: Auth, config: &State<AppConfig>) -> ApiResult<Value> {
    let secret = config.secret.clone();
    let ttl = config.token_ttl_days;
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            let user = User::by_id(auth.0.id, conn)?;
            Ok(json!({"user": user.auth_json(&secret, ttl)?}))
        })
        .await?;
    Ok(Json(body))
}

/// Partial account update. The password is deliberately absent from this
/// changeset: credentials are not updatable through this endpoint.
#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = users)]
pub struct UpdateUser {
    username: Option<String>,
    email: Option<String>,
    bio: Option<String>,
    image: Option<String>,
}

impl UpdateUser {
    fn is_noop(&self) -> bool {
        self.username.is_none()
            && self.email.is_none()
            && self.bio.is_none()
            && self.image.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub struct Update {
    user: UpdateUser,
}

#[rocket::put("/user", format = "json", data = "<update>")]
pub async fn update(
    db: Db,
    auth: Auth,
    config: &State<AppConfig>,
    update: Json<Update>,
) -> ApiResult<Value> {
    let secret = config.secret.clone();
    let ttl = config.token_ttl_days;
    let user_id = auth.0.id;
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            let patch = update.into_inner().user;
            let mut errors = ValidationError::default();

            if let Some(new_email) = &patch.email {
                if let Err(e) = validate_email_format(new_email) {
                    errors.merge(e);
                } else if email_taken(new_email, Some(user_id), conn)? {
                    errors.add_error("email", format!("email already chosen: {new_email}"));
                }
            }
            if let Some(new_username) = &patch.username {
                if let Err(e) = validate_username_format(new_username) {
                    errors.merge(e);
                } else if username_taken(new_username, Some(user_id), conn)? {
                    errors.add_error(
                        "username",
                        format!("username already chosen: {new_username}"),
                    );
                }
            }
            if !errors.is_empty() {
                return Err(errors.into());
            }

            let user = if patch.is_noop() {
                User::by_id(user_id, conn)?
            } else {
                diesel_update(users::table.find(user_id))
                    .set(&patch)
                    .get_result::<User>(conn)?
            };
            Ok(json!({"user": user.auth_json(&secret, ttl)?}))
        })
        .await?;
    Ok(Json(body))
}

/// Account deletion is keyed by the authenticated id, the one consistent
/// identifying key for users.
#[rocket::delete("/user")]
pub async fn delete(db: Db, auth: Auth) -> ApiResult<Value> {
    let user_id = auth.0.id;
    db.run(move |conn| -> Result<(), ApiError> {
        let deleted = diesel_delete(users::table.find(user_id)).execute(conn)?;
        if deleted == 0 {
            return Err(diesel::result::Error::NotFound.into());
        }
        log::info!("deleted user {user_id}");
        Ok(())
    })
    .await?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_blames_the_colliding_field() {
        assert_eq!(unique_violation_field(Some("users_email_key")), "email");
        assert_eq!(unique_violation_field(Some("users_username_key")), "username");
        assert_eq!(unique_violation_field(None), "username");
    }

    #[test]
    fn token_header_accepts_both_schemes() {
        assert_eq!(token_of("Token abc.def.ghi"), "abc.def.ghi");
        assert_eq!(token_of("Bearer abc.def.ghi"), "abc.def.ghi");
        assert_eq!(token_of("abc.def.ghi"), "abc.def.ghi");
    }
}
