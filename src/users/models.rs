use chrono::{Duration, Utc};
use diesel::prelude::*;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::schema::users;
use crate::profile::Profile;
use crate::types::ApiError;

#[derive(Debug, Queryable, Identifiable, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    #[serde(skip_serializing)]
    pub id: i32,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub bio: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Identity claim set carried inside the signed credential. Self-contained:
/// resolving it back to an actor never touches storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub exp: i64,
}

pub fn issue_token(user: &User, secret: &str, ttl_days: i64) -> Result<String, ApiError> {
    let exp = (Utc::now() + Duration::days(ttl_days)).timestamp();
    let claims = Claims {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| ApiError::Internal)
}

/// Expired, malformed, and wrongly-signed credentials all fail loudly here;
/// "no identity" is reserved for requests that carried no credential at all.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized)
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|_| ApiError::Internal)
}

impl User {
    pub fn by_username(name: &str, connection: &mut PgConnection) -> Result<User, ApiError> {
        users::table
            .filter(users::username.eq(name))
            .first::<User>(connection)
            .map_err(Into::into)
    }

    pub fn by_id(user_id: i32, connection: &mut PgConnection) -> Result<User, ApiError> {
        users::table.find(user_id).first::<User>(connection).map_err(Into::into)
    }

    pub fn verify_password(&self, candidate: &str) -> Result<bool, ApiError> {
        bcrypt::verify(candidate, &self.password).map_err(|_| ApiError::Internal)
    }

    pub fn profile(&self, following: bool) -> Profile {
        Profile {
            username: self.username.clone(),
            bio: self.bio.clone(),
            image: self.image.clone(),
            following,
        }
    }

    /// The `{user: {...}}` payload returned by every account endpoint,
    /// with a freshly issued credential and the digest withheld.
    pub fn auth_json(&self, secret: &str, ttl_days: i64) -> Result<Value, ApiError> {
        Ok(json!({
            "username": self.username,
            "email": self.email,
            "bio": self.bio,
            "image": self.image,
            "token": issue_token(self, secret, ttl_days)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: 7,
            username: "alice".into(),
            email: "alice@x.com".into(),
            password: String::new(),
            bio: None,
            image: None,
        }
    }

    #[test]
    fn issued_token_decodes_to_the_same_claims() {
        let token = issue_token(&sample_user(), "s3cret", 7).unwrap();
        let claims = decode_token(&token, "s3cret").unwrap();
        assert_eq!(claims.id, 7);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "alice@x.com");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let token = issue_token(&sample_user(), "s3cret", 7).unwrap();
        assert!(matches!(
            decode_token(&token, "other-secret"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue_token(&sample_user(), "s3cret", -8).unwrap();
        assert!(matches!(
            decode_token(&token, "s3cret"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(matches!(
            decode_token("not-a-jwt", "s3cret"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn password_digest_verifies_and_is_salted() {
        let digest = bcrypt::hash("pa55word", 4).unwrap();
        let user = User {
            password: digest.clone(),
            ..sample_user()
        };
        assert!(user.verify_password("pa55word").unwrap());
        assert!(!user.verify_password("pa55wordx").unwrap());
        assert_ne!(digest, bcrypt::hash("pa55word", 4).unwrap());
    }

    #[test]
    fn auth_json_never_carries_the_digest() {
        let value = sample_user().auth_json("s3cret", 7).unwrap();
        assert!(value.get("password").is_none());
        assert!(value.get("token").is_some());
    }
}
