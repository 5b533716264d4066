use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::select;
use lazy_static::lazy_static;
use regex::Regex;

use crate::db::schema::users;
use crate::types::{ApiError, ValidationError};

lazy_static! {
    static ref EMAIL_RE: Regex = {
        let pattern = r"\A[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\z";
        Regex::new(pattern).unwrap()
    };
}

pub fn validate_email_format(email: &str) -> Result<(), ValidationError> {
    if !EMAIL_RE.is_match(email) {
        Err(ValidationError::from(
            "email",
            format!("invalid email: {email}"),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_username_format(username: &str) -> Result<(), ValidationError> {
    if username.len() < 3 {
        Err(ValidationError::from(
            "username",
            format!("username too short: {username}"),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.len() < 5 {
        Err(ValidationError::from("password", "password too short"))
    } else {
        Ok(())
    }
}

/// Uniqueness pre-checks. These surface friendly field errors; the unique
/// constraints in the schema remain the backstop under concurrent inserts.
pub fn email_taken(
    email: &str,
    exclude_id: Option<i32>,
    connection: &mut PgConnection,
) -> Result<bool, ApiError> {
    let base = users::table.filter(users::email.eq(email));
    let taken = match exclude_id {
        Some(id) => select(exists(base.filter(users::id.ne(id)))).get_result::<bool>(connection)?,
        None => select(exists(base)).get_result::<bool>(connection)?,
    };
    Ok(taken)
}

pub fn username_taken(
    username: &str,
    exclude_id: Option<i32>,
    connection: &mut PgConnection,
) -> Result<bool, ApiError> {
    let base = users::table.filter(users::username.eq(username));
    let taken = match exclude_id {
        Some(id) => select(exists(base.filter(users::id.ne(id)))).get_result::<bool>(connection)?,
        None => select(exists(base)).get_result::<bool>(connection)?,
    };
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_addresses() {
        assert!(validate_email_format("alice@x.com").is_ok());
        assert!(validate_email_format("a.b-c@mail.example.org").is_ok());
    }

    #[test]
    fn rejects_garbage_addresses() {
        assert!(validate_email_format("alice").is_err());
        assert!(validate_email_format("alice@").is_err());
        assert!(validate_email_format("@x.com").is_err());
        assert!(validate_email_format("alice@x").is_err());
    }

    #[test]
    fn username_needs_three_chars() {
        assert!(validate_username_format("al").is_err());
        assert!(validate_username_format("ali").is_ok());
    }

    #[test]
    fn password_needs_five_chars() {
        assert!(validate_password("1234").is_err());
        assert!(validate_password("12345").is_ok());
    }
}
