use rocket_sync_db_pools::database;

pub mod schema;

/// Pooled Postgres connection, checked out per request. The pool url is
/// merged into Rocket's figment from `DATABASE_URL` at startup.
#[database("conduit")]
pub struct Db(diesel::PgConnection);
