use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::Text;
use rocket::serde::json::Json;
use serde_json::{json, Value};

use crate::db::schema::articles;
use crate::db::Db;
use crate::types::{ApiError, ApiResult};

/// Tags have no lifecycle of their own; the distinct strings across all
/// article tag lists are the tag set.
#[rocket::get("/")]
pub async fn list(db: Db) -> ApiResult<Value> {
    let tags = db
        .run(|conn| -> Result<Vec<String>, ApiError> {
            articles::table
                .select(sql::<Text>("distinct unnest(tag_list)"))
                .load::<String>(conn)
                .map_err(Into::into)
        })
        .await?;
    Ok(Json(json!({ "tags": tags })))
}
