use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into, select};
use rocket::serde::json::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::db::schema::follows;
use crate::db::Db;
use crate::types::{created, ApiError, ApiResult, CreatedResult};
use crate::users::models::User;
use crate::users::{Auth, MaybeAuth};

#[derive(Debug, Serialize)]
pub struct Profile {
    pub username: String,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub following: bool,
}

pub fn is_following(
    follower: i32,
    followed: i32,
    connection: &mut PgConnection,
) -> Result<bool, ApiError> {
    select(exists(
        follows::table
            .filter(follows::follower_id.eq(follower))
            .filter(follows::followed_id.eq(followed)),
    ))
    .get_result::<bool>(connection)
    .map_err(Into::into)
}

/// Article ids favorited by a user, the scope behind the `favorited` list
/// filter.
pub fn favorite_ids(user_id: i32, connection: &mut PgConnection) -> Result<Vec<i32>, ApiError> {
    use crate::db::schema::favorites;
    favorites::table
        .filter(favorites::user_id.eq(user_id))
        .select(favorites::article_id)
        .load::<i32>(connection)
        .map_err(Into::into)
}

/// Ids of every user the given user follows, the author scope of the feed.
pub fn followed_ids(user_id: i32, connection: &mut PgConnection) -> Result<Vec<i32>, ApiError> {
    follows::table
        .filter(follows::follower_id.eq(user_id))
        .select(follows::followed_id)
        .load::<i32>(connection)
        .map_err(Into::into)
}

#[rocket::get("/profiles/<name>")]
pub async fn profile(db: Db, actor: MaybeAuth, name: String) -> ApiResult<Value> {
    let actor_id = actor.id();
    let profile = db
        .run(move |conn| -> Result<Profile, ApiError> {
            let user = User::by_username(&name, conn)?;
            let following = match actor_id {
                Some(id) => is_following(id, user.id, conn)?,
                None => false,
            };
            Ok(user.profile(following))
        })
        .await?;
    Ok(Json(json!({ "profile": profile })))
}

/// The follow relation is a set: re-following is a no-op, never a
/// duplicate edge.
fn follow_edge(
    follower_id: i32,
    followed_id: i32,
) -> impl diesel::query_dsl::methods::ExecuteDsl<PgConnection>
       + diesel::query_builder::QueryFragment<diesel::pg::Pg>
       + diesel::RunQueryDsl<PgConnection> {
    insert_into(follows::table)
        .values((
            follows::follower_id.eq(follower_id),
            follows::followed_id.eq(followed_id),
        ))
        .on_conflict((follows::follower_id, follows::followed_id))
        .do_nothing()
}

#[rocket::post("/profiles/<name>/follow")]
pub async fn follow(db: Db, auth: Auth, name: String) -> CreatedResult {
    let follower = auth.0.id;
    let profile = db
        .run(move |conn| -> Result<Profile, ApiError> {
            let followed = User::by_username(&name, conn)?;
            follow_edge(follower, followed.id).execute(conn)?;
            Ok(followed.profile(true))
        })
        .await?;
    created(json!({ "profile": profile }))
}

#[rocket::delete("/profiles/<name>/follow")]
pub async fn unfollow(db: Db, auth: Auth, name: String) -> CreatedResult {
    let follower = auth.0.id;
    let profile = db
        .run(move |conn| -> Result<Profile, ApiError> {
            let followed = User::by_username(&name, conn)?;
            // Removing an absent edge is equally a no-op.
            diesel_delete(
                follows::table
                    .filter(follows::follower_id.eq(follower))
                    .filter(follows::followed_id.eq(followed.id)),
            )
            .execute(conn)?;
            Ok(followed.profile(false))
        })
        .await?;
    created(json!({ "profile": profile }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::pg::Pg;

    #[test]
    fn refollowing_leaves_one_edge() {
        let sql = diesel::debug_query::<Pg, _>(&follow_edge(1, 2)).to_string();
        assert!(sql.contains("ON CONFLICT"), "{sql}");
        assert!(sql.contains("DO NOTHING"), "{sql}");
    }
}
