use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into};
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::article::{self, Article};
use crate::db::schema::{comments, follows, users};
use crate::db::Db;
use crate::profile::Profile;
use crate::types::{created, ApiError, ApiResult, CreatedResult};
use crate::users::models::User;
use crate::users::{Auth, MaybeAuth};
use crate::utils::serialize_date;

#[derive(Debug, Queryable, Identifiable, Associations, PartialEq)]
#[diesel(table_name = comments)]
#[diesel(belongs_to(Article))]
pub struct Comment {
    pub id: i32,
    pub article_id: i32,
    pub user_id: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = comments)]
struct NewComment {
    article_id: i32,
    user_id: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    id: i32,
    #[serde(serialize_with = "serialize_date")]
    created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date")]
    updated_at: DateTime<Utc>,
    body: String,
    author: Profile,
}

impl From<(Comment, Profile)> for CommentView {
    fn from((comment, author): (Comment, Profile)) -> Self {
        CommentView {
            id: comment.id,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            body: comment.body,
            author,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommentBody {
    body: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentContainer {
    comment: CommentBody,
}

#[rocket::post("/<slug>/comments", format = "json", data = "<details>")]
pub async fn add(db: Db, auth: Auth, slug: String, details: Json<CommentContainer>) -> CreatedResult {
    let actor_id = auth.0.id;
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            // 404 before insert: a comment never exists without its article.
            let article = article::load_by_slug(&slug, conn)?;
            let now = Utc::now();
            let new_comment = NewComment {
                article_id: article.id,
                user_id: actor_id,
                created_at: now,
                updated_at: now,
                body: details.into_inner().comment.body,
            };
            insert_into(comments::table)
                .values(&new_comment)
                .execute(conn)?;
            let view = article::view_by_slug(&slug, Some(actor_id), conn)?;
            Ok(json!({ "article": view }))
        })
        .await?;
    created(body)
}

#[rocket::get("/<slug>/comments")]
pub async fn list(db: Db, actor: MaybeAuth, slug: String) -> ApiResult<Value> {
    let actor_id = actor.id();
    let views = db
        .run(move |conn| -> Result<Vec<CommentView>, ApiError> {
            let article = article::load_by_slug(&slug, conn)?;
            let rows = Comment::belonging_to(&article)
                .inner_join(users::table)
                .order(comments::created_at.desc())
                .load::<(Comment, User)>(conn)?;

            let following: HashSet<i32> = match actor_id {
                Some(actor_id) => {
                    let author_ids: Vec<i32> = rows.iter().map(|(_, author)| author.id).collect();
                    follows::table
                        .filter(follows::follower_id.eq(actor_id))
                        .filter(follows::followed_id.eq_any(&author_ids))
                        .select(follows::followed_id)
                        .load::<i32>(conn)?
                        .into_iter()
                        .collect()
                }
                None => HashSet::new(),
            };

            Ok(rows
                .into_iter()
                .map(|(comment, author)| {
                    let profile = author.profile(following.contains(&author.id));
                    (comment, profile).into()
                })
                .collect())
        })
        .await?;
    Ok(Json(json!({ "comments": views })))
}

#[rocket::delete("/<slug>/comments/<id>")]
pub async fn delete(db: Db, auth: Auth, slug: String, id: i32) -> CreatedResult {
    let actor_id = auth.0.id;
    db.run(move |conn| -> Result<(), ApiError> {
        let article = article::load_by_slug(&slug, conn)?;
        let comment = comments::table.find(id).first::<Comment>(conn)?;
        // The comment must be addressed through its own article.
        if comment.article_id != article.id {
            return Err(diesel::result::Error::NotFound.into());
        }
        if comment.user_id != actor_id {
            return Err(ApiError::Forbidden);
        }
        diesel_delete(comments::table.find(comment.id)).execute(conn)?;
        Ok(())
    })
    .await?;
    created(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn view_keeps_the_author_profile_and_camel_cases_dates() {
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        let comment = Comment {
            id: 3,
            article_id: 1,
            user_id: 2,
            created_at: at,
            updated_at: at,
            body: "nice".into(),
        };
        let profile = Profile {
            username: "bob".into(),
            bio: None,
            image: None,
            following: true,
        };
        let view: CommentView = (comment, profile).into();
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["createdAt"], "2024-05-02T08:00:00.000Z");
        assert_eq!(value["author"]["username"], "bob");
        assert_eq!(value["author"]["following"], true);
        assert!(value.get("articleId").is_none());
    }
}
