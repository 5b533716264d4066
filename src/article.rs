use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{delete as diesel_delete, insert_into, update as diesel_update};
use rand::Rng;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slug::slugify;
use std::collections::{HashMap, HashSet};

use crate::db::schema::{articles, comments, favorites, follows, users};
use crate::db::Db;
use crate::profile::{self, Profile};
use crate::types::{created, ApiError, ApiResult, CreatedResult, Validate, ValidationError};
use crate::users::models::User;
use crate::users::{Auth, MaybeAuth};
use crate::utils::serialize_date;

#[derive(Debug, Queryable, Identifiable, Associations, PartialEq)]
#[diesel(table_name = articles)]
#[diesel(belongs_to(User, foreign_key = author_id))]
pub struct Article {
    pub id: i32,
    pub author_id: i32,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = articles)]
struct NewArticle {
    author_id: i32,
    slug: String,
    title: String,
    description: String,
    body: String,
    tag_list: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// The `{article: {...}}` body shared by every article endpoint: the row
/// joined with its author profile and the derived favorite state.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleView {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
    #[serde(serialize_with = "serialize_date")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date")]
    pub updated_at: DateTime<Utc>,
    pub favorited: bool,
    pub favorites_count: i64,
    pub author: Profile,
}

const SLUG_SUFFIX_LEN: usize = 6;
const SLUG_INSERT_ATTEMPTS: usize = 3;

fn slug_suffix() -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..SLUG_SUFFIX_LEN)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

pub fn make_slug(title: &str) -> String {
    format!("{}-{}", slugify(title), slug_suffix())
}

/// Conjunctive scope the listing query runs under, with usernames already
/// resolved to ids. A filter that names an unknown username never reaches
/// this point; it short-circuits to the empty result instead.
#[derive(Debug, Default)]
pub struct Scope {
    pub tag: Option<String>,
    pub author_ids: Option<Vec<i32>>,
    pub favorite_ids: Option<Vec<i32>>,
}

type ArticleSource =
    diesel::internal::table_macro::FromClause<diesel::helper_types::InnerJoinQuerySource<articles::table, users::table>>;
type BoxedArticles<'a, ST> =
    diesel::internal::table_macro::BoxedSelectStatement<'a, ST, ArticleSource, Pg>;
type ArticleRows<'a> =
    diesel::helper_types::IntoBoxed<'a, diesel::helper_types::InnerJoin<articles::table, users::table>, Pg>;

/// Applies the scope's predicates conjunctively; an absent filter adds no
/// predicate at all. Generic over the select clause so the row query and
/// the count query share one filter path.
fn apply_scope<ST>(
    mut query: BoxedArticles<'static, ST>,
    scope: &Scope,
) -> BoxedArticles<'static, ST> {
    if let Some(tag) = &scope.tag {
        query = query.filter(articles::tag_list.contains(vec![tag.clone()]));
    }
    if let Some(ids) = &scope.author_ids {
        query = query.filter(articles::author_id.eq_any(ids.clone()));
    }
    if let Some(ids) = &scope.favorite_ids {
        query = query.filter(articles::id.eq_any(ids.clone()));
    }
    query
}

fn scoped(scope: &Scope) -> ArticleRows<'static> {
    apply_scope(articles::table.inner_join(users::table).into_boxed(), scope)
}

fn scoped_count(scope: &Scope) -> BoxedArticles<'static, diesel::sql_types::BigInt> {
    apply_scope(
        articles::table.inner_join(users::table).count().into_boxed(),
        scope,
    )
}

/// Negative page parameters would surface as a Postgres error; they are
/// clamped to zero instead.
fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> (Option<i64>, Option<i64>) {
    (limit.map(|l| l.max(0)), offset.map(|o| o.max(0)))
}

/// Runs the listing pipeline: count the scoped set first, then order by
/// recency and page. `articlesCount` therefore always reflects the whole
/// filtered set, not the returned page.
fn run_list(
    scope: &Scope,
    limit: Option<i64>,
    offset: Option<i64>,
    actor: Option<i32>,
    connection: &mut PgConnection,
) -> Result<Value, ApiError> {
    let total = scoped_count(scope).get_result::<i64>(connection)?;
    let (limit, offset) = page_bounds(limit, offset);

    let mut query = scoped(scope).order(articles::created_at.desc());
    if let Some(offset) = offset {
        query = query.offset(offset);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    let rows = query.load::<(Article, User)>(connection)?;
    let views = enrich(rows, actor, connection)?;
    Ok(json!({"articles": views, "articlesCount": total}))
}

fn empty_list() -> Value {
    json!({"articles": [], "articlesCount": 0})
}

fn lookup_user_id(name: &str, connection: &mut PgConnection) -> Result<Option<i32>, ApiError> {
    users::table
        .filter(users::username.eq(name))
        .select(users::id)
        .first::<i32>(connection)
        .optional()
        .map_err(Into::into)
}

/// Composes the resolved filters into a scope. `Some(None)` in a slot means
/// the filter named a user that does not exist: the whole result set is
/// provably empty and no query should run at all.
fn resolve_scope(
    tag: Option<String>,
    author_id: Option<Option<i32>>,
    favorite_ids: Option<Option<Vec<i32>>>,
) -> Option<Scope> {
    let mut scope = Scope {
        tag,
        ..Scope::default()
    };
    match author_id {
        Some(Some(id)) => scope.author_ids = Some(vec![id]),
        Some(None) => return None,
        None => {}
    }
    match favorite_ids {
        Some(Some(ids)) => scope.favorite_ids = Some(ids),
        Some(None) => return None,
        None => {}
    }
    Some(scope)
}

/// `None` when the user follows nobody: the feed is empty by definition,
/// without touching the article set.
fn feed_scope(followed: Vec<i32>) -> Option<Scope> {
    if followed.is_empty() {
        return None;
    }
    Some(Scope {
        author_ids: Some(followed),
        ..Scope::default()
    })
}

/// Annotates loaded rows with favorite counts, the actor's favorite flags,
/// and the actor's follow flags, each fetched in one batched query.
fn enrich(
    rows: Vec<(Article, User)>,
    actor: Option<i32>,
    connection: &mut PgConnection,
) -> Result<Vec<ArticleView>, ApiError> {
    let ids: Vec<i32> = rows.iter().map(|(article, _)| article.id).collect();

    let counts: HashMap<i32, i64> = favorites::table
        .filter(favorites::article_id.eq_any(&ids))
        .group_by(favorites::article_id)
        .select((favorites::article_id, count_star()))
        .load::<(i32, i64)>(connection)?
        .into_iter()
        .collect();

    let (favorited, following): (HashSet<i32>, HashSet<i32>) = match actor {
        Some(actor_id) => {
            let favorited = favorites::table
                .filter(favorites::user_id.eq(actor_id))
                .filter(favorites::article_id.eq_any(&ids))
                .select(favorites::article_id)
                .load::<i32>(connection)?;
            let author_ids: Vec<i32> = rows.iter().map(|(_, author)| author.id).collect();
            let following = follows::table
                .filter(follows::follower_id.eq(actor_id))
                .filter(follows::followed_id.eq_any(&author_ids))
                .select(follows::followed_id)
                .load::<i32>(connection)?;
            (
                favorited.into_iter().collect(),
                following.into_iter().collect(),
            )
        }
        None => (HashSet::new(), HashSet::new()),
    };

    Ok(rows
        .into_iter()
        .map(|(article, author)| ArticleView {
            favorited: favorited.contains(&article.id),
            favorites_count: counts.get(&article.id).copied().unwrap_or(0),
            author: author.profile(following.contains(&author.id)),
            slug: article.slug,
            title: article.title,
            description: article.description,
            body: article.body,
            tag_list: article.tag_list,
            created_at: article.created_at,
            updated_at: article.updated_at,
        })
        .collect())
}

pub fn view_by_slug(
    slug: &str,
    actor: Option<i32>,
    connection: &mut PgConnection,
) -> Result<ArticleView, ApiError> {
    let row = articles::table
        .inner_join(users::table)
        .filter(articles::slug.eq(slug))
        .first::<(Article, User)>(connection)?;
    enrich(vec![row], actor, connection)?
        .pop()
        .ok_or(ApiError::Internal)
}

pub fn load_by_slug(slug: &str, connection: &mut PgConnection) -> Result<Article, ApiError> {
    articles::table
        .filter(articles::slug.eq(slug))
        .first::<Article>(connection)
        .map_err(Into::into)
}

#[rocket::get("/?<tag>&<author>&<favorited>&<limit>&<offset>")]
pub async fn list(
    db: Db,
    actor: MaybeAuth,
    tag: Option<String>,
    author: Option<String>,
    favorited: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<Value> {
    let actor_id = actor.id();
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            let author_id = match &author {
                Some(name) => Some(lookup_user_id(name, conn)?),
                None => None,
            };
            let favorite_ids = match &favorited {
                Some(name) => match lookup_user_id(name, conn)? {
                    Some(id) => Some(Some(profile::favorite_ids(id, conn)?)),
                    None => Some(None),
                },
                None => None,
            };
            match resolve_scope(tag, author_id, favorite_ids) {
                Some(scope) => run_list(&scope, limit, offset, actor_id, conn),
                None => Ok(empty_list()),
            }
        })
        .await?;
    Ok(Json(body))
}

#[rocket::get("/feed?<limit>&<offset>")]
pub async fn feed(db: Db, auth: Auth, limit: Option<i64>, offset: Option<i64>) -> ApiResult<Value> {
    let actor_id = auth.0.id;
    let body = db
        .run(move |conn| -> Result<Value, ApiError> {
            match feed_scope(profile::followed_ids(actor_id, conn)?) {
                Some(scope) => run_list(&scope, limit, offset, Some(actor_id), conn),
                None => Ok(empty_list()),
            }
        })
        .await?;
    Ok(Json(body))
}

#[rocket::get("/<slug>")]
pub async fn get(db: Db, actor: MaybeAuth, slug: String) -> ApiResult<Value> {
    let actor_id = actor.id();
    let view = db
        .run(move |conn| view_by_slug(&slug, actor_id, conn))
        .await?;
    Ok(Json(json!({ "article": view })))
}

#[derive(Debug, Deserialize)]
pub struct ArticleDetails {
    title: String,
    description: String,
    body: String,
    #[serde(rename = "tagList", default)]
    tag_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateArticle {
    article: ArticleDetails,
}

impl Validate for CreateArticle {
    type Error = ApiError;

    fn validate(self, _connection: &mut PgConnection) -> Result<Self, ApiError> {
        let mut errors = ValidationError::default();
        if self.article.title.trim().is_empty() {
            errors.add_error("title", "empty title");
        }
        if self.article.description.trim().is_empty() {
            errors.add_error("description", "empty description");
        }
        if self.article.body.trim().is_empty() {
            errors.add_error("body", "empty body");
        }
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(errors.into())
        }
    }
}

/// A colliding random suffix is astronomically unlikely but not impossible;
/// the unique constraint reports it and we retry with a fresh suffix.
fn insert_article(
    author_id: i32,
    details: ArticleDetails,
    connection: &mut PgConnection,
) -> Result<Article, ApiError> {
    let now = Utc::now();
    let mut attempts = SLUG_INSERT_ATTEMPTS;
    loop {
        let candidate = NewArticle {
            author_id,
            slug: make_slug(&details.title),
            title: details.title.clone(),
            description: details.description.clone(),
            body: details.body.clone(),
            tag_list: details.tag_list.clone(),
            created_at: now,
            updated_at: now,
        };
        match insert_into(articles::table)
            .values(&candidate)
            .get_result::<Article>(connection)
        {
            Ok(article) => return Ok(article),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => {
                attempts -= 1;
                if attempts == 0 {
                    return Err(DieselError::DatabaseError(
                        DatabaseErrorKind::UniqueViolation,
                        info,
                    )
                    .into());
                }
                log::warn!("slug collision on {:?}, retrying", candidate.slug);
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[rocket::post("/", format = "json", data = "<create>")]
pub async fn create(db: Db, auth: Auth, create: Json<CreateArticle>) -> CreatedResult {
    let author_id = auth.0.id;
    let view = db
        .run(move |conn| -> Result<ArticleView, ApiError> {
            let create = create.into_inner().validate(conn)?;
            let article = insert_article(author_id, create.article, conn)?;
            view_by_slug(&article.slug, Some(author_id), conn)
        })
        .await?;
    created(json!({ "article": view }))
}

/// Partial patch. The slug is intentionally left alone when the title
/// changes; links to the article stay valid.
#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = articles)]
pub struct UpdateDetails {
    title: Option<String>,
    description: Option<String>,
    body: Option<String>,
    #[serde(rename = "tagList")]
    tag_list: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateArticle {
    article: UpdateDetails,
}

#[rocket::put("/<slug>", format = "json", data = "<update>")]
pub async fn update(
    db: Db,
    auth: Auth,
    slug: String,
    update: Json<UpdateArticle>,
) -> ApiResult<Value> {
    let actor_id = auth.0.id;
    let view = db
        .run(move |conn| -> Result<ArticleView, ApiError> {
            let article = load_by_slug(&slug, conn)?;
            if article.author_id != actor_id {
                return Err(ApiError::Forbidden);
            }
            diesel_update(articles::table.find(article.id))
                .set((&update.into_inner().article, articles::updated_at.eq(Utc::now())))
                .execute(conn)?;
            view_by_slug(&slug, Some(actor_id), conn)
        })
        .await?;
    Ok(Json(json!({ "article": view })))
}

#[rocket::delete("/<slug>")]
pub async fn delete(db: Db, auth: Auth, slug: String) -> ApiResult<Value> {
    let actor_id = auth.0.id;
    db.run(move |conn| -> Result<(), ApiError> {
        let article = load_by_slug(&slug, conn)?;
        if article.author_id != actor_id {
            return Err(ApiError::Forbidden);
        }
        // Comments go with their article; the FK cascade is the backstop.
        diesel_delete(comments::table.filter(comments::article_id.eq(article.id)))
            .execute(conn)?;
        diesel_delete(articles::table.find(article.id)).execute(conn)?;
        log::info!("deleted article {slug}");
        Ok(())
    })
    .await?;
    Ok(Json(json!({})))
}

/// The favorite relation is a set: this insert leaves exactly one edge no
/// matter how often it runs.
fn favorite_edge(
    user_id: i32,
    article_id: i32,
) -> impl diesel::query_dsl::methods::ExecuteDsl<PgConnection>
       + diesel::query_builder::QueryFragment<Pg>
       + diesel::RunQueryDsl<PgConnection> {
    insert_into(favorites::table)
        .values((
            favorites::user_id.eq(user_id),
            favorites::article_id.eq(article_id),
        ))
        .on_conflict((favorites::user_id, favorites::article_id))
        .do_nothing()
}

#[rocket::post("/<slug>/favorite")]
pub async fn favorite(db: Db, auth: Auth, slug: String) -> CreatedResult {
    let actor_id = auth.0.id;
    let view = db
        .run(move |conn| -> Result<ArticleView, ApiError> {
            let article = load_by_slug(&slug, conn)?;
            favorite_edge(actor_id, article.id).execute(conn)?;
            view_by_slug(&slug, Some(actor_id), conn)
        })
        .await?;
    created(json!({ "article": view }))
}

#[rocket::delete("/<slug>/favorite")]
pub async fn unfavorite(db: Db, auth: Auth, slug: String) -> CreatedResult {
    let actor_id = auth.0.id;
    let view = db
        .run(move |conn| -> Result<ArticleView, ApiError> {
            let article = load_by_slug(&slug, conn)?;
            diesel_delete(
                favorites::table
                    .filter(favorites::user_id.eq(actor_id))
                    .filter(favorites::article_id.eq(article.id)),
            )
            .execute(conn)?;
            view_by_slug(&slug, Some(actor_id), conn)
        })
        .await?;
    created(json!({ "article": view }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn slug_keeps_title_and_appends_base36_suffix() {
        let pattern = Regex::new(r"^hello-world-[0-9a-z]{6}$").unwrap();
        for _ in 0..50 {
            let slug = make_slug("Hello World");
            assert!(pattern.is_match(&slug), "unexpected slug {slug}");
        }
    }

    #[test]
    fn slug_suffixes_draw_from_the_whole_alphabet() {
        let seen: HashSet<char> = (0..500).flat_map(|_| slug_suffix().chars().collect::<Vec<_>>()).collect();
        // 500 draws of 6 chars essentially never stay inside digits only.
        assert!(seen.iter().any(|c| c.is_ascii_lowercase()));
        assert!(seen.iter().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn listing_orders_by_recency_descending() {
        let scope = Scope::default();
        let query = scoped(&scope).order(articles::created_at.desc());
        let sql = diesel::debug_query::<Pg, _>(&query).to_string();
        assert!(sql.contains("ORDER BY \"articles\".\"created_at\" DESC"));
    }

    #[test]
    fn absent_filters_add_no_predicates() {
        let scope = Scope::default();
        let sql = diesel::debug_query::<Pg, _>(&scoped(&scope)).to_string();
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn present_filters_compose_conjunctively() {
        let scope = Scope {
            tag: Some("rust".into()),
            author_ids: Some(vec![1]),
            favorite_ids: Some(vec![2, 3]),
        };
        let sql = diesel::debug_query::<Pg, _>(&scoped(&scope)).to_string();
        assert!(sql.contains("@>"), "tag containment missing: {sql}");
        assert!(sql.contains("\"articles\".\"author_id\" = ANY("), "{sql}");
        assert!(sql.contains("\"articles\".\"id\" = ANY("), "{sql}");
        assert_eq!(sql.matches(" AND ").count(), 2, "{sql}");
    }

    #[test]
    fn count_query_is_unpaginated() {
        let scope = Scope {
            tag: Some("rust".into()),
            ..Scope::default()
        };
        let sql = diesel::debug_query::<Pg, _>(&scoped_count(&scope)).to_string();
        assert!(sql.contains("count(*)"));
        assert!(!sql.contains("LIMIT"));
        assert!(!sql.contains("OFFSET"));
    }

    #[test]
    fn pagination_applies_to_the_ordered_query() {
        let scope = Scope::default();
        let query = scoped(&scope)
            .order(articles::created_at.desc())
            .offset(20)
            .limit(10);
        let sql = diesel::debug_query::<Pg, _>(&query).to_string();
        assert!(sql.contains("LIMIT"));
        assert!(sql.contains("OFFSET"));
    }

    #[test]
    fn negative_page_parameters_are_clamped() {
        assert_eq!(page_bounds(Some(-5), Some(-1)), (Some(0), Some(0)));
        assert_eq!(page_bounds(Some(10), Some(0)), (Some(10), Some(0)));
        assert_eq!(page_bounds(None, None), (None, None));
    }

    #[test]
    fn favoriting_twice_leaves_one_edge() {
        let sql = diesel::debug_query::<Pg, _>(&favorite_edge(1, 2)).to_string();
        assert!(sql.contains("ON CONFLICT"), "{sql}");
        assert!(sql.contains("DO NOTHING"), "{sql}");
    }

    #[test]
    fn unknown_author_username_yields_the_empty_body() {
        assert!(resolve_scope(None, Some(None), None).is_none());
        let body = empty_list();
        assert_eq!(body["articles"], json!([]));
        assert_eq!(body["articlesCount"], 0);
    }

    #[test]
    fn unknown_favorited_username_wins_over_other_filters() {
        assert!(resolve_scope(Some("rust".into()), Some(Some(4)), Some(None)).is_none());
    }

    #[test]
    fn resolved_filters_land_in_the_scope() {
        let scope = resolve_scope(
            Some("rust".into()),
            Some(Some(4)),
            Some(Some(vec![7, 9])),
        )
        .unwrap();
        assert_eq!(scope.tag.as_deref(), Some("rust"));
        assert_eq!(scope.author_ids, Some(vec![4]));
        assert_eq!(scope.favorite_ids, Some(vec![7, 9]));
    }

    #[test]
    fn feed_for_a_user_following_nobody_is_empty() {
        assert!(feed_scope(vec![]).is_none());
        assert_eq!(empty_list()["articlesCount"], 0);
    }

    #[test]
    fn feed_scopes_to_the_followed_authors_only() {
        let scope = feed_scope(vec![3, 5]).unwrap();
        assert_eq!(scope.author_ids, Some(vec![3, 5]));
        assert!(scope.tag.is_none());
        assert!(scope.favorite_ids.is_none());
    }
}
