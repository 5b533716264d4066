#[macro_use]
extern crate rocket;

mod article;
mod comment;
mod config;
mod db;
mod profile;
mod tags;
mod types;
mod users;
mod utils;

use rocket::serde::json::Json;
use serde_json::{json, Value};

use config::AppConfig;
use db::Db;

#[catch(400)]
fn bad_request() -> Json<Value> {
    Json(json!({"errors": {"request": ["bad request"]}}))
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    Json(json!({"errors": {"authorization": ["missing or invalid credential"]}}))
}

#[catch(404)]
fn not_found() -> Json<Value> {
    Json(json!({"errors": {"entity": ["not found"]}}))
}

#[catch(422)]
fn unprocessable() -> Json<Value> {
    Json(json!({"errors": {"request": ["unprocessable entity"]}}))
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    Json(json!({"errors": {"server": ["internal error"]}}))
}

#[launch]
fn rocket() -> _ {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().expect("DATABASE_URL and SECRET_KEY must be set");

    let figment = rocket::Config::figment()
        .merge(("databases.conduit.url", config.database_url.clone()));

    rocket::custom(figment)
        .attach(Db::fairing())
        .manage(config)
        .mount("/api/users", routes![users::register, users::login])
        .mount(
            "/api",
            routes![
                users::current,
                users::update,
                users::delete,
                profile::profile,
                profile::follow,
                profile::unfollow,
            ],
        )
        .mount(
            "/api/articles",
            routes![
                article::list,
                article::feed,
                article::get,
                article::create,
                article::update,
                article::delete,
                article::favorite,
                article::unfavorite,
                comment::add,
                comment::list,
                comment::delete,
            ],
        )
        .mount("/api/tags", routes![tags::list])
        .register(
            "/",
            catchers![
                bad_request,
                unauthorized,
                not_found,
                unprocessable,
                internal_error
            ],
        )
}
