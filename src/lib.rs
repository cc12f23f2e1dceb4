pub mod config;
pub mod db;
pub mod delivery;
pub mod events;
pub mod graph;
pub mod identity;
pub mod models;
pub mod policy;
pub mod rate_limit;
pub mod routing;
pub mod routes;

use config::RegistryConfig;
use db::Db;
use events::EventBus;
use rate_limit::RateLimiter;
use rocket_cors::CorsOptions;
use std::env;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/registry.db".to_string());
    rocket_with_db(&db_path)
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, RegistryConfig::from_env())
}

pub fn rocket_with_config(db_path: &str, config: RegistryConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, config)
}

fn build_rocket(db_path: &str, config: RegistryConfig) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Db::new(db_path);
    let events = EventBus::new();
    let rate_limiter = RateLimiter::new();
    let http_client = delivery::http_client(config.callback_timeout_secs);

    // Clones for the retry processor, started on liftoff
    let retry_db = db.clone();
    let retry_config = config.clone();
    let retry_events = events.sender.clone();

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    // Payloads are capped at 32 KiB by default; leave JSON headroom for the
    // envelope around them.
    let figment = rocket::Config::figment().merge(("limits.json", 1024 * 1024));

    rocket::custom(figment)
        .manage(db)
        .manage(config)
        .manage(events)
        .manage(rate_limiter)
        .manage(http_client)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::unauthorized,
                routes::not_found,
                routes::unprocessable,
                routes::too_many_requests,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::register,
                routes::verify_user,
                routes::get_verification,
                routes::rotate_key,
                routes::me,
                routes::register_agent,
                routes::list_agents,
                routes::delete_agent,
                routes::ping_agent,
                routes::contact_connections,
                routes::friend_request,
                routes::accept_friend,
                routes::reject_friend,
                routes::block_friend,
                routes::list_friends,
                routes::unfriend,
                routes::list_friend_roles,
                routes::assign_friend_role,
                routes::remove_friend_role,
                routes::list_roles,
                routes::create_role,
                routes::create_group,
                routes::list_groups,
                routes::get_group,
                routes::invite_to_group,
                routes::join_group,
                routes::leave_group,
                routes::group_members,
                routes::transfer_group,
                routes::delete_group,
                routes::create_policy,
                routes::list_policies,
                routes::update_policy,
                routes::delete_policy,
                routes::policy_context,
                routes::send_message,
                routes::message_history,
                routes::get_preferences,
                routes::update_preferences,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Delivery Retry Processor",
            move |_rocket| {
                Box::pin(async move {
                    delivery::spawn_retry_processor(retry_db, retry_config, retry_events);
                    println!("📬 Delivery retry processor started");
                })
            },
        ))
}
