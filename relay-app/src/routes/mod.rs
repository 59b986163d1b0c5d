pub mod chat;
pub mod ping;

use axum::Router;

pub fn router() -> Router {
    Router::new().merge(ping::router()).merge(chat::router())
}
