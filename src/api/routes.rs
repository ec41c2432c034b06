use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/blocks", web::post().to(handlers::add_block))
            .route("/blocks/submit", web::post().to(handlers::submit_block))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/transactions", web::post().to(handlers::send_transaction))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/wallet/new", web::post().to(handlers::create_wallet)),
    );
}
