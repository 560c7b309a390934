// Route exports
pub mod applications;

use actix_web::web;

pub use applications::AppState;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.configure(applications::configure_root).service(
        web::scope("/api")
            .configure(applications::configure),
    );
}
