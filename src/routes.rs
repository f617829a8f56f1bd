use actix_web::web;

use crate::handlers::{config_handlers, device_handlers, security_key_handlers};

// Configure /api routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    // Device routes (/api/devices/*)
    cfg.service(
        web::scope("/devices")
            .route("", web::get().to(device_handlers::list_devices_handler))
            .route(
                "/{device_id}/config",
                web::post().to(config_handlers::deliver_config_handler),
            )
            .route(
                "/{device_id}/status",
                web::get().to(device_handlers::device_status_handler),
            )
            .route(
                "/{device_id}/history",
                web::get().to(config_handlers::config_history_handler),
            ),
    );

    // Security key routes (/api/security-keys)
    cfg.service(web::scope("/security-keys").route(
        "",
        web::post().to(security_key_handlers::issue_security_key_handler),
    ));
}
