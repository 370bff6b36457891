use log::{error, info};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use sysgpio::{AppConfig, AppState, GpioManager};

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SYSGPIO_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(AppConfig::load_from_file(&config_path).map_err(io::Error::other)?);

    let manager = Arc::new(GpioManager::new(config.clone()).map_err(io::Error::other)?);
    manager.initialize().await.map_err(io::Error::other)?;
    let app_state = AppState {
        manager: manager.clone(),
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        _ => {
            error!("Config error: either 'unix_socket' or 'host' must be specified");
            manager.shutdown().await;
            return Err(io::Error::other("no listen address configured"));
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let result = server.run().await;
    manager.shutdown().await;
    result
}
