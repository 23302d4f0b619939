use std::sync::atomic::Ordering;

use actix_web::{get, post, web, HttpResponse};

use crate::{
    rest::{ok_text, Data, RestError, SERVER},
    service,
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_interfaces)
        .service(shutdown)
        .service(signature);
}

#[get("/dem")]
async fn list_interfaces(data: Data) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::list_interfaces(data.get_ref())))
}

#[post("/dem/shutdown")]
async fn shutdown(data: Data) -> Result<HttpResponse, RestError> {
    data.stopped.store(true, Ordering::Relaxed);
    if let Some(server) = SERVER.lock().clone() {
        actix_web::rt::spawn(async move {
            server.stop(true).await;
        });
    }
    Ok(ok_text("DEM Discovery controller shutting down".to_string()))
}

#[post("/dem/signature")]
async fn signature(data: Data, body: web::Bytes) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let body = service::parse_body(&body)?;
        service::update_signature(&state, body)
    })
    .await?;
    Ok(ok_text(msg))
}
