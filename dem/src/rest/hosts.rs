use actix_web::{delete, get, patch, post, put, web, HttpResponse};

use crate::{
    error::ModelError,
    rest::{ok_text, Data, RestError},
    service::{self, HostBody},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_hosts)
        .service(create_host)
        .service(show_host)
        .service(host_logpage)
        .service(post_host)
        .service(put_host)
        .service(patch_host)
        .service(delete_host);
}

#[get("/host")]
async fn list_hosts(data: Data) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::list_hosts(data.get_ref())))
}

#[post("/host")]
async fn create_host(data: Data, body: web::Bytes) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let parsed: HostBody = service::parse_body(&body)?;
        let alias = parsed
            .alias
            .clone()
            .ok_or_else(|| ModelError::invalid("missing host alias"))?;
        service::add_host(&state, &alias, parsed)
    })
    .await?;
    Ok(ok_text(msg))
}

#[get("/host/{alias}")]
async fn show_host(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::show_host(data.get_ref(), &alias)?))
}

#[get("/host/{alias}/logpage")]
async fn host_logpage(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::host_logpage(data.get_ref(), &alias)?))
}

#[post("/host/{alias}")]
async fn post_host(
    data: Data,
    web::Path(alias): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let parsed: HostBody = service::parse_body(&body)?;
        let exists = state.config.read().find_host(&alias).is_some();
        if exists {
            service::update_host(&state, Some(&alias), parsed)
        } else {
            service::add_host(&state, &alias, parsed)
        }
    })
    .await?;
    Ok(ok_text(msg))
}

#[put("/host/{alias}")]
async fn put_host(
    data: Data,
    web::Path(alias): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let parsed: HostBody = service::parse_body(&body)?;
        let exists = state.config.read().find_host(&alias).is_some();
        if exists {
            service::update_host(&state, Some(&alias), parsed)
        } else {
            service::add_host(&state, &alias, parsed)
        }
    })
    .await?;
    Ok(ok_text(msg))
}

#[patch("/host/{alias}")]
async fn patch_host(
    data: Data,
    web::Path(alias): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        if body.is_empty() {
            return Err(ModelError::invalid("no data provided"));
        }
        service::update_host(&state, Some(&alias), service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[delete("/host/{alias}")]
async fn delete_host(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::del_host(&state, &alias)).await?;
    Ok(ok_text(msg))
}
