use actix_web::{delete, get, patch, post, put, web, HttpResponse};

use crate::{
    rest::{ok_text, Data, RestError},
    service::{self, GroupBody},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_groups)
        .service(show_group)
        .service(post_group)
        .service(put_group)
        .service(patch_group)
        .service(delete_group)
        .service(link_target)
        .service(unlink_target)
        .service(link_host)
        .service(unlink_host);
}

#[get("/group")]
async fn list_groups(data: Data) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::list_groups(data.get_ref())))
}

#[get("/group/{group}")]
async fn show_group(
    data: Data,
    web::Path(group): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::show_group(data.get_ref(), &group)?))
}

#[post("/group/{group}")]
async fn post_group(
    data: Data,
    web::Path(group): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        if body.is_empty() {
            service::add_group(&state, &group)
        } else {
            service::update_group(&state, &group, service::parse_body(&body)?)
        }
    })
    .await?;
    Ok(ok_text(msg))
}

#[put("/group/{group}")]
async fn put_group(
    data: Data,
    web::Path(group): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        if body.is_empty() {
            service::add_group(&state, &group)
        } else {
            let parsed: GroupBody = service::parse_body(&body)?;
            service::update_group(&state, &group, parsed)
        }
    })
    .await?;
    Ok(ok_text(msg))
}

#[patch("/group/{group}")]
async fn patch_group(
    data: Data,
    web::Path(group): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        service::update_group(&state, &group, service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[delete("/group/{group}")]
async fn delete_group(
    data: Data,
    web::Path(group): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::del_group(&state, &group)).await?;
    Ok(ok_text(msg))
}

#[post("/group/{group}/target/{alias}")]
async fn link_target(
    data: Data,
    web::Path((group, alias)): web::Path<(String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg =
        web::block(move || service::group_member(&state, &group, Some(&alias), None, true))
            .await?;
    Ok(ok_text(msg))
}

#[delete("/group/{group}/target/{alias}")]
async fn unlink_target(
    data: Data,
    web::Path((group, alias)): web::Path<(String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg =
        web::block(move || service::group_member(&state, &group, Some(&alias), None, false))
            .await?;
    Ok(ok_text(msg))
}

#[post("/group/{group}/host/{alias}")]
async fn link_host(
    data: Data,
    web::Path((group, alias)): web::Path<(String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg =
        web::block(move || service::group_member(&state, &group, None, Some(&alias), true))
            .await?;
    Ok(ok_text(msg))
}

#[delete("/group/{group}/host/{alias}")]
async fn unlink_host(
    data: Data,
    web::Path((group, alias)): web::Path<(String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg =
        web::block(move || service::group_member(&state, &group, None, Some(&alias), false))
            .await?;
    Ok(ok_text(msg))
}
