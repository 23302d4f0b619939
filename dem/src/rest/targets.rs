use std::collections::HashMap;

use actix_web::{delete, get, patch, post, put, web, HttpResponse};

use crate::{
    error::ModelError,
    rest::{ok_text, Data, RestError},
    service::{self, SubsysBody},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_targets)
        .service(create_target)
        .service(show_target)
        .service(post_target)
        .service(put_target)
        .service(patch_target)
        .service(delete_target)
        .service(refresh_target)
        .service(reconfig_target)
        .service(target_usage)
        .service(target_logpage)
        .service(post_subsys)
        .service(put_subsys)
        .service(patch_subsys)
        .service(delete_subsys)
        .service(put_ns)
        .service(delete_ns)
        .service(put_acl)
        .service(delete_acl)
        .service(put_portid)
        .service(delete_portid);
}

#[get("/target")]
async fn list_targets(
    data: Data,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::list_targets(
        data.get_ref(),
        query.get("mode").map(String::as_str),
        query.get("fabric").map(String::as_str),
    )))
}

#[post("/target")]
async fn create_target(data: Data, body: web::Bytes) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        service::update_target(&state, None, service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[get("/target/{alias}")]
async fn show_target(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::show_target(data.get_ref(), &alias)?))
}

#[post("/target/{alias}")]
async fn post_target(
    data: Data,
    web::Path(alias): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        if body.is_empty() {
            service::add_target(&state, &alias)
        } else {
            service::update_target(&state, Some(&alias), service::parse_body(&body)?)
        }
    })
    .await?;
    Ok(ok_text(msg))
}

#[put("/target/{alias}")]
async fn put_target(
    data: Data,
    web::Path(alias): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        service::update_target(&state, Some(&alias), service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[patch("/target/{alias}")]
async fn patch_target(
    data: Data,
    web::Path(alias): web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        if body.is_empty() {
            return Err(ModelError::invalid("no data provided"));
        }
        service::update_target(&state, Some(&alias), service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[delete("/target/{alias}")]
async fn delete_target(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::del_target(&state, &alias)).await?;
    Ok(ok_text(msg))
}

#[post("/target/{alias}/refresh")]
async fn refresh_target(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::target_refresh(&state, &alias)).await?;
    Ok(ok_text(msg))
}

#[post("/target/{alias}/reconfigure")]
async fn reconfig_target(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::target_reconfig(&state, &alias)).await?;
    Ok(ok_text(msg))
}

#[get("/target/{alias}/usage")]
async fn target_usage(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::target_usage(data.get_ref(), &alias)?))
}

#[get("/target/{alias}/logpage")]
async fn target_logpage(
    data: Data,
    web::Path(alias): web::Path<String>,
) -> Result<HttpResponse, RestError> {
    Ok(ok_text(service::target_logpage(data.get_ref(), &alias)?))
}

fn subsys_exists(state: &crate::state::ManagerState, alias: &str, subnqn: &str) -> bool {
    let cfg = state.config.read();
    cfg.find_target(alias)
        .map(|(_, t)| t.subsys(subnqn).is_some())
        .unwrap_or(false)
}

#[post("/target/{alias}/subsystem/{subnqn}")]
async fn post_subsys(
    data: Data,
    web::Path((alias, subnqn)): web::Path<(String, String)>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let mut parsed: SubsysBody = if body.is_empty() {
            // bare create defaults to open access
            SubsysBody {
                subnqn: None,
                allow_any: Some(1),
            }
        } else {
            service::parse_body(&body)?
        };
        if parsed.subnqn.is_none() {
            parsed.subnqn = Some(subnqn.clone());
        }
        let existing = subsys_exists(&state, &alias, &subnqn);
        service::set_subsys(
            &state,
            &alias,
            if existing { Some(&subnqn) } else { None },
            parsed,
        )
    })
    .await?;
    Ok(ok_text(msg))
}

#[put("/target/{alias}/subsystem/{subnqn}")]
async fn put_subsys(
    data: Data,
    web::Path((alias, subnqn)): web::Path<(String, String)>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let mut parsed: SubsysBody = service::parse_body(&body)?;
        if parsed.subnqn.is_none() {
            parsed.subnqn = Some(subnqn.clone());
        }
        let existing = subsys_exists(&state, &alias, &subnqn);
        service::set_subsys(
            &state,
            &alias,
            if existing { Some(&subnqn) } else { None },
            parsed,
        )
    })
    .await?;
    Ok(ok_text(msg))
}

#[patch("/target/{alias}/subsystem/{subnqn}")]
async fn patch_subsys(
    data: Data,
    web::Path((alias, subnqn)): web::Path<(String, String)>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        service::set_subsys(&state, &alias, Some(&subnqn), service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[delete("/target/{alias}/subsystem/{subnqn}")]
async fn delete_subsys(
    data: Data,
    web::Path((alias, subnqn)): web::Path<(String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::del_subsys(&state, &alias, &subnqn)).await?;
    Ok(ok_text(msg))
}

#[put("/target/{alias}/subsystem/{subnqn}/ns/{nsid}")]
async fn put_ns(
    data: Data,
    web::Path((alias, subnqn, nsid)): web::Path<(String, String, u32)>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        let mut parsed: service::NsBody = service::parse_body(&body)?;
        if parsed.nsid.is_none() {
            parsed.nsid = Some(nsid);
        }
        service::set_ns(&state, &alias, &subnqn, parsed)
    })
    .await?;
    Ok(ok_text(msg))
}

#[delete("/target/{alias}/subsystem/{subnqn}/ns/{nsid}")]
async fn delete_ns(
    data: Data,
    web::Path((alias, subnqn, nsid)): web::Path<(String, String, u32)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::del_ns(&state, &alias, &subnqn, nsid)).await?;
    Ok(ok_text(msg))
}

#[put("/target/{alias}/subsystem/{subnqn}/host/{host}")]
async fn put_acl(
    data: Data,
    web::Path((alias, subnqn, host)): web::Path<(String, String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::link_host(&state, &alias, &subnqn, &host)).await?;
    Ok(ok_text(msg))
}

#[delete("/target/{alias}/subsystem/{subnqn}/host/{host}")]
async fn delete_acl(
    data: Data,
    web::Path((alias, subnqn, host)): web::Path<(String, String, String)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::unlink_host(&state, &alias, &subnqn, &host)).await?;
    Ok(ok_text(msg))
}

#[put("/target/{alias}/portid/{portid}")]
async fn put_portid(
    data: Data,
    web::Path((alias, portid)): web::Path<(String, u16)>,
    body: web::Bytes,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || {
        service::set_portid(&state, &alias, portid, service::parse_body(&body)?)
    })
    .await?;
    Ok(ok_text(msg))
}

#[delete("/target/{alias}/portid/{portid}")]
async fn delete_portid(
    data: Data,
    web::Path((alias, portid)): web::Path<(String, u16)>,
) -> Result<HttpResponse, RestError> {
    let state = data.get_ref().clone();
    let msg = web::block(move || service::del_portid(&state, &alias, portid)).await?;
    Ok(ok_text(msg))
}
