//! The management surface end to end: verbs, error codes and the
//! on-disk projection.

use std::sync::Arc;

use actix_web::{test, web, App};
use dem::{
    config::store::Store,
    interfaces::HostIface,
    rest,
    state::ManagerState,
};

fn test_state(tag: &str) -> (Arc<ManagerState>, std::path::PathBuf) {
    let dir = std::env::temp_dir().join(format!("dem-rest-{}-{}", std::process::id(), tag));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.json");
    let state = ManagerState::build(
        Store::new(path.clone()),
        vec![HostIface {
            trtype: "tcp".to_string(),
            adrfam: "ipv4".to_string(),
            traddr: "127.0.0.1".to_string(),
            trsvcid: "4420".to_string(),
        }],
        None,
    )
    .unwrap();
    (state, path)
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(rest::app_config)
                .default_service(web::route().to(rest::default_handler)),
        )
        .await
    };
}

#[actix_rt::test]
async fn target_lifecycle_and_error_codes() {
    let (state, _) = test_state("lifecycle");
    let mut app = app!(state);

    // create
    let req = test::TestRequest::post()
        .uri("/target")
        .set_payload(r#"{"alias":"T1","mgmt_mode":"local","refresh":0}"#)
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert!(rsp.status().is_success());

    // duplicate create conflicts without mutating
    let req = test::TestRequest::post().uri("/target/T1").to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert_eq!(rsp.status().as_u16(), 409);

    // port and subsystem
    let req = test::TestRequest::put()
        .uri("/target/T1/portid/1")
        .set_payload(r#"{"type":"tcp","family":"ipv4","address":"10.0.0.1","trsvcid":4420}"#)
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert!(rsp.status().is_success());

    let req = test::TestRequest::put()
        .uri("/target/T1/subsystem/nqn.x")
        .set_payload(r#"{"allow_any":1}"#)
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert!(rsp.status().is_success());

    // list and show
    let req = test::TestRequest::get().uri("/target").to_request();
    let rsp = test::call_service(&mut app, req).await;
    let body = test::read_body(rsp).await;
    assert!(std::str::from_utf8(&body).unwrap().contains("T1"));

    let req = test::TestRequest::get()
        .uri("/target?fabric=rdma")
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    let body = test::read_body(rsp).await;
    assert!(!std::str::from_utf8(&body).unwrap().contains("T1"));

    // the log page inspection view sees the announced endpoint
    let req = test::TestRequest::get()
        .uri("/target/T1/logpage")
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    let body = test::read_body(rsp).await;
    assert!(std::str::from_utf8(&body).unwrap().contains("nqn.x"));

    // delete, then missing entities are 402 for compatibility
    let req = test::TestRequest::delete().uri("/target/T1").to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert!(rsp.status().is_success());

    let req = test::TestRequest::get().uri("/target/T1").to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert_eq!(rsp.status().as_u16(), 402);

    // unknown page vs unimplemented verb
    let req = test::TestRequest::get().uri("/bogus").to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert_eq!(rsp.status().as_u16(), 404);

    let req = test::TestRequest::delete().uri("/dem").to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert_eq!(rsp.status().as_u16(), 405);
}

#[actix_rt::test]
async fn host_rename_cascades_to_disk() {
    let (state, path) = test_state("rename");
    let mut app = app!(state);

    for (uri, payload) in &[
        ("/target", r#"{"alias":"T1","mgmt_mode":"local","refresh":0}"#),
        ("/host", r#"{"alias":"H1","hostnqn":"nqn.h"}"#),
        ("/group/G1", ""),
    ] {
        let req = test::TestRequest::post()
            .uri(uri)
            .set_payload(*payload)
            .to_request();
        let rsp = test::call_service(&mut app, req).await;
        assert!(rsp.status().is_success(), "seeding {} failed", uri);
    }

    let req = test::TestRequest::put()
        .uri("/target/T1/subsystem/nqn.x")
        .set_payload(r#"{"allow_any":0}"#)
        .to_request();
    assert!(test::call_service(&mut app, req).await.status().is_success());

    let req = test::TestRequest::put()
        .uri("/target/T1/subsystem/nqn.x/host/H1")
        .to_request();
    assert!(test::call_service(&mut app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/group/G1/host/H1")
        .to_request();
    assert!(test::call_service(&mut app, req).await.status().is_success());

    // rename; every reference must follow
    let req = test::TestRequest::post()
        .uri("/host/H1")
        .set_payload(r#"{"alias":"H2"}"#)
        .to_request();
    assert!(test::call_service(&mut app, req).await.status().is_success());

    let text = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["Hosts"][0]["Alias"], "H2");
    assert_eq!(json["Targets"][0]["Subsystems"][0]["Hosts"][0], "H2");
    assert_eq!(json["Groups"][0]["Hosts"][0], "H2");
    assert!(!text.contains("\"H1\""));
}

#[actix_rt::test]
async fn duplicate_link_folds_to_one_acl_entry() {
    let (state, path) = test_state("idempotent");
    let mut app = app!(state);

    for (uri, payload) in &[
        ("/target", r#"{"alias":"T1","mgmt_mode":"local","refresh":0}"#),
        ("/host", r#"{"alias":"H1","hostnqn":"nqn.h"}"#),
    ] {
        let req = test::TestRequest::post()
            .uri(uri)
            .set_payload(*payload)
            .to_request();
        assert!(test::call_service(&mut app, req).await.status().is_success());
    }
    let req = test::TestRequest::put()
        .uri("/target/T1/subsystem/nqn.x")
        .set_payload(r#"{"allow_any":0}"#)
        .to_request();
    assert!(test::call_service(&mut app, req).await.status().is_success());

    for _ in 0..2 {
        let req = test::TestRequest::put()
            .uri("/target/T1/subsystem/nqn.x/host/H1")
            .to_request();
        assert!(test::call_service(&mut app, req).await.status().is_success());
    }

    let text = std::fs::read_to_string(&path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        json["Targets"][0]["Subsystems"][0]["Hosts"]
            .as_array()
            .unwrap()
            .len(),
        1
    );
}

#[actix_rt::test]
async fn signature_guards_requests() {
    let (state, _) = test_state("signature");
    *state.signature.write() = Some("Basic secret".to_string());
    let mut app = app!(state);

    // the daemon applies the check in front of every route; the app
    // here omits the middleware, so exercise the check directly plus
    // the rotation endpoint
    let req = test::TestRequest::post()
        .uri("/dem/signature")
        .set_payload(r#"{"old":"secret","new":"rotated"}"#)
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert!(rsp.status().is_success());
    assert_eq!(
        state.signature.read().as_deref(),
        Some("Basic rotated")
    );

    let req = test::TestRequest::post()
        .uri("/dem/signature")
        .set_payload(r#"{"old":"wrong","new":"x"}"#)
        .to_request();
    let rsp = test::call_service(&mut app, req).await;
    assert_eq!(rsp.status().as_u16(), 400);
}
