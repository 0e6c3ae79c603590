mod common;

use actix_web::{http::StatusCode, test, web, App};
use serde_json::{json, Value};

use blobber::handlers;
use common::harness;

#[actix_web::test]
async fn test_operational_routes() {
    let h = harness(&[]);
    h.accept_markers("alloc1", &["r1", "r2"]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.ctx.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/_healthcheck").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["blobber_id"], h.ctx.blobber_id());
    assert_eq!(body["volumes"], 1);

    let req = test::TestRequest::get().uri("/v1/challenge/missing").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::get().uri("/v1/writemarker/alloc1").to_request();
    let markers: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(markers.as_array().map(Vec::len), Some(2));
    assert_eq!(markers[1]["wm"]["prev_allocation_root"], "r1");

    let req = test::TestRequest::get()
        .uri("/v1/challenge/timings?limit=5")
        .to_request();
    let timings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(timings, json!([]));

    let req = test::TestRequest::get()
        .uri("/v1/challenge/timings?limit=0")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get().uri("/v1/volumes").to_request();
    let volumes: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(volumes["strategy"], "min_size_first");
}

#[actix_web::test]
async fn test_lock_routes() {
    let h = harness(&[]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.ctx.clone()))
            .configure(handlers::configure),
    )
    .await;

    let lock = |connection_id: &str| {
        test::TestRequest::post()
            .uri("/v1/writemarker/lock")
            .set_json(json!({"allocation_id": "alloc1", "connection_id": connection_id}))
            .to_request()
    };

    let body: Value = test::call_and_read_body_json(&app, lock("conn-a")).await;
    assert_eq!(body["status"], "ok");
    let body: Value = test::call_and_read_body_json(&app, lock("conn-b")).await;
    assert_eq!(body["status"], "pending");

    let req = test::TestRequest::delete()
        .uri("/v1/writemarker/lock")
        .set_json(json!({"allocation_id": "alloc1", "connection_id": "conn-a"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    let body: Value = test::call_and_read_body_json(&app, lock("conn-b")).await;
    assert_eq!(body["status"], "ok");

    let req = test::TestRequest::post()
        .uri("/v1/writemarker/lock")
        .set_json(json!({"allocation_id": "", "connection_id": "conn-c"}))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}
