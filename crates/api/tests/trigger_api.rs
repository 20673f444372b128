//! Integration tests for triggered batch execution.

mod common;

use axum::http::StatusCode;
use common::{body_json, post_json};
use scriptbox_core::script_types::TriggerEvent;
use serde_json::json;

const TRIGGER_URI: &str = "/api/v1/triggers/execute";

#[tokio::test(flavor = "multi_thread")]
async fn batch_runs_in_order_and_survives_a_failure() {
    let app = common::build_test_app();
    let first = app.seed("return data_id");
    let second = app.seed("error('second script broke')");
    let third = app.seed("return 'third'");

    let response = post_json(
        app.router.clone(),
        TRIGGER_URI,
        json!({
            "tenantId": app.tenant_id,
            "triggerEvent": "after-create",
            "triggerEntity": "order",
            "data": { "data_id": 7 },
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let results = json["data"].as_array().unwrap();
    assert_eq!(results.len(), 3);

    assert_eq!(results[0]["scriptId"], first.id.to_string());
    assert_eq!(results[0]["status"], "SUCCESS");
    assert_eq!(results[0]["value"], 7);

    assert_eq!(results[1]["scriptId"], second.id.to_string());
    assert_eq!(results[1]["status"], "FAILED");
    assert!(results[1]["error"]
        .as_str()
        .unwrap()
        .contains("second script broke"));

    assert_eq!(results[2]["scriptId"], third.id.to_string());
    assert_eq!(results[2]["status"], "SUCCESS");
    assert_eq!(results[2]["value"], "third");

    assert_eq!(app.history.all().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn upper_snake_event_is_accepted() {
    let app = common::build_test_app();
    app.seed_with("return true", TriggerEvent::BeforeUpdate, "invoice", true);

    let response = post_json(
        app.router.clone(),
        TRIGGER_URI,
        json!({
            "tenantId": app.tenant_id,
            "triggerEvent": "BEFORE_UPDATE",
            "triggerEntity": "invoice",
            "data": {},
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
    assert_eq!(json["data"][0]["value"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_and_unrelated_scripts_are_skipped() {
    let app = common::build_test_app();
    app.seed_with("return 1", TriggerEvent::AfterCreate, "order", false);
    app.seed_with("return 2", TriggerEvent::AfterDelete, "order", true);
    app.seed_with("return 3", TriggerEvent::AfterCreate, "invoice", true);

    let response = post_json(
        app.router.clone(),
        TRIGGER_URI,
        json!({
            "tenantId": app.tenant_id,
            "triggerEvent": "after-create",
            "triggerEntity": "order",
            "data": {},
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"], json!([]));
    assert!(app.history.all().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_event_is_validation_error() {
    let app = common::build_test_app();

    let response = post_json(
        app.router.clone(),
        TRIGGER_URI,
        json!({
            "tenantId": app.tenant_id,
            "triggerEvent": "on-save",
            "triggerEntity": "order",
            "data": {},
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn non_object_data_is_validation_error() {
    let app = common::build_test_app();
    app.seed("return 1");

    let response = post_json(
        app.router.clone(),
        TRIGGER_URI,
        json!({
            "tenantId": app.tenant_id,
            "triggerEvent": "after-create",
            "triggerEntity": "order",
            "data": "not an object",
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.history.all().is_empty());
}
