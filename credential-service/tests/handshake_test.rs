//! Cross-domain handshake: origin rules, dev browser redirects and token rotation.

mod common;

use axum::{
    body::Body,
    http::{header, Method, StatusCode},
};
use common::{frontend, TestApp};
use credential_service::{
    middleware::handshake::MAX_FORM_BYTES,
    models::{DeviceKind, InstanceEnvironment},
    store::DeviceStore,
};
use uuid::Uuid;

const HOST: &str = "clerk.example.com";

#[tokio::test]
async fn production_requires_origin_or_authorization() {
    let app = TestApp::spawn().await;
    app.production_instance(HOST).await;

    let response = app
        .send(frontend(Method::POST, HOST, "/v1/client").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_code(), "missing_request_headers");
    assert!(response.body["clerk_trace_id"].is_string());
}

#[tokio::test]
async fn unknown_host_is_not_found() {
    let app = TestApp::spawn().await;
    app.production_instance(HOST).await;

    let response = app
        .send(
            frontend(Method::POST, "clerk.unknown.dev", "/v1/client")
                .header(header::ORIGIN, "https://app.unknown.dev")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.error_code(), "instance_not_found");
}

#[tokio::test]
async fn foreign_origin_is_rejected() {
    let app = TestApp::spawn().await;
    app.production_instance(HOST).await;

    let response = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::ORIGIN, "https://example.com.evil.io")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_code(), "invalid_origin");
    assert_eq!(
        response.body["errors"][0]["meta"]["origin"],
        "https://example.com.evil.io"
    );
}

#[tokio::test]
async fn same_site_and_satellite_origins_bootstrap_a_client() {
    let app = TestApp::spawn().await;
    let mut instance = app.production_instance(HOST).await;
    instance.satellite_domains = vec!["satellite.io".to_string()];
    app.save_instance(&instance).await;

    for origin in ["https://www.example.com", "https://shop.satellite.io"] {
        let response = app
            .send(
                frontend(Method::POST, HOST, "/v1/client")
                    .header(header::ORIGIN, origin)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status, StatusCode::CREATED, "origin {}", origin);
        assert_eq!(response.body["object"], "client");

        let cookie = response
            .set_cookies()
            .into_iter()
            .find(|c| c.starts_with("__client="))
            .expect("client cookie");
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
    }
    assert_eq!(app.events.count("device.created"), 2);
}

#[tokio::test]
async fn client_cookie_alone_attributes_the_request() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance(HOST).await;
    let (device, token) = app
        .state
        .handshake
        .devices()
        .create(&instance, DeviceKind::Client)
        .await
        .unwrap();

    let response = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::COOKIE, format!("__client={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["id"], device.device_id.to_string());
}

#[tokio::test]
async fn duplicate_or_conflicting_headers_are_rejected() {
    let app = TestApp::spawn().await;
    app.production_instance(HOST).await;

    let duplicate = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::ORIGIN, "https://www.example.com")
                .header(header::ORIGIN, "https://app.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::BAD_REQUEST);
    assert_eq!(duplicate.error_code(), "multiple_origin_header_values");

    let conflict = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::ORIGIN, "https://www.example.com")
                .header(header::AUTHORIZATION, "Bearer abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(conflict.status, StatusCode::BAD_REQUEST);
    assert_eq!(conflict.error_code(), "origin_authorization_headers_conflict");
}

#[tokio::test]
async fn third_party_dev_navigation_is_redirected_through_storage_access() {
    let app = TestApp::spawn().await;
    app.development_instance(HOST).await;
    let path = format!("/v1/client/verifications/{}", Uuid::new_v4());

    let navigation = app
        .send(
            frontend(Method::GET, HOST, &path)
                .header(header::REFERER, "https://myapp.dev/account")
                .header(header::ACCEPT, "text/html,application/xhtml+xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(navigation.status, StatusCode::TEMPORARY_REDIRECT);
    let location = navigation.header(header::LOCATION).expect("location");
    let expected_prefix = format!(
        "https://{}/v1/dev_browser/storage_access?redirect_url=https%3A%2F%2F{}%2Fv1%2Fclient%2Fverifications",
        HOST, HOST
    );
    assert!(location.starts_with(&expected_prefix), "{}", location);

    let fetch = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::ORIGIN, "https://myapp.dev")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(fetch.status, StatusCode::UNAUTHORIZED);
    assert_eq!(fetch.error_code(), "dev_browser_unauthenticated");
    let handshake_url = fetch.body["errors"][0]["meta"]["handshake_url"]
        .as_str()
        .expect("handshake url");
    assert!(handshake_url.contains("/v1/dev_browser/storage_access"));
}

#[tokio::test]
async fn first_party_dev_requests_bootstrap_a_dev_browser() {
    let app = TestApp::spawn().await;
    app.development_instance(HOST).await;

    let response = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::ORIGIN, "https://dashboard.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["object"], "dev_browser");
    let cookie = response
        .set_cookies()
        .into_iter()
        .find(|c| c.starts_with("__clerk_db_jwt="))
        .expect("dev browser cookie");
    assert!(cookie.contains("SameSite=None"));

    // The token also works as a query param, which is stripped before routing.
    let token = response.body["token"].as_str().unwrap().to_string();
    let again = app
        .send(
            frontend(Method::POST, HOST, &format!("/v1/client?__clerk_db_jwt={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["id"], response.body["id"]);
}

#[tokio::test]
async fn stale_token_is_exchanged_once_with_its_nonce() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance(HOST).await;
    let devices = app.state.handshake.devices();

    let (device, stale_token) = devices.create(&instance, DeviceKind::Client).await.unwrap();
    let (_, current_token) = devices
        .establish_session(
            &instance,
            device.device_id,
            "user_1",
            Some("nonce-1".to_string()),
        )
        .await
        .unwrap();

    let request = |token: &str| {
        frontend(Method::POST, HOST, "/v1/client?rotating_token_nonce=nonce-1")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let exchanged = app.send(request(&stale_token)).await;
    assert_eq!(exchanged.status, StatusCode::OK);
    assert_eq!(exchanged.body["session_user_id"], "user_1");
    let refreshed = exchanged
        .header(header::AUTHORIZATION)
        .expect("refreshed token header")
        .to_string();
    assert_ne!(refreshed, stale_token);

    // The refreshed token carries the current rotating token.
    let with_refreshed = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::AUTHORIZATION, format!("Bearer {}", refreshed))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(with_refreshed.body["session_user_id"], "user_1");

    // Replaying the stale token after the nonce was spent drops the session.
    let replay = app.send(request(&stale_token)).await;
    assert_eq!(replay.status, StatusCode::OK);
    assert!(replay.body.get("session_user_id").is_none());
    assert!(replay.header(header::AUTHORIZATION).is_none());
    assert_eq!(app.events.count("device.token_mismatch"), 1);

    let stored = app
        .store
        .find_device(instance.instance_id, device.device_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.session_subject, None);

    let current = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::AUTHORIZATION, format!("Bearer {}", current_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(current.status, StatusCode::OK);
    assert!(current.body.get("session_user_id").is_none());
}

#[tokio::test]
async fn proxy_header_must_match_the_configured_proxy() {
    let app = TestApp::spawn().await;
    let mut instance = app.development_instance(HOST).await;
    instance.proxy_url = Some("https://myapp.dev/__clerk".to_string());
    app.save_instance(&instance).await;

    let storage_access = |proxy: &str| {
        frontend(
            Method::GET,
            HOST,
            "/v1/dev_browser/storage_access?redirect_url=https%3A%2F%2Fmyapp.dev%2F",
        )
        .header("x-clerk-proxy-url", proxy)
        .body(Body::empty())
        .unwrap()
    };

    let proxied = app.send(storage_access("https://myapp.dev/__clerk/")).await;
    assert_eq!(proxied.status, StatusCode::OK);
    assert!(proxied
        .text
        .contains("https://myapp.dev/__clerk/v1/dev_browser/init?redirect_url="));

    for bad in ["https://evil.dev/__clerk", "http://myapp.dev/__clerk", "not a url"] {
        let response = app.send(storage_access(bad)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "proxy {}", bad);
        assert_eq!(response.error_code(), "invalid_proxy_url");
    }
}

#[tokio::test]
async fn dev_browser_token_is_never_sent_to_an_untrusted_redirect() {
    let app = TestApp::spawn().await;
    let instance = app.development_instance(HOST).await;
    let devices = app.state.handshake.devices();
    let (device, _) = devices.create(&instance, DeviceKind::DevBrowser).await.unwrap();
    let (_, token) = devices
        .establish_session(&instance, device.device_id, "user_1", None)
        .await
        .unwrap();

    for path in [
        "/v1/dev_browser/init?redirect_url=https%3A%2F%2Fevil.attacker.net%2Fcollect",
        "/v1/dev_browser/storage_access?redirect_url=https%3A%2F%2Fevil.attacker.net%2Fcollect",
    ] {
        let response = app
            .send(
                frontend(Method::GET, HOST, path)
                    .header(header::COOKIE, format!("__clerk_db_jwt={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY, "{}", path);
        assert_eq!(response.error_code(), "invalid_redirect_url");
        assert!(response.header(header::LOCATION).is_none());
        assert!(!response.text.contains(&token));
    }

    let same_site = app
        .send(
            frontend(
                Method::GET,
                HOST,
                "/v1/dev_browser/init?redirect_url=https%3A%2F%2Fapp.example.com%2Fhome",
            )
            .header(header::COOKIE, format!("__clerk_db_jwt={}", token))
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(same_site.status, StatusCode::TEMPORARY_REDIRECT);
    assert!(same_site
        .header(header::LOCATION)
        .unwrap_or_default()
        .starts_with("https://app.example.com/home?__clerk_db_jwt="));
}

#[tokio::test]
async fn form_bodies_carry_handshake_params_up_to_a_limit() {
    let app = TestApp::spawn().await;
    let instance = app.development_instance(HOST).await;
    let (device, token) = app
        .state
        .handshake
        .devices()
        .create(&instance, DeviceKind::DevBrowser)
        .await
        .unwrap();

    let form = |body: String| {
        frontend(Method::POST, HOST, "/v1/dev_browser")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    };

    let existing = app.send(form(format!("__clerk_db_jwt={}&x=1", token))).await;
    assert_eq!(existing.status, StatusCode::OK);
    assert_eq!(existing.body["id"], device.device_id.to_string());

    let oversized = app
        .send(form(format!("x={}", "a".repeat(MAX_FORM_BYTES + 1))))
        .await;
    assert_eq!(oversized.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(oversized.error_code(), "request_body_too_large");
}

#[tokio::test]
async fn dev_browser_tokens_stop_resolving_after_promotion() {
    let app = TestApp::spawn().await;
    let instance = app.development_instance(HOST).await;
    let (device, token) = app
        .state
        .handshake
        .devices()
        .create(&instance, DeviceKind::DevBrowser)
        .await
        .unwrap();

    let promoted = app
        .state
        .instances
        .promote_to_production(instance.instance_id)
        .await
        .unwrap();
    assert_eq!(promoted.environment, InstanceEnvironment::Production);
    assert!(app
        .store
        .find_device(instance.instance_id, device.device_id)
        .await
        .unwrap()
        .is_none());

    let response = app
        .send(
            frontend(Method::POST, HOST, "/v1/client")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["object"], "client");
    assert_eq!(app.events.count("instance.promoted"), 1);
}
