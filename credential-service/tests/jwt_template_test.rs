//! JWT template lifecycle and token minting.

mod common;

use common::{
    TestApp, EC_PRIVATE_KEY, EC_PUBLIC_KEY, RSA_OTHER_PUBLIC_KEY, RSA_PRIVATE_KEY, RSA_PUBLIC_KEY,
};
use credential_service::{
    models::PlanFeature,
    services::{ServiceError, SigningKeyParams, TemplateParams, TemplatePatch},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::Secret;
use serde_json::{json, Value};
use std::collections::BTreeSet;

fn params(name: &str, claims: Value) -> TemplateParams {
    TemplateParams {
        name: name.to_string(),
        claims,
        lifetime_seconds: None,
        allowed_clock_skew_seconds: None,
        signing_key: None,
        session_token: false,
    }
}

fn key(algorithm: &str, signing_key: &str, public_key: Option<&str>) -> SigningKeyParams {
    SigningKeyParams {
        algorithm: algorithm.to_string(),
        signing_key: Secret::new(signing_key.to_string()),
        public_key: public_key.map(str::to_string),
    }
}

/// Decode without wall-clock expiry checks; minted tokens carry the fixed test clock's time.
fn claims_of(token: &str, key: &DecodingKey, algorithm: Algorithm) -> Value {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_aud = false;
    decode::<Value>(token, key, &validation)
        .expect("token verifies")
        .claims
}

#[tokio::test]
async fn minted_token_renders_shortcodes_and_reserved_claims() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;
    let subject = app
        .add_subject(
            &instance,
            "user_1",
            json!({"email": "ada@example.com", "first_name": "Ada", "org": {"role": "admin"}}),
        )
        .await;

    let template = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                lifetime_seconds: Some(120),
                allowed_clock_skew_seconds: Some(10),
                ..params(
                    "supabase",
                    json!({
                        "email": "{{user.email}}",
                        "greeting": "Hello {{user.first_name}}!",
                        "role": "{{user.org.role}}",
                        "missing": "{{user.phone}}",
                        "aud": "authenticated",
                    }),
                )
            },
        )
        .await
        .expect("Failed to create template");

    let jwt = app
        .state
        .templates
        .mint(&template, &instance, &subject, Some("https://app.example.com"))
        .expect("Failed to mint");

    let public = DecodingKey::from_rsa_pem(RSA_PUBLIC_KEY.as_bytes()).unwrap();
    let claims = claims_of(&jwt, &public, Algorithm::RS256);
    let now = app.now().timestamp();

    assert_eq!(claims["email"], "ada@example.com");
    assert_eq!(claims["greeting"], "Hello Ada!");
    assert_eq!(claims["role"], "admin");
    assert_eq!(claims["missing"], Value::Null);
    assert_eq!(claims["aud"], "authenticated");
    assert_eq!(claims["sub"], "user_1");
    assert_eq!(claims["iss"], "https://clerk.example.com");
    assert_eq!(claims["azp"], "https://app.example.com");
    assert_eq!(claims["iat"], now);
    assert_eq!(claims["nbf"], now - 10);
    assert_eq!(claims["exp"], now + 120);

    let header = jsonwebtoken::decode_header(&jwt).unwrap();
    assert_eq!(header.kid.as_deref(), Some(instance.keys.key_id.as_str()));
    assert_eq!(app.events.count("jwt_template.saved"), 1);
}

#[tokio::test]
async fn minted_payload_holds_only_template_and_reserved_claims() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;
    let subject = app.add_subject(&instance, "user_1", json!({})).await;
    let template = app
        .state
        .templates
        .create(&instance, params("admin", json!({"role": "admin"})))
        .await
        .expect("Failed to create template");

    let public = DecodingKey::from_rsa_pem(RSA_PUBLIC_KEY.as_bytes()).unwrap();
    let key_set = |claims: &Value| -> BTreeSet<String> {
        claims.as_object().expect("object").keys().cloned().collect()
    };
    let expected = |extra: &[&str]| -> BTreeSet<String> {
        ["role", "iat", "nbf", "exp", "iss", "sub"]
            .iter()
            .chain(extra)
            .map(|k| k.to_string())
            .collect()
    };

    let without_azp = app
        .state
        .templates
        .mint(&template, &instance, &subject, None)
        .expect("Failed to mint");
    let claims = claims_of(&without_azp, &public, Algorithm::RS256);
    assert_eq!(claims["role"], "admin");
    assert_eq!(key_set(&claims), expected(&[]));

    let with_azp = app
        .state
        .templates
        .mint(&template, &instance, &subject, Some("https://app.example.com"))
        .expect("Failed to mint");
    let claims = claims_of(&with_azp, &public, Algorithm::RS256);
    assert_eq!(claims["azp"], "https://app.example.com");
    assert_eq!(key_set(&claims), expected(&["azp"]));
}

#[tokio::test]
async fn plan_without_templates_is_rejected() {
    let app = TestApp::spawn().await;
    let instance = app
        .instance_with_plan("clerk.example.com", vec![PlanFeature::CustomSessionToken])
        .await;

    let err = app
        .state
        .templates
        .create(&instance, params("supabase", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "feature_not_supported_by_plan");
    assert_eq!(err.status().as_u16(), 403);

    let session = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                session_token: true,
                ..params("session", json!({"role": "{{user.role}}"}))
            },
        )
        .await;
    assert!(session.is_ok());
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;

    let first = app
        .state
        .templates
        .create(&instance, params("hasura", json!({})))
        .await
        .unwrap();
    let second = app
        .state
        .templates
        .create(&instance, params("hasura", json!({"x": 1})))
        .await;
    assert!(matches!(second, Err(ServiceError::TemplateNameTaken)));

    let other = app
        .state
        .templates
        .create(&instance, params("fauna", json!({})))
        .await
        .unwrap();
    let rename = app
        .state
        .templates
        .update(
            &instance,
            other.template_id,
            TemplatePatch {
                name: Some("hasura".to_string()),
                ..TemplatePatch::default()
            },
        )
        .await;
    assert!(matches!(rename, Err(ServiceError::TemplateNameTaken)));

    let kept = app
        .state
        .templates
        .update(
            &instance,
            first.template_id,
            TemplatePatch {
                lifetime_seconds: Some(300),
                ..TemplatePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(kept.name, "hasura");
    assert_eq!(kept.lifetime_seconds, 300);
}

#[tokio::test]
async fn validation_reports_every_violation() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;

    let err = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                lifetime_seconds: Some(5),
                ..params("clerk_internal", json!({"sub": "x", "aud": ["clerk"]}))
            },
        )
        .await
        .unwrap_err();

    let ServiceError::Multiple(errors) = err else {
        panic!("expected multiple errors");
    };
    let codes: Vec<_> = errors.iter().map(ServiceError::code).collect();
    assert!(codes.contains(&"reserved_template_name"));
    assert!(codes.contains(&"reserved_claim"));
    assert!(codes.contains(&"forbidden_audience"));
    assert!(codes.contains(&"invalid_lifetime"));
    assert_eq!(app.events.count("jwt_template.saved"), 0);
}

#[tokio::test]
async fn session_template_cannot_be_deleted_until_unset() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;

    let template = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                session_token: true,
                ..params("session", json!({}))
            },
        )
        .await
        .unwrap();
    let instance = app.reload(&instance).await;
    assert_eq!(instance.session_template_id, Some(template.template_id));

    let err = app
        .state
        .templates
        .delete(&instance, template.template_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "template_not_deletable");
    assert_eq!(err.status().as_u16(), 400);

    app.state
        .templates
        .update(
            &instance,
            template.template_id,
            TemplatePatch {
                session_token: Some(false),
                ..TemplatePatch::default()
            },
        )
        .await
        .unwrap();
    let instance = app.reload(&instance).await;
    assert_eq!(instance.session_template_id, None);

    app.state
        .templates
        .delete(&instance, template.template_id)
        .await
        .unwrap();
    let gone = app.state.templates.get(&instance, template.template_id).await;
    assert!(matches!(gone, Err(ServiceError::TemplateNotFound)));
    assert_eq!(app.events.count("jwt_template.deleted"), 1);
}

#[tokio::test]
async fn custom_hmac_key_signs_template_tokens() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;
    let subject = app.add_subject(&instance, "user_1", json!({})).await;

    let template = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                signing_key: Some(key("hs256", "super-secret-value", None)),
                ..params("hasura", json!({"role": "user"}))
            },
        )
        .await
        .unwrap();

    let jwt = app
        .state
        .templates
        .mint(&template, &instance, &subject, None)
        .unwrap();
    let claims = claims_of(
        &jwt,
        &DecodingKey::from_secret(b"super-secret-value"),
        Algorithm::HS256,
    );
    assert_eq!(claims["role"], "user");
    assert!(claims.get("azp").is_none());

    // Dropping the custom key falls back to the instance key pair.
    let template = app
        .state
        .templates
        .update(
            &instance,
            template.template_id,
            TemplatePatch {
                signing_key: Some(None),
                ..TemplatePatch::default()
            },
        )
        .await
        .unwrap();
    assert!(template.custom_signing_key.is_none());
    let jwt = app
        .state
        .templates
        .mint(&template, &instance, &subject, None)
        .unwrap();
    let public = DecodingKey::from_rsa_pem(RSA_PUBLIC_KEY.as_bytes()).unwrap();
    claims_of(&jwt, &public, Algorithm::RS256);
}

#[tokio::test]
async fn custom_ec_key_is_accepted() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;

    let created = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                signing_key: Some(key("ES256", EC_PRIVATE_KEY, Some(EC_PUBLIC_KEY))),
                ..params("firebase", json!({}))
            },
        )
        .await;
    assert!(created.is_ok());
}

#[tokio::test]
async fn unusable_signing_keys_are_rejected() {
    let app = TestApp::spawn().await;
    let instance = app.production_instance("clerk.example.com").await;

    let cases = [
        ("empty-secret", key("HS256", "", None)),
        ("garbage-pem", key("RS256", "not a pem", None)),
        (
            "mismatched-pair",
            key("RS256", RSA_PRIVATE_KEY, Some(RSA_OTHER_PUBLIC_KEY)),
        ),
        ("wrong-family", key("ES256", RSA_PRIVATE_KEY, None)),
        ("p521", key("ES512", EC_PRIVATE_KEY, None)),
    ];

    for (name, signing_key) in cases {
        let err = app
            .state
            .templates
            .create(
                &instance,
                TemplateParams {
                    signing_key: Some(signing_key),
                    ..params(name, json!({}))
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "signing_key_invalid", "case {}", name);
        assert_eq!(err.status().as_u16(), 422);
    }

    let err = app
        .state
        .templates
        .create(
            &instance,
            TemplateParams {
                signing_key: Some(key("PS256", "secret", None)),
                ..params("pss", json!({}))
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_algorithm");

    assert!(app.state.templates.list(&instance).await.unwrap().is_empty());
}
