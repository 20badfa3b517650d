use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hostcert::challenge::webroot::WebrootPublisher;
use hostcert::core::options::{IssuanceOptions, PollingConfig};
use hostcert::core::types::RunSummary;
use hostcert::issuance::directory::PROBLEM_USER_ACTION_REQUIRED;
use hostcert::issuance::error::{AuthorizationFailure, IssuanceError};
use hostcert::issuance::flow::IssuanceOrchestrator;
use hostcert::issuance::http_directory::HttpAcmeDirectory;

use super::test_utils::{
    account_key, account_reply, mount_directory, problem, signed_reply, temp_dir, url,
};

fn options(server: &MockServer, domains: &[&str]) -> IssuanceOptions {
    IssuanceOptions {
        domains: domains.iter().map(|d| d.to_string()).collect(),
        endpoint: url(server, "/directory"),
        account_email: "owner@example.com".into(),
        key_size: 2048,
        document_roots: vec![temp_dir("orchestrator-root")],
        polling: PollingConfig {
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(50),
            max_attempts: 10,
            validation_timeout: Duration::from_secs(5),
            issuance_timeout: Duration::from_secs(5),
        },
        request_timeout: Duration::from_secs(5),
        ..IssuanceOptions::default()
    }
}

fn orchestrator(options: IssuanceOptions) -> Result<IssuanceOrchestrator> {
    let directory = Arc::new(HttpAcmeDirectory::new(
        options.endpoint.clone(),
        options.request_timeout,
    ));
    let publisher = Arc::new(WebrootPublisher::new(options.document_roots.clone()));
    Ok(IssuanceOrchestrator::new(
        options,
        account_key(),
        directory,
        publisher,
    ))
}

async fn mount_existing_account(server: &MockServer, times: Option<u64>) {
    let mock = Mock::given(method("POST"))
        .and(path("/new-acct"))
        .respond_with(account_reply(server, 200));
    match times {
        Some(times) => mock.up_to_n_times(times).mount(server).await,
        None => mock.mount(server).await,
    }
}

#[tokio::test]
async fn refused_terms_stop_before_any_order() -> Result<()> {
    let server = MockServer::start().await;
    mount_directory(&server, Some("https://ca.example/terms-v2.pdf")).await;
    mount_existing_account(&server, Some(1)).await;
    Mock::given(method("POST"))
        .and(path("/new-acct"))
        .respond_with(problem(
            403,
            PROBLEM_USER_ACTION_REQUIRED,
            "Terms of service have changed",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new-order"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let failure = orchestrator(options(&server, &["example.com"]))?
        .run()
        .await
        .expect_err("terms refused");
    match failure.error {
        IssuanceError::TermsNotAgreed { detail } => {
            assert_eq!(detail, "Terms of service have changed")
        }
        other => return Err(anyhow!("unexpected error {other:?}")),
    }
    Ok(())
}

#[tokio::test]
async fn invalid_authorization_is_reported_and_order_never_finalized() -> Result<()> {
    let server = MockServer::start().await;
    mount_directory(&server, None).await;
    mount_existing_account(&server, None).await;
    Mock::given(method("POST"))
        .and(path("/new-order"))
        .respond_with(
            signed_reply(
                201,
                json!({
                    "status": "pending",
                    "expires": "2030-01-01T00:00:00Z",
                    "identifiers": [{ "type": "dns", "value": "example.com" }],
                    "authorizations": [url(&server, "/authz/1")],
                    "finalize": url(&server, "/order/1/finalize"),
                }),
            )
            .insert_header("Location", url(&server, "/order/1")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/authz/1"))
        .respond_with(signed_reply(200, json!({
            "identifier": { "type": "dns", "value": "example.com" },
            "status": "invalid",
            "expires": "2030-01-01T00:00:00Z",
            "challenges": [{
                "type": "http-01",
                "url": url(&server, "/chall/1"),
                "token": "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0",
                "status": "invalid",
                "error": {
                    "type": "urn:ietf:params:acme:error:unauthorized",
                    "detail": "Invalid response from http://example.com/.well-known/acme-challenge/: 404"
                }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/order/1/finalize"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let result = orchestrator(options(&server, &["example.com"]))?.run().await;
    let summary = serde_json::to_value(RunSummary::from_result(&result))?;
    assert_eq!(summary["success"], false);
    assert_eq!(summary["authorizations"][0]["error"]["kind"], "challenge_rejected");

    let failure = result.err().ok_or_else(|| anyhow!("run should fail"))?;
    match failure.error {
        IssuanceError::Authorization(err) => {
            assert_eq!(err.domain, "example.com");
            match err.failure {
                AuthorizationFailure::ChallengeRejected { detail } => {
                    assert!(detail.contains("404"), "{detail}")
                }
                other => return Err(anyhow!("unexpected failure {other:?}")),
            }
        }
        other => return Err(anyhow!("unexpected error {other:?}")),
    }
    Ok(())
}

#[tokio::test]
async fn bad_options_fail_without_contacting_the_ca() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mut opts = options(&server, &["example.com", "Example.COM"]);
    opts.key_size = 1024;
    let failure = orchestrator(opts)?
        .run()
        .await
        .expect_err("duplicate domains");
    assert!(matches!(failure.error, IssuanceError::Configuration(_)));
    Ok(())
}
