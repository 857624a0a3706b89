//! Launch links against the published bootstrap template.
//!
//! Needs network access. Run with `cargo test --features integration`.

#![cfg(feature = "integration")]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use stackrelay::config::{
    DEFAULT_CONSOLE_BASE_URL, DEFAULT_REGION, DEFAULT_TEMPLATE_NAME, DEFAULT_TEMPLATE_URL,
    ProviderConfig,
};
use stackrelay::db::memory::MemoryTrustStore;
use stackrelay::launch::LaunchUrlBuilder;
use stackrelay::registry::TrustRegistry;

fn provider() -> ProviderConfig {
    ProviderConfig {
        region: DEFAULT_REGION.to_string(),
        console_base_url: DEFAULT_CONSOLE_BASE_URL.to_string(),
        role_session_name: "stackrelay-status".to_string(),
        use_team_role: false,
        stack_prefix: "stackrelay".to_string(),
        templates: BTreeMap::from([(
            DEFAULT_TEMPLATE_NAME.to_string(),
            DEFAULT_TEMPLATE_URL.to_string(),
        )]),
    }
}

/// Decoded key/value pairs of the console fragment's query.
fn fragment_params(url: &str) -> HashMap<String, String> {
    let (_, fragment) = url.split_once('#').expect("fragment");
    let (_, query) = fragment.split_once('?').expect("fragment query");
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), urlencoding::decode(v).unwrap().into_owned()))
        .collect()
}

#[tokio::test]
async fn test_default_template_resolves_and_link_carries_it() {
    let registry = Arc::new(TrustRegistry::new(Arc::new(MemoryTrustStore::new()), None));
    let builder = LaunchUrlBuilder::new(Arc::clone(&registry), &provider());

    let link = builder
        .build_launch_url("integration-team", DEFAULT_TEMPLATE_NAME)
        .await
        .unwrap();
    assert_eq!(link.template_url, DEFAULT_TEMPLATE_URL);

    let params = fragment_params(&link.url);
    assert_eq!(params["templateUrl"], DEFAULT_TEMPLATE_URL);
    assert_eq!(params["stackName"], link.stack_name);
    assert_eq!(params["param_ExternalID"], link.external_id);
    assert_eq!(params["param_TeamID"], "integration-team");
    assert_eq!(params["capabilities"], "CAPABILITY_IAM");
    assert!(link.url.contains(&format!("region={DEFAULT_REGION}")));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .unwrap();
    let resp = http.get(&link.template_url).send().await.unwrap();
    assert!(
        resp.status().is_success(),
        "template fetch returned {}",
        resp.status()
    );
    let body = resp.text().await.unwrap();
    assert!(body.contains("Resources"), "not a CloudFormation template");
}
