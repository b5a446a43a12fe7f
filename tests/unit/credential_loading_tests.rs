//! Unit tests for master-key loading and validation.
//!
//! The test environment has no keychain entry for the `authbridge`
//! service, so loading falls through to `AUTHBRIDGE_MASTER_KEY`.

use authbridge::config::{validate_master_key, GlobalConfig};

const KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

fn make_config() -> GlobalConfig {
    GlobalConfig::from_toml_str(
        r#"
[vm_provider]
base_url = "http://vm-manager:9000"
"#,
    )
    .expect("config parses")
}

#[test]
fn well_formed_key_validates() {
    assert!(validate_master_key(KEY).is_ok());
}

#[test]
fn short_or_non_hex_key_is_rejected() {
    assert!(validate_master_key("abcd").is_err());
    let non_hex = "z".repeat(64);
    assert!(validate_master_key(&non_hex).is_err());
}

#[tokio::test]
#[serial_test::serial]
async fn master_key_falls_back_to_env_var() {
    std::env::set_var("AUTHBRIDGE_MASTER_KEY", KEY);

    let mut config = make_config();
    let result = config.load_master_key().await;

    std::env::remove_var("AUTHBRIDGE_MASTER_KEY");

    result.expect("key loads from env");
    assert_eq!(config.master_key, KEY);
}

#[tokio::test]
#[serial_test::serial]
async fn missing_master_key_names_the_env_var() {
    std::env::remove_var("AUTHBRIDGE_MASTER_KEY");

    let mut config = make_config();
    let err = config.load_master_key().await.expect_err("no key available");
    assert!(
        err.to_string().contains("AUTHBRIDGE_MASTER_KEY"),
        "error should name the env var: {err}"
    );
}

#[tokio::test]
#[serial_test::serial]
async fn malformed_env_key_is_rejected() {
    std::env::set_var("AUTHBRIDGE_MASTER_KEY", "not-a-key");

    let mut config = make_config();
    let result = config.load_master_key().await;

    std::env::remove_var("AUTHBRIDGE_MASTER_KEY");

    assert!(result.is_err());
    assert!(config.master_key.is_empty());
}
