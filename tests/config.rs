//! Integration tests for config loading.

mod common;

use common::*;
use std::time::Duration;

#[tokio::test]
async fn test_missing_file_uses_defaults() {
    let files = ConfigFiles::new().unwrap();

    let config = call_listen::config::load_from(files.path()).await.unwrap();

    assert_eq!(config, Config::default());
    assert_eq!(config.sample_rate, 16000);
    assert!(config.reconnect);
    assert_eq!(config.reconnect_policy().delay, Duration::from_secs(2));
    assert_eq!(config.output, OutputKind::Virtual);
}

#[tokio::test]
async fn test_full_config() {
    let files = ConfigFiles::new().unwrap();
    let path = files
        .write(
            r#"
origination_url = "https://calls.example.com/api/vapi_call"
sample_rate = 8000
reconnect = false
reconnect_delay_ms = 500
output = "device"
"#,
        )
        .await
        .unwrap();

    let config = call_listen::config::load_from(path).await.unwrap();

    assert_eq!(
        config.origination_url,
        "https://calls.example.com/api/vapi_call"
    );
    assert_eq!(config.sample_rate, 8000);
    assert_eq!(config.output, OutputKind::Device);
    assert_eq!(
        config.reconnect_policy(),
        ReconnectPolicy {
            enabled: false,
            delay: Duration::from_millis(500),
        }
    );
}

#[tokio::test]
async fn test_partial_config_keeps_defaults() {
    let files = ConfigFiles::new().unwrap();
    let path = files.write("sample_rate = 8000\n").await.unwrap();

    let config = call_listen::config::load_from(path).await.unwrap();

    assert_eq!(config.sample_rate, 8000);
    assert_eq!(
        config.origination_url,
        call_listen::config::DEFAULT_ORIGINATION_URL
    );
    assert!(config.reconnect);
}

#[tokio::test]
async fn test_unsupported_sample_rate_is_rejected() {
    let files = ConfigFiles::new().unwrap();
    let path = files.write("sample_rate = 44100\n").await.unwrap();

    let err = call_listen::config::load_from(path).await.unwrap_err();

    assert!(err.to_string().contains("44100"));
}

#[tokio::test]
async fn test_empty_origination_url_is_rejected() {
    let files = ConfigFiles::new().unwrap();
    let path = files.write("origination_url = \"  \"\n").await.unwrap();

    assert!(call_listen::config::load_from(path).await.is_err());
}

#[tokio::test]
async fn test_malformed_file_is_an_error() {
    let files = ConfigFiles::new().unwrap();
    let path = files.write("sample_rate = [oops").await.unwrap();

    let err = call_listen::config::load_from(&path).await.unwrap_err();

    assert!(err.to_string().starts_with("Failed to parse"));
}

#[tokio::test]
async fn test_unknown_output_kind_is_an_error() {
    let files = ConfigFiles::new().unwrap();
    let path = files.write("output = \"speakers\"\n").await.unwrap();

    assert!(call_listen::config::load_from(path).await.is_err());
}
