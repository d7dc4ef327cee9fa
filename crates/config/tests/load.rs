use std::time::Duration;

use app_config::AppConfig;
use config::{File, FileFormat};

fn load_json(json: &str) -> anyhow::Result<AppConfig> {
    AppConfig::from_source(File::from_str(json, FileFormat::Json))
}

#[test]
fn test_load_default_config() {
    let cfg = load_json("{}").unwrap();
    assert_eq!(cfg.db_host, "localhost");
    assert_eq!(cfg.http_port, 8081);
    assert_eq!(cfg.poll_interval, Duration::from_secs(3));
    assert_eq!(cfg.poll_max_attempts, 100);
    assert_eq!(cfg.pending_order_ttl, Duration::from_secs(30 * 60));

    let rules = cfg.pricing_rules();
    assert_eq!(rules.free_shipping_threshold, 1_500_000);
    assert_eq!(rules.shipping_fee, 15_000);
    assert_eq!(rules.momo_fee_percent, 5);
}

#[test]
fn test_overrides_take_precedence() {
    let cfg = load_json(
        r#"{ "http_port": 9000, "poll_interval": "500ms", "db_host": "postgres" }"#,
    )
    .unwrap();
    assert_eq!(cfg.http_port, 9000);
    assert_eq!(cfg.poll_interval, Duration::from_millis(500));
    assert!(cfg.db_dsn().starts_with("host=postgres port=5432"));
}

#[test]
fn test_invalid_duration_is_rejected() {
    let err = load_json(r#"{ "sweep_interval": "soon" }"#).unwrap_err();
    assert!(format!("{err:#}").contains("soon"));
}
