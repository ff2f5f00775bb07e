//! Unit tests for Events - trade parsing, alert wire format and bus events.

#[cfg(test)]
mod events_tests {
    use crate::error::ValidationError;
    use crate::events::*;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    // ============= TradeEvent::parse =============

    #[test]
    fn test_parse_valid_trade() {
        let payload = r#"{"symbol":"BTCUSDT","price":"42000.50","quantity":"0.015","event_time":1700000004000,"trade_id":"12345"}"#;
        let trade = TradeEvent::parse(payload).unwrap();

        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.price, dec("42000.50"));
        assert_eq!(trade.quantity, dec("0.015"));
        assert_eq!(trade.event_time, 1_700_000_004_000);
        assert_eq!(trade.trade_id, "12345");
    }

    #[test]
    fn test_parse_upstream_aliases_and_extra_fields() {
        let payload = r#"{"exchange":"binance","symbol":" ethusdt ","price":"3000","qty":"2","side":"buy","ts":1700000000000,"ingest_ts":1700000000100,"trade_id":"e-1"}"#;
        let trade = TradeEvent::parse(payload).unwrap();

        assert_eq!(trade.symbol, "ETHUSDT");
        assert_eq!(trade.quantity, dec("2"));
        assert_eq!(trade.event_time, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_negative_event_time() {
        let payload = r#"{"symbol":"BTCUSDT","price":"1","quantity":"1","event_time":-5,"trade_id":"n"}"#;
        assert_eq!(TradeEvent::parse(payload).unwrap().event_time, -5);
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(
            TradeEvent::parse("{\"symbol\":"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        let payload = r#"{"symbol":"BTCUSDT","price":"1","quantity":"1","trade_id":"x"}"#;
        assert!(matches!(
            TradeEvent::parse(payload),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_numeric_decimals() {
        // Decimals travel as strings; a JSON number is not coerced
        let payload = r#"{"symbol":"BTCUSDT","price":42000.5,"quantity":"1","event_time":1,"trade_id":"x"}"#;
        assert!(matches!(
            TradeEvent::parse(payload),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_string_timestamp() {
        let payload = r#"{"symbol":"BTCUSDT","price":"1","quantity":"1","event_time":"1700000000000","trade_id":"x"}"#;
        assert!(TradeEvent::parse(payload).is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_decimal() {
        let payload = r#"{"symbol":"BTCUSDT","price":"abc","quantity":"1","event_time":1,"trade_id":"x"}"#;
        match TradeEvent::parse(payload) {
            Err(ValidationError::InvalidDecimal { field, value }) => {
                assert_eq!(field, "price");
                assert_eq!(value, "abc");
            }
            other => panic!("Expected InvalidDecimal, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_non_positive() {
        let zero_qty = r#"{"symbol":"BTCUSDT","price":"1","quantity":"0","event_time":1,"trade_id":"x"}"#;
        let negative_price = r#"{"symbol":"BTCUSDT","price":"-3","quantity":"1","event_time":1,"trade_id":"x"}"#;

        assert!(matches!(
            TradeEvent::parse(zero_qty),
            Err(ValidationError::NonPositive { field: "quantity", .. })
        ));
        assert!(matches!(
            TradeEvent::parse(negative_price),
            Err(ValidationError::NonPositive { field: "price", .. })
        ));
    }

    #[test]
    fn test_parse_rejects_empty_symbol_and_id() {
        let no_symbol = r#"{"symbol":"  ","price":"1","quantity":"1","event_time":1,"trade_id":"x"}"#;
        let no_id = r#"{"symbol":"BTCUSDT","price":"1","quantity":"1","event_time":1,"trade_id":""}"#;

        assert_eq!(
            TradeEvent::parse(no_symbol).unwrap_err(),
            ValidationError::EmptyField { field: "symbol" }
        );
        assert_eq!(
            TradeEvent::parse(no_id).unwrap_err(),
            ValidationError::EmptyField { field: "trade_id" }
        );
    }

    // ============= Alerts =============

    fn alert(severity: Severity) -> Alert {
        Alert {
            symbol: "BTCUSDT".to_string(),
            window_start: 1_700_000_000_000,
            window_end: 1_700_000_010_000,
            metric_name: Metric::Volume,
            observed_value: dec("120"),
            threshold: dec("100"),
            severity,
        }
    }

    #[test]
    fn test_alert_message_wire_format() {
        let json = alert(Severity::Warn).to_message().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(
            value,
            json!({
                "symbol": "BTCUSDT",
                "window_start": 1_700_000_000_000i64,
                "window_end": 1_700_000_010_000i64,
                "metric": "volume",
                "observed_value": 120.0,
                "threshold": 100.0,
                "severity": "WARN"
            })
        );
    }

    #[test]
    fn test_alert_message_critical_roundtrip() {
        let message = alert(Severity::Critical).to_message();
        let json = message.to_json().unwrap();
        assert!(json.contains(r#""severity":"CRITICAL""#));

        let parsed: AlertMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_alert_dedup_key() {
        let a = alert(Severity::Warn);
        let key = a.dedup_key();
        assert_eq!(key.to_string(), "BTCUSDT@1700000000000/volume");
        assert_eq!(key, alert(Severity::Critical).dedup_key());
        assert_eq!(a.window_id().to_string(), "BTCUSDT@1700000000000");
    }

    #[test]
    fn test_severity_order_and_names() {
        assert!(Severity::Warn < Severity::Critical);
        assert_eq!(Severity::Warn.to_string(), "WARN");
        assert_eq!(Metric::Volume.to_string(), "volume");
    }

    #[test]
    fn test_window_id_ordering() {
        let a = WindowId {
            symbol: "AAA".to_string(),
            window_start: 10,
        };
        let b = WindowId {
            symbol: "AAA".to_string(),
            window_start: 20,
        };
        let c = WindowId {
            symbol: "BBB".to_string(),
            window_start: 0,
        };
        assert!(a < b && b < c);
    }

    // ============= Bus events =============

    #[test]
    fn test_late_trade_event_clone() {
        let trade = TradeEvent::parse(
            r#"{"symbol":"SOLUSDT","price":"100","quantity":"1","event_time":1,"trade_id":"l"}"#,
        )
        .unwrap();
        let event = Event::LateTrade {
            worker: 2,
            trade,
            horizon: 5,
        };

        if let Event::LateTrade { worker, trade, horizon } = event.clone() {
            assert_eq!(worker, 2);
            assert_eq!(trade.trade_id, "l");
            assert_eq!(horizon, 5);
        } else {
            panic!("Expected LateTrade event");
        }
    }
}
