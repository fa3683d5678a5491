//! Quote wire format used on the feed
//!
//! Payloads are flat JSON objects: `{"symbol", "rate", "event_time", "event_id"}`.
//! `ccy_couple` is accepted in place of `symbol` for producers that still use
//! the storage column name.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{FeedError, FeedResult};
use crate::Quote;

/// Event name used when pushing updates to clients
pub const UPDATE_EVENT_NAME: &str = "forex_update";

/// Flat key-value payload carried by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteMessage {
    #[serde(alias = "ccy_couple")]
    pub symbol: String,
    pub rate: Decimal,
    pub event_time: i64,
    pub event_id: u64,
}

impl QuoteMessage {
    pub fn encode(&self) -> FeedResult<String> {
        serde_json::to_string(self).map_err(|e| FeedError::Malformed(e.to_string()))
    }

    /// Decode without applying quote validation
    pub fn decode(payload: &str) -> FeedResult<Self> {
        serde_json::from_str(payload).map_err(|e| FeedError::Malformed(e.to_string()))
    }
}

impl From<&Quote> for QuoteMessage {
    fn from(quote: &Quote) -> Self {
        Self {
            symbol: quote.symbol.clone(),
            rate: quote.rate,
            event_time: quote.event_time,
            event_id: quote.event_id,
        }
    }
}

impl From<QuoteMessage> for Quote {
    fn from(msg: QuoteMessage) -> Self {
        Quote::new(msg.symbol, msg.rate, msg.event_time, msg.event_id)
    }
}

/// Serialize a quote for the feed
pub fn encode_quote(quote: &Quote) -> FeedResult<String> {
    QuoteMessage::from(quote).encode()
}

/// Parse and validate a feed payload.
///
/// Both malformed JSON and quotes failing validation are reported as errors;
/// nothing invalid reaches the aggregator.
pub fn decode_quote(payload: &str) -> FeedResult<Quote> {
    let quote: Quote = QuoteMessage::decode(payload)?.into();
    quote.validate()?;
    Ok(quote)
}

/// Envelope pushed to notification clients
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a, T: Serialize> {
    pub event: &'a str,
    pub data: &'a T,
}

impl<'a, T: Serialize> Notification<'a, T> {
    pub fn new(event: &'a str, data: &'a T) -> Self {
        Self { event, data }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ValidationError;
    use crate::UpdateEvent;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_flat_payload() {
        let quote = decode_quote(
            r#"{"symbol":"EURUSD","rate":1.0852,"event_time":1734256800123,"event_id":288230383844089600}"#,
        )
        .unwrap();

        assert_eq!(quote.symbol, "EURUSD");
        assert_eq!(quote.rate, dec!(1.0852));
        assert_eq!(quote.event_time, 1_734_256_800_123);
        assert_eq!(quote.event_id, 288_230_383_844_089_600);
    }

    #[test]
    fn test_decode_accepts_storage_column_name() {
        let quote = decode_quote(
            r#"{"ccy_couple":"NZDUSD","rate":0.5731,"event_time":1,"event_id":2}"#,
        )
        .unwrap();
        assert_eq!(quote.symbol, "NZDUSD");
    }

    #[test]
    fn test_encode_is_decodable() {
        let quote = Quote::new("AUDUSD", dec!(0.6342), 42, 7);
        let payload = encode_quote(&quote).unwrap();
        assert!(payload.contains("\"event_time\":42"));
        assert_eq!(decode_quote(&payload).unwrap(), quote);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(decode_quote("not json"), Err(FeedError::Malformed(_))));
        assert!(matches!(
            decode_quote(r#"{"symbol":"EURUSD","rate":1.1}"#),
            Err(FeedError::Malformed(_))
        ));
        assert!(matches!(
            decode_quote(r#"{"symbol":"EURUSD","rate":-1.1,"event_time":1,"event_id":1}"#),
            Err(FeedError::Invalid(ValidationError::NonPositiveRate { .. }))
        ));
        assert!(matches!(
            decode_quote(r#"{"symbol":"","rate":1.1,"event_time":1,"event_id":1}"#),
            Err(FeedError::Invalid(ValidationError::EmptySymbol { .. }))
        ));
    }

    #[test]
    fn test_notification_envelope() {
        let event = UpdateEvent::from_quote(&Quote::new("EURUSD", dec!(1.1), 0, 1), None);
        let json = Notification::new(UPDATE_EVENT_NAME, &event).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["event"], "forex_update");
        assert_eq!(value["data"]["symbol"], "EURUSD");
        assert!(value["data"]["percentage_change"].is_null());
        assert_eq!(value["data"]["baseline_available"], false);
    }
}
