/**
 * Minimal JSON-RPC surface of the proxy.
 *
 * The proxy is transport-level and treats messages as opaque lines. The one
 * exception is the auth-challenge reply, which needs the request's top-level
 * `id` so the client can correlate the synthesized error.
 */
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Extract the top-level `id` field of a JSON-RPC message as an integer.
///
/// Numbers and numeric strings are rounded to the nearest integer. A missing
/// or non-numeric id, or a line that is not valid JSON, yields -1, the
/// sentinel the auth-challenge reply carries when no id could be recovered.
pub fn message_id(raw: &str) -> i64 {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            error!("error parsing JSON message: {err}");
            return -1;
        }
    };

    match value.get("id") {
        Some(Value::Number(n)) => n.as_f64().map(|f| f.round() as i64).unwrap_or(-1),
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map(|f| f.round() as i64)
            .unwrap_or(-1),
        _ => -1,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcReply {
    pub jsonrpc: String,
    pub id: i64,
    pub result: ReplyResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyResult {
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Build the JSON-RPC error object sent to the client when the server
/// demanded authentication, pointing the user at the authorization URL.
pub fn auth_challenge_reply(id: i64, auth_url: &str) -> JsonRpcReply {
    JsonRpcReply {
        jsonrpc: "2.0".to_string(),
        id,
        result: ReplyResult {
            is_error: true,
            content: vec![ContentItem {
                kind: "text".to_string(),
                text: format!(
                    "This user is currently unauthorized to perform this operation. \
                     Please tell them to go to {auth_url} to authenticate. \
                     Then come back and tell you to try again."
                ),
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_id_handles_numbers_and_strings() {
        assert_eq!(message_id(r#"{"id": 5, "method": "x"}"#), 5);
        assert_eq!(message_id(r#"{"id": 5.0}"#), 5);
        assert_eq!(message_id(r#"{"id": 5.4}"#), 5);
        assert_eq!(message_id(r#"{"id": 5.6}"#), 6);
        assert_eq!(message_id(r#"{"id": "5"}"#), 5);
        assert_eq!(message_id(r#"{"id": "5.2"}"#), 5);
    }

    #[test]
    fn message_id_returns_sentinel_when_unrecoverable() {
        assert_eq!(message_id(r#"{"method": "x"}"#), -1);
        assert_eq!(message_id(r#"{"id": "abc"}"#), -1);
        assert_eq!(message_id(r#"{"id": null}"#), -1);
        assert_eq!(message_id(r#"{"id": [1]}"#), -1);
        assert_eq!(message_id("not json"), -1);
    }

    #[test]
    fn auth_reply_round_trips() {
        let reply = auth_challenge_reply(7, "https://auth.example.com/auth?state=xyz");
        let encoded = serde_json::to_string(&reply).unwrap();

        assert!(encoded.contains(r#""isError":true"#));
        assert!(encoded.contains("https://auth.example.com/auth?state=xyz"));
        assert!(encoded.contains(r#""id":7"#));

        let decoded: JsonRpcReply = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, reply);
    }
}
