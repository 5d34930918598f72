// src/network/messages.rs
//! Stratum v1 wire messages
//!
//! Every message is a single JSON object terminated by a newline. Requests
//! carry `id`, `method` and positional `params`; responses carry `id`,
//! `result` and `error`. Notifications are requests with a null id.

use crate::miner::job::Job;
use crate::utils::error::MinerError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const METHOD_SUBSCRIBE: &str = "mining.subscribe";
pub const METHOD_AUTHORIZE: &str = "mining.authorize";
pub const METHOD_SUBMIT: &str = "mining.submit";
pub const METHOD_NOTIFY: &str = "mining.notify";
pub const METHOD_SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const METHOD_RECONNECT: &str = "client.reconnect";

/// Outbound request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: u64,
    pub method: &'static str,
    pub params: Value,
}

impl Request {
    /// `mining.subscribe` announcing the client and the pool endpoint
    pub fn subscribe(id: u64, client_id: &str, host: &str, port: u16) -> Self {
        Request {
            id,
            method: METHOD_SUBSCRIBE,
            params: json!([client_id, Value::Null, host, port.to_string()]),
        }
    }

    /// `mining.authorize` for `wallet.worker`
    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Request {
            id,
            method: METHOD_AUTHORIZE,
            params: json!([username, password]),
        }
    }

    /// `mining.submit` in the pool's expected field order
    pub fn submit(
        id: u64,
        extranonce1: &str,
        extranonce2: &str,
        time: &str,
        nonce: &str,
        job_id: &str,
    ) -> Self {
        Request {
            id,
            method: METHOD_SUBMIT,
            params: json!([extranonce1, extranonce2, time, nonce, job_id]),
        }
    }

    /// Serializes to a single line (without the terminator)
    pub fn to_line(&self) -> Result<String, MinerError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reply to one of our requests
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub result: Value,
    pub error: Option<Value>,
}

impl Response {
    /// True when the pool answered `true` without an error
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.result.as_bool().unwrap_or(false)
    }

    /// Human-readable form of the error member, if any
    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            // [code, message, traceback]
            Value::Array(parts) => parts
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `mining.notify`
    Notify(Job),
    /// `mining.set_difficulty`
    SetDifficulty(f64),
    /// `client.reconnect`
    Reconnect,
    /// Reply to an earlier request
    Response(Response),
    /// Notification we do not act on
    Unknown(String),
}

/// Session parameters granted by the subscribe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Decodes one line received from the pool
pub fn parse_inbound(line: &str) -> Result<Inbound, MinerError> {
    let raw: RawMessage = serde_json::from_str(line)?;

    if let Some(method) = raw.method {
        let params = match raw.params {
            Some(Value::Array(params)) => params,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(MinerError::ProtocolError(format!(
                    "{} params must be an array",
                    method
                )));
            }
        };
        return match method.as_str() {
            METHOD_NOTIFY => parse_notify(&params).map(Inbound::Notify),
            METHOD_SET_DIFFICULTY => params
                .first()
                .and_then(Value::as_f64)
                .map(Inbound::SetDifficulty)
                .ok_or_else(|| MinerError::ProtocolError("set_difficulty without a number".into())),
            METHOD_RECONNECT => Ok(Inbound::Reconnect),
            _ => Ok(Inbound::Unknown(method)),
        };
    }

    let id = raw
        .id
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| MinerError::ProtocolError("response without a numeric id".into()))?;

    Ok(Inbound::Response(Response {
        id,
        result: raw.result.unwrap_or(Value::Null),
        error: raw.error.filter(|e| !e.is_null()),
    }))
}

fn parse_notify(params: &[Value]) -> Result<Job, MinerError> {
    let text = |idx: usize, name: &str| -> Result<String, MinerError> {
        params
            .get(idx)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MinerError::ProtocolError(format!("notify missing {}", name)))
    };

    let merkle_branch = params
        .get(4)
        .and_then(Value::as_array)
        .ok_or_else(|| MinerError::ProtocolError("notify missing merkle branch".into()))?
        .iter()
        .map(|b| {
            b.as_str()
                .map(str::to_string)
                .ok_or_else(|| MinerError::ProtocolError("merkle branch entry is not a string".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Job {
        job_id: text(0, "job id")?,
        prev_hash: text(1, "prev hash")?,
        coinbase1: text(2, "coinbase1")?,
        coinbase2: text(3, "coinbase2")?,
        merkle_branch,
        version: text(5, "version")?,
        bits: text(6, "bits")?,
        time: text(7, "time")?,
        clean_jobs: params.get(8).and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Extracts extranonce1 and the extranonce2 width from a subscribe result
///
/// Expected shape: `[subscriptions, extranonce1_hex, extranonce2_size]`.
pub fn parse_subscription(result: &Value) -> Result<Subscription, MinerError> {
    let parts = result
        .as_array()
        .ok_or_else(|| MinerError::ProtocolError("subscribe result is not an array".into()))?;

    let extranonce1 = parts
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| MinerError::ProtocolError("subscribe result missing extranonce1".into()))?;
    let extranonce2_size = parts
        .get(2)
        .and_then(Value::as_u64)
        .ok_or_else(|| MinerError::ProtocolError("subscribe result missing extranonce2 size".into()))?;

    if extranonce2_size == 0 || extranonce2_size > 16 {
        return Err(MinerError::ProtocolError(format!(
            "unusable extranonce2 size {}",
            extranonce2_size
        )));
    }

    Ok(Subscription {
        extranonce1: hex::decode(extranonce1)?,
        extranonce2_size: extranonce2_size as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_have_no_jsonrpc_member() {
        let line = Request::authorize(2, "wallet.rig", "x").to_line().unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], 2);
        assert_eq!(v["method"], "mining.authorize");
        assert_eq!(v["params"], json!(["wallet.rig", "x"]));
        assert!(v.get("jsonrpc").is_none());
    }

    #[test]
    fn subscribe_and_submit_params() {
        let sub = Request::subscribe(1, "mobile-miner/0.1.0", "pool.example", 3333);
        assert_eq!(
            sub.params,
            json!(["mobile-miner/0.1.0", null, "pool.example", "3333"])
        );

        let submit = Request::submit(7, "f000000f", "00000001", "5f5e1000", "0000abcd", "job9");
        assert_eq!(
            submit.params,
            json!(["f000000f", "00000001", "5f5e1000", "0000abcd", "job9"])
        );
    }

    #[test]
    fn parses_notify() {
        let line = r#"{"id":null,"method":"mining.notify","params":["bf","aa","01","02",["cc"],"20000000","1d00ffff","5f5e1000",true]}"#;
        match parse_inbound(line).unwrap() {
            Inbound::Notify(job) => {
                assert_eq!(job.job_id, "bf");
                assert_eq!(job.merkle_branch, vec!["cc".to_string()]);
                assert_eq!(job.bits, "1d00ffff");
                assert!(job.clean_jobs);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_difficulty_reconnect_and_unknown() {
        assert_eq!(
            parse_inbound(r#"{"id":null,"method":"mining.set_difficulty","params":[16]}"#).unwrap(),
            Inbound::SetDifficulty(16.0)
        );
        assert_eq!(
            parse_inbound(r#"{"method":"client.reconnect","params":[]}"#).unwrap(),
            Inbound::Reconnect
        );
        assert_eq!(
            parse_inbound(r#"{"method":"client.show_message","params":["hi"]}"#).unwrap(),
            Inbound::Unknown("client.show_message".into())
        );
    }

    #[test]
    fn parses_responses() {
        let ok = parse_inbound(r#"{"id":4,"result":true,"error":null}"#).unwrap();
        match ok {
            Inbound::Response(r) => assert!(r.is_success()),
            other => panic!("unexpected {:?}", other),
        }

        let rejected =
            parse_inbound(r#"{"id":5,"result":null,"error":[23,"Low difficulty share",null]}"#).unwrap();
        match rejected {
            Inbound::Response(r) => {
                assert!(!r.is_success());
                assert_eq!(r.error_text().as_deref(), Some("Low difficulty share"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"result":true}"#).is_err());
        assert!(parse_inbound(r#"{"method":"mining.notify","params":["only-id"]}"#).is_err());
        assert!(parse_inbound(r#"{"method":"mining.set_difficulty","params":["x"]}"#).is_err());
    }

    #[test]
    fn subscription_result() {
        let result = json!([[["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"]], "08000002", 4]);
        let sub = parse_subscription(&result).unwrap();
        assert_eq!(sub.extranonce1, vec![0x08, 0, 0, 0x02]);
        assert_eq!(sub.extranonce2_size, 4);

        assert!(parse_subscription(&json!([null, "zz", 4])).is_err());
        assert!(parse_subscription(&json!([null, "08", 0])).is_err());
        assert!(parse_subscription(&json!(true)).is_err());
    }
}
