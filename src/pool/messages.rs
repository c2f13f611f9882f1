//! Wire messages: one JSON object per line.

use serde_json::{Value, json};

pub const ID_SUBSCRIBE: i64 = 1;
pub const ID_EXTRANONCE_SUBSCRIBE: i64 = 2;
pub const ID_AUTHORIZE: i64 = 3;
pub const ID_SUBMIT: i64 = 4;
pub const ID_GET_WORK: i64 = 5;
pub const ID_HASHRATE: i64 = 6;

pub fn subscribe() -> Value {
    json!({"id": ID_SUBSCRIBE, "method": "mining.subscribe", "params": []})
}

pub fn subscribe_extended(client_version: &str) -> Value {
    json!({
        "id": ID_SUBSCRIBE,
        "method": "mining.subscribe",
        "params": [client_version, "EthereumStratum/1.0.0"],
    })
}

pub fn submit_login(worker: &str, user: &str, email: Option<&str>) -> Value {
    let params = match email {
        Some(email) => json!([user, email]),
        None => json!([user]),
    };
    json!({"id": ID_SUBSCRIBE, "worker": worker, "method": "eth_submitLogin", "params": params})
}

pub fn extranonce_subscribe() -> Value {
    json!({"id": ID_EXTRANONCE_SUBSCRIBE, "method": "mining.extranonce.subscribe", "params": []})
}

pub fn authorize(user: &str, pass: &str) -> Value {
    json!({"id": ID_AUTHORIZE, "method": "mining.authorize", "params": [user, pass]})
}

pub fn get_work() -> Value {
    json!({"id": ID_GET_WORK, "method": "eth_getWork", "params": []})
}

pub fn submit(user: &str, job: &str, nonce: &str, header: &str, mix: &str) -> Value {
    json!({"id": ID_SUBMIT, "method": "mining.submit", "params": [user, job, nonce, header, mix]})
}

pub fn submit_work(worker: &str, nonce: &str, header: &str, mix: &str) -> Value {
    json!({"id": ID_SUBMIT, "worker": worker, "method": "eth_submitWork", "params": [nonce, header, mix]})
}

pub fn submit_compact(user: &str, job: &str, nonce: &str) -> Value {
    json!({"id": ID_SUBMIT, "method": "mining.submit", "params": [user, job, nonce]})
}

pub fn submit_hashrate(rate: &str, submitter: &str) -> Value {
    json!({
        "id": ID_HASHRATE,
        "jsonrpc": "2.0",
        "method": "eth_submitHashrate",
        "params": [rate, submitter],
    })
}

pub fn version_reply(id: i64, version: &str) -> Value {
    json!({"error": null, "id": id, "result": version})
}

/// Serialize as one newline-terminated line.
pub fn line(message: &Value) -> String {
    let mut s = message.to_string();
    s.push('\n');
    s
}

/// A decoded inbound object.
#[derive(Debug, Clone)]
pub struct Inbound(Value);

impl Inbound {
    /// Non-integer or missing ids read as 0, which routes by method.
    pub fn id(&self) -> i64 {
        self.0.get("id").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn method(&self) -> &str {
        self.0.get("method").and_then(Value::as_str).unwrap_or("")
    }

    pub fn result(&self) -> &Value {
        self.0.get("result").unwrap_or(&Value::Null)
    }

    pub fn params(&self) -> &Value {
        self.0.get("params").unwrap_or(&Value::Null)
    }

    /// `result` read as a boolean; anything else is false.
    pub fn result_flag(&self) -> bool {
        self.result().as_bool().unwrap_or(false)
    }

    /// Pools report errors as `[code, "message", ...]`.
    pub fn error_message(&self) -> Option<String> {
        match self.0.get("error") {
            Some(Value::Array(items)) => Some(
                items
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Frame {
    Message(Inbound),
    /// Not shaped like an object.
    Incomplete,
    Invalid(String),
}

pub fn parse_line(raw: &str) -> Frame {
    let line = raw.trim();
    if !(line.starts_with('{') && line.ends_with('}')) {
        return Frame::Incomplete;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(v) => Frame::Message(Inbound(v)),
        Err(e) => Frame::Invalid(e.to_string()),
    }
}

/// String element `i` of an array, empty when absent.
pub fn str_at(params: &Value, i: usize) -> &str {
    params.get(i).and_then(Value::as_str).unwrap_or("")
}

/// Block heights arrive as numbers or hex strings.
pub fn height_at(params: &Value, i: usize) -> u64 {
    match params.get(i) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).unwrap_or(0),
            None => s.parse().unwrap_or(0),
        },
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_require_object_shape() {
        assert!(matches!(parse_line("{\"id\":4,\"result\":true}\r\n"), Frame::Message(m) if m.id() == 4 && m.result_flag()));
        assert!(matches!(parse_line("partial {\"id\""), Frame::Incomplete));
        assert!(matches!(parse_line(""), Frame::Incomplete));
        assert!(matches!(parse_line("{not json}"), Frame::Invalid(_)));
    }

    #[test]
    fn inbound_accessors_are_lenient() {
        let Frame::Message(m) = parse_line(r#"{"id":null,"method":"mining.notify","params":["a",2],"error":[21,"Job not found"]}"#) else {
            panic!("expected message");
        };
        assert_eq!(m.id(), 0);
        assert_eq!(m.method(), "mining.notify");
        assert_eq!(str_at(m.params(), 0), "a");
        assert_eq!(str_at(m.params(), 1), "");
        assert_eq!(height_at(m.params(), 1), 2);
        assert_eq!(m.error_message().as_deref(), Some("Job not found"));
        assert!(!m.result_flag());
    }

    #[test]
    fn heights_parse_from_hex_and_decimal_strings() {
        let v = json!(["0x10", "42", "zz"]);
        assert_eq!(height_at(&v, 0), 16);
        assert_eq!(height_at(&v, 1), 42);
        assert_eq!(height_at(&v, 2), 0);
        assert_eq!(height_at(&v, 9), 0);
    }

    #[test]
    fn login_carries_optional_email() {
        let v = submit_login("rig", "0xabc", Some("me@example.org"));
        assert_eq!(v["worker"], "rig");
        assert_eq!(v["params"], json!(["0xabc", "me@example.org"]));
        assert_eq!(submit_login("", "0xabc", None)["params"], json!(["0xabc"]));
        assert!(line(&get_work()).ends_with("}\n"));
    }
}
