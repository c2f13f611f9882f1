//! Admin API: line-delimited JSON-RPC plus a few plain HTTP endpoints on
//! the same port.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::farm::Farm;
use crate::health::HealthChecker;
use crate::pool::PoolHandle;
use crate::prometheus_metrics::PrometheusMetrics;

#[derive(Error, Debug, PartialEq)]
pub enum ApiError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("{0} is not allowed in read-only mode")]
    ReadOnly(String),
}

impl ApiError {
    pub fn code(&self) -> i64 {
        match self {
            ApiError::Parse(_) => -32700,
            ApiError::InvalidRequest(_) => -32600,
            ApiError::MethodNotFound(_) => -32601,
            ApiError::ReadOnly(_) => -32000,
        }
    }
}

/// Everything a handler may touch.
pub struct ApiContext {
    pub farm: Arc<Farm>,
    pub pool: Option<PoolHandle>,
    pub health: Arc<HealthChecker>,
    pub prometheus: Arc<PrometheusMetrics>,
    pub readonly: bool,
}

type Handler = fn(&ApiContext, &Value) -> Result<Value, ApiError>;

pub struct MethodEntry {
    /// Refused when the API is read-only.
    pub mutating: bool,
    pub handler: Handler,
}

pub fn method_table() -> HashMap<&'static str, MethodEntry> {
    let mut methods: HashMap<&'static str, MethodEntry> = HashMap::new();
    methods.insert("miner_ping", MethodEntry { mutating: false, handler: ping });
    methods.insert("miner_getstat1", MethodEntry { mutating: false, handler: get_stat1 });
    methods.insert("miner_getstathr", MethodEntry { mutating: false, handler: get_stat_hr });
    methods.insert("miner_restart", MethodEntry { mutating: true, handler: restart });
    methods.insert("miner_reboot", MethodEntry { mutating: true, handler: reboot });
    methods
}

fn ping(_: &ApiContext, _: &Value) -> Result<Value, ApiError> {
    Ok(json!("pong"))
}

/// Claymore-compatible summary: every element is a string.
fn get_stat1(ctx: &ApiContext, _: &Value) -> Result<Value, ApiError> {
    let m = ctx.health.metrics().get_metrics();
    let khs = |rate: f64| ((rate / 1000.0) as u64).to_string();
    let per_device: Vec<String> = m.devices.iter().map(|d| khs(d.hashrate)).collect();
    let off: Vec<&str> = m.devices.iter().map(|_| "off").collect();

    Ok(json!([
        crate::pool::CLIENT_VERSION,
        (ctx.health.uptime_seconds() / 60).to_string(),
        format!("{};{};{}", khs(m.hashrate), m.accepted, m.rejected),
        per_device.join(";"),
        "0;0;0",
        off.join(";"),
        "",
        ctx.health.pool(),
        format!("{};{};0;0", m.failed, m.reconnects.saturating_sub(1)),
    ]))
}

fn get_stat_hr(ctx: &ApiContext, _: &Value) -> Result<Value, ApiError> {
    let m = ctx.health.metrics().get_metrics();
    let rates: Vec<u64> = m.devices.iter().map(|d| d.hashrate as u64).collect();
    let accepted: Vec<u64> = m.devices.iter().map(|d| d.accepted).collect();
    let rejected: Vec<u64> = m.devices.iter().map(|d| d.rejected).collect();
    let failed: Vec<u64> = m.devices.iter().map(|d| d.failed).collect();

    Ok(json!({
        "version": crate::pool::CLIENT_VERSION,
        "runtime": (ctx.health.uptime_seconds() / 60).to_string(),
        "connected": m.connected,
        "pool": ctx.health.pool(),
        "ethhashrate": m.hashrate as u64,
        "ethhashrates": rates,
        "ethshares": accepted,
        "ethrejected": rejected,
        "ethinvalid": failed,
        "ispaused": !ctx.farm.is_mining(),
    }))
}

fn restart(ctx: &ApiContext, _: &Value) -> Result<Value, ApiError> {
    info!("restart requested over api");
    ctx.farm.restart();
    Ok(json!(true))
}

/// Restart the engines and drop the pool session.
fn reboot(ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
    restart(ctx, params)?;
    let reconnected = ctx.pool.as_ref().map(|p| p.reconnect()).unwrap_or(false);
    Ok(json!(reconnected))
}

/// Answer one request line.
pub fn dispatch(methods: &HashMap<&'static str, MethodEntry>, ctx: &ApiContext, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return error_reply(Value::Null, ApiError::Parse(e.to_string())),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return error_reply(id, ApiError::InvalidRequest("missing method".to_string()));
    };
    let Some(entry) = methods.get(method) else {
        return error_reply(id, ApiError::MethodNotFound(method.to_string()));
    };
    if entry.mutating && ctx.readonly {
        return error_reply(id, ApiError::ReadOnly(method.to_string()));
    }

    let params = request.get("params").cloned().unwrap_or(Value::Null);
    match (entry.handler)(ctx, &params) {
        Ok(result) => json!({"id": id, "jsonrpc": "2.0", "result": result}),
        Err(e) => error_reply(id, e),
    }
}

fn error_reply(id: Value, err: ApiError) -> Value {
    json!({"id": id, "jsonrpc": "2.0", "error": {"code": err.code(), "message": err.to_string()}})
}

pub struct ApiServer {
    context: Arc<ApiContext>,
    methods: Arc<HashMap<&'static str, MethodEntry>>,
    bind: String,
    port: u16,
}

impl ApiServer {
    pub fn new(context: ApiContext, bind: String, port: u16) -> Self {
        Self {
            context: Arc::new(context),
            methods: Arc::new(method_table()),
            bind,
            port,
        }
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(format!("{}:{}", self.bind, self.port)).await
    }

    pub async fn start(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, readonly = self.context.readonly, "api server listening");
        loop {
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            debug!(%peer, "api connection");
            let context = Arc::clone(&self.context);
            let methods = Arc::clone(&self.methods);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, &context, &methods).await {
                    debug!(%peer, error = %e, "api connection ended");
                }
            });
        }
    }
}

async fn serve_connection(
    socket: TcpStream,
    ctx: &ApiContext,
    methods: &HashMap<&'static str, MethodEntry>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };

    if first.starts_with("GET ") {
        // Drain the request headers before answering.
        while let Some(header) = lines.next_line().await? {
            if header.trim().is_empty() {
                break;
            }
        }
        let response = handle_http(&first, ctx);
        writer.write_all(response.as_bytes()).await?;
        return writer.shutdown().await;
    }

    let mut line = first;
    loop {
        if !line.trim().is_empty() {
            let mut reply = dispatch(methods, ctx, &line).to_string();
            reply.push('\n');
            writer.write_all(reply.as_bytes()).await?;
        }
        match lines.next_line().await? {
            Some(next) => line = next,
            None => return Ok(()),
        }
    }
}

fn handle_http(request_line: &str, ctx: &ApiContext) -> String {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/health" => {
            let health = ctx.health.get_health();
            let code = if ctx.health.is_healthy() { 200 } else { 503 };
            match serde_json::to_string(&health) {
                Ok(json) => response(code, "application/json", &json),
                Err(_) => error_response(500, "Internal Server Error"),
            }
        }
        "/status" => match serde_json::to_string(&ctx.health.get_detailed_status()) {
            Ok(json) => response(200, "application/json", &json),
            Err(_) => error_response(500, "Internal Server Error"),
        },
        "/metrics" => {
            ctx.prometheus.update_from_metrics(&ctx.health.metrics().get_metrics());
            match ctx.prometheus.export_metrics() {
                Ok(text) => response(200, "application/openmetrics-text; version=1.0.0; charset=utf-8", &text),
                Err(e) => {
                    warn!(error = %e, "metrics encoding failed");
                    error_response(500, "Internal Server Error")
                }
            }
        }
        _ => error_response(404, "Not Found"),
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn response(status: u16, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        content_type,
        body.len(),
        body
    )
}

fn error_response(status: u16, message: &str) -> String {
    let body = json!({"error": message}).to_string();
    response(status, "application/json", &body)
}
