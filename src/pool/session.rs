//! The pool line protocol as a state machine with no I/O.
//!
//! Every input returns the actions the driver must perform, in order. The
//! driver owns the socket and the timers; the session owns job state,
//! request correlation and staleness.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::epoch::SeedResolver;
use crate::error_handling::SessionError;
use crate::pool::messages::{self, Frame, Inbound};
use crate::pool::{Dialect, PoolEndpoint, PoolEvent};
use crate::types::{H256, MIN_DIFFICULTY, Solution, WorkPackage, difficulty_to_boundary};

/// How long a submission may wait for its reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Action {
    /// Write one newline-terminated line.
    Send(String),
    Emit(PoolEvent),
    ResetWorkTimer,
    StartResponseTimer,
    CancelResponseTimer,
    Disconnect(SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub work_timeout: Duration,
    pub submit_hashrate: bool,
    /// Sent with the proxy login when set.
    pub email: Option<String>,
    pub client_version: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            work_timeout: Duration::from_secs(180),
            submit_hashrate: false,
            email: None,
            client_version: super::CLIENT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Extranonce {
    value: u64,
    hex_len: usize,
}

pub struct Session {
    endpoint: PoolEndpoint,
    settings: SessionSettings,
    seeds: Arc<SeedResolver>,
    connected: bool,
    authorized: bool,
    worker: String,
    current: WorkPackage,
    next_difficulty: f64,
    extranonce: Option<Extranonce>,
    response_pending: bool,
    stale: bool,
    submitter_id: String,
}

impl Session {
    pub fn new(endpoint: PoolEndpoint, settings: SessionSettings, seeds: Arc<SeedResolver>) -> Self {
        Self {
            endpoint,
            settings,
            seeds,
            connected: false,
            authorized: false,
            worker: String::new(),
            current: WorkPackage::default(),
            next_difficulty: 1.0,
            extranonce: None,
            response_pending: false,
            stale: false,
            submitter_id: format!("0x{}", hex::encode(rand::random::<[u8; 32]>())),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.endpoint.dialect
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn current(&self) -> &WorkPackage {
        &self.current
    }

    pub fn work_timeout(&self) -> Duration {
        self.settings.work_timeout
    }

    /// The socket (and TLS, if any) is up: start the work timer and log in.
    pub fn on_connected(&mut self) -> Vec<Action> {
        self.connected = true;
        self.authorized = false;
        self.current = WorkPackage::default();
        self.next_difficulty = 1.0;
        self.extranonce = None;
        self.response_pending = false;
        self.stale = false;

        let login = match self.endpoint.dialect {
            Dialect::Stratum => {
                self.authorized = true;
                messages::subscribe()
            }
            Dialect::EthProxy => {
                let (user, worker) = match self.endpoint.user.split_once('.') {
                    Some((u, w)) => (u.to_string(), w.to_string()),
                    None => (self.endpoint.user.clone(), String::new()),
                };
                self.worker = worker;
                messages::submit_login(&self.worker, &user, self.settings.email.as_deref())
            }
            Dialect::EthereumStratum => {
                self.authorized = true;
                messages::subscribe_extended(&self.settings.client_version)
            }
        };
        vec![Action::ResetWorkTimer, Action::Send(messages::line(&login))]
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.authorized = false;
        self.response_pending = false;
    }

    pub fn on_line(&mut self, raw: &str) -> Vec<Action> {
        match messages::parse_line(raw) {
            Frame::Message(msg) => self.handle(&msg),
            Frame::Incomplete => {
                if self.endpoint.dialect != Dialect::EthProxy {
                    warn!("discarding incomplete response");
                }
                Vec::new()
            }
            Frame::Invalid(e) => {
                warn!(error = %e, "parse response failed");
                Vec::new()
            }
        }
    }

    fn handle(&mut self, msg: &Inbound) -> Vec<Action> {
        if let Some(error) = msg.error_message() {
            info!(%error, "pool reported an error");
        }

        match msg.id() {
            messages::ID_SUBSCRIBE => self.on_subscribed(msg),
            messages::ID_EXTRANONCE_SUBSCRIBE => Vec::new(),
            messages::ID_AUTHORIZE => {
                self.authorized = msg.result_flag();
                if !self.authorized {
                    info!(user = %self.endpoint.user, "worker not authorized");
                    return vec![Action::Disconnect(SessionError::Unauthorized(self.endpoint.user.clone()))];
                }
                info!(user = %self.endpoint.user, "authorized worker");
                Vec::new()
            }
            messages::ID_SUBMIT => {
                self.response_pending = false;
                let stale = self.stale;
                let event = if msg.result_flag() {
                    PoolEvent::SolutionAccepted { stale }
                } else {
                    PoolEvent::SolutionRejected { stale }
                };
                vec![Action::CancelResponseTimer, Action::Emit(event)]
            }
            id => self.on_unsolicited(id, msg),
        }
    }

    fn on_subscribed(&mut self, msg: &Inbound) -> Vec<Action> {
        let mut out = Vec::new();
        if self.endpoint.dialect == Dialect::EthereumStratum {
            self.next_difficulty = 1.0;
            if let Value::Array(result) = msg.result() {
                let enonce = result.get(1).and_then(Value::as_str).unwrap_or("");
                self.set_extranonce(enonce);
            }
            out.push(Action::Send(messages::line(&messages::extranonce_subscribe())));
        }

        if self.endpoint.dialect == Dialect::EthProxy {
            self.authorized = true;
            // Not required, but gets the first job without waiting for a push.
            out.push(Action::Send(messages::line(&messages::get_work())));
        } else {
            info!("subscribed to stratum server");
            out.push(Action::Send(messages::line(&messages::authorize(
                &self.endpoint.user,
                &self.endpoint.pass,
            ))));
        }
        out
    }

    fn on_unsolicited(&mut self, id: i64, msg: &Inbound) -> Vec<Action> {
        // Proxy pools push work as a bare result.
        let method = match self.endpoint.dialect {
            Dialect::EthProxy => "mining.notify",
            _ => msg.method(),
        };
        let extended = self.endpoint.dialect == Dialect::EthereumStratum;

        match method {
            "mining.notify" => self.on_notify(msg),
            "mining.set_difficulty" if extended => {
                let d = msg.params().get(0).and_then(Value::as_f64).unwrap_or(1.0);
                self.next_difficulty = if d <= MIN_DIFFICULTY { MIN_DIFFICULTY } else { d };
                info!(difficulty = self.next_difficulty, "difficulty set");
                Vec::new()
            }
            "mining.set_extranonce" if extended => {
                let enonce = messages::str_at(msg.params(), 0).to_string();
                self.set_extranonce(&enonce);
                Vec::new()
            }
            "client.get_version" => {
                let reply = messages::version_reply(id, &self.settings.client_version);
                vec![Action::Send(messages::line(&reply))]
            }
            other => {
                debug!(method = other, id, "ignoring unsolicited message");
                Vec::new()
            }
        }
    }

    fn on_notify(&mut self, msg: &Inbound) -> Vec<Action> {
        let (params, mut index) = match self.endpoint.dialect {
            Dialect::EthProxy => (msg.result(), 0),
            _ => (msg.params(), 1),
        };
        if !params.is_array() {
            return Vec::new();
        }

        let job = messages::str_at(params, 0).to_string();
        if self.response_pending {
            self.stale = true;
        }

        if self.endpoint.dialect == Dialect::EthereumStratum {
            let seed = messages::str_at(params, 1);
            let header = messages::str_at(params, 2);
            let height = messages::height_at(params, 3);
            if header.is_empty() || seed.is_empty() {
                return Vec::new();
            }
            let Some((header, seed, epoch)) = self.decode_job(header, seed) else {
                return Vec::new();
            };

            let mut padded = job.clone();
            if padded.len() < 64 {
                padded.extend(std::iter::repeat_n('0', 64 - padded.len()));
            }
            let work = WorkPackage {
                header,
                seed,
                epoch,
                boundary: difficulty_to_boundary(self.next_difficulty),
                height,
                job: padded,
                job_len: job.len(),
                start_nonce: self.extranonce.map_or(0, |e| e.value),
                ex_size_bits: self.extranonce.map(|e| e.hex_len as u32 * 4),
                generation: 0,
            };
            return self.publish(work);
        }

        let header = messages::str_at(params, index);
        index += 1;
        let seed = messages::str_at(params, index);
        index += 1;
        let target = messages::str_at(params, index);
        index += 1;
        let height = messages::height_at(params, index);
        if header.is_empty() || seed.is_empty() || target.is_empty() {
            return Vec::new();
        }

        let Some((header, seed, epoch)) = self.decode_job(header, seed) else {
            return Vec::new();
        };
        if header == self.current.header {
            return Vec::new();
        }
        // Short targets are left-padded with zeros.
        let boundary = match H256::from_hex(target) {
            Ok(b) => b,
            Err(e) => {
                warn!(target, error = %e, "unparseable share target");
                return Vec::new();
            }
        };

        let work = WorkPackage {
            header,
            seed,
            epoch,
            boundary,
            height,
            job_len: job.len(),
            job,
            ..Default::default()
        };
        self.publish(work)
    }

    fn decode_job(&self, header: &str, seed: &str) -> Option<(H256, H256, u32)> {
        let header = match H256::from_hex(header) {
            Ok(h) => h,
            Err(e) => {
                warn!(header, error = %e, "unparseable header hash");
                return None;
            }
        };
        let seed = match H256::from_hex(seed) {
            Ok(s) => s,
            Err(e) => {
                warn!(seed, error = %e, "unparseable seed hash");
                return None;
            }
        };
        match self.seeds.epoch_of(&seed) {
            Some(epoch) => Some((header, seed, epoch)),
            None => {
                warn!(%seed, "seed hash matches no known epoch");
                None
            }
        }
    }

    fn publish(&mut self, work: WorkPackage) -> Vec<Action> {
        debug!(header = %work.header, epoch = work.epoch, height = work.height, "new job");
        self.current = work.clone();
        vec![Action::ResetWorkTimer, Action::Emit(PoolEvent::WorkReceived(work))]
    }

    fn set_extranonce(&mut self, enonce: &str) {
        if enonce.is_empty() {
            self.extranonce = None;
            return;
        }
        if enonce.len() > 16 {
            warn!(enonce, "extranonce longer than a nonce, ignored");
            return;
        }
        let padded = format!("{enonce:0<16}");
        match u64::from_str_radix(&padded, 16) {
            Ok(value) => {
                info!(enonce, "extranonce set");
                self.extranonce = Some(Extranonce { value, hex_len: enonce.len() });
            }
            Err(e) => warn!(enonce, error = %e, "invalid extranonce"),
        }
    }

    pub fn submit_solution(&mut self, solution: &Solution) -> Vec<Action> {
        if !self.authorized {
            warn!(nonce = solution.nonce, "not authorized, solution dropped");
            return Vec::new();
        }

        let nonce = format!("{:016x}", solution.nonce);
        let work = &solution.work;
        let message = match self.endpoint.dialect {
            Dialect::Stratum => messages::submit(
                &self.endpoint.user,
                &work.job,
                &format!("0x{nonce}"),
                &work.header.to_string(),
                &solution.mix_hash.to_string(),
            ),
            Dialect::EthProxy => messages::submit_work(
                &self.worker,
                &format!("0x{nonce}"),
                &work.header.to_string(),
                &solution.mix_hash.to_string(),
            ),
            Dialect::EthereumStratum => {
                let job = &work.job[..work.job_len.min(work.job.len())];
                let skip = self.extranonce.map_or(0, |e| e.hex_len);
                messages::submit_compact(&self.endpoint.user, job, &nonce[skip..])
            }
        };

        self.stale = solution.stale;
        self.response_pending = true;
        vec![
            Action::CancelResponseTimer,
            Action::Send(messages::line(&message)),
            Action::StartResponseTimer,
        ]
    }

    /// The hashrate report line, if reports are enabled and the link is up.
    pub fn hashrate_line(&self, rate: &str) -> Option<String> {
        if !self.settings.submit_hashrate || !self.connected {
            return None;
        }
        Some(messages::line(&messages::submit_hashrate(rate, &self.submitter_id)))
    }

    /// No reply to the outstanding submission: the session is considered dead.
    pub fn on_response_timeout(&mut self) -> Vec<Action> {
        self.response_pending = false;
        warn!(timeout = ?RESPONSE_TIMEOUT, "no response received");
        vec![Action::Disconnect(SessionError::ResponseTimeout(RESPONSE_TIMEOUT))]
    }

    pub fn on_work_timeout(&mut self) -> Vec<Action> {
        warn!(timeout = ?self.settings.work_timeout, "no new work received");
        vec![Action::Disconnect(SessionError::WorkTimeout(self.settings.work_timeout))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::seed_hash;
    use serde_json::json;

    fn session(url: &str) -> Session {
        let settings = SessionSettings { submit_hashrate: true, ..Default::default() };
        Session::new(PoolEndpoint::parse(url).unwrap(), settings, Arc::new(SeedResolver::new()))
    }

    fn sent(actions: &[Action]) -> Vec<Value> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(line) => Some(serde_json::from_str(line).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[Action]) -> Vec<PoolEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn work_of(actions: &[Action]) -> WorkPackage {
        match &events(actions)[..] {
            [PoolEvent::WorkReceived(w)] => w.clone(),
            other => panic!("expected one work event, got {other:?}"),
        }
    }

    fn hash(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn notify(header: u8) -> String {
        json!({
            "id": null,
            "method": "mining.notify",
            "params": ["job1", hash(header), seed_hash(1).to_string(), "0x0000ffff", "0x7530"],
        })
        .to_string()
    }

    fn solution(work: &WorkPackage, nonce: u64, stale: bool) -> Solution {
        Solution {
            nonce,
            mix_hash: H256([2; 32]),
            work: Arc::new(work.clone()),
            stale,
            generation: 1,
        }
    }

    /// A classic session past subscribe and authorize.
    fn active_classic() -> Session {
        let mut s = session("stratum+tcp://0xabc.rig:x@pool:4444");
        s.on_connected();
        s.on_line(r#"{"id":1,"result":true,"error":null}"#);
        s.on_line(r#"{"id":3,"result":true,"error":null}"#);
        s
    }

    #[test]
    fn classic_handshake_subscribes_then_authorizes() {
        let mut s = session("stratum+tcp://0xabc.rig:x@pool:4444");
        let a = s.on_connected();
        assert!(matches!(a[0], Action::ResetWorkTimer));
        assert_eq!(sent(&a), vec![json!({"id": 1, "method": "mining.subscribe", "params": []})]);

        let a = s.on_line(r#"{"id":1,"result":[["mining.notify","x"],"00"],"error":null}"#);
        assert_eq!(sent(&a), vec![json!({"id": 3, "method": "mining.authorize", "params": ["0xabc.rig", "x"]})]);

        assert!(s.on_line(r#"{"id":3,"result":true}"#).is_empty());
        assert!(s.is_authorized());
    }

    #[test]
    fn refused_authorization_disconnects() {
        let mut s = session("stratum+tcp://0xabc.rig:x@pool:4444");
        s.on_connected();
        let a = s.on_line(r#"{"id":3,"result":false,"error":[24,"bad wallet"]}"#);
        assert!(matches!(&a[..], [Action::Disconnect(SessionError::Unauthorized(u))] if u == "0xabc.rig"));
        assert!(!s.is_authorized());
    }

    #[test]
    fn classic_notify_publishes_and_ignores_repeated_header() {
        let mut s = active_classic();
        let a = s.on_line(&notify(0x11));
        assert!(matches!(a[0], Action::ResetWorkTimer));
        let w = &work_of(&a);
        assert_eq!(w.epoch, 1);
        assert_eq!(w.height, 30000);
        assert_eq!(w.job, "job1");
        // Target padded on the left.
        assert_eq!(w.boundary.upper_u64(), 0);
        assert_eq!(w.boundary.0[31], 0xff);

        assert!(s.on_line(&notify(0x11)).is_empty());
        assert_eq!(events(&s.on_line(&notify(0x22))).len(), 1);
    }

    #[test]
    fn extended_notify_always_replaces() {
        let mut s = session("stratum2+tcp://0xabc.rig:x@pool:4444");
        s.on_connected();
        let line = json!({
            "id": null,
            "method": "mining.notify",
            "params": ["1a2b", seed_hash(0).to_string(), hash(0x33), 12],
        })
        .to_string();
        assert_eq!(events(&s.on_line(&line)).len(), 1);
        assert_eq!(events(&s.on_line(&line)).len(), 1);
    }

    #[test]
    fn extended_dialect_uses_extranonce_and_difficulty() {
        let mut s = session("stratum2+tcp://0xabc.rig:x@pool:4444");
        let a = s.on_connected();
        assert_eq!(sent(&a)[0]["params"][1], "EthereumStratum/1.0.0");

        let a = s.on_line(r#"{"id":1,"result":[["mining.notify","ae6812eb4cd7735a302a8a9dd95cf71f","EthereumStratum/1.0.0"],"af"],"error":null}"#);
        let methods: Vec<_> = sent(&a).iter().map(|v| v["method"].clone()).collect();
        assert_eq!(methods, vec![json!("mining.extranonce.subscribe"), json!("mining.authorize")]);

        s.on_line(r#"{"id":null,"method":"mining.set_difficulty","params":[0.00001]}"#);
        let line = json!({
            "id": null,
            "method": "mining.notify",
            "params": ["1a2b", seed_hash(0).to_string(), hash(0x33), 12],
        })
        .to_string();
        let w = &work_of(&s.on_line(&line));
        assert_eq!(w.boundary, H256::MAX);
        assert_eq!(w.start_nonce, 0xaf00_0000_0000_0000);
        assert_eq!(w.ex_size_bits, Some(8));
        assert_eq!(w.job.len(), 64);
        assert_eq!(w.job_len, 4);

        let a = s.submit_solution(&solution(w, 0xaf00_0000_0000_abcd, false));
        assert_eq!(
            sent(&a),
            vec![json!({"id": 4, "method": "mining.submit", "params": ["0xabc.rig", "1a2b", "0000000000abcd"]})]
        );

        s.on_line(r#"{"id":null,"method":"mining.set_extranonce","params":["0102"]}"#);
        let line = line.replace("1a2b", "1a2c");
        let w = &work_of(&s.on_line(&line));
        assert_eq!(w.start_nonce, 0x0102_0000_0000_0000);
        assert_eq!(w.ex_size_bits, Some(16));
    }

    #[test]
    fn proxy_logs_in_with_worker_and_takes_result_work() {
        let mut s = session("stratum1+tcp://0xabc.rig7@pool:8008");
        let a = s.on_connected();
        assert_eq!(
            sent(&a),
            vec![json!({"id": 1, "worker": "rig7", "method": "eth_submitLogin", "params": ["0xabc"]})]
        );
        assert!(!s.is_authorized());

        let a = s.on_line(r#"{"id":1,"jsonrpc":"2.0","result":true}"#);
        assert_eq!(sent(&a), vec![json!({"id": 5, "method": "eth_getWork", "params": []})]);
        assert!(s.is_authorized());

        let work = json!({"id": 5, "result": [hash(0x44), seed_hash(0).to_string(), hash(0x01), "0x10"]}).to_string();
        let w = &work_of(&s.on_line(&work));
        assert_eq!(w.job, hash(0x44));
        assert_eq!(w.height, 16);

        let a = s.submit_solution(&solution(w, 7, false));
        let v = &sent(&a)[0];
        assert_eq!(v["method"], "eth_submitWork");
        assert_eq!(v["worker"], "rig7");
        assert_eq!(v["params"][0], "0x0000000000000007");
    }

    #[test]
    fn verdicts_carry_staleness_at_submission() {
        let mut s = active_classic();
        let w = &work_of(&s.on_line(&notify(0x11)));

        let a = s.submit_solution(&solution(w, 1, false));
        assert!(matches!(&a[..], [Action::CancelResponseTimer, Action::Send(_), Action::StartResponseTimer]));
        let a = s.on_line(r#"{"id":4,"result":true}"#);
        assert!(matches!(a[0], Action::CancelResponseTimer));
        assert_eq!(events(&a), vec![PoolEvent::SolutionAccepted { stale: false }]);

        s.submit_solution(&solution(w, 2, false));
        let a = s.on_line(r#"{"id":4,"result":false,"error":[23,"low difficulty"]}"#);
        assert_eq!(events(&a), vec![PoolEvent::SolutionRejected { stale: false }]);

        s.submit_solution(&solution(w, 3, true));
        let a = s.on_line(r#"{"id":4,"result":true}"#);
        assert_eq!(events(&a), vec![PoolEvent::SolutionAccepted { stale: true }]);
    }

    #[test]
    fn job_during_outstanding_submit_marks_it_stale() {
        let mut s = active_classic();
        let w = &work_of(&s.on_line(&notify(0x11)));
        s.submit_solution(&solution(w, 1, false));
        s.on_line(&notify(0x22));
        let a = s.on_line(r#"{"id":4,"result":true}"#);
        assert_eq!(events(&a), vec![PoolEvent::SolutionAccepted { stale: true }]);
    }

    #[test]
    fn response_timeout_disconnects_without_verdict() {
        let mut s = active_classic();
        let w = &work_of(&s.on_line(&notify(0x11)));
        s.submit_solution(&solution(w, 1, false));
        let a = s.on_response_timeout();
        assert!(events(&a).is_empty());
        assert!(matches!(&a[..], [Action::Disconnect(SessionError::ResponseTimeout(d))] if *d == RESPONSE_TIMEOUT));

        let a = s.on_work_timeout();
        assert!(matches!(&a[..], [Action::Disconnect(SessionError::WorkTimeout(_))]));
    }

    #[test]
    fn answers_version_requests() {
        let mut s = active_classic();
        let a = s.on_line(r#"{"id":42,"method":"client.get_version","params":[]}"#);
        assert_eq!(sent(&a), vec![json!({"error": null, "id": 42, "result": crate::pool::CLIENT_VERSION})]);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let mut s = active_classic();
        assert!(s.on_line("garbage").is_empty());
        assert!(s.on_line("{\"id\": 4, \"result\"").is_empty());
        assert!(s.on_line("{oops}").is_empty());
        // Unknown seed hashes never reach the farm.
        let line = notify(0x11).replace(&seed_hash(1).to_hex(), &"ab".repeat(32));
        assert!(events(&s.on_line(&line)).is_empty());
    }

    #[test]
    fn unauthorized_sessions_drop_solutions() {
        let mut s = session("stratum1+tcp://0xabc@pool:8008");
        s.on_connected();
        assert!(s.submit_solution(&solution(&WorkPackage::default(), 1, false)).is_empty());
    }

    #[test]
    fn hashrate_reports_need_a_link() {
        let mut s = session("stratum+tcp://u@pool:1");
        assert!(s.hashrate_line("0x10").is_none());
        s.on_connected();
        let v: Value = serde_json::from_str(&s.hashrate_line("0x10").unwrap()).unwrap();
        assert_eq!(v["id"], 6);
        assert_eq!(v["params"][0], "0x10");
        assert_eq!(v["params"][1].as_str().unwrap().len(), 66);
        s.on_disconnected();
        assert!(s.hashrate_line("0x10").is_none());
    }
}
