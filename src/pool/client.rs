//! Drives one pool session over a socket.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::epoch::SeedResolver;
use crate::error_handling::SessionError;
use crate::pool::session::{Action, RESPONSE_TIMEOUT, Session, SessionSettings};
use crate::pool::transport::{self, Incoming, LineReader};
use crate::pool::{PoolCommand, PoolEndpoint, PoolEvent};

/// Hashrate reports are coalesced over this window.
pub const HASHRATE_DELAY: Duration = Duration::from_millis(100);

struct Timers {
    work: Pin<Box<Sleep>>,
    work_timeout: Duration,
    response: Pin<Box<Sleep>>,
    response_armed: bool,
    hashrate: Pin<Box<Sleep>>,
    pending_rate: Option<String>,
}

impl Timers {
    fn new(work_timeout: Duration) -> Self {
        Self {
            work: Box::pin(sleep(work_timeout)),
            work_timeout,
            response: Box::pin(sleep(RESPONSE_TIMEOUT)),
            response_armed: false,
            hashrate: Box::pin(sleep(HASHRATE_DELAY)),
            pending_rate: None,
        }
    }

    fn reset_work(&mut self) {
        self.work.as_mut().reset(Instant::now() + self.work_timeout);
    }

    fn start_response(&mut self) {
        self.response.as_mut().reset(Instant::now() + RESPONSE_TIMEOUT);
        self.response_armed = true;
    }

    /// A newer rate replaces a pending one and restarts the delay.
    fn schedule_hashrate(&mut self, rate: String) {
        self.pending_rate = Some(rate);
        self.hashrate.as_mut().reset(Instant::now() + HASHRATE_DELAY);
    }

    fn cancel_all(&mut self) {
        self.response_armed = false;
        self.pending_rate = None;
    }
}

pub struct StratumClient {
    endpoint: PoolEndpoint,
    settings: SessionSettings,
    seeds: Arc<SeedResolver>,
}

impl StratumClient {
    pub fn new(endpoint: PoolEndpoint, settings: SessionSettings, seeds: Arc<SeedResolver>) -> Self {
        Self { endpoint, settings, seeds }
    }

    pub fn endpoint(&self) -> &PoolEndpoint {
        &self.endpoint
    }

    /// Run one session until it fails, is told to reconnect, or shutdown.
    ///
    /// `PoolEvent::Disconnected` is sent exactly once, after the socket is
    /// closed, whatever the outcome.
    pub async fn run(
        &self,
        commands: &mut mpsc::Receiver<PoolCommand>,
        events: &mpsc::UnboundedSender<PoolEvent>,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut session = Session::new(self.endpoint.clone(), self.settings.clone(), self.seeds.clone());
        let result = self.drive(&mut session, commands, events, shutdown).await;
        session.on_disconnected();
        match &result {
            Ok(()) => info!(pool = %self.endpoint, "disconnected"),
            Err(e) => warn!(pool = %self.endpoint, error = %e, "disconnected"),
        }
        emit(events, PoolEvent::Disconnected);
        result
    }

    async fn drive(
        &self,
        session: &mut Session,
        commands: &mut mpsc::Receiver<PoolCommand>,
        events: &mpsc::UnboundedSender<PoolEvent>,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError> {
        let tcp = tokio::select! {
            r = transport::connect(&self.endpoint) => r?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        info!(pool = %self.endpoint, "connected");
        emit(events, PoolEvent::Connected);

        let stream = tokio::select! {
            r = transport::secure(tcp, &self.endpoint) => r?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = LineReader::new(BufReader::new(reader));
        let mut timers = Timers::new(session.work_timeout());

        let connected = session.on_connected();
        let mut outcome = apply(connected, &mut writer, &mut timers, events).await;

        while outcome.is_ok() {
            let actions = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next() => match line {
                    Ok(Some(Incoming::Line(line))) => session.on_line(&line),
                    Ok(Some(Incoming::NotUtf8)) => {
                        warn!("discarding non UTF-8 line from pool");
                        Vec::new()
                    }
                    Ok(Some(Incoming::Oversized)) => {
                        warn!(limit = transport::MAX_LINE, "discarding oversized line from pool");
                        Vec::new()
                    }
                    Ok(None) => {
                        outcome = Err(SessionError::Closed);
                        break;
                    }
                    Err(e) => {
                        outcome = Err(SessionError::Io(e));
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(PoolCommand::Submit(solution)) => session.submit_solution(&solution),
                    Some(PoolCommand::Hashrate(rate)) => {
                        timers.schedule_hashrate(rate);
                        Vec::new()
                    }
                    Some(PoolCommand::Reconnect) => {
                        info!("reconnect requested");
                        break;
                    }
                    None => break,
                },
                _ = &mut timers.work => session.on_work_timeout(),
                _ = &mut timers.response, if timers.response_armed => {
                    timers.response_armed = false;
                    session.on_response_timeout()
                }
                _ = &mut timers.hashrate, if timers.pending_rate.is_some() => {
                    match timers.pending_rate.take().and_then(|rate| session.hashrate_line(&rate)) {
                        Some(line) => vec![Action::Send(line)],
                        None => Vec::new(),
                    }
                }
            };
            outcome = apply(actions, &mut writer, &mut timers, events).await;
        }

        // Timers go first so nothing fires against a closed socket.
        timers.cancel_all();
        drop(timers);
        if tokio::time::timeout(transport::SEND_TIMEOUT, writer.shutdown()).await.is_err() {
            debug!("socket shutdown timed out");
        }
        outcome
    }
}

async fn apply<W: AsyncWrite + Unpin>(
    actions: Vec<Action>,
    writer: &mut W,
    timers: &mut Timers,
    events: &mpsc::UnboundedSender<PoolEvent>,
) -> Result<(), SessionError> {
    for action in actions {
        match action {
            Action::Send(line) => {
                debug!(line = line.trim_end(), "send");
                transport::write_line(writer, &line).await?;
            }
            Action::Emit(event) => emit(events, event),
            Action::ResetWorkTimer => timers.reset_work(),
            Action::StartResponseTimer => timers.start_response(),
            Action::CancelResponseTimer => timers.response_armed = false,
            Action::Disconnect(err) => return Err(err),
        }
    }
    Ok(())
}

/// The receiver goes away when the manager shuts down first.
fn emit(events: &mpsc::UnboundedSender<PoolEvent>, event: PoolEvent) {
    if let Err(mpsc::error::SendError(event)) = events.send(event) {
        debug!(?event, "pool event dropped, no listener");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::seed_hash;
    use crate::types::{H256, Solution};
    use serde_json::{Value, json};
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn pool_endpoint() -> (TcpListener, PoolEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = PoolEndpoint::parse(&format!("stratum+tcp://0xabc.rig:x@127.0.0.1:{port}")).unwrap();
        (listener, endpoint)
    }

    async fn read_json<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Value {
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap()
    }

    fn client(endpoint: PoolEndpoint) -> StratumClient {
        StratumClient::new(endpoint, SessionSettings::default(), Arc::new(SeedResolver::new()))
    }

    #[tokio::test]
    async fn unanswered_submission_tears_the_session_down() {
        let (listener, endpoint) = pool_endpoint().await;
        let pool = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            let mut lines = BufReader::new(r).lines();

            assert_eq!(read_json(&mut lines).await["method"], "mining.subscribe");
            w.write_all(b"{\"id\":1,\"result\":true,\"error\":null}\n").await.unwrap();
            assert_eq!(read_json(&mut lines).await["method"], "mining.authorize");
            w.write_all(b"{\"id\":3,\"result\":true,\"error\":null}\n").await.unwrap();
            let notify = json!({
                "id": null,
                "method": "mining.notify",
                "params": ["j1", format!("0x{}", "11".repeat(32)), seed_hash(0).to_string(), "0xffff", 1],
            });
            w.write_all(format!("{notify}\n").as_bytes()).await.unwrap();
            let submit = read_json(&mut lines).await;
            assert_eq!(submit["method"], "mining.submit");
            assert_eq!(submit["params"][2], "0x000000000000002a");
            // Never answer; the client hangs up.
            lines.next_line().await.unwrap()
        });

        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let c = client(endpoint);
        let run = tokio::spawn(async move { c.run(&mut cmd_rx, &ev_tx, &shutdown).await });

        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Connected));
        let work = match ev_rx.recv().await {
            Some(PoolEvent::WorkReceived(w)) => w,
            other => panic!("expected work, got {other:?}"),
        };
        assert_eq!(work.epoch, 0);

        let solution = Solution {
            nonce: 42,
            mix_hash: H256([3; 32]),
            work: Arc::new(work),
            stale: false,
            generation: 1,
        };
        cmd_tx.send(PoolCommand::Submit(solution)).await.unwrap();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(SessionError::ResponseTimeout(_))));
        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Disconnected));
        assert_eq!(ev_rx.recv().await, None);
        assert_eq!(pool.await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_connect_still_reports_disconnect() {
        let (listener, endpoint) = pool_endpoint().await;
        drop(listener);
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let result = client(endpoint).run(&mut cmd_rx, &ev_tx, &CancellationToken::new()).await;
        assert!(matches!(result, Err(SessionError::Connect { .. })));
        drop(ev_tx);
        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Disconnected));
        assert_eq!(ev_rx.recv().await, None);
    }

    #[tokio::test]
    async fn reconnect_command_ends_the_session_cleanly() {
        let (listener, endpoint) = pool_endpoint().await;
        let pool = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(sock).lines();
            let first = lines.next_line().await.unwrap();
            let after = lines.next_line().await.unwrap();
            (first.is_some(), after)
        });

        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let c = client(endpoint);
        let run = tokio::spawn(async move { c.run(&mut cmd_rx, &ev_tx, &CancellationToken::new()).await });
        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Connected));
        cmd_tx.send(PoolCommand::Reconnect).await.unwrap();

        assert!(run.await.unwrap().is_ok());
        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Disconnected));
        assert_eq!(pool.await.unwrap(), (true, None));
    }

    #[tokio::test]
    async fn undecodable_lines_do_not_end_the_session() {
        let (listener, endpoint) = pool_endpoint().await;
        let pool = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            let mut lines = BufReader::new(r).lines();

            assert_eq!(read_json(&mut lines).await["method"], "mining.subscribe");
            w.write_all(b"\xff\xfe garbage\n").await.unwrap();
            let mut long = vec![b'x'; transport::MAX_LINE + 1];
            long.push(b'\n');
            w.write_all(&long).await.unwrap();
            w.write_all(b"{\"id\":1,\"result\":true,\"error\":null}\n").await.unwrap();
            assert_eq!(read_json(&mut lines).await["method"], "mining.authorize");
            w.write_all(b"{\"id\":3,\"result\":true,\"error\":null}\n").await.unwrap();
            let notify = json!({
                "id": null,
                "method": "mining.notify",
                "params": ["j1", format!("0x{}", "22".repeat(32)), seed_hash(0).to_string(), "0xffff", 1],
            });
            w.write_all(format!("{notify}\n").as_bytes()).await.unwrap();
            lines.next_line().await.unwrap()
        });

        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let c = client(endpoint);
        let run = tokio::spawn(async move { c.run(&mut cmd_rx, &ev_tx, &CancellationToken::new()).await });

        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Connected));
        assert!(matches!(ev_rx.recv().await, Some(PoolEvent::WorkReceived(_))));
        cmd_tx.send(PoolCommand::Reconnect).await.unwrap();
        assert!(run.await.unwrap().is_ok());
        assert_eq!(ev_rx.recv().await, Some(PoolEvent::Disconnected));
        assert_eq!(pool.await.unwrap(), None);
    }
}
