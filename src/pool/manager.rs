//! Keeps a pool session alive and wires it to the farm.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error_handling::{RetryConfig, SessionError};
use crate::farm::Farm;
use crate::metrics::MetricsCollector;
use crate::pool::{PoolCommand, PoolEvent, StratumClient};
use crate::types::Solution;

const COMMAND_QUEUE: usize = 64;

/// Cloneable control surface for a running manager.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    /// Drop the current session; the manager reconnects right away.
    pub fn reconnect(&self) -> bool {
        self.commands.try_send(PoolCommand::Reconnect).is_ok()
    }
}

pub struct PoolManager {
    client: StratumClient,
    farm: Arc<Farm>,
    retry: RetryConfig,
    hashrate_interval: Duration,
    commands_tx: mpsc::Sender<PoolCommand>,
    commands_rx: mpsc::Receiver<PoolCommand>,
}

impl PoolManager {
    pub fn new(client: StratumClient, farm: Arc<Farm>, retry: RetryConfig, hashrate_interval: Duration) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        Self { client, farm, retry, hashrate_interval, commands_tx, commands_rx }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle { commands: self.commands_tx.clone() }
    }

    /// Connect, and reconnect with backoff until shutdown or the retry budget
    /// runs out. A session that delivered work resets the budget.
    pub async fn run(
        mut self,
        solutions: mpsc::UnboundedReceiver<Solution>,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        let metrics = self.farm.metrics().clone();
        let progressed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let events = tokio::spawn(handle_events(event_rx, self.farm.clone(), metrics.clone(), progressed.clone()));
        let forwarder = self.spawn_forwarder(solutions, shutdown.clone());

        let mut attempt = 0u32;
        let result = loop {
            self.discard_queued();
            info!(pool = %self.client.endpoint(), attempt, "connecting");

            let outcome = self.client.run(&mut self.commands_rx, &event_tx, &shutdown).await;
            if shutdown.is_cancelled() {
                break Ok(());
            }
            if progressed.swap(false, Ordering::SeqCst) {
                attempt = 0;
            }

            let err = match outcome {
                Ok(()) => {
                    attempt = 0;
                    continue;
                }
                Err(e) => e,
            };
            metrics.record_error(err.error_type());
            if self.retry.exhausted(attempt) {
                warn!(error = %err, attempts = attempt, "giving up on pool");
                break Err(err);
            }
            let delay = self.retry.delay_for(attempt);
            attempt += 1;
            info!(delay = ?delay, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break Ok(()),
            }
        };

        forwarder.abort();
        drop(event_tx);
        let _ = events.await;
        result
    }

    /// Submissions queued while no session was up are for superseded work.
    fn discard_queued(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            if let PoolCommand::Submit(solution) = command {
                warn!(nonce = solution.nonce, "not connected, solution dropped");
            }
        }
    }

    fn spawn_forwarder(
        &self,
        mut solutions: mpsc::UnboundedReceiver<Solution>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let commands = self.commands_tx.clone();
        let farm = self.farm.clone();
        let interval = self.hashrate_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    solution = solutions.recv() => match solution {
                        Some(s) => {
                            if commands.send(PoolCommand::Submit(s)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        let rate = format!("0x{:064x}", farm.hashrate() as u64);
                        let _ = commands.try_send(PoolCommand::Hashrate(rate));
                    }
                }
            }
        })
    }
}

async fn handle_events(
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
    farm: Arc<Farm>,
    metrics: Arc<MetricsCollector>,
    progressed: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PoolEvent::Connected => metrics.set_connected(true),
            PoolEvent::WorkReceived(work) => {
                progressed.store(true, Ordering::SeqCst);
                info!(epoch = work.epoch, height = work.height, header = %work.header, "new work");
                farm.set_work(work);
            }
            PoolEvent::SolutionAccepted { stale } => {
                metrics.record_accepted(None, stale);
                info!(stale, "solution accepted");
            }
            PoolEvent::SolutionRejected { stale } => {
                metrics.record_rejected(None, stale);
                warn!(stale, "solution rejected");
            }
            PoolEvent::Disconnected => {
                metrics.set_connected(false);
                farm.clear_work();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::{SeedResolver, seed_hash};
    use crate::error_handling::FatalPolicy;
    use crate::farm::FarmFace;
    use crate::pool::PoolEndpoint;
    use crate::pool::session::SessionSettings;
    use crate::testing::work;
    use crate::types::H256;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reconnects_then_gives_up_and_tracks_verdicts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = PoolEndpoint::parse(&format!("stratum+tcp://w:x@127.0.0.1:{port}")).unwrap();
        let (sol_tx, sol_rx) = mpsc::unbounded_channel();

        let pool = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            let mut lines = BufReader::new(r).lines();
            lines.next_line().await.unwrap();
            w.write_all(b"{\"id\":1,\"result\":true}\n").await.unwrap();
            lines.next_line().await.unwrap();
            w.write_all(b"{\"id\":3,\"result\":true}\n").await.unwrap();
            let notify = json!({
                "id": null,
                "method": "mining.notify",
                "params": ["j", format!("0x{}", "22".repeat(32)), seed_hash(0).to_string(), "0xffff", 1],
            });
            w.write_all(format!("{notify}\n").as_bytes()).await.unwrap();

            sol_tx
                .send(Solution {
                    nonce: 5,
                    mix_hash: H256([1; 32]),
                    work: Arc::new(work(9, 0, 1)),
                    stale: false,
                    generation: 1,
                })
                .unwrap();
            let submit = lines.next_line().await.unwrap().unwrap();
            assert!(submit.contains("mining.submit"));
            w.write_all(b"{\"id\":4,\"result\":true}\n").await.unwrap();
            drop(w);
            drop(lines);

            // Second session: hang up at once.
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let metrics = Arc::new(MetricsCollector::new());
        let (farm, _rx) = Farm::new(metrics.clone(), FatalPolicy::new(false));
        let client = StratumClient::new(endpoint, SessionSettings::default(), Arc::new(SeedResolver::new()));
        let retry = RetryConfig {
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let manager = PoolManager::new(client, farm.clone(), retry, Duration::from_secs(60));
        assert!(manager.handle().reconnect());

        let result = manager.run(sol_rx, CancellationToken::new()).await;
        assert!(result.is_err());
        pool.await.unwrap();

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.accepted, 1);
        assert!(!snapshot.connected);
        assert!(snapshot.network_errors >= 2);
        // Work was published, then cleared on disconnect.
        assert!(farm.generation() >= 2);
        assert!(!farm.work().is_valid());
    }

    #[tokio::test]
    async fn shutdown_stops_the_retry_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = PoolEndpoint::parse(&format!("stratum+tcp://w@127.0.0.1:{port}")).unwrap();

        let (farm, _rx) = Farm::new(Arc::new(MetricsCollector::new()), FatalPolicy::new(false));
        let client = StratumClient::new(endpoint, SessionSettings::default(), Arc::new(SeedResolver::new()));
        let retry = RetryConfig {
            max_retries: 0,
            retry_delay: Duration::from_secs(3600),
            ..Default::default()
        };
        let manager = PoolManager::new(client, farm, retry, Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let (_sol_tx, sol_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(manager.run(sol_rx, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        assert!(run.await.unwrap().is_ok());
    }
}
