// =============================================================================
// AutoTrader — per-trader state machine running the scan/decide/execute cycle
// =============================================================================
//
// Each trader owns one cancellable tokio task. A cycle walks
// Preparing -> Deciding -> Executing -> Recording; risk trips divert to
// Halted for a cool-down, and only stop() (or process shutdown) ends the
// loop. Errors inside a cycle are captured into that cycle's record — the
// loop itself never dies to them.
//
// Cancellation is observed at every suspension point (tick wait, HTTP
// awaits, halt sleep) via tokio::select! on the trader's CancellationToken.
// =============================================================================

mod executor;
mod prompt;
mod tripwire;

pub use executor::{ActionExecutor, LeveragePolicy};
pub use prompt::{build_system_prompt, build_user_prompt, CandidateUniverse, BASE_SYSTEM_PROMPT};
pub use tripwire::{TripCheck, Tripwire, TripwireConfig};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::AiClient;
use crate::decision::{parse_decision, DecisionAction, DecisionLogger, DecisionRecord};
use crate::exchange::{AccountState, Exchange, Position};
use crate::notify::Notifier;
use crate::signal_source::{normalize_symbol, SignalSourceCache};
use crate::store::TraderStore;
use crate::types::{MarginMode, OrderStrategy};

/// Default number of coin-pool symbols taken into the candidate universe.
const DEFAULT_AI500_LIMIT: usize = 10;

// =============================================================================
// Configuration
// =============================================================================

/// Validated, immutable configuration for one trader.
#[derive(Debug, Clone)]
pub struct TraderConfig {
    /// Stable id; user-scoped ids are formed as `<user_id>_<suffix>`.
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub ai_model_id: String,
    pub exchange_config_id: String,
    pub initial_balance: f64,
    pub scan_interval: Duration,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub margin_mode: MarginMode,
    /// Empty means "use the signal sources".
    pub custom_symbols: Vec<String>,
    pub ai500_limit: usize,
    pub custom_prompt: String,
    /// When true the custom prompt replaces the base prompt entirely.
    pub override_base_prompt: bool,
    pub order_strategy: OrderStrategy,
    /// Entry notional as a percentage of available balance.
    pub order_size_pct: f64,
    /// Persisted running flag; the supervisor starts traders with this set.
    pub is_running: bool,
}

impl TraderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("trader id must not be empty");
        }
        if self.name.trim().is_empty() {
            anyhow::bail!("trader name must not be empty");
        }
        if self.scan_interval.is_zero() {
            anyhow::bail!("scan interval must be positive");
        }
        if self.initial_balance <= 0.0 {
            anyhow::bail!("initial balance must be positive");
        }
        if self.order_size_pct <= 0.0 || self.order_size_pct > 100.0 {
            anyhow::bail!(
                "order size must be in (0, 100] percent, got {}",
                self.order_size_pct
            );
        }
        if self.ai500_limit == 0 {
            anyhow::bail!("ai500 limit must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Where the scan loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderState {
    Idle,
    Preparing,
    Deciding,
    Executing,
    Recording,
    Halted,
    Stopped,
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Deciding => "deciding",
            Self::Executing => "executing",
            Self::Recording => "recording",
            Self::Halted => "halted",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// What one cycle asks the loop to do next.
enum CycleOutcome {
    Completed,
    /// Sleep this long before the next tick (risk trip / open halt window).
    Halt(Duration),
}

// =============================================================================
// Dependencies
// =============================================================================

/// Shared services handed to a trader at construction.
pub struct TraderDeps {
    pub signal: Arc<SignalSourceCache>,
    pub ai: Arc<AiClient>,
    pub exchange: Arc<dyn Exchange>,
    pub store: Option<Arc<TraderStore>>,
    pub notifier: Option<Arc<Notifier>>,
    pub decision_log_dir: PathBuf,
    pub tripwire: TripwireConfig,
}

// =============================================================================
// AutoTrader
// =============================================================================

pub struct AutoTrader {
    config: TraderConfig,
    signal: Arc<SignalSourceCache>,
    ai: Arc<AiClient>,
    exchange: Arc<dyn Exchange>,
    store: Option<Arc<TraderStore>>,
    notifier: Option<Arc<Notifier>>,
    logger: DecisionLogger,
    executor: ActionExecutor,
    tripwire: Tripwire,

    state: RwLock<TraderState>,
    running: AtomicBool,
    cycle_count: AtomicU64,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_account: RwLock<Option<AccountState>>,
    last_positions: RwLock<Vec<Position>>,

    cancel: parking_lot::Mutex<CancellationToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AutoTrader {
    /// Validate the configuration and assemble a trader. Does not start work.
    pub fn new(config: TraderConfig, deps: TraderDeps) -> Result<Arc<Self>> {
        config.validate()?;

        let executor = ActionExecutor::new(
            deps.exchange.clone(),
            LeveragePolicy {
                btc_eth: config.btc_eth_leverage,
                altcoin: config.altcoin_leverage,
            },
            config.margin_mode,
            config.order_strategy,
            config.order_size_pct,
        );
        let logger = DecisionLogger::new(&deps.decision_log_dir, &config.id);
        let tripwire = Tripwire::new(deps.tripwire);

        Ok(Arc::new(Self {
            signal: deps.signal,
            ai: deps.ai,
            exchange: deps.exchange,
            store: deps.store,
            notifier: deps.notifier,
            logger,
            executor,
            tripwire,
            state: RwLock::new(TraderState::Idle),
            running: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            started_at: RwLock::new(None),
            last_account: RwLock::new(None),
            last_positions: RwLock::new(Vec::new()),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
            config,
        }))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the scan task. Starting a running trader is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(trader_id = %self.config.id, "start ignored — already running");
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        *self.started_at.write() = Some(Utc::now());
        *self.state.write() = TraderState::Idle;

        let trader = self.clone();
        let handle = tokio::spawn(async move {
            trader.scan_loop(token).await;
        });
        *self.task.lock().await = Some(handle);

        if let Some(store) = &self.store {
            if let Err(e) = store.set_running(&self.config.id, true).await {
                warn!(trader_id = %self.config.id, error = %e, "failed to persist running flag");
            }
        }

        info!(
            trader_id = %self.config.id,
            name = %self.config.name,
            interval_secs = self.config.scan_interval.as_secs(),
            "trader started"
        );
    }

    /// Request cancellation and wait until the scan task has observed it.
    /// Stopping a stopped trader is a no-op.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        self.cancel.lock().cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.running.store(false, Ordering::SeqCst);
        *self.state.write() = TraderState::Stopped;

        if let Some(store) = &self.store {
            if let Err(e) = store.set_running(&self.config.id, false).await {
                warn!(trader_id = %self.config.id, error = %e, "failed to persist running flag");
            }
        }

        info!(trader_id = %self.config.id, "trader stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn config(&self) -> &TraderConfig {
        &self.config
    }

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    /// Account snapshot from the most recent Preparing step.
    pub fn account_state(&self) -> Option<AccountState> {
        self.last_account.read().clone()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.last_positions.read().clone()
    }

    /// The most recent `n` decision records, oldest first.
    pub fn decisions(&self, n: usize) -> Vec<DecisionRecord> {
        self.logger.latest(n)
    }

    pub fn decision_count(&self) -> usize {
        self.logger.count()
    }

    /// PnL since inception relative to the configured initial balance.
    pub fn total_pnl_pct(&self) -> Option<f64> {
        let account = self.last_account.read().clone()?;
        if self.config.initial_balance <= 0.0 {
            return None;
        }
        Some(
            (account.total_equity - self.config.initial_balance) / self.config.initial_balance
                * 100.0,
        )
    }

    // -------------------------------------------------------------------------
    // Scan loop
    // -------------------------------------------------------------------------

    async fn scan_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.scan_interval;
        debug!(trader_id = %self.config.id, "scan loop entered");

        let mut next_tick = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_tick) => {}
            }
            let tick_start = tokio::time::Instant::now();
            let cycle_number = self.cycle_count.load(Ordering::SeqCst) + 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.record_cancelled(cycle_number);
                    break;
                }
                outcome = self.run_cycle(cycle_number) => outcome,
            };

            if let CycleOutcome::Halt(pause) = outcome {
                *self.state.write() = TraderState::Halted;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            *self.state.write() = TraderState::Idle;
            // An overrunning cycle fires the next tick immediately; there is
            // never more than one catch-up tick.
            next_tick = tick_start + interval;
        }

        self.running.store(false, Ordering::SeqCst);
        *self.state.write() = TraderState::Stopped;
        debug!(trader_id = %self.config.id, "scan loop exited");
    }

    async fn run_cycle(&self, cycle_number: u64) -> CycleOutcome {
        *self.state.write() = TraderState::Preparing;

        let candidates = if self.config.custom_symbols.is_empty() {
            CandidateUniverse::Merged(self.signal.get_merged(self.config.ai500_limit).await)
        } else {
            CandidateUniverse::Custom(
                self.config
                    .custom_symbols
                    .iter()
                    .map(|s| normalize_symbol(s))
                    .collect(),
            )
        };

        debug!(
            trader_id = %self.config.id,
            cycle = cycle_number,
            candidates = candidates.symbols().len(),
            "cycle preparing"
        );

        let account = match self.exchange.get_account().await {
            Ok(account) => account,
            Err(e) => {
                warn!(trader_id = %self.config.id, error = %e, "account fetch failed");
                self.record_failed(
                    cycle_number,
                    String::new(),
                    String::new(),
                    AccountState::default(),
                    format!("account fetch failed: {e}"),
                );
                return CycleOutcome::Completed;
            }
        };
        *self.last_account.write() = Some(account.clone());

        let positions = match self.exchange.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(trader_id = %self.config.id, error = %e, "position fetch failed");
                self.record_failed(
                    cycle_number,
                    String::new(),
                    String::new(),
                    account,
                    format!("position fetch failed: {e}"),
                );
                return CycleOutcome::Completed;
            }
        };
        *self.last_positions.write() = positions.clone();

        match self.tripwire.check(&account) {
            TripCheck::Clear => {}
            TripCheck::Tripped { reason } => {
                warn!(trader_id = %self.config.id, reason = %reason, "risk tripwire — halting");
                return CycleOutcome::Halt(self.tripwire.halt_duration());
            }
            TripCheck::Halted { remaining } => {
                debug!(trader_id = %self.config.id, remaining_secs = remaining.as_secs(), "halt window still open");
                return CycleOutcome::Halt(remaining);
            }
        }

        // ── Deciding ────────────────────────────────────────────────────
        *self.state.write() = TraderState::Deciding;

        let system_prompt =
            build_system_prompt(&self.config.custom_prompt, self.config.override_base_prompt);
        let user_prompt = build_user_prompt(&account, &positions, &candidates);
        let prompt_text = format!("{system_prompt}\n\n{user_prompt}");

        let raw = match self.ai.call(&system_prompt, &user_prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(trader_id = %self.config.id, error = %e, "model call failed");
                self.record_failed(cycle_number, prompt_text, String::new(), account, e.to_string());
                return CycleOutcome::Completed;
            }
        };

        let (planned, cot_trace) = match parse_decision(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(trader_id = %self.config.id, error = %e, "model output did not parse");
                self.record_failed(
                    cycle_number,
                    prompt_text,
                    raw,
                    account,
                    "invalid_decision".to_string(),
                );
                return CycleOutcome::Completed;
            }
        };

        // ── Executing ───────────────────────────────────────────────────
        *self.state.write() = TraderState::Executing;

        let mut actions: Vec<DecisionAction> = Vec::with_capacity(planned.len());
        let mut execution_log: Vec<String> = Vec::new();
        for plan in &planned {
            let (action, lines) = self.executor.execute(plan).await;
            actions.push(action);
            execution_log.extend(lines);
        }

        // ── Recording ───────────────────────────────────────────────────
        *self.state.write() = TraderState::Recording;

        let failed_actions = actions.iter().filter(|a| !a.success).count();
        let record = DecisionRecord {
            cycle_number,
            timestamp: Utc::now(),
            prompt: prompt_text,
            raw_response: raw,
            cot_trace,
            actions,
            account_state: account,
            execution_log,
            success: true,
            error_message: String::new(),
        };
        self.cycle_count.store(cycle_number, Ordering::SeqCst);
        let action_count = record.actions.len();
        self.logger.append(record);

        if let Some(notifier) = &self.notifier {
            notifier.notify(
                &self.config.id,
                format!(
                    "cycle {cycle_number} recorded: {action_count} actions, {failed_actions} failed"
                ),
            );
        }

        CycleOutcome::Completed
    }

    /// Record a cycle that failed before execution; consumes the cycle number.
    fn record_failed(
        &self,
        cycle_number: u64,
        prompt: String,
        raw_response: String,
        account_state: AccountState,
        error_message: String,
    ) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(
                &self.config.id,
                format!("cycle {cycle_number} failed: {error_message}"),
            );
        }
        let record = DecisionRecord {
            cycle_number,
            timestamp: Utc::now(),
            prompt,
            raw_response,
            cot_trace: String::new(),
            actions: Vec::new(),
            account_state,
            execution_log: Vec::new(),
            success: false,
            error_message,
        };
        self.cycle_count.store(cycle_number, Ordering::SeqCst);
        self.logger.append(record);
    }

    /// Partial record for a cycle interrupted by cancellation.
    fn record_cancelled(&self, cycle_number: u64) {
        let account = self.last_account.read().clone().unwrap_or_default();
        self.record_failed(
            cycle_number,
            String::new(),
            String::new(),
            account,
            "cancelled".to_string(),
        );
        info!(trader_id = %self.config.id, cycle = cycle_number, "cycle interrupted by stop");
    }
}

impl std::fmt::Debug for AutoTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoTrader")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .field("cycles", &self.cycle_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::OpenAiProvider;
    use crate::exchange::PaperExchange;
    use crate::signal_source::SignalSourceConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read until the request head and its content-length body are complete.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
            let text = String::from_utf8_lossy(&buf);
            let Some(head_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let content_length = text
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + content_length {
                return;
            }
        }
    }

    /// Serve the same chat completion forever.
    async fn ai_server_with_content(content: &str) -> String {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
        .to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let response = response.clone();
                tokio::spawn(async move {
                    read_request(&mut socket).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    /// Accept connections but never answer.
    async fn hanging_ai_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(Duration::from_secs(600)).await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn ai_client(base_url: &str) -> Arc<AiClient> {
        let provider = Arc::new(OpenAiProvider::new(
            "sk-test".into(),
            Some(base_url.to_string()),
            Some("test-model".into()),
        ));
        Arc::new(
            AiClient::new(provider)
                .with_max_retries(0)
                .with_retry_wait(Duration::from_millis(1))
                .with_call_timeout(Duration::from_secs(30)),
        )
    }

    fn test_config(id: &str, interval: Duration) -> TraderConfig {
        TraderConfig {
            id: id.to_string(),
            name: format!("trader {id}"),
            user_id: "u1".to_string(),
            ai_model_id: "m1".to_string(),
            exchange_config_id: "e1".to_string(),
            initial_balance: 1000.0,
            scan_interval: interval,
            btc_eth_leverage: 5,
            altcoin_leverage: 10,
            margin_mode: MarginMode::Cross,
            custom_symbols: vec!["BTCUSDT".to_string()],
            ai500_limit: DEFAULT_AI500_LIMIT,
            custom_prompt: String::new(),
            override_base_prompt: false,
            order_strategy: OrderStrategy::Market,
            order_size_pct: 10.0,
            is_running: false,
        }
    }

    fn deps(
        ai: Arc<AiClient>,
        exchange: Arc<dyn Exchange>,
        log_dir: &std::path::Path,
    ) -> TraderDeps {
        let mut signal_cfg = SignalSourceConfig::default();
        signal_cfg.cache_dir = log_dir.join("signal").to_string_lossy().into_owned();
        TraderDeps {
            signal: Arc::new(SignalSourceCache::new(signal_cfg)),
            ai,
            exchange,
            store: None,
            notifier: None,
            decision_log_dir: log_dir.join("decisions"),
            tripwire: TripwireConfig {
                max_daily_loss_pct: 10.0,
                max_drawdown_pct: 20.0,
                halt_duration: Duration::from_secs(10),
            },
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn happy_cycle_records_and_opens_position() {
        let base = ai_server_with_content(
            r#"[{"symbol":"BTCUSDT","action":"open_long","leverage":5}]"#,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        let trader = AutoTrader::new(
            test_config("u1_t1", Duration::from_secs(60)),
            deps(ai_client(&base), paper.clone(), dir.path()),
        )
        .unwrap();

        trader.start().await;
        assert!(
            wait_until(|| trader.decision_count() >= 1, Duration::from_secs(5)).await,
            "first cycle never recorded"
        );
        trader.stop().await;

        let records = trader.decisions(10);
        assert_eq!(records[0].cycle_number, 1);
        assert!(records[0].success);
        assert_eq!(records[0].actions.len(), 1);
        assert!(records[0].actions[0].success);
        assert_eq!(records[0].actions[0].leverage, 5);

        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn cycle_numbers_are_gapless_and_increasing() {
        let base = ai_server_with_content(r#"[{"symbol":"BTCUSDT","action":"wait"}]"#).await;
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        let trader = AutoTrader::new(
            test_config("u1_t2", Duration::from_millis(20)),
            deps(ai_client(&base), paper, dir.path()),
        )
        .unwrap();

        trader.start().await;
        assert!(wait_until(|| trader.decision_count() >= 3, Duration::from_secs(5)).await);
        trader.stop().await;

        let records = trader.decisions(100);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.cycle_number, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn stop_during_model_call_writes_partial_record() {
        let base = hanging_ai_server().await;
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        let trader = AutoTrader::new(
            test_config("u1_t3", Duration::from_secs(60)),
            deps(ai_client(&base), paper, dir.path()),
        )
        .unwrap();

        trader.start().await;
        // Let the cycle reach the in-flight model call.
        assert!(
            wait_until(
                || trader.state() == TraderState::Deciding,
                Duration::from_secs(5)
            )
            .await
        );

        let stop_started = tokio::time::Instant::now();
        trader.stop().await;
        assert!(stop_started.elapsed() < Duration::from_secs(1));

        assert!(!trader.is_running());
        let records = trader.decisions(10);
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error_message, "cancelled");

        // No further records appear after stop.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(trader.decision_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_model_output_fails_cycle_without_actions() {
        let base = ai_server_with_content("I would rather not commit to anything today.").await;
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        let trader = AutoTrader::new(
            test_config("u1_t4", Duration::from_secs(60)),
            deps(ai_client(&base), paper.clone(), dir.path()),
        )
        .unwrap();

        trader.start().await;
        assert!(wait_until(|| trader.decision_count() >= 1, Duration::from_secs(5)).await);
        trader.stop().await;

        let records = trader.decisions(10);
        assert!(!records[0].success);
        assert_eq!(records[0].error_message, "invalid_decision");
        assert!(records[0].actions.is_empty());
        assert!(paper.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_outage_records_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        // Nothing listens on the discard port.
        let trader = AutoTrader::new(
            test_config("u1_t5", Duration::from_secs(60)),
            deps(ai_client("http://127.0.0.1:1"), paper, dir.path()),
        )
        .unwrap();

        trader.start().await;
        assert!(wait_until(|| trader.decision_count() >= 1, Duration::from_secs(5)).await);
        trader.stop().await;

        let records = trader.decisions(10);
        assert!(!records[0].success);
        assert!(records[0].error_message.contains("retries exhausted"));
        assert!(records[0].actions.is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let base = ai_server_with_content(r#"[{"symbol":"BTCUSDT","action":"wait"}]"#).await;
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        let trader = AutoTrader::new(
            test_config("u1_t6", Duration::from_millis(20)),
            deps(ai_client(&base), paper, dir.path()),
        )
        .unwrap();

        trader.start().await;
        trader.start().await;
        assert!(trader.is_running());

        assert!(wait_until(|| trader.decision_count() >= 3, Duration::from_secs(5)).await);
        trader.stop().await;
        trader.stop().await;
        assert!(!trader.is_running());

        // A second task would have produced duplicate or skipped numbers.
        let records = trader.decisions(100);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.cycle_number, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn equity_collapse_trips_and_halts() {
        let base = ai_server_with_content(r#"[{"symbol":"BTCUSDT","action":"open_long","leverage":5}]"#).await;
        let dir = tempfile::tempdir().unwrap();
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_mark_price("BTCUSDT", 50_000.0);

        let trader = AutoTrader::new(
            test_config("u1_t7", Duration::from_millis(20)),
            deps(ai_client(&base), paper.clone(), dir.path()),
        )
        .unwrap();

        trader.start().await;
        assert!(wait_until(|| trader.decision_count() >= 1, Duration::from_secs(5)).await);

        // Crash the mark price: the long position loses far more than 10%
        // of day-open equity, so the next tick trips.
        paper.set_mark_price("BTCUSDT", 25_000.0);
        assert!(
            wait_until(
                || trader.state() == TraderState::Halted,
                Duration::from_secs(5)
            )
            .await
        );

        // Halted traders do not run cycles.
        let frozen = trader.decision_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(trader.decision_count(), frozen);

        trader.stop().await;
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = test_config("t", Duration::from_secs(60));
        config.scan_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = test_config("t", Duration::from_secs(60));
        config.initial_balance = 0.0;
        assert!(config.validate().is_err());

        let mut config = test_config("", Duration::from_secs(60));
        config.id = "".into();
        assert!(config.validate().is_err());

        let mut config = test_config("t", Duration::from_secs(60));
        config.order_size_pct = 150.0;
        assert!(config.validate().is_err());
    }
}
