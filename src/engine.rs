//! Game Engine
//!
//! Drives the round lifecycle: one interval timer feeds [`RoundClock`], and
//! each clock action is carried out against the [`RoundManager`] and
//! announced on the broadcast channel. Bets arrive concurrently through
//! [`GameEngine::place_bet`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::rng::{entropy_seed, DeterministicRng};
use crate::game::clock::{ClockAction, RoundClock, RoundTimings};
use crate::game::dice::HouseEdge;
use crate::game::events::RoundEvent;
use crate::game::round::{BetError, BetReceipt, RoundManager};
use crate::game::state::{PlayerId, RoundSnapshot, Side};
use crate::store::{
    BalanceLedger, HouseEdgeConfig, MemoryLedger, MemoryRoundStore, MemorySettings, RoundStore,
    SettingsError, SettingsStore, StoreError, StoreSnapshot,
};
use crate::{DEFAULT_STARTING_BALANCE, TICK_INTERVAL_MS};

/// Broadcast buffer per subscriber.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// CONFIG
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Phase durations in ticks.
    pub timings: RoundTimings,
    /// Wall-clock length of one tick.
    pub tick_interval: Duration,
    /// Credits given to newly opened accounts.
    pub starting_balance: u64,
    /// House edge applied at startup, overriding the stored value.
    pub house_edge_override: Option<f64>,
    /// Fixed RNG seed; fresh entropy when `None`.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timings: RoundTimings::default(),
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            starting_balance: DEFAULT_STARTING_BALANCE,
            house_edge_override: None,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timings: defaults.timings,
            tick_interval: std::env::var("DICE_TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            starting_balance: std::env::var("DICE_STARTING_BALANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.starting_balance),
            house_edge_override: std::env::var("DICE_HOUSE_EDGE")
                .ok()
                .and_then(|v| v.parse().ok()),
            rng_seed: std::env::var("DICE_RNG_SEED")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Engine failures outside the bet path.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A store call failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A setting was rejected.
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// The storage the engine runs on.
#[derive(Clone)]
pub struct Stores {
    /// Player balances.
    pub ledger: Arc<dyn BalanceLedger>,
    /// Rounds and wagers.
    pub rounds: Arc<dyn RoundStore>,
    /// Admin settings.
    pub settings: Arc<dyn SettingsStore>,
}

// =============================================================================
// ENGINE
// =============================================================================

/// The single authoritative round engine.
pub struct GameEngine {
    config: EngineConfig,
    manager: RoundManager,
    clock: Mutex<RoundClock>,
    house_edge: HouseEdgeConfig,
    settings: Arc<dyn SettingsStore>,
    rng: Mutex<DeterministicRng>,
    events: broadcast::Sender<RoundEvent>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl GameEngine {
    /// Build an engine over `stores`. The house edge is read once here.
    pub async fn new(config: EngineConfig, stores: Stores) -> Result<Arc<Self>, EngineError> {
        let house_edge = HouseEdgeConfig::load(stores.settings.clone()).await?;
        if let Some(percent) = config.house_edge_override {
            house_edge.set_percent(percent).await?;
        }

        let seed = config.rng_seed.unwrap_or_else(entropy_seed);
        info!(
            seed = %hex::encode(&seed.to_be_bytes()[..4]),
            house_edge = house_edge.percent().await,
            "Engine created"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            manager: RoundManager::with_betting_window(
                stores.ledger,
                stores.rounds,
                config.timings.sanitized().betting,
            ),
            clock: Mutex::new(RoundClock::new(config.timings)),
            house_edge,
            settings: stores.settings,
            rng: Mutex::new(DeterministicRng::new(seed)),
            events,
            running: AtomicBool::new(false),
            shutdown_tx,
            driver: Mutex::new(None),
            config,
        }))
    }

    /// Start the lifecycle at the round after the last persisted one and
    /// spawn the timer. Returns the first round number. A running engine is
    /// left as is.
    pub async fn start(self: &Arc<Self>) -> Result<u64, EngineError> {
        // Held throughout, so start and stop never interleave
        let mut driver = self.driver.lock().await;
        if self.is_running() {
            return Ok(self.clock.lock().await.round_number());
        }

        let first_round = self.manager.rounds().last_round_number().await? + 1;
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.running.store(true, Ordering::SeqCst);
        let actions = self.clock.lock().await.start(first_round);
        for action in actions {
            self.execute(action).await;
        }

        let engine = Arc::clone(self);
        let period = self.config.tick_interval;

        *driver = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.tick_once().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Engine timer stopped");
        }));

        info!(round = first_round, "Engine started");
        Ok(first_round)
    }

    /// Stop the timer. A tick already in progress finishes first; no new
    /// round opens afterwards, and stakes of an unfinished round are
    /// refunded. Returns `false` if already stopped.
    pub async fn stop(&self) -> bool {
        let mut driver = self.driver.lock().await;
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.clock.lock().await.stop();
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = driver.take() {
            if let Err(e) = handle.await {
                error!("Engine timer task failed: {}", e);
            }
        }

        if self.manager.refund_pool().await > 0 {
            self.emit(RoundEvent::BalanceUpdateAll);
        }

        if was_running {
            info!("Engine stopped");
        }
        was_running
    }

    /// Capture the in-memory stores with round state frozen, so no bet or
    /// settlement lands between reading balances and reading wagers.
    pub async fn capture_snapshot(
        &self,
        ledger: &MemoryLedger,
        rounds: &MemoryRoundStore,
        settings: &MemorySettings,
    ) -> StoreSnapshot {
        let frozen = self.manager.freeze().await;
        let snapshot = StoreSnapshot::capture(ledger, rounds, settings).await;
        snapshot.with_pending(frozen.pending())
    }

    /// Whether the timer is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Advance the lifecycle by one tick.
    pub async fn tick_once(&self) {
        let actions = self.clock.lock().await.tick();
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&self, action: ClockAction) {
        match action {
            ClockAction::StartRound { round_number, time_left } => {
                if !self.is_running() {
                    return;
                }
                self.manager.start_new_round(round_number).await;
                self.emit(RoundEvent::round_start(round_number, time_left));
            }
            ClockAction::TimerUpdate { time_left } => {
                self.manager.set_time_left(time_left.max(0) as u32).await;
                self.emit(RoundEvent::TimerUpdate { time_left });
            }
            ClockAction::LockBetting => {
                self.manager.lock_betting().await;
                self.emit(RoundEvent::BettingLocked);
            }
            ClockAction::RollDice => {
                self.emit(RoundEvent::DiceRolling);
            }
            ClockAction::Reveal => self.reveal().await,
        }
    }

    async fn reveal(&self) {
        let edge = self.house_edge.edge().await;
        let result = {
            let mut rng = self.rng.lock().await;
            self.manager.process_round(edge, &mut rng).await
        };

        match result {
            Ok(summary) => {
                for failure in &summary.settlement.failures {
                    error!(round = summary.round_number, "Settlement failure: {}", failure);
                }
                self.emit(RoundEvent::round_result(summary.round_number, &summary.roll));
                self.emit(RoundEvent::BalanceUpdateAll);
            }
            Err(e) => warn!("Reveal skipped: {}", e),
        }
    }

    fn emit(&self, event: RoundEvent) {
        debug!(event = event.name(), "Broadcast");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Place a bet on the open round.
    pub async fn place_bet(
        &self,
        player: PlayerId,
        side: Side,
        amount: u64,
    ) -> Result<BetReceipt, BetError> {
        if !self.is_running() {
            return Err(BetError::EngineUnavailable);
        }
        if self.settings.maintenance().await? {
            return Err(BetError::Maintenance);
        }

        match self.manager.place_bet(player, side, amount).await {
            Ok(receipt) => {
                self.emit(RoundEvent::bet_placed(player, side, amount));
                Ok(receipt)
            }
            Err(e) => {
                debug!(player = %player.short(), %side, amount, "Bet rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    /// Current round view.
    pub async fn current_round(&self) -> Option<RoundSnapshot> {
        self.manager.current_round().await
    }

    /// A player's balance.
    pub async fn balance(&self, player: PlayerId) -> Result<u64, StoreError> {
        self.manager.ledger().balance(player).await
    }

    /// Make sure `player` has an account, seeding new ones with the
    /// configured starting balance.
    pub async fn open_account(&self, player: PlayerId) -> Result<u64, StoreError> {
        self.manager
            .ledger()
            .open_account(player, self.config.starting_balance)
            .await
    }

    /// Current house edge.
    pub async fn house_edge(&self) -> HouseEdge {
        self.house_edge.edge().await
    }

    /// Update the house edge (percent, 0..=100). Takes effect at the next
    /// reveal.
    pub async fn set_house_edge(&self, percent: f64) -> Result<HouseEdge, SettingsError> {
        self.house_edge.set_percent(percent).await
    }

    /// Whether maintenance mode is on.
    pub async fn maintenance(&self) -> Result<bool, StoreError> {
        self.settings.maintenance().await
    }

    /// Turn maintenance mode on or off.
    pub async fn set_maintenance(&self, on: bool) -> Result<(), StoreError> {
        self.settings.set_maintenance(on).await?;
        info!(on, "Maintenance mode changed");
        Ok(())
    }

    /// Round store, for history queries.
    pub fn rounds(&self) -> &Arc<dyn RoundStore> {
        self.manager.rounds()
    }

    /// Balance ledger, for admin queries.
    pub fn ledger(&self) -> &Arc<dyn BalanceLedger> {
        self.manager.ledger()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::dice::DiceRoll;
    use crate::game::state::RoundStatus;
    use crate::store::{MemoryLedger, MemoryRoundStore, MemorySettings};

    fn player(n: u8) -> PlayerId {
        PlayerId::new([n; 16])
    }

    fn stores(accounts: &[(u8, u64)]) -> (Stores, Arc<MemoryRoundStore>) {
        let rounds = Arc::new(MemoryRoundStore::new());
        let stores = Stores {
            ledger: Arc::new(MemoryLedger::with_accounts(
                accounts.iter().map(|(p, c)| (player(*p), *c)),
            )),
            rounds: rounds.clone(),
            settings: Arc::new(MemorySettings::default()),
        };
        (stores, rounds)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            rng_seed: Some(7),
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<RoundEvent>) -> Vec<RoundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_continues_numbering() {
        let (stores, rounds) = stores(&[]);
        rounds
            .create_round(41, &DiceRoll::from_dice(1, 2, 3).unwrap())
            .await
            .unwrap();

        let engine = GameEngine::new(config(), stores).await.unwrap();
        assert_eq!(engine.start().await.unwrap(), 42);

        let snap = engine.current_round().await.unwrap();
        assert_eq!(snap.round_number, 42);
        assert_eq!(snap.status, RoundStatus::Open);

        // Starting twice keeps the same round
        assert_eq!(engine.start().await.unwrap(), 42);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_open_prevents_next_round() {
        let (stores, rounds) = stores(&[]);
        rounds
            .create_round(41, &DiceRoll::from_dice(1, 2, 3).unwrap())
            .await
            .unwrap();

        let engine = GameEngine::new(config(), stores).await.unwrap();
        let mut rx = engine.subscribe();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(engine.stop().await);
        assert!(!engine.stop().await);

        tokio::time::sleep(Duration::from_secs(60)).await;

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, RoundEvent::RoundStart { round_number: 43, .. })));
        assert!(!events.iter().any(|e| matches!(e, RoundEvent::BettingLocked)));
        assert_eq!(engine.current_round().await.unwrap().round_number, 42);
        assert_eq!(rounds.last_round_number().await.unwrap(), 41);

        assert_eq!(
            engine.place_bet(player(1), Side::High, 1).await,
            Err(BetError::EngineUnavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_round_event_sequence() {
        let (stores, rounds) = stores(&[(1, 1000)]);
        let engine = GameEngine::new(config(), stores).await.unwrap();
        let mut rx = engine.subscribe();
        engine.start().await.unwrap();

        engine.place_bet(player(1), Side::High, 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25_500)).await;
        engine.stop().await;

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();

        let mut expected = vec!["round_start", "bet_placed"];
        expected.extend(std::iter::repeat("timer_update").take(15));
        expected.push("betting_locked");
        expected.extend(std::iter::repeat("timer_update").take(5));
        expected.extend(["dice_rolling", "round_result", "balance_update_all", "round_start"]);
        assert_eq!(names, expected);

        assert_eq!(events[2], RoundEvent::TimerUpdate { time_left: 14 });
        assert!(matches!(events.last(), Some(RoundEvent::RoundStart { round_number: 2, .. })));
        assert_eq!(rounds.last_round_number().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bets_rejected_while_locked() {
        let (stores, _) = stores(&[(1, 1000)]);
        let engine = GameEngine::new(config(), stores).await.unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(engine.current_round().await.unwrap().status, RoundStatus::Locked);
        assert_eq!(
            engine.place_bet(player(1), Side::Low, 10).await,
            Err(BetError::BettingClosed)
        );
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_blocks_bets() {
        let (stores, _) = stores(&[(1, 1000)]);
        let engine = GameEngine::new(config(), stores).await.unwrap();
        engine.start().await.unwrap();

        engine.set_maintenance(true).await.unwrap();
        assert_eq!(
            engine.place_bet(player(1), Side::Low, 10).await,
            Err(BetError::Maintenance)
        );

        engine.set_maintenance(false).await.unwrap();
        assert!(engine.place_bet(player(1), Side::Low, 10).await.is_ok());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_house_edge_override_and_update() {
        let (stores, _) = stores(&[]);
        let settings = stores.settings.clone();
        let engine = GameEngine::new(
            EngineConfig {
                house_edge_override: Some(25.0),
                ..config()
            },
            stores,
        )
        .await
        .unwrap();

        assert_eq!(engine.house_edge().await.percent(), 25.0);
        assert_eq!(settings.house_edge().await.unwrap().percent(), 25.0);

        assert!(engine.set_house_edge(150.0).await.is_err());
        engine.set_house_edge(60.0).await.unwrap();
        assert_eq!(engine.house_edge().await.percent(), 60.0);
    }

    #[tokio::test]
    async fn test_invalid_override_fails_construction() {
        let (stores, _) = stores(&[]);
        let result = GameEngine::new(
            EngineConfig {
                house_edge_override: Some(-5.0),
                ..config()
            },
            stores,
        )
        .await;
        assert!(matches!(result, Err(EngineError::Settings(SettingsError::OutOfRange(_)))));
    }

    #[tokio::test]
    async fn test_open_account_uses_starting_balance() {
        let (stores, _) = stores(&[]);
        let engine = GameEngine::new(config(), stores).await.unwrap();
        assert_eq!(engine.open_account(player(4)).await.unwrap(), DEFAULT_STARTING_BALANCE);
        assert_eq!(engine.balance(player(4)).await.unwrap(), DEFAULT_STARTING_BALANCE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_round_refunds_pool() {
        let ledger = Arc::new(MemoryLedger::with_accounts([(player(1), 1000)]));
        let rounds = Arc::new(MemoryRoundStore::new());
        let settings = Arc::new(MemorySettings::default());
        let stores = Stores {
            ledger: ledger.clone(),
            rounds: rounds.clone(),
            settings: settings.clone(),
        };
        let engine = GameEngine::new(config(), stores).await.unwrap();
        let mut rx = engine.subscribe();
        engine.start().await.unwrap();

        engine.place_bet(player(1), Side::High, 200).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(engine.stop().await);

        assert_eq!(ledger.balance(player(1)).await.unwrap(), 1000);
        assert!(drain(&mut rx).contains(&RoundEvent::BalanceUpdateAll));

        let snapshot = engine.capture_snapshot(&ledger, &rounds, &settings).await;
        assert_eq!(snapshot.accounts, vec![(player(1), 1000)]);
        assert!(snapshot.wagers.is_empty());
        assert!(snapshot.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_mid_round_keeps_pending_stakes() {
        let ledger = Arc::new(MemoryLedger::with_accounts([(player(1), 1000)]));
        let rounds = Arc::new(MemoryRoundStore::new());
        let settings = Arc::new(MemorySettings::default());
        let stores = Stores {
            ledger: ledger.clone(),
            rounds: rounds.clone(),
            settings: settings.clone(),
        };
        let engine = GameEngine::new(config(), stores).await.unwrap();
        engine.start().await.unwrap();
        engine.place_bet(player(1), Side::Low, 300).await.unwrap();

        let snapshot = engine.capture_snapshot(&ledger, &rounds, &settings).await;
        assert_eq!(snapshot.accounts, vec![(player(1), 700)]);
        assert_eq!(snapshot.pending.len(), 1);

        let (restored, _, _) = snapshot.into_stores();
        assert_eq!(restored.balance(player(1)).await.unwrap(), 1000);
        engine.stop().await;
    }

    /// Ledger whose credits wait for a permit.
    struct GatedLedger {
        inner: Arc<MemoryLedger>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl BalanceLedger for GatedLedger {
        async fn balance(&self, player: PlayerId) -> Result<u64, StoreError> {
            self.inner.balance(player).await
        }

        async fn try_deduct(&self, player: PlayerId, amount: u64) -> Result<bool, StoreError> {
            self.inner.try_deduct(player, amount).await
        }

        async fn credit(&self, player: PlayerId, amount: u64) -> Result<u64, StoreError> {
            self.gate
                .acquire()
                .await
                .map_err(|_| StoreError::Unavailable("gate closed".into()))?
                .forget();
            self.inner.credit(player, amount).await
        }

        async fn open_account(&self, player: PlayerId, starting: u64) -> Result<u64, StoreError> {
            self.inner.open_account(player, starting).await
        }

        async fn set_balance(&self, player: PlayerId, amount: u64) -> Result<(), StoreError> {
            self.inner.set_balance(player, amount).await
        }

        async fn top_balances(&self, limit: usize) -> Result<Vec<(PlayerId, u64)>, StoreError> {
            self.inner.top_balances(limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_waits_for_settlement() {
        let inner = Arc::new(MemoryLedger::with_accounts([(player(1), 1000), (player(2), 1000)]));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let rounds = Arc::new(MemoryRoundStore::new());
        let settings = Arc::new(MemorySettings::default());
        let stores = Stores {
            ledger: Arc::new(GatedLedger { inner: inner.clone(), gate: gate.clone() }),
            rounds: rounds.clone(),
            settings: settings.clone(),
        };
        let engine = GameEngine::new(config(), stores).await.unwrap();
        engine.start().await.unwrap();

        // Opposite sides: exactly one winner, whose credit stalls the reveal
        engine.place_bet(player(1), Side::High, 200).await.unwrap();
        engine.place_bet(player(2), Side::Low, 200).await.unwrap();
        tokio::time::sleep(Duration::from_millis(22_500)).await;

        let capture = tokio::spawn({
            let engine = engine.clone();
            let (inner, rounds, settings) = (inner.clone(), rounds.clone(), settings.clone());
            async move { engine.capture_snapshot(&inner, &rounds, &settings).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!capture.is_finished());

        gate.add_permits(1);
        let snapshot = capture.await.unwrap();

        assert_eq!(snapshot.wagers.len(), 2);
        assert!(snapshot.wagers.iter().all(|w| w.win.is_some()));
        let total: u64 = snapshot.accounts.iter().map(|(_, coins)| coins).sum();
        assert_eq!(total, 2000);
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_start_stop_never_hangs() {
        let (stores, _) = stores(&[]);
        let engine = GameEngine::new(config(), stores).await.unwrap();

        for _ in 0..20 {
            let starter = tokio::spawn({
                let engine = engine.clone();
                async move { engine.start().await }
            });
            let stopper = tokio::spawn({
                let engine = engine.clone();
                async move { engine.stop().await }
            });

            tokio::time::timeout(Duration::from_secs(5), async {
                starter.await.unwrap().unwrap();
                stopper.await.unwrap();
            })
            .await
            .expect("start/stop deadlocked");
        }

        engine.stop().await;
        assert!(!engine.is_running());
        assert!(engine.start().await.is_ok());
        assert!(engine.is_running());
        assert!(engine.stop().await);
    }
}
