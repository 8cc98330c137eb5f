// =============================================================================
// Locked engine defaults
// =============================================================================
//
// Every threshold the engine trades against lives here. None of these are
// operator-tunable at runtime; anything an operator may change goes through
// the signed config manifest instead.
// =============================================================================

// ── Categories ───────────────────────────────────────────────────────────────
pub const ALLOWLIST_CATEGORIES: [&str; 3] = ["geopolitics", "economics", "tech/ai"];
pub const DENYLIST_CATEGORIES: [&str; 1] = ["sports"];

// ── Risk limits (fraction-of-wallet) ─────────────────────────────────────────
pub const DAILY_STOP_LOSS_PCT: f64 = 0.03;
pub const MAX_PER_MARKET_PCT: f64 = 0.02;
pub const MAX_TOTAL_EXPOSURE_PCT: f64 = 0.10;
pub const MAX_OPEN_POSITIONS: usize = 5;

// ── AI budget ────────────────────────────────────────────────────────────────
pub const AI_CAP_USD_USER: f64 = 2.00;
pub const AI_CAP_PCT_PER_DAY: f64 = 0.005;
pub const AI_WINDOW_SEC: i64 = 600;
pub const AI_WINDOW_CAP_PCT_OF_DAILY: f64 = 0.20;
pub const AI_ANALYSES_PER_DAY_HARD_CAP: usize = 100;

// ── Paper trading ────────────────────────────────────────────────────────────
pub const PAPER_FEE_MULTIPLIER: f64 = 2.0;
pub const PAPER_MIN_FEE_BPS: f64 = 10.0;
pub const PAPER_FILL_TICK: f64 = 0.01;
pub const PAPER_FILL_SUSTAIN_SEC: i64 = 3;

// ── Watchlist and throughput caps ────────────────────────────────────────────
pub const WATCHLIST_MAX: usize = 200;
pub const PROBATION_MAX: usize = 50;
pub const CANDIDATES_PER_MIN_MAX: usize = 50;
pub const PER_MARKET_CANDIDATES_PER_MIN_MAX: usize = 10;
pub const EVIDENCE_FETCHES_PER_HOUR_MAX: usize = 60;

// ── Loop cadences and freshness ──────────────────────────────────────────────
pub const FAST_LOOP_SEC: u64 = 2;
pub const WS_HEARTBEAT_SEC: i64 = 10;
pub const MAX_SNAPSHOT_AGE_DECISION_SEC: i64 = 6;
pub const MAX_SNAPSHOT_AGE_EXEC_SEC: i64 = 3;
pub const MAX_DECISION_TO_EXEC_DELAY_SEC: i64 = 8;
pub const CANDIDATE_MAX_AGE_SEC: i64 = 120;

// Trigger persistence (anti-spoof). These interlock: tuning one without the
// others weakens the spoof resistance, so none are config-governed.
pub const TRIGGER_PERSIST_UPDATES: u32 = 3;
pub const TRIGGER_PERSIST_MIN_SEC: i64 = 6;
pub const TRIGGER_MID_MOVE_ABS: f64 = 0.01;
pub const TRIGGER_SPREAD_CHANGE_ABS: f64 = 0.005;
pub const TRIGGER_DEPTH_DROP_RATIO: f64 = 0.7;

// ── Execution guardrails ─────────────────────────────────────────────────────
pub const RECONCILE_HEARTBEAT_SEC: i64 = 60;
pub const MIN_RECONCILE_THRESHOLD_USD: f64 = 1.00;

// Locks
pub const LOCK_TTL_SEC: i64 = 60;
pub const LOCK_STEAL_GRACE_SEC: i64 = 5;
pub const MIN_LOCK_TTL_BEFORE_SUBMIT_SEC: i64 = 10;

// ── Arming ───────────────────────────────────────────────────────────────────
pub const ARMING_NONCE1_TTL_SEC: i64 = 120;
pub const ARMING_FILE_MAX_AGE_SEC: i64 = 900;
pub const TOTP_REPLAY_BLOCK_SEC: i64 = 60;

// ── Market quality thresholds ────────────────────────────────────────────────
pub const TIME_TO_RESOLUTION_MIN_SEC: i64 = 3600;
pub const TIME_TO_RESOLUTION_MAX_SEC: i64 = 90 * 86_400;
pub const MIN_VOLUME_24H_USD: f64 = 500.0;
pub const MIN_LIQUIDITY_USD: f64 = 1000.0;
pub const MAX_SPREAD_ABS: f64 = 0.03;
pub const MIN_DEPTH_USD_NEAR_TOP: f64 = 50.0;
pub const BOOK_LEVELS_REQUIRED: usize = 3;

// Binary consistency anomaly
pub const ASK_SUM_LOW: f64 = 0.98;
pub const ASK_SUM_HIGH: f64 = 2.00;

// ── Calibration + trust ──────────────────────────────────────────────────────
pub const W_AI_MAX: f64 = 0.35;
pub const N_RESOLVED_MIN: usize = 50;
pub const DELTA_MAX_DEFAULT: f64 = 0.10;
pub const DELTA_MAX_HIGH_DISPUTE: f64 = 0.05;
pub const P_EFF_OUTLIER_THRESHOLD: f64 = 0.20;

// ── Decision engine ──────────────────────────────────────────────────────────
pub const EV_MIN: f64 = 0.01;

// ── Wallet freshness ─────────────────────────────────────────────────────────
pub const WALLET_STALE_SEC: i64 = 3600;

// ── Alerting ─────────────────────────────────────────────────────────────────
pub const ALERT_DEDUP_SEC: i64 = 300;
