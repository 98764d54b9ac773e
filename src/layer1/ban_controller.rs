// Ban Controller - process-wide REST throttle shared by all product workers
// Ban window, rate-limit cool-down, global subscribe pacing and retry sweeps

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::ThrottleConfig;
use crate::core::types::now_millis;
use crate::layer1::rest_client::SnapshotError;

/// Shared ban state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanWindow {
    pub active: bool,
    /// Wall-clock millis the exchange named, if any
    pub until_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    Initial,
    Unban,
    Manual,
}

/// Batch of errored products to resubscribe, each exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySweep {
    pub reason: SweepReason,
    pub products: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BanControllerStats {
    pub admitted: u64,
    pub rejected: u64,
    pub paced: u64,
    pub bans: u64,
    pub sweeps: u64,
}

impl fmt::Display for BanControllerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BanControllerStats(admitted={}, rejected={}, paced={}, bans={}, sweeps={})",
            self.admitted, self.rejected, self.paced, self.bans, self.sweeps
        )
    }
}

pub struct BanController {
    window: RwLock<BanWindow>,
    errored: Mutex<BTreeSet<String>>,

    /// Global subscribe attempt counter; held across the pacing delay
    attempts: AsyncMutex<u64>,
    unban_task: Mutex<Option<JoinHandle<()>>>,
    sweep_tx: mpsc::UnboundedSender<RetrySweep>,

    pacing_every: u64,
    pacing_delay: Duration,
    rate_limit_cooldown: Duration,

    stats: RwLock<BanControllerStats>,
}

impl BanController {
    pub fn new(config: &ThrottleConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<RetrySweep>) {
        let (sweep_tx, sweep_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(Self {
            window: RwLock::new(BanWindow::default()),
            errored: Mutex::new(BTreeSet::new()),
            attempts: AsyncMutex::new(0),
            unban_task: Mutex::new(None),
            sweep_tx,
            pacing_every: config.pacing_every,
            pacing_delay: config.pacing_delay(),
            rate_limit_cooldown: config.rate_limit_cooldown(),
            stats: RwLock::new(BanControllerStats::default()),
        });

        (controller, sweep_rx)
    }

    pub fn is_banned(&self) -> bool {
        self.window.read().active
    }

    pub fn ban_window(&self) -> BanWindow {
        self.window.read().clone()
    }

    /// Gate one subscribe attempt. Returns false (and marks the product
    /// errored) while a ban is in force.
    pub async fn admit(&self, product: &str) -> bool {
        if self.reject_if_banned(product) {
            return false;
        }

        {
            let mut attempts = self.attempts.lock().await;
            *attempts += 1;
            if self.pacing_every > 0 && *attempts % self.pacing_every == 0 {
                debug!(product = product, attempt = *attempts, delay_ms = self.pacing_delay.as_millis() as u64, "Pacing subscribe attempt");
                self.stats.write().paced += 1;
                tokio::time::sleep(self.pacing_delay).await;
            }
        }

        if self.reject_if_banned(product) {
            return false;
        }

        self.stats.write().admitted += 1;
        true
    }

    fn reject_if_banned(&self, product: &str) -> bool {
        let window = self.ban_window();
        if !window.active {
            return false;
        }
        warn!(product = product, until_ms = ?window.until_ms, "Client is banned, subscribe rejected");
        self.stats.write().rejected += 1;
        self.mark_errored(product);
        true
    }

    /// Route a snapshot failure. The product is always marked errored;
    /// ban and rate-limit signals additionally open the ban window.
    pub fn report_failure(self: &Arc<Self>, product: &str, error: &SnapshotError) {
        self.mark_errored(product);

        match error {
            SnapshotError::Banned { until_ms: Some(until_ms) } => {
                let delay = Duration::from_millis(until_ms.saturating_sub(now_millis()));
                warn!(product = product, until_ms = *until_ms, "IP banned by exchange");
                self.impose_ban(Some(*until_ms), delay);
            }
            SnapshotError::Banned { until_ms: None } => {
                warn!(product = product, cooldown_secs = self.rate_limit_cooldown.as_secs(), "IP banned without end time, cooling down");
                self.impose_ban(None, self.rate_limit_cooldown);
            }
            SnapshotError::RateLimited { retry_after } => {
                let delay = retry_after.unwrap_or(self.rate_limit_cooldown);
                warn!(product = product, delay_secs = delay.as_secs(), "Too many requests, cooling down");
                self.impose_ban(None, delay);
            }
            other => {
                debug!(product = product, error = %other, "Snapshot failure marked for retry");
            }
        }
    }

    /// Open the ban window and schedule its end, replacing any earlier schedule
    pub fn impose_ban(self: &Arc<Self>, until_ms: Option<u64>, delay: Duration) {
        {
            let mut window = self.window.write();
            window.active = true;
            window.until_ms = until_ms;
        }
        self.stats.write().bans += 1;

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = weak.upgrade() {
                controller.lift_ban();
            }
        });

        if let Some(previous) = self.unban_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Clear the ban window and sweep every errored product
    pub fn lift_ban(&self) {
        {
            let mut window = self.window.write();
            if !window.active {
                return;
            }
            *window = BanWindow::default();
        }
        self.unban_task.lock().take();

        info!("Ban lifted, retrying errored products");
        self.sweep_errored(SweepReason::Unban);
    }

    pub fn mark_errored(&self, product: &str) {
        if self.errored.lock().insert(product.to_string()) {
            debug!(product = product, "Product marked errored");
        }
    }

    pub fn clear_errored(&self, product: &str) {
        self.errored.lock().remove(product);
    }

    pub fn errored_products(&self) -> Vec<String> {
        self.errored.lock().iter().cloned().collect()
    }

    /// Drain the errored set into one retry sweep. Returns the number of
    /// products handed out.
    pub fn sweep_errored(&self, reason: SweepReason) -> usize {
        let products: Vec<String> = std::mem::take(&mut *self.errored.lock()).into_iter().collect();
        if products.is_empty() {
            debug!(reason = ?reason, "No errored products to retry");
            return 0;
        }

        let count = products.len();
        info!(reason = ?reason, count = count, products = ?products, "Retry sweep");
        self.stats.write().sweeps += 1;

        if self.sweep_tx.send(RetrySweep { reason, products: products.clone() }).is_err() {
            // Nobody listens any more; keep them for a later manual sweep
            self.errored.lock().extend(products);
            return 0;
        }
        count
    }

    pub fn get_stats(&self) -> BanControllerStats {
        self.stats.read().clone()
    }
}

impl Drop for BanController {
    fn drop(&mut self) {
        if let Some(handle) = self.unban_task.lock().take() {
            handle.abort();
        }
    }
}
