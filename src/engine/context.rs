use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{Context as AnyhowContext, Error};
use chrono::Utc;
use log::{info, warn};

use hawser_api::{
    config::Config,
    deployment::{DeploymentStatus, InstallOutcome, UpdateInfo},
    error::UpdateError,
};

use crate::{
    client::{auth::AuthHandle, auth::AuthManager, ApiClient},
    controlmap::{ControlAction, ControlMapPool},
    datastore::DataStore,
    deplog::DeploymentLogManager,
    device::Device,
    installer::PayloadInstaller,
    scripts::ScriptRunner,
};

/// How a cooperative wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed.
    Timeout,
    /// Woken early to proceed immediately.
    Woken,
    /// Cancelled; the state hands control back to the driver unchanged.
    Cancelled,
}

#[derive(Default)]
struct WaitFlags {
    wake: bool,
    cancel: bool,
}

struct WaitInner {
    flags: Mutex<WaitFlags>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// The shared wait/cancel capability every wait state blocks on. Cancel is
/// one-shot per wait; shutdown is sticky and cancels every future wait too.
#[derive(Clone)]
pub struct WaitSignal(Arc<WaitInner>);

impl Default for WaitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSignal {
    pub fn new() -> Self {
        Self(Arc::new(WaitInner {
            flags: Mutex::new(WaitFlags::default()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn wait(&self, duration: Duration) -> WaitOutcome {
        let deadline = Instant::now() + duration;
        let mut flags = self.0.flags.lock().unwrap();
        loop {
            if self.0.shutdown.load(Ordering::SeqCst) || flags.cancel {
                flags.cancel = false;
                return WaitOutcome::Cancelled;
            }
            if flags.wake {
                flags.wake = false;
                return WaitOutcome::Woken;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Timeout;
            }
            let (guard, _) = self
                .0
                .cv
                .wait_timeout(flags, deadline - now)
                .unwrap();
            flags = guard;
        }
    }

    /// Wake the current wait so its state proceeds immediately.
    pub fn wake(&self) {
        self.0.flags.lock().unwrap().wake = true;
        self.0.cv.notify_all();
    }

    /// Cancel the current wait; the state is re-entered by the driver.
    pub fn cancel(&self) {
        self.0.flags.lock().unwrap().cancel = true;
        self.0.cv.notify_all();
    }

    /// Sticky cancel used for SIGTERM: every wait from now on cancels.
    pub fn shutdown(&self) {
        self.0.shutdown.store(true, Ordering::SeqCst);
        self.0.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.shutdown.load(Ordering::SeqCst)
    }
}

/// Per-deployment bookkeeping the driver keeps outside the persisted
/// snapshot; reconstructed from the resume state after a restart.
#[derive(Debug, Default)]
pub struct DeploymentTracker {
    /// ArtifactInstall (scripts or callouts) has begun; a failure from here
    /// on leaves the device in an undefined state unless rolled back.
    pub install_started: bool,
    pub rollback_attempted: bool,
    /// Rollback ran to a verified end; the old artifact is authoritative.
    pub rollback_succeeded: bool,
    /// Last status the server acknowledged, for suppressing duplicates.
    pub last_reported: Option<DeploymentStatus>,
    /// Terminal verdict, decided by cleanup.
    pub outcome: Option<InstallOutcome>,
}

/// What a control-map gate decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Proceed,
    Fail,
    Cancelled,
}

/// Everything the states operate on. Owned by the driver; states receive a
/// mutable reference for the duration of one `handle` and hold no
/// back-pointers of their own.
pub struct StateContext {
    pub config: Config,
    pub store: DataStore,
    pub api: ApiClient,
    pub auth: AuthHandle,
    pub device: Device,
    pub scripts: ScriptRunner,
    pub control_maps: ControlMapPool,
    pub deplog: DeploymentLogManager,
    pub installers: Vec<Box<dyn PayloadInstaller>>,
    pub tracker: DeploymentTracker,
    pub wait: WaitSignal,
}

impl StateContext {
    pub fn new(config: Config) -> Result<Self, Error> {
        let store = DataStore::open(&config.datastore_path)?;
        let device = Device::new(&config);
        let device_type = device
            .device_type()
            .context("Cannot run without a device type")?;
        let api = ApiClient::new(&config)?;
        let auth = AuthManager::spawn(&config, &device_type)?;
        let scripts = ScriptRunner::new(&config);
        // Control maps outlive at least two poll rounds, and never less
        // than the post-reboot grace the server expects devices to get.
        let control_maps = ControlMapPool::new(
            (config.update_poll_interval() * 2).max(Duration::from_secs(600)),
            Duration::from_secs(600),
        );
        let deplog = DeploymentLogManager::new(&config.deployment_log_path);

        Ok(Self {
            config,
            store,
            api,
            auth,
            device,
            scripts,
            control_maps,
            deplog,
            installers: Vec::new(),
            tracker: DeploymentTracker::default(),
            wait: WaitSignal::new(),
        })
    }

    /// Reports a deployment status, re-authorizing once on a 401 and
    /// suppressing a repeat of the last acknowledged status.
    pub fn report_status(
        &mut self,
        update: &UpdateInfo,
        status: DeploymentStatus,
    ) -> Result<(), UpdateError> {
        if self.tracker.last_reported == Some(status) {
            return Ok(());
        }

        if let Err(e) = self.api.report_status(&update.id, status) {
            match e {
                crate::client::ApiError::Unauthorized => {
                    info!("Status report rejected, re-authorizing");
                    let token = self
                        .auth
                        .fetch_token()
                        .map_err(UpdateError::transient)?;
                    self.api.set_token(Some(token));
                    self.api
                        .report_status(&update.id, status)
                        .map_err(UpdateError::from)?;
                }
                e => return Err(e.into()),
            }
        }

        self.tracker.last_reported = Some(status);
        self.deplog
            .record(log::Level::Info, format!("Deployment status '{status}' reported"));
        Ok(())
    }

    /// Consults the control maps before a gated phase, honoring a pause
    /// until the map allows continuing or expires.
    pub fn gate(&mut self, update: &UpdateInfo, gate: &str) -> GateVerdict {
        loop {
            match self.control_maps.query(&update.id, gate) {
                ControlAction::Continue | ControlAction::ForceContinue => {
                    return GateVerdict::Proceed
                }
                ControlAction::Fail => {
                    warn!("Control map failed the deployment at '{gate}'");
                    return GateVerdict::Fail;
                }
                ControlAction::Pause => {
                    let until_expiry = self
                        .control_maps
                        .next_expiration(&update.id)
                        .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::ZERO);
                    let nap = until_expiry
                        .min(self.config.retry_poll_interval())
                        .max(Duration::from_millis(100));

                    info!("Deployment paused by control map at '{gate}', waiting {nap:?}");
                    if self.wait.wait(nap) == WaitOutcome::Cancelled {
                        return GateVerdict::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let signal = WaitSignal::new();
        let started = Instant::now();
        assert_eq!(
            signal.wait(Duration::from_millis(50)),
            WaitOutcome::Timeout
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wake_and_cancel() {
        let signal = WaitSignal::new();

        let waker = signal.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        assert_eq!(signal.wait(Duration::from_secs(30)), WaitOutcome::Woken);

        let canceller = signal.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert_eq!(
            signal.wait(Duration::from_secs(30)),
            WaitOutcome::Cancelled
        );

        // Both are one-shot.
        assert_eq!(
            signal.wait(Duration::from_millis(20)),
            WaitOutcome::Timeout
        );
    }

    #[test]
    fn test_shutdown_is_sticky() {
        let signal = WaitSignal::new();
        signal.shutdown();
        assert!(signal.is_shutdown());
        assert_eq!(
            signal.wait(Duration::from_secs(30)),
            WaitOutcome::Cancelled
        );
        assert_eq!(
            signal.wait(Duration::from_secs(30)),
            WaitOutcome::Cancelled
        );
    }
}
