//! Engine instance lifecycle.
//!
//! An [`EngineInstance`] owns one hosted engine session and walks it through
//!
//! ```text
//! Uninitialized -> Launching -> Ready <-> Busy
//!                                 |
//!                                 v
//!                              Closed
//! ```
//!
//! The engine is single-threaded and stateful, so every call goes through a
//! per-instance async mutex: commands run one at a time, in submission order.
//! A caller that needs several commands without interleaving (the frame
//! capture driver) takes an [`EngineSession`] and keeps it for the sequence.
//!
//! `cleanup` raises a shutdown signal before taking the lock, so an
//! operation that is stuck inside the engine fails with a connection error
//! instead of holding teardown hostage.

use crate::config::EngineConfig;
use crate::driver::{EngineDriver, EngineLauncher, Readiness};
use crate::frame::{strip_data_url, RasterImage, RasterOptions};
use crate::result::{VizhostError, VizhostResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque instance identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InstanceState {
    /// Created, never launched (or last launch failed)
    Uninitialized = 0,
    /// Launch and readiness handshake in progress
    Launching = 1,
    /// Accepting operations
    Ready = 2,
    /// One operation in flight
    Busy = 3,
    /// Released; terminal
    Closed = 4,
}

impl InstanceState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Launching,
            2 => Self::Ready,
            3 => Self::Busy,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Launching => "launching",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Best-effort description of one engine object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object label
    pub name: String,
    /// Engine object type ("numeric", "point", "function", ...)
    pub object_type: String,
    /// Numeric value, when the object has one
    pub value: Option<f64>,
    /// Value as the engine prints it
    pub value_string: String,
    /// Defining command
    pub command: String,
    /// Whether the object is shown
    pub visible: bool,
    /// Colour as `#RRGGBB`
    pub color: String,
}

struct Core {
    driver: Option<Box<dyn EngineDriver>>,
}

/// One hosted engine session
pub struct EngineInstance {
    id: InstanceId,
    config: EngineConfig,
    launcher: Arc<dyn EngineLauncher>,
    core: Mutex<Core>,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    created_at: Instant,
    last_activity: std::sync::Mutex<Instant>,
}

impl fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("launcher", &self.launcher.name())
            .finish_non_exhaustive()
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the instance itself is gone; treat as shutdown.
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn poll_until_ready(driver: &dyn EngineDriver, interval: Duration, last: &mut Readiness) {
    loop {
        match driver.readiness().await {
            Ok(readiness) if readiness.is_ready() => {
                *last = readiness;
                return;
            }
            Ok(readiness) => {
                debug!(missing = readiness.missing(), "engine not ready yet");
                *last = readiness;
            }
            Err(e) => debug!(error = %e, "readiness poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

enum Handshake {
    Ready,
    TimedOut,
    ShutDown,
}

/// Minimal valid SVG used when the engine produces no vector output
#[must_use]
pub fn placeholder_svg(width: u32, height: u32) -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}"></svg>"#
    )
}

impl EngineInstance {
    /// Create an uninitialized instance
    #[must_use]
    pub fn new(config: EngineConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let now = Instant::now();
        Self {
            id: InstanceId::new(),
            config,
            launcher,
            core: Mutex::new(Core { driver: None }),
            state: AtomicU8::new(InstanceState::Uninitialized as u8),
            shutdown,
            created_at: now,
            last_activity: std::sync::Mutex::new(now),
        }
    }

    /// Instance id
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    /// Creation configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Ready or serving an operation
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), InstanceState::Ready | InstanceState::Busy)
    }

    /// Time since creation
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last completed operation
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: InstanceState, to: InstanceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn not_ready_error(&self) -> VizhostError {
        let reason = match self.state() {
            InstanceState::Closed => "is closed",
            InstanceState::Busy => "is busy",
            InstanceState::Launching => "is still starting",
            InstanceState::Uninitialized | InstanceState::Ready => "is not initialized",
        };
        VizhostError::connection(format!("instance {} {reason}", self.id))
    }

    /// Launch the hosting runtime and run the readiness handshake.
    ///
    /// Headless mode and extra launch arguments come from the instance's
    /// [`EngineConfig`]. The handshake polls until the engine has both
    /// raised its readiness flag and answered a functional probe; a flag
    /// alone is not enough. The whole sequence is bounded by
    /// `startup_timeout_ms`; on failure any launched process is closed and
    /// the instance returns to `Uninitialized`.
    ///
    /// Calling this on a Ready instance is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the launch fails, the handshake times out, or
    /// the instance is closed
    #[tracing::instrument(skip(self), fields(instance = %self.id, launcher = self.launcher.name()))]
    pub async fn initialize(&self) -> VizhostResult<()> {
        let mut core = self.core.lock().await;
        match self.state() {
            InstanceState::Ready | InstanceState::Busy => return Ok(()),
            InstanceState::Closed => return Err(self.not_ready_error()),
            InstanceState::Uninitialized | InstanceState::Launching => {}
        }

        self.set_state(InstanceState::Launching);
        let started = Instant::now();
        match self.launch_and_handshake().await {
            Ok(driver) => {
                core.driver = Some(driver);
                if self.transition(InstanceState::Launching, InstanceState::Ready) {
                    self.touch();
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "engine instance ready");
                    Ok(())
                } else {
                    // cleanup() won the race; release what we just launched.
                    if let Some(mut driver) = core.driver.take() {
                        if let Err(e) = driver.close().await {
                            warn!(error = %e, "failed to release driver after concurrent cleanup");
                        }
                    }
                    Err(self.not_ready_error())
                }
            }
            Err(e) => {
                let _ = self.transition(InstanceState::Launching, InstanceState::Uninitialized);
                warn!(error = %e, "engine instance failed to start");
                Err(e)
            }
        }
    }

    async fn launch_and_handshake(&self) -> VizhostResult<Box<dyn EngineDriver>> {
        let budget = self.config.startup_timeout();
        let budget_ms = self.config.startup_timeout_ms;
        let deadline = tokio::time::Instant::now() + budget;
        let mut shutdown = self.shutdown.subscribe();

        let launched = tokio::select! {
            r = tokio::time::timeout_at(deadline, self.launcher.launch(&self.config)) => r,
            () = wait_for_shutdown(&mut shutdown) => {
                return Err(VizhostError::connection("instance closed during launch"));
            }
        };
        let mut driver = match launched {
            Ok(Ok(driver)) => driver,
            Ok(Err(e)) => return Err(VizhostError::connection(format!("engine launch failed: {e}"))),
            Err(_) => {
                return Err(VizhostError::connection(format!(
                    "engine launch did not finish within {budget_ms}ms"
                )))
            }
        };

        let mut last = Readiness::default();
        let outcome = tokio::select! {
            r = tokio::time::timeout_at(
                deadline,
                poll_until_ready(&*driver, self.config.poll_interval(), &mut last),
            ) => if r.is_ok() { Handshake::Ready } else { Handshake::TimedOut },
            () = wait_for_shutdown(&mut shutdown) => Handshake::ShutDown,
        };

        let error = match outcome {
            Handshake::Ready => return Ok(driver),
            Handshake::TimedOut => VizhostError::connection(format!(
                "readiness handshake timed out after {budget_ms}ms ({})",
                last.missing()
            )),
            Handshake::ShutDown => VizhostError::connection("instance closed during handshake"),
        };

        if let Err(e) = driver.close().await {
            warn!(error = %e, "failed to release partially launched engine");
        }
        Err(error)
    }

    /// Take exclusive use of the instance for a sequence of operations.
    ///
    /// Other callers queue behind the session until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the instance is not Ready or closes while waiting
    pub async fn session(&self) -> VizhostResult<EngineSession<'_>> {
        let mut shutdown = self.shutdown.subscribe();
        let core = tokio::select! {
            guard = self.core.lock() => guard,
            () = wait_for_shutdown(&mut shutdown) => return Err(self.not_ready_error()),
        };
        if core.driver.is_none() || !matches!(self.state(), InstanceState::Ready) {
            return Err(self.not_ready_error());
        }
        Ok(EngineSession {
            instance: self,
            core,
        })
    }

    /// Release the page and the hosting process. Idempotent.
    ///
    /// Release failures are logged, never returned. In-flight operations
    /// fail with `Connection`.
    #[tracing::instrument(skip(self), fields(instance = %self.id))]
    pub async fn cleanup(&self) {
        self.shutdown.send_replace(true);
        let previous = InstanceState::from_u8(
            self.state
                .swap(InstanceState::Closed as u8, Ordering::SeqCst),
        );

        let mut core = self.core.lock().await;
        if let Some(mut driver) = core.driver.take() {
            if let Err(e) = driver.close().await {
                warn!(error = %e, "error while releasing engine driver");
            }
            info!(%previous, "engine instance closed");
        }
    }

    /// Run one command. See [`EngineSession::eval_command`].
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn eval_command(&self, command: &str) -> VizhostResult<Value> {
        self.session().await?.eval_command(command).await
    }

    /// Best-effort existence check. See [`EngineSession::exists`].
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn exists(&self, name: &str) -> VizhostResult<bool> {
        self.session().await?.exists(name).await
    }

    /// Best-effort definedness check.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn is_defined(&self, name: &str) -> VizhostResult<bool> {
        self.session().await?.is_defined(name).await
    }

    /// Best-effort object description.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn object_info(&self, name: &str) -> VizhostResult<Option<ObjectInfo>> {
        self.session().await?.object_info(name).await
    }

    /// Set a numeric object's value.
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_value(&self, name: &str, value: f64) -> VizhostResult<()> {
        self.session().await?.set_value(name, value).await
    }

    /// Toggle animation on an object.
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_animating(&self, name: &str, animating: bool) -> VizhostResult<()> {
        self.session().await?.set_animating(name, animating).await
    }

    /// Start the engine's own animation clock.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn start_animation(&self) -> VizhostResult<()> {
        self.session().await?.start_animation().await
    }

    /// Stop the engine's own animation clock.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn stop_animation(&self) -> VizhostResult<()> {
        self.session().await?.stop_animation().await
    }

    /// Whether the engine's animation clock is running.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn is_animation_running(&self) -> VizhostResult<bool> {
        self.session().await?.is_animation_running().await
    }

    /// Toggle tracing on an object.
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_trace(&self, name: &str, trace: bool) -> VizhostResult<()> {
        self.session().await?.set_trace(name, trace).await
    }

    /// Raster export. See [`EngineSession::export_raster`].
    ///
    /// # Errors
    ///
    /// `Export` if no signature yields an image, `Connection`, `Timeout`
    pub async fn export_raster(&self, options: RasterOptions) -> VizhostResult<RasterImage> {
        self.session().await?.export_raster(options).await
    }

    /// Vector export. See [`EngineSession::export_vector`].
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn export_vector(&self) -> VizhostResult<String> {
        self.session().await?.export_vector().await
    }
}

/// Returns a Busy instance to Ready when the operation ends, including when
/// the caller drops the operation's future.
struct BusyGuard<'a>(&'a EngineInstance);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        // A concurrent cleanup has already moved the state to Closed.
        let _ = self.0.transition(InstanceState::Busy, InstanceState::Ready);
        self.0.touch();
    }
}

/// Exclusive access to a Ready instance
pub struct EngineSession<'a> {
    instance: &'a EngineInstance,
    core: MutexGuard<'a, Core>,
}

impl fmt::Debug for EngineSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("instance", &self.instance.id)
            .finish_non_exhaustive()
    }
}

impl EngineSession<'_> {
    /// The instance this session holds
    #[must_use]
    pub const fn instance(&self) -> &EngineInstance {
        self.instance
    }

    async fn guarded<T, F>(&self, operation: &str, budget: Duration, fut: F) -> VizhostResult<T>
    where
        F: Future<Output = VizhostResult<T>>,
    {
        let instance = self.instance;
        if !instance.transition(InstanceState::Ready, InstanceState::Busy) {
            return Err(instance.not_ready_error());
        }
        let _busy = BusyGuard(instance);

        let mut shutdown = instance.shutdown.subscribe();
        let result = tokio::select! {
            r = tokio::time::timeout(budget, fut) => r.unwrap_or_else(|_| {
                Err(VizhostError::timeout(operation, budget.as_millis() as u64))
            }),
            () = wait_for_shutdown(&mut shutdown) => Err(VizhostError::connection(format!(
                "instance {} closed during {operation}",
                instance.id
            ))),
        };
        result
    }

    fn driver(&self) -> VizhostResult<&dyn EngineDriver> {
        self.core
            .driver
            .as_deref()
            .ok_or_else(|| self.instance.not_ready_error())
    }

    /// Raw applet call under the command budget
    ///
    /// # Errors
    ///
    /// `Script` for engine exceptions, `Connection`, `Timeout`
    pub async fn call(&self, method: &str, args: &[Value]) -> VizhostResult<Value> {
        let driver = self.driver()?;
        self.guarded(method, self.instance.config.command_timeout(), driver.call(method, args))
            .await
    }

    async fn export_call(&self, method: &str, args: &[Value]) -> VizhostResult<Value> {
        let driver = self.driver()?;
        self.guarded(method, self.instance.config.export_timeout(), driver.call(method, args))
            .await
    }

    /// Mutating call: script errors become command errors naming the call
    async fn mutate(&self, method: &str, args: &[Value]) -> VizhostResult<()> {
        match self.call(method, args).await {
            Ok(_) => Ok(()),
            Err(VizhostError::Script { message }) => {
                let rendered = format!(
                    "{method}({})",
                    args.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
                );
                Err(VizhostError::command(rendered, message))
            }
            Err(e) => Err(e),
        }
    }

    /// Introspection call: script errors are treated as "no answer"
    async fn introspect(&self, method: &str, name: &str) -> VizhostResult<Value> {
        match self.call(method, &[json!(name)]).await {
            Err(VizhostError::Script { message }) => {
                debug!(method, name, %message, "introspection call failed");
                Ok(Value::Null)
            }
            other => other,
        }
    }

    /// Send one textual command to the engine.
    ///
    /// A `false` answer or a thrown exception becomes
    /// `VizhostError::Command` carrying the command verbatim. The instance
    /// stays Ready either way.
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn eval_command(&self, command: &str) -> VizhostResult<Value> {
        debug!(instance = %self.instance.id, command, "evalCommand");
        match self.call("evalCommand", &[json!(command)]).await {
            Ok(Value::Bool(false)) => Err(VizhostError::command(
                command,
                "engine rejected the command",
            )),
            Ok(value) => Ok(value),
            Err(VizhostError::Script { message }) => Err(VizhostError::command(command, message)),
            Err(e) => Err(e),
        }
    }

    /// Whether `name` exists.
    ///
    /// Not authoritative: headless builds may answer `false` for objects
    /// that exist. Never gate correctness on a negative answer.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn exists(&self, name: &str) -> VizhostResult<bool> {
        Ok(self.introspect("exists", name).await?.as_bool().unwrap_or(false))
    }

    /// Whether `name` is defined. Same caveats as [`Self::exists`].
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn is_defined(&self, name: &str) -> VizhostResult<bool> {
        Ok(self
            .introspect("isDefined", name)
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    /// Describe an object, or `None` if the engine gives no answer.
    ///
    /// `None` does not prove the object is absent.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn object_info(&self, name: &str) -> VizhostResult<Option<ObjectInfo>> {
        let object_type = self
            .introspect("getObjectType", name)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        if object_type.is_empty() {
            return Ok(None);
        }

        let value_string = self
            .introspect("getValueString", name)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let value = if matches!(object_type.as_str(), "numeric" | "angle" | "boolean") {
            self.introspect("getValue", name).await?.as_f64()
        } else {
            None
        };
        let command = self
            .introspect("getCommandString", name)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let visible = self
            .introspect("getVisible", name)
            .await?
            .as_bool()
            .unwrap_or(false);
        let color = self
            .introspect("getColor", name)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(Some(ObjectInfo {
            name: name.to_string(),
            object_type,
            value,
            value_string,
            command,
            visible,
            color,
        }))
    }

    /// All object labels the engine reports (best effort, may be empty)
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn object_names(&self) -> VizhostResult<Vec<String>> {
        let names = match self.call("getAllObjectNames", &[]).await {
            Err(VizhostError::Script { .. }) => Value::Null,
            other => other?,
        };
        Ok(serde_json::from_value(names).unwrap_or_default())
    }

    /// Numeric value of an object (0 when undefined, as the engine reports)
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn get_value(&self, name: &str) -> VizhostResult<f64> {
        Ok(self.introspect("getValue", name).await?.as_f64().unwrap_or(0.0))
    }

    /// Set a numeric object's value
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_value(&self, name: &str, value: f64) -> VizhostResult<()> {
        self.mutate("setValue", &[json!(name), json!(value)]).await
    }

    /// Toggle animation on an object
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_animating(&self, name: &str, animating: bool) -> VizhostResult<()> {
        self.mutate("setAnimating", &[json!(name), json!(animating)])
            .await
    }

    /// Start the engine's animation clock
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn start_animation(&self) -> VizhostResult<()> {
        self.mutate("startAnimation", &[]).await
    }

    /// Stop the engine's animation clock
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn stop_animation(&self) -> VizhostResult<()> {
        self.mutate("stopAnimation", &[]).await
    }

    /// Whether the engine's animation clock is running
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn is_animation_running(&self) -> VizhostResult<bool> {
        Ok(self
            .call("isAnimationRunning", &[])
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    /// Toggle tracing on an object
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_trace(&self, name: &str, trace: bool) -> VizhostResult<()> {
        self.mutate("setTrace", &[json!(name), json!(trace)]).await
    }

    /// Set the visible region of the graphics view
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_coord_system(
        &self,
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
    ) -> VizhostResult<()> {
        self.mutate(
            "setCoordSystem",
            &[json!(xmin), json!(xmax), json!(ymin), json!(ymax)],
        )
        .await
    }

    /// Show or hide the axes
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_axes_visible(&self, x_axis: bool, y_axis: bool) -> VizhostResult<()> {
        self.mutate("setAxesVisible", &[json!(x_axis), json!(y_axis)])
            .await
    }

    /// Show or hide the grid
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn set_grid_visible(&self, visible: bool) -> VizhostResult<()> {
        self.mutate("setGridVisible", &[json!(visible)]).await
    }

    /// Delete an object
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn delete_object(&self, name: &str) -> VizhostResult<()> {
        self.mutate("deleteObject", &[json!(name)]).await
    }

    /// Clear the construction
    ///
    /// # Errors
    ///
    /// `Command` on rejection, `Connection` if not Ready, `Timeout`
    pub async fn reset_construction(&self) -> VizhostResult<()> {
        self.mutate("newConstruction", &[]).await
    }

    /// Canvas size, falling back to the configured viewport when the page
    /// cannot report one
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn canvas_size(&self) -> VizhostResult<(u32, u32)> {
        let driver = self.driver()?;
        let config = &self.instance.config;
        let measured = self
            .guarded("canvasSize", config.command_timeout(), driver.canvas_size())
            .await?;
        Ok(measured.unwrap_or((config.viewport_width, config.viewport_height)))
    }

    /// Export the graphics view as PNG.
    ///
    /// With an explicit width/height the scale is derived from the current
    /// canvas size. Engine builds disagree on the `getPNGBase64` signature,
    /// so the longest form is tried first and shorter ones after it.
    ///
    /// # Errors
    ///
    /// `Export` if no signature yields an image, `Connection`, `Timeout`
    pub async fn export_raster(&self, options: RasterOptions) -> VizhostResult<RasterImage> {
        let canvas = if options.width.is_some() || options.height.is_some() {
            self.canvas_size().await?
        } else {
            (
                self.instance.config.viewport_width,
                self.instance.config.viewport_height,
            )
        };
        let scale = options.effective_scale(canvas);
        let full = [
            json!(scale),
            json!(options.transparent),
            json!(options.dpi),
            json!(false),
            json!(false),
        ];

        let mut failures = Vec::new();
        for arity in [5, 3, 2, 1] {
            let args = &full[..arity];
            match self.export_call("getPNGBase64", args).await {
                Ok(Value::String(payload)) if !strip_data_url(&payload).trim().is_empty() => {
                    match RasterImage::from_base64(&payload) {
                        Ok(image) => {
                            debug!(arity, width = image.width(), height = image.height(), "raster exported");
                            return Ok(image);
                        }
                        Err(e) => failures.push(format!("{arity} args: {e}")),
                    }
                }
                Ok(other) => failures.push(format!("{arity} args: no image (got {other})")),
                Err(VizhostError::Script { message }) => {
                    failures.push(format!("{arity} args: {message}"));
                }
                Err(e) => return Err(e),
            }
        }
        Err(VizhostError::export(format!(
            "getPNGBase64 produced no image: {}",
            failures.join("; ")
        )))
    }

    /// Export the graphics view as SVG.
    ///
    /// Builds that return nothing get a minimal valid placeholder sized to
    /// the canvas.
    ///
    /// # Errors
    ///
    /// `Connection` if not Ready, `Timeout`
    pub async fn export_vector(&self) -> VizhostResult<String> {
        match self.export_call("exportSVG", &[]).await {
            Ok(Value::String(svg)) if !svg.trim().is_empty() => return Ok(svg),
            Ok(_) => warn!(instance = %self.instance.id, "engine returned no SVG, using placeholder"),
            Err(VizhostError::Script { message }) => {
                warn!(instance = %self.instance.id, %message, "SVG export threw, using placeholder");
            }
            Err(e) => return Err(e),
        }
        let (width, height) = self.canvas_size().await?;
        Ok(placeholder_svg(width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLauncher, MockOptions};

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_viewport(40, 30)
            .with_poll_interval(5)
            .with_startup_timeout(500)
    }

    fn instance_with(options: MockOptions) -> (EngineInstance, MockLauncher) {
        let launcher = MockLauncher::new(options);
        let instance = EngineInstance::new(config(), Arc::new(launcher.clone()));
        (instance, launcher)
    }

    async fn ready_instance(options: MockOptions) -> (EngineInstance, MockLauncher) {
        let (instance, launcher) = instance_with(options);
        instance.initialize().await.unwrap();
        (instance, launcher)
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn test_initialize_reaches_ready() {
            let (instance, launcher) = instance_with(MockOptions::default());
            assert_eq!(instance.state(), InstanceState::Uninitialized);
            instance.initialize().await.unwrap();
            assert_eq!(instance.state(), InstanceState::Ready);
            assert_eq!(launcher.launches(), 1);
        }

        #[tokio::test]
        async fn test_initialize_twice_launches_once() {
            let (instance, launcher) = ready_instance(MockOptions::default()).await;
            instance.initialize().await.unwrap();
            assert_eq!(launcher.launches(), 1);
        }

        #[tokio::test]
        async fn test_slow_start_within_budget() {
            let (instance, _) = ready_instance(MockOptions::default().with_slow_start(5)).await;
            assert!(instance.is_ready());
        }

        #[tokio::test]
        async fn test_flag_without_surface_times_out() {
            let (instance, launcher) = instance_with(MockOptions::default().with_never_callable());
            let err = instance.initialize().await.unwrap_err();
            assert!(err.is_connection());
            assert!(err.to_string().contains("not callable"));
            assert_eq!(instance.state(), InstanceState::Uninitialized);
            assert!(launcher.handles()[0].is_closed());
        }

        #[tokio::test]
        async fn test_launch_failure_is_connection_error() {
            let launcher = MockLauncher::new(MockOptions::default()).with_failing_launch();
            let instance = EngineInstance::new(config(), Arc::new(launcher));
            let err = instance.initialize().await.unwrap_err();
            assert!(err.is_connection());
            assert_eq!(instance.state(), InstanceState::Uninitialized);
        }

        #[tokio::test]
        async fn test_operations_before_initialize_fail_fast() {
            let (instance, _) = instance_with(MockOptions::default());
            let err = instance.eval_command("a = 1").await.unwrap_err();
            assert!(err.to_string().contains("not initialized"));
        }

        #[tokio::test]
        async fn test_cleanup_is_idempotent() {
            let (instance, launcher) = ready_instance(MockOptions::default()).await;
            instance.cleanup().await;
            assert_eq!(instance.state(), InstanceState::Closed);
            instance.cleanup().await;
            assert_eq!(instance.state(), InstanceState::Closed);
            assert_eq!(launcher.handles()[0].close_calls(), 1);
        }

        #[tokio::test]
        async fn test_cleanup_swallows_release_errors() {
            let options = MockOptions {
                fail_close: true,
                ..MockOptions::default()
            };
            let (instance, launcher) = ready_instance(options).await;
            instance.cleanup().await;
            assert_eq!(instance.state(), InstanceState::Closed);
            assert!(launcher.handles()[0].is_closed());
        }

        #[tokio::test]
        async fn test_closed_instance_rejects_everything() {
            let (instance, _) = ready_instance(MockOptions::default()).await;
            instance.cleanup().await;
            let err = instance.eval_command("a = 1").await.unwrap_err();
            assert!(err.to_string().contains("closed"));
            assert!(instance.initialize().await.is_err());
        }

        #[tokio::test]
        async fn test_cleanup_interrupts_in_flight_operation() {
            let options = MockOptions::default().with_call_delay(Duration::from_secs(5));
            let (instance, _) = ready_instance(options).await;
            let instance = Arc::new(instance);

            let worker = {
                let instance = Arc::clone(&instance);
                tokio::spawn(async move { instance.eval_command("a = 1").await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;

            let started = Instant::now();
            instance.cleanup().await;
            let result = worker.await.unwrap();

            assert!(result.unwrap_err().is_connection());
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(instance.state(), InstanceState::Closed);
        }
    }

    mod command_tests {
        use super::*;

        #[tokio::test]
        async fn test_good_command() {
            let (instance, launcher) = ready_instance(MockOptions::default()).await;
            let value = instance.eval_command("r = 2.5").await.unwrap();
            assert_eq!(value, json!(true));
            assert_eq!(launcher.handles()[0].value("r"), Some(2.5));
        }

        #[tokio::test]
        async fn test_bad_command_keeps_instance_ready() {
            let (instance, _) = ready_instance(MockOptions::default()).await;
            let err = instance.eval_command("bad syntax ###").await.unwrap_err();
            match err {
                VizhostError::Command { command, message } => {
                    assert_eq!(command, "bad syntax ###");
                    assert!(!message.is_empty());
                }
                other => panic!("expected command error, got {other:?}"),
            }
            assert_eq!(instance.state(), InstanceState::Ready);
            assert!(instance.eval_command("b = 1").await.is_ok());
        }

        #[tokio::test]
        async fn test_thrown_command_carries_text() {
            let options = MockOptions {
                throw_on_reject: true,
                ..MockOptions::default()
            };
            let (instance, _) = ready_instance(options).await;
            let err = instance.eval_command("Circle((0,0)").await.unwrap_err();
            assert!(matches!(err, VizhostError::Command { ref command, .. } if command == "Circle((0,0)"));
        }

        #[tokio::test]
        async fn test_command_timeout() {
            let launcher = MockLauncher::new(
                MockOptions::default().with_call_delay(Duration::from_millis(200)),
            );
            let instance = EngineInstance::new(
                config().with_command_timeout(20),
                Arc::new(launcher),
            );
            instance.initialize().await.unwrap();
            let err = instance.eval_command("a = 1").await.unwrap_err();
            assert!(matches!(err, VizhostError::Timeout { ref operation, ms: 20 } if operation == "evalCommand"));
            assert_eq!(instance.state(), InstanceState::Ready);
        }

        #[tokio::test]
        async fn test_dropped_call_returns_instance_to_ready() {
            let options = MockOptions::default().with_call_delay(Duration::from_millis(200));
            let (instance, launcher) = ready_instance(options).await;

            let cancelled =
                tokio::time::timeout(Duration::from_millis(20), instance.eval_command("a = 1")).await;
            assert!(cancelled.is_err());
            assert_eq!(instance.state(), InstanceState::Ready);

            instance.eval_command("b = 2").await.unwrap();
            assert_eq!(launcher.handles()[0].value("b"), Some(2.0));
        }

        #[tokio::test]
        async fn test_not_ready_messages_name_the_state() {
            let (instance, _) = ready_instance(MockOptions::default()).await;
            instance.set_state(InstanceState::Busy);
            assert!(instance.not_ready_error().to_string().contains("is busy"));
            instance.set_state(InstanceState::Launching);
            assert!(instance.not_ready_error().to_string().contains("still starting"));
            instance.set_state(InstanceState::Ready);
            instance.cleanup().await;
        }

        #[tokio::test]
        async fn test_session_serializes_callers() {
            let (instance, launcher) = ready_instance(MockOptions::default()).await;
            let instance = Arc::new(instance);
            let session = instance.session().await.unwrap();

            let waiter = {
                let instance = Arc::clone(&instance);
                tokio::spawn(async move { instance.eval_command("x = 2").await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            session.eval_command("x = 1").await.unwrap();
            assert_eq!(launcher.handles()[0].value("x"), Some(1.0));
            drop(session);

            waiter.await.unwrap().unwrap();
            assert_eq!(launcher.handles()[0].assignments("x"), vec![1.0, 2.0]);
        }
    }

    mod introspection_tests {
        use super::*;

        #[tokio::test]
        async fn test_object_info() {
            let (instance, _) = ready_instance(MockOptions::animated_by("t")).await;
            let info = instance.object_info("t").await.unwrap().unwrap();
            assert_eq!(info.object_type, "numeric");
            assert_eq!(info.value, Some(0.0));
            assert!(instance.exists("t").await.unwrap());
            assert!(instance.is_defined("t").await.unwrap());
        }

        #[tokio::test]
        async fn test_broken_introspection_returns_nothing() {
            let (instance, _) =
                ready_instance(MockOptions::animated_by("t").with_broken_introspection()).await;
            assert!(!instance.exists("t").await.unwrap());
            assert!(instance.object_info("t").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_value_and_animation_controls() {
            let (instance, launcher) = ready_instance(MockOptions::animated_by("t")).await;
            instance.set_value("t", 0.75).await.unwrap();
            assert_eq!(launcher.handles()[0].value("t"), Some(0.75));

            instance.set_animating("t", true).await.unwrap();
            instance.start_animation().await.unwrap();
            assert!(instance.is_animation_running().await.unwrap());
            instance.stop_animation().await.unwrap();
            assert!(!instance.is_animation_running().await.unwrap());
            instance.set_trace("t", true).await.unwrap();
        }

        #[tokio::test]
        async fn test_view_configuration() {
            let (instance, launcher) = ready_instance(MockOptions::default()).await;
            let session = instance.session().await.unwrap();
            session.set_coord_system(-5.0, 5.0, -2.0, 2.0).await.unwrap();
            session.set_axes_visible(true, false).await.unwrap();
            session.set_grid_visible(true).await.unwrap();
            assert_eq!(launcher.handles()[0].coord_system(), Some([-5.0, 5.0, -2.0, 2.0]));
        }

        #[tokio::test]
        async fn test_construction_management() {
            let (instance, _) = ready_instance(MockOptions::default()).await;
            let session = instance.session().await.unwrap();
            session.eval_command("p = 1").await.unwrap();
            session.eval_command("q = 2").await.unwrap();
            assert_eq!(session.object_names().await.unwrap(), vec!["p", "q"]);
            session.delete_object("p").await.unwrap();
            assert_eq!(session.object_names().await.unwrap(), vec!["q"]);
            session.reset_construction().await.unwrap();
            assert!(session.object_names().await.unwrap().is_empty());
        }
    }

    mod export_tests {
        use super::*;

        #[tokio::test]
        async fn test_raster_uses_longest_signature_first() {
            let (instance, launcher) = ready_instance(MockOptions::default()).await;
            let image = instance.export_raster(RasterOptions::default()).await.unwrap();
            assert_eq!((image.width(), image.height()), (40, 30));
            assert_eq!(launcher.handles()[0].calls("getPNGBase64"), 1);
        }

        #[tokio::test]
        async fn test_raster_falls_back_to_shorter_signature() {
            let (instance, launcher) =
                ready_instance(MockOptions::default().with_png_max_args(1)).await;
            let image = instance.export_raster(RasterOptions::default()).await.unwrap();
            assert_eq!(image.width(), 40);
            assert_eq!(launcher.handles()[0].calls("getPNGBase64"), 4);
        }

        #[tokio::test]
        async fn test_raster_explicit_size_scales_from_canvas() {
            let (instance, _) = ready_instance(MockOptions::default().with_canvas(100, 50)).await;
            let image = instance
                .export_raster(RasterOptions::default().with_size(Some(200), None))
                .await
                .unwrap();
            assert_eq!((image.width(), image.height()), (200, 100));
        }

        #[tokio::test]
        async fn test_raster_unknown_canvas_uses_viewport() {
            let options = MockOptions {
                hide_canvas: true,
                ..MockOptions::default().with_canvas(100, 50)
            };
            let (instance, _) = ready_instance(options).await;
            let image = instance
                .export_raster(RasterOptions::default().with_size(Some(80), None))
                .await
                .unwrap();
            // viewport is 40x30, so the derived scale is 2
            assert_eq!((image.width(), image.height()), (200, 100));
        }

        #[tokio::test]
        async fn test_raster_strips_data_url() {
            let options = MockOptions {
                png_data_url: true,
                ..MockOptions::default()
            };
            let (instance, _) = ready_instance(options).await;
            let image = instance.export_raster(RasterOptions::default()).await.unwrap();
            assert!(!image.base64().starts_with("data:"));
        }

        #[tokio::test]
        async fn test_raster_all_signatures_fail() {
            let options = MockOptions::default().with_failing_png_calls(vec![0, 1, 2, 3]);
            let (instance, _) = ready_instance(options).await;
            let err = instance.export_raster(RasterOptions::default()).await.unwrap_err();
            assert!(matches!(err, VizhostError::Export { .. }));
            assert_eq!(instance.state(), InstanceState::Ready);
        }

        #[tokio::test]
        async fn test_vector_placeholder() {
            let options = MockOptions {
                svg_supported: false,
                ..MockOptions::default()
            };
            let (instance, _) = ready_instance(options).await;
            let svg = instance.export_vector().await.unwrap();
            assert_eq!(svg, placeholder_svg(40, 30));
        }

        #[tokio::test]
        async fn test_vector_passthrough() {
            let (instance, _) = ready_instance(MockOptions::default()).await;
            let svg = instance.export_vector().await.unwrap();
            assert!(svg.contains("<g/>"));
        }
    }
}
