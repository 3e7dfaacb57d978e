//! In-process engine simulation.
//!
//! [`MockEngine`] answers the same applet calls a hosted engine does, with
//! enough behaviour to exercise lifecycle, sweep, and export logic without a
//! browser: numeric assignments, rejected commands, slow handshakes,
//! unreliable introspection, and export signatures that vary by "build".
//! Rendered frames are flat PNGs whose colour depends only on the value of
//! one driving parameter, so a sweep that never reaches it yields identical
//! frames.

use crate::config::EngineConfig;
use crate::driver::{EngineDriver, EngineLauncher, Readiness};
use crate::result::{VizhostError, VizhostResult};
use async_trait::async_trait;
use base64::Engine as _;
use image::{ImageFormat, Rgba, RgbaImage};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

/// Behaviour switches for a simulated engine build
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Poll count at which the readiness flag fires
    pub polls_until_signal: u32,
    /// Poll count at which the scripting surface becomes callable
    pub polls_until_callable: u32,
    /// Flag fires but the scripting surface never wires up
    pub never_callable: bool,
    /// Whether `exists`/`getAllObjectNames` tell the truth
    pub introspection_works: bool,
    /// Largest `getPNGBase64` arity this build accepts
    pub png_max_args: usize,
    /// Prefix PNG output with a `data:` URL header
    pub png_data_url: bool,
    /// `getPNGBase64` call indexes (0-based) that fail
    pub failing_png_calls: Vec<usize>,
    /// Whether `exportSVG` returns anything
    pub svg_supported: bool,
    /// Throw instead of returning `false` for rejected commands
    pub throw_on_reject: bool,
    /// Canvas size override (None = viewport)
    pub canvas: Option<(u32, u32)>,
    /// Report no canvas size at all
    pub hide_canvas: bool,
    /// Parameter the rendered scene depends on
    pub driven_by: Option<String>,
    /// Objects defined when the engine loads
    pub preset: Vec<(String, f64)>,
    /// Latency added to every applet call
    pub call_delay: Duration,
    /// Extra latency on introspection calls (`exists`, `isDefined`, ...)
    pub introspection_delay: Duration,
    /// `close` reports an error (after releasing)
    pub fail_close: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            polls_until_signal: 1,
            polls_until_callable: 1,
            never_callable: false,
            introspection_works: true,
            png_max_args: 5,
            png_data_url: false,
            failing_png_calls: Vec::new(),
            svg_supported: true,
            throw_on_reject: false,
            canvas: None,
            hide_canvas: false,
            driven_by: None,
            preset: Vec::new(),
            call_delay: Duration::ZERO,
            introspection_delay: Duration::ZERO,
            fail_close: false,
        }
    }
}

impl MockOptions {
    /// Scene animated by `name`, defined up front with value 0
    #[must_use]
    pub fn animated_by(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            preset: vec![(name.clone(), 0.0)],
            driven_by: Some(name),
            ..Self::default()
        }
    }

    /// Headless build whose introspection silently returns nothing
    #[must_use]
    pub const fn with_broken_introspection(mut self) -> Self {
        self.introspection_works = false;
        self
    }

    /// Build that needs `polls` handshake polls before its surface is callable
    #[must_use]
    pub const fn with_slow_start(mut self, polls: u32) -> Self {
        self.polls_until_callable = polls;
        self
    }

    /// Build that raises the flag but never wires its surface
    #[must_use]
    pub const fn with_never_callable(mut self) -> Self {
        self.never_callable = true;
        self
    }

    /// Limit `getPNGBase64` arity
    #[must_use]
    pub const fn with_png_max_args(mut self, max: usize) -> Self {
        self.png_max_args = max;
        self
    }

    /// Fail the given `getPNGBase64` calls
    #[must_use]
    pub fn with_failing_png_calls(mut self, calls: Vec<usize>) -> Self {
        self.failing_png_calls = calls;
        self
    }

    /// Set the canvas size
    #[must_use]
    pub const fn with_canvas(mut self, width: u32, height: u32) -> Self {
        self.canvas = Some((width, height));
        self
    }

    /// Build whose introspection calls hang for `delay`
    #[must_use]
    pub const fn with_stalled_introspection(mut self, delay: Duration) -> Self {
        self.introspection_delay = delay;
        self
    }

    /// Add per-call latency
    #[must_use]
    pub const fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Default)]
struct MockObject {
    kind: String,
    definition: String,
    value: Option<f64>,
    visible: bool,
    animating: bool,
    trace: bool,
}

#[derive(Debug, Default)]
struct MockState {
    objects: BTreeMap<String, MockObject>,
    assignments: Vec<(String, f64)>,
    calls: Vec<String>,
    polls: u32,
    png_calls: usize,
    auto_label: usize,
    animation_running: bool,
    coord_system: Option<[f64; 4]>,
    closed: bool,
    close_calls: usize,
}

/// Inspection handle onto a mock engine's state
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current numeric value of an object
    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.lock().objects.get(name).and_then(|o| o.value)
    }

    /// Values assigned to `name` through commands, in order
    #[must_use]
    pub fn assignments(&self, name: &str) -> Vec<f64> {
        self.lock()
            .assignments
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Number of calls to `method`
    #[must_use]
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == method).count()
    }

    /// Whether the object exists (ground truth, unaffected by introspection bugs)
    #[must_use]
    pub fn has_object(&self, name: &str) -> bool {
        self.lock().objects.contains_key(name)
    }

    /// Whether the session has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of `close` calls received
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    /// Current coordinate system, if one was set
    #[must_use]
    pub fn coord_system(&self) -> Option<[f64; 4]> {
        self.lock().coord_system
    }
}

/// Simulated engine session
#[derive(Debug)]
pub struct MockEngine {
    options: MockOptions,
    canvas: (u32, u32),
    state: Arc<Mutex<MockState>>,
}

fn assignment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.+?)\s*$")
            .expect("assignment pattern is a valid regex")
    })
}

fn balanced(text: &str) -> bool {
    let mut depth: i32 = 0;
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn classify(definition: &str) -> &'static str {
    let lower = definition.to_ascii_lowercase();
    if lower.starts_with("circle") {
        "circle"
    } else if lower.starts_with("line") || lower.starts_with("segment") {
        "line"
    } else if definition.starts_with('(') {
        "point"
    } else if definition.contains('x') {
        "function"
    } else {
        "expression"
    }
}

fn arg_str(args: &[Value], index: usize) -> String {
    args.get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn arg_f64(args: &[Value], index: usize, default: f64) -> f64 {
    args.get(index).and_then(Value::as_f64).unwrap_or(default)
}

fn arg_bool(args: &[Value], index: usize) -> bool {
    args.get(index).and_then(Value::as_bool).unwrap_or(false)
}

impl MockEngine {
    /// Create a session sized to the configured viewport
    #[must_use]
    pub fn new(options: MockOptions, config: &EngineConfig) -> Self {
        let canvas = options
            .canvas
            .unwrap_or((config.viewport_width, config.viewport_height));
        let mut state = MockState::default();
        for (name, value) in &options.preset {
            state.objects.insert(
                name.clone(),
                MockObject {
                    kind: "numeric".to_string(),
                    definition: value.to_string(),
                    value: Some(*value),
                    visible: true,
                    ..MockObject::default()
                },
            );
        }
        Self {
            options,
            canvas,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Inspection handle sharing this session's state
    #[must_use]
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn eval_command(&self, state: &mut MockState, command: &str) -> VizhostResult<Value> {
        let trimmed = command.trim();
        if trimmed.is_empty() || trimmed.contains('#') || !balanced(trimmed) {
            if self.options.throw_on_reject {
                return Err(VizhostError::script(format!("Syntax error in \"{trimmed}\"")));
            }
            return Ok(Value::Bool(false));
        }

        if let Some(caps) = assignment_pattern().captures(trimmed) {
            let name = caps[1].to_string();
            let rhs = caps[2].to_string();
            let entry = state.objects.entry(name.clone()).or_default();
            if let Ok(value) = rhs.parse::<f64>() {
                entry.kind = "numeric".to_string();
                entry.value = Some(value);
                state.assignments.push((name, value));
            } else {
                entry.kind = classify(&rhs).to_string();
                entry.value = None;
            }
            entry.definition = rhs;
            entry.visible = true;
        } else {
            state.auto_label += 1;
            let label = format!("obj{}", state.auto_label);
            state.objects.insert(
                label,
                MockObject {
                    kind: classify(trimmed).to_string(),
                    definition: trimmed.to_string(),
                    visible: true,
                    ..MockObject::default()
                },
            );
        }
        Ok(Value::Bool(true))
    }

    fn render_png(&self, state: &MockState, scale: f64) -> VizhostResult<Value> {
        let width = ((f64::from(self.canvas.0) * scale).round() as u32).max(1);
        let height = ((f64::from(self.canvas.1) * scale).round() as u32).max(1);

        let driver_value = self
            .options
            .driven_by
            .as_ref()
            .and_then(|name| state.objects.get(name))
            .and_then(|o| o.value);
        let colour = driver_value.map_or([200, 200, 200, 255], |v| {
            let bits = v.to_bits();
            [
                (bits >> 8) as u8 ^ (bits >> 40) as u8,
                (bits >> 16) as u8 ^ (bits >> 48) as u8,
                (bits >> 24) as u8 ^ (bits >> 56) as u8,
                255,
            ]
        });

        let image = RgbaImage::from_pixel(width, height, Rgba(colour));
        let mut bytes = Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, ImageFormat::Png)
            .map_err(|e| VizhostError::script(e.to_string()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes.into_inner());
        if self.options.png_data_url {
            Ok(Value::String(format!("data:image/png;base64,{encoded}")))
        } else {
            Ok(Value::String(encoded))
        }
    }

    fn dispatch(&self, method: &str, args: &[Value]) -> VizhostResult<Value> {
        let mut state = self.lock();
        if state.closed {
            return Err(VizhostError::connection("mock session closed"));
        }
        state.calls.push(method.to_string());
        let introspection = self.options.introspection_works;

        match method {
            "evalCommand" => self.eval_command(&mut state, &arg_str(args, 0)),
            "exists" => Ok(Value::Bool(
                introspection && state.objects.contains_key(&arg_str(args, 0)),
            )),
            "isDefined" => Ok(Value::Bool(
                introspection
                    && state
                        .objects
                        .get(&arg_str(args, 0))
                        .is_some_and(|o| o.value.is_some() || !o.definition.is_empty()),
            )),
            "getObjectType" => Ok(Value::String(
                state
                    .objects
                    .get(&arg_str(args, 0))
                    .filter(|_| introspection)
                    .map(|o| o.kind.clone())
                    .unwrap_or_default(),
            )),
            "getValue" => Ok(json!(state
                .objects
                .get(&arg_str(args, 0))
                .and_then(|o| o.value)
                .unwrap_or(0.0))),
            "getValueString" => Ok(Value::String(
                state
                    .objects
                    .get(&arg_str(args, 0))
                    .map(|o| {
                        o.value.map_or_else(
                            || format!("{} = {}", arg_str(args, 0), o.definition),
                            |v| format!("{} = {v}", arg_str(args, 0)),
                        )
                    })
                    .unwrap_or_default(),
            )),
            "getCommandString" => Ok(Value::String(
                state
                    .objects
                    .get(&arg_str(args, 0))
                    .map(|o| o.definition.clone())
                    .unwrap_or_default(),
            )),
            "getVisible" => Ok(Value::Bool(
                state.objects.get(&arg_str(args, 0)).is_some_and(|o| o.visible),
            )),
            "getColor" => Ok(Value::String("#1565C0".to_string())),
            "getAllObjectNames" => {
                if introspection {
                    Ok(json!(state.objects.keys().collect::<Vec<_>>()))
                } else {
                    Ok(json!([]))
                }
            }
            "setValue" => {
                let name = arg_str(args, 0);
                let value = arg_f64(args, 1, 0.0);
                if let Some(object) = state.objects.get_mut(&name) {
                    object.value = Some(value);
                }
                Ok(Value::Null)
            }
            "setAnimating" | "setTrace" => {
                let name = arg_str(args, 0);
                let flag = arg_bool(args, 1);
                if let Some(object) = state.objects.get_mut(&name) {
                    if method == "setAnimating" {
                        object.animating = flag;
                    } else {
                        object.trace = flag;
                    }
                }
                Ok(Value::Null)
            }
            "startAnimation" => {
                state.animation_running = state.objects.values().any(|o| o.animating);
                Ok(Value::Null)
            }
            "stopAnimation" => {
                state.animation_running = false;
                Ok(Value::Null)
            }
            "isAnimationRunning" => Ok(Value::Bool(state.animation_running)),
            "setCoordSystem" => {
                state.coord_system = Some([
                    arg_f64(args, 0, -10.0),
                    arg_f64(args, 1, 10.0),
                    arg_f64(args, 2, -10.0),
                    arg_f64(args, 3, 10.0),
                ]);
                Ok(Value::Null)
            }
            "setAxesVisible" | "setGridVisible" => Ok(Value::Null),
            "deleteObject" => {
                state.objects.remove(&arg_str(args, 0));
                Ok(Value::Null)
            }
            "newConstruction" | "reset" => {
                state.objects.clear();
                state.animation_running = false;
                Ok(Value::Null)
            }
            "getPNGBase64" => {
                let call = state.png_calls;
                state.png_calls += 1;
                if args.len() > self.options.png_max_args {
                    return Err(VizhostError::script(format!(
                        "getPNGBase64 takes at most {} arguments",
                        self.options.png_max_args
                    )));
                }
                if self.options.failing_png_calls.contains(&call) {
                    return Err(VizhostError::script("canvas is not ready"));
                }
                self.render_png(&state, arg_f64(args, 0, 1.0))
            }
            "exportSVG" => {
                if self.options.svg_supported {
                    Ok(Value::String(format!(
                        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}"><g/></svg>"#,
                        self.canvas.0, self.canvas.1
                    )))
                } else {
                    Ok(Value::Null)
                }
            }
            other => Err(VizhostError::script(format!("no such method: {other}"))),
        }
    }
}

#[async_trait]
impl EngineDriver for MockEngine {
    async fn readiness(&self) -> VizhostResult<Readiness> {
        let mut state = self.lock();
        if state.closed {
            return Err(VizhostError::connection("mock session closed"));
        }
        state.polls += 1;
        let signalled = state.polls >= self.options.polls_until_signal;
        let callable = !self.options.never_callable && state.polls >= self.options.polls_until_callable;
        Ok(Readiness {
            signalled,
            callable,
            probe_ok: callable,
        })
    }

    async fn call(&self, method: &str, args: &[Value]) -> VizhostResult<Value> {
        if !self.options.call_delay.is_zero() {
            tokio::time::sleep(self.options.call_delay).await;
        }
        if !self.options.introspection_delay.is_zero()
            && matches!(method, "exists" | "isDefined" | "getObjectType" | "getAllObjectNames")
        {
            tokio::time::sleep(self.options.introspection_delay).await;
        }
        self.dispatch(method, args)
    }

    async fn canvas_size(&self) -> VizhostResult<Option<(u32, u32)>> {
        if self.options.hide_canvas {
            Ok(None)
        } else {
            Ok(Some(self.canvas))
        }
    }

    async fn close(&mut self) -> VizhostResult<()> {
        let mut state = self.lock();
        state.closed = true;
        state.close_calls += 1;
        if self.options.fail_close {
            return Err(VizhostError::connection("mock browser refused to close"));
        }
        Ok(())
    }
}

/// Launcher producing [`MockEngine`] sessions
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    options: MockOptions,
    launch_delay: Duration,
    fail_launch: bool,
    launches: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockLauncher {
    /// Launcher for engines built with `options`
    #[must_use]
    pub fn new(options: MockOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Delay every launch (widens race windows in tests)
    #[must_use]
    pub const fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Make every launch fail
    #[must_use]
    pub const fn with_failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// Number of launches performed so far
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Handles for every engine launched so far, in launch order
    #[must_use]
    pub fn handles(&self) -> Vec<MockHandle> {
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EngineLauncher for MockLauncher {
    async fn launch(&self, config: &EngineConfig) -> VizhostResult<Box<dyn EngineDriver>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if self.fail_launch {
            return Err(VizhostError::launch("mock launch failure"));
        }
        let engine = MockEngine::new(self.options.clone(), config);
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(engine.handle());
        Ok(Box::new(engine))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
