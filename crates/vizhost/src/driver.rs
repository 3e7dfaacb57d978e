//! Engine driver abstraction.
//!
//! An [`EngineDriver`] is one hosted engine session: a browser page with the
//! engine bundle loaded. The instance layer above it only ever speaks in
//! applet calls (`evalCommand`, `getPNGBase64`, ...), so the hosting runtime
//! can be swapped without touching lifecycle logic.
//!
//! # Implementations
//!
//! - `ChromiumDriver` - headless Chromium via chromiumoxide (`browser` feature)
//! - [`MockEngine`](crate::mock::MockEngine) - in-process simulation for tests and dry runs

use crate::config::EngineConfig;
use crate::result::VizhostResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Readiness report returned by one handshake poll.
///
/// Some engine builds raise their readiness flag before the scripting
/// surface is wired up, so a usable instance needs both halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// The engine's own readiness signal has fired
    pub signalled: bool,
    /// Command execution and existence-check entry points are callable
    pub callable: bool,
    /// A probe call actually returned a well-formed answer
    pub probe_ok: bool,
}

impl Readiness {
    /// Fully ready: signal plus functional probe
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.signalled && self.callable && self.probe_ok
    }

    /// Short description of what is still missing
    #[must_use]
    pub const fn missing(&self) -> &'static str {
        if !self.signalled {
            "readiness signal not received"
        } else if !self.callable {
            "scripting entry points not callable"
        } else if !self.probe_ok {
            "functional probe failed"
        } else {
            "nothing"
        }
    }
}

/// One live engine session.
///
/// Drivers are not expected to serialize calls themselves; the owning
/// `EngineInstance` guarantees one call in flight at a time.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    /// Poll the readiness signal and run the functional probe once
    async fn readiness(&self) -> VizhostResult<Readiness>;

    /// Invoke `method` on the engine's global API object with JSON arguments.
    ///
    /// Script exceptions come back as `VizhostError::Script`; transport
    /// failures as `VizhostError::Connection`.
    async fn call(&self, method: &str, args: &[Value]) -> VizhostResult<Value>;

    /// Current drawing canvas size in device pixels, if it can be determined
    async fn canvas_size(&self) -> VizhostResult<Option<(u32, u32)>>;

    /// Release the page, then the hosting process.
    ///
    /// Must attempt both releases even if the first fails, and must be safe
    /// to call more than once.
    async fn close(&mut self) -> VizhostResult<()>;
}

/// Creates engine drivers.
///
/// The pool holds one launcher and calls it once per new instance.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Launch the hosting runtime and load the engine bundle.
    ///
    /// Returns as soon as the page is loading; readiness is the caller's job.
    async fn launch(&self, config: &EngineConfig) -> VizhostResult<Box<dyn EngineDriver>>;

    /// Human-readable launcher name for logs
    fn name(&self) -> &'static str;
}

/// Build the hosting page that loads the engine bundle and raises the readiness flag.
#[must_use]
pub fn host_page_html(config: &EngineConfig) -> String {
    let params = serde_json::json!({
        "appName": config.app_name,
        "width": config.viewport_width,
        "height": config.viewport_height,
        "showToolBar": config.show_toolbar,
        "showAlgebraInput": config.show_algebra_input,
        "showMenuBar": config.show_menu_bar,
        "language": config.locale,
        "showResetIcon": false,
        "enableShiftDragZoom": false,
        "useBrowserForJS": true,
    });
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<script src="{bundle}"></script>
</head>
<body style="margin:0">
<div id="vizhost-engine"></div>
<script>
  window.__vizhostReady = false;
  const params = {params};
  params.appletOnLoad = function (api) {{
    window.{global} = window.{global} || api;
    window.__vizhostReady = true;
  }};
  new GGBApplet(params, true).inject("vizhost-engine");
</script>
</body>
</html>"#,
        bundle = config.bundle_url,
        params = params,
        global = config.applet_global,
    )
}

/// Script that reports [`Readiness`] as JSON for the given API global.
#[must_use]
pub fn readiness_script(applet_global: &str) -> String {
    format!(
        r"(() => {{
  const api = window.{applet_global};
  const signalled = window.__vizhostReady === true;
  const callable = !!api
    && typeof api.evalCommand === 'function'
    && typeof api.exists === 'function';
  let probe_ok = false;
  if (callable) {{
    try {{
      probe_ok = typeof api.exists('__vizhost_probe__') === 'boolean';
    }} catch (e) {{
      probe_ok = false;
    }}
  }}
  return {{ signalled, callable, probe_ok }};
}})()"
    )
}

/// Script that invokes one API method and wraps the outcome so that
/// exceptions come back as data instead of protocol errors.
///
/// # Errors
///
/// Returns `Json` if the method name or arguments cannot be serialized
pub fn call_script(applet_global: &str, method: &str, args: &[Value]) -> VizhostResult<String> {
    let method = serde_json::to_string(method)?;
    let args = serde_json::to_string(args)?;
    Ok(format!(
        r"(() => {{
  const api = window.{applet_global};
  if (!api) {{ return {{ ok: false, error: 'engine API not loaded' }}; }}
  const fn = api[{method}];
  if (typeof fn !== 'function') {{ return {{ ok: false, error: 'no such method: ' + {method} }}; }}
  try {{
    const value = fn.apply(api, {args});
    return {{ ok: true, value: value === undefined ? null : value }};
  }} catch (e) {{
    return {{ ok: false, error: String(e && e.message ? e.message : e) }};
  }}
}})()"
    ))
}

/// Script that measures the engine's drawing canvas
#[must_use]
pub fn canvas_size_script() -> &'static str {
    r"(() => {
  const canvas = document.querySelector('#vizhost-engine canvas') || document.querySelector('canvas');
  if (!canvas) { return null; }
  return [canvas.width, canvas.height];
})()"
}

/// Decode the `{ok, value, error}` envelope produced by [`call_script`].
///
/// # Errors
///
/// Returns `Script` when the page reported an exception
pub fn decode_call_envelope(envelope: Value) -> VizhostResult<Value> {
    let ok = envelope.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if ok {
        Ok(envelope.get("value").cloned().unwrap_or(Value::Null))
    } else {
        let message = envelope
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown script error");
        Err(crate::result::VizhostError::script(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::VizhostError;
    use serde_json::json;

    mod readiness_tests {
        use super::*;

        #[test]
        fn test_flag_alone_is_not_ready() {
            let r = Readiness {
                signalled: true,
                callable: false,
                probe_ok: false,
            };
            assert!(!r.is_ready());
            assert_eq!(r.missing(), "scripting entry points not callable");
        }

        #[test]
        fn test_callable_without_probe_is_not_ready() {
            let r = Readiness {
                signalled: true,
                callable: true,
                probe_ok: false,
            };
            assert!(!r.is_ready());
            assert_eq!(r.missing(), "functional probe failed");
        }

        #[test]
        fn test_full_readiness() {
            let r = Readiness {
                signalled: true,
                callable: true,
                probe_ok: true,
            };
            assert!(r.is_ready());
        }

        #[test]
        fn test_readiness_deserializes_from_script_shape() {
            let r: Readiness =
                serde_json::from_value(json!({"signalled": true, "callable": true, "probe_ok": false}))
                    .unwrap();
            assert!(!r.is_ready());
        }
    }

    mod script_tests {
        use super::*;

        #[test]
        fn test_call_script_escapes_arguments() {
            let script = call_script("ggbApplet", "evalCommand", &[json!("A = \"x\"")]).unwrap();
            assert!(script.contains(r#"api["evalCommand"]"#));
            assert!(script.contains(r#"["A = \"x\""]"#));
        }

        #[test]
        fn test_host_page_uses_config() {
            let config = EngineConfig::default().with_viewport(640, 480).with_locale("fr");
            let html = host_page_html(&config);
            assert!(html.contains(crate::config::DEFAULT_BUNDLE_URL));
            assert!(html.contains("\"width\":640"));
            assert!(html.contains("\"language\":\"fr\""));
            assert!(html.contains("window.ggbApplet"));
        }

        #[test]
        fn test_readiness_script_probes_exists() {
            let script = readiness_script("ggbApplet");
            assert!(script.contains("api.exists('__vizhost_probe__')"));
        }
    }

    mod envelope_tests {
        use super::*;

        #[test]
        fn test_ok_envelope() {
            let value = decode_call_envelope(json!({"ok": true, "value": 3.5})).unwrap();
            assert_eq!(value, json!(3.5));
        }

        #[test]
        fn test_ok_envelope_without_value() {
            let value = decode_call_envelope(json!({"ok": true})).unwrap();
            assert_eq!(value, Value::Null);
        }

        #[test]
        fn test_error_envelope() {
            let err = decode_call_envelope(json!({"ok": false, "error": "Undefined variable"}))
                .unwrap_err();
            assert!(matches!(err, VizhostError::Script { message } if message == "Undefined variable"));
        }

        #[test]
        fn test_garbage_envelope_is_error() {
            assert!(decode_call_envelope(json!(null)).is_err());
        }
    }
}
