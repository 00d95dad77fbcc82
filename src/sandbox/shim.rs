//! Console capture shim.
//!
//! JavaScript that runs inside the isolation context, before user code.
//! Once installed it wraps `console.log/info/warn/error` so every call
//! still reaches the original console and is also posted to the parent
//! as a `console` message. Uncaught errors and unhandled rejections are
//! posted as `error` messages with a stack when one exists.
//!
//! Serialization never throws: strings pass through, `Error`s reduce to
//! their message, everything else goes through `JSON.stringify`, then
//! `String(value)`, then the `[unserializable output]` marker.
//!
//! Contexts are single-use, so there is no uninstall.

/// Defines `createConsoleCapture(channelId)` in the context's global scope.
pub const CAPTURE_SCRIPT: &str = r#"function createConsoleCapture(channelId) {
  const original = {
    log: console.log.bind(console),
    info: (console.info || console.log).bind(console),
    warn: console.warn.bind(console),
    error: console.error.bind(console)
  };

  function serializeOne(a) {
    if (typeof a === 'string') return a;
    if (a instanceof Error) return a.message;
    try {
      const json = JSON.stringify(a);
      return json === undefined ? String(a) : json;
    } catch {
      return String(a);
    }
  }

  function serializeArgs(args) {
    try {
      return args.map(serializeOne).join(' ');
    } catch {
      try { return args.join(' '); } catch { return '[unserializable output]'; }
    }
  }

  function post(msg) {
    try {
      parent.postMessage(Object.assign({}, msg, { channelId: channelId }), '*');
    } catch (e) {
      // swallow
    }
  }

  function wrap(method, level) {
    console[method] = function (...args) {
      try { post({ type: 'console', level: level, payload: serializeArgs(args) }); } catch {}
      return original[method](...args);
    };
  }

  function describe(reason, fallback) {
    if (reason && reason.message) return String(reason.message);
    if (reason === undefined || reason === null) return fallback;
    try { return String(reason); } catch { return fallback; }
  }

  function stackOf(reason) {
    try {
      return reason && reason.stack ? String(reason.stack) : undefined;
    } catch {
      return undefined;
    }
  }

  function install() {
    wrap('log', 'log');
    wrap('info', 'log');
    wrap('warn', 'warn');
    wrap('error', 'error');

    window.addEventListener('error', function (e) {
      try {
        const message = e && e.message ? e.message : describe(e && e.error, 'Unknown error');
        post({ type: 'error', payload: message, stack: stackOf(e && e.error) });
      } catch {}
    });

    window.addEventListener('unhandledrejection', function (e) {
      try {
        const reason = e ? e.reason : undefined;
        post({
          type: 'error',
          payload: describe(reason, 'Unhandled promise rejection'),
          stack: stackOf(reason)
        });
      } catch {}
    });
  }

  return { install: install, post: post };
}"#;

/// Script that installs the shim for `channel_literal` and defines the
/// `__safePost` helper used by the execution envelope.
///
/// `channel_literal` must already be a JavaScript string literal.
pub fn install_snippet(channel_literal: &str) -> String {
    format!(
        r#"const __channelId = {channel_literal};
const __safePost = (msg) => {{
  try {{
    const tagged = Object.assign({{}}, msg, {{ channelId: __channelId }});
    window.parent && window.parent.postMessage(tagged, '*');
  }} catch (e) {{}}
}};
try {{
  createConsoleCapture(__channelId).install();
}} catch (e) {{
  __safePost({{ type: 'error', payload: String(e && e.message ? e.message : e) }});
}}"#
    )
}
