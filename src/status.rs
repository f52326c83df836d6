//! Status payload and the self-refreshing HTML pages shown while a session
//! is starting, after it expired, or when it failed to start

use crate::proxy::{full_body, GatewayBody};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Interval between status polls made by the live page, in milliseconds
const POLL_INTERVAL_MS: u64 = 1000;
/// Each poll is aborted after this long, in milliseconds
const POLL_TIMEOUT_MS: u64 = 900;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub exists: bool,
    pub ready: bool,
    pub session_id: String,
    pub seconds_left: u64,
}

impl StatusResponse {
    pub fn missing(session_id: &str) -> Self {
        Self {
            exists: false,
            ready: false,
            session_id: session_id.to_string(),
            seconds_left: 0,
        }
    }
}

pub fn status_response(status: &StatusResponse) -> Response<GatewayBody> {
    let body = serde_json::to_string(status).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(full_body(body))
        .expect("valid response with static headers")
}

/// Contents of a live page
#[derive(Debug, Clone)]
pub struct LivePage<'a> {
    pub title: &'a str,
    pub subtitle: &'a str,
    /// Target of the manual retry link
    pub retry_path: &'a str,
    /// Session the page polls for; `None` renders a static page
    pub session_id: Option<&'a str>,
    /// Where to go once the session is ready
    pub live_path: &'a str,
}

const LIVE_PAGE_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{{TITLE}}</title>
<style>
  body { font-family: system-ui, sans-serif; background: #111; color: #eee; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }
  main { text-align: center; max-width: 32rem; padding: 2rem; }
  h1 { font-size: 1.5rem; margin-bottom: 0.5rem; }
  p { color: #aaa; }
  a { color: #8cf; }
  #statusText { font-family: ui-monospace, monospace; margin-top: 1.5rem; }
</style>
</head>
<body>
<main>
  <h1>{{TITLE}}</h1>
  <p>{{SUBTITLE}}</p>
  <p><a href="{{RETRY_HREF}}">Retry</a></p>
  <div id="statusText">Checking…</div>
</main>
<script>
(function () {
  var statusText = document.getElementById("statusText");
  var sessionId = {{SESSION_ID_JS}};
  var livePath = {{LIVE_PATH_JS}};
  if (!statusText) { return; }
  if (!sessionId) { statusText.textContent = "Ready"; return; }

  var inFlight = false;
  var stopped = false;
  var redirected = false;

  function finish(message, target, delay, reload) {
    stopped = true;
    statusText.textContent = message;
    setTimeout(function () {
      if (reload) { location.reload(); } else { location.replace(target); }
    }, delay);
  }

  async function tick() {
    if (inFlight || stopped) { return; }
    inFlight = true;
    var controller = new AbortController();
    var abortTimer = setTimeout(function () { controller.abort(); }, {{POLL_TIMEOUT_MS}});
    try {
      var response = await fetch("/status/" + encodeURIComponent(sessionId), {
        cache: "no-store",
        headers: { "Accept": "application/json" },
        signal: controller.signal
      });
      if (!response.ok) { throw new Error("status " + response.status); }
      var status = await response.json();

      if (!status.exists) {
        finish("Session not found. Starting a new one…", "/", 1200, false);
      } else if (status.ready) {
        if (!redirected) {
          redirected = true;
          var alreadyThere = location.pathname === livePath;
          finish("Ready", livePath, 150, alreadyThere);
        }
      } else {
        statusText.textContent = "Starting… (" + status.secondsLeft + "s left)";
      }
    } catch (err) {
      statusText.textContent = "Waiting for server…";
    } finally {
      clearTimeout(abortTimer);
      inFlight = false;
      if (!stopped) { setTimeout(tick, {{POLL_INTERVAL_MS}}); }
    }
  }

  tick();
})();
</script>
</body>
</html>
"#;

/// Escape text for HTML element and attribute content
pub fn html_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Encode a value as a JavaScript literal safe to embed in a script element
fn js_literal(value: Option<&str>) -> String {
    let literal = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
    literal.replace('<', "\\u003c").replace('>', "\\u003e")
}

pub fn render_live_page(page: &LivePage<'_>) -> String {
    LIVE_PAGE_TEMPLATE
        .replace("{{TITLE}}", &html_escape(page.title))
        .replace("{{SUBTITLE}}", &html_escape(page.subtitle))
        .replace("{{RETRY_HREF}}", &html_escape(page.retry_path))
        .replace("{{SESSION_ID_JS}}", &js_literal(page.session_id))
        .replace("{{LIVE_PATH_JS}}", &js_literal(Some(page.live_path)))
        .replace("{{POLL_TIMEOUT_MS}}", &POLL_TIMEOUT_MS.to_string())
        .replace("{{POLL_INTERVAL_MS}}", &POLL_INTERVAL_MS.to_string())
}

fn html_response(status: StatusCode, html: String) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Cache-Control", "no-store")
        .body(full_body(html))
        .expect("valid response with StatusCode enum and static headers")
}

/// Live path of a session: `/<mount>/<id>/`
pub fn session_path(mount_prefix: &str, session_id: &str) -> String {
    format!("/{}/{}/", mount_prefix, session_id)
}

/// Shown while a session exists but is not reachable yet
pub fn starting_page(mount_prefix: &str, session_id: &str) -> Response<GatewayBody> {
    let live_path = session_path(mount_prefix, session_id);
    html_response(
        StatusCode::OK,
        render_live_page(&LivePage {
            title: "Starting session",
            subtitle: "Your environment is being prepared. This page refreshes automatically.",
            retry_path: &live_path,
            session_id: Some(session_id),
            live_path: &live_path,
        }),
    )
}

/// Shown for an unknown or expired session
pub fn expired_page(mount_prefix: &str, session_id: &str) -> Response<GatewayBody> {
    let live_path = session_path(mount_prefix, session_id);
    html_response(
        StatusCode::NOT_FOUND,
        render_live_page(&LivePage {
            title: "Session expired",
            subtitle: "This session no longer exists. Start a new one to continue.",
            retry_path: "/",
            session_id: Some(session_id),
            live_path: &live_path,
        }),
    )
}

/// Shown when provisioning failed outright
pub fn failed_page() -> Response<GatewayBody> {
    html_response(
        StatusCode::SERVICE_UNAVAILABLE,
        render_live_page(&LivePage {
            title: "Starting session",
            subtitle: "The session could not be started. Please try again.",
            retry_path: "/",
            session_id: None,
            live_path: "/",
        }),
    )
}
