//! Minimal HTML for the login form and the application shell

use crate::routes::APP_PREFIX;

/// Seconds between heartbeats sent by a visible shell tab
const HEARTBEAT_INTERVAL_SECS: u64 = 60;

const STYLE: &str = "body{margin:0;font-family:system-ui,sans-serif;background:#f6f7f9}\
main{max-width:28rem;margin:6rem auto;padding:2rem;background:#fff;border-radius:8px;\
box-shadow:0 1px 4px rgba(0,0,0,.1)}label{display:block;margin-top:1rem}\
input{width:100%;padding:.5rem;box-sizing:border-box}button{margin-top:1.5rem;padding:.5rem 1rem}\
header{display:flex;justify-content:space-between;align-items:center;padding:.5rem 1rem;\
background:#1b1f24;color:#fff}header a{color:#fff}\
iframe{border:0;width:100%;height:calc(100vh - 2.5rem);display:block}";

/// Login form, prefilled with the last endpoint if known
pub fn login_page(endpoint: Option<&str>) -> String {
    let value = endpoint.map(escape_html).unwrap_or_default();
    format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Sign in</title><style>{style}</style></head>
<body>
<main>
<h1>Start a session</h1>
<form method="post" action="/start">
<label>Workspace endpoint<input name="endpoint" value="{value}" placeholder="https://example.cloud.databricks.com" required></label>
<label>Access token<input name="credential" type="password" autocomplete="off" required></label>
<button type="submit">Start</button>
</form>
</main>
</body>
</html>
"#,
        style = STYLE,
        value = value,
    )
}

/// Shell framing the proxied application, with a heartbeat while visible
pub fn shell_page(endpoint: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Session</title><style>{style}</style></head>
<body>
<header><span>{endpoint}</span><a href="/logout">Log out</a></header>
<iframe src="{prefix}/" title="application"></iframe>
<script>
setInterval(function () {{
  if (document.visibilityState === "visible") {{
    fetch("/heartbeat", {{ method: "POST", credentials: "same-origin" }});
  }}
}}, {interval_ms});
</script>
</body>
</html>
"#,
        style = STYLE,
        endpoint = escape_html(endpoint),
        prefix = APP_PREFIX,
        interval_ms = HEARTBEAT_INTERVAL_SECS * 1000,
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_page_prefills_escaped_endpoint() {
        let page = login_page(Some("https://e1/\"><script>"));
        assert!(page.contains("action=\"/start\""));
        assert!(page.contains("value=\"https://e1/&quot;&gt;&lt;script&gt;\""));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn test_shell_page_frames_app_and_heartbeats() {
        let page = shell_page("https://e1.example.com/");
        assert!(page.contains("src=\"/goose/\""));
        assert!(page.contains("/heartbeat"));
        assert!(page.contains("/logout"));
        assert!(page.contains("60000"));
    }
}
