use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const FIRST_PAGE: &str = r#"<!doctype html>
<html>
  <head><title>Test Group</title></head>
  <body>
    <div aria-label="Your Account"></div>
    <div role="feed">
      <div role="article">
        <a role="link" href="/people/ann">Ann</a>
        <a href="/groups/1/posts/1001/?__cft__=x"><abbr data-utime="1700000000">1h</abbr></a>
        <div data-ad-preview="message">First post from the test feed, with enough text.</div>
      </div>
      <div role="article">
        <a role="link" href="/people/bo">Bo</a>
        <a href="/groups/1/posts/1002/">2h</a>
        <div data-ad-preview="message">Second post from the test feed, also long enough.</div>
      </div>
    </div>
    <a rel="next" href="/groups/1/page2">More posts</a>
  </body>
</html>
"#;

const SECOND_PAGE: &str = r#"<!doctype html>
<html>
  <body>
    <div role="feed">
      <div role="article">
        <a role="link" href="/people/cy">Cy</a>
        <a href="/groups/1/posts/1003/">3h</a>
        <div data-ad-preview="message">Third post, only visible after scrolling down.</div>
      </div>
      <div role="article">
        <a href="/groups/1/posts/1001/?comment_id=5">Reply</a>
        <div data-ad-preview="message">A comment under the first post, long enough to pass.</div>
      </div>
    </div>
  </body>
</html>
"#;

const LOGIN_WALL: &str = r#"<!doctype html>
<html><body><form><a href="/login/?next=%2Fgroups%2F1">Log in</a></form></body></html>
"#;

/// Serves a two-page group feed at `/groups/1` and a login wall at `/wall`.
pub struct FeedServer {
    pub base_url: String,
    cookies: Arc<Mutex<Vec<Option<String>>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FeedServer {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start feed server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let cookies = Arc::new(Mutex::new(Vec::new()));
        let seen_cookies = Arc::clone(&cookies);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let cookie = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Cookie"))
                    .map(|h| h.value.as_str().to_owned());
                seen_cookies.lock().expect("cookie log lock").push(cookie);

                let url = request.url().to_string();
                let path = url.split('?').next().unwrap_or(&url);
                let (status, body) = match path {
                    "/groups/1" | "/groups/1/" => (200, FIRST_PAGE),
                    "/groups/1/page2" => (200, SECOND_PAGE),
                    "/wall" => (200, LOGIN_WALL),
                    _ => (404, "not found"),
                };

                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"text/html; charset=utf-8"[..],
                )
                .expect("build header");
                let response = tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            cookies,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn group_url(&self) -> String {
        format!("{}/groups/1", self.base_url)
    }

    /// `Cookie` header of every request served so far.
    pub fn seen_cookies(&self) -> Vec<Option<String>> {
        self.cookies.lock().expect("cookie log lock").clone()
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
