/*
 *  feed.rs
 *
 *  PostBox - posts on glass
 *  (c) 2024-26 PostBox contributors
 *
 *  Remote post feed: password sign-in, latest-post polling, and the
 *  liveness report sink.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::FeedConfig;
use crate::error::Fault;
use crate::supervisor::Event;

const HTTP_TIMEOUT_SECS: u64 = 15;

/// One post record, validated out of the raw feed snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub text: String,
    pub time_posted: i64, // epoch milliseconds
    pub uuid: String,
}

/// Field-by-field validation of a raw record. Anything missing or of
/// the wrong type is a data fault: the caller logs and drops it.
pub fn validate_post(value: &Value) -> Result<Post, Fault> {
    let obj = value
        .as_object()
        .ok_or_else(|| Fault::Data("post record is not an object".to_string()))?;
    let text = obj
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::Data("post is missing string field 'text'".to_string()))?;
    let time_posted = obj
        .get("timePosted")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or_else(|| Fault::Data("post is missing numeric field 'timePosted'".to_string()))?;
    let uuid = obj
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::Data("post is missing string field 'uuid'".to_string()))?;
    Ok(Post {
        text: text.to_string(),
        time_posted,
        uuid: uuid.to_string(),
    })
}

/// Unwrap the feed's latest-post snapshot: either null (no posts) or
/// a single-entry keyed object holding the newest record.
fn latest_from_snapshot(value: Value) -> Result<Option<Value>, Fault> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(map.into_values().next()),
        other => Err(Fault::Data(format!("unexpected snapshot shape: {}", other))),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Session {
    #[serde(rename = "idToken")]
    id_token: String,
    #[serde(rename = "localId")]
    local_id: String,
}

/// Feed client. Owns the HTTP client, the signed-in session, and the
/// background poller that pushes feed changes into the supervisor.
pub struct FeedClient {
    http: Client,
    cfg: FeedConfig,
    session: Option<Session>,
    poller: Option<JoinHandle<()>>,
    /// set once credentials came from the terminal; auth rejections
    /// are then fatal rather than retriable
    interactive_credentials: bool,
    credentials: Option<(String, String)>,
}

impl FeedClient {
    pub fn new(cfg: FeedConfig) -> Result<Self, Fault> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| Fault::Network(format!("http client setup failed: {}", e)))?;
        Ok(FeedClient {
            http,
            cfg,
            session: None,
            poller: None,
            interactive_credentials: false,
            credentials: None,
        })
    }

    /// Authenticate with the configured (or prompted) credentials.
    pub async fn sign_in(&mut self) -> Result<(), Fault> {
        let (email, password) = self.resolve_credentials()?;
        let url = format!(
            "{}/accounts:signInWithPassword?key={}",
            self.cfg.auth_url(),
            self.cfg.api_key.as_deref().unwrap_or("")
        );
        let body = json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                // unreachable auth endpoint counts as a transient rejection
                return Err(self.auth_fault(format!("auth endpoint unreachable: {}", e), true));
            }
        };

        if response.status().is_success() {
            let session: Session = response
                .json()
                .await
                .map_err(|e| Fault::Network(format!("malformed auth response: {}", e)))?;
            debug!("logged in as uid {}", session.local_id);
            self.session = Some(session);
            return Ok(());
        }

        let status = response.status();
        let detail = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP {}", status));
        let transient = detail.starts_with("TOO_MANY_ATTEMPTS");
        Err(self.auth_fault(format!("sign-in rejected: {}", detail), transient))
    }

    fn auth_fault(&self, message: String, transient: bool) -> Fault {
        Fault::Auth {
            message,
            // a typed-in password that was rejected is not worth retrying
            retriable: transient && !self.interactive_credentials,
        }
    }

    fn resolve_credentials(&mut self) -> Result<(String, String), Fault> {
        if let Some(pair) = &self.credentials {
            return Ok(pair.clone());
        }
        let email = match self.cfg.email.clone() {
            Some(e) if !e.is_empty() => e,
            _ => {
                self.interactive_credentials = true;
                prompt_line("Feed email: ")?
            }
        };
        let password = match self.cfg.password.clone() {
            Some(p) if !p.is_empty() => p,
            _ => {
                self.interactive_credentials = true;
                warn!("password echo is visible on this terminal");
                prompt_line("Feed password: ")?
            }
        };
        self.credentials = Some((email.clone(), password.clone()));
        Ok((email, password))
    }

    /// Start the background poller delivering the newest post whenever
    /// the backing collection changes. At most one poller is alive.
    pub fn subscribe_latest(&mut self, tx: mpsc::Sender<Event>) -> Result<(), Fault> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Fault::Network("subscribe without a signed-in session".to_string()))?;
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }

        let http = self.http.clone();
        let url = format!(
            "{}/users/{}/posts.json",
            self.database_url(),
            session.local_id
        );
        let token = session.id_token;
        let period = Duration::from_secs(self.cfg.poll_secs());

        self.poller = Some(tokio::spawn(async move {
            // last delivered snapshot; the first poll always delivers
            let mut last: Option<Option<Value>> = None;
            loop {
                match fetch_latest(&http, &url, &token).await {
                    Ok(latest) => {
                        if last.as_ref() != Some(&latest) {
                            last = Some(latest.clone());
                            if tx.send(Event::FeedChange(Ok(latest))).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(fault) => {
                        if tx.send(Event::FeedChange(Err(fault))).await.is_err() {
                            break;
                        }
                    }
                }
                tokio::time::sleep(period).await;
            }
        }));
        debug!("subscribed to latest-post feed");
        Ok(())
    }

    /// Report device liveness to the feed.
    pub async fn report_liveness(&self, timestamp_ms: i64) -> Result<(), Fault> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Fault::Network("liveness report without a signed-in session".to_string()))?;
        let url = format!(
            "{}/users/{}/lastHeartbeat.json",
            self.database_url(),
            session.local_id
        );
        let response = self
            .http
            .put(&url)
            .query(&[("auth", session.id_token.as_str())])
            .json(&timestamp_ms)
            .send()
            .await
            .map_err(|e| Fault::Network(format!("liveness report failed: {}", e)))?;
        classify_status(response.status(), "liveness report")
    }

    /// Drop the session and stop the poller.
    pub fn sign_out(&mut self) {
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
        if self.session.take().is_some() {
            debug!("signed out stale session");
        }
    }

    fn database_url(&self) -> &str {
        self.cfg.database_url.as_deref().unwrap_or("").trim_end_matches('/')
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
    }
}

async fn fetch_latest(http: &Client, url: &str, token: &str) -> Result<Option<Value>, Fault> {
    let response = http
        .get(url)
        .query(&[
            ("auth", token),
            ("orderBy", "\"timePosted\""),
            ("limitToLast", "1"),
        ])
        .send()
        .await
        .map_err(|e| Fault::Network(format!("feed poll failed: {}", e)))?;
    classify_status(response.status(), "feed poll")?;
    let snapshot: Value = response
        .json()
        .await
        .map_err(|e| Fault::Network(format!("malformed feed snapshot: {}", e)))?;
    latest_from_snapshot(snapshot)
}

/// HTTP status to fault kind. An expired or revoked token shows up as
/// 401/403 and is retriable: the recovery cycle signs in again.
fn classify_status(status: StatusCode, what: &str) -> Result<(), Fault> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Fault::Auth {
            message: format!("{} rejected: HTTP {}", what, status),
            retriable: true,
        });
    }
    Err(Fault::Network(format!("{} failed: HTTP {}", what, status)))
}

fn prompt_line(label: &str) -> Result<String, Fault> {
    print!("{}", label);
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .map_err(|e| Fault::Auth {
            message: format!("credential prompt failed: {}", e),
            retriable: false,
        })?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_post_passes_validation() {
        let raw = json!({"text": "hi", "timePosted": 100, "uuid": "a"});
        let post = validate_post(&raw).unwrap();
        assert_eq!(
            post,
            Post { text: "hi".to_string(), time_posted: 100, uuid: "a".to_string() }
        );
    }

    #[test]
    fn test_fractional_timestamp_is_accepted() {
        let raw = json!({"text": "hi", "timePosted": 100.5, "uuid": "a"});
        assert_eq!(validate_post(&raw).unwrap().time_posted, 100);
    }

    #[test]
    fn test_missing_field_is_a_data_fault() {
        let raw = json!({"text": "hi", "uuid": "a"});
        assert!(matches!(validate_post(&raw), Err(Fault::Data(_))));
    }

    #[test]
    fn test_wrong_field_type_is_a_data_fault() {
        let raw = json!({"text": 7, "timePosted": 100, "uuid": "a"});
        assert!(matches!(validate_post(&raw), Err(Fault::Data(_))));
        let raw = json!({"text": "hi", "timePosted": "100", "uuid": "a"});
        assert!(matches!(validate_post(&raw), Err(Fault::Data(_))));
    }

    #[test]
    fn test_non_object_record_is_a_data_fault() {
        assert!(matches!(validate_post(&json!("hello")), Err(Fault::Data(_))));
    }

    #[test]
    fn test_snapshot_unwrapping() {
        assert_eq!(latest_from_snapshot(Value::Null).unwrap(), None);

        let snap = json!({"-Nabc": {"text": "hi", "timePosted": 1, "uuid": "a"}});
        let latest = latest_from_snapshot(snap).unwrap().unwrap();
        assert_eq!(latest.get("uuid").and_then(Value::as_str), Some("a"));

        assert!(matches!(latest_from_snapshot(json!([1, 2])), Err(Fault::Data(_))));
    }
}
