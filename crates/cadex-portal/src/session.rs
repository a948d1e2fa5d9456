//! Portal session bootstrap.
//!
//! The landing page sets the session cookies and carries the session-scoped
//! paths every later request is built from. The manager fetches it until it
//! gets a structurally valid page, retrying forever on a fixed delay.

use std::sync::{Arc, OnceLock};

use cadex_core::PortalConfig;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::events::{EventSink, PortalEvent};
use crate::transport::{PortalRequest, Transport};
use crate::PortalError;

fn address_radio() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<input type="radio" name="search_type" value="ADDRESS".+>"#)
            .expect("valid regex")
    })
}

fn captcha_src() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"#captchaImage2'\)\.attr\('src',\s'(?<path>[^']+)").expect("valid regex")
    })
}

fn form_action() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<form action="(?<path>[^"]+)"#).expect("valid regex"))
}

/// Session-scoped paths scraped from the landing page, relative to the
/// portal root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Base path of the session (`<base href>` minus the portal root).
    pub session_path: String,
    /// Captcha image path; not used by searches.
    pub captcha_path: String,
    /// Search form submission path.
    pub form_path: String,
    /// Raw landing page, the source of the subject and street-type lists.
    pub landing_page: String,
}

impl SessionInfo {
    /// Validate a landing page and pull the session paths out of it.
    pub fn from_landing_page(config: &PortalConfig, body: &str) -> Result<Self, PortalError> {
        if !address_radio().is_match(body) {
            return Err(PortalError::Structure(
                "landing page has no address search control".into(),
            ));
        }

        let base = Regex::new(&format!(
            r#"<base href="{}(?<path>[^"]+)"#,
            regex::escape(config.portal_url.trim_end_matches('/'))
        ))
        .map_err(|e| PortalError::Structure(e.to_string()))?;
        let session_path = capture(&base, body).unwrap_or_default();
        let captcha = capture(captcha_src(), body).unwrap_or_default();
        let action = capture(form_action(), body)
            .ok_or_else(|| PortalError::Structure("landing page has no search form".into()))?;

        Ok(Self {
            captcha_path: format!("{session_path}{captcha}"),
            form_path: format!("{session_path}{action}"),
            session_path,
            landing_page: body.to_string(),
        })
    }

    pub fn form_url(&self, config: &PortalConfig) -> String {
        config.portal(&self.form_path)
    }
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.name("path"))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected(Arc<SessionInfo>),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }
}

/// Owns the `Disconnected → Connecting → Connected` lifecycle.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: Arc<PortalConfig>,
    events: EventSink,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<PortalConfig>, events: EventSink) -> Self {
        Self {
            transport,
            config,
            events,
            state: watch::Sender::new(SessionState::Disconnected),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The established session, if any.
    pub fn current(&self) -> Option<Arc<SessionInfo>> {
        match &*self.state.borrow() {
            SessionState::Connected(info) => Some(Arc::clone(info)),
            _ => None,
        }
    }

    /// Wait until a session is established by whoever is connecting.
    pub async fn wait_connected(&self) -> Arc<SessionInfo> {
        let mut rx = self.state.subscribe();
        loop {
            if let SessionState::Connected(info) = &*rx.borrow_and_update() {
                return Arc::clone(info);
            }
            // `self` owns the sender, so the channel stays open.
            let _ = rx.changed().await;
        }
    }

    /// Connect, retrying until the portal hands out a valid session.
    ///
    /// Only the first caller drives the loop; concurrent callers wait for it.
    pub async fn connect(&self) -> Arc<SessionInfo> {
        let claimed = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Disconnected) {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return self.wait_connected().await;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(info) => {
                    info!(attempt, form = %info.form_path, "portal session established");
                    let info = Arc::new(info);
                    self.state
                        .send_replace(SessionState::Connected(Arc::clone(&info)));
                    self.events.send(PortalEvent::Connected);
                    return info;
                }
                Err(e) => {
                    let delay = self.config.connect_retry_delay();
                    self.events.warn(format!(
                        "{e}; could not connect, retrying in {} s",
                        delay.as_secs_f32()
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<SessionInfo, PortalError> {
        let url = self.config.landing_url();
        debug!(url = %url, "fetching landing page");
        let request = PortalRequest::get(&url)
            .header("Upgrade-Insecure-Requests", "1")
            .header("Cache-Control", "max-age=0");
        let response = self.transport.execute(request).await?;
        if !response.is_ok() {
            return Err(PortalError::Status {
                status: response.status,
                url,
            });
        }
        SessionInfo::from_landing_page(&self.config, &response.body)
    }
}
