use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::dkim::{DkimConfig, DkimSigningAlgorithm, DkimSigningKey};
use lettre::message::header::{HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::app::{FeedpostError, Result};
use crate::config::SmtpConfig;
use crate::notify::{Links, Outgoing, Transport};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpCredentials {
    pub user: String,
    pub pass: String,
}

impl fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// SMTP settings resolved once at startup.
pub enum TransportMode {
    Unauthenticated,
    Password(SmtpCredentials),
    Signed {
        credentials: Option<SmtpCredentials>,
        dkim: DkimConfig,
    },
}

impl fmt::Debug for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Unauthenticated => f.write_str("Unauthenticated"),
            TransportMode::Password(c) => f.debug_tuple("Password").field(c).finish(),
            TransportMode::Signed { credentials, .. } => f
                .debug_struct("Signed")
                .field("credentials", credentials)
                .field("dkim", &"<key>")
                .finish(),
        }
    }
}

impl TransportMode {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let credentials = match (non_empty(&config.user), non_empty(&config.pass)) {
            (Some(user), Some(pass)) => Some(SmtpCredentials {
                user: user.to_string(),
                pass: pass.to_string(),
            }),
            (None, None) => None,
            _ => {
                return Err(FeedpostError::Config(
                    "smtp user and pass must be set together".into(),
                ))
            }
        };

        let key = match (
            non_empty(&config.dkim_private_key),
            &config.dkim_private_key_file,
        ) {
            (Some(inline), _) => Some(inline.replace("\\n", "\n")),
            (None, Some(path)) => Some(std::fs::read_to_string(path)?),
            (None, None) => None,
        };
        let selector = non_empty(&config.dkim_selector);
        let domain = non_empty(&config.dkim_domain);

        match (key, selector, domain) {
            (Some(key), Some(selector), Some(domain)) => {
                let signing_key = DkimSigningKey::new(&key, DkimSigningAlgorithm::Rsa)
                    .map_err(|e| FeedpostError::Config(format!("invalid DKIM key: {}", e)))?;
                let dkim =
                    DkimConfig::default_config(selector.to_string(), domain.to_string(), signing_key);
                Ok(TransportMode::Signed { credentials, dkim })
            }
            (None, None, None) => Ok(match credentials {
                Some(c) => TransportMode::Password(c),
                None => TransportMode::Unauthenticated,
            }),
            _ => Err(FeedpostError::Config(
                "DKIM needs a private key, selector and domain".into(),
            )),
        }
    }

    fn credentials(&self) -> Option<&SmtpCredentials> {
        match self {
            TransportMode::Unauthenticated => None,
            TransportMode::Password(c) => Some(c),
            TransportMode::Signed { credentials, .. } => credentials.as_ref(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Delivers digests over SMTP. Port 465 uses implicit TLS, other ports
/// STARTTLS; plaintext is only used for an unauthenticated local relay.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    mode: TransportMode,
    links: Links,
    list_id: String,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig, mode: TransportMode, links: Links) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| FeedpostError::Config(format!("invalid from address: {}", e)))?;

        let mailer = match (&mode, config.port) {
            (TransportMode::Unauthenticated, _) if is_local(&config.host) => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .port(config.port)
                    .timeout(Some(SMTP_TIMEOUT))
                    .build()
            }
            (_, port) => {
                let builder = if port == 465 {
                    AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                } else {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                }
                .map_err(|e| FeedpostError::Config(format!("smtp relay: {}", e)))?
                .port(port)
                .timeout(Some(SMTP_TIMEOUT));

                match mode.credentials() {
                    Some(c) => builder
                        .credentials(Credentials::new(c.user.clone(), c.pass.clone()))
                        .build(),
                    None => builder.build(),
                }
            }
        };

        tracing::info!(
            "SMTP transport ready: {}:{} ({:?})",
            config.host,
            config.port,
            mode
        );

        Ok(Self {
            mailer,
            from,
            mode,
            links,
            list_id: format!("<feedpost.{}>", config.host),
        })
    }

    /// Bodies with the dashboard/unsubscribe footer and tracking pixel added.
    fn decorate(&self, outgoing: &Outgoing) -> (String, String) {
        let mut html = outgoing.digest.html.clone();
        let mut text = outgoing.digest.text.clone();

        let unsubscribe = outgoing
            .unsubscribe_token
            .as_deref()
            .map(|t| self.links.unsubscribe(t));
        let keep_alive = outgoing
            .tracking_token
            .as_deref()
            .map(|t| self.links.keep_alive(t));

        let mut links = Vec::new();
        if let Some(url) = &outgoing.dashboard_url {
            links.push(("profile", url.clone()));
        }
        if let Some(url) = keep_alive {
            links.push(("keep sending", url));
        }
        if let Some(url) = unsubscribe {
            links.push(("unsubscribe", url));
        }

        if !links.is_empty() {
            let anchors: Vec<String> = links
                .iter()
                .map(|(label, url)| {
                    format!(
                        "<a href=\"{}\">{}</a>",
                        html_escape::encode_double_quoted_attribute(url),
                        label
                    )
                })
                .collect();
            html.push_str(&format!(
                "<hr><p style=\"font-size: 12px; color: #666;\">{}</p>",
                anchors.join(" &bull; ")
            ));

            text.push_str("\n\n---\n");
            for (label, url) in &links {
                text.push_str(&format!("{}: {}\n", label, url));
            }
        }

        if let Some(token) = &outgoing.tracking_token {
            html.push_str(&format!(
                "<img src=\"{}\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none;\">",
                self.links.tracking_pixel(token)
            ));
        }

        (html, text)
    }

    fn build_message(&self, outgoing: &Outgoing) -> Result<Message> {
        let to: Mailbox = outgoing
            .recipient
            .parse()
            .map_err(|e| FeedpostError::Transport(format!("invalid recipient: {}", e)))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(outgoing.digest.subject.clone())
            .raw_header(header("List-Id", self.list_id.clone()))
            .raw_header(header("List-Post", "NO".into()))
            .raw_header(header("Precedence", "bulk".into()))
            .raw_header(header("Auto-Submitted", "auto-generated".into()))
            .raw_header(header("X-Mailer", "feedpost".into()));

        if let Some(url) = &outgoing.dashboard_url {
            builder = builder.raw_header(header("List-Archive", format!("<{}>", url)));
        }
        if let Some(token) = &outgoing.unsubscribe_token {
            builder = builder
                .raw_header(header(
                    "List-Unsubscribe",
                    format!("<{}>", self.links.unsubscribe(token)),
                ))
                .raw_header(header(
                    "List-Unsubscribe-Post",
                    "List-Unsubscribe=One-Click".into(),
                ));
        }

        let (html, text) = self.decorate(outgoing);
        let mut message = builder
            .multipart(MultiPart::alternative_plain_html(text, html))
            .map_err(|e| FeedpostError::Transport(format!("building message: {}", e)))?;

        if let TransportMode::Signed { dkim, .. } = &self.mode {
            message.sign(dkim);
        }

        Ok(message)
    }
}

fn header(name: &'static str, value: String) -> HeaderValue {
    HeaderValue::new(HeaderName::new_from_ascii_str(name), value)
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, outgoing: &Outgoing) -> Result<()> {
        let message = self.build_message(outgoing)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| FeedpostError::Transport(e.to_string()))?;

        tracing::debug!("Delivered digest to {}", outgoing.recipient);
        Ok(())
    }
}
