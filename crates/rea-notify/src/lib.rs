//! Notifier contract, alert email rendering, and delivery backends.

use std::time::Duration;

use askama::Template;
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rea_core::MatchEvent;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "rea-notify";

const PRICE_PREFIX: &str = "Rs.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("mail request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail api rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("smtp transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("rendering alert email: {0}")]
    Render(#[from] askama::Error),
    #[error("delivery to {recipient} failed: {reason}")]
    Failed { recipient: String, reason: String },
}

/// Delivers one message to one recipient. A single attempt; retries are the caller's concern.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

pub fn listing_link(frontend_url: &str, listing_id: impl std::fmt::Display) -> String {
    format!("{}/properties/{}", frontend_url.trim_end_matches('/'), listing_id)
}

pub fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{PRICE_PREFIX} {price:.0}")
    } else {
        format!("{PRICE_PREFIX} {price:.2}")
    }
}

#[derive(Template)]
#[template(path = "match_alert.txt")]
struct MatchAlertText<'a> {
    name: &'a str,
    search: &'a str,
    title: &'a str,
    price: &'a str,
    address: &'a str,
    link: &'a str,
}

#[derive(Template)]
#[template(path = "match_alert.html")]
struct MatchAlertHtml<'a> {
    name: &'a str,
    search: &'a str,
    title: &'a str,
    price: &'a str,
    address: &'a str,
    link: &'a str,
}

/// Builds the alert email sent to a saved search's owner for one new listing.
pub fn render_match_alert(
    event: &MatchEvent,
    frontend_url: &str,
) -> Result<EmailMessage, DeliveryError> {
    let listing = &event.listing;
    let owner = &event.search.owner;
    let link = listing_link(frontend_url, listing.id);
    let price = format_price(listing.price);

    let text = MatchAlertText {
        name: &owner.full_name,
        search: &event.search.search.name,
        title: &listing.title,
        price: &price,
        address: &listing.address,
        link: &link,
    }
    .render()?;
    let html = MatchAlertHtml {
        name: &owner.full_name,
        search: &event.search.search.name,
        title: &listing.title,
        price: &price,
        address: &listing.address,
        link: &link,
    }
    .render()?;

    Ok(EmailMessage {
        to: owner.email.clone(),
        subject: format!("New Property Alert: {}", listing.title),
        text,
        html: Some(html),
    })
}

#[derive(Debug, Clone)]
pub struct HttpMailerConfig {
    pub endpoint: String,
    pub api_key: String,
    pub sender_email: String,
    pub sender_name: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct MailParty<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MailPayload<'a> {
    sender: MailParty<'a>,
    to: Vec<MailParty<'a>>,
    subject: &'a str,
    text_content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_content: Option<&'a str>,
}

/// Sends through a JSON transactional-email API (Brevo-compatible payload).
#[derive(Debug)]
pub struct HttpEmailNotifier {
    client: reqwest::Client,
    config: HttpMailerConfig,
}

impl HttpEmailNotifier {
    pub fn new(config: HttpMailerConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for HttpEmailNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        let payload = MailPayload {
            sender: MailParty {
                email: &self.config.sender_email,
                name: Some(&self.config.sender_name),
            },
            to: vec![MailParty {
                email: &message.to,
                name: None,
            }],
            subject: &message.subject,
            text_content: &message.text,
            html_content: message.html.as_deref(),
        };

        let resp = self
            .client
            .post(&self.config.endpoint)
            .header("api-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(to = %message.to, %status, "mail api accepted message");
        Ok(())
    }
}

/// Implicit-TLS SMTP port; every other port upgrades with STARTTLS when offered.
const SMTPS_PORT: u16 = 465;

#[derive(Debug, Clone)]
pub struct SmtpMailerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sender_email: String,
    pub sender_name: String,
    pub timeout: Duration,
}

/// Sends through an SMTP relay.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: SmtpMailerConfig) -> Result<Self, DeliveryError> {
        let sender_address = config
            .sender_email
            .parse()
            .map_err(|err| DeliveryError::Failed {
                recipient: config.sender_email.clone(),
                reason: format!("invalid sender address: {err}"),
            })?;
        let sender = Mailbox::new(Some(config.sender_name.clone()), sender_address);

        let tls = TlsParameters::new(config.host.clone())?;
        let tls = if config.port == SMTPS_PORT {
            Tls::Wrapper(tls)
        } else {
            Tls::Opportunistic(tls)
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .tls(tls)
            .timeout(Some(config.timeout));
        if let (Some(user), Some(pass)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
            sender,
        })
    }

    fn build_message(&self, message: &EmailMessage) -> Result<Message, DeliveryError> {
        let failed = |reason: String| DeliveryError::Failed {
            recipient: message.to.clone(),
            reason,
        };
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|err| failed(format!("invalid recipient address: {err}")))?;

        let builder = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(message.subject.clone());
        let built = match &message.html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                html.clone(),
            )),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(message.text.clone()),
        };
        built.map_err(|err| failed(format!("building message: {err}")))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        let email = self.build_message(message)?;
        let resp = self.transport.send(email).await?;
        debug!(to = %message.to, code = %resp.code(), "smtp relay accepted message");
        Ok(())
    }
}

/// Dry-run notifier: logs instead of sending.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        info!(to = %message.to, subject = %message.subject, "dry run: alert not sent");
        debug!(body = %message.text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rea_core::{
        Listing, ListingStatus, OwnerContact, PropertyCategory, ResolvedSearch, SavedSearch,
        SearchFilters,
    };
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(title: &str) -> MatchEvent {
        let user_id = Uuid::new_v4();
        MatchEvent {
            listing: Listing {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                price: 100_000.0,
                category: PropertyCategory::House,
                bedrooms: 3,
                bathrooms: 2,
                title: title.into(),
                address: "Baluwatar, Kathmandu".into(),
                listed_by: Uuid::new_v4(),
                status: ListingStatus::Available,
            },
            search: ResolvedSearch {
                search: SavedSearch {
                    id: Uuid::new_v4(),
                    user_id,
                    name: "Houses under 1.5L".into(),
                    filters: SearchFilters::default(),
                    notification_enabled: true,
                    created_at: Utc::now(),
                },
                owner: OwnerContact {
                    user_id,
                    email: "hari@example.com".into(),
                    full_name: "Hari Gurung".into(),
                },
            },
        }
    }

    fn mailer(endpoint: String) -> HttpEmailNotifier {
        HttpEmailNotifier::new(HttpMailerConfig {
            endpoint,
            api_key: "test-key".into(),
            sender_email: "support@realestate.com".into(),
            sender_name: "Support".into(),
            timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    #[test]
    fn link_trims_trailing_slash() {
        assert_eq!(
            listing_link("https://homes.example.com/", "abc"),
            "https://homes.example.com/properties/abc"
        );
    }

    #[test]
    fn price_formatting() {
        assert_eq!(format_price(100_000.0), "Rs. 100000");
        assert_eq!(format_price(2500.5), "Rs. 2500.50");
    }

    #[test]
    fn alert_email_carries_listing_details() {
        let ev = event("Family home");
        let msg = render_match_alert(&ev, "https://homes.example.com").unwrap();
        assert_eq!(msg.to, "hari@example.com");
        assert_eq!(msg.subject, "New Property Alert: Family home");
        assert!(msg.text.starts_with("Hi Hari Gurung,"));
        assert!(msg.text.contains("\"Houses under 1.5L\""));
        assert!(msg.text.contains("Price: Rs. 100000"));
        assert!(msg.text.contains("Location: Baluwatar, Kathmandu"));
        assert!(msg
            .text
            .contains(&format!("https://homes.example.com/properties/{}", ev.listing.id)));
    }

    #[test]
    fn alert_html_is_escaped() {
        let msg =
            render_match_alert(&event("<b>Villa</b> & garden"), "http://localhost:3000").unwrap();
        let html = msg.html.unwrap();
        assert!(html.contains("&lt;b&gt;Villa&lt;/b&gt; &amp; garden"));
        assert!(!html.contains("<b>Villa"));
        assert!(html.starts_with("<p>Hi Hari Gurung,</p>"));
        assert!(msg.text.contains("Title: <b>Villa</b> & garden"));
        assert_eq!(msg.subject, "New Property Alert: <b>Villa</b> & garden");
    }

    #[tokio::test]
    async fn http_notifier_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/smtp/email"))
            .and(header("api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "subject": "New Property Alert: Family home",
                "to": [{ "email": "hari@example.com" }],
                "sender": { "email": "support@realestate.com", "name": "Support" }
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let msg = render_match_alert(&event("Family home"), "http://localhost:3000").unwrap();
        mailer(format!("{}/v3/smtp/email", server.uri()))
            .send(&msg)
            .await
            .expect("delivered");
    }

    #[tokio::test]
    async fn http_notifier_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid recipient"))
            .mount(&server)
            .await;

        let msg = render_match_alert(&event("Family home"), "http://localhost:3000").unwrap();
        let err = mailer(server.uri()).send(&msg).await.unwrap_err();
        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid recipient");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let msg = render_match_alert(&event("Plot"), "http://localhost:3000").unwrap();
        LogNotifier.send(&msg).await.unwrap();
    }

    fn smtp(port: u16) -> SmtpNotifier {
        SmtpNotifier::new(SmtpMailerConfig {
            host: "127.0.0.1".into(),
            port,
            username: Some("mailer".into()),
            password: Some("secret".into()),
            sender_email: "support@realestate.com".into(),
            sender_name: "Support".into(),
            timeout: Duration::from_secs(2),
        })
        .expect("smtp transport")
    }

    #[tokio::test]
    async fn smtp_message_is_multipart_with_sender() {
        let msg = render_match_alert(&event("Family home"), "http://localhost:3000").unwrap();
        let built = smtp(2525).build_message(&msg).unwrap();
        let raw = String::from_utf8(built.formatted()).unwrap();
        assert!(raw.contains("From: Support <support@realestate.com>"));
        assert!(raw.contains("To: hari@example.com"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
    }

    #[tokio::test]
    async fn smtp_rejects_bad_recipient_before_connecting() {
        let mut msg = render_match_alert(&event("Plot"), "http://localhost:3000").unwrap();
        msg.to = "not an address".into();
        match smtp(2525).send(&msg).await.unwrap_err() {
            DeliveryError::Failed { recipient, .. } => assert_eq!(recipient, "not an address"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn smtp_unreachable_relay_is_a_delivery_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let msg = render_match_alert(&event("Plot"), "http://localhost:3000").unwrap();
        let err = smtp(port).send(&msg).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Smtp(_)));
    }

    #[test]
    fn smtp_rejects_bad_sender() {
        let err = SmtpNotifier::new(SmtpMailerConfig {
            host: "127.0.0.1".into(),
            port: 25,
            username: None,
            password: None,
            sender_email: "support at realestate".into(),
            sender_name: "Support".into(),
            timeout: Duration::from_secs(2),
        })
        .err()
        .expect("invalid sender");
        assert!(matches!(err, DeliveryError::Failed { .. }));
    }
}
