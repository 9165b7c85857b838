use crate::config::MailSettings;
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

/// One email about new error output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Sender address, also used as display name
    pub sender: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Build the notification for bytes appended to an application's error log
    pub fn log_growth(app: &str, mail: &MailSettings, delta: &[u8]) -> Self {
        Self {
            sender: mail.from.clone(),
            to: mail.to.clone(),
            subject: format!("[{}] Error log grew", app),
            body: String::from_utf8_lossy(delta).into_owned(),
        }
    }

    /// Value of the `From` header: `"<sender>" <sender>`
    pub fn from_header(&self) -> String {
        format!("\"{}\" <{}>", self.sender, self.sender)
    }
}

/// Delivers notifications to the operator
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<()>;
}

/// Sends notifications through an SMTP relay without TLS, like a local MTA
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(mail: &MailSettings) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&mail.smtp_host)
            .port(mail.smtp_port)
            .build();

        Self { transport }
    }

    fn build_message(notification: &Notification) -> Result<Message> {
        let parse = |address: &str| {
            address.parse::<Address>().map_err(|e| {
                WardenError::NotificationDispatch(format!("Invalid address '{}': {}", address, e))
            })
        };

        let from = Mailbox::new(
            Some(notification.sender.clone()),
            parse(&notification.sender)?,
        );
        let to = Mailbox::new(None, parse(&notification.to)?);

        Message::builder()
            .from(from)
            .to(to)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| WardenError::NotificationDispatch(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn dispatch(&self, notification: &Notification) -> Result<()> {
        let message = Self::build_message(notification)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| WardenError::NotificationDispatch(e.to_string()))?;

        debug!(to = %notification.to, subject = %notification.subject, "Email handed to SMTP relay");
        Ok(())
    }
}
