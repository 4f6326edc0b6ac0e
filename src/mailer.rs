use std::path::Path;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("failed to read mailer config: {0}")]
    Config(#[from] figment::Error),
}

/// Something that can tell a human about the UPS.
pub trait Notifier {
    fn notify(&self, subject: &str, message: &str);
}

#[derive(Deserialize, Serialize, Debug)]
pub struct MailerSettings {
    pub user: String,
    pub pass: String,
    pub relay: String,
    pub from: String,
    pub to: Vec<String>,
    pub machine_id: Option<String>,
}

impl MailerSettings {
    /// Mail is optional; no config file means no mailer.
    pub fn load(path: &Path) -> Result<Option<MailerSettings>, MailerError> {
        if !path.exists() {
            return Ok(None);
        }
        let settings = Figment::new().merge(Toml::file(path)).extract()?;
        Ok(Some(settings))
    }
}

pub struct Mailer {
    from: Mailbox,
    vec_to: Vec<Mailbox>,
    machine_id: String,
    relay: SmtpTransport,
}

impl Mailer {
    pub fn new(settings: MailerSettings) -> Result<Mailer, MailerError> {
        let machine_id = match settings.machine_id {
            Some(id) => id,
            None => hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "ups".to_string()),
        };

        let vec_to = settings
            .to
            .iter()
            .map(|to| to.parse())
            .collect::<Result<Vec<Mailbox>, _>>()?;

        Ok(Mailer {
            from: settings.from.parse()?,
            vec_to,
            machine_id,
            relay: SmtpTransport::relay(&settings.relay)?
                .credentials(Credentials::new(settings.user, settings.pass))
                .build(),
        })
    }

    pub fn send(&self, subject: &str, message: &str) -> Result<(), MailerError> {
        let mut builder = Message::builder().from(self.from.clone());
        for to in &self.vec_to {
            builder = builder.to(to.clone());
        }
        let email = builder
            .subject(format!("{}: {}", self.machine_id, subject))
            .body(message.to_string())?;

        self.relay.send(&email)?;
        Ok(())
    }
}

impl Notifier for Mailer {
    fn notify(&self, subject: &str, message: &str) {
        if cfg!(debug_assertions) {
            info!(subject, "in debug build, not sending email");
        } else if let Err(e) = self.send(subject, message) {
            warn!(error = %e, subject, "failed to send email");
        }
    }
}
