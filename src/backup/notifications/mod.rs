use crate::backup::notifications::smtp::SmtpNotificationConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::AddMsg;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::result;
use validator::{Validate, ValidationErrors};

pub mod smtp;

/// Where backup outcomes are reported.
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum NotificationConfig {
    /// Writes the outcome to the tracing log only
    Log,
    Smtp(SmtpNotificationConfig),
}

impl Validate for NotificationConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            Self::Log => Ok(()),
            Self::Smtp(inner) => inner.validate(),
        }
    }
}

impl Notification for NotificationConfig {
    fn send(&self, topic: &str, msg: &str) -> Result<()> {
        match self {
            Self::Log => {
                tracing::info!("{}: {}", topic, msg);
                Ok(())
            }
            Self::Smtp(inner) => inner.send(topic, msg),
        }
    }
}

pub trait Notification: Send + Sync {
    fn send(&self, topic: &str, msg: &str) -> Result<()>;
}

/// Sends to every target, attempting all of them before reporting failures.
pub fn notify_all<N: Notification>(targets: &[N], topic: &str, msg: &str) -> Result<()> {
    let errors: Vec<Error> = targets
        .iter()
        .enumerate()
        .filter_map(|(i, target)| {
            target
                .send(topic, msg)
                .add_msg(format!("Notification target #{} failed", i))
                .err()
        })
        .collect();
    convert_error_vec(errors)
}
