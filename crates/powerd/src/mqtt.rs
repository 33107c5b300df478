//! Anonymous access to the local MQTT broker.

use power_common::{CommandRunner, PowerError, SystemCommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const ALLOW_ANONYMOUS: &str = "allow_anonymous";

pub const MOSQUITTO_SERVICE: &str = "mosquitto.service";

/// Whether `conf` allows anonymous clients. A missing file reads as no.
pub fn anonymous_allowed(conf: &Path) -> bool {
    fs::read_to_string(conf)
        .map(|text| text.contains("allow_anonymous true"))
        .unwrap_or(false)
}

/// Rewrite every `allow_anonymous` line; append one when there is none.
pub fn rewrite_allow_anonymous(text: &str, allow: bool) -> String {
    let setting = format!("{} {}", ALLOW_ANONYMOUS, allow);
    let mut found = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            if line.trim_start().starts_with(ALLOW_ANONYMOUS) {
                found = true;
                setting.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(setting);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Clone)]
pub struct MqttControl {
    runner: Arc<dyn CommandRunner>,
    conf: PathBuf,
}

impl MqttControl {
    pub fn new(runner: Arc<dyn CommandRunner>, conf: PathBuf) -> Self {
        Self { runner, conf }
    }

    pub fn anonymous_allowed(&self) -> bool {
        anonymous_allowed(&self.conf)
    }

    /// Change the setting and restart the broker in the background.
    pub fn set_anonymous(&self, allow: bool) -> Result<(), PowerError> {
        let text = fs::read_to_string(&self.conf).map_err(|e| PowerError::io(&self.conf, e))?;
        fs::write(&self.conf, rewrite_allow_anonymous(&text, allow))
            .map_err(|e| PowerError::io(&self.conf, e))?;
        info!("Anonymous MQTT {}", if allow { "allowed" } else { "refused" });

        self.runner.spawn_detached(
            &SystemCommand::privileged("systemctl").args(["restart", MOSQUITTO_SERVICE]),
        )
    }
}
