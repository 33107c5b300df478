//! Clock control: NTP, manual time, and the optional DS1307 hardware clock.

use crate::registry::OperationRegistry;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, Utc};
use power_common::{CommandRunner, Marker, PowerError, SystemCommand};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// I2C bus the clock module sits on
const I2C_BUS: &str = "1";

const I2C_NEW_DEVICE: &str = "/sys/class/i2c-adapter/i2c-1/new_device";

const RTC_MODULE: &str = "rtc-ds1307";

/// Format of `hwclock -r`, e.g. `2022-05-24 00:06:26.623920+02:00`
const HWCLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";

/// What `i2cdetect` says about address 0x68
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct I2cClock {
    /// Something answers at 0x68, bound to a driver or not
    pub detected: bool,
    /// Present but not bound to a driver yet
    pub needs_init: bool,
}

/// Read the `60:` row of `i2cdetect -y <bus>` output.
pub fn parse_i2cdetect(output: &str) -> I2cClock {
    output
        .lines()
        .find(|line| line.starts_with("60:"))
        .map(|row| {
            let unbound = row.contains("-- 68 --");
            I2cClock {
                detected: unbound || row.contains("-- UU --"),
                needs_init: unbound,
            }
        })
        .unwrap_or_default()
}

pub fn parse_hwclock(output: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(output.trim(), HWCLOCK_FORMAT).ok()
}

/// Hardware time within the last day of `now`
pub fn hardware_time_is_recent(hardware: DateTime<FixedOffset>, now: DateTime<Utc>) -> bool {
    hardware.with_timezone(&Utc) > now - ChronoDuration::days(1)
}

/// Check `/set-time` fields: plain digits, 0-23 and 0-59.
pub fn validate_time(hours: &str, minutes: &str) -> Result<(u32, u32), PowerError> {
    let field = |name: &str, value: &str, max: u32| -> Result<u32, PowerError> {
        if value.is_empty() || value.len() > 2 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PowerError::validation(format!("{} must be digits, got '{}'", name, value)));
        }
        let n: u32 = value
            .parse()
            .map_err(|_| PowerError::validation(format!("invalid {}: '{}'", name, value)))?;
        if n > max {
            return Err(PowerError::validation(format!("{} out of range: {}", name, n)));
        }
        Ok(n)
    };
    Ok((field("hours", hours, 23)?, field("minutes", minutes, 59)?))
}

#[derive(Clone)]
pub struct ClockControl {
    runner: Arc<dyn CommandRunner>,
    registry: OperationRegistry,
}

impl ClockControl {
    pub fn new(runner: Arc<dyn CommandRunner>, registry: OperationRegistry) -> Self {
        Self { runner, registry }
    }

    /// NTP is assumed on unless `timedatectl` says otherwise.
    pub async fn ntp_enabled(&self) -> bool {
        match self.runner.run(&SystemCommand::new("timedatectl").arg("show")).await {
            Ok(output) if output.success() => !output.stdout.lines().any(|l| l.trim() == "NTP=no"),
            Ok(output) => {
                warn!("timedatectl show exited {}", output.exit_code);
                true
            }
            Err(e) => {
                warn!("timedatectl unavailable: {}", e);
                true
            }
        }
    }

    pub async fn set_ntp(&self, enabled: bool) -> Result<(), PowerError> {
        let state = if enabled { "on" } else { "off" };
        info!("Network time {}", state);
        self.run_checked(SystemCommand::privileged("timedatectl").args(["set-ntp", state]))
            .await
    }

    /// Set the wall clock to today at `hours:minutes:00`.
    pub async fn set_time(&self, hours: &str, minutes: &str) -> Result<(u32, u32), PowerError> {
        let (h, m) = validate_time(hours, minutes)?;
        let stamp = format!("{} {:02}:{:02}:00", Local::now().format("%Y-%m-%d"), h, m);
        info!("Setting time to {}", stamp);
        self.run_checked(SystemCommand::privileged("date").args(["--set", stamp.as_str()]))
            .await?;

        if self.registry.hardware_clock_detected() {
            debug!("Writing system time to the hardware clock");
            if let Err(e) = self.run_checked(SystemCommand::privileged("hwclock").arg("-w")).await {
                warn!("hardware clock not updated: {}", e);
            }
        }
        Ok((h, m))
    }

    /// Detect the clock module and reconcile it with the system clock.
    ///
    /// With `disabled`, only forgets that the clock was ever initialized.
    pub async fn check_hardware_clock(&self, disabled: bool) -> Result<bool, PowerError> {
        let markers = self.registry.markers();
        if disabled {
            debug!("Hardware clock disabled in settings");
            markers.clear(Marker::HardwareClockInitialized)?;
            self.registry.set_hardware_clock_detected(false);
            return Ok(false);
        }

        let output = self
            .runner
            .run(&SystemCommand::privileged("i2cdetect").args(["-y", I2C_BUS]))
            .await?;
        let clock = parse_i2cdetect(&output.stdout);
        self.registry.set_hardware_clock_detected(clock.detected);

        if !clock.needs_init {
            debug!("No clock module to initialize (detected: {})", clock.detected);
            markers.clear(Marker::HardwareClockInitialized)?;
            return Ok(clock.detected);
        }

        info!("Initializing hardware clock");
        self.run_checked(SystemCommand::privileged("modprobe").arg(RTC_MODULE))
            .await?;
        self.run_checked(
            SystemCommand::privileged("tee")
                .arg(I2C_NEW_DEVICE)
                .stdin("ds1307 0x68\n"),
        )
        .await?;

        if !markers.exists(Marker::HardwareClockInitialized) {
            info!("Setting the hardware clock for the first time");
            self.run_checked(SystemCommand::privileged("hwclock").arg("-w"))
                .await?;
            markers.set(Marker::HardwareClockInitialized)?;
            return Ok(true);
        }

        let output = self
            .runner
            .run(&SystemCommand::privileged("hwclock").arg("-r"))
            .await?;
        match parse_hwclock(&output.stdout) {
            Some(hardware) if hardware_time_is_recent(hardware, Utc::now()) => {
                info!("Setting system clock from hardware clock ({})", hardware);
                self.run_checked(SystemCommand::privileged("hwclock").arg("-s"))
                    .await?;
            }
            Some(hardware) => {
                // Forgetting it makes the next boot set it from network time
                warn!("Hardware clock is stale ({}), clearing marker", hardware);
                markers.clear(Marker::HardwareClockInitialized)?;
            }
            None => {
                warn!("Unreadable hwclock output: '{}'", output.stdout.trim());
                markers.clear(Marker::HardwareClockInitialized)?;
            }
        }
        Ok(true)
    }

    async fn run_checked(&self, cmd: SystemCommand) -> Result<(), PowerError> {
        let output = self.runner.run(&cmd).await?;
        if output.success() {
            Ok(())
        } else {
            Err(PowerError::Command {
                program: cmd.program,
                message: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            })
        }
    }
}
