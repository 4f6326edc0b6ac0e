use std::{
    io, thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::mailer::Notifier;
use crate::settings::Settings;
use crate::sink::{Health, HealthFile, StatusSink};
use crate::tracker::{ChargeTracker, Estimate, Observation, OutputAlarm};
use crate::ups::{Reading, SerialChannel, UPSError, UPS};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("UPS transport failed: {0}")]
    Transport(#[source] UPSError),
    #[error("failed to write status: {0}")]
    Sink(#[from] io::Error),
    #[error("giving up after {failures} bad cycles in a row, last: {last}")]
    GaveUp { failures: u32, last: UPSError },
}

#[derive(Debug)]
pub enum CycleOutcome {
    Published(Reading),
    Skipped { failures: u32, reason: UPSError },
}

pub struct Monitor<C: SerialChannel> {
    ups: UPS<C>,
    sink: StatusSink,
    health: Option<HealthFile>,
    tracker: ChargeTracker,
    notifier: Option<Box<dyn Notifier>>,
    max_failures: u32,
    failures: u32,
    poll_delay: Duration,
}

impl<C: SerialChannel> Monitor<C> {
    pub fn new(
        ups: UPS<C>,
        settings: &Settings,
        notifier: Option<Box<dyn Notifier>>,
    ) -> Monitor<C> {
        Monitor {
            ups,
            sink: StatusSink::new(settings.status_file.clone(), settings.console),
            health: health_file(settings),
            tracker: ChargeTracker::new(settings.low_output_mv),
            notifier,
            max_failures: settings.max_consecutive_failures,
            failures: 0,
            poll_delay: settings.poll_delay(),
        }
    }

    fn notify(&self, subject: &str, message: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(subject, message);
        }
    }

    fn record_health(&self, health: Health) {
        record_health(self.health.as_ref(), &health);
    }

    /// Marks the daemon as dead for anyone watching the health file.
    pub fn record_failure(&self, err: &MonitorError) {
        self.record_health(Health::Failed {
            reason: err.to_string(),
        });
        self.notify("UPS monitor stopped.", &err.to_string());
    }

    /// Polls the UPS once and publishes the result.
    ///
    /// A bad frame or a silent device skips the cycle and leaves the status file alone;
    /// only transport errors, sink errors or too many bad cycles in a row are returned.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, MonitorError> {
        let reading = match self.ups.poll() {
            Ok(reading) => reading,
            Err(e) if e.is_fatal() => return Err(MonitorError::Transport(e)),
            Err(e) => return self.skip(e),
        };

        self.sink.publish(&reading.line)?;
        if self.failures > 0 {
            info!(failures = self.failures, "UPS readings recovered");
        }
        self.failures = 0;
        self.record_health(Health::Ok {
            line: reading.line.clone(),
        });
        debug!(
            status = reading.line.trim_end(),
            version = %reading.fields.version,
            "published status"
        );

        let observation = self
            .tracker
            .observe(
                reading.state,
                &reading.fields.batcap,
                &reading.fields.vout,
                Instant::now(),
            );
        self.report(&reading, &observation);

        Ok(CycleOutcome::Published(reading))
    }

    fn skip(&mut self, reason: UPSError) -> Result<CycleOutcome, MonitorError> {
        self.failures += 1;
        warn!(
            failures = self.failures,
            max = self.max_failures,
            error = %reason,
            "skipping cycle"
        );

        if self.failures >= self.max_failures {
            return Err(MonitorError::GaveUp {
                failures: self.failures,
                last: reason,
            });
        }

        self.record_health(Health::Stale {
            failures: self.failures,
            reason: reason.to_string(),
        });
        if self.failures == 1 {
            self.notify(
                "UPS communication failed - retrying.",
                &format!(
                    "Status file {} is now stale.\n{}",
                    self.sink.path().display(),
                    reason
                ),
            );
        }

        Ok(CycleOutcome::Skipped {
            failures: self.failures,
            reason,
        })
    }

    fn report(&self, reading: &Reading, observation: &Observation) {
        if let Some(transition) = observation.transition {
            match transition.from {
                Some(from) => info!(%from, to = %transition.to, "charge state changed"),
                None => info!(state = %transition.to, "first reading"),
            }
            if transition.mains_lost() {
                self.notify("Utility failed.", &reading.line);
            } else if transition.mains_restored() {
                self.notify("Utility back.", &reading.line);
            }
        }

        match observation.estimate {
            Some(Estimate::UntilFull(left)) => {
                info!(minutes = left.as_secs() / 60, "estimated time to full charge")
            }
            Some(Estimate::UntilEmpty(left)) => {
                info!(minutes = left.as_secs() / 60, "estimated time to empty battery")
            }
            None => {}
        }

        match observation.output {
            Some(OutputAlarm::Low(millivolts)) => {
                warn!(millivolts, "UPS output voltage low");
                self.notify("UPS output voltage low.", &reading.line);
            }
            Some(OutputAlarm::Recovered(millivolts)) => {
                info!(millivolts, "UPS output voltage recovered");
                self.notify("UPS output voltage recovered.", &reading.line);
            }
            None => {}
        }
    }

    /// Runs cycles forever, sleeping `poll_delay` between them.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        loop {
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "UPS monitor stopping");
                self.record_failure(&e);
                return Err(e);
            }
            thread::sleep(self.poll_delay);
        }
    }
}

fn health_file(settings: &Settings) -> Option<HealthFile> {
    settings
        .health_file()
        .map(|path| HealthFile::new(path.to_path_buf()))
}

// Health output is advisory; losing it must not stop the status updates.
fn record_health(file: Option<&HealthFile>, health: &Health) {
    if let Some(file) = file {
        if let Err(e) = file.record(health) {
            warn!(error = %e, "failed to write health file");
        }
    }
}

/// Checks a freshly opened UPS is talking before the first cycle.
///
/// A device that fails to open or stays silent marks the health file `failed`, so a
/// daemon that never started is not mistaken for one serving an old reading.
pub fn bring_up<C: SerialChannel>(
    opened: Result<UPS<C>, UPSError>,
    settings: &Settings,
) -> Result<UPS<C>, UPSError> {
    let result = opened.and_then(|mut ups| {
        ups.probe(settings.startup_timeout())?;
        Ok(ups)
    });

    if let Err(e) = &result {
        error!(device = %settings.device, error = %e, "UPS did not come up");
        record_health(
            health_file(settings).as_ref(),
            &Health::Failed {
                reason: e.to_string(),
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ChargeState, DecodeError};
    use crate::ups::tests::ScriptedChannel;
    use crate::ups::WaitPolicy;
    use std::{cell::RefCell, fs, rc::Rc};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl Notifier for Recorder {
        fn notify(&self, subject: &str, _message: &str) {
            self.0.borrow_mut().push(subject.to_string());
        }
    }

    fn monitor(
        dir: &std::path::Path,
        channel: ScriptedChannel,
        recorder: &Recorder,
    ) -> (Monitor<ScriptedChannel>, Settings) {
        let settings = Settings {
            status_file: dir.join("UPSstat.info"),
            health_file: dir.join("UPSstat.health"),
            console: false,
            max_consecutive_failures: 3,
            ..Settings::default()
        };
        let ups = UPS::new(channel, 100, WaitPolicy::unbounded(Duration::ZERO));
        let monitor = Monitor::new(ups, &settings, Some(Box::new(recorder.clone())));
        (monitor, settings)
    }

    const CHARGING: &[u8] = b"$ SmartUPS V3.2P,Vin GOOD,BATCAP 57,Vout 5250 $";
    const ON_BATTERY: &[u8] = b"$ SmartUPS V3.2P,Vin NG,BATCAP 56,Vout 5210 $";
    const SAGGING: &[u8] = b"$ SmartUPS V3.2P,Vin NG,BATCAP 12,Vout 5050 $";

    #[test]
    fn publishes_status_and_health() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let channel = ScriptedChannel::with_chunks(&[CHARGING]);
        let (mut monitor, settings) = monitor(dir.path(), channel, &recorder);

        let outcome = monitor.run_cycle().unwrap();
        assert!(matches!(outcome, CycleOutcome::Published(ref r) if r.state == ChargeState::Charging));

        let status = fs::read_to_string(&settings.status_file).unwrap();
        assert_eq!(status, "Charging(57%,5250mV)\n");
        let health = fs::read_to_string(&settings.health_file).unwrap();
        assert!(health.starts_with("ok "));
        assert!(health.ends_with(" Charging(57%,5250mV)\n"));
    }

    #[test]
    fn bad_frame_keeps_last_status() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let chunks: [&[u8]; 2] = [CHARGING, b"$ SmartUPS V3.2P,Vin GOOD $"];
        let channel = ScriptedChannel::with_chunks(&chunks);
        let (mut monitor, settings) = monitor(dir.path(), channel, &recorder);

        monitor.run_cycle().unwrap();
        let outcome = monitor.run_cycle().unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped {
                failures: 1,
                reason: UPSError::Decode(DecodeError::MissingField("vin"))
            }
        ));

        let status = fs::read_to_string(&settings.status_file).unwrap();
        assert_eq!(status, "Charging(57%,5250mV)\n");
        let health = fs::read_to_string(&settings.health_file).unwrap();
        assert!(health.starts_with("stale "));
        assert_eq!(
            *recorder.0.borrow(),
            vec!["UPS communication failed - retrying.".to_string()]
        );
    }

    #[test]
    fn gives_up_after_consecutive_failures() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let chunks: [&[u8]; 6] = [b"noise", b"noise", CHARGING, b"x", b"x", b"x"];
        let channel = ScriptedChannel::with_chunks(&chunks);
        let (mut monitor, _) = monitor(dir.path(), channel, &recorder);

        assert!(matches!(monitor.run_cycle(), Ok(CycleOutcome::Skipped { failures: 1, .. })));
        assert!(matches!(monitor.run_cycle(), Ok(CycleOutcome::Skipped { failures: 2, .. })));
        // A good cycle resets the run of failures.
        assert!(matches!(monitor.run_cycle(), Ok(CycleOutcome::Published(_))));
        assert!(matches!(monitor.run_cycle(), Ok(CycleOutcome::Skipped { failures: 1, .. })));
        assert!(matches!(monitor.run_cycle(), Ok(CycleOutcome::Skipped { failures: 2, .. })));
        assert!(matches!(
            monitor.run_cycle(),
            Err(MonitorError::GaveUp { failures: 3, .. })
        ));
    }

    #[test]
    fn transport_errors_stop_the_monitor() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let mut channel = ScriptedChannel::default();
        channel
            .chunks
            .push_back(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")));
        let (mut monitor, settings) = monitor(dir.path(), channel, &recorder);

        let err = monitor.run().unwrap_err();
        assert!(matches!(err, MonitorError::Transport(_)));
        assert!(!settings.status_file.exists());
        let health = fs::read_to_string(&settings.health_file).unwrap();
        assert!(health.starts_with("failed "));
        assert_eq!(*recorder.0.borrow(), vec!["UPS monitor stopped.".to_string()]);
    }

    #[test]
    fn alerts_on_mains_loss_and_return() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let channel = ScriptedChannel::with_chunks(&[CHARGING, ON_BATTERY, ON_BATTERY, CHARGING]);
        let (mut monitor, settings) = monitor(dir.path(), channel, &recorder);

        for _ in 0..4 {
            monitor.run_cycle().unwrap();
        }
        assert_eq!(
            *recorder.0.borrow(),
            vec!["Utility failed.".to_string(), "Utility back.".to_string()]
        );
        let status = fs::read_to_string(&settings.status_file).unwrap();
        assert_eq!(status, "Charging(57%,5250mV)\n");
    }

    #[test]
    fn alerts_once_on_low_output_voltage() {
        let dir = tempdir().unwrap();
        let recorder = Recorder::default();
        let channel = ScriptedChannel::with_chunks(&[ON_BATTERY, SAGGING, SAGGING, CHARGING]);
        let (mut monitor, _) = monitor(dir.path(), channel, &recorder);

        for _ in 0..4 {
            monitor.run_cycle().unwrap();
        }
        assert_eq!(
            *recorder.0.borrow(),
            vec![
                "Utility failed.".to_string(),
                "UPS output voltage low.".to_string(),
                "Utility back.".to_string(),
                "UPS output voltage recovered.".to_string(),
            ]
        );
    }

    fn startup_settings(dir: &std::path::Path) -> Settings {
        Settings {
            health_file: dir.join("UPSstat.health"),
            startup_timeout: 0,
            ..Settings::default()
        }
    }

    #[test]
    fn silent_device_at_start_marks_health_failed() {
        let dir = tempdir().unwrap();
        let settings = startup_settings(dir.path());
        fs::write(
            &settings.health_file,
            "ok 2026-10-16T12:00:00Z Charging(57%,5250mV)\n",
        )
        .unwrap();

        let mut channel = ScriptedChannel::default();
        channel.available = std::iter::repeat(0).take(100).collect();
        let ups = UPS::new(channel, 100, WaitPolicy::unbounded(Duration::ZERO));

        let err = bring_up(Ok(ups), &settings).err().unwrap();
        assert!(matches!(err, UPSError::Timeout(_)));
        let health = fs::read_to_string(&settings.health_file).unwrap();
        assert!(health.starts_with("failed "));
    }

    #[test]
    fn device_that_fails_to_open_marks_health_failed() {
        let dir = tempdir().unwrap();
        let settings = startup_settings(dir.path());

        let opened: Result<UPS<ScriptedChannel>, UPSError> = Err(UPSError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "no such device",
        )));
        assert!(bring_up(opened, &settings).is_err());

        let health = fs::read_to_string(&settings.health_file).unwrap();
        assert!(health.starts_with("failed "));
        assert!(health.ends_with(" no such device\n"));
    }

    #[test]
    fn talking_device_comes_up_untouched() {
        let dir = tempdir().unwrap();
        let settings = startup_settings(dir.path());
        let ups = UPS::new(
            ScriptedChannel::default(),
            100,
            WaitPolicy::unbounded(Duration::ZERO),
        );

        assert!(bring_up(Ok(ups), &settings).is_ok());
        assert!(!settings.health_file.exists());
    }
}
