//! Background acquisition.
//!
//! `AcquisitionWorker` moves an acquiring `DeviceSession` onto a dedicated
//! thread and pulls frames in a loop, handing results to the host over a
//! bounded channel. The host never blocks on the device.
//!
//! Cancellation is cooperative: the `StopSignal` is checked between pulls.
//! A pull already blocked in the driver returns only when a frame arrives or
//! the grab timeout elapses, so responsive shutdown needs a grab timeout.
//!
//! The worker pulls ahead of the host. With a queue of depth `d`, up to
//! `d + 1` converted frames wait for the host (`d` queued, one blocked in
//! `send`), so a published frame can be older than one host cycle, and
//! frames still waiting at stop are discarded. The default depth of 1 keeps
//! this to two frames.
//!
//! The worker tears the session down on its own thread before exiting, on
//! every exit path.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::acquire::{AcquirerStats, FrameAcquirer};
use crate::error::{AcquireError, ErrorKind};
use crate::frame::Frame;
use crate::session::{DeviceSession, SessionState};

const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Shared stop flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Recoverable failures in a row before the session is declared broken.
    pub max_consecutive_failures: u32,
    /// Results buffered between the worker and the host.
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            queue_depth: 1,
        }
    }
}

/// One poll of the worker.
#[derive(Debug)]
pub enum Delivery {
    Frame(Frame),
    Error(AcquireError),
    /// Nothing arrived within the poll timeout.
    Idle,
    /// The worker has exited and every result has been received.
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The stop signal was triggered.
    Stopped,
    /// The retry budget ran out, or a non-recoverable error was raised.
    Broken,
    /// The host stopped listening.
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct WorkerSummary {
    pub exit: WorkerExit,
    pub stats: AcquirerStats,
}

pub struct AcquisitionWorker {
    receiver: Option<Receiver<Result<Frame, AcquireError>>>,
    stop: StopSignal,
    join: Option<JoinHandle<WorkerSummary>>,
}

impl AcquisitionWorker {
    /// Start pulling on a new thread. The session must already be acquiring.
    pub fn spawn(
        session: DeviceSession,
        acquirer: FrameAcquirer,
        config: WorkerConfig,
        stop: StopSignal,
    ) -> Result<Self> {
        if session.state() != SessionState::Acquiring {
            bail!(
                "acquisition worker needs an acquiring session (session is {})",
                session.state()
            );
        }
        let (sender, receiver) = mpsc::sync_channel(config.queue_depth);
        let worker_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("frame-acquirer".to_string())
            .spawn(move || run_worker(session, acquirer, config, worker_stop, sender))
            .context("spawn acquisition thread")?;
        Ok(Self {
            receiver: Some(receiver),
            stop,
            join: Some(join),
        })
    }

    /// Wait up to `timeout` for the next result.
    pub fn next(&self, timeout: Duration) -> Delivery {
        let Some(receiver) = self.receiver.as_ref() else {
            return Delivery::Finished;
        };
        match receiver.recv_timeout(timeout) {
            Ok(Ok(frame)) => Delivery::Frame(frame),
            Ok(Err(err)) => Delivery::Error(err),
            Err(RecvTimeoutError::Timeout) => Delivery::Idle,
            Err(RecvTimeoutError::Disconnected) => Delivery::Finished,
        }
    }

    /// Signal the worker, wait for it to tear down the session, and report
    /// how it ended.
    pub fn stop(mut self) -> Result<WorkerSummary> {
        self.shutdown()
            .ok_or_else(|| anyhow!("acquisition worker already stopped"))?
    }

    fn shutdown(&mut self) -> Option<Result<WorkerSummary>> {
        self.stop.trigger();
        // Unblocks a worker waiting on a full channel.
        self.receiver.take();
        let join = self.join.take()?;
        Some(
            join.join()
                .map_err(|_| anyhow!("acquisition thread panicked")),
        )
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        if let Some(Err(err)) = self.shutdown() {
            log::error!("AcquisitionWorker: {}", err);
        }
    }
}

fn run_worker(
    mut session: DeviceSession,
    mut acquirer: FrameAcquirer,
    config: WorkerConfig,
    stop: StopSignal,
    sender: SyncSender<Result<Frame, AcquireError>>,
) -> WorkerSummary {
    let mut exit = WorkerExit::Stopped;

    while !stop.is_triggered() {
        let outcome = match acquirer.pull(&mut session) {
            Ok(frame) => Ok(frame),
            Err(err) if err.kind() == ErrorKind::Recoverable => {
                let failures = acquirer.stats().consecutive_failures;
                if failures >= config.max_consecutive_failures {
                    log::error!(
                        "AcquisitionWorker: {} consecutive failures, giving up: {}",
                        failures,
                        err
                    );
                    exit = WorkerExit::Broken;
                    Err(AcquireError::Broken {
                        failures,
                        last: Box::new(err),
                    })
                } else {
                    Err(err)
                }
            }
            Err(err) => {
                log::error!("AcquisitionWorker: stopping: {}", err);
                exit = WorkerExit::Broken;
                Err(err)
            }
        };

        if sender.send(outcome).is_err() {
            if exit != WorkerExit::Broken && !stop.is_triggered() {
                exit = WorkerExit::Disconnected;
            }
            break;
        }
        if exit == WorkerExit::Broken {
            break;
        }
    }

    session.teardown();
    let stats = acquirer.stats();
    log::info!(
        "AcquisitionWorker: exited ({:?}), {} frames delivered, {} incomplete, {} device errors",
        exit,
        stats.frames_delivered,
        stats.frames_incomplete,
        stats.device_errors
    );
    WorkerSummary { exit, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelFormat;
    use crate::sdk::{DeviceError, StubConfig, StubEvent, StubGrab, StubSystem};

    fn acquiring_session(system: StubSystem) -> DeviceSession {
        let mut session = DeviceSession::new(Box::new(system));
        session.start_acquisition().unwrap();
        session
    }

    fn small() -> StubConfig {
        StubConfig {
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Mono8,
            ..StubConfig::default()
        }
    }

    #[test]
    fn refuses_sessions_that_are_not_acquiring() {
        let session = DeviceSession::new(Box::new(StubSystem::new(small())));
        let result = AcquisitionWorker::spawn(
            session,
            FrameAcquirer::default(),
            WorkerConfig::default(),
            StopSignal::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn delivers_frames_until_stopped_then_tears_down() {
        let system = StubSystem::new(small());
        let probe = system.probe();
        let worker = AcquisitionWorker::spawn(
            acquiring_session(system),
            FrameAcquirer::default(),
            WorkerConfig::default(),
            StopSignal::new(),
        )
        .unwrap();

        let mut frames = 0;
        while frames < 3 {
            match worker.next(Duration::from_secs(5)) {
                Delivery::Frame(frame) => {
                    assert_eq!(frame.width, 4);
                    frames += 1;
                }
                other => panic!("unexpected delivery: {:?}", other),
            }
        }

        let summary = worker.stop().unwrap();
        assert_eq!(summary.exit, WorkerExit::Stopped);
        assert!(summary.stats.frames_delivered >= 3);
        assert_eq!(probe.outstanding(), 0);
        assert_eq!(probe.frames_acquired(), probe.frames_released());
        assert_eq!(probe.count(&StubEvent::InstanceReleased), 1);
    }

    #[test]
    fn prefetch_is_bounded_by_queue_depth() {
        let system = StubSystem::new(small());
        let probe = system.probe();
        let config = WorkerConfig::default();
        let depth = config.queue_depth as u64;
        let worker = AcquisitionWorker::spawn(
            acquiring_session(system),
            FrameAcquirer::default(),
            config,
            StopSignal::new(),
        )
        .unwrap();

        let mut received = 0u64;
        while received < 3 {
            if let Delivery::Frame(_) = worker.next(Duration::from_secs(5)) {
                received += 1;
            }
        }
        // Give the worker time to fill the queue and block.
        std::thread::sleep(Duration::from_millis(50));

        let summary = worker.stop().unwrap();
        assert!(summary.stats.frames_delivered <= received + depth + 1);
        assert_eq!(probe.outstanding(), 0);
    }

    #[test]
    fn gives_up_after_retry_budget() {
        let failures = (0..3).map(|_| StubGrab::Fail(DeviceError::transport("link down")));
        let system = StubSystem::new(small()).with_script(failures);
        let probe = system.probe();
        let worker = AcquisitionWorker::spawn(
            acquiring_session(system),
            FrameAcquirer::default(),
            WorkerConfig {
                max_consecutive_failures: 3,
                queue_depth: 4,
            },
            StopSignal::new(),
        )
        .unwrap();

        let mut errors = Vec::new();
        loop {
            match worker.next(Duration::from_secs(5)) {
                Delivery::Error(err) => errors.push(err),
                Delivery::Finished => break,
                other => panic!("unexpected delivery: {:?}", other),
            }
        }
        assert_eq!(errors.len(), 3);
        assert!(errors[..2].iter().all(|e| e.is_recoverable()));
        assert!(matches!(errors[2], AcquireError::Broken { failures: 3, .. }));

        let summary = worker.stop().unwrap();
        assert_eq!(summary.exit, WorkerExit::Broken);
        assert_eq!(probe.count(&StubEvent::EndAcquisition), 1);
    }

    #[test]
    fn pre_triggered_stop_pulls_nothing() {
        let system = StubSystem::new(small());
        let probe = system.probe();
        let stop = StopSignal::new();
        stop.trigger();
        let worker = AcquisitionWorker::spawn(
            acquiring_session(system),
            FrameAcquirer::default(),
            WorkerConfig::default(),
            stop,
        )
        .unwrap();

        assert!(matches!(
            worker.next(Duration::from_secs(5)),
            Delivery::Finished
        ));
        let summary = worker.stop().unwrap();
        assert_eq!(summary.exit, WorkerExit::Stopped);
        assert_eq!(probe.frames_acquired(), 0);
        assert_eq!(probe.count(&StubEvent::Deinit), 1);
    }
}
