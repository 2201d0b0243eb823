//! Host side of the pipeline: where frames go and how often.
//!
//! The host pulls finished frames from an `AcquisitionWorker`, hands them to a
//! `FrameSink` and paces itself with a `Rate`. It never talks to the camera.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use crate::error::{AcquireError, ErrorKind};
use crate::frame::Frame;
use crate::worker::{AcquisitionWorker, Delivery, StopSignal};

const LOG_EVERY_FRAMES: u64 = 100;

/// Destination for published frames.
pub trait FrameSink {
    fn publish(&mut self, frame: &Frame) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame) -> Result<()>,
{
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        self(frame)
    }
}

/// Sink that reports every frame to the log under a topic name.
#[derive(Debug)]
pub struct LogSink {
    topic: String,
    published: u64,
}

impl LogSink {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            published: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl FrameSink for LogSink {
    fn publish(&mut self, frame: &Frame) -> Result<()> {
        self.published += 1;
        log::debug!(
            "{}: frame {} {}x{} {} mean={:.1}",
            self.topic,
            frame.frame_id,
            frame.width,
            frame.height,
            frame.encoding(),
            frame.mean_luminance()
        );
        if self.published % LOG_EVERY_FRAMES == 0 {
            log::info!("{}: {} frames published", self.topic, self.published);
        }
        Ok(())
    }
}

/// Fixed-period loop pacer.
#[derive(Debug)]
pub struct Rate {
    period: Duration,
    next: Instant,
    overruns: u64,
}

impl Rate {
    pub fn from_hz(hz: u32) -> Result<Self> {
        if hz == 0 {
            return Err(anyhow!("rate must be greater than zero"));
        }
        let period = Duration::from_secs(1) / hz;
        Ok(Self {
            period,
            next: Instant::now() + period,
            overruns: 0,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cycles that finished after their deadline.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Sleep until the end of the current cycle. Returns `false` without
    /// sleeping when the cycle already overran; the schedule then restarts
    /// from now.
    pub fn sleep(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.next {
            self.overruns += 1;
            self.next = now + self.period;
            return false;
        }
        std::thread::sleep(self.next - now);
        self.next += self.period;
        true
    }
}

#[derive(Debug)]
pub enum LoopExit {
    /// The stop signal was triggered.
    Stopped,
    /// `max_frames` frames were published.
    FrameLimit,
    /// The worker exited without reporting a fatal error.
    WorkerFinished,
    /// The worker reported a non-recoverable error.
    Failed(AcquireError),
}

#[derive(Debug)]
pub struct LoopOutcome {
    pub published: u64,
    /// Cycles that ended with a recoverable acquisition error.
    pub skipped: u64,
    pub exit: LoopExit,
}

/// Publish frames from `worker` to `sink`, one per `rate` cycle, until the
/// stop signal fires, `max_frames` frames went out, or the worker ends.
///
/// Recoverable acquisition errors skip the cycle. Sink failures abort the
/// loop with an error.
pub fn publish_loop(
    worker: &AcquisitionWorker,
    sink: &mut dyn FrameSink,
    rate: &mut Rate,
    stop: &StopSignal,
    max_frames: Option<u64>,
) -> Result<LoopOutcome> {
    let mut published = 0u64;
    let mut skipped = 0u64;

    let exit = loop {
        if stop.is_triggered() {
            break LoopExit::Stopped;
        }
        if max_frames.is_some_and(|max| published >= max) {
            break LoopExit::FrameLimit;
        }

        match worker.next(rate.period()) {
            Delivery::Frame(frame) => {
                sink.publish(&frame)
                    .with_context(|| format!("publish frame {}", frame.frame_id))?;
                published += 1;
            }
            Delivery::Error(err) if err.kind() == ErrorKind::Recoverable => {
                skipped += 1;
            }
            Delivery::Error(err) => break LoopExit::Failed(err),
            // No frame this cycle; poll again without sleeping.
            Delivery::Idle => continue,
            Delivery::Finished => break LoopExit::WorkerFinished,
        }

        rate.sleep();
    };

    Ok(LoopOutcome {
        published,
        skipped,
        exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_rejects_zero() {
        assert!(Rate::from_hz(0).is_err());
    }

    #[test]
    fn rate_period_from_hz() -> Result<()> {
        let rate = Rate::from_hz(50)?;
        assert_eq!(rate.period(), Duration::from_millis(20));
        Ok(())
    }

    #[test]
    fn rate_counts_overruns() -> Result<()> {
        let mut rate = Rate::from_hz(100)?;
        std::thread::sleep(Duration::from_millis(20));
        assert!(!rate.sleep());
        assert_eq!(rate.overruns(), 1);
        assert!(rate.sleep());
        assert_eq!(rate.overruns(), 1);
        Ok(())
    }

    #[test]
    fn log_sink_counts_frames() -> Result<()> {
        let mut sink = LogSink::new("polarcamera/image");
        let frame = Frame::new(2, 2, 1, 1, vec![1, 2, 3, 4])?;
        sink.publish(&frame)?;
        sink.publish(&frame)?;
        assert_eq!(sink.published(), 2);
        assert_eq!(sink.topic(), "polarcamera/image");
        Ok(())
    }

    #[test]
    fn closures_are_sinks() -> Result<()> {
        let mut seen = Vec::new();
        let mut sink = |frame: &Frame| -> Result<()> {
            seen.push(frame.frame_id);
            Ok(())
        };
        sink.publish(&Frame::new(1, 1, 1, 9, vec![0])?)?;
        assert_eq!(seen, vec![9]);
        Ok(())
    }
}
