//! Visualization-rate downsampling.
//!
//! Filters keep independent state per topic (signal name). Every input updates
//! that state; only every Nth input of a topic produces an output, stamped with
//! the timestamp of the input that triggered it.

use crate::config::{DecimationStrategy, DecimatorConfig};
use crate::network::broadcaster::Broadcaster;
use crate::shutdown::ShutdownSignal;
use crate::types::{DecodedSignal, SourceKind, TelemetryMessage};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One decimated value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecimatedSample {
    /// Filtered value.
    pub value: f64,
    /// Timestamp of the triggering input.
    pub timestamp_ns: u64,
}

/// A per-topic downsampling filter.
pub trait SignalFilter: Send {
    /// Feed one raw sample. Returns a value on every Nth sample of `topic`.
    fn process(&mut self, topic: &str, value: f64, timestamp_ns: u64) -> Option<DecimatedSample>;

    /// Number of topics seen so far.
    fn topics(&self) -> usize;
}

/// Build the filter selected by `config`.
pub fn from_config(config: &DecimatorConfig) -> Box<dyn SignalFilter> {
    match config.strategy {
        DecimationStrategy::LowPass => Box::new(LowPass::new(
            config.cutoff_hz,
            config.sample_rate_hz,
            config.factor,
        )),
        DecimationStrategy::MovingAverage => Box::new(MovingAverage::new(config.window)),
    }
}

#[derive(Debug, Clone, Copy)]
struct LowPassState {
    value: f64,
    count: usize,
}

/// Single-pole IIR low-pass with decimation.
#[derive(Debug, Clone)]
pub struct LowPass {
    alpha: f64,
    factor: usize,
    state: HashMap<String, LowPassState>,
}

impl LowPass {
    /// Filter with the given cutoff and input rate, emitting every `factor`-th sample.
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64, factor: usize) -> Self {
        let dt = 1.0 / sample_rate_hz;
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: dt / (rc + dt),
            factor: factor.max(1),
            state: HashMap::new(),
        }
    }

    /// Smoothing coefficient.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl SignalFilter for LowPass {
    fn process(&mut self, topic: &str, value: f64, timestamp_ns: u64) -> Option<DecimatedSample> {
        let alpha = self.alpha;
        let state = self
            .state
            .entry(topic.to_string())
            .or_insert(LowPassState { value, count: 0 });
        state.value += alpha * (value - state.value);
        state.count += 1;

        (state.count % self.factor == 0).then_some(DecimatedSample {
            value: state.value,
            timestamp_ns,
        })
    }

    fn topics(&self) -> usize {
        self.state.len()
    }
}

#[derive(Debug, Clone, Default)]
struct WindowState {
    values: VecDeque<f64>,
    count: usize,
}

/// Mean of the last `window` samples, emitted every `window` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    state: HashMap<String, WindowState>,
}

impl MovingAverage {
    /// Filter over `window` samples.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            state: HashMap::new(),
        }
    }
}

impl SignalFilter for MovingAverage {
    fn process(&mut self, topic: &str, value: f64, timestamp_ns: u64) -> Option<DecimatedSample> {
        let window = self.window;
        let state = self.state.entry(topic.to_string()).or_default();
        if state.values.len() == window {
            state.values.pop_front();
        }
        state.values.push_back(value);
        state.count += 1;

        if state.count % window != 0 {
            return None;
        }
        let mean = state.values.iter().sum::<f64>() / state.values.len() as f64;
        Some(DecimatedSample {
            value: mean,
            timestamp_ns,
        })
    }

    fn topics(&self) -> usize {
        self.state.len()
    }
}

/// Republishes selected sources, decimated, on a separate broadcaster.
pub struct DecimatorStage {
    filter: Box<dyn SignalFilter>,
    sources: Vec<SourceKind>,
    input: Arc<Broadcaster>,
    output: Arc<Broadcaster>,
    queue: usize,
}

impl DecimatorStage {
    /// Stage reading `input` and publishing on `output`.
    pub fn new(
        config: &DecimatorConfig,
        input: Arc<Broadcaster>,
        output: Arc<Broadcaster>,
        queue: usize,
    ) -> Self {
        Self {
            filter: from_config(config),
            sources: config.sources.clone(),
            input,
            output,
            queue,
        }
    }

    /// Decimate one message. `None` when nothing is due.
    pub fn process(&mut self, message: &TelemetryMessage) -> Option<TelemetryMessage> {
        if !self.sources.contains(&message.source) {
            return None;
        }
        let signals: Vec<DecodedSignal> = message
            .signals
            .iter()
            .filter_map(|signal| {
                self.filter
                    .process(&signal.name, signal.value, message.timestamp_ns)
                    .map(|sample| {
                        DecodedSignal::new(
                            signal.name.clone(),
                            sample.value,
                            signal.unit.clone(),
                            sample.timestamp_ns,
                        )
                    })
            })
            .collect();
        if signals.is_empty() {
            return None;
        }
        Some(TelemetryMessage::signals(
            message.source,
            message.timestamp_ns,
            signals,
        ))
    }

    /// Consume the input stream until `shutdown`.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(sources = ?self.sources, "decimator started");
        let mut subscription = self.input.subscribe_local(self.queue);

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.recv() => message,
            };
            let Some(message) = message else {
                warn!("decimator fell behind and was dropped, resubscribing");
                subscription = self.input.subscribe_local(self.queue);
                continue;
            };
            if let Some(decimated) = self.process(&message) {
                self.output.publish(decimated);
            }
        }

        self.input.unsubscribe(subscription.id);
        debug!(topics = self.filter.topics(), "decimator state dropped");
        info!("decimator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    #[test]
    fn low_pass_coefficient() {
        let filter = LowPass::new(1.0, 200.0, 10);
        assert!((filter.alpha() - 0.0305).abs() < 1e-4);
    }

    #[test]
    fn low_pass_converges_on_a_step() {
        let mut filter = LowPass::new(1.0, 200.0, 1);
        let limit = (5.0 / filter.alpha()).ceil() as usize;

        // Seeded at zero, then a constant 10.0
        filter.process("/IMU/accel_x", 0.0, 0);
        let mut last = 0.0;
        for i in 1..=limit {
            last = filter.process("/IMU/accel_x", 10.0, i as u64).unwrap().value;
        }
        assert!((last - 10.0).abs() < 0.1, "got {last}");
    }

    #[test]
    fn low_pass_starts_at_first_value() {
        let mut filter = LowPass::new(1.0, 200.0, 1);
        let first = filter.process("t", 42.0, 7).unwrap();
        assert_eq!(first, DecimatedSample { value: 42.0, timestamp_ns: 7 });
    }

    #[test]
    fn low_pass_decimates_per_topic() {
        let mut filter = LowPass::new(1.0, 200.0, 10);
        let mut emitted_a = 0;
        let mut emitted_b = 0;
        for i in 0..100u64 {
            emitted_a += usize::from(filter.process("a", 1.0, i).is_some());
            if i % 2 == 0 {
                emitted_b += usize::from(filter.process("b", 1.0, i).is_some());
            }
        }
        assert_eq!(emitted_a, 10);
        assert_eq!(emitted_b, 5);
        assert_eq!(filter.topics(), 2);
    }

    #[test]
    fn moving_average_window_three() {
        let mut filter = MovingAverage::new(3);
        assert!(filter.process("x", 1.0, 1).is_none());
        assert!(filter.process("x", 2.0, 2).is_none());
        assert_eq!(
            filter.process("x", 3.0, 3),
            Some(DecimatedSample { value: 2.0, timestamp_ns: 3 })
        );
        assert!(filter.process("x", 4.0, 4).is_none());
        assert!(filter.process("x", 5.0, 5).is_none());
        assert_eq!(filter.process("x", 6.0, 6).unwrap().value, 5.0);
    }

    fn imu_message(ts: u64, value: f64) -> TelemetryMessage {
        TelemetryMessage::signals(
            SourceKind::Imu,
            ts,
            vec![DecodedSignal::new("/IMU/accel_x", value, "m/s^2", ts)],
        )
    }

    #[test]
    fn stage_filters_by_source() {
        let config = DecimatorConfig {
            strategy: DecimationStrategy::MovingAverage,
            window: 2,
            ..DecimatorConfig::default()
        };
        let broadcaster = Arc::new(Broadcaster::new(4));
        let mut stage = DecimatorStage::new(&config, broadcaster.clone(), broadcaster, 4);

        let gnss = TelemetryMessage::signals(
            SourceKind::Gnss,
            1,
            vec![DecodedSignal::new("/GNSS/ground_speed", 1.0, "m/s", 1)],
        );
        assert!(stage.process(&gnss).is_none());
        assert!(stage.process(&gnss).is_none());

        assert!(stage.process(&imu_message(1, 1.0)).is_none());
        let out = stage.process(&imu_message(2, 3.0)).unwrap();
        assert_eq!(out.source, SourceKind::Imu);
        assert_eq!(out.timestamp_ns, 2);
        assert_eq!(out.signals[0].name, "/IMU/accel_x");
        assert_eq!(out.signals[0].unit, "m/s^2");
        assert_eq!(out.signals[0].value, 2.0);
    }

    #[tokio::test]
    async fn stage_publishes_on_output_broadcaster() {
        let config = DecimatorConfig {
            strategy: DecimationStrategy::LowPass,
            factor: 2,
            ..DecimatorConfig::default()
        };
        let input = Arc::new(Broadcaster::new(16));
        let output = Arc::new(Broadcaster::new(16));
        let mut observer = output.subscribe_local(16);
        let stage = DecimatorStage::new(&config, input.clone(), output.clone(), 16);
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(stage.run(signal));
        while input.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        for ts in 1..=4 {
            input.publish(imu_message(ts, 5.0));
        }
        let first = observer.recv().await.unwrap();
        let second = observer.recv().await.unwrap();
        assert_eq!(first.timestamp_ns, 2);
        assert_eq!(second.timestamp_ns, 4);
        assert!((second.signals[0].value - 5.0).abs() < 1e-12);

        trigger.trigger();
        task.await.unwrap();
        assert_eq!(input.subscriber_count(), 0);
    }
}
