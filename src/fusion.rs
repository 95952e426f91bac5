//! Forward-velocity estimation.
//!
//! A scalar Kalman filter: IMU acceleration drives the prediction, GNSS ground
//! speed is the measurement. [`FusionStage`] runs the filter on the live stream
//! and republishes the estimate as `source = "fusion"` messages.

use crate::config::FusionConfig;
use crate::network::broadcaster::{Broadcaster, LocalSubscription};
use crate::shutdown::ShutdownSignal;
use crate::types::{DecodedSignal, SourceKind, TelemetryMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of every fused signal.
pub const FUSION_PREFIX: &str = "/Fusion";

/// Filter state. Only [`FusionEngine`] mutates it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionState {
    /// Estimated velocity in m/s.
    pub velocity_estimate: f64,
    /// Estimate covariance, always positive.
    pub covariance: f64,
    /// Timestamp of the last prediction, in nanoseconds.
    pub last_update_time: Option<u64>,
}

/// One filter cycle's result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutput {
    /// Velocity after the prediction step, when an IMU sample was present.
    pub imu_predicted: Option<f64>,
    /// Raw speed measurement, when a GNSS sample was present.
    pub gps_speed: Option<f64>,
    /// Best estimate for this cycle.
    pub fused_velocity: f64,
    /// Covariance after this cycle.
    pub covariance: f64,
}

/// Scalar Kalman filter over forward velocity.
#[derive(Debug, Clone)]
pub struct FusionEngine {
    state: FusionState,
    process_noise: f64,
    measurement_noise: f64,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::from(&FusionConfig::default())
    }
}

impl From<&FusionConfig> for FusionEngine {
    fn from(config: &FusionConfig) -> Self {
        Self::new(
            config.initial_velocity,
            config.initial_covariance,
            config.process_noise,
            config.measurement_noise,
        )
    }
}

impl FusionEngine {
    /// Filter starting at `velocity` with covariance `covariance`, process noise
    /// `q` and measurement noise `r`.
    pub fn new(velocity: f64, covariance: f64, q: f64, r: f64) -> Self {
        Self {
            state: FusionState {
                velocity_estimate: velocity,
                covariance,
                last_update_time: None,
            },
            process_noise: q,
            measurement_noise: r,
        }
    }

    /// Current state.
    pub fn state(&self) -> &FusionState {
        &self.state
    }

    /// Integrate `acceleration` (m/s²) up to `now_ns`.
    ///
    /// The first call only records the time. A timestamp at or before the
    /// previous one integrates nothing but still grows the covariance.
    pub fn predict(&mut self, acceleration: f64, now_ns: u64) -> f64 {
        let Some(last) = self.state.last_update_time else {
            self.state.last_update_time = Some(now_ns);
            return self.state.velocity_estimate;
        };
        let dt = now_ns.saturating_sub(last) as f64 * 1e-9;
        self.state.velocity_estimate += acceleration * dt;
        self.state.covariance += self.process_noise;
        self.state.last_update_time = Some(now_ns.max(last));
        self.state.velocity_estimate
    }

    /// Correct the estimate with a measured speed.
    pub fn update(&mut self, gps_speed: f64) -> f64 {
        let p = self.state.covariance;
        let gain = p / (p + self.measurement_noise);
        self.state.velocity_estimate += gain * (gps_speed - self.state.velocity_estimate);
        self.state.covariance = p * (1.0 - gain);
        self.state.velocity_estimate
    }

    /// One cycle with whichever inputs are present. `None` when there are none.
    pub fn step(&mut self, imu: Option<(f64, u64)>, gps_speed: Option<f64>) -> Option<FusionOutput> {
        let imu_predicted = imu.map(|(acceleration, at)| self.predict(acceleration, at));
        let fused_velocity = match gps_speed {
            Some(speed) => self.update(speed),
            None => imu_predicted?,
        };
        Some(FusionOutput {
            imu_predicted,
            gps_speed,
            fused_velocity,
            covariance: self.state.covariance,
        })
    }
}

impl FusionOutput {
    /// Signals published for this output.
    pub fn signals(&self, timestamp_ns: u64) -> Vec<DecodedSignal> {
        let mut signals = vec![DecodedSignal::new(
            format!("{FUSION_PREFIX}/velocity"),
            self.fused_velocity,
            "m/s",
            timestamp_ns,
        )];
        if let Some(predicted) = self.imu_predicted {
            signals.push(DecodedSignal::new(
                format!("{FUSION_PREFIX}/imu_predicted"),
                predicted,
                "m/s",
                timestamp_ns,
            ));
        }
        signals.push(DecodedSignal::new(
            format!("{FUSION_PREFIX}/covariance"),
            self.covariance,
            "",
            timestamp_ns,
        ));
        signals
    }
}

/// Feeds a [`FusionEngine`] from the broadcast stream.
pub struct FusionStage {
    engine: FusionEngine,
    broadcaster: Arc<Broadcaster>,
    accel_signal: String,
    speed_signal: String,
    queue: usize,
}

impl FusionStage {
    /// Stage reading and publishing on `broadcaster`.
    pub fn new(config: &FusionConfig, broadcaster: Arc<Broadcaster>, queue: usize) -> Self {
        Self {
            engine: FusionEngine::from(config),
            broadcaster,
            accel_signal: config.accel_signal.clone(),
            speed_signal: config.speed_signal.clone(),
            queue,
        }
    }

    /// Run one message through the filter. Returns the fused message, if any.
    pub fn process(&mut self, message: &TelemetryMessage) -> Option<TelemetryMessage> {
        if message.source == SourceKind::Fusion {
            return None;
        }
        let imu = message
            .signal(&self.accel_signal)
            .map(|s| (s.value, message.timestamp_ns));
        let gps = message.signal(&self.speed_signal).map(|s| s.value);
        let output = self.engine.step(imu, gps)?;
        Some(TelemetryMessage::signals(
            SourceKind::Fusion,
            message.timestamp_ns,
            output.signals(message.timestamp_ns),
        ))
    }

    /// Consume the stream until `shutdown`.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(
            accel = %self.accel_signal,
            speed = %self.speed_signal,
            "fusion stage started"
        );
        let mut subscription: LocalSubscription = self.broadcaster.subscribe_local(self.queue);

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.recv() => message,
            };
            let Some(message) = message else {
                warn!("fusion stage fell behind and was dropped, resubscribing");
                subscription = self.broadcaster.subscribe_local(self.queue);
                continue;
            };
            if let Some(fused) = self.process(&message) {
                let report = self.broadcaster.publish(fused);
                debug!(delivered = report.delivered, "fused velocity published");
            }
        }

        self.broadcaster.unsubscribe(subscription.id);
        info!("fusion stage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn first_predict_only_records_time() {
        let mut engine = FusionEngine::default();
        assert_eq!(engine.predict(5.0, 10 * SECOND), 0.0);
        assert_eq!(engine.state().covariance, 1.0);
        assert_eq!(engine.state().last_update_time, Some(10 * SECOND));
    }

    #[test]
    fn integrates_acceleration_and_grows_covariance() {
        let mut engine = FusionEngine::default();
        let mut previous_p = engine.state().covariance;
        for i in 0..5u64 {
            engine.predict(1.0, i * SECOND);
            if i > 0 {
                let p = engine.state().covariance;
                assert!((p - previous_p - 0.05).abs() < 1e-12);
                previous_p = p;
            }
        }
        assert!((engine.state().velocity_estimate - 4.0).abs() < 1e-9);
    }

    #[test]
    fn update_shrinks_covariance() {
        for p0 in [1e-6, 0.5, 1.0, 250.0] {
            let mut engine = FusionEngine::new(0.0, p0, 0.05, 0.8);
            engine.update(12.0);
            let p = engine.state().covariance;
            assert!(p > 0.0 && p < p0, "p0={p0} p={p}");
        }

        let mut engine = FusionEngine::default();
        // K = 1 / 1.8
        let v = engine.update(9.0);
        assert!((v - 5.0).abs() < 1e-12);
    }

    #[test]
    fn step_selects_output() {
        let mut engine = FusionEngine::default();
        assert!(engine.step(None, None).is_none());

        engine.step(Some((2.0, 0)), None);
        let predicted = engine.step(Some((2.0, SECOND)), None).unwrap();
        assert_eq!(predicted.fused_velocity, 2.0);
        assert_eq!(predicted.imu_predicted, Some(2.0));
        assert_eq!(predicted.gps_speed, None);

        let corrected = engine.step(Some((0.0, 2 * SECOND)), Some(10.0)).unwrap();
        assert_eq!(corrected.imu_predicted, Some(2.0));
        assert!(corrected.fused_velocity > 2.0 && corrected.fused_velocity < 10.0);
        assert_eq!(corrected.covariance, engine.state().covariance);
    }

    #[tokio::test]
    async fn stage_republishes_fused_velocity() {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let stage = FusionStage::new(&FusionConfig::default(), broadcaster.clone(), 16);
        let (trigger, signal) = shutdown::channel();
        let task = tokio::spawn(stage.run(signal));
        while broadcaster.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        let mut observer = broadcaster.subscribe_local(16);

        broadcaster.publish(TelemetryMessage::signals(
            SourceKind::Gnss,
            SECOND,
            vec![DecodedSignal::new("/GNSS/ground_speed", 9.0, "m/s", SECOND)],
        ));

        let mut fused = None;
        while let Some(message) = observer.recv().await {
            if message.source == SourceKind::Fusion {
                fused = Some(message);
                break;
            }
        }
        let fused = fused.unwrap();
        assert!((fused.signal("/Fusion/velocity").unwrap().value - 5.0).abs() < 1e-12);
        assert!(fused.signal("/Fusion/imu_predicted").is_none());
        assert!(fused.signal("/Fusion/covariance").is_some());

        trigger.trigger();
        task.await.unwrap();
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
