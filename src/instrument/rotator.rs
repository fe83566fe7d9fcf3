//! Rotation stage controller.
//!
//! Drives a PI rotation stage through a [`GcsLink`]: connection with retries, the
//! initialisation and trigger-geometry sequence, absolute moves and the two
//! on-target tests used by the acquisition loops.
//!
//! Angles are an unbounded accumulator in degrees. Three full clockwise turns end
//! near 1080°, never near 0°; only frame records wrap angles into `[0, 360)`.
//!
//! # Trigger geometry
//!
//! The controller pulses its trigger output every `step` degrees of travel measured
//! from position 0, between the start threshold (0) and the end threshold
//! (`sign * 36000`). Before a run the stage parks at the pre-roll angle
//! (`-sign * 22`) so it is up to speed when it passes the first trigger position.

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::capabilities::GcsLink;
use crate::plan::AcquisitionPlan;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Polling interval for position and on-target queries.
pub const ROT_TICK: Duration = Duration::from_millis(1);

/// Velocity used while homing, degrees per second.
const INIT_VELOCITY: f64 = 360.0;

/// `|position - target| <= tolerance`.
pub fn within_tolerance(position: f64, target: f64, tolerance: f64) -> bool {
    (position - target).abs() <= tolerance
}

/// Whether a stage moving in the given direction has reached or passed `target`.
///
/// Within tolerance always counts. Otherwise clockwise travel must be at least one
/// tolerance past the target, counter-clockwise travel at least one tolerance short
/// of it.
pub fn crossed(position: f64, target: f64, tolerance: f64, clockwise: bool) -> bool {
    let d = position - target;
    d.abs() <= tolerance || (clockwise && d >= tolerance) || (!clockwise && d <= -tolerance)
}

/// Trigger output configuration written during initialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerGeometry {
    /// Signed degrees between trigger pulses.
    pub step: f64,
    /// Run velocity, degrees per second.
    pub speed: f64,
    /// Output polarity: active high.
    pub active_high: bool,
    /// Parking angle before the run.
    pub pre_roll: f64,
    /// Travel after which the output stops pulsing.
    pub trigger_end: f64,
}

impl TriggerGeometry {
    /// Geometry for `plan`.
    pub fn from_plan(plan: &AcquisitionPlan, active_high: bool) -> Self {
        Self {
            step: plan.step,
            speed: plan.speed,
            active_high,
            pre_roll: plan.pre_roll_angle(),
            trigger_end: plan.trigger_end(),
        }
    }
}

/// Last known stage state. Positions are refreshed on every query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotatorState {
    /// Last polled position.
    pub position: f64,
    /// Last commanded target.
    pub target: f64,
    /// Run velocity.
    pub velocity: f64,
    /// Trigger step.
    pub step: f64,
    /// Trigger polarity.
    pub active_high: bool,
    /// Trigger output enabled.
    pub triggering: bool,
    /// Last on-target flag read.
    pub on_target: bool,
}

/// Angle source for the acquisition loops.
///
/// Only the master holds one; the slave runs its loops without rotator access.
#[async_trait]
pub trait RotatorAccess: Send {
    /// Current position.
    async fn position(&mut self) -> AppResult<f64>;

    /// Move to `angle`, wait for the on-target flag and return the actual position.
    async fn goto(&mut self, angle: f64, timeout: Duration) -> AppResult<f64>;
}

/// Controller for one rotation stage axis.
#[derive(Debug)]
pub struct RotatorController<L: GcsLink> {
    link: L,
    tolerance: f64,
    tick: Duration,
    state: RotatorState,
}

impl<L: GcsLink> RotatorController<L> {
    /// Wrap a link. Nothing is sent until [`Self::connect`].
    pub fn new(link: L, tolerance: f64) -> Self {
        Self {
            link,
            tolerance,
            tick: ROT_TICK,
            state: RotatorState::default(),
        }
    }

    /// The underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Last known state.
    pub fn state(&self) -> &RotatorState {
        &self.state
    }

    /// On-target tolerance in degrees.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Open the link, retrying per `policy`.
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] once every attempt has failed.
    pub async fn connect(&mut self, policy: &RetryPolicy) -> AppResult<()> {
        let mut attempts = policy.attempts();
        loop {
            match self.link.connect().await {
                Ok(()) => {
                    info!(attempt = attempts.current(), "rotator connected");
                    return Ok(());
                }
                Err(e) => {
                    if !attempts.backoff("rotator connect", format!("{e:#}")).await {
                        return Err(DaqError::Rotator(format!(
                            "connection abandoned after {} attempt(s): {e:#}",
                            attempts.current()
                        )));
                    }
                }
            }
        }
    }

    /// Home the stage, program the trigger output and park at the pre-roll angle.
    ///
    /// Any rejected command aborts initialisation.
    ///
    /// # Errors
    /// - [`DaqError::Rotator`] for a rejected command.
    /// - [`DaqError::Timeout`] if homing or parking exceeds `timeout`.
    #[instrument(skip(self), fields(step = geometry.step, speed = geometry.speed))]
    pub async fn initialize(&mut self, geometry: &TriggerGeometry, timeout: Duration) -> AppResult<()> {
        self.send("STP").await?;
        let latched = self.ask("ERR?").await?;
        if latched.trim() != "0" {
            warn!(code = %latched, "cleared latched controller error");
        }
        self.set_trigger(false).await?;
        self.send(&format!("VEL 1 {INIT_VELOCITY}")).await?;
        self.send("SVO 1 1").await?;
        self.send("FRF 1").await?;
        self.require_on_target("reference move", timeout).await?;

        self.send(&format!("VEL 1 {}", geometry.speed)).await?;
        self.state.velocity = geometry.speed;

        let polarity = u8::from(geometry.active_high);
        self.send("CTO 1 2 1").await?;
        self.send(&format!("CTO 1 7 {polarity}")).await?;
        self.send(&format!("CTO 1 1 {}", geometry.step)).await?;
        self.send("CTO 1 3 7").await?;
        self.send("CTO 1 10 0").await?;
        self.send("CTO 1 8 0").await?;
        self.send(&format!("CTO 1 9 {}", geometry.trigger_end)).await?;
        self.state.step = geometry.step;
        self.state.active_high = geometry.active_high;

        self.move_to(geometry.pre_roll).await?;
        self.require_on_target("pre-roll move", timeout).await?;
        info!(pre_roll = geometry.pre_roll, "rotator initialised");
        Ok(())
    }

    async fn send(&mut self, cmd: &str) -> AppResult<()> {
        debug!(cmd, "rotator command");
        self.link
            .command(cmd)
            .await
            .map_err(|e| DaqError::Rotator(format!("'{cmd}' failed: {e:#}")))
    }

    async fn ask(&mut self, query: &str) -> AppResult<String> {
        self.link
            .query(query)
            .await
            .map_err(|e| DaqError::Rotator(format!("'{query}' failed: {e:#}")))
    }

    /// Reply value of an axis query, `1=<value>`.
    fn axis_value<'a>(query: &str, reply: &'a str) -> AppResult<&'a str> {
        reply
            .trim()
            .strip_prefix("1=")
            .ok_or_else(|| DaqError::Rotator(format!("unexpected reply to '{query}': '{reply}'")))
    }

    /// Poll the current position.
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] for a failed query or malformed reply.
    pub async fn position(&mut self) -> AppResult<f64> {
        let reply = self.ask("POS? 1").await?;
        let position = Self::axis_value("POS? 1", &reply)?
            .trim()
            .parse::<f64>()
            .map_err(|e| DaqError::Rotator(format!("bad position '{reply}': {e}")))?;
        self.state.position = position;
        Ok(position)
    }

    /// Read the controller's on-target flag.
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] for a failed query or malformed reply.
    pub async fn on_target_flag(&mut self) -> AppResult<bool> {
        let reply = self.ask("ONT? 1").await?;
        let on_target = Self::axis_value("ONT? 1", &reply)?.trim() == "1";
        self.state.on_target = on_target;
        Ok(on_target)
    }

    /// Poll the on-target flag every tick until it is set or `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] if a query fails.
    pub async fn wait_on_target(&mut self, timeout: Duration) -> AppResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.on_target_flag().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.tick.min(deadline - now)).await;
        }
    }

    async fn require_on_target(&mut self, what: &str, timeout: Duration) -> AppResult<()> {
        if self.wait_on_target(timeout).await? {
            Ok(())
        } else {
            Err(DaqError::timeout(format!("rotator {what}"), timeout))
        }
    }

    /// Poll the position every tick until the stage reaches or passes `target` in
    /// the given direction, or `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] if a query fails.
    pub async fn wait_position(
        &mut self,
        target: f64,
        timeout: Duration,
        clockwise: bool,
    ) -> AppResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let position = self.position().await?;
            if crossed(position, target, self.tolerance, clockwise) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.tick.min(deadline - now)).await;
        }
    }

    /// Command an absolute move without waiting.
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] if the command is rejected.
    pub async fn move_to(&mut self, angle: f64) -> AppResult<()> {
        self.send(&format!("MOV 1 {angle}")).await?;
        self.state.target = angle;
        Ok(())
    }

    /// Move to `angle`, wait for the on-target flag and return the actual position.
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] if the flag is not set within `timeout`.
    /// - [`DaqError::Rotator`] for a failed command or query.
    pub async fn goto(&mut self, angle: f64, timeout: Duration) -> AppResult<f64> {
        self.move_to(angle).await?;
        self.require_on_target(&format!("goto {angle}"), timeout)
            .await?;
        let actual = self.position().await?;
        debug!(angle, actual, "rotator on target");
        Ok(actual)
    }

    /// Move to `angle` and wait until the stage reaches or passes it in the
    /// direction of travel. Returns the position that satisfied the wait.
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] if the angle is not reached within `timeout`.
    /// - [`DaqError::Rotator`] for a failed command or query.
    pub async fn set_and_wait(&mut self, angle: f64, timeout: Duration) -> AppResult<f64> {
        let now = self.position().await?;
        self.move_to(angle).await?;
        let clockwise = angle > now;
        if !self.wait_position(angle, timeout, clockwise).await? {
            return Err(DaqError::timeout(format!("rotator set {angle}"), timeout));
        }
        Ok(self.state.position)
    }

    /// Enable or disable the trigger output (`TRO 1 1` / `TRO 1 0`).
    ///
    /// # Errors
    /// Returns [`DaqError::Rotator`] if the command is rejected.
    pub async fn set_trigger(&mut self, enable: bool) -> AppResult<()> {
        self.send(&format!("TRO 1 {}", u8::from(enable))).await?;
        self.state.triggering = enable;
        debug!(enable, "rotator trigger output");
        Ok(())
    }

    /// Disable triggering and stop all motion.
    ///
    /// # Errors
    /// Returns the first failure; the stop is attempted regardless.
    pub async fn halt(&mut self) -> AppResult<()> {
        let trigger = self.set_trigger(false).await;
        let stop = self.send("STP").await;
        info!("rotator halted");
        trigger.and(stop)
    }
}

#[async_trait]
impl<L: GcsLink> RotatorAccess for RotatorController<L> {
    async fn position(&mut self) -> AppResult<f64> {
        RotatorController::position(self).await
    }

    async fn goto(&mut self, angle: f64, timeout: Duration) -> AppResult<f64> {
        RotatorController::goto(self, angle, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservationConfig;
    use crate::hardware::mock::MockGcsLink;

    const TOL: f64 = 0.004;

    fn geometry() -> TriggerGeometry {
        let plan = AcquisitionPlan::from_observation(&ObservationConfig::default(), TOL).unwrap();
        TriggerGeometry::from_plan(&plan, true)
    }

    async fn connected(link: MockGcsLink) -> RotatorController<MockGcsLink> {
        let mut rotator = RotatorController::new(link, TOL);
        rotator.connect(&RetryPolicy::connection()).await.unwrap();
        rotator
    }

    #[test]
    fn absolute_on_target_predicate() {
        assert!(within_tolerance(10.003, 10.0, TOL));
        assert!(!within_tolerance(10.010, 10.0, TOL));
        assert!(within_tolerance(-359.998, -360.0, TOL));
    }

    #[test]
    fn crossing_predicate_follows_direction() {
        assert!(crossed(10.01, 10.0, TOL, true));
        assert!(!crossed(9.99, 10.0, TOL, true));
        assert!(crossed(9.99, 10.0, TOL, false));
        assert!(!crossed(10.01, 10.0, TOL, false));
        assert!(crossed(10.002, 10.0, TOL, false));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_the_link_opens() {
        let link = MockGcsLink::new().fail_connects(2);
        let start = Instant::now();
        connected(link).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_five_attempts() {
        let mut rotator = RotatorController::new(MockGcsLink::new().fail_connects(9), TOL);
        let err = rotator.connect(&RetryPolicy::connection()).await.unwrap_err();
        assert!(matches!(err, DaqError::Rotator(_)));
        assert!(err.to_string().contains("5 attempt"));
    }

    #[tokio::test(start_paused = true)]
    async fn initialisation_sends_the_documented_sequence() {
        let link = MockGcsLink::new();
        let probe = link.clone();
        let mut rotator = connected(link).await;
        rotator
            .initialize(&geometry(), Duration::from_secs(30))
            .await
            .unwrap();

        let commands: Vec<String> = probe
            .commands()
            .into_iter()
            .filter(|c| c != "ONT? 1")
            .collect();
        assert_eq!(
            commands,
            vec![
                "STP", "ERR?", "TRO 1 0", "VEL 1 360", "SVO 1 1", "FRF 1", "VEL 1 45",
                "CTO 1 2 1", "CTO 1 7 1", "CTO 1 1 22.5", "CTO 1 3 7", "CTO 1 10 0",
                "CTO 1 8 0", "CTO 1 9 36000", "MOV 1 -22",
            ]
        );
        assert_eq!(probe.position(), -22.0);
        assert_eq!(probe.velocity(), 45.0);
        assert!(!probe.trigger_enabled());
        assert_eq!(probe.trigger_param(1), Some(22.5));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_command_aborts_initialisation() {
        let link = MockGcsLink::new().reject("CTO 1 3");
        let probe = link.clone();
        let mut rotator = connected(link).await;
        let err = rotator
            .initialize(&geometry(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Rotator(_)));
        assert!(!probe.commands().iter().any(|c| c.starts_with("MOV")));
    }

    #[tokio::test(start_paused = true)]
    async fn goto_and_set_and_wait_reach_the_target() {
        let link = MockGcsLink::new();
        let probe = link.clone();
        let mut rotator = connected(link).await;
        rotator
            .initialize(&geometry(), Duration::from_secs(30))
            .await
            .unwrap();

        let actual = rotator.goto(45.0, Duration::from_secs(30)).await.unwrap();
        assert!(within_tolerance(actual, 45.0, TOL));

        let reached = rotator.set_and_wait(90.0, Duration::from_secs(30)).await.unwrap();
        assert!(crossed(reached, 90.0, TOL, true));
        assert!(within_tolerance(probe.position(), 90.0, TOL));
    }

    #[tokio::test(start_paused = true)]
    async fn goto_times_out_when_the_stage_is_too_slow() {
        let mut rotator = connected(MockGcsLink::new()).await;
        rotator
            .initialize(&geometry(), Duration::from_secs(30))
            .await
            .unwrap();
        let err = rotator.goto(3600.0, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn halt_disables_trigger_and_stops() {
        let link = MockGcsLink::new();
        let probe = link.clone();
        let mut rotator = connected(link).await;
        rotator.set_trigger(true).await.unwrap();
        assert!(probe.trigger_enabled());
        rotator.halt().await.unwrap();
        assert!(!probe.trigger_enabled());
        assert_eq!(probe.commands().last().map(String::as_str), Some("STP"));
    }
}
