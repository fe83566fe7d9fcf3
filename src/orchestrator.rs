//! Observation sequencing for one camera process.
//!
//! An [`ObservationContext`] owns everything one process touches during an
//! observation: the settings and derived plan, its camera, the rotator (master only),
//! the sync channel to the peer process and the frame sink.
//!
//! ```text
//!   master                              slave
//!   ------                              -----
//!   rotator connect + initialise
//!   camera configure, queue, cool       camera configure, queue, cool
//!   post Stable  ----------------+----- post Stable
//!   wait slave Stable <----------+----> wait master Stable
//!   reset clock, start acquisition      reset clock, start acquisition
//!   trigger on, hand over RotateStart -> wait RotateStart
//!   rotate + continuous loop            continuous loop
//!     or goto + Trigger per frame  ---> wait Trigger per frame
//!   teardown                            teardown
//! ```
//!
//! Every wait is bounded. Any failure ends the observation: the context tears the
//! devices down on a best-effort basis and returns the original error.

use crate::config::Settings;
use crate::data::storage::{FrameSink, MemorySink, RawFileSink};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{CameraSdk, GcsLink};
use crate::hardware::dispatch::Dispatcher;
use crate::instrument::camera::CameraController;
use crate::instrument::rotator::{RotatorController, TriggerGeometry};
use crate::plan::AcquisitionPlan;
use crate::sync::{self, Role, SyncChannel, SyncState};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// State of one observation in one process.
pub struct ObservationContext<S: CameraSdk, L: GcsLink, K: FrameSink> {
    settings: Settings,
    plan: AcquisitionPlan,
    role: Role,
    camera: CameraController<S>,
    rotator: Option<RotatorController<L>>,
    sync: Option<Arc<dyn SyncChannel>>,
    sink: K,
}

impl<S: CameraSdk, L: GcsLink, K: FrameSink> ObservationContext<S, L, K> {
    /// Assemble a context.
    ///
    /// `link` is required for the master and ignored for the slave. `sync` is
    /// ignored for a single-camera observation.
    ///
    /// # Errors
    /// - [`DaqError::Configuration`] for invalid settings or a master without a
    ///   rotator link.
    /// - [`DaqError::Sync`] for a paired observation without a sync channel.
    pub fn new(
        settings: Settings,
        sdk: S,
        link: Option<L>,
        sync: Option<Arc<dyn SyncChannel>>,
        sink: K,
    ) -> AppResult<Self> {
        settings.validate()?;
        let plan = settings.plan()?;
        let role = settings.process.effective_role();
        let paired = settings.process.paired();

        let rotator = match (role, link) {
            (Role::Master, Some(link)) => {
                Some(RotatorController::new(link, settings.rotator.tolerance))
            }
            (Role::Master, None) => {
                return Err(DaqError::Configuration(
                    "master role needs a rotator link".into(),
                ))
            }
            (Role::Slave, Some(_)) => {
                warn!("slave ignores the rotator link");
                None
            }
            (Role::Slave, None) => None,
        };
        let sync = match (paired, sync) {
            (true, None) => {
                return Err(DaqError::Sync(
                    "paired observation needs a sync channel".into(),
                ))
            }
            (true, sync) => sync,
            (false, _) => None,
        };

        let dispatcher = Dispatcher::new(settings.timeouts.retry_policy());
        let camera = CameraController::new(
            sdk,
            settings.process.camera_index(),
            settings.camera.clone(),
            dispatcher,
        );

        Ok(Self {
            settings,
            plan,
            role,
            camera,
            rotator,
            sync,
            sink,
        })
    }

    /// Plan derived from the settings.
    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    /// Role played; a single camera is always master.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The camera controller.
    pub fn camera(&self) -> &CameraController<S> {
        &self.camera
    }

    /// The rotator controller, master only.
    pub fn rotator(&self) -> Option<&RotatorController<L>> {
        self.rotator.as_ref()
    }

    /// The frame sink.
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Run the observation and tear down. Returns the number of frames recorded.
    ///
    /// # Errors
    /// The first error of the observation. Teardown failures after it are only
    /// logged; after a clean run they are returned.
    pub async fn run(&mut self) -> AppResult<usize> {
        let span = info_span!(
            "observation",
            role = %self.role,
            camera = self.camera.index()
        );
        async {
            info!(
                direction = %self.plan.direction,
                frames = self.plan.total_images,
                paired = self.sync.is_some(),
                "observation starting"
            );
            match self.acquire().await {
                Ok(frames) => {
                    self.shutdown().await?;
                    info!(frames, "observation complete");
                    Ok(frames)
                }
                Err(e) => {
                    error!(error = %e, "observation failed, tearing down");
                    if let Err(teardown) = self.shutdown().await {
                        warn!(error = %teardown, "teardown incomplete");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn acquire(&mut self) -> AppResult<usize> {
        let timeouts = self.settings.timeouts.clone();

        if let Some(rotator) = self.rotator.as_mut() {
            rotator.connect(&timeouts.connection_policy()).await?;
            let geometry =
                TriggerGeometry::from_plan(&self.plan, self.settings.rotator.trigger_active_high);
            rotator.initialize(&geometry, timeouts.rotate()).await?;
        }

        let index = self.camera.index();
        self.camera.initialize().await?;
        self.camera
            .configure(
                &self.plan,
                &self.settings.observation,
                self.settings.expected_serial(index),
            )
            .await?;
        self.camera.allocate_and_queue(&self.plan).await?;
        self.camera
            .stabilize(
                self.settings.camera.target_temperature,
                timeouts.stable(),
                self.settings.camera.quick_start,
            )
            .await?;

        if let Some(sync) = self.sync.as_deref() {
            sync.post(SyncState::Stable, self.role);
            if !sync
                .wait(SyncState::Stable, self.role.peer(), timeouts.stable(), true)
                .await
            {
                return Err(DaqError::timeout(
                    format!("{} camera stable", self.role.peer()),
                    timeouts.stable(),
                ));
            }
            info!("both cameras stable");
        }

        self.camera.reset_clock().await?;
        self.camera.set_acquisition(true).await?;

        let kind = self.settings.observation.kind;
        let sync = self.sync.as_deref();
        match self.rotator.as_mut() {
            Some(rotator) => {
                if self.plan.is_fixed_angle() {
                    rotator.goto(self.plan.start_angle, timeouts.rotate()).await?;
                }
                if self.plan.is_rotating() {
                    rotator.set_trigger(true).await?;
                }
                if let Some(sync) = sync {
                    if !sync
                        .hand_over(SyncState::RotateStart, self.role, timeouts.rotate())
                        .await
                    {
                        return Err(DaqError::timeout("slave to take rotate start", timeouts.rotate()));
                    }
                }

                if let Some(travel) = self.plan.final_travel() {
                    rotator.move_to(travel).await?;
                    info!(travel, "rotation started");
                    let frames = self
                        .camera
                        .acquire_continuous(
                            &self.plan,
                            kind,
                            &mut self.sink,
                            Some(&mut *rotator),
                            timeouts.transfer(),
                        )
                        .await?;
                    rotator.set_trigger(false).await?;
                    Ok(frames)
                } else {
                    self.camera
                        .acquire_static(
                            &self.plan,
                            kind,
                            &mut self.sink,
                            Some(rotator),
                            sync,
                            self.role,
                            &timeouts,
                        )
                        .await
                }
            }
            None => {
                if let Some(sync) = sync {
                    if !sync
                        .wait(SyncState::RotateStart, self.role.peer(), timeouts.rotate(), true)
                        .await
                    {
                        return Err(DaqError::timeout("rotate start from master", timeouts.rotate()));
                    }
                }
                if self.plan.is_rotating() {
                    self.camera
                        .acquire_continuous(&self.plan, kind, &mut self.sink, None, timeouts.transfer())
                        .await
                } else {
                    self.camera
                        .acquire_static(&self.plan, kind, &mut self.sink, None, sync, self.role, &timeouts)
                        .await
                }
            }
        }
    }

    /// Stop the rotator, close the camera and, for the master, release the sync
    /// channel. Every step is attempted.
    async fn shutdown(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();

        if let Some(rotator) = self.rotator.as_mut() {
            if let Err(e) = rotator.halt().await {
                warn!(error = %e, "rotator halt failed");
                errors.push(e);
            }
        }
        if let Err(e) = self.camera.close().await {
            warn!(error = %e, "camera close failed");
            errors.push(e);
        }
        if self.role == Role::Master {
            if let Some(sync) = self.sync.as_deref() {
                if let Err(e) = sync.unlink() {
                    warn!(error = %e, "sync channel unlink failed");
                    errors.push(e);
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }
}

/// Run a complete observation from `settings`.
///
/// Opens the configured sync channel for a paired observation and writes frames to
/// raw files under the output directory, or keeps records in memory when frame
/// writing is off.
///
/// # Errors
/// Any error of [`ObservationContext::run`], or failure to open the sync channel or
/// output directory.
pub async fn observe<S, L>(settings: Settings, sdk: S, link: Option<L>) -> AppResult<usize>
where
    S: CameraSdk,
    L: GcsLink,
{
    let sync = if settings.process.paired() {
        Some(sync::open(&settings.process)?)
    } else {
        None
    };

    let sink: Box<dyn FrameSink> = if settings.storage.write_frames {
        let camera = u8::try_from(settings.process.camera_index() + 1)
            .map_err(|_| DaqError::Configuration("camera index out of range".into()))?;
        Box::new(RawFileSink::create(
            &settings.storage.output_dir,
            camera,
            settings.observation.kind,
        )?)
    } else {
        Box::new(MemorySink::new())
    };

    ObservationContext::new(settings, sdk, link, sync, sink)?
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCameraSdk, MockGcsLink};

    fn single() -> Settings {
        let mut settings = Settings::default();
        settings.process.single_camera = true;
        settings.observation.images_per_cycle = 8;
        settings.observation.cycles = 1;
        settings
    }

    #[test]
    fn master_needs_a_rotator_link() {
        let err = ObservationContext::new(
            single(),
            MockCameraSdk::default(),
            None::<MockGcsLink>,
            None,
            MemorySink::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn paired_run_needs_a_sync_channel() {
        let mut settings = single();
        settings.process.single_camera = false;
        let err = ObservationContext::new(
            settings,
            MockCameraSdk::default(),
            Some(MockGcsLink::new()),
            None,
            MemorySink::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DaqError::Sync(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn single_camera_runs_without_a_peer() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let stage = MockGcsLink::new();
        let mut ctx =
            ObservationContext::new(single(), sdk, Some(stage.clone()), None, MemorySink::new())
                .unwrap();
        assert_eq!(ctx.role(), Role::Master);

        let frames = ctx.run().await.unwrap();

        assert_eq!(frames, 8);
        assert_eq!(ctx.sink().records().len(), 8);
        assert!(!probe.is_open());
        assert!(!stage.trigger_enabled());
        assert!(stage.commands().iter().any(|c| c.starts_with("MOV 1 359.99")));
    }

    #[tokio::test(start_paused = true)]
    async fn rotator_failure_still_closes_the_camera() {
        let sdk = MockCameraSdk::default();
        let probe = sdk.clone();
        let stage = MockGcsLink::new().reject("FRF");
        let mut ctx =
            ObservationContext::new(single(), sdk, Some(stage), None, MemorySink::new()).unwrap();

        let err = ctx.run().await.unwrap_err();

        assert!(matches!(err, DaqError::Rotator(_)));
        assert!(!probe.is_open());
    }
}
