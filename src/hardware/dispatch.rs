//! Bounded-retry dispatcher for camera library calls.
//!
//! The camera library occasionally rejects a perfectly valid call (most often while
//! the sensor is still settling). Every operation therefore goes through
//! [`Dispatcher::invoke`], which tries it up to `max_attempts` times with a fixed
//! delay in between and logs every failed attempt with its classified reason.

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::andor::VendorStatus;
use crate::hardware::capabilities::CameraSdk;
use crate::hardware::operation::{HardwareOperation, OpValue};
use tracing::{debug, error};

/// Retries camera operations according to a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    policy: RetryPolicy,
}

impl Dispatcher {
    /// Create a dispatcher with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `op` until it succeeds or the policy is exhausted.
    ///
    /// # Errors
    /// - [`DaqError::InvalidOperation`] immediately, without calling the device, for
    ///   operations that can never succeed.
    /// - [`DaqError::Hardware`] after the final failed attempt.
    pub async fn invoke<S>(&self, sdk: &mut S, op: &HardwareOperation) -> AppResult<OpValue>
    where
        S: CameraSdk + ?Sized,
    {
        op.validate()?;

        let mut attempts = self.policy.attempts();
        loop {
            let status = match sdk.execute(op).await {
                Ok(value) => {
                    debug!(%op, attempt = attempts.current(), "ok");
                    return Ok(value);
                }
                Err(code) => VendorStatus::classify(code),
            };

            if !attempts.backoff(op, status).await {
                error!(%op, attempts = attempts.current(), %status, "giving up");
                return Err(DaqError::Hardware {
                    operation: op.to_string(),
                    attempts: attempts.current(),
                    status,
                });
            }
        }
    }

    // =========================================================================
    // Typed wrappers
    // =========================================================================

    /// Set a boolean feature.
    pub async fn set_bool<S>(&self, sdk: &mut S, feature: &'static str, value: bool) -> AppResult<()>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::SetBool { feature, value })
            .await
            .map(drop)
    }

    /// Set an enumerated feature by string.
    pub async fn set_enum<S>(&self, sdk: &mut S, feature: &'static str, value: &str) -> AppResult<()>
    where
        S: CameraSdk + ?Sized,
    {
        let op = HardwareOperation::SetEnumString {
            feature,
            value: value.to_string(),
        };
        self.invoke(sdk, &op).await.map(drop)
    }

    /// Set a floating point feature.
    pub async fn set_float<S>(&self, sdk: &mut S, feature: &'static str, value: f64) -> AppResult<()>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::SetFloat { feature, value })
            .await
            .map(drop)
    }

    /// Run a command feature.
    pub async fn command<S>(&self, sdk: &mut S, feature: &'static str) -> AppResult<()>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::Command(feature))
            .await
            .map(drop)
    }

    /// Read a boolean feature.
    pub async fn get_bool<S>(&self, sdk: &mut S, feature: &'static str) -> AppResult<bool>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::GetBool(feature))
            .await?
            .into_bool()
    }

    /// Read a floating point feature.
    pub async fn get_float<S>(&self, sdk: &mut S, feature: &'static str) -> AppResult<f64>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::GetFloat(feature))
            .await?
            .into_float()
    }

    /// Read an integer feature.
    pub async fn get_int<S>(&self, sdk: &mut S, feature: &'static str) -> AppResult<i64>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::GetInt(feature))
            .await?
            .into_int()
    }

    /// Read a string feature.
    pub async fn get_string<S>(&self, sdk: &mut S, feature: &'static str) -> AppResult<String>
    where
        S: CameraSdk + ?Sized,
    {
        self.invoke(sdk, &HardwareOperation::GetString(feature))
            .await?
            .into_text()
    }

    /// Read the current string value of an enumerated feature.
    pub async fn get_enum_string<S>(&self, sdk: &mut S, feature: &'static str) -> AppResult<String>
    where
        S: CameraSdk + ?Sized,
    {
        let index = self
            .invoke(sdk, &HardwareOperation::GetEnumIndex(feature))
            .await?
            .into_index()?;
        self.invoke(sdk, &HardwareOperation::GetEnumStringByIndex { feature, index })
            .await?
            .into_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::andor::feature;
    use crate::hardware::mock::MockCameraSdk;
    use std::time::Duration;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_sleeps() {
        for k in 0..3u32 {
            let mut sdk = MockCameraSdk::default();
            sdk.fail_next(k as usize, 13);
            let start = Instant::now();

            let value = dispatcher()
                .invoke(&mut sdk, &HardwareOperation::GetFloat(feature::EXPOSURE_TIME))
                .await
                .unwrap();

            assert!(matches!(value, OpValue::Float(_)));
            assert_eq!(sdk.calls_to(feature::EXPOSURE_TIME), k as usize + 1);
            assert_eq!(start.elapsed(), Duration::from_secs(u64::from(k)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_exactly_n_attempts() {
        let mut sdk = MockCameraSdk::default();
        sdk.fail_next(usize::MAX, 1005);
        let start = Instant::now();

        let err = dispatcher()
            .invoke(&mut sdk, &HardwareOperation::Command(feature::SOFTWARE_TRIGGER))
            .await
            .unwrap_err();

        match err {
            DaqError::Hardware {
                attempts, status, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status.name(), "AT_ERR_CORRUPTEDMETADATA");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(sdk.calls_to(feature::SOFTWARE_TRIGGER), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_feature_is_rejected_without_a_call() {
        let mut sdk = MockCameraSdk::default();
        let err = dispatcher()
            .invoke(&mut sdk, &HardwareOperation::GetFloat(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidOperation(_)));
        assert_eq!(sdk.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_wrappers_convert_results() {
        let mut sdk = MockCameraSdk::default();
        let d = dispatcher();
        d.invoke(&mut sdk, &HardwareOperation::Open { index: 0 })
            .await
            .unwrap();
        d.set_float(&mut sdk, feature::EXPOSURE_TIME, 0.2).await.unwrap();
        assert_eq!(d.get_float(&mut sdk, feature::EXPOSURE_TIME).await.unwrap(), 0.2);
        assert_eq!(d.get_int(&mut sdk, feature::SENSOR_WIDTH).await.unwrap(), 64);
        assert_eq!(
            d.get_string(&mut sdk, feature::SERIAL_NUMBER).await.unwrap(),
            "VSC-04181"
        );
        assert!(!d.get_bool(&mut sdk, feature::CAMERA_ACQUIRING).await.unwrap());

        // a float feature read as an integer is a programmer error
        let err = d
            .invoke(&mut sdk, &HardwareOperation::GetFloat(feature::READOUT_TIME))
            .await
            .unwrap()
            .into_int()
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidOperation(_)));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn every_failed_attempt_is_logged() {
        let mut sdk = MockCameraSdk::default();
        sdk.fail_next(2, 9999);
        dispatcher()
            .invoke(&mut sdk, &HardwareOperation::Flush)
            .await
            .unwrap();
        assert!(logs_contain("attempt=1"));
        assert!(logs_contain("attempt=2"));
        assert!(logs_contain("ERR_UNKNOWN"));
    }
}
