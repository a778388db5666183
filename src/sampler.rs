//! Visual stability sampling
//!
//! Animated creatives settle at different times and some pause on purpose
//! mid-animation. [`settle`] keeps sampling a region for the whole observation
//! budget once it has seen the picture change, and hands back the last frame
//! that was stable for at least `min_stable`. A region that never changes is
//! returned as soon as one stability window has been observed.

use crate::{fingerprint, hamming_distance, CaptureError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SettleParams {
    /// Total sampling budget
    pub max_wait: Duration,
    /// How long the picture must stay put before a frame becomes a candidate
    pub min_stable: Duration,
    pub poll_interval: Duration,
    /// Fingerprint bits that may differ between "identical" frames
    pub near_threshold: u32,
    /// Minimum elapsed time before an unchanged picture is accepted
    pub min_observe: Duration,
}

impl Default for SettleParams {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(12_000),
            min_stable: Duration::from_millis(1_200),
            poll_interval: Duration::from_millis(180),
            near_threshold: 3,
            min_observe: Duration::from_millis(600),
        }
    }
}

struct Frame {
    bytes: Vec<u8>,
    fingerprint: Option<String>,
    taken_at: Instant,
}

impl Frame {
    fn new(bytes: Vec<u8>) -> Self {
        let fingerprint = fingerprint(&bytes).ok();
        Self {
            bytes,
            fingerprint,
            taken_at: Instant::now(),
        }
    }

    fn near(&self, other: &Frame, threshold: u32) -> bool {
        if self.bytes == other.bytes {
            return true;
        }
        match (&self.fingerprint, &other.fingerprint) {
            (Some(a), Some(b)) => hamming_distance(a, b) <= threshold,
            _ => false,
        }
    }
}

/// Sample with `take` until the picture is judged stable, returning the chosen
/// frame's bytes.
///
/// Only a failure of the very first sample is returned as an error. Later
/// failures end sampling early and yield the most recent good frame.
pub async fn settle<F, Fut>(mut take: F, params: &SettleParams) -> Result<Vec<u8>, CaptureError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, CaptureError>>,
{
    let start = Instant::now();
    let mut anchor = Frame::new(take().await?);
    let mut latest: Option<Vec<u8>> = None;
    let mut window_start: Option<Instant> = None;
    let mut best: Option<Vec<u8>> = None;
    let mut changed = false;
    let mut samples = 1usize;

    while start.elapsed() < params.max_wait {
        sleep(params.poll_interval).await;

        let current = match take().await {
            Ok(bytes) => Frame::new(bytes),
            Err(e) => {
                debug!(error = %e, samples, "sample failed, keeping last good frame");
                break;
            }
        };
        samples += 1;

        if current.near(&anchor, params.near_threshold) {
            let since = *window_start.get_or_insert(anchor.taken_at);
            let stable_for = current.taken_at.duration_since(since);

            if stable_for >= params.min_stable && (changed || start.elapsed() >= params.min_observe) {
                if !changed {
                    debug!(samples, elapsed_ms = start.elapsed().as_millis() as u64, "settled without motion");
                    return Ok(current.bytes);
                }
                best = Some(current.bytes.clone());
            }
            latest = Some(current.bytes);
        } else {
            window_start = None;
            changed = true;
            latest = None;
            anchor = current;
        }
    }

    debug!(
        samples,
        changed,
        stable = best.is_some(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "sampling finished"
    );

    Ok(best.or(latest).unwrap_or(anchor.bytes))
}
