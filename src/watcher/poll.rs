use log::warn;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{TransitionSink, WatchSource};
use crate::error::GpioError;

/// Takes the baseline reading up front so that a failing pin refuses to
/// start, then hands back the polling loop to spawn.
pub(super) fn prepare(
    source: &WatchSource,
    sink: TransitionSink,
    cancel: CancellationToken,
) -> Result<impl Future<Output = ()> + Send + 'static, GpioError> {
    let baseline = source.baseline()?;

    Ok(run(
        source.clone(),
        source.options.poll_interval,
        baseline,
        sink,
        cancel,
    ))
}

async fn run(
    source: WatchSource,
    interval: Duration,
    mut last: bool,
    sink: TransitionSink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = source.nudge.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        match source.sample() {
            Ok(reading) if reading.value != last => {
                last = reading.value;
                sink(reading.value);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("polling line {} stopped: {e}", source.line);
                return;
            }
        }
    }
}
