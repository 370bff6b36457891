use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sysgpio::config::{Direction, PinOptions, WatchMode, WritePolicy};
use sysgpio::{
    DummyGpioBackend, GpioBackend, GpioError, GpioPin, PinLifecycle, SysfsGpioBackend, WatchStrategy,
};

const SHORT: Option<Duration> = Some(Duration::from_millis(50));

fn dummy_pin(line: u32, options: PinOptions) -> (Arc<DummyGpioBackend>, Arc<GpioPin>) {
    let dummy = Arc::new(DummyGpioBackend::default());
    let pin = Arc::new(GpioPin::new(line, "test pin", options, dummy.clone()));
    (dummy, pin)
}

fn fake_sysfs_pin(root: &Path, line: u32, direction: &str) -> PathBuf {
    let dir = root.join(format!("gpio{line}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("direction"), direction).unwrap();
    fs::write(dir.join("value"), "0").unwrap();
    fs::write(dir.join("active_low"), "0").unwrap();
    dir
}

/// Plays the kernel's part: creates or removes `gpio<N>` after a write to the
/// export or unexport control file.
async fn fake_kernel(root: PathBuf, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        for control in ["export", "unexport"] {
            let path = root.join(control);
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(line) = text.trim().parse::<u32>() else {
                continue;
            };
            fs::remove_file(&path).unwrap();
            if control == "export" {
                fake_sysfs_pin(&root, line, "in");
            } else {
                fs::remove_dir_all(root.join(format!("gpio{line}"))).unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn subscriptions_before_open_each_see_the_flip_once() {
    let (_dummy, pin) = dummy_pin(7, PinOptions::default());
    pin.set_direction(Direction::Output).unwrap();
    pin.set_value(false).unwrap();

    let a = pin.subscribe().await.unwrap();
    let b = pin.subscribe().await.unwrap();
    assert!(pin.is_watching());

    pin.open().await.unwrap();
    pin.set_value(true).unwrap();

    let cancel = CancellationToken::new();
    for sub in [&a, &b] {
        assert_eq!(sub.next(SHORT, &cancel).await.unwrap(), Some(true));
        assert_eq!(sub.next(SHORT, &cancel).await.unwrap(), None);
    }

    a.release().await;
    b.release().await;
    assert!(!pin.is_watching());
}

#[tokio::test(start_paused = true)]
async fn glitch_delays_steady_state() {
    let options = PinOptions {
        debounce: Duration::from_millis(10),
        ..PinOptions::default()
    };
    let (dummy, pin) = dummy_pin(3, options);
    pin.open().await.unwrap();
    let start = Instant::now();

    let waiter = {
        let pin = pin.clone();
        tokio::spawn(async move {
            pin.wait_for_value(true, None, &CancellationToken::new())
                .await
                .map(|()| Instant::now())
        })
    };
    while pin.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    dummy.inject(3, true).unwrap();
    tokio::time::sleep(Duration::from_millis(3)).await;
    dummy.inject(3, false).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    dummy.inject(3, true).unwrap();

    let elapsed = waiter.await.unwrap().unwrap() - start;
    assert!(elapsed >= Duration::from_millis(14), "settled early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(16), "settled late: {elapsed:?}");
    assert_eq!(pin.subscriber_count(), 0);
}

#[tokio::test]
async fn export_then_unexport_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let kernel = CancellationToken::new();
    let kernel_task = tokio::spawn(fake_kernel(root.clone(), kernel.clone()));

    let options = PinOptions {
        export: true,
        unexport: true,
        settle_delay: Duration::from_millis(100),
        ..PinOptions::default()
    };
    let backend = Arc::new(SysfsGpioBackend::new(&root));
    let pin = GpioPin::new(17, "relay", options, backend.clone());

    assert!(!backend.is_exported(17));
    pin.open().await.unwrap();
    assert!(backend.is_exported(17));
    assert_eq!(pin.lifecycle(), PinLifecycle::Opened);

    pin.dispose().await;
    assert!(!backend.is_exported(17));
    assert_eq!(pin.lifecycle(), PinLifecycle::Disposed);

    kernel.cancel();
    kernel_task.await.unwrap();
}

#[tokio::test]
async fn missing_pin_without_export_does_not_open() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Arc::new(SysfsGpioBackend::new(tmp.path()));
    let pin = GpioPin::new(30, "absent", PinOptions::default(), backend);

    assert!(matches!(pin.open().await, Err(GpioError::Export(_))));
    assert_eq!(pin.lifecycle(), PinLifecycle::Unopened);
}

#[tokio::test]
async fn write_policy_decides_whether_failed_writes_surface() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = fake_sysfs_pin(tmp.path(), 6, "in");
    // a directory where the attribute file should be makes every write fail
    fs::remove_file(dir.join("active_low")).unwrap();
    fs::create_dir(dir.join("active_low")).unwrap();
    let backend = Arc::new(SysfsGpioBackend::new(tmp.path()));

    let strict = GpioPin::new(
        6,
        "strict",
        PinOptions {
            write_policy: WritePolicy::Strict,
            watch: WatchMode::Poll,
            ..PinOptions::default()
        },
        backend.clone(),
    );
    strict.open().await.unwrap();
    assert!(matches!(strict.set_active_low(true), Err(GpioError::Io(_))));

    let tolerant = GpioPin::new(
        6,
        "tolerant",
        PinOptions {
            write_policy: WritePolicy::BestEffort,
            watch: WatchMode::Poll,
            ..PinOptions::default()
        },
        backend,
    );
    tolerant.set_active_low(true).unwrap();
    tolerant.open().await.unwrap();
    tolerant.set_active_low(false).unwrap();

    // structural errors are never swallowed
    assert!(matches!(
        tolerant.set_value(true),
        Err(GpioError::InvalidDirection(_))
    ));
}

#[tokio::test]
async fn open_is_one_way() {
    let (_dummy, pin) = dummy_pin(1, PinOptions::default());
    pin.open().await.unwrap();
    assert!(matches!(pin.open().await, Err(GpioError::AlreadyOpen(_))));
    assert_eq!(pin.to_string(), "[1] test pin");
}

#[tokio::test]
async fn disposed_pin_rejects_everything() {
    let (_dummy, pin) = dummy_pin(2, PinOptions::default());
    pin.open().await.unwrap();
    let live = pin.subscribe().await.unwrap();

    pin.dispose().await;
    assert!(matches!(
        live.next(SHORT, &CancellationToken::new()).await,
        Err(GpioError::Disposed(_))
    ));
    assert!(matches!(pin.value(), Err(GpioError::Disposed(_))));
    assert!(matches!(pin.set_active_low(true), Err(GpioError::Disposed(_))));
    assert!(matches!(pin.subscribe().await, Err(GpioError::Disposed(_))));
    assert!(matches!(pin.open().await, Err(GpioError::Disposed(_))));
    assert!(!pin.is_watching());
    pin.dispose().await;
}

#[tokio::test]
async fn cached_polarity_and_level_apply_on_open() {
    let (dummy, pin) = dummy_pin(9, PinOptions::default());
    pin.set_active_low(true).unwrap();
    pin.set_value(true).unwrap();
    pin.set_direction(Direction::Output).unwrap();
    assert!(!dummy.raw_level(9).unwrap());

    pin.open().await.unwrap();
    assert!(pin.value().unwrap());
    assert!(!dummy.raw_level(9).unwrap());

    // flipping polarity moves the logical value without touching the wire
    let sub = pin.subscribe().await.unwrap();
    pin.set_active_low(false).unwrap();
    assert_eq!(
        sub.next(SHORT, &CancellationToken::new()).await.unwrap(),
        Some(false)
    );
    sub.release().await;
}

#[tokio::test]
async fn handlers_are_isolated_and_removable() {
    let (dummy, pin) = dummy_pin(5, PinOptions::default());
    let seen = Arc::new(AtomicUsize::new(0));

    pin.on_value_changed(|_| panic!("faulty handler"));
    let counter = {
        let seen = seen.clone();
        pin.on_value_changed(move |change| {
            assert_eq!(change.line, 5);
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };
    pin.set_raise_events(true).await.unwrap();
    pin.open().await.unwrap();

    dummy.inject(5, true).unwrap();
    dummy.inject(5, false).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert!(pin.remove_handler(counter));
    assert!(!pin.remove_handler(counter));
    dummy.inject(5, true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    pin.set_raise_events(false).await.unwrap();
    assert_eq!(pin.subscriber_count(), 0);
}

#[tokio::test]
async fn cancelled_pulse_still_deasserts() {
    let (dummy, pin) = dummy_pin(8, PinOptions::default());
    pin.set_direction(Direction::Output).unwrap();
    pin.open().await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = pin
        .pulse_for(Duration::from_secs(10), Duration::from_secs(10), &cancel)
        .await;
    assert!(matches!(res, Err(GpioError::Cancelled)));
    assert!(!dummy.raw_level(8).unwrap());

    pin.pulse().await.unwrap();
    assert!(!pin.value().unwrap());
}

#[tokio::test]
async fn wait_for_change_times_out() {
    let (_dummy, pin) = dummy_pin(4, PinOptions::default());
    pin.open().await.unwrap();

    let res = pin
        .wait_for_change(Some(Duration::from_millis(20)), &CancellationToken::new())
        .await;
    assert!(matches!(res, Err(GpioError::Timeout(_))));
    assert_eq!(pin.subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_waits_from_a_plain_thread() {
    let (_dummy, pin) = dummy_pin(11, PinOptions::default());
    pin.set_direction(Direction::Output).unwrap();
    pin.set_value(false).unwrap();
    pin.open().await.unwrap();

    let waiter = {
        let pin = pin.clone();
        tokio::task::spawn_blocking(move || pin.blocking_wait_for_change(Some(Duration::from_secs(5))))
    };
    while pin.subscriber_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    pin.set_value(true).unwrap();
    assert!(waiter.await.unwrap().unwrap());

    let steady = {
        let pin = pin.clone();
        tokio::task::spawn_blocking(move || pin.blocking_wait_for_value(true, Some(Duration::from_secs(5))))
    };
    steady.await.unwrap().unwrap();
}

fn exporting_sysfs_pin(root: &Path, line: u32, settle: Duration) -> GpioPin {
    let options = PinOptions {
        export: true,
        watch: WatchMode::Poll,
        settle_delay: settle,
        ..PinOptions::default()
    };
    GpioPin::new(line, "sysfs pin", options, Arc::new(SysfsGpioBackend::new(root)))
}

#[tokio::test]
async fn unexported_sysfs_pin_can_be_watched_before_open() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let kernel = CancellationToken::new();
    let kernel_task = tokio::spawn(fake_kernel(root.clone(), kernel.clone()));

    let pin = exporting_sysfs_pin(&root, 21, Duration::from_millis(100));
    let sub = pin.subscribe().await.unwrap();
    assert_eq!(pin.watch_strategy(), Some(WatchStrategy::Poll));

    pin.open().await.unwrap();
    let dir = root.join("gpio21");
    fs::write(dir.join("value.tmp"), "1").unwrap();
    fs::rename(dir.join("value.tmp"), dir.join("value")).unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(
        sub.next(Some(Duration::from_secs(2)), &cancel).await.unwrap(),
        Some(true)
    );
    sub.release().await;

    kernel.cancel();
    kernel_task.await.unwrap();
}

#[tokio::test]
async fn cached_value_satisfies_a_wait_on_an_unopened_pin() {
    let (_dummy, pin) = dummy_pin(13, PinOptions::default());

    let waiter = {
        let pin = pin.clone();
        tokio::spawn(async move {
            pin.wait_for_value(true, Some(Duration::from_secs(2)), &CancellationToken::new())
                .await
        })
    };
    while pin.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    pin.set_value(true).unwrap();
    waiter.await.unwrap().unwrap();
    assert_eq!(pin.lifecycle(), PinLifecycle::Unopened);
}

#[tokio::test]
async fn settings_cached_while_opening_reach_the_line() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let kernel = CancellationToken::new();
    let kernel_task = tokio::spawn(fake_kernel(root.clone(), kernel.clone()));

    let pin = Arc::new(exporting_sysfs_pin(&root, 22, Duration::from_millis(150)));
    let opening = {
        let pin = pin.clone();
        tokio::spawn(async move { pin.open().await })
    };
    while pin.lifecycle() != PinLifecycle::Opening {
        tokio::task::yield_now().await;
    }

    pin.set_direction(Direction::Output).unwrap();
    pin.set_value(true).unwrap();
    opening.await.unwrap().unwrap();

    let direction = fs::read_to_string(root.join("gpio22/direction")).unwrap();
    assert_eq!(direction, "high");
    assert_eq!(pin.lifecycle(), PinLifecycle::Opened);

    kernel.cancel();
    kernel_task.await.unwrap();
}
